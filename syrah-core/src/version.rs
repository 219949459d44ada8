//! Build/version metadata, exposed over the admin surface and logged at
//! startup.
//!
//! The teacher's `core::version` shells out to a repo-wide
//! `report_build_info.sh` script to pick up git SHA and build host info.
//! That script doesn't exist here, so this sticks to what `build.rs` can
//! learn on its own: the crate version Cargo already knows, plus the rustc
//! version used to compile it.

use std::fmt;

#[derive(Debug, Clone, serde::Serialize)]
pub struct BuildInfo {
	pub version: &'static str,
	pub rustc_version: &'static str,
	pub profile: &'static str,
}

impl BuildInfo {
	pub fn current() -> &'static BuildInfo {
		static INFO: BuildInfo = BuildInfo {
			version: env!("CARGO_PKG_VERSION"),
			rustc_version: env!("SYRAH_BUILD_RUSTC_VERSION"),
			profile: if cfg!(debug_assertions) {
				"debug"
			} else {
				"release"
			},
		};
		&INFO
	}
}

impl fmt::Display for BuildInfo {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"syrah {} ({}, rustc {})",
			self.version, self.profile, self.rustc_version
		)
	}
}
