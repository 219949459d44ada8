//! Top-level error taxonomy (§7). Each subsystem owns a `thiserror`-derived
//! enum; this module only composes them for the binary boundary, where
//! everything collapses into `anyhow::Error` with an exit code per §6.

use std::process::ExitCode;

#[derive(thiserror::Error, Debug)]
pub enum Fatal {
	#[error("failed to bind listener: {0}")]
	Bind(#[source] std::io::Error),
	#[error("root CA unavailable: {0}")]
	Ca(#[from] crate::ca::CaError),
}

impl Fatal {
	/// Exit codes per spec.md §6: 0 clean, 1 generic, 2 bind-failed, 3 ca-failed.
	pub fn exit_code(&self) -> ExitCode {
		match self {
			Fatal::Bind(_) => ExitCode::from(2),
			Fatal::Ca(_) => ExitCode::from(3),
		}
	}
}
