//! Runtime configuration: environment-variable overrides layered on an
//! optional YAML file, scoped to the fields this proxy actually has. Grounded
//! on the teacher's `config::parse_config` `parse::<T>("ENV_VAR")?.or(raw.field)`
//! idiom (`crates/agentgateway/src/config.rs`), trimmed down from its
//! xDS/mTLS-bootstrap concerns to listen/bridge addresses, the CA directory,
//! the interception toggle, throttling, and timeouts (§6 External
//! Interfaces, §5 Timeouts).

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_listen() -> SocketAddr {
	"0.0.0.0:8888".parse().unwrap()
}

fn default_bridge() -> SocketAddr {
	"0.0.0.0:9999".parse().unwrap()
}

fn default_ca_dir() -> PathBuf {
	dirs_home_join(".syrah")
}

fn dirs_home_join(sub: &str) -> PathBuf {
	let home = env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
	home.join(sub)
}

/// Raw, all-optional shape of the YAML config file. Every field has an
/// environment-variable override applied on top (§ambient Config).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawConfig {
	pub listen_addr: Option<String>,
	pub bridge_addr: Option<String>,
	pub ca_dir: Option<PathBuf>,
	pub intercept_tls: Option<bool>,
	pub rules_path: Option<PathBuf>,
	pub leaf_cache_capacity: Option<usize>,
	pub leaf_validity_days: Option<i64>,
	pub connect_timeout_secs: Option<u64>,
	pub handshake_timeout_secs: Option<u64>,
	pub idle_keepalive_secs: Option<u64>,
	pub upload_bytes_per_sec: Option<u64>,
	pub download_bytes_per_sec: Option<u64>,
	pub latency_ms: Option<u64>,
	pub packet_loss_percent: Option<f64>,
	pub admin_addr: Option<String>,
}

/// Fully-resolved configuration used by the binary. Constructed by
/// [`Config::load`].
#[derive(Debug, Clone)]
pub struct Config {
	pub listen_addr: SocketAddr,
	pub bridge_addr: SocketAddr,
	pub ca_dir: PathBuf,
	pub intercept_tls: bool,
	pub rules_path: Option<PathBuf>,
	pub leaf_cache_capacity: usize,
	pub leaf_validity: Duration,
	pub connect_timeout: Duration,
	pub handshake_timeout: Duration,
	pub idle_keepalive: Duration,
	pub throttle: ThrottleConfig,
	pub admin_addr: Option<SocketAddr>,
}

#[derive(Debug, Clone, Default)]
pub struct ThrottleConfig {
	pub upload_bytes_per_sec: Option<u64>,
	pub download_bytes_per_sec: Option<u64>,
	pub latency: Option<Duration>,
	pub packet_loss_percent: Option<f64>,
}

impl ThrottleConfig {
	pub fn is_active(&self) -> bool {
		self.upload_bytes_per_sec.is_some()
			|| self.download_bytes_per_sec.is_some()
			|| self.latency.is_some()
			|| self.packet_loss_percent.is_some()
	}
}

/// Parses an environment variable into `T`, returning `Ok(None)` when unset
/// and an error when set-but-unparseable. Mirrors the teacher's `parse`
/// helper in `config.rs`.
fn parse<T: FromStr>(env: &str) -> anyhow::Result<Option<T>>
where
	<T as FromStr>::Err: std::fmt::Display,
{
	match env::var(env) {
		Ok(val) => val
			.parse()
			.map(Some)
			.map_err(|e: <T as FromStr>::Err| anyhow::anyhow!("invalid env var {env}={val} ({e})")),
		Err(_) => Ok(None),
	}
}

impl Config {
	/// Loads config from an optional YAML file at `path`, then layers
	/// `SYRAH_*` environment variable overrides on top, then applies
	/// defaults for anything still unset.
	pub fn load(path: Option<&std::path::Path>) -> anyhow::Result<Config> {
		let raw: RawConfig = match path {
			Some(p) => {
				let contents = std::fs::read_to_string(p)
					.map_err(|e| anyhow::anyhow!("reading config file {}: {e}", p.display()))?;
				serde_yaml::from_str(&contents)?
			},
			None => RawConfig::default(),
		};

		let listen_addr = match parse::<String>("SYRAH_LISTEN_ADDR")?.or(raw.listen_addr) {
			Some(s) => s.parse()?,
			None => default_listen(),
		};
		let bridge_addr = match parse::<String>("SYRAH_BRIDGE_ADDR")?.or(raw.bridge_addr) {
			Some(s) => s.parse()?,
			None => default_bridge(),
		};
		let ca_dir = parse::<PathBuf>("SYRAH_CA_DIR")?.or(raw.ca_dir).unwrap_or_else(default_ca_dir);
		let intercept_tls = parse::<bool>("SYRAH_INTERCEPT_TLS")?.or(raw.intercept_tls).unwrap_or(true);
		let rules_path = parse::<PathBuf>("SYRAH_RULES_PATH")?.or(raw.rules_path);
		let leaf_cache_capacity =
			parse::<usize>("SYRAH_LEAF_CACHE_CAPACITY")?.or(raw.leaf_cache_capacity).unwrap_or(500);
		let leaf_validity_days =
			parse::<i64>("SYRAH_LEAF_VALIDITY_DAYS")?.or(raw.leaf_validity_days).unwrap_or(365);
		let connect_timeout_secs =
			parse::<u64>("SYRAH_CONNECT_TIMEOUT_SECS")?.or(raw.connect_timeout_secs).unwrap_or(10);
		let handshake_timeout_secs =
			parse::<u64>("SYRAH_HANDSHAKE_TIMEOUT_SECS")?.or(raw.handshake_timeout_secs).unwrap_or(10);
		let idle_keepalive_secs =
			parse::<u64>("SYRAH_IDLE_KEEPALIVE_SECS")?.or(raw.idle_keepalive_secs).unwrap_or(60);

		let upload_bytes_per_sec = parse::<u64>("SYRAH_THROTTLE_UPLOAD_BPS")?.or(raw.upload_bytes_per_sec);
		let download_bytes_per_sec = parse::<u64>("SYRAH_THROTTLE_DOWNLOAD_BPS")?.or(raw.download_bytes_per_sec);
		let latency_ms = parse::<u64>("SYRAH_THROTTLE_LATENCY_MS")?.or(raw.latency_ms);
		let packet_loss_percent = parse::<f64>("SYRAH_THROTTLE_PACKET_LOSS")?.or(raw.packet_loss_percent);

		let admin_addr = match parse::<String>("SYRAH_ADMIN_ADDR")?.or(raw.admin_addr) {
			Some(s) => Some(s.parse()?),
			None => None,
		};

		Ok(Config {
			listen_addr,
			bridge_addr,
			ca_dir,
			intercept_tls,
			rules_path,
			leaf_cache_capacity,
			leaf_validity: Duration::from_secs(leaf_validity_days.max(1) as u64 * 86_400),
			connect_timeout: Duration::from_secs(connect_timeout_secs),
			handshake_timeout: Duration::from_secs(handshake_timeout_secs),
			idle_keepalive: Duration::from_secs(idle_keepalive_secs),
			throttle: ThrottleConfig {
				upload_bytes_per_sec,
				download_bytes_per_sec,
				latency: latency_ms.map(Duration::from_millis),
				packet_loss_percent,
			},
			admin_addr,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_when_nothing_is_set() {
		// SAFETY: test runs single-threaded with respect to this env var set and has
		// no other test in this module mutating the same key.
		for key in [
			"SYRAH_LISTEN_ADDR",
			"SYRAH_BRIDGE_ADDR",
			"SYRAH_CA_DIR",
			"SYRAH_INTERCEPT_TLS",
		] {
			unsafe { env::remove_var(key) };
		}
		let cfg = Config::load(None).unwrap();
		assert_eq!(cfg.listen_addr, default_listen());
		assert_eq!(cfg.bridge_addr, default_bridge());
		assert!(cfg.intercept_tls);
	}

	#[test]
	fn env_var_overrides_default() {
		unsafe { env::set_var("SYRAH_LISTEN_ADDR", "127.0.0.1:9001") };
		let cfg = Config::load(None).unwrap();
		assert_eq!(cfg.listen_addr, "127.0.0.1:9001".parse::<SocketAddr>().unwrap());
		unsafe { env::remove_var("SYRAH_LISTEN_ADDR") };
	}
}
