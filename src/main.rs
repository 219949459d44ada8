//! Process entry point: parses CLI args, loads config, brings up the root
//! CA, rule engine, flow registry, bridge, admin, and connection manager,
//! then waits for a shutdown signal and drains everything in order.
//! Grounded on the teacher's `agentgateway-app::main`/`agentgateway::app::run`
//! shape (CLI via `clap`, `tokio::runtime::Builder::new_current_thread`,
//! `signal::Shutdown` + `drain::new()`, spawn-then-wait), trimmed of its
//! XDS/mTLS bootstrap since this proxy has no control plane to connect to.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use clap::Parser;
use prometheus_client::registry::Registry;
use syrah::bridge::Bridge;
use syrah::ca::CaMaterial;
use syrah::config::Config;
use syrah::error::Fatal;
use syrah::flow::FlowRegistry;
use syrah::leaf::LeafCache;
use syrah::metrics::Metrics;
use syrah::proxy::ConnectionManager;
use syrah::rules::{ProxyRule, RuleEngine};
use syrah_core::drain;
use syrah_core::signal::Shutdown;
use syrah_core::version::BuildInfo;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(about = "Syrah: an interactive man-in-the-middle HTTP(S) proxy engine", long_about = None)]
#[command(disable_version_flag = true)]
struct Args {
	/// Path to a YAML config file. Every field also has a `SYRAH_*` env var override.
	#[arg(short, long, value_name = "FILE")]
	config: Option<PathBuf>,

	/// Print version and exit.
	#[arg(short = 'V', long = "version")]
	version: bool,
}

fn load_rules(path: Option<&std::path::Path>) -> anyhow::Result<Vec<ProxyRule>> {
	let Some(path) = path else {
		return Ok(Vec::new());
	};
	let contents = std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("reading rules file {}: {e}", path.display()))?;
	let rules: Vec<ProxyRule> = serde_json::from_str(&contents)?;
	Ok(rules)
}

fn main() -> ExitCode {
	tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
		.init();

	let args = Args::parse();
	if args.version {
		println!("{}", BuildInfo::current());
		return ExitCode::SUCCESS;
	}

	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
		.expect("failed to build tokio runtime")
		.block_on(run(args))
}

async fn run(args: Args) -> ExitCode {
	let config = match Config::load(args.config.as_deref()) {
		Ok(c) => Arc::new(c),
		Err(e) => {
			error!(error = %e, "failed to load configuration");
			return ExitCode::from(1);
		},
	};
	info!(version = %BuildInfo::current(), listen = %config.listen_addr, bridge = %config.bridge_addr, "starting syrah");

	let ca = match CaMaterial::load_or_create(&config.ca_dir) {
		Ok(ca) => Arc::new(ca),
		Err(e) => {
			error!(error = %e, dir = %config.ca_dir.display(), "root CA unavailable");
			return Fatal::from(e).exit_code();
		},
	};
	if let Err(e) = ca.write_artifacts(&config.ca_dir) {
		warn!(error = %e, "failed to write .cer/.p12 CA artifacts (continuing with .pem)");
	}

	let rules = match load_rules(config.rules_path.as_deref()) {
		Ok(r) => r,
		Err(e) => {
			error!(error = %e, "failed to load rules file");
			return ExitCode::from(1);
		},
	};

	let leaves = Arc::new(LeafCache::new(ca.clone(), config.leaf_cache_capacity, config.leaf_validity));
	let rule_engine = Arc::new(RuleEngine::new(rules));
	let flows = Arc::new(FlowRegistry::new());
	let bridge = Bridge::new(flows.clone(), rule_engine.clone());

	let mut registry = Registry::default();
	let metrics = Arc::new(Metrics::new(&mut registry));
	let registry = Arc::new(Mutex::new(registry));

	let manager = ConnectionManager::new(
		ca.clone(),
		leaves.clone(),
		rule_engine.clone(),
		flows.clone(),
		bridge.clone(),
		metrics.clone(),
		config.clone(),
	);

	let shutdown = Shutdown::new();
	let (drain_trigger, drain_watcher) = drain::new();

	let bridge_task = {
		let bridge = bridge.clone();
		let addr = config.bridge_addr;
		let drain = drain_watcher.clone();
		tokio::spawn(async move {
			if let Err(e) = bridge.run(addr, drain).await {
				error!(%addr, error = %e, "bridge listener exited with an error");
			}
		})
	};

	let admin_task = config.admin_addr.map(|addr| {
		let config = config.clone();
		let flows = flows.clone();
		let registry = registry.clone();
		let drain = drain_watcher.clone();
		tokio::spawn(async move {
			if let Err(e) = syrah::admin::run(addr, config, flows, registry, drain).await {
				error!(%addr, error = %e, "admin listener exited with an error");
			}
		})
	});

	let proxy_task = {
		let manager = manager.clone();
		let drain = drain_watcher.clone();
		tokio::spawn(async move { manager.run(drain).await })
	};

	// Give the listener a moment to either bind or fail before declaring
	// startup successful; a bind failure is fatal per §6 (exit code 2).
	tokio::select! {
		result = proxy_task => {
			match result {
				Ok(Ok(())) => {},
				Ok(Err(e)) => {
					error!(error = %e, "proxy listener failed to bind");
					bridge.kill_all_waiters("proxy failed to start");
					return Fatal::Bind(e).exit_code();
				},
				Err(e) => {
					error!(error = %e, "proxy task panicked");
					return ExitCode::from(1);
				},
			}
		}
		_ = shutdown.wait() => {
			info!("shutdown requested");
		}
	}

	info!("draining: waiting for in-flight connections to finish");
	bridge.kill_all_waiters("proxy shutting down");
	drain_trigger.start_drain_and_wait(syrah_core::drain::DrainMode::Graceful).await;

	// Anything still open after the drain wait (a flow whose connection task
	// was cut rather than finishing normally) is force-terminated here so no
	// flow is left dangling on the bridge's last-known state (§5 Cancellation).
	flows.abort_all("proxy shutting down");
	for flow in flows.all() {
		let f = flow.read().unwrap();
		bridge.emit_flow(&f, f.request.is_secure);
	}

	bridge_task.abort();
	if let Some(t) = admin_task {
		t.abort();
	}

	info!("shutdown complete");
	ExitCode::SUCCESS
}
