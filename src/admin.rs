//! Ambient admin HTTP surface: `GET /healthz` and `GET /config_dump`.
//! Grounded on the teacher's `management::hyper_helpers::Server` (bind,
//! spawn-per-connection, drain-aware `serve_connection`) and
//! `management::admin::handle_config_dump`, trimmed to the two endpoints
//! this proxy's ambient stack actually needs — no pprof, no live log-level
//! control, no dashboard (§Non-goals: no web UI).

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use syrah_core::drain::DrainWatcher;
use syrah_core::version::BuildInfo;
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::config::Config;
use crate::flow::FlowRegistry;

type AdminBody = Full<Bytes>;

#[derive(serde::Serialize)]
struct ConfigDump {
	version: String,
	listen_addr: SocketAddr,
	bridge_addr: SocketAddr,
	admin_addr: Option<SocketAddr>,
	intercept_tls: bool,
	leaf_cache_capacity: usize,
	leaf_validity_days: i64,
	connect_timeout_secs: u64,
	handshake_timeout_secs: u64,
	idle_keepalive_secs: u64,
	throttle_active: bool,
	active_flows: usize,
}

impl ConfigDump {
	fn from(config: &Config, flows: &FlowRegistry) -> Self {
		ConfigDump {
			version: BuildInfo::current().to_string(),
			listen_addr: config.listen_addr,
			bridge_addr: config.bridge_addr,
			admin_addr: config.admin_addr,
			intercept_tls: config.intercept_tls,
			leaf_cache_capacity: config.leaf_cache_capacity,
			leaf_validity_days: (config.leaf_validity.as_secs() / 86400) as i64,
			connect_timeout_secs: config.connect_timeout.as_secs(),
			handshake_timeout_secs: config.handshake_timeout.as_secs(),
			idle_keepalive_secs: config.idle_keepalive.as_secs(),
			throttle_active: config.throttle.is_active(),
			active_flows: flows.len(),
		}
	}
}

fn plaintext(code: StatusCode, body: impl Into<Bytes>) -> Response<AdminBody> {
	Response::builder().status(code).header(hyper::header::CONTENT_TYPE, "text/plain").body(Full::new(body.into())).unwrap()
}

fn json(code: StatusCode, value: &impl serde::Serialize) -> Response<AdminBody> {
	match serde_json::to_vec(value) {
		Ok(bytes) => Response::builder()
			.status(code)
			.header(hyper::header::CONTENT_TYPE, "application/json")
			.body(Full::new(Bytes::from(bytes)))
			.unwrap(),
		Err(_) => plaintext(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode response"),
	}
}

fn handle_metrics(registry: &Mutex<Registry>) -> Response<AdminBody> {
	let mut buf = String::new();
	let reg = registry.lock().expect("registry mutex");
	match encode(&mut buf, &reg) {
		Ok(()) => Response::builder()
			.status(StatusCode::OK)
			.header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
			.body(Full::new(Bytes::from(buf)))
			.unwrap(),
		Err(e) => plaintext(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
	}
}

async fn handle(
	config: Arc<Config>,
	flows: Arc<FlowRegistry>,
	registry: Arc<Mutex<Registry>>,
	req: Request<Incoming>,
) -> Response<AdminBody> {
	match req.uri().path() {
		"/healthz" => plaintext(StatusCode::OK, "ok"),
		"/config_dump" => json(StatusCode::OK, &ConfigDump::from(&config, &flows)),
		"/metrics" => handle_metrics(&registry),
		_ => plaintext(StatusCode::NOT_FOUND, "not found"),
	}
}

/// Runs the admin listener until `drain` fires. Single plaintext HTTP/1.1
/// listener, mirroring the teacher's `Server::spawn` connection-serving
/// shape but for one fixed address rather than a set of configurable binds.
pub async fn run(
	addr: SocketAddr,
	config: Arc<Config>,
	flows: Arc<FlowRegistry>,
	registry: Arc<Mutex<Registry>>,
	drain: DrainWatcher,
) -> std::io::Result<()> {
	let listener = TcpListener::bind(addr).await?;
	info!(%addr, "admin listening");
	loop {
		tokio::select! {
			accepted = listener.accept() => {
				let (stream, peer) = accepted?;
				let config = config.clone();
				let flows = flows.clone();
				let registry = registry.clone();
				let conn_drain = drain.clone();
				tokio::spawn(async move {
					let io = TokioIo::new(stream);
					let service = hyper::service::service_fn(move |req| {
						let config = config.clone();
						let flows = flows.clone();
						let registry = registry.clone();
						async move { Ok::<_, Infallible>(handle(config, flows, registry, req).await) }
					});
					let mut builder = hyper::server::conn::http1::Builder::new();
					builder.timer(TokioTimer::new()).header_read_timeout(Duration::from_secs(2));
					let serve = builder.serve_connection(io, service);
					tokio::pin!(serve);
					tokio::select! {
						result = &mut serve => {
							if let Err(e) = result {
								debug!(%peer, error = %e, "admin connection error");
							}
						}
						_ = conn_drain.wait_for_drain() => {
							serve.as_mut().graceful_shutdown();
							if let Err(e) = serve.await {
								debug!(%peer, error = %e, "admin connection error during drain");
							}
						}
					}
				});
			}
			_ = drain.clone().wait_for_drain() => {
				info!("admin accept loop draining");
				return Ok(());
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::path::PathBuf;

	fn test_config() -> Config {
		Config {
			listen_addr: "127.0.0.1:8888".parse().unwrap(),
			bridge_addr: "127.0.0.1:9999".parse().unwrap(),
			ca_dir: PathBuf::from("/tmp/syrah-test-ca"),
			intercept_tls: true,
			rules_path: None,
			leaf_cache_capacity: 500,
			leaf_validity: Duration::from_secs(86400 * 365),
			connect_timeout: Duration::from_secs(10),
			handshake_timeout: Duration::from_secs(10),
			idle_keepalive: Duration::from_secs(60),
			throttle: Default::default(),
			admin_addr: None,
		}
	}

	#[test]
	fn config_dump_reports_active_flow_count() {
		let flows = FlowRegistry::new();
		let dump = ConfigDump::from(&test_config(), &flows);
		assert_eq!(dump.active_flows, 0);
		assert!(dump.intercept_tls);
	}
}
