//! The connection manager: owns every shared engine (CA, leaf cache, rules,
//! flow registry, bridge, metrics) and runs the accept loop that turns raw
//! TCP connections into either a plain-HTTP session, a TLS-intercepted
//! session (HTTP/1 or HTTP/2, chosen by ALPN), or a blind CONNECT tunnel
//! (§4.1, §4.8). Grounded on the teacher's `proxy::gateway::Gateway` —
//! `run`/`run_bind`'s accept-then-spawn-per-connection shape, generalized
//! from its multi-bind/thread-per-core setup down to the single listener
//! this proxy needs, and using `syrah_core::drain`'s `wait_for_drain`
//! exactly as `Bridge::run` already does.

pub mod http1_session;
pub mod http2_session;
pub mod io;
pub mod tls;
pub mod upstream;
pub mod websocket;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use syrah_core::copy::{Throttle, TokenBucket, splice};
use syrah_core::drain::DrainWatcher;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::bridge::Bridge;
use crate::ca::CaMaterial;
use crate::config::{Config, ThrottleConfig};
use crate::flow::{FlowRegistry, Method, Protocol};
use crate::http1::{Kind, ParsedMessage};
use crate::leaf::LeafCache;
use crate::metrics::Metrics;
use crate::rules::RuleEngine;

use http1_session::SessionContext;
use http2_session::Http2SessionContext;
use io::BoxedIo;
use upstream::DialTimeouts;

pub struct ConnectionManager {
	ca: Arc<CaMaterial>,
	leaves: Arc<LeafCache>,
	rules: Arc<RuleEngine>,
	flows: Arc<FlowRegistry>,
	bridge: Arc<Bridge>,
	metrics: Arc<Metrics>,
	config: Arc<Config>,
	leaf_evictions_seen: std::sync::atomic::AtomicU64,
}

fn throttle_from(cfg: &ThrottleConfig) -> Option<Throttle> {
	if !cfg.is_active() {
		return None;
	}
	Some(Throttle {
		upload: cfg.upload_bytes_per_sec.map(|r| TokenBucket::new(r, r)),
		download: cfg.download_bytes_per_sec.map(|r| TokenBucket::new(r, r)),
		latency: cfg.latency,
		packet_loss: cfg.packet_loss_percent,
	})
}

/// Splits a CONNECT target (`host:port`, no scheme) into its parts,
/// defaulting to 443 since CONNECT almost always tunnels TLS.
fn split_connect_target(target: &str) -> (String, u16) {
	match target.rsplit_once(':') {
		Some((h, p)) if !h.is_empty() && p.chars().all(|c| c.is_ascii_digit()) => {
			(h.to_string(), p.parse().unwrap_or(443))
		},
		_ => (target.to_string(), 443),
	}
}

impl ConnectionManager {
	pub fn new(
		ca: Arc<CaMaterial>,
		leaves: Arc<LeafCache>,
		rules: Arc<RuleEngine>,
		flows: Arc<FlowRegistry>,
		bridge: Arc<Bridge>,
		metrics: Arc<Metrics>,
		config: Arc<Config>,
	) -> Arc<Self> {
		Arc::new(Self {
			ca,
			leaves,
			rules,
			flows,
			bridge,
			metrics,
			config,
			leaf_evictions_seen: std::sync::atomic::AtomicU64::new(0),
		})
	}

	fn dial_timeouts(&self) -> DialTimeouts {
		DialTimeouts { connect: self.config.connect_timeout, handshake: self.config.handshake_timeout }
	}

	/// Runs the listener's accept loop until `drain` fires. Mirrors
	/// `Bridge::run`'s shape: accept-or-drain `select!`, a per-connection
	/// drain blocker so in-flight connections aren't cut mid-flow.
	pub async fn run(self: Arc<Self>, drain: DrainWatcher) -> std::io::Result<()> {
		let listener = TcpListener::bind(self.config.listen_addr).await?;
		info!(addr = %self.config.listen_addr, "proxy listening");
		loop {
			tokio::select! {
				accepted = listener.accept() => {
					let (stream, peer) = accepted?;
					stream.set_nodelay(true).ok();
					let manager = self.clone();
					let conn_drain = drain.clone();
					tokio::spawn(async move {
						let blocker = conn_drain.wait_for_drain();
						tokio::select! {
							_ = manager.handle_connection(stream, peer) => {}
							_ = blocker => {}
						}
					});
				}
				_ = drain.clone().wait_for_drain() => {
					info!("proxy accept loop draining");
					return Ok(());
				}
			}
		}
	}

	async fn handle_connection(self: Arc<Self>, mut stream: TcpStream, peer: SocketAddr) {
		self.metrics.connections_accepted.inc();

		let first = match http1_session::read_message(&mut stream, Kind::Request).await {
			Ok(Some(msg)) => msg,
			Ok(None) => return,
			Err(e) => {
				debug!(%peer, error = %e, "failed to read opening request");
				return;
			},
		};

		if first.start.method == Some(Method::Connect) {
			self.handle_connect(stream, first, peer).await;
			return;
		}

		let ctx = SessionContext {
			rules: self.rules.clone(),
			flows: self.flows.clone(),
			bridge: self.bridge.clone(),
			metrics: self.metrics.clone(),
			dial_timeouts: self.dial_timeouts(),
			session_id: peer.to_string(),
			default_host: String::new(),
			default_port: 80,
			scheme: "http",
			is_secure: false,
			protocol: Protocol::Http,
		};
		if let Err(e) = http1_session::run(stream, Some(first), &ctx).await {
			debug!(%peer, error = %e, "plain http session ended with an error");
		}
	}

	async fn handle_connect(self: Arc<Self>, mut client: TcpStream, first: ParsedMessage, peer: SocketAddr) {
		let target = first.start.target.clone().unwrap_or_default();
		let (host, port) = split_connect_target(&target);

		if let Err(e) = client.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await {
			debug!(%peer, %host, error = %e, "failed to acknowledge CONNECT");
			return;
		}

		if !self.config.intercept_tls {
			self.blind_tunnel(client, &host, port, peer).await;
			return;
		}

		self.metrics.connections_intercepted.inc();

		let leaf = match self.leaves.get_or_generate(&host).await {
			Ok(leaf) => leaf,
			Err(e) => {
				warn!(%peer, %host, error = %e, "failed to generate leaf certificate, falling back to a blind tunnel");
				self.blind_tunnel(client, &host, port, peer).await;
				return;
			},
		};
		self.metrics.leaf_cache_size.set(self.leaves.len() as i64);
		let total_evictions = self.leaves.evictions();
		let previously_seen = self.leaf_evictions_seen.swap(total_evictions, std::sync::atomic::Ordering::Relaxed);
		if total_evictions > previously_seen {
			self.metrics.leaf_cache_evictions.inc_by(total_evictions - previously_seen);
		}

		let server_cfg = match tls::server_config(&leaf, self.ca.cert_der()) {
			Ok(cfg) => cfg,
			Err(e) => {
				warn!(%peer, %host, error = %e, "failed to build tls server config");
				return;
			},
		};
		let acceptor = TlsAcceptor::from(Arc::new(server_cfg));
		let tls_stream = match tokio::time::timeout(self.config.handshake_timeout, acceptor.accept(client)).await {
			Ok(Ok(stream)) => stream,
			Ok(Err(e)) => {
				debug!(%peer, %host, error = %e, "tls handshake with client failed");
				return;
			},
			Err(_) => {
				debug!(%peer, %host, "tls handshake with client timed out");
				return;
			},
		};

		let negotiated_h2 = tls_stream.get_ref().1.alpn_protocol() == Some(b"h2".as_slice());

		if negotiated_h2 {
			self.run_h2(tls_stream, &host, port, peer).await;
		} else {
			self.run_h1_tls(tls_stream, &host, port, peer).await;
		}
	}

	async fn run_h1_tls(
		self: Arc<Self>,
		mut tls_stream: tokio_rustls::server::TlsStream<TcpStream>,
		host: &str,
		port: u16,
		peer: SocketAddr,
	) {
		let first = match http1_session::read_message(&mut tls_stream, Kind::Request).await {
			Ok(Some(msg)) => msg,
			Ok(None) => return,
			Err(e) => {
				debug!(%peer, %host, error = %e, "failed to read first intercepted request");
				return;
			},
		};
		let ctx = SessionContext {
			rules: self.rules.clone(),
			flows: self.flows.clone(),
			bridge: self.bridge.clone(),
			metrics: self.metrics.clone(),
			dial_timeouts: self.dial_timeouts(),
			session_id: peer.to_string(),
			default_host: host.to_string(),
			default_port: port,
			scheme: "https",
			is_secure: true,
			protocol: Protocol::Https,
		};
		if let Err(e) = http1_session::run(tls_stream, Some(first), &ctx).await {
			debug!(%peer, %host, error = %e, "intercepted http/1 session ended with an error");
		}
	}

	async fn run_h2(
		self: Arc<Self>,
		client: tokio_rustls::server::TlsStream<TcpStream>,
		host: &str,
		port: u16,
		peer: SocketAddr,
	) {
		let upstream = match upstream::dial(host, port, true, &self.dial_timeouts()).await {
			Ok(io) => io,
			Err(e) => {
				debug!(%peer, %host, port, error = %e, "failed to dial h2 upstream");
				return;
			},
		};
		let ctx = Http2SessionContext {
			flows: self.flows.clone(),
			bridge: self.bridge.clone(),
			metrics: self.metrics.clone(),
			session_id: peer.to_string(),
			is_secure: true,
		};
		if let Err(e) = http2_session::run(client, upstream, &ctx).await {
			debug!(%peer, %host, error = %e, "h2 relay ended with an error");
		}
	}

	async fn blind_tunnel(self: Arc<Self>, client: TcpStream, host: &str, port: u16, peer: SocketAddr) {
		let upstream: BoxedIo = match upstream::dial(host, port, false, &self.dial_timeouts()).await {
			Ok(io) => io,
			Err(e) => {
				debug!(%peer, %host, port, error = %e, "failed to dial tunneled upstream");
				return;
			},
		};
		self.metrics.connections_tunneled.inc();
		let throttle = throttle_from(&self.config.throttle);
		if let Err(e) = splice(client, upstream, throttle.as_ref()).await {
			debug!(%peer, %host, error = %e, "blind tunnel ended with an error");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn splits_connect_target_host_and_port() {
		assert_eq!(split_connect_target("example.test:443"), ("example.test".to_string(), 443));
		assert_eq!(split_connect_target("example.test"), ("example.test".to_string(), 443));
	}

	#[test]
	fn throttle_from_inactive_config_is_none() {
		assert!(throttle_from(&ThrottleConfig::default()).is_none());
	}

	#[test]
	fn throttle_from_active_config_carries_fields() {
		let cfg = ThrottleConfig {
			upload_bytes_per_sec: Some(1024),
			download_bytes_per_sec: None,
			latency: Some(Duration::from_millis(50)),
			packet_loss_percent: Some(1.0),
		};
		let throttle = throttle_from(&cfg).unwrap();
		assert!(throttle.upload.is_some());
		assert!(throttle.download.is_none());
		assert_eq!(throttle.latency, Some(Duration::from_millis(50)));
	}
}
