//! Upstream dialing: a plain TCP connect for `http://` targets, or TCP +
//! TLS for `https://` targets (§4.8's "dial the upstream (reusing TLS as
//! needed)"). Timeouts follow §5 ("upstream connect timeout default 10s;
//! handshake timeout 10s").

use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use super::io::BoxedIo;
use super::tls::upstream_client_config;

#[derive(thiserror::Error, Debug)]
pub enum DialError {
	#[error("connect to {0} timed out")]
	ConnectTimeout(String),
	#[error("tls handshake with {0} timed out")]
	HandshakeTimeout(String),
	#[error("connect failed: {0}")]
	Connect(#[from] std::io::Error),
	#[error("tls handshake failed: {0}")]
	Tls(#[source] std::io::Error),
	#[error("invalid server name {0}")]
	InvalidServerName(String),
}

pub struct DialTimeouts {
	pub connect: Duration,
	pub handshake: Duration,
}

/// Dials `host:port`, optionally wrapping the connection in TLS (client
/// role) when `tls` is set. Returns a type-erased duplex stream so callers
/// don't need to distinguish plain vs. TLS upstreams afterward.
pub async fn dial(host: &str, port: u16, tls: bool, timeouts: &DialTimeouts) -> Result<BoxedIo, DialError> {
	let addr = format!("{host}:{port}");
	let tcp = tokio::time::timeout(timeouts.connect, TcpStream::connect(&addr))
		.await
		.map_err(|_| DialError::ConnectTimeout(addr.clone()))??;
	tcp.set_nodelay(true).ok();

	if !tls {
		return Ok(Box::new(tcp));
	}

	let connector = TlsConnector::from(Arc::new(upstream_client_config()));
	let server_name = ServerName::try_from(host.to_string())
		.map_err(|_| DialError::InvalidServerName(host.to_string()))?;
	let tls_stream = tokio::time::timeout(timeouts.handshake, connector.connect(server_name, tcp))
		.await
		.map_err(|_| DialError::HandshakeTimeout(addr.clone()))?
		.map_err(DialError::Tls)?;
	Ok(Box::new(tls_stream))
}
