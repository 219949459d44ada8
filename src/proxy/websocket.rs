//! Observes a WebSocket connection after the HTTP/1 upgrade handshake has
//! completed (§4.5): bytes are forwarded unmodified in both directions,
//! exactly like `syrah_core::copy::splice`, but each direction is also fed
//! through a `WsParser` so frame boundaries can be logged for the bridge.
//! Frame contents are never rewritten — §4.5 scopes this proxy to
//! observation, not WebSocket message editing.

use bytes::BytesMut;
use syrah_core::copy::Throttle;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::ws::{self, WsParser};

fn log_frames(direction: &'static str, parser: &mut WsParser, chunk: &[u8]) {
	match parser.feed(chunk) {
		Ok(frames) => {
			for frame in frames {
				if frame.opcode == ws::Opcode::Close {
					let info = ws::parse_close_payload(&frame.payload);
					debug!(direction, code = ?info.code, reason = ?info.reason, "websocket close frame");
				} else {
					trace!(direction, opcode = ?frame.opcode, len = frame.payload.len(), "websocket frame");
				}
			}
		},
		Err(e) => {
			trace!(direction, error = %e, "websocket frame parse error, continuing to forward raw bytes");
		},
	}
}

/// Splices `client <-> upstream` until either side closes, returning
/// `(bytes_client_to_upstream, bytes_upstream_to_client)`. Each direction's
/// bytes are teed through an independent `WsParser` purely for
/// observability; a parse error never interrupts forwarding.
pub async fn observe_and_splice<A, B>(client: A, upstream: B, throttle: Option<&Throttle>) -> std::io::Result<(u64, u64)>
where
	A: AsyncRead + AsyncWrite + Unpin,
	B: AsyncRead + AsyncWrite + Unpin,
{
	let (mut cr, mut cw) = tokio::io::split(client);
	let (mut ur, mut uw) = tokio::io::split(upstream);

	let to_upstream = async {
		let mut parser = WsParser::new();
		let mut total = 0u64;
		let mut buf = BytesMut::with_capacity(16 * 1024);
		loop {
			buf.clear();
			buf.resize(16 * 1024, 0);
			let n = cr.read(&mut buf).await?;
			if n == 0 {
				break;
			}
			total += n as u64;
			log_frames("client->upstream", &mut parser, &buf[..n]);
			if let Some(t) = throttle {
				if let Some(bucket) = &t.upload {
					bucket.acquire(n).await;
				}
				if let Some(d) = t.latency {
					tokio::time::sleep(d).await;
				}
			}
			uw.write_all(&buf[..n]).await?;
		}
		uw.shutdown().await?;
		Ok::<u64, std::io::Error>(total)
	};

	let to_client = async {
		let mut parser = WsParser::new();
		let mut total = 0u64;
		let mut buf = BytesMut::with_capacity(16 * 1024);
		loop {
			buf.clear();
			buf.resize(16 * 1024, 0);
			let n = ur.read(&mut buf).await?;
			if n == 0 {
				break;
			}
			total += n as u64;
			log_frames("upstream->client", &mut parser, &buf[..n]);
			if let Some(t) = throttle {
				if let Some(bucket) = &t.download {
					bucket.acquire(n).await;
				}
				if let Some(d) = t.latency {
					tokio::time::sleep(d).await;
				}
			}
			cw.write_all(&buf[..n]).await?;
		}
		cw.shutdown().await?;
		Ok::<u64, std::io::Error>(total)
	};

	let (up, down) = tokio::try_join!(to_upstream, to_client)?;
	Ok((up, down))
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::io::duplex;

	#[tokio::test]
	async fn forwards_bytes_unmodified_in_both_directions() {
		let (client, mut client_other) = duplex(128);
		let (upstream, mut upstream_other) = duplex(128);

		let handle = tokio::spawn(async move { observe_and_splice(client, upstream, None).await });

		let mut frame = vec![0x81u8, 0x05];
		frame.extend_from_slice(b"hello");
		client_other.write_all(&frame).await.unwrap();
		let mut buf = vec![0u8; frame.len()];
		upstream_other.read_exact(&mut buf).await.unwrap();
		assert_eq!(buf, frame);

		drop(client_other);
		drop(upstream_other);
		let (up, _down) = handle.await.unwrap().unwrap();
		assert_eq!(up, 7);
	}
}
