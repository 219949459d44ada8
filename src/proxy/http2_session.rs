//! Observe-only HTTP/2 relay (§4.4, §4.6 "HTTP/2 flows are observed, not
//! rewritten"). Frames are forwarded byte-for-byte in both directions — the
//! proxy never re-encodes a frame — while two `Http2Parser`s (one per
//! direction) tee the bytes to reconstruct each stream's request/response
//! into the same `Flow` model HTTP/1 uses, so the bridge/UI see HTTP/2
//! traffic the same way regardless of wire protocol. Rule evaluation and
//! breakpoints don't apply to HTTP/2 streams (see DESIGN.md); flows are
//! synthesized and emitted only once a stream completes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use time::OffsetDateTime;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

use crate::bridge::Bridge;
use crate::flow::{Body, FlowRegistry, Headers, HttpRequest, HttpResponse, Method, Protocol};
use crate::http2::{Http2Event, Http2Parser, Role, Stream};
use crate::metrics::Metrics;

pub struct Http2SessionContext {
	pub flows: Arc<FlowRegistry>,
	pub bridge: Arc<Bridge>,
	pub metrics: Arc<Metrics>,
	pub session_id: String,
	pub is_secure: bool,
}

fn pseudo(headers: &Headers, name: &str) -> Option<String> {
	headers.get(name).map(str::to_string)
}

fn non_pseudo_headers(headers: &Headers) -> Headers {
	headers.iter().filter(|(n, _)| !n.starts_with(':')).map(|(n, v)| (n.to_string(), v.to_string())).collect()
}

fn split_authority(authority: &str, default_port: u16) -> (String, u16) {
	match authority.rsplit_once(':') {
		Some((h, p)) if !h.is_empty() && p.chars().all(|c| c.is_ascii_digit()) => {
			(h.to_string(), p.parse().unwrap_or(default_port))
		},
		_ => (authority.to_string(), default_port),
	}
}

/// Builds a flow-model `HttpRequest`/`HttpResponse` pair from a completed
/// stream's pseudo-headers and buffered bodies.
fn synthesize_request(stream: &Stream, is_secure: bool) -> Option<HttpRequest> {
	let headers = stream.request_headers.as_ref()?;
	let method = pseudo(headers, ":method")?.parse::<Method>().ok()?;
	let scheme = pseudo(headers, ":scheme").unwrap_or_else(|| if is_secure { "https".into() } else { "http".into() });
	let authority = pseudo(headers, ":authority").unwrap_or_default();
	let default_port = if scheme == "https" { 443 } else { 80 };
	let (host, port) = split_authority(&authority, default_port);
	let target = pseudo(headers, ":path").unwrap_or_else(|| "/".to_string());
	let (path, query) = match target.split_once('?') {
		Some((p, q)) => (p.to_string(), Some(q.to_string())),
		None => (target, None),
	};
	let params = query
		.as_deref()
		.map(|q| url::form_urlencoded::parse(q.as_bytes()).map(|(k, v)| (k.into_owned(), v.into_owned())).collect())
		.unwrap_or_default();
	let default_port_omitted = (scheme == "http" && port == 80) || (scheme == "https" && port == 443);
	let port_suffix = if default_port_omitted { String::new() } else { format!(":{port}") };
	let query_suffix = query.as_deref().map(|q| format!("?{q}")).unwrap_or_default();
	let url = format!("{scheme}://{host}{port_suffix}{path}{query_suffix}");
	let body = if stream.request_data.is_empty() { None } else { Some(Body::from_bytes(stream.request_data.clone().freeze())) };
	let content_length = body.as_ref().map(|b| b.bytes.len() as u64);
	Some(HttpRequest {
		method,
		url,
		scheme,
		host,
		port,
		path,
		query,
		params,
		headers: non_pseudo_headers(headers),
		body,
		content_length,
		timestamp: OffsetDateTime::now_utc(),
		is_secure,
	})
}

fn synthesize_response(stream: &Stream) -> Option<HttpResponse> {
	let headers = stream.response_headers.as_ref()?;
	let status_code = pseudo(headers, ":status")?.parse::<u16>().ok()?;
	let body = if stream.response_data.is_empty() { None } else { Some(Body::from_bytes(stream.response_data.clone().freeze())) };
	let content_length = body.as_ref().map(|b| b.bytes.len() as u64);
	Some(HttpResponse {
		status_code,
		status_message: String::new(),
		http_version: "HTTP/2".into(),
		headers: non_pseudo_headers(headers),
		body,
		content_length,
		was_compressed: false,
		original_encoding: None,
		timestamp: OffsetDateTime::now_utc(),
		timing: None,
	})
}

fn emit_completed_stream(stream_id: u32, streams: &HashMap<u32, Stream>, ctx: &Http2SessionContext) {
	let Some(stream) = streams.get(&stream_id) else { return };
	let Some(request) = synthesize_request(stream, ctx.is_secure) else {
		warn!(stream_id, "http/2 stream completed without decodable request headers");
		return;
	};
	let Some(response) = synthesize_response(stream) else {
		warn!(stream_id, "http/2 stream completed without decodable response headers");
		return;
	};
	let flow = ctx.flows.create(ctx.session_id.clone(), request, Protocol::Http2);
	let created_at = flow.read().unwrap().created_at;
	{
		let mut f = flow.write().unwrap();
		if f.record_request().is_err() {
			return;
		}
		if f.record_response(response).is_err() {
			return;
		}
		let _ = f.complete();
	}
	ctx.bridge.emit_flow(&flow.read().unwrap(), ctx.is_secure);
	ctx.metrics.record_flow_terminal(flow.read().unwrap().state, (OffsetDateTime::now_utc() - created_at).as_seconds_f64());
}

/// Relays `client <-> upstream` until either side closes, tee-parsing both
/// directions as HTTP/2 to synthesize flows. Returns `(bytes_client_to_upstream,
/// bytes_upstream_to_client)`, matching the shape of `syrah_core::copy::splice`.
pub async fn run<A, B>(client: A, upstream: B, ctx: &Http2SessionContext) -> std::io::Result<(u64, u64)>
where
	A: AsyncRead + AsyncWrite + Unpin,
	B: AsyncRead + AsyncWrite + Unpin,
{
	let streams = Arc::new(Mutex::new(HashMap::<u32, Stream>::new()));
	let (mut cr, mut cw) = tokio::io::split(client);
	let (mut ur, mut uw) = tokio::io::split(upstream);

	let streams_up = streams.clone();
	let to_upstream = async {
		let mut parser = Http2Parser::new(Role::ClientFacing);
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
			{
				let mut streams = streams_up.lock().unwrap();
				match parser.feed(&buf[..n], &mut streams) {
					Ok(events) => {
						for event in events {
							if let Http2Event::StreamComplete { stream_id } = event {
								emit_completed_stream(stream_id, &streams, ctx);
							}
						}
					},
					Err(e) => warn!(error = %e, "http/2 client-facing parse error, continuing to forward raw bytes"),
				}
			}
			uw.write_all(&buf[..n]).await?;
		}
		uw.shutdown().await?;
		Ok::<u64, std::io::Error>(total)
	};

	let streams_down = streams.clone();
	let to_client = async {
		let mut parser = Http2Parser::new(Role::ServerFacing);
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
			{
				let mut streams = streams_down.lock().unwrap();
				match parser.feed(&buf[..n], &mut streams) {
					Ok(events) => {
						for event in events {
							if let Http2Event::StreamComplete { stream_id } = event {
								emit_completed_stream(stream_id, &streams, ctx);
							}
						}
					},
					Err(e) => warn!(error = %e, "http/2 server-facing parse error, continuing to forward raw bytes"),
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
	use crate::rules::RuleEngine;

	fn ctx() -> Http2SessionContext {
		let flows = Arc::new(FlowRegistry::new());
		let rules = Arc::new(RuleEngine::new(Vec::new()));
		Http2SessionContext {
			flows: flows.clone(),
			bridge: Bridge::new(flows, rules),
			metrics: Arc::new(Metrics::new(&mut prometheus_client::registry::Registry::default())),
			session_id: "s1".into(),
			is_secure: true,
		}
	}

	#[test]
	fn synthesizes_request_from_pseudo_headers() {
		let mut stream = Stream::new(1, 65_535);
		let mut headers = Headers::new();
		headers.push(":method", "GET");
		headers.push(":scheme", "https");
		headers.push(":authority", "example.test");
		headers.push(":path", "/foo?x=1");
		headers.push("x-custom", "v");
		stream.on_request_headers(headers, true);

		let req = synthesize_request(&stream, true).unwrap();
		assert_eq!(req.method, Method::Get);
		assert_eq!(req.host, "example.test");
		assert_eq!(req.path, "/foo");
		assert_eq!(req.query.as_deref(), Some("x=1"));
		assert_eq!(req.headers.get("x-custom"), Some("v"));
		assert!(req.headers.get(":method").is_none());
	}

	#[test]
	fn synthesizes_response_from_status_pseudo_header() {
		let mut stream = Stream::new(1, 65_535);
		let mut headers = Headers::new();
		headers.push(":status", "204");
		stream.on_response_headers(headers, true);
		let resp = synthesize_response(&stream).unwrap();
		assert_eq!(resp.status_code, 204);
	}

	#[tokio::test]
	async fn relays_raw_bytes_and_emits_a_flow_on_stream_complete() {
		use crate::http2::frame::{self, Frame, FrameType, FLAG_END_HEADERS, FLAG_END_STREAM};
		use tokio::io::duplex;

		let (client, mut client_other) = duplex(4096);
		let (upstream, mut upstream_other) = duplex(4096);
		let ctx = ctx();
		let flows = ctx.flows.clone();

		let handle = tokio::spawn(async move { run(client, upstream, &ctx).await });

		let preface = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n".to_vec();
		let req_headers = frame::encode(&Frame {
			frame_type: FrameType::Headers,
			flags: FLAG_END_HEADERS | FLAG_END_STREAM,
			stream_id: 1,
			payload: bytes::Bytes::from_static(&[0x82, 0x84]), // :method GET, :path /
		});
		let mut input = preface;
		input.extend_from_slice(&req_headers);
		client_other.write_all(&input).await.unwrap();

		let mut forwarded = vec![0u8; input.len()];
		upstream_other.read_exact(&mut forwarded).await.unwrap();
		assert_eq!(forwarded, input);

		let resp_headers = frame::encode(&Frame {
			frame_type: FrameType::Headers,
			flags: FLAG_END_HEADERS | FLAG_END_STREAM,
			stream_id: 1,
			payload: bytes::Bytes::from_static(&[0x88]), // :status 200
		});
		upstream_other.write_all(&resp_headers).await.unwrap();
		let mut forwarded_resp = vec![0u8; resp_headers.len()];
		client_other.read_exact(&mut forwarded_resp).await.unwrap();
		assert_eq!(forwarded_resp, resp_headers.to_vec());

		tokio::time::sleep(std::time::Duration::from_millis(20)).await;
		assert_eq!(flows.len(), 1);

		drop(client_other);
		drop(upstream_other);
		let _ = handle.await.unwrap();
	}
}
