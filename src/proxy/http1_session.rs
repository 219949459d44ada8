//! Per-connection HTTP/1 pipeline (§4.8 steps a–e): read a request, run it
//! through the rule engine, dial (or reuse) the upstream, read the
//! response, run it through the rule engine again, write it back, and loop
//! for keep-alive. Generalizes the teacher's `client::Client` connection
//! reuse into a per-connection upstream slot instead of a shared pool,
//! since each proxy connection owns exactly one upstream at a time.

use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use time::OffsetDateTime;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::bridge::{Bridge, ResumeCommand};
use crate::flow::{Body, FlowRegistry, Headers, HttpRequest, HttpResponse, Protocol};
use crate::http1::{self, Http1Parser, Kind, ParsedMessage};
use crate::metrics::Metrics;
use crate::rules::{Decision, Phase, RuleEngine};
use crate::ws;

use super::io::BoxedIo;
use super::upstream::{self, DialTimeouts};
use super::websocket;

/// Everything a session needs that doesn't change per-request: the shared
/// engines, this connection's identity, and the default target derived
/// from how the client reached us (CONNECT host, or plain-HTTP listener).
pub struct SessionContext {
	pub rules: std::sync::Arc<RuleEngine>,
	pub flows: std::sync::Arc<FlowRegistry>,
	pub bridge: std::sync::Arc<Bridge>,
	pub metrics: std::sync::Arc<Metrics>,
	pub dial_timeouts: DialTimeouts,
	pub session_id: String,
	pub default_host: String,
	pub default_port: u16,
	pub scheme: &'static str,
	pub is_secure: bool,
	pub protocol: Protocol,
}

/// Reads one full HTTP message from `stream`, or `Ok(None)` if the peer
/// closed the connection before sending another one (the ordinary
/// keep-alive exit).
pub(crate) async fn read_message<S: AsyncRead + Unpin>(stream: &mut S, kind: Kind) -> std::io::Result<Option<ParsedMessage>> {
	let mut parser = Http1Parser::new(kind);
	let mut buf = [0u8; 8192];
	loop {
		let n = stream.read(&mut buf).await?;
		if n == 0 {
			parser.finish();
			return Ok(parser.take_message());
		}
		parser
			.feed(&buf[..n])
			.map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
		if let Some(msg) = parser.take_message() {
			return Ok(Some(msg));
		}
	}
}

fn parse_query_params(query: &str) -> Headers {
	url::form_urlencoded::parse(query.as_bytes())
		.map(|(k, v)| (k.into_owned(), v.into_owned()))
		.collect()
}

/// Builds the flow-model `HttpRequest` from a freshly parsed message,
/// resolving the target from either an absolute-form URI (plain-HTTP
/// forward proxying) or an origin-form path plus `Host` header (TLS
/// interception and CONNECT tunnels), per §4.3/§4.8.
fn build_request(msg: ParsedMessage, ctx: &SessionContext) -> anyhow::Result<HttpRequest> {
	let method = msg.start.method.context("request line missing method")?;
	let target = msg.start.target.context("request line missing target")?;

	let (scheme, host, port, path, query) = match url::Url::parse(&target) {
		Ok(url) if url.host_str().is_some() => {
			let scheme = url.scheme().to_string();
			let host = url.host_str().unwrap().to_string();
			let port = url.port_or_known_default().unwrap_or(ctx.default_port);
			let path = if url.path().is_empty() { "/".to_string() } else { url.path().to_string() };
			let query = url.query().map(str::to_string);
			(scheme, host, port, path, query)
		},
		_ => {
			let (path, query) = match target.split_once('?') {
				Some((p, q)) => (p.to_string(), Some(q.to_string())),
				None => (target.clone(), None),
			};
			let host_header = msg.headers.get("host").unwrap_or(ctx.default_host.as_str());
			let (host, port) = match host_header.rsplit_once(':') {
				Some((h, p)) if !h.is_empty() && p.chars().all(|c| c.is_ascii_digit()) => {
					(h.to_string(), p.parse().unwrap_or(ctx.default_port))
				},
				_ => (host_header.to_string(), ctx.default_port),
			};
			(ctx.scheme.to_string(), host, port, path, query)
		},
	};

	let params = query.as_deref().map(parse_query_params).unwrap_or_default();
	let body_len = msg.body.len();
	let content_length = if body_len > 0 || msg.headers.contains("content-length") {
		Some(body_len as u64)
	} else {
		None
	};
	let body = if body_len > 0 { Some(Body::from_bytes(msg.body)) } else { None };

	let default_port = (scheme == "http" && port == 80) || (scheme == "https" && port == 443);
	let port_suffix = if default_port { String::new() } else { format!(":{port}") };
	let query_suffix = query.as_deref().map(|q| format!("?{q}")).unwrap_or_default();
	let url = format!("{scheme}://{host}{port_suffix}{path}{query_suffix}");

	Ok(HttpRequest {
		method,
		url,
		scheme,
		host,
		port,
		path,
		query,
		params,
		headers: msg.headers,
		body,
		content_length,
		timestamp: OffsetDateTime::now_utc(),
		is_secure: ctx.is_secure,
	})
}

fn build_response(msg: ParsedMessage) -> anyhow::Result<HttpResponse> {
	let status_code = msg.start.status_code.context("status line missing status code")?;
	let status_message = msg.start.reason.unwrap_or_default();
	let encoding = msg.headers.get("content-encoding").map(str::to_string);
	let decoded = http1::decode_content_encoding(encoding.as_deref(), &msg.body)?;
	let was_compressed = encoding.is_some();
	let content_length = Some(decoded.len() as u64);
	let body = if decoded.is_empty() { None } else { Some(Body::from_bytes(decoded)) };
	Ok(HttpResponse {
		status_code,
		status_message,
		http_version: msg.start.version,
		headers: msg.headers,
		body,
		content_length,
		was_compressed,
		original_encoding: encoding,
		timestamp: OffsetDateTime::now_utc(),
		timing: None,
	})
}

/// HTTP/1.1 keep-alive per RFC 7230 §6.1: closes unless both sides agree to
/// persist. HTTP/1.0 requires an explicit `Connection: keep-alive`.
fn wants_keep_alive(http_version: &str, req_headers: &Headers, resp_headers: &Headers) -> bool {
	let says_close = |h: &Headers| {
		h.get("connection").map(|v| v.to_ascii_lowercase().split(',').any(|p| p.trim() == "close")).unwrap_or(false)
	};
	if says_close(req_headers) || says_close(resp_headers) {
		return false;
	}
	if http_version.trim_end().ends_with("1.0") {
		let says_keepalive = |h: &Headers| {
			h.get("connection")
				.map(|v| v.to_ascii_lowercase().split(',').any(|p| p.trim() == "keep-alive"))
				.unwrap_or(false)
		};
		return says_keepalive(req_headers) || says_keepalive(resp_headers);
	}
	true
}

enum PauseOutcome {
	Continue,
	Killed,
}

/// Parks the connection task on a breakpoint until the bridge resolves it
/// with `resume` or `kill` (§4.9, §5 "paused flows have no intrinsic
/// timeout"). The flow's request/response is mutated in place by
/// `crate::bridge::apply_modified` before this returns `Continue`.
async fn await_breakpoint(
	flow: &std::sync::Arc<std::sync::RwLock<crate::flow::Flow>>,
	bridge: &Bridge,
	rule_id: String,
) -> anyhow::Result<PauseOutcome> {
	let id = flow.read().unwrap().id;
	flow.write().unwrap().pause(rule_id)?;
	bridge.emit_flow(&flow.read().unwrap(), false);
	let rx = bridge.register_waiter(id);
	match rx.await {
		Ok(ResumeCommand::Resume { modified }) => {
			let mut f = flow.write().unwrap();
			if let Some(m) = modified {
				crate::bridge::apply_modified(&mut f, m);
			}
			f.resume()?;
			Ok(PauseOutcome::Continue)
		},
		Ok(ResumeCommand::Kill { reason }) => {
			flow.write().unwrap().kill(reason)?;
			Ok(PauseOutcome::Killed)
		},
		Err(_) => {
			// UI disconnected without acting; tear the flow down rather than
			// hang the connection forever.
			flow.write().unwrap().kill("bridge disconnected while paused")?;
			Ok(PauseOutcome::Killed)
		},
	}
}

struct Pooled {
	host: String,
	port: u16,
	secure: bool,
	io: BoxedIo,
}

/// Drives one client connection end to end. `first` is an already-parsed
/// request (the sniff that decided CONNECT vs. plain-HTTP, or the
/// post-handshake first request on an intercepted TLS connection);
/// subsequent iterations read fresh requests for as long as both sides
/// keep the connection alive.
pub async fn run(
	mut client: impl AsyncRead + AsyncWrite + Unpin,
	mut first: Option<ParsedMessage>,
	ctx: &SessionContext,
) -> anyhow::Result<()> {
	let mut pooled: Option<Pooled> = None;

	loop {
		let msg = match first.take() {
			Some(m) => m,
			None => match read_message(&mut client, Kind::Request).await? {
				Some(m) => m,
				None => return Ok(()), // client closed the connection cleanly
			},
		};

		let request = build_request(msg, ctx)?;
		let is_ws_upgrade = ws::is_upgrade_request(&request.headers);
		let flow = ctx.flows.create(ctx.session_id.clone(), request, ctx.protocol);
		flow.write().unwrap().record_request()?;
		ctx.bridge.emit_flow(&flow.read().unwrap(), ctx.is_secure);

		let decision = {
			let mut f = flow.write().unwrap();
			ctx.rules.evaluate(Phase::Request, &mut f.request, None)
		};

		let mut short_circuited = false;
		match decision {
			Decision::Continue => {},
			Decision::Redirect { new_upstream } => {
				if let Ok(url) = url::Url::parse(&new_upstream) {
					let mut f = flow.write().unwrap();
					f.request.scheme = url.scheme().to_string();
					if let Some(h) = url.host_str() {
						f.request.host = h.to_string();
					}
					f.request.is_secure = url.scheme() == "https";
					if let Some(p) = url.port_or_known_default() {
						f.request.port = p;
					}
					// preserve_path is not wired through Decision::Redirect (see
					// DESIGN.md); the rewritten path/query, if any, wins outright.
					if !url.path().is_empty() && url.path() != "/" {
						f.request.path = url.path().to_string();
					}
				} else {
					warn!(%new_upstream, "mapRemote target is not a valid URL, ignoring");
				}
			},
			Decision::Pause { rule_id } => {
				if matches!(await_breakpoint(&flow, &ctx.bridge, rule_id).await?, PauseOutcome::Killed) {
					ctx.bridge.emit_flow(&flow.read().unwrap(), ctx.is_secure);
					return Ok(());
				}
			},
			Decision::Short(resp) => {
				flow.write().unwrap().record_response(resp)?;
				flow.write().unwrap().complete()?;
				short_circuited = true;
			},
		}

		if short_circuited {
			let (resp_bytes, http_version, req_headers, resp_headers, state, created_at) = {
				let f = flow.read().unwrap();
				(
					http1::serialize_response(f.response.as_ref().unwrap()),
					f.response.as_ref().unwrap().http_version.clone(),
					f.request.headers.clone(),
					f.response.as_ref().unwrap().headers.clone(),
					f.state,
					f.created_at,
				)
			};
			client.write_all(&resp_bytes).await?;
			ctx.bridge.emit_flow(&flow.read().unwrap(), ctx.is_secure);
			ctx.metrics.record_flow_terminal(state, (OffsetDateTime::now_utc() - created_at).as_seconds_f64());
			if !wants_keep_alive(&http_version, &req_headers, &resp_headers) {
				return Ok(());
			}
			continue;
		}

		if is_ws_upgrade {
			return run_websocket_upgrade(&mut client, flow, ctx, &mut pooled).await;
		}

		let (host, port, secure) = {
			let f = flow.read().unwrap();
			(f.request.host.clone(), f.request.port, f.request.is_secure)
		};

		let reuse = matches!(&pooled, Some(p) if p.host == host && p.port == port && p.secure == secure);
		let mut upstream_io = if reuse {
			pooled.take().unwrap().io
		} else {
			pooled = None;
			upstream::dial(&host, port, secure, &ctx.dial_timeouts).await.with_context(|| format!("dialing {host}:{port}"))?
		};

		let req_bytes = http1::serialize_request(&flow.read().unwrap().request);
		if let Err(e) = upstream_io.write_all(&req_bytes).await {
			flow.write().unwrap().fail(e.to_string())?;
			ctx.bridge.emit_flow(&flow.read().unwrap(), ctx.is_secure);
			return Err(e.into());
		}

		let response_msg = match read_message(&mut upstream_io, Kind::Response).await {
			Ok(Some(m)) => m,
			Ok(None) => {
				flow.write().unwrap().fail("upstream closed without a response")?;
				ctx.bridge.emit_flow(&flow.read().unwrap(), ctx.is_secure);
				return Ok(());
			},
			Err(e) => {
				flow.write().unwrap().fail(e.to_string())?;
				ctx.bridge.emit_flow(&flow.read().unwrap(), ctx.is_secure);
				return Err(e.into());
			},
		};
		let response = build_response(response_msg)?;
		let response_is_101 = response.status_code == 101;
		flow.write().unwrap().record_response(response)?;

		let decision2 = {
			let mut f = flow.write().unwrap();
			let crate::flow::Flow { request, response, .. } = &mut *f;
			ctx.rules.evaluate(Phase::Response, request, response.as_mut())
		};
		match decision2 {
			Decision::Continue => {},
			Decision::Redirect { .. } => {
				warn!("mapRemote rule matched in the response phase; ignoring (upstream already dialed)");
			},
			Decision::Pause { rule_id } => {
				if matches!(await_breakpoint(&flow, &ctx.bridge, rule_id).await?, PauseOutcome::Killed) {
					ctx.bridge.emit_flow(&flow.read().unwrap(), ctx.is_secure);
					return Ok(());
				}
			},
			Decision::Short(resp) => {
				flow.write().unwrap().response = Some(resp);
			},
		}

		flow.write().unwrap().complete()?;
		let (resp_bytes, http_version, req_headers, resp_headers, state, created_at) = {
			let f = flow.read().unwrap();
			let resp = f.response.as_ref().unwrap();
			(
				http1::serialize_response(resp),
				resp.http_version.clone(),
				f.request.headers.clone(),
				resp.headers.clone(),
				f.state,
				f.created_at,
			)
		};
		client.write_all(&resp_bytes).await?;
		ctx.bridge.emit_flow(&flow.read().unwrap(), ctx.is_secure);
		ctx.metrics.record_flow_terminal(state, (OffsetDateTime::now_utc() - created_at).as_seconds_f64());

		if response_is_101 {
			debug!(%host, port, "switching protocols, handing connection to the websocket splicer");
			return websocket::observe_and_splice(client, upstream_io, None).await.map(|_| ()).map_err(Into::into);
		}

		if !wants_keep_alive(&http_version, &req_headers, &resp_headers) {
			return Ok(());
		}
		pooled = Some(Pooled { host, port, secure, io: upstream_io });
	}
}

async fn run_websocket_upgrade(
	client: &mut (impl AsyncRead + AsyncWrite + Unpin),
	flow: std::sync::Arc<std::sync::RwLock<crate::flow::Flow>>,
	ctx: &SessionContext,
	pooled: &mut Option<Pooled>,
) -> anyhow::Result<()> {
	let (host, port, secure) = {
		let f = flow.read().unwrap();
		(f.request.host.clone(), f.request.port, f.request.is_secure)
	};
	let reuse = matches!(pooled, Some(p) if p.host == host && p.port == port && p.secure == secure);
	let mut upstream_io = if reuse {
		pooled.take().unwrap().io
	} else {
		upstream::dial(&host, port, secure, &ctx.dial_timeouts).await?
	};

	let req_bytes = http1::serialize_request(&flow.read().unwrap().request);
	upstream_io.write_all(&req_bytes).await?;

	let response_msg = match read_message(&mut upstream_io, Kind::Response).await? {
		Some(m) => m,
		None => {
			flow.write().unwrap().fail("upstream closed during websocket handshake")?;
			ctx.bridge.emit_flow(&flow.read().unwrap(), ctx.is_secure);
			return Ok(());
		},
	};
	let response = build_response(response_msg)?;
	let accepted = response.status_code == 101;
	flow.write().unwrap().record_response(response)?;
	flow.write().unwrap().complete()?;
	let resp_bytes = http1::serialize_response(flow.read().unwrap().response.as_ref().unwrap());
	client.write_all(&resp_bytes).await?;
	ctx.bridge.emit_flow(&flow.read().unwrap(), ctx.is_secure);
	ctx.metrics.record_flow_terminal(flow.read().unwrap().state, 0.0);

	if !accepted {
		return Ok(());
	}
	websocket::observe_and_splice(client, upstream_io, None).await?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn ctx() -> SessionContext {
		SessionContext {
			rules: std::sync::Arc::new(RuleEngine::new(Vec::new())),
			flows: std::sync::Arc::new(FlowRegistry::new()),
			bridge: Bridge::new(std::sync::Arc::new(FlowRegistry::new()), std::sync::Arc::new(RuleEngine::new(Vec::new()))),
			metrics: std::sync::Arc::new(Metrics::new(&mut prometheus_client::registry::Registry::default())),
			dial_timeouts: DialTimeouts { connect: Duration::from_secs(5), handshake: Duration::from_secs(5) },
			session_id: "test".into(),
			default_host: "example.test".into(),
			default_port: 80,
			scheme: "http",
			is_secure: false,
			protocol: Protocol::Http,
		}
	}

	fn parsed_get(target: &str) -> ParsedMessage {
		let mut p = Http1Parser::new(Kind::Request);
		p.feed(format!("GET {target} HTTP/1.1\r\nHost: example.test\r\n\r\n").as_bytes()).unwrap();
		p.take_message().unwrap()
	}

	#[test]
	fn origin_form_target_resolves_host_from_header() {
		let req = build_request(parsed_get("/foo?x=1"), &ctx()).unwrap();
		assert_eq!(req.host, "example.test");
		assert_eq!(req.path, "/foo");
		assert_eq!(req.query.as_deref(), Some("x=1"));
		assert_eq!(req.params.get("x"), Some("1"));
		assert_eq!(req.url, "http://example.test/foo?x=1");
	}

	#[test]
	fn absolute_form_target_overrides_default_host() {
		let mut p = Http1Parser::new(Kind::Request);
		p.feed(b"GET http://other.test:8080/bar HTTP/1.1\r\nHost: example.test\r\n\r\n").unwrap();
		let req = build_request(p.take_message().unwrap(), &ctx()).unwrap();
		assert_eq!(req.host, "other.test");
		assert_eq!(req.port, 8080);
		assert_eq!(req.path, "/bar");
	}

	#[test]
	fn keep_alive_defaults_true_on_http11_absent_connection_header() {
		assert!(wants_keep_alive("HTTP/1.1", &Headers::new(), &Headers::new()));
	}

	#[test]
	fn connection_close_on_either_side_ends_keep_alive() {
		let mut resp_headers = Headers::new();
		resp_headers.push("Connection", "close");
		assert!(!wants_keep_alive("HTTP/1.1", &Headers::new(), &resp_headers));
	}
}
