//! The canonical request/response exchange and its state machine (§3,
//! §4.6). `Flow`/`HttpRequest`/`HttpResponse` are the wire-facing data
//! model shared by the bridge (C9), HAR export, and the filter DSL (C10).

mod headers;
mod registry;

pub use headers::Headers;
pub use registry::FlowRegistry;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub type FlowId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
	Get,
	Head,
	Post,
	Put,
	Patch,
	Delete,
	Options,
	Trace,
	Connect,
}

impl Method {
	/// §4.3: requests with no `Content-Length` and one of these methods have
	/// no body regardless of other framing signals.
	pub fn implies_no_body_without_content_length(self) -> bool {
		matches!(self, Method::Get | Method::Head | Method::Delete | Method::Options | Method::Connect)
	}
}

impl std::str::FromStr for Method {
	type Err = ();

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(match s {
			"GET" => Method::Get,
			"HEAD" => Method::Head,
			"POST" => Method::Post,
			"PUT" => Method::Put,
			"PATCH" => Method::Patch,
			"DELETE" => Method::Delete,
			"OPTIONS" => Method::Options,
			"TRACE" => Method::Trace,
			"CONNECT" => Method::Connect,
			_ => return Err(()),
		})
	}
}

impl std::fmt::Display for Method {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			Method::Get => "GET",
			Method::Head => "HEAD",
			Method::Post => "POST",
			Method::Put => "PUT",
			Method::Patch => "PATCH",
			Method::Delete => "DELETE",
			Method::Options => "OPTIONS",
			Method::Trace => "TRACE",
			Method::Connect => "CONNECT",
		};
		f.write_str(s)
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
	Http,
	Https,
	Http2,
	WebSocket,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FlowState {
	#[default]
	Pending,
	Waiting,
	Receiving,
	Paused,
	Completed,
	Failed,
	Aborted,
}

/// Decoded body: raw bytes plus a best-effort UTF-8 decode exposed to the
/// UI. Wire-level code must only ever touch `bytes`; `text` exists solely
/// for display, never for re-parsing (§9 open question: forwarding must be
/// byte-exact).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Body {
	#[serde(with = "bytes_as_base64")]
	pub bytes: bytes::Bytes,
	pub text: Option<String>,
}

impl Body {
	pub fn from_bytes(bytes: bytes::Bytes) -> Self {
		let text = std::str::from_utf8(&bytes).ok().map(str::to_owned);
		Body { bytes, text }
	}

	pub fn empty() -> Self {
		Body::default()
	}
}

mod bytes_as_base64 {
	use base64::Engine;
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(bytes: &bytes::Bytes, s: S) -> Result<S::Ok, S::Error> {
		s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<bytes::Bytes, D::Error> {
		let s = String::deserialize(d)?;
		base64::engine::general_purpose::STANDARD
			.decode(s)
			.map(bytes::Bytes::from)
			.map_err(serde::de::Error::custom)
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequest {
	pub method: Method,
	pub url: String,
	pub scheme: String,
	pub host: String,
	pub port: u16,
	pub path: String,
	pub query: Option<String>,
	pub params: Headers,
	pub headers: Headers,
	pub body: Option<Body>,
	pub content_length: Option<u64>,
	#[serde(with = "time::serde::rfc3339")]
	pub timestamp: OffsetDateTime,
	pub is_secure: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timing {
	pub dns: Option<Duration>,
	pub tcp: Option<Duration>,
	pub tls: Option<Duration>,
	pub ttfb: Option<Duration>,
	pub download: Option<Duration>,
	pub total: Option<Duration>,
	pub wait: Option<Duration>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponse {
	pub status_code: u16,
	pub status_message: String,
	pub http_version: String,
	pub headers: Headers,
	pub body: Option<Body>,
	pub content_length: Option<u64>,
	pub was_compressed: bool,
	pub original_encoding: Option<String>,
	#[serde(with = "time::serde::rfc3339")]
	pub timestamp: OffsetDateTime,
	pub timing: Option<Timing>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
	pub from: FlowState,
	pub to: FlowState,
	#[serde(with = "time::serde::rfc3339")]
	pub at: OffsetDateTime,
	pub reason: Option<String>,
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowError {
	#[error("flow is already in a terminal state")]
	AlreadyTerminal,
	#[error("illegal state transition")]
	InvalidTransition,
	#[error("flow is not paused")]
	NotPaused,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
	pub id: FlowId,
	pub session_id: String,
	pub request: HttpRequest,
	pub response: Option<HttpResponse>,
	pub state: FlowState,
	pub protocol: Protocol,
	pub error: Option<String>,
	#[serde(with = "time::serde::rfc3339")]
	pub created_at: OffsetDateTime,
	#[serde(with = "time::serde::rfc3339")]
	pub updated_at: OffsetDateTime,
	pub is_marked: bool,
	pub tags: Vec<String>,
	pub notes: Option<String>,
	pub transitions: Vec<Transition>,
	/// Which breakpoint rule caused the current `Paused` state, if any.
	pub paused_by_rule: Option<String>,
	/// State to return to on `resume()`, captured when `pause()` runs — the
	/// source is ambiguous on where resume lands (§4.6 only says pause is
	/// legal "from Waiting or Receiving"), so we resolve it here: resuming
	/// returns the flow to whichever state it was paused from, letting the
	/// normal mutator sequence continue from there.
	#[serde(skip)]
	paused_from: FlowState,
}

fn is_terminal(state: FlowState) -> bool {
	matches!(state, FlowState::Completed | FlowState::Failed | FlowState::Aborted)
}

impl Flow {
	pub fn new(id: FlowId, session_id: String, request: HttpRequest, protocol: Protocol) -> Self {
		let now = OffsetDateTime::now_utc();
		Flow {
			id,
			session_id,
			request,
			response: None,
			state: FlowState::Pending,
			protocol,
			error: None,
			created_at: now,
			updated_at: now,
			is_marked: false,
			tags: Vec::new(),
			notes: None,
			transitions: Vec::new(),
			paused_by_rule: None,
			paused_from: FlowState::Pending,
		}
	}

	fn transition(&mut self, to: FlowState, reason: Option<String>) -> Result<(), FlowError> {
		if is_terminal(self.state) {
			return Err(FlowError::AlreadyTerminal);
		}
		let legal = matches!(
			(self.state, to),
			(FlowState::Pending, FlowState::Waiting)
				| (FlowState::Waiting, FlowState::Receiving)
				| (FlowState::Receiving, FlowState::Completed)
				| (FlowState::Pending, FlowState::Paused)
				| (FlowState::Waiting, FlowState::Paused)
				| (FlowState::Receiving, FlowState::Paused)
				| (FlowState::Paused, FlowState::Pending)
				| (FlowState::Paused, FlowState::Waiting)
				| (FlowState::Paused, FlowState::Receiving)
				| (FlowState::Paused, FlowState::Completed)
				| (FlowState::Paused, FlowState::Aborted)
				| (_, FlowState::Failed)
				| (_, FlowState::Aborted)
		);
		if !legal {
			return Err(FlowError::InvalidTransition);
		}
		let now = OffsetDateTime::now_utc();
		self.transitions.push(Transition {
			from: self.state,
			to,
			at: now,
			reason,
		});
		self.state = to;
		self.updated_at = now;
		Ok(())
	}

	/// Marks the request as received and moves the flow to `Waiting` (for
	/// an upstream response).
	pub fn record_request(&mut self) -> Result<(), FlowError> {
		self.transition(FlowState::Waiting, None)
	}

	/// Marks the response headers as received (`Receiving`); callers
	/// complete the transition to `Completed` once the body has been fully
	/// read by calling [`Flow::complete`].
	pub fn record_response(&mut self, response: HttpResponse) -> Result<(), FlowError> {
		self.response = Some(response);
		self.transition(FlowState::Receiving, None)
	}

	pub fn complete(&mut self) -> Result<(), FlowError> {
		self.transition(FlowState::Completed, None)
	}

	pub fn pause(&mut self, rule_id: impl Into<String>) -> Result<(), FlowError> {
		if !matches!(self.state, FlowState::Waiting | FlowState::Receiving | FlowState::Pending) {
			return Err(FlowError::InvalidTransition);
		}
		self.paused_from = self.state;
		self.paused_by_rule = Some(rule_id.into());
		self.transition(FlowState::Paused, None)
	}

	/// Resumes a paused flow. The caller applies any `modified` fields
	/// (request method/url/headers/body whitelist per §4.9) to
	/// `self.request`/`self.response` directly before or after calling this;
	/// this only transitions the flow back to the state it was paused from
	/// so the connection task's normal mutator sequence can continue.
	pub fn resume(&mut self) -> Result<(), FlowError> {
		if self.state != FlowState::Paused {
			return Err(FlowError::NotPaused);
		}
		let target = self.paused_from;
		self.paused_by_rule = None;
		self.transition(target, None)
	}

	pub fn kill(&mut self, reason: impl Into<String>) -> Result<(), FlowError> {
		self.transition(FlowState::Aborted, Some(reason.into()))
	}

	pub fn fail(&mut self, err: impl Into<String>) -> Result<(), FlowError> {
		let msg = err.into();
		self.error = Some(msg.clone());
		self.transition(FlowState::Failed, Some(msg))
	}

	pub fn is_terminal(&self) -> bool {
		is_terminal(self.state)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample_request() -> HttpRequest {
		HttpRequest {
			method: Method::Get,
			url: "http://example.test/".into(),
			scheme: "http".into(),
			host: "example.test".into(),
			port: 80,
			path: "/".into(),
			query: None,
			params: Headers::new(),
			headers: Headers::new(),
			body: None,
			content_length: None,
			timestamp: OffsetDateTime::now_utc(),
			is_secure: false,
		}
	}

	fn sample_response(status: u16) -> HttpResponse {
		HttpResponse {
			status_code: status,
			status_message: "OK".into(),
			http_version: "HTTP/1.1".into(),
			headers: Headers::new(),
			body: None,
			content_length: None,
			was_compressed: false,
			original_encoding: None,
			timestamp: OffsetDateTime::now_utc(),
			timing: None,
		}
	}

	#[test]
	fn legal_happy_path() {
		let mut flow = Flow::new(1, "s1".into(), sample_request(), Protocol::Http);
		flow.record_request().unwrap();
		assert_eq!(flow.state, FlowState::Waiting);
		flow.record_response(sample_response(200)).unwrap();
		assert_eq!(flow.state, FlowState::Receiving);
		flow.complete().unwrap();
		assert_eq!(flow.state, FlowState::Completed);
	}

	#[test]
	fn mutators_are_idempotent_on_terminal_states() {
		let mut flow = Flow::new(1, "s1".into(), sample_request(), Protocol::Http);
		flow.record_request().unwrap();
		flow.fail("boom").unwrap();
		assert_eq!(flow.state, FlowState::Failed);
		assert_eq!(flow.record_request(), Err(FlowError::AlreadyTerminal));
		assert_eq!(flow.fail("again"), Err(FlowError::AlreadyTerminal));
	}

	#[test]
	fn pause_then_resume_then_complete() {
		let mut flow = Flow::new(1, "s1".into(), sample_request(), Protocol::Http);
		flow.record_request().unwrap();
		flow.pause("rule-1").unwrap();
		assert_eq!(flow.state, FlowState::Paused);
		flow.resume().unwrap();
		flow.record_response(sample_response(200)).unwrap();
		flow.complete().unwrap();
		assert_eq!(flow.state, FlowState::Completed);
	}

	#[test]
	fn pause_then_kill() {
		let mut flow = Flow::new(1, "s1".into(), sample_request(), Protocol::Http);
		flow.record_request().unwrap();
		flow.pause("rule-1").unwrap();
		flow.kill("operator requested").unwrap();
		assert_eq!(flow.state, FlowState::Aborted);
	}
}
