//! The bridge protocol (§4.9): a length-framed JSON message bus between the
//! proxy core and an external UI. Grounded on `tokio_util::codec::{LengthDelimitedCodec,
//! Framed}` the way the teacher reaches for codec framing anywhere it needs a
//! message boundary over a raw `TcpStream` (its HTTP servers use
//! `hyper`/`management::hyper_helpers` instead, since they speak HTTP — this
//! is a bidirectional push/command bus, not request/response, so a raw framed
//! socket fits better). Command dispatch is a `#[serde(tag = "command")]`
//! enum with `deny_unknown_fields`, matching spec.md §9's design note to
//! "present a typed DTO at the boundary and reject unknown fields".

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use syrah_core::drain::DrainWatcher;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, oneshot};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use crate::flow::{Body, Flow, FlowId, FlowRegistry, Headers, Method};
use crate::rules::{ProxyRule, RuleEngine};

const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Outbound events are dropped, not buffered, when no UI is attached (§4.9
/// Delivery model) — a small bound keeps a momentarily-slow subscriber from
/// blocking the connection tasks that publish events, at the cost of the
/// subscriber observing a `Lagged` gap instead of unbounded backlog.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Outbound (proxy → UI) message, §4.9.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutboundMessage {
	Flow {
		id: FlowId,
		request: crate::flow::HttpRequest,
		response: Option<crate::flow::HttpResponse>,
		state: crate::flow::FlowState,
		intercepted: bool,
	},
	Pong,
	Status {
		status: &'static str,
		error: Option<String>,
	},
}

/// The whitelisted fields a `resume` command may overwrite (§4.9): method,
/// url, headers, body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ModifiedFields {
	pub method: Option<Method>,
	pub url: Option<String>,
	pub headers: Option<HashMap<String, String>>,
	pub body: Option<String>,
}

/// Inbound (UI → proxy) command, §4.9.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase", deny_unknown_fields)]
pub enum InboundCommand {
	Ping,
	Resume {
		#[serde(rename = "flowId")]
		flow_id: FlowId,
		modified: Option<ModifiedFields>,
	},
	Kill {
		#[serde(rename = "flowId")]
		flow_id: FlowId,
	},
	UpdateRules {
		rules: Vec<ProxyRule>,
	},
}

/// What a connection task paused on a breakpoint receives once the UI acts.
#[derive(Debug, Clone)]
pub enum ResumeCommand {
	Resume { modified: Option<ModifiedFields> },
	Kill { reason: String },
}

/// Applies a `resume` command's whitelisted fields to either the request or
/// the response side of a flow, whichever is still open (spec.md §4.9 does
/// not say which side `modified` targets when a flow can be paused in
/// either phase; resolved here as "whichever side hasn't been finalized
/// yet" so the same wire shape covers both phases — see DESIGN.md).
pub fn apply_modified(flow: &mut Flow, modified: ModifiedFields) {
	let headers_patch = modified.headers.map(|h| {
		let mut headers = Headers::new();
		for (k, v) in h {
			headers.push(k, v);
		}
		headers
	});
	let body_patch = modified.body.map(|b| Body::from_bytes(Bytes::from(b.into_bytes())));

	if flow.response.is_none() {
		if let Some(m) = modified.method {
			flow.request.method = m;
		}
		if let Some(u) = modified.url {
			flow.request.url = u;
		}
		if let Some(h) = headers_patch {
			flow.request.headers = h;
		}
		if let Some(b) = body_patch {
			flow.request.body = Some(b);
		}
	} else if let Some(resp) = flow.response.as_mut() {
		if let Some(h) = headers_patch {
			resp.headers = h;
		}
		if let Some(b) = body_patch {
			resp.body = Some(b);
		}
	}
}

/// Owns the broadcast of outbound flow events and the table of
/// breakpoint-waiters that `resume`/`kill` commands complete.
pub struct Bridge {
	events: broadcast::Sender<OutboundMessage>,
	flows: Arc<FlowRegistry>,
	rules: Arc<RuleEngine>,
	waiters: Mutex<HashMap<FlowId, oneshot::Sender<ResumeCommand>>>,
}

impl Bridge {
	pub fn new(flows: Arc<FlowRegistry>, rules: Arc<RuleEngine>) -> Arc<Bridge> {
		let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
		Arc::new(Bridge {
			events,
			flows,
			rules,
			waiters: Mutex::new(HashMap::new()),
		})
	}

	/// Publishes a flow's current state as an event. Dropped silently if no
	/// UI is subscribed (§4.9 Delivery model).
	pub fn emit_flow(&self, flow: &Flow, intercepted: bool) {
		let _ = self.events.send(OutboundMessage::Flow {
			id: flow.id,
			request: flow.request.clone(),
			response: flow.response.clone(),
			state: flow.state,
			intercepted,
		});
	}

	pub fn emit_status(&self, status: &'static str, error: Option<String>) {
		let _ = self.events.send(OutboundMessage::Status { status, error });
	}

	/// Registers a breakpoint wait for `flow_id`. The connection task awaits
	/// the returned receiver (racing it against connection/listener
	/// cancellation); it resolves once a `resume` or `kill` command for this
	/// flow arrives, or never if the UI disconnects without acting (§5:
	/// "paused flows have no intrinsic timeout").
	pub fn register_waiter(&self, flow_id: FlowId) -> oneshot::Receiver<ResumeCommand> {
		let (tx, rx) = oneshot::channel();
		self.waiters.lock().unwrap().insert(flow_id, tx);
		rx
	}

	/// Cancels a previously-registered waiter without resolving it (e.g. a
	/// connection task tearing down after its own error), so a stale entry
	/// doesn't linger in the table.
	pub fn forget_waiter(&self, flow_id: FlowId) {
		self.waiters.lock().unwrap().remove(&flow_id);
	}

	fn complete_waiter(&self, flow_id: FlowId, cmd: ResumeCommand) -> bool {
		match self.waiters.lock().unwrap().remove(&flow_id) {
			Some(tx) => {
				let _ = tx.send(cmd);
				true
			},
			None => false,
		}
	}

	/// Kill-notifies every outstanding waiter (§5 Cancellation: "paused
	/// flows with pending command waiters are kill-notified").
	pub fn kill_all_waiters(&self, reason: &str) {
		let waiters = std::mem::take(&mut *self.waiters.lock().unwrap());
		for (_, tx) in waiters {
			let _ = tx.send(ResumeCommand::Kill { reason: reason.to_string() });
		}
	}

	fn handle_command(&self, cmd: InboundCommand) -> Option<OutboundMessage> {
		match cmd {
			InboundCommand::Ping => Some(OutboundMessage::Pong),
			InboundCommand::Resume { flow_id, modified } => {
				if let Some(flow) = self.flows.get(flow_id) {
					let mut f = flow.write().unwrap();
					if let Some(m) = modified.clone() {
						apply_modified(&mut f, m);
					}
					let _ = f.resume();
				}
				self.complete_waiter(flow_id, ResumeCommand::Resume { modified });
				None
			},
			InboundCommand::Kill { flow_id } => {
				if let Some(flow) = self.flows.get(flow_id) {
					let _ = flow.write().unwrap().kill("killed by operator");
				}
				self.complete_waiter(flow_id, ResumeCommand::Kill { reason: "killed by operator".into() });
				None
			},
			InboundCommand::UpdateRules { rules } => {
				self.rules.update(rules);
				None
			},
		}
	}

	/// Runs the bridge's accept loop: one `Framed<TcpStream, LengthDelimitedCodec>`
	/// session per UI connection, each subscribing to the outbound broadcast
	/// and forwarding any parsed inbound command to [`Bridge::handle_command`].
	/// A 30-second ping timer enforces liveness per §4.9.
	pub async fn run(self: Arc<Self>, addr: SocketAddr, drain: DrainWatcher) -> std::io::Result<()> {
		let listener = TcpListener::bind(addr).await?;
		info!(%addr, "bridge listening");
		loop {
			tokio::select! {
				accepted = listener.accept() => {
					let (stream, peer) = accepted?;
					debug!(%peer, "bridge client connected");
					let bridge = self.clone();
					let conn_drain = drain.clone();
					tokio::spawn(async move {
						let blocker = conn_drain.wait_for_drain();
						tokio::select! {
							_ = bridge.serve_session(stream) => {}
							_ = blocker => {}
						}
						debug!(%peer, "bridge client disconnected");
					});
				}
				_ = drain.clone().wait_for_drain() => {
					info!("bridge accept loop draining");
					return Ok(());
				}
			}
		}
	}

	async fn serve_session(self: Arc<Self>, stream: tokio::net::TcpStream) {
		let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
		let mut rx = self.events.subscribe();
		let mut ping = tokio::time::interval(PING_INTERVAL);
		ping.tick().await; // first tick fires immediately; skip it

		loop {
			tokio::select! {
				frame = framed.next() => {
					let Some(frame) = frame else { return };
					let Ok(bytes) = frame else { return };
					match serde_json::from_slice::<InboundCommand>(&bytes) {
						Ok(cmd) => {
							if let Some(reply) = self.handle_command(cmd) {
								if send_json(&mut framed, &reply).await.is_err() {
									return;
								}
							}
						}
						Err(e) => warn!(error = %e, "malformed bridge command, ignoring"),
					}
				}
				event = rx.recv() => {
					match event {
						Ok(msg) => {
							if send_json(&mut framed, &msg).await.is_err() {
								return;
							}
						}
						Err(broadcast::error::RecvError::Lagged(n)) => {
							warn!(skipped = n, "bridge subscriber lagged, events dropped");
						}
						Err(broadcast::error::RecvError::Closed) => return,
					}
				}
				_ = ping.tick() => {
					// Liveness nudge; the UI is expected to reply with its own
					// ping/pong cadence. We don't require a reply to keep the
					// session open (reconnection backoff is the UI's job).
				}
			}
		}
	}
}

async fn send_json(
	framed: &mut Framed<tokio::net::TcpStream, LengthDelimitedCodec>,
	msg: &OutboundMessage,
) -> std::io::Result<()> {
	let bytes = serde_json::to_vec(msg)?;
	framed.send(Bytes::from(bytes)).await
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::flow::{HttpRequest, Protocol};
	use crate::rules::RuleEngine;

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
			timestamp: time::OffsetDateTime::now_utc(),
			is_secure: false,
		}
	}

	#[test]
	fn resume_command_applies_whitelisted_fields_and_wakes_waiter() {
		let flows = Arc::new(FlowRegistry::new());
		let rules = Arc::new(RuleEngine::new(Vec::new()));
		let bridge = Bridge::new(flows.clone(), rules);
		let flow = flows.create("s1".into(), sample_request(), Protocol::Http);
		flow.write().unwrap().record_request().unwrap();
		flow.write().unwrap().pause("bp").unwrap();
		let id = flow.read().unwrap().id;

		let rx = bridge.register_waiter(id);
		let mut headers = HashMap::new();
		headers.insert("X-Test".to_string(), "1".to_string());
		bridge.handle_command(InboundCommand::Resume {
			flow_id: id,
			modified: Some(ModifiedFields { method: None, url: None, headers: Some(headers), body: None }),
		});

		assert_eq!(flow.read().unwrap().request.headers.get("X-Test"), Some("1"));
		assert!(matches!(rx.try_recv().unwrap(), ResumeCommand::Resume { .. }));
	}

	#[test]
	fn kill_command_transitions_flow_to_aborted() {
		let flows = Arc::new(FlowRegistry::new());
		let rules = Arc::new(RuleEngine::new(Vec::new()));
		let bridge = Bridge::new(flows.clone(), rules);
		let flow = flows.create("s1".into(), sample_request(), Protocol::Http);
		flow.write().unwrap().record_request().unwrap();
		flow.write().unwrap().pause("bp").unwrap();
		let id = flow.read().unwrap().id;

		let rx = bridge.register_waiter(id);
		bridge.handle_command(InboundCommand::Kill { flow_id: id });

		assert_eq!(flow.read().unwrap().state, crate::flow::FlowState::Aborted);
		assert!(matches!(rx.try_recv().unwrap(), ResumeCommand::Kill { .. }));
	}

	#[test]
	fn update_rules_replaces_snapshot() {
		let flows = Arc::new(FlowRegistry::new());
		let rules = Arc::new(RuleEngine::new(Vec::new()));
		let bridge = Bridge::new(flows, rules.clone());
		let new_rule = ProxyRule {
			id: "r1".into(),
			name: "r1".into(),
			rule_type: crate::rules::RuleType::Block,
			phase: crate::rules::Phase::Request,
			matcher: crate::rules::Matcher::Host { host: "x.test".into() },
			action: crate::rules::Action::Block { status_code: 403, body: None },
			is_enabled: true,
			priority: 0,
			created_at: time::OffsetDateTime::now_utc(),
			updated_at: time::OffsetDateTime::now_utc(),
		};
		bridge.handle_command(InboundCommand::UpdateRules { rules: vec![new_rule] });
		assert_eq!(rules.hit_count("r1"), 0);
	}
}
