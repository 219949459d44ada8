//! Rule matching, actions, and evaluation order (§4.7). Rules are held as
//! a copy-on-write snapshot — `updateRules` (§4.9) installs a brand new
//! `Arc<Vec<CompiledRule>>` atomically; in-flight evaluations keep using
//! the snapshot they started with, mirroring the "snapshot, don't mutate
//! in place" pattern the teacher uses for its route config (`store::binds`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::flow::{Headers, HttpRequest, HttpResponse, Method};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RuleType {
	Breakpoint,
	Block,
	MapLocal,
	MapRemote,
	Rewrite,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
	Request,
	Response,
	Both,
}

impl Phase {
	fn applies_to(self, phase: Phase) -> bool {
		self == Phase::Both || self == phase
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Matcher {
	UrlPattern { pattern: String, is_regex: bool },
	Host { host: String },
	Method { methods: Vec<Method> },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderRewrite {
	pub name: String,
	/// `None` removes the header; `Some` sets it (replacing prior values).
	pub value: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Action {
	Block {
		status_code: u16,
		body: Option<String>,
	},
	MapLocal {
		local_path: String,
		status_code: u16,
	},
	MapRemote {
		target_url: String,
		preserve_path: bool,
	},
	Breakpoint,
	RewriteHeader {
		request: Vec<HeaderRewrite>,
		response: Vec<HeaderRewrite>,
	},
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyRule {
	pub id: String,
	pub name: String,
	#[serde(rename = "type")]
	pub rule_type: RuleType,
	pub phase: Phase,
	pub matcher: Matcher,
	pub action: Action,
	pub is_enabled: bool,
	pub priority: i32,
	#[serde(with = "time::serde::rfc3339")]
	pub created_at: time::OffsetDateTime,
	#[serde(with = "time::serde::rfc3339")]
	pub updated_at: time::OffsetDateTime,
}

/// Outcome of evaluating one phase of rules against a flow.
#[derive(Debug, Clone)]
pub enum Decision {
	Continue,
	Short(HttpResponse),
	Redirect { new_upstream: String },
	Pause { rule_id: String },
}

struct CompiledRule {
	rule: ProxyRule,
	regex: Option<Regex>,
	disabled_reason: Option<String>,
}

/// Translates the spec's restricted glob (`*` = run of non-`/`, `**` =
/// anything) into an anchored regex. Patterns without any `*` fall back to
/// plain substring matching (handled by the caller, not here).
fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
	let mut out = String::from("^");
	let mut chars = pattern.chars().peekable();
	while let Some(c) = chars.next() {
		match c {
			'*' => {
				if chars.peek() == Some(&'*') {
					chars.next();
					out.push_str(".*");
				} else {
					out.push_str("[^/]*");
				}
			},
			_ => out.push_str(&regex::escape(&c.to_string())),
		}
	}
	out.push('$');
	Regex::new(&out)
}

impl CompiledRule {
	fn compile(rule: ProxyRule) -> CompiledRule {
		let mut regex = None;
		let mut disabled_reason = None;
		if let Matcher::UrlPattern { pattern, is_regex } = &rule.matcher {
			// Plain substrings need no compiled matcher; only a regex matcher
			// or a glob containing `*` is compiled here.
			let compiled = if *is_regex {
				Some(Regex::new(pattern))
			} else if pattern.contains('*') {
				Some(glob_to_regex(pattern))
			} else {
				None
			};
			match compiled {
				Some(Ok(re)) => regex = Some(re),
				Some(Err(e)) => {
					warn!(rule = %rule.id, error = %e, "disabling rule: bad matcher pattern");
					disabled_reason = Some(format!("bad pattern: {e}"));
				},
				None => {},
			}
		}
		CompiledRule {
			rule,
			regex,
			disabled_reason,
		}
	}

	fn matches(&self, request: &HttpRequest) -> bool {
		match &self.rule.matcher {
			Matcher::Host { host } => request.host.eq_ignore_ascii_case(host),
			Matcher::Method { methods } => methods.contains(&request.method),
			Matcher::UrlPattern { pattern, is_regex } => {
				if let Some(re) = &self.regex {
					re.is_match(&request.path)
				} else if *is_regex {
					false // compile failed; rule already disabled
				} else {
					request.path.contains(pattern.as_str())
				}
			},
		}
	}
}

pub struct RuleEngine {
	snapshot: RwLock<Arc<Vec<CompiledRule>>>,
	hit_counts: RwLock<HashMap<String, Arc<AtomicU64>>>,
}

impl RuleEngine {
	pub fn new(rules: Vec<ProxyRule>) -> Self {
		let engine = RuleEngine {
			snapshot: RwLock::new(Arc::new(Vec::new())),
			hit_counts: RwLock::new(HashMap::new()),
		};
		engine.update(rules);
		engine
	}

	/// Installs a wholesale-new rule snapshot (§4.9 `updateRules`).
	/// In-flight `evaluate` calls keep the `Arc` they already cloned.
	pub fn update(&self, rules: Vec<ProxyRule>) {
		let compiled: Vec<CompiledRule> = rules.into_iter().map(CompiledRule::compile).collect();
		let mut hits = self.hit_counts.write().unwrap();
		hits.retain(|id, _| compiled.iter().any(|c| &c.rule.id == id));
		for c in &compiled {
			hits.entry(c.rule.id.clone()).or_insert_with(|| Arc::new(AtomicU64::new(0)));
		}
		drop(hits);
		*self.snapshot.write().unwrap() = Arc::new(compiled);
	}

	pub fn hit_count(&self, rule_id: &str) -> u64 {
		self
			.hit_counts
			.read()
			.unwrap()
			.get(rule_id)
			.map(|c| c.load(Ordering::Relaxed))
			.unwrap_or(0)
	}

	fn record_hit(&self, rule_id: &str) {
		if let Some(c) = self.hit_counts.read().unwrap().get(rule_id) {
			c.fetch_add(1, Ordering::Relaxed);
		}
	}

	/// Evaluates enabled rules in priority-descending, insertion-order-tied
	/// order. `RewriteHeader` actions are applied cumulatively in place
	/// and never short-circuit; the first other non-`Continue` decision
	/// wins.
	pub fn evaluate(
		&self,
		phase: Phase,
		request: &mut HttpRequest,
		mut response: Option<&mut HttpResponse>,
	) -> Decision {
		let snapshot = self.snapshot.read().unwrap().clone();
		let mut candidates: Vec<&CompiledRule> = snapshot
			.iter()
			.filter(|c| c.rule.is_enabled && c.disabled_reason.is_none() && c.rule.phase.applies_to(phase))
			.collect();
		candidates.sort_by(|a, b| b.rule.priority.cmp(&a.rule.priority));

		for compiled in candidates {
			if !compiled.matches(request) {
				continue;
			}
			match &compiled.rule.action {
				Action::RewriteHeader { request: req_rw, response: resp_rw } => {
					for rw in req_rw {
						apply_header_rewrite(&mut request.headers, rw);
					}
					if let Some(resp) = response.as_deref_mut() {
						for rw in resp_rw {
							apply_header_rewrite(&mut resp.headers, rw);
						}
					}
					self.record_hit(&compiled.rule.id);
					continue;
				},
				Action::Block { status_code, body } => {
					self.record_hit(&compiled.rule.id);
					return Decision::Short(block_response(*status_code, body.clone()));
				},
				Action::MapLocal { local_path, status_code } => {
					self.record_hit(&compiled.rule.id);
					return Decision::Short(map_local_response(local_path, *status_code));
				},
				Action::MapRemote { target_url, .. } => {
					self.record_hit(&compiled.rule.id);
					return Decision::Redirect {
						new_upstream: target_url.clone(),
					};
				},
				Action::Breakpoint => {
					self.record_hit(&compiled.rule.id);
					return Decision::Pause {
						rule_id: compiled.rule.id.clone(),
					};
				},
			}
		}
		Decision::Continue
	}
}

fn apply_header_rewrite(headers: &mut Headers, rw: &HeaderRewrite) {
	match &rw.value {
		Some(v) => headers.set(rw.name.clone(), v.clone()),
		None => headers.remove(&rw.name),
	}
}

fn block_response(status_code: u16, body: Option<String>) -> HttpResponse {
	let body_bytes = body.unwrap_or_default();
	let mut headers = Headers::new();
	headers.push("Content-Length", body_bytes.len().to_string());
	HttpResponse {
		status_code,
		status_message: reason_phrase(status_code).to_string(),
		http_version: "HTTP/1.1".into(),
		headers,
		body: Some(crate::flow::Body::from_bytes(body_bytes.into())),
		content_length: Some(body_bytes.len() as u64),
		was_compressed: false,
		original_encoding: None,
		timestamp: time::OffsetDateTime::now_utc(),
		timing: None,
	}
}

fn map_local_response(local_path: &str, status_code: u16) -> HttpResponse {
	let bytes = std::fs::read(local_path).unwrap_or_default();
	let mut headers = Headers::new();
	headers.push("Content-Length", bytes.len().to_string());
	HttpResponse {
		status_code,
		status_message: reason_phrase(status_code).to_string(),
		http_version: "HTTP/1.1".into(),
		headers,
		content_length: Some(bytes.len() as u64),
		body: Some(crate::flow::Body::from_bytes(bytes.into())),
		was_compressed: false,
		original_encoding: None,
		timestamp: time::OffsetDateTime::now_utc(),
		timing: None,
	}
}

fn reason_phrase(status: u16) -> &'static str {
	match status {
		200 => "OK",
		204 => "No Content",
		301 => "Moved Permanently",
		302 => "Found",
		400 => "Bad Request",
		403 => "Forbidden",
		404 => "Not Found",
		418 => "I'm a teapot",
		500 => "Internal Server Error",
		_ => "",
	}
}
