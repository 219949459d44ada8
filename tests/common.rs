//! Shared scaffolding for the end-to-end tests in `tests/` (§8 scenarios).
//! Grounded on the teacher's `tests/common` helper module conventions, pared
//! down to this proxy's own engines instead of a full gateway bootstrap.

use std::sync::Arc;
use std::time::Duration;

use syrah::bridge::Bridge;
use syrah::flow::FlowRegistry;
use syrah::metrics::Metrics;
use syrah::proxy::http1_session::SessionContext;
use syrah::proxy::upstream::DialTimeouts;
use syrah::rules::{Action, Matcher, Phase, ProxyRule, RuleEngine, RuleType};

/// Builds a single-matcher rule with sensible defaults for the fields §8's
/// scenarios don't care about (priority, enablement, timestamps).
pub fn test_rule(id: &str, rule_type: RuleType, phase: Phase, matcher: Matcher, action: Action, priority: i32) -> ProxyRule {
	ProxyRule {
		id: id.to_string(),
		name: id.to_string(),
		rule_type,
		phase,
		matcher,
		action,
		is_enabled: true,
		priority,
		created_at: time::OffsetDateTime::UNIX_EPOCH,
		updated_at: time::OffsetDateTime::UNIX_EPOCH,
	}
}

/// Builds a fresh set of in-memory engines plus a plain-HTTP `SessionContext`
/// (as if the connection arrived on the forward-proxy listener, not via
/// CONNECT), wired together the way `ConnectionManager::handle_connection`
/// wires them for a real connection.
pub fn plain_http_context(rules: Vec<ProxyRule>) -> (SessionContext, Arc<FlowRegistry>, Arc<Bridge>) {
	let flows = Arc::new(FlowRegistry::new());
	let rule_engine = Arc::new(RuleEngine::new(rules));
	let bridge = Bridge::new(flows.clone(), rule_engine.clone());
	let metrics = Arc::new(Metrics::new(&mut prometheus_client::registry::Registry::default()));
	let ctx = SessionContext {
		rules: rule_engine,
		flows: flows.clone(),
		bridge: bridge.clone(),
		metrics,
		dial_timeouts: DialTimeouts { connect: Duration::from_secs(5), handshake: Duration::from_secs(5) },
		session_id: "test-session".into(),
		default_host: String::new(),
		default_port: 80,
		scheme: "http",
		is_secure: false,
		protocol: syrah::flow::Protocol::Http,
	};
	(ctx, flows, bridge)
}
