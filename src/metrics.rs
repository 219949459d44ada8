//! Process metrics, grounded on the teacher's `telemetry::metrics::Metrics`
//! (`prometheus_client::Registry` + `Family`/`Counter`/`Histogram`), trimmed
//! to the counters this proxy actually has: accepted connections, flows by
//! terminal state, rule hit counts, and leaf-cache size/evictions.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct FlowStateLabel {
	pub state: String,
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct RuleLabel {
	pub rule_id: String,
}

pub struct Metrics {
	pub connections_accepted: Counter,
	pub connections_intercepted: Counter,
	pub connections_tunneled: Counter,
	pub flows_by_state: Family<FlowStateLabel, Counter>,
	pub rule_hits: Family<RuleLabel, Counter>,
	pub leaf_cache_size: Gauge,
	pub leaf_cache_evictions: Counter,
	pub flow_duration_seconds: Histogram,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Self {
		let connections_accepted = Counter::default();
		registry.register(
			"syrah_connections_accepted",
			"Total client connections accepted by the listener",
			connections_accepted.clone(),
		);
		let connections_intercepted = Counter::default();
		registry.register(
			"syrah_connections_intercepted",
			"Total CONNECT tunnels that had TLS terminated for interception",
			connections_intercepted.clone(),
		);
		let connections_tunneled = Counter::default();
		registry.register(
			"syrah_connections_tunneled",
			"Total CONNECT tunnels blindly spliced without interception",
			connections_tunneled.clone(),
		);
		let flows_by_state: Family<FlowStateLabel, Counter> = Family::default();
		registry.register(
			"syrah_flows_total",
			"Total flows reaching a given terminal state",
			flows_by_state.clone(),
		);
		let rule_hits: Family<RuleLabel, Counter> = Family::default();
		registry.register("syrah_rule_hits_total", "Total non-Continue rule decisions, by rule id", rule_hits.clone());
		let leaf_cache_size = Gauge::default();
		registry.register("syrah_leaf_cache_size", "Current number of cached leaf certificates", leaf_cache_size.clone());
		let leaf_cache_evictions = Counter::default();
		registry.register(
			"syrah_leaf_cache_evictions_total",
			"Total leaf cache entries evicted",
			leaf_cache_evictions.clone(),
		);
		let flow_duration_seconds = Histogram::new([0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0].into_iter());
		registry.register(
			"syrah_flow_duration_seconds",
			"Wall-clock duration from flow creation to its terminal state",
			flow_duration_seconds.clone(),
		);
		Metrics {
			connections_accepted,
			connections_intercepted,
			connections_tunneled,
			flows_by_state,
			rule_hits,
			leaf_cache_size,
			leaf_cache_evictions,
			flow_duration_seconds,
		}
	}

	pub fn record_flow_terminal(&self, state: crate::flow::FlowState, duration_secs: f64) {
		let label = FlowStateLabel { state: format!("{state:?}").to_ascii_lowercase() };
		self.flows_by_state.get_or_create(&label).inc();
		self.flow_duration_seconds.observe(duration_secs);
	}
}
