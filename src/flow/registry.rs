//! Flow registry: id → flow, single-writer (owning connection task),
//! multi-reader (bridge) per §5 Shared Resources — fine-grained `RwLock`
//! per entry inside a map, mirroring the locking granularity the teacher
//! uses for its discovery/bind stores (`store::binds`/`store::discovery`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use super::{Flow, FlowId, HttpRequest, Protocol};

#[derive(Default)]
pub struct FlowRegistry {
	next_id: AtomicU64,
	flows: RwLock<HashMap<FlowId, Arc<RwLock<Flow>>>>,
}

impl FlowRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Allocates a fresh monotonic id, constructs a `Flow`, and registers it.
	pub fn create(&self, session_id: String, request: HttpRequest, protocol: Protocol) -> Arc<RwLock<Flow>> {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
		let flow = Arc::new(RwLock::new(Flow::new(id, session_id, request, protocol)));
		self.flows.write().unwrap().insert(id, flow.clone());
		flow
	}

	pub fn get(&self, id: FlowId) -> Option<Arc<RwLock<Flow>>> {
		self.flows.read().unwrap().get(&id).cloned()
	}

	pub fn remove(&self, id: FlowId) -> Option<Arc<RwLock<Flow>>> {
		self.flows.write().unwrap().remove(&id)
	}

	pub fn all(&self) -> Vec<Arc<RwLock<Flow>>> {
		self.flows.read().unwrap().values().cloned().collect()
	}

	pub fn len(&self) -> usize {
		self.flows.read().unwrap().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Transitions every still-open flow to `Aborted` (listener shutdown,
	/// §5 Cancellation semantics).
	pub fn abort_all(&self, reason: &str) {
		for flow in self.all() {
			let mut f = flow.write().unwrap();
			if !f.is_terminal() {
				let _ = f.kill(reason.to_string());
			}
		}
	}
}
