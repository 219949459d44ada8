//! On-demand leaf certificate cache (§4.2), keyed by host name.
//!
//! Concurrent lookups for a host that isn't cached yet must generate
//! exactly one certificate and let every caller share it — the same
//! "generation in progress" single-flight shape the teacher uses in
//! `control::caclient::CaClientInner` for its own cert refresh, built here
//! with a `tokio::sync::OnceCell` per host instead of the teacher's
//! watch-channel-based refresh loop (ours is generate-once-then-cache, not
//! periodically-refreshed).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use arcstr::ArcStr;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, trace};

use crate::ca::{CaError, CaMaterial, LeafMaterial};

struct Entries {
	map: HashMap<ArcStr, LeafMaterial>,
	order: VecDeque<ArcStr>,
}

pub struct LeafCache {
	ca: Arc<CaMaterial>,
	capacity: usize,
	validity: Duration,
	entries: RwLock<Entries>,
	inflight: Mutex<HashMap<ArcStr, Arc<OnceCell<Result<LeafMaterial, CaError>>>>>,
	evictions: AtomicU64,
}

impl LeafCache {
	pub fn new(ca: Arc<CaMaterial>, capacity: usize, validity: Duration) -> Self {
		Self {
			ca,
			capacity,
			validity,
			entries: RwLock::new(Entries {
				map: HashMap::new(),
				order: VecDeque::new(),
			}),
			inflight: Mutex::new(HashMap::new()),
			evictions: AtomicU64::new(0),
		}
	}

	/// Returns the cached leaf for `host`, generating one if absent.
	/// Idempotent and safe for concurrent callers on the same host.
	pub async fn get_or_generate(&self, host: &str) -> Result<LeafMaterial, CaError> {
		let host: ArcStr = host.into();
		if let Some(existing) = self.lookup(&host) {
			trace!(%host, "leaf cache hit");
			return Ok(existing);
		}

		let cell = {
			let mut inflight = self.inflight.lock().await;
			inflight
				.entry(host.clone())
				.or_insert_with(|| Arc::new(OnceCell::new()))
				.clone()
		};

		let result = cell
			.get_or_try_init(|| async {
				if let Some(existing) = self.lookup(&host) {
					return Ok(existing);
				}
				debug!(%host, "generating leaf certificate");
				let leaf = self.ca.sign_leaf(&host, &[host.to_string()], self.validity)?;
				self.insert(host.clone(), leaf.clone());
				Ok(leaf)
			})
			.await
			.cloned();

		self.inflight.lock().await.remove(&host);
		result
	}

	fn lookup(&self, host: &ArcStr) -> Option<LeafMaterial> {
		self.entries.read().unwrap().map.get(host).cloned()
	}

	fn insert(&self, host: ArcStr, leaf: LeafMaterial) {
		let mut entries = self.entries.write().unwrap();
		if entries.map.len() >= self.capacity {
			let evict_count = (self.capacity / 4).max(1);
			for _ in 0..evict_count {
				let Some(oldest) = entries.order.pop_front() else {
					break;
				};
				entries.map.remove(&oldest);
				self.evictions.fetch_add(1, Ordering::Relaxed);
			}
		}
		entries.order.push_back(host.clone());
		entries.map.insert(host, leaf);
	}

	/// Current number of cached leaf certificates, for the `leaf_cache_size` gauge.
	pub fn len(&self) -> usize {
		self.entries.read().unwrap().map.len()
	}

	/// Total entries evicted over the cache's lifetime, for the
	/// `leaf_cache_evictions_total` counter.
	pub fn evictions(&self) -> u64 {
		self.evictions.load(Ordering::Relaxed)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn test_ca() -> Arc<CaMaterial> {
		use std::sync::atomic::{AtomicU64, Ordering};
		static COUNTER: AtomicU64 = AtomicU64::new(0);
		let n = COUNTER.fetch_add(1, Ordering::Relaxed);
		let mut dir = std::env::temp_dir();
		dir.push(format!("syrah-leaf-test-{}-{n}", std::process::id()));
		Arc::new(CaMaterial::load_or_create(&dir).unwrap())
	}

	#[tokio::test]
	async fn same_host_resolves_to_same_cert() {
		let cache = LeafCache::new(test_ca(), 500, Duration::from_secs(86400 * 365));
		let a = cache.get_or_generate("example.test").await.unwrap();
		let b = cache.get_or_generate("example.test").await.unwrap();
		assert_eq!(a.cert_der, b.cert_der);
	}

	#[tokio::test]
	async fn concurrent_requests_single_flight() {
		let cache = Arc::new(LeafCache::new(test_ca(), 500, Duration::from_secs(3600)));
		let mut handles = Vec::new();
		for _ in 0..8 {
			let cache = cache.clone();
			handles.push(tokio::spawn(async move {
				cache.get_or_generate("concurrent.test").await.unwrap()
			}));
		}
		let mut results = Vec::new();
		for h in handles {
			results.push(h.await.unwrap());
		}
		for r in &results[1..] {
			assert_eq!(r.cert_der, results[0].cert_der);
		}
		assert_eq!(cache.len(), 1);
	}

	#[tokio::test]
	async fn eviction_drops_oldest_quarter_at_capacity() {
		let cache = LeafCache::new(test_ca(), 4, Duration::from_secs(3600));
		for i in 0..4 {
			cache.get_or_generate(&format!("host{i}.test")).await.unwrap();
		}
		assert_eq!(cache.len(), 4);
		cache.get_or_generate("host4.test").await.unwrap();
		// capacity (4) reached before inserting host4 -> evict 4/4.max(1)=1 oldest entry
		assert_eq!(cache.len(), 4);
		assert!(cache.lookup(&ArcStr::from("host0.test")).is_none());
	}
}
