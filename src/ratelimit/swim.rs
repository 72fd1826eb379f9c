//! Cluster rate limiting over a gossip fabric. Every node shares the oldest
//! timestamp of its local window per key; the cluster-wide request rate is
//! estimated from those and compared against the configured allowance.

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::sync::Mutex;

use super::RatelimitSettings;
use crate::*;

/// The gossip fabric seam. The production fabric is a peer-to-peer
/// membership protocol; an in-process implementation backs tests and
/// single-binary deployments.
pub trait Swarm: Debug + Send + Sync {
	/// Publish this node's oldest local admission for the key.
	fn share(&self, key: &str, oldest: SystemTime);
	/// Last shared value per node for the key, including this node's.
	fn values(&self, key: &str) -> HashMap<Strng, SystemTime>;
}

#[derive(Debug)]
pub struct InProcessSwarm {
	node: Strng,
	shared: Mutex<HashMap<Strng, HashMap<Strng, SystemTime>>>,
}

impl InProcessSwarm {
	pub fn new(node: &str) -> Arc<InProcessSwarm> {
		Arc::new(InProcessSwarm {
			node: node.into(),
			shared: Mutex::new(HashMap::new()),
		})
	}

	/// Test/peer hook: inject another node's shared value.
	pub fn inject(&self, key: &str, node: &str, oldest: SystemTime) {
		self
			.shared
			.lock()
			.unwrap()
			.entry(strng::new(key))
			.or_default()
			.insert(strng::new(node), oldest);
	}
}

impl Swarm for InProcessSwarm {
	fn share(&self, key: &str, oldest: SystemTime) {
		self
			.shared
			.lock()
			.unwrap()
			.entry(strng::new(key))
			.or_default()
			.insert(self.node.clone(), oldest);
	}

	fn values(&self, key: &str) -> HashMap<Strng, SystemTime> {
		self
			.shared
			.lock()
			.unwrap()
			.get(key)
			.cloned()
			.unwrap_or_default()
	}
}

#[derive(Debug)]
struct Ring {
	hits: VecDeque<SystemTime>,
	capacity: usize,
	touched: SystemTime,
}

impl Ring {
	/// Oldest admission, only once the ring carries a full window's worth;
	/// peers skip nodes that have not seen enough traffic yet.
	fn oldest_if_full(&self) -> Option<SystemTime> {
		if self.hits.len() >= self.capacity {
			self.hits.front().copied()
		} else {
			None
		}
	}

	fn record(&mut self, now: SystemTime) {
		while self.hits.len() >= self.capacity {
			self.hits.pop_front();
		}
		self.hits.push_back(now);
	}

	/// Per-node capacity follows the peer count; keep the newest entries.
	fn resize(&mut self, capacity: usize) {
		self.capacity = capacity;
		while self.hits.len() > capacity {
			self.hits.pop_front();
		}
	}
}

#[derive(Debug)]
pub struct SwimLimiter {
	settings: RatelimitSettings,
	swarm: Arc<dyn Swarm>,
	rings: Mutex<HashMap<Strng, Ring>>,
}

impl SwimLimiter {
	pub fn new(swarm: Arc<dyn Swarm>, settings: RatelimitSettings) -> SwimLimiter {
		SwimLimiter {
			settings: settings.normalized(),
			swarm,
			rings: Mutex::new(HashMap::new()),
		}
	}

	pub fn settings(&self) -> &RatelimitSettings {
		&self.settings
	}

	pub fn allow(&self, key: &str) -> bool {
		self.allow_at(key, SystemTime::now())
	}

	pub fn allow_at(&self, key: &str, now: SystemTime) -> bool {
		let mut rings = self.rings.lock().unwrap();
		let ring = rings.entry(strng::new(key)).or_insert_with(|| Ring {
			hits: VecDeque::new(),
			capacity: self.settings.max_hits.max(1),
			touched: now,
		});
		ring.touched = now;

		if let Some(oldest) = ring.oldest_if_full() {
			self.swarm.share(key, oldest);
		}
		let peers = self.swarm.values(key);
		// a node that knows no peers is a group of one: the estimate then
		// degrades to exactly the local window
		let peer_count = peers.len().max(1);
		let per_node = (self.settings.max_hits / peer_count).max(1);
		ring.resize(per_node);

		let rate = self.request_rate(now, per_node, &peers);
		let admit = rate < self.settings.max_hits as f64;
		if admit {
			ring.record(now);
		} else {
			debug!(
				key,
				rate,
				max_hits = self.settings.max_hits,
				"cluster rate estimate over allowance"
			);
		}
		admit
	}

	/// rate = Σ per_node / ((now − peer.oldest) / window). A zero or
	/// negative delta (clock skew, simultaneous share) charges the full
	/// per-node allowance rather than dividing by it.
	fn request_rate(
		&self,
		now: SystemTime,
		per_node: usize,
		peers: &HashMap<Strng, SystemTime>,
	) -> f64 {
		let window = self.settings.time_window.as_secs_f64();
		let mut rate = 0.0;
		for oldest in peers.values() {
			match now.duration_since(*oldest) {
				Ok(delta) if !delta.is_zero() && window > 0.0 => {
					rate += per_node as f64 / (delta.as_secs_f64() / window);
				},
				_ => rate += per_node as f64,
			}
		}
		rate
	}

	pub fn retry_after(&self, key: &str) -> Duration {
		self.retry_after_at(key, SystemTime::now())
	}

	pub fn retry_after_at(&self, key: &str, now: SystemTime) -> Duration {
		let rings = self.rings.lock().unwrap();
		match rings.get(key).and_then(|r| r.oldest_if_full()) {
			Some(oldest) => (oldest + self.settings.time_window)
				.duration_since(now)
				.unwrap_or(Duration::ZERO),
			None => Duration::ZERO,
		}
	}

	pub fn sweep(&self, now: SystemTime) {
		self
			.rings
			.lock()
			.unwrap()
			.retain(|_, ring| ring.touched + self.settings.clean_interval >= now);
	}
}
