//! Breaker instance registry: merges settings through the configuration
//! tiers, caches instances by effective settings, and recycles idle ones via
//! an access list ordered by last use. The list is an arena-backed doubly
//! linked list so move-to-tail is O(1) and the idle sweep unlinks a head
//! prefix in one pass.

use std::collections::HashMap;
use std::sync::Mutex;

use super::{Breaker, BreakerKind, BreakerSettings};
use crate::*;

struct Node {
	settings: BreakerSettings,
	breaker: Arc<Breaker>,
	last_access: Instant,
	prev: Option<usize>,
	next: Option<usize>,
}

impl Node {
	fn idle(&self, now: Instant) -> bool {
		now.duration_since(self.last_access) > self.breaker.settings().idle_ttl
	}
}

#[derive(Default)]
struct List {
	lookup: HashMap<BreakerSettings, usize>,
	arena: Vec<Option<Node>>,
	free: Vec<usize>,
	head: Option<usize>,
	tail: Option<usize>,
}

impl List {
	fn node(&self, idx: usize) -> &Node {
		self.arena[idx].as_ref().expect("linked node exists")
	}

	fn node_mut(&mut self, idx: usize) -> &mut Node {
		self.arena[idx].as_mut().expect("linked node exists")
	}

	fn unlink(&mut self, idx: usize) {
		let (prev, next) = {
			let n = self.node_mut(idx);
			(n.prev.take(), n.next.take())
		};
		match prev {
			Some(p) => self.node_mut(p).next = next,
			None => self.head = next,
		}
		match next {
			Some(n) => self.node_mut(n).prev = prev,
			None => self.tail = prev,
		}
	}

	fn push_tail(&mut self, idx: usize) {
		self.node_mut(idx).prev = self.tail;
		self.node_mut(idx).next = None;
		match self.tail {
			Some(t) => self.node_mut(t).next = Some(idx),
			None => self.head = Some(idx),
		}
		self.tail = Some(idx);
	}

	fn remove(&mut self, idx: usize) {
		self.unlink(idx);
		let node = self.arena[idx].take().expect("linked node exists");
		self.lookup.remove(&node.settings);
		self.free.push(idx);
	}

	fn insert(&mut self, node: Node) -> usize {
		let settings = node.settings.clone();
		let idx = match self.free.pop() {
			Some(i) => {
				self.arena[i] = Some(node);
				i
			},
			None => {
				self.arena.push(Some(node));
				self.arena.len() - 1
			},
		};
		self.lookup.insert(settings, idx);
		self.push_tail(idx);
		idx
	}

	/// Drop the contiguous idle prefix. Entries further down the list were
	/// used more recently, so the first non-idle node ends the sweep.
	fn sweep_idle_head(&mut self, now: Instant) {
		while let Some(h) = self.head {
			if !self.node(h).idle(now) {
				break;
			}
			self.remove(h);
		}
	}
}

pub struct BreakerRegistry {
	global: Option<BreakerSettings>,
	hosts: HashMap<Strng, BreakerSettings>,
	list: Mutex<List>,
}

impl BreakerRegistry {
	/// Settings with a host become that host's tier; at most one entry
	/// without a host is the global tier.
	pub fn new(settings: Vec<BreakerSettings>) -> BreakerRegistry {
		let mut global = None;
		let mut hosts = HashMap::new();
		for s in settings {
			if s.host.is_empty() {
				global = Some(s);
			} else {
				hosts.insert(s.host.clone(), s);
			}
		}
		BreakerRegistry {
			global,
			hosts,
			list: Mutex::new(List::default()),
		}
	}

	fn effective(&self, host: &Strng, route: Option<&BreakerSettings>) -> BreakerSettings {
		let mut s = route.cloned().unwrap_or_default();
		s.host = host.clone();
		if let Some(h) = self.hosts.get(host) {
			s = s.merge(h);
		}
		if let Some(g) = &self.global {
			s = s.merge(g);
		}
		s
	}

	/// The breaker guarding `host`, if one is configured. Idle instances are
	/// replaced fresh, which also intentionally clears stale trip state.
	pub fn get(&self, host: &Strng, route: Option<&BreakerSettings>) -> Option<Arc<Breaker>> {
		if host.is_empty() {
			return None;
		}
		let settings = self.effective(host, route);
		match settings.kind {
			BreakerKind::None | BreakerKind::Disabled => return None,
			BreakerKind::Consecutive | BreakerKind::Rate => {},
		}

		let now = Instant::now();
		let mut list = self.list.lock().unwrap();
		if let Some(&idx) = list.lookup.get(&settings) {
			if list.node(idx).idle(now) {
				list.remove(idx);
			} else {
				list.unlink(idx);
				list.node_mut(idx).last_access = now;
				list.push_tail(idx);
				return Some(list.node(idx).breaker.clone());
			}
		}

		list.sweep_idle_head(now);
		let breaker = Arc::new(Breaker::new(settings.clone()));
		list.insert(Node {
			settings,
			breaker: breaker.clone(),
			last_access: now,
			prev: None,
			next: None,
		});
		Some(breaker)
	}

	pub fn len(&self) -> usize {
		self.list.lock().unwrap().lookup.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}
