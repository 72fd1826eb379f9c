use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::*;

/// Entries idle longer than this with no in-flight requests are recycled on
/// the next table publish.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Weighted ramp-up parameters for a freshly detected endpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FadeIn {
	pub duration: Duration,
	pub exponent: f64,
}

/// Shared per-host metrics. Handles are stable: every route referencing the
/// host, the load balancer, and the breaker reporting path all observe the
/// same counters.
#[derive(Debug)]
pub struct EndpointMetrics {
	detected: Mutex<SystemTime>,
	last_seen: Mutex<SystemTime>,
	inflight: AtomicI64,
	fade_in: Mutex<HashMap<Strng, FadeIn>>,
}

impl EndpointMetrics {
	fn new(now: SystemTime) -> Self {
		EndpointMetrics {
			detected: Mutex::new(now),
			last_seen: Mutex::new(now),
			inflight: AtomicI64::new(0),
			fade_in: Mutex::new(HashMap::new()),
		}
	}

	pub fn detected(&self) -> SystemTime {
		*self.detected.lock().unwrap()
	}

	pub fn set_detected(&self, t: SystemTime) {
		*self.detected.lock().unwrap() = t;
	}

	pub fn last_seen(&self) -> SystemTime {
		*self.last_seen.lock().unwrap()
	}

	pub fn touch(&self, now: SystemTime) {
		*self.last_seen.lock().unwrap() = now;
	}

	pub fn inflight(&self) -> i64 {
		self.inflight.load(Ordering::Relaxed)
	}

	pub fn inc_inflight(&self) {
		self.inflight.fetch_add(1, Ordering::Relaxed);
	}

	/// The counter never goes below zero, even if a release races a recycle.
	pub fn dec_inflight(&self) {
		let _ = self
			.inflight
			.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
				Some((v - 1).max(0))
			});
	}

	pub fn fade_in(&self, route: &str) -> Option<FadeIn> {
		self.fade_in.lock().unwrap().get(route).copied()
	}

	pub fn set_fade_in(&self, route: Strng, params: FadeIn) {
		self.fade_in.lock().unwrap().insert(route, params);
	}

	/// Load-balancing weight in (0, 1]. Warm endpoints (older than the
	/// configured fade-in duration, or without fade-in at all) weigh 1.
	pub fn fade_weight(&self, route: &str, now: SystemTime) -> f64 {
		let Some(f) = self.fade_in(route) else {
			return 1.0;
		};
		if f.duration.is_zero() {
			return 1.0;
		}
		let age = now
			.duration_since(self.detected())
			.unwrap_or(Duration::ZERO);
		if age >= f.duration {
			return 1.0;
		}
		let ratio = age.as_secs_f64() / f.duration.as_secs_f64();
		// keep a cold endpoint reachable
		ratio.powf(f.exponent).max(0.01)
	}
}

/// What one published route asserts about one load-balanced endpoint; the
/// registry consumes these in its post-process walk.
#[derive(Debug, Clone)]
pub struct EndpointRef {
	pub host: Strng,
	pub route: Strng,
	pub fade_in: Option<FadeIn>,
	pub created: Option<SystemTime>,
}

#[derive(Debug, Default)]
pub struct EndpointRegistry {
	entries: Mutex<HashMap<Strng, Arc<EndpointMetrics>>>,
}

impl EndpointRegistry {
	pub fn new() -> Arc<EndpointRegistry> {
		Arc::new(EndpointRegistry::default())
	}

	/// Fetch or create the entry for a host. New entries are detected now.
	pub fn metrics(&self, host: &Strng) -> Arc<EndpointMetrics> {
		let mut entries = self.entries.lock().unwrap();
		entries
			.entry(host.clone())
			.or_insert_with(|| Arc::new(EndpointMetrics::new(SystemTime::now())))
			.clone()
	}

	pub fn get(&self, host: &str) -> Option<Arc<EndpointMetrics>> {
		self.entries.lock().unwrap().get(host).cloned()
	}

	pub fn len(&self) -> usize {
		self.entries.lock().unwrap().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Table-publish walk. Referenced hosts are created or revived, their
	/// last-seen stamps refreshed, and fade-in assertions applied; entries
	/// nothing references anymore are recycled once idle and quiescent.
	pub fn post_process(&self, refs: &[EndpointRef], now: SystemTime) {
		let mut entries = self.entries.lock().unwrap();
		let mut referenced: HashSet<Strng> = HashSet::new();
		for r in refs {
			referenced.insert(r.host.clone());
			let stale = entries.get(&r.host).is_some_and(|e| {
				e.inflight() == 0 && e.last_seen() + IDLE_TIMEOUT < now
			});
			if stale {
				// gone long enough that this counts as a new endpoint
				entries.remove(&r.host);
			}
			let entry = entries
				.entry(r.host.clone())
				.or_insert_with(|| Arc::new(EndpointMetrics::new(now)));
			entry.touch(now);
			if let Some(f) = r.fade_in {
				entry.set_fade_in(r.route.clone(), f);
			}
			if let Some(created) = r.created {
				// an assertion newer than what we saw means the endpoint was
				// replaced in place
				if created > entry.detected() {
					entry.set_detected(created);
				}
			}
		}
		entries.retain(|host, e| {
			referenced.contains(host) || e.inflight() > 0 || e.last_seen() + IDLE_TIMEOUT >= now
		});
	}
}

/// Registry key for an endpoint URL: `host:port`, with the port defaulted
/// from the scheme.
pub fn endpoint_key(url: &str) -> Option<Strng> {
	let uri: ::http::Uri = url.parse().ok()?;
	let host = uri.host()?;
	let port = uri.port_u16().unwrap_or(match uri.scheme_str() {
		Some("https") => 443,
		_ => 80,
	});
	Some(strng::format!("{host}:{port}"))
}
