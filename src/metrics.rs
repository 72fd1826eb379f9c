use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::*;

/// Counters and gauges the core emits. Everything else observable comes out
/// of structured logs.
#[derive(Debug, Default)]
pub struct Metrics {
	/// Connections currently parked in the admission queue.
	pub queue_depth: Gauge,
	/// Connections dropped because the queue was full.
	pub queue_evicted: Counter,
	/// Connections dropped because they waited past the queue timeout.
	pub queue_timeouts: Counter,
	/// Route definitions dropped at compile time.
	pub routes_invalid: Counter,
	/// Routes in the currently published table.
	pub routes_active: Gauge,
	pub breaker_opens: Counter,
	pub breaker_rejected: Counter,
	pub ratelimit_rejected: Counter,
	pub loopback_exceeded: Counter,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Arc<Metrics> {
		let m = Metrics::default();
		registry.register(
			"admission_queue_depth",
			"Connections waiting in the admission queue",
			m.queue_depth.clone(),
		);
		registry.register(
			"admission_queue_evicted",
			"Connections evicted from a full admission queue",
			m.queue_evicted.clone(),
		);
		registry.register(
			"admission_queue_timeouts",
			"Connections dropped after exceeding the queue timeout",
			m.queue_timeouts.clone(),
		);
		registry.register(
			"route_invalid",
			"Route definitions dropped during compilation",
			m.routes_invalid.clone(),
		);
		registry.register(
			"route_active",
			"Routes in the published table",
			m.routes_active.clone(),
		);
		registry.register(
			"breaker_opens",
			"Circuit breaker transitions into open",
			m.breaker_opens.clone(),
		);
		registry.register(
			"breaker_rejected",
			"Requests rejected by an open circuit breaker",
			m.breaker_rejected.clone(),
		);
		registry.register(
			"ratelimit_rejected",
			"Requests rejected by a rate limiter",
			m.ratelimit_rejected.clone(),
		);
		registry.register(
			"loopback_exceeded",
			"Requests terminated for exceeding the loopback budget",
			m.loopback_exceeded.clone(),
		);
		Arc::new(m)
	}
}
