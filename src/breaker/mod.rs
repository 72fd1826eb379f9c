//! Circuit breakers: a two-step allow/report gate in front of a backend,
//! tripping on consecutive failures or on the failure count within a
//! sliding window of recent outcomes. What counts as a failure is the
//! caller's business.

pub mod registry;

use std::str::FromStr;
use std::sync::Mutex;

use thiserror::Error;

use crate::sampler::BinarySampler;
use crate::types::parse_flag_duration;
use crate::*;

pub use registry::BreakerRegistry;

const DEFAULT_FAILURES: usize = 5;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_HALF_OPEN_PROBES: usize = 5;
const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BreakerKind {
	/// Nothing configured at this tier; inherit from the next one.
	#[default]
	None,
	Consecutive,
	Rate,
	/// Explicitly suppress any inherited breaker.
	Disabled,
}

/// Unset fields (zero values) adopt the next tier during the merge
/// route ← host ← global.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct BreakerSettings {
	pub kind: BreakerKind,
	pub host: Strng,
	pub failures: usize,
	/// Sampler size for the rate breaker.
	pub window: usize,
	pub timeout: Duration,
	pub half_open_probes: usize,
	pub idle_ttl: Duration,
}

impl BreakerSettings {
	pub fn merge(self, base: &BreakerSettings) -> BreakerSettings {
		BreakerSettings {
			kind: if self.kind == BreakerKind::None {
				base.kind
			} else {
				self.kind
			},
			host: self.host,
			failures: if self.failures == 0 {
				base.failures
			} else {
				self.failures
			},
			window: if self.window == 0 { base.window } else { self.window },
			timeout: if self.timeout.is_zero() {
				base.timeout
			} else {
				self.timeout
			},
			half_open_probes: if self.half_open_probes == 0 {
				base.half_open_probes
			} else {
				self.half_open_probes
			},
			idle_ttl: if self.idle_ttl.is_zero() {
				base.idle_ttl
			} else {
				self.idle_ttl
			},
		}
	}

	fn normalized(mut self) -> BreakerSettings {
		if self.failures == 0 {
			self.failures = DEFAULT_FAILURES;
		}
		if self.window == 0 {
			self.window = 2 * self.failures;
		}
		if self.timeout.is_zero() {
			self.timeout = DEFAULT_TIMEOUT;
		}
		if self.half_open_probes == 0 {
			self.half_open_probes = DEFAULT_HALF_OPEN_PROBES;
		}
		if self.idle_ttl.is_zero() {
			self.idle_ttl = DEFAULT_IDLE_TTL;
		}
		self
	}
}

#[derive(Debug, Error, PartialEq)]
pub enum SettingsError {
	#[error("unknown breaker setting {0:?}")]
	UnknownKey(String),
	#[error("unknown breaker type {0:?}")]
	UnknownKind(String),
	#[error("invalid value for {key}: {value:?}")]
	InvalidValue { key: String, value: String },
	#[error("breaker setting {0:?} is not a key=value pair")]
	NotAPair(String),
}

/// `type=rate,host=api.example.org,failures=30,window=300,timeout=10s,half-open-requests=3,idle-ttl=1h`
impl FromStr for BreakerSettings {
	type Err = SettingsError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let mut out = BreakerSettings::default();
		for pair in s.split(',') {
			let pair = pair.trim();
			if pair.is_empty() {
				continue;
			}
			let (key, value) = pair
				.split_once('=')
				.ok_or_else(|| SettingsError::NotAPair(pair.to_string()))?;
			let invalid = || SettingsError::InvalidValue {
				key: key.to_string(),
				value: value.to_string(),
			};
			match key {
				"type" => {
					out.kind = match value {
						"consecutive" => BreakerKind::Consecutive,
						"rate" => BreakerKind::Rate,
						"disabled" => BreakerKind::Disabled,
						other => return Err(SettingsError::UnknownKind(other.to_string())),
					}
				},
				"host" => out.host = value.into(),
				"failures" => out.failures = value.parse().map_err(|_| invalid())?,
				"window" => out.window = value.parse().map_err(|_| invalid())?,
				"timeout" => out.timeout = parse_flag_duration(value).map_err(|_| invalid())?,
				"half-open-requests" => {
					out.half_open_probes = value.parse().map_err(|_| invalid())?
				},
				"idle-ttl" => out.idle_ttl = parse_flag_duration(value).map_err(|_| invalid())?,
				other => return Err(SettingsError::UnknownKey(other.to_string())),
			}
		}
		Ok(out)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
	Closed,
	Open,
	HalfOpen,
}

#[derive(Debug)]
enum Counter {
	Consecutive(usize),
	Rate(BinarySampler),
}

#[derive(Debug)]
struct Inner {
	state: State,
	changed: Instant,
	counter: Counter,
	half_open_inflight: usize,
	half_open_successes: usize,
}

#[derive(Debug)]
pub struct Breaker {
	settings: BreakerSettings,
	inner: Mutex<Inner>,
}

impl Breaker {
	pub fn new(settings: BreakerSettings) -> Breaker {
		let settings = settings.normalized();
		let counter = match settings.kind {
			BreakerKind::Rate => Counter::Rate(BinarySampler::new(settings.window)),
			_ => Counter::Consecutive(0),
		};
		Breaker {
			settings,
			inner: Mutex::new(Inner {
				state: State::Closed,
				changed: Instant::now(),
				counter,
				half_open_inflight: 0,
				half_open_successes: 0,
			}),
		}
	}

	pub fn settings(&self) -> &BreakerSettings {
		&self.settings
	}

	pub fn state(&self) -> State {
		self.inner.lock().unwrap().state
	}

	/// Gate before dispatch. On `true` the caller must call `done` exactly
	/// once; on `false` it must not dispatch.
	pub fn allow(&self) -> bool {
		let mut g = self.inner.lock().unwrap();
		match g.state {
			State::Closed => true,
			State::Open => {
				if g.changed.elapsed() < self.settings.timeout {
					return false;
				}
				g.state = State::HalfOpen;
				g.changed = Instant::now();
				g.half_open_successes = 0;
				// this admission is the first probe
				g.half_open_inflight = 1;
				true
			},
			State::HalfOpen => {
				if g.half_open_inflight >= self.settings.half_open_probes {
					return false;
				}
				g.half_open_inflight += 1;
				true
			},
		}
	}

	pub fn done(&self, success: bool) {
		let mut g = self.inner.lock().unwrap();
		match g.state {
			State::Closed => {
				let tripped = match &mut g.counter {
					Counter::Consecutive(n) => {
						if success {
							*n = 0;
						} else {
							*n += 1;
						}
						*n >= self.settings.failures
					},
					Counter::Rate(sampler) => {
						sampler.tick(!success);
						sampler.count() >= self.settings.failures
					},
				};
				if tripped {
					g.state = State::Open;
					g.changed = Instant::now();
				}
			},
			State::HalfOpen => {
				g.half_open_inflight = g.half_open_inflight.saturating_sub(1);
				if success {
					g.half_open_successes += 1;
					if g.half_open_successes >= self.settings.half_open_probes {
						g.state = State::Closed;
						g.changed = Instant::now();
						g.counter = match self.settings.kind {
							BreakerKind::Rate => Counter::Rate(BinarySampler::new(self.settings.window)),
							_ => Counter::Consecutive(0),
						};
					}
				} else {
					g.state = State::Open;
					g.changed = Instant::now();
				}
			},
			// a probe admitted before a concurrent reopen; its outcome no
			// longer matters
			State::Open => {},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn consecutive(failures: usize, timeout: Duration, probes: usize) -> Breaker {
		Breaker::new(BreakerSettings {
			kind: BreakerKind::Consecutive,
			host: "h".into(),
			failures,
			timeout,
			half_open_probes: probes,
			..Default::default()
		})
	}

	#[test]
	fn settings_grammar() {
		let s: BreakerSettings =
			"type=rate,host=api.example.org,failures=30,window=300,timeout=10s,half-open-requests=3,idle-ttl=1h"
				.parse()
				.unwrap();
		assert_eq!(s.kind, BreakerKind::Rate);
		assert_eq!(s.host, "api.example.org");
		assert_eq!(s.failures, 30);
		assert_eq!(s.window, 300);
		assert_eq!(s.timeout, Duration::from_secs(10));
		assert_eq!(s.half_open_probes, 3);
		assert_eq!(s.idle_ttl, Duration::from_secs(3600));

		// bare integer durations are milliseconds
		let s: BreakerSettings = "type=consecutive,timeout=15".parse().unwrap();
		assert_eq!(s.timeout, Duration::from_millis(15));

		assert!("type=bogus".parse::<BreakerSettings>().is_err());
		assert!("nope=1".parse::<BreakerSettings>().is_err());
		assert!("timeout".parse::<BreakerSettings>().is_err());
	}

	#[test]
	fn merge_fills_unset_fields_only() {
		let global: BreakerSettings = "type=rate,failures=50,window=500,timeout=30s".parse().unwrap();
		let host: BreakerSettings = "type=consecutive,host=a,failures=7".parse().unwrap();
		let merged = host.merge(&global);
		assert_eq!(merged.kind, BreakerKind::Consecutive);
		assert_eq!(merged.failures, 7);
		assert_eq!(merged.window, 500);
		assert_eq!(merged.timeout, Duration::from_secs(30));
		assert_eq!(merged.host, "a");
	}

	#[test]
	fn consecutive_trips_and_recovers() {
		let b = consecutive(3, Duration::from_millis(15), 3);
		for _ in 0..3 {
			assert!(b.allow());
			b.done(false);
		}
		assert_eq!(b.state(), State::Open);
		assert!(!b.allow());

		std::thread::sleep(Duration::from_millis(20));
		for _ in 0..3 {
			assert!(b.allow());
			b.done(true);
		}
		assert_eq!(b.state(), State::Closed);
		assert!(b.allow());
		b.done(true);
	}

	#[test]
	fn success_resets_the_consecutive_count() {
		let b = consecutive(3, Duration::from_secs(60), 1);
		b.done(false);
		b.done(false);
		b.done(true);
		b.done(false);
		b.done(false);
		assert_eq!(b.state(), State::Closed);
		b.done(false);
		assert_eq!(b.state(), State::Open);
	}

	#[test]
	fn half_open_caps_concurrent_probes() {
		let b = consecutive(1, Duration::from_millis(1), 2);
		b.done(false);
		assert_eq!(b.state(), State::Open);
		std::thread::sleep(Duration::from_millis(5));

		assert!(b.allow()); // first probe
		assert!(b.allow()); // second probe
		assert!(!b.allow()); // over the cap
		b.done(true);
		// a slot freed up again
		assert!(b.allow());
	}

	#[test]
	fn half_open_failure_reopens() {
		let b = consecutive(1, Duration::from_millis(1), 3);
		b.done(false);
		std::thread::sleep(Duration::from_millis(5));
		assert!(b.allow());
		b.done(true);
		assert!(b.allow());
		b.done(false);
		assert_eq!(b.state(), State::Open);
		assert!(!b.allow());
	}

	#[test]
	fn rate_breaker_uses_the_window() {
		let b = Breaker::new(BreakerSettings {
			kind: BreakerKind::Rate,
			host: "h".into(),
			failures: 3,
			window: 5,
			timeout: Duration::from_secs(60),
			..Default::default()
		});
		// failures spread thin enough never trip
		for _ in 0..10 {
			b.done(false);
			b.done(true);
			b.done(true);
			b.done(true);
			b.done(true);
			assert_eq!(b.state(), State::Closed);
		}
		// three failures within the five-wide window trip it
		b.done(false);
		b.done(true);
		b.done(false);
		assert_eq!(b.state(), State::Closed);
		b.done(false);
		assert_eq!(b.state(), State::Open);
	}
}
