//! Rate limiting: one allow/retry-after contract over three
//! implementations: a local sliding window, a gossip-aggregated cluster
//! estimate, and a Redis-backed sorted set.

pub mod local;
pub mod redis;
pub mod swim;

use std::str::FromStr;

use thiserror::Error;

use crate::types::parse_flag_duration;
use crate::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RatelimitKind {
	#[default]
	Disabled,
	/// Per client, this instance only.
	Local,
	/// Per backend, this instance only.
	Service,
	/// Per backend, shared across the cluster.
	ClusterService,
	/// Per client, shared across the cluster.
	ClusterClient,
}

impl RatelimitKind {
	pub fn is_client(&self) -> bool {
		matches!(self, RatelimitKind::Local | RatelimitKind::ClusterClient)
	}

	pub fn is_cluster(&self) -> bool {
		matches!(
			self,
			RatelimitKind::ClusterService | RatelimitKind::ClusterClient
		)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RatelimitSettings {
	pub kind: RatelimitKind,
	pub max_hits: usize,
	pub time_window: Duration,
	pub clean_interval: Duration,
	/// Logical bucket shared across cluster members; empty means the
	/// backend host scopes the limit.
	pub group: Strng,
}

impl Default for RatelimitSettings {
	fn default() -> Self {
		RatelimitSettings {
			kind: RatelimitKind::Disabled,
			max_hits: 0,
			time_window: Duration::ZERO,
			clean_interval: Duration::ZERO,
			group: Strng::default(),
		}
	}
}

impl RatelimitSettings {
	pub fn normalized(mut self) -> Self {
		if self.max_hits == 0 {
			self.max_hits = 20;
		}
		if self.time_window.is_zero() {
			self.time_window = Duration::from_secs(1);
		}
		if self.clean_interval.is_zero() {
			self.clean_interval = self.time_window * 10;
		}
		self
	}

	/// The bucket a request charges: the group (or backend host), plus the
	/// client address for client-scoped kinds.
	pub fn key(&self, client: &str, backend_host: &str) -> Strng {
		let scope = if self.group.is_empty() {
			backend_host
		} else {
			self.group.as_str()
		};
		if self.kind.is_client() {
			strng::format!("{scope}.{client}")
		} else {
			strng::new(scope)
		}
	}

	/// `X-Rate-Limit` advertises the allowance per hour-equivalent.
	pub fn hourly_equivalent(&self) -> u64 {
		let secs = self.time_window.as_secs_f64();
		if secs <= 0.0 {
			return self.max_hits as u64;
		}
		(self.max_hits as f64 * 3600.0 / secs) as u64
	}
}

#[derive(Debug, Error, PartialEq)]
pub enum SettingsError {
	#[error("unknown rate limit setting {0:?}")]
	UnknownKey(String),
	#[error("unknown rate limit type {0:?}")]
	UnknownKind(String),
	#[error("invalid value for {key}: {value:?}")]
	InvalidValue { key: String, value: String },
	#[error("rate limit setting {0:?} is not a key=value pair")]
	NotAPair(String),
}

/// `type=cluster-client,max-hits=100,time-window=10s,group=login`
impl FromStr for RatelimitSettings {
	type Err = SettingsError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let mut out = RatelimitSettings::default();
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
						"local" => RatelimitKind::Local,
						"service" => RatelimitKind::Service,
						"cluster-service" => RatelimitKind::ClusterService,
						"cluster-client" => RatelimitKind::ClusterClient,
						"disabled" => RatelimitKind::Disabled,
						other => return Err(SettingsError::UnknownKind(other.to_string())),
					}
				},
				"max-hits" => out.max_hits = value.parse().map_err(|_| invalid())?,
				"time-window" => {
					out.time_window = parse_flag_duration(value).map_err(|_| invalid())?
				},
				"clean-interval" => {
					out.clean_interval = parse_flag_duration(value).map_err(|_| invalid())?
				},
				"group" => out.group = value.into(),
				other => return Err(SettingsError::UnknownKey(other.to_string())),
			}
		}
		Ok(out)
	}
}

#[derive(Debug)]
pub enum Limiter {
	Local(local::SlidingWindow),
	Swim(swim::SwimLimiter),
	Redis(redis::RedisLimiter),
}

impl Limiter {
	pub fn settings(&self) -> &RatelimitSettings {
		match self {
			Limiter::Local(l) => l.settings(),
			Limiter::Swim(l) => l.settings(),
			Limiter::Redis(l) => l.settings(),
		}
	}

	pub async fn allow(&self, key: &str) -> bool {
		match self {
			Limiter::Local(l) => l.allow(key),
			Limiter::Swim(l) => l.allow(key),
			Limiter::Redis(l) => l.allow(key).await,
		}
	}

	pub async fn retry_after(&self, key: &str) -> Duration {
		match self {
			Limiter::Local(l) => l.retry_after(key),
			Limiter::Swim(l) => l.retry_after(key),
			Limiter::Redis(l) => l.retry_after(key).await,
		}
	}
}

/// Builds one limiter per configured setting. Cluster kinds prefer Redis
/// when a client is configured, then the gossip fabric, then degrade to the
/// local window.
pub struct RatelimitRegistry {
	limiters: Vec<Arc<Limiter>>,
}

impl RatelimitRegistry {
	pub fn new(
		settings: Vec<RatelimitSettings>,
		swarm: Option<Arc<dyn swim::Swarm>>,
		redis_client: Option<::redis::Client>,
	) -> RatelimitRegistry {
		let limiters = settings
			.into_iter()
			.filter(|s| s.kind != RatelimitKind::Disabled)
			.map(|s| {
				let s = s.normalized();
				let limiter = if s.kind.is_cluster() {
					if let Some(client) = &redis_client {
						Limiter::Redis(redis::RedisLimiter::new(client.clone(), s))
					} else if let Some(swarm) = &swarm {
						Limiter::Swim(swim::SwimLimiter::new(swarm.clone(), s))
					} else {
						warn!(
							"cluster rate limit configured without redis or a gossip fabric, using a node-local window"
						);
						Limiter::Local(local::SlidingWindow::new(s))
					}
				} else {
					Limiter::Local(local::SlidingWindow::new(s))
				};
				Arc::new(limiter)
			})
			.collect();
		RatelimitRegistry { limiters }
	}

	pub fn limiters(&self) -> &[Arc<Limiter>] {
		&self.limiters
	}

	pub fn is_empty(&self) -> bool {
		self.limiters.is_empty()
	}

	/// Periodic key GC for the window-based limiters.
	pub fn spawn_janitors(&self) {
		for limiter in &self.limiters {
			let limiter = limiter.clone();
			let interval = limiter.settings().clean_interval;
			tokio::spawn(async move {
				let mut tick = tokio::time::interval(interval);
				tick.tick().await;
				loop {
					tick.tick().await;
					match limiter.as_ref() {
						Limiter::Local(l) => l.sweep(SystemTime::now()),
						Limiter::Swim(l) => l.sweep(SystemTime::now()),
						// redis expires its own keys
						Limiter::Redis(_) => {},
					}
				}
			});
		}
	}
}
