//! Cluster rate limiting over Redis: one sorted set of request timestamps
//! per key, trimmed to the window on every decision. Redis being down must
//! never take user traffic down with it, so every error fails open.

use ::redis::AsyncCommands;
use tokio::sync::OnceCell;

use super::RatelimitSettings;
use crate::*;

const KEY_PREFIX: &str = "switchyard.ratelimit.";

pub struct RedisLimiter {
	settings: RatelimitSettings,
	client: ::redis::Client,
	conn: OnceCell<::redis::aio::ConnectionManager>,
}

impl std::fmt::Debug for RedisLimiter {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RedisLimiter")
			.field("settings", &self.settings)
			.field("client", &self.client)
			.finish_non_exhaustive()
	}
}

impl RedisLimiter {
	pub fn new(client: ::redis::Client, settings: RatelimitSettings) -> RedisLimiter {
		RedisLimiter {
			settings: settings.normalized(),
			client,
			conn: OnceCell::new(),
		}
	}

	pub fn settings(&self) -> &RatelimitSettings {
		&self.settings
	}

	async fn conn(&self) -> Result<::redis::aio::ConnectionManager, ::redis::RedisError> {
		self
			.conn
			.get_or_try_init(|| self.client.get_connection_manager())
			.await
			.map(|c| c.clone())
	}

	fn redis_key(&self, key: &str) -> String {
		format!("{KEY_PREFIX}{key}")
	}

	pub async fn allow(&self, key: &str) -> bool {
		match self.try_allow(key).await {
			Ok(allowed) => allowed,
			Err(e) => {
				warn!(key, "redis rate limit check failed, allowing: {e}");
				true
			},
		}
	}

	async fn try_allow(&self, key: &str) -> Result<bool, ::redis::RedisError> {
		let mut conn = self.conn().await?;
		let rkey = self.redis_key(key);
		let now = unix_nanos(SystemTime::now());
		let horizon = now.saturating_sub(self.settings.time_window.as_nanos() as u64);

		let (_removed, count): (u64, u64) = ::redis::pipe()
			.zrembyscore(&rkey, 0u64, horizon)
			.zcard(&rkey)
			.query_async(&mut conn)
			.await?;
		if count >= self.settings.max_hits as u64 {
			return Ok(false);
		}
		let () = ::redis::pipe()
			.zadd(&rkey, now, now)
			.ignore()
			.expire(&rkey, (self.settings.time_window.as_secs() as i64).max(1) * 2)
			.ignore()
			.query_async(&mut conn)
			.await?;
		Ok(true)
	}

	pub async fn retry_after(&self, key: &str) -> Duration {
		match self.try_retry_after(key).await {
			Ok(d) => d,
			Err(e) => {
				warn!(key, "redis retry-after lookup failed: {e}");
				self.settings.time_window
			},
		}
	}

	async fn try_retry_after(&self, key: &str) -> Result<Duration, ::redis::RedisError> {
		let mut conn = self.conn().await?;
		let rkey = self.redis_key(key);
		let oldest: Vec<(String, f64)> = conn.zrange_withscores(&rkey, 0, 0).await?;
		let now = unix_nanos(SystemTime::now());
		match oldest.first() {
			Some((_, score)) => {
				let expires = (*score as u64).saturating_add(self.settings.time_window.as_nanos() as u64);
				Ok(Duration::from_nanos(expires.saturating_sub(now)))
			},
			// the set evaporated under us; the full window is the only hint
			// that can not under-delay
			None => Ok(self.settings.time_window),
		}
	}
}

fn unix_nanos(t: SystemTime) -> u64 {
	t.duration_since(std::time::UNIX_EPOCH)
		.map(|d| d.as_nanos() as u64)
		.unwrap_or(0)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn limiter(url: &str) -> RedisLimiter {
		RedisLimiter::new(
			::redis::Client::open(url).unwrap(),
			RatelimitSettings {
				kind: super::super::RatelimitKind::ClusterService,
				max_hits: 3,
				time_window: Duration::from_secs(1),
				..Default::default()
			},
		)
	}

	#[tokio::test]
	async fn unreachable_redis_fails_open() {
		// nothing listens on this port; the decision must still admit
		let l = limiter("redis://127.0.0.1:1/");
		assert!(l.allow("k").await);
		assert_eq!(l.retry_after("k").await, Duration::from_secs(1));
	}

	#[test]
	fn keys_are_namespaced() {
		let l = limiter("redis://127.0.0.1:1/");
		assert_eq!(l.redis_key("g.10.0.0.1"), "switchyard.ratelimit.g.10.0.0.1");
	}
}
