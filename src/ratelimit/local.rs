//! Node-local sliding window: a circular buffer of the last `max_hits`
//! admission timestamps per key.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use super::RatelimitSettings;
use crate::*;

#[derive(Debug)]
struct Ring {
	hits: VecDeque<SystemTime>,
	touched: SystemTime,
}

#[derive(Debug)]
pub struct SlidingWindow {
	settings: RatelimitSettings,
	rings: Mutex<HashMap<Strng, Ring>>,
}

impl SlidingWindow {
	pub fn new(settings: RatelimitSettings) -> SlidingWindow {
		SlidingWindow {
			settings: settings.normalized(),
			rings: Mutex::new(HashMap::new()),
		}
	}

	pub fn settings(&self) -> &RatelimitSettings {
		&self.settings
	}

	pub fn allow(&self, key: &str) -> bool {
		self.allow_at(key, SystemTime::now())
	}

	/// Admit when the buffer has spare capacity or its oldest admission
	/// left the window; admission overwrites the oldest slot.
	pub fn allow_at(&self, key: &str, now: SystemTime) -> bool {
		let mut rings = self.rings.lock().unwrap();
		let ring = rings.entry(strng::new(key)).or_insert_with(|| Ring {
			hits: VecDeque::with_capacity(self.settings.max_hits),
			touched: now,
		});
		ring.touched = now;
		if ring.hits.len() < self.settings.max_hits {
			ring.hits.push_back(now);
			return true;
		}
		match ring.hits.front() {
			Some(&oldest) if oldest + self.settings.time_window <= now => {
				ring.hits.pop_front();
				ring.hits.push_back(now);
				true
			},
			_ => false,
		}
	}

	pub fn oldest(&self, key: &str) -> Option<SystemTime> {
		self
			.rings
			.lock()
			.unwrap()
			.get(key)
			.and_then(|r| r.hits.front().copied())
	}

	pub fn retry_after(&self, key: &str) -> Duration {
		self.retry_after_at(key, SystemTime::now())
	}

	pub fn retry_after_at(&self, key: &str, now: SystemTime) -> Duration {
		let rings = self.rings.lock().unwrap();
		let Some(ring) = rings.get(key) else {
			return Duration::ZERO;
		};
		if ring.hits.len() < self.settings.max_hits {
			return Duration::ZERO;
		}
		match ring.hits.front() {
			Some(&oldest) => (oldest + self.settings.time_window)
				.duration_since(now)
				.unwrap_or(Duration::ZERO),
			None => Duration::ZERO,
		}
	}

	/// Drop keys untouched for a clean interval.
	pub fn sweep(&self, now: SystemTime) {
		self
			.rings
			.lock()
			.unwrap()
			.retain(|_, ring| ring.touched + self.settings.clean_interval >= now);
	}

	pub fn keys(&self) -> usize {
		self.rings.lock().unwrap().len()
	}
}
