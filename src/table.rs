use std::sync::RwLock;

use crate::endpoints::EndpointRegistry;
use crate::filters::FilterRegistry;
use crate::matcher::{MatchOptions, Matcher};
use crate::predicates::PredicateRegistry;
use crate::*;

/// One immutable compiled snapshot. A request that matched on a table keeps
/// an `Arc` to it for its whole lifetime, so a publish never pulls compiled
/// filters out from under in-flight traffic.
#[derive(Debug)]
pub struct RouteTable {
	pub matcher: Matcher,
	pub registry: Arc<EndpointRegistry>,
	pub created: SystemTime,
}

impl RouteTable {
	pub fn new(matcher: Matcher, registry: Arc<EndpointRegistry>) -> RouteTable {
		RouteTable {
			matcher,
			registry,
			created: SystemTime::now(),
		}
	}

	pub fn empty(registry: Arc<EndpointRegistry>) -> RouteTable {
		let (matcher, _) = Matcher::build(
			&[],
			MatchOptions::default(),
			&FilterRegistry::empty(),
			&PredicateRegistry::empty(),
			&registry,
		);
		RouteTable::new(matcher, registry)
	}
}

impl Drop for RouteTable {
	fn drop(&mut self) {
		// the snapshot is retired and the last reference is gone; release
		// filter resources
		for route in self.matcher.routes() {
			route.close();
		}
	}
}

/// The published-table cell. Readers clone the inner `Arc` (the strong count
/// is the per-snapshot reference count); the route manager swaps in whole
/// replacement tables.
#[derive(Clone, Debug)]
pub struct TableHandle {
	inner: Arc<RwLock<Arc<RouteTable>>>,
}

impl TableHandle {
	pub fn new(initial: RouteTable) -> TableHandle {
		TableHandle {
			inner: Arc::new(RwLock::new(Arc::new(initial))),
		}
	}

	/// Take a reference to the current snapshot. Hold it for at most one
	/// request.
	pub fn load(&self) -> Arc<RouteTable> {
		self.inner.read().unwrap().clone()
	}

	pub fn publish(&self, table: RouteTable) {
		*self.inner.write().unwrap() = Arc::new(table);
	}
}
