//! Aggregates route updates from data sources, compiles them into immutable
//! tables, and publishes atomically. A single task owns all mutation; the
//! serving path only ever loads the published handle.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::endpoints::EndpointRegistry;
use crate::filters::FilterRegistry;
use crate::matcher::{MatchOptions, Matcher};
use crate::metrics::Metrics;
use crate::predicates::PredicateRegistry;
use crate::table::{RouteTable, TableHandle};
use crate::types::RouteDefinition;
use crate::types::parse::parse_document;
use crate::*;

const INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// An incremental change from one data source.
#[derive(Debug, Default, Clone)]
pub struct Update {
	pub upserts: Vec<RouteDefinition>,
	pub deletes: Vec<Strng>,
	/// The source re-read its whole world: replace its set with `upserts`.
	pub reset: bool,
}

impl Update {
	pub fn is_empty(&self) -> bool {
		!self.reset && self.upserts.is_empty() && self.deletes.is_empty()
	}
}

#[async_trait]
pub trait DataSource: Send + Sync + 'static {
	fn name(&self) -> Strng;
	/// Full snapshot. Used for the initial load, retried with backoff.
	async fn load_all(&self) -> anyhow::Result<Vec<RouteDefinition>>;
	/// Incremental change since the last call. An error keeps the source's
	/// previous set.
	async fn load_update(&self) -> anyhow::Result<Update>;
}

/// Routes declared directly in configuration. Never changes after startup.
pub struct InlineSource {
	routes: Vec<RouteDefinition>,
}

impl InlineSource {
	pub fn parse(doc: &str) -> anyhow::Result<InlineSource> {
		Ok(InlineSource {
			routes: parse_document(doc)?,
		})
	}
}

#[async_trait]
impl DataSource for InlineSource {
	fn name(&self) -> Strng {
		strng::literal!("inline")
	}

	async fn load_all(&self) -> anyhow::Result<Vec<RouteDefinition>> {
		Ok(self.routes.clone())
	}

	async fn load_update(&self) -> anyhow::Result<Update> {
		Ok(Update::default())
	}
}

/// A route document on disk, re-read whole whenever its mtime changes.
pub struct FileSource {
	path: PathBuf,
	last_modified: Mutex<Option<SystemTime>>,
}

impl FileSource {
	pub fn new(path: PathBuf) -> FileSource {
		FileSource {
			path,
			last_modified: Mutex::new(None),
		}
	}

	fn read(&self) -> anyhow::Result<Vec<RouteDefinition>> {
		let modified = std::fs::metadata(&self.path)?.modified()?;
		let contents = std::fs::read_to_string(&self.path)?;
		let routes = parse_document(&contents)
			.map_err(|e| anyhow::anyhow!("{}: {e}", self.path.display()))?;
		*self.last_modified.lock().unwrap() = Some(modified);
		Ok(routes)
	}
}

#[async_trait]
impl DataSource for FileSource {
	fn name(&self) -> Strng {
		strng::new(self.path.display().to_string())
	}

	async fn load_all(&self) -> anyhow::Result<Vec<RouteDefinition>> {
		self.read()
	}

	async fn load_update(&self) -> anyhow::Result<Update> {
		let modified = std::fs::metadata(&self.path)?.modified()?;
		if *self.last_modified.lock().unwrap() == Some(modified) {
			return Ok(Update::default());
		}
		Ok(Update {
			upserts: self.read()?,
			deletes: Vec::new(),
			reset: true,
		})
	}
}

#[derive(Debug, Clone)]
pub struct ManagerOptions {
	pub poll_interval: Duration,
	pub match_options: MatchOptions,
}

impl Default for ManagerOptions {
	fn default() -> Self {
		ManagerOptions {
			poll_interval: Duration::from_secs(3),
			match_options: MatchOptions::default(),
		}
	}
}

/// Blocks serving until the manager has published at least one table.
#[derive(Clone)]
pub struct FirstLoad(watch::Receiver<bool>);

impl FirstLoad {
	pub fn ready(&self) -> bool {
		*self.0.borrow()
	}

	pub async fn wait(mut self) {
		loop {
			if *self.0.borrow_and_update() {
				return;
			}
			if self.0.changed().await.is_err() {
				return;
			}
		}
	}
}

pub struct RouteManager {
	sources: Vec<Arc<dyn DataSource>>,
	/// Per-source id→definition maps, merged on every change.
	defs: Vec<BTreeMap<Strng, RouteDefinition>>,
	handle: TableHandle,
	registry: Arc<EndpointRegistry>,
	filters: Arc<FilterRegistry>,
	predicates: Arc<PredicateRegistry>,
	options: ManagerOptions,
	metrics: Arc<Metrics>,
	first_load: watch::Sender<bool>,
}

impl RouteManager {
	pub fn new(
		sources: Vec<Arc<dyn DataSource>>,
		filters: Arc<FilterRegistry>,
		predicates: Arc<PredicateRegistry>,
		options: ManagerOptions,
		metrics: Arc<Metrics>,
	) -> (RouteManager, TableHandle, FirstLoad) {
		let registry = EndpointRegistry::new();
		let handle = TableHandle::new(RouteTable::empty(registry.clone()));
		let (tx, rx) = watch::channel(false);
		let defs = sources.iter().map(|_| BTreeMap::new()).collect();
		(
			RouteManager {
				sources,
				defs,
				handle: handle.clone(),
				registry,
				filters,
				predicates,
				options,
				metrics,
				first_load: tx,
			},
			handle,
			FirstLoad(rx),
		)
	}

	/// Initial load then poll. Runs until the task is aborted.
	pub async fn run(mut self) {
		self.load_initial().await;
		let poll = self.options.poll_interval.max(Duration::from_millis(10));
		let mut tick = tokio::time::interval(poll);
		tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		tick.tick().await; // completes immediately
		loop {
			tick.tick().await;
			self.poll_once().await;
		}
	}

	/// Full snapshots from every source, each retried with exponential
	/// backoff until it succeeds once.
	pub async fn load_initial(&mut self) {
		for i in 0..self.sources.len() {
			let source = self.sources[i].clone();
			let mut backoff = INITIAL_BACKOFF;
			loop {
				match source.load_all().await {
					Ok(routes) => {
						self.defs[i] = routes.into_iter().map(|r| (r.id.clone(), r)).collect();
						break;
					},
					Err(e) => {
						warn!(source = %source.name(), "initial load failed, retrying in {backoff:?}: {e}");
						tokio::time::sleep(backoff).await;
						backoff = (backoff * 2).min(MAX_BACKOFF);
					},
				}
			}
		}
		self.compile_and_publish();
		let _ = self.first_load.send(true);
	}

	/// One poll round over every source. Source errors keep that source's
	/// previous set; any effective change triggers a recompile.
	pub async fn poll_once(&mut self) {
		let mut changed = false;
		for i in 0..self.sources.len() {
			let source = self.sources[i].clone();
			match source.load_update().await {
				Ok(update) => changed |= self.apply_update(i, update),
				Err(e) => {
					warn!(source = %source.name(), "poll failed, keeping previous routes: {e}");
				},
			}
		}
		if changed {
			self.compile_and_publish();
		}
	}

	fn apply_update(&mut self, i: usize, update: Update) -> bool {
		if update.is_empty() {
			return false;
		}
		let defs = &mut self.defs[i];
		if update.reset {
			let next: BTreeMap<Strng, RouteDefinition> = update
				.upserts
				.into_iter()
				.map(|r| (r.id.clone(), r))
				.collect();
			if *defs == next {
				return false;
			}
			*defs = next;
			return true;
		}
		let mut changed = false;
		for r in update.upserts {
			let replaced = defs.insert(r.id.clone(), r.clone());
			changed |= replaced.as_ref() != Some(&r);
		}
		for id in update.deletes {
			changed |= defs.remove(&id).is_some();
		}
		changed
	}

	/// Later sources override earlier ones on id collision.
	fn merged(&self) -> Vec<RouteDefinition> {
		let mut merged: BTreeMap<Strng, RouteDefinition> = BTreeMap::new();
		for defs in &self.defs {
			for (id, r) in defs {
				merged.insert(id.clone(), r.clone());
			}
		}
		merged.into_values().collect()
	}

	fn compile_and_publish(&self) {
		let defs = self.merged();
		let (matcher, failed) = Matcher::build(
			&defs,
			self.options.match_options,
			&self.filters,
			&self.predicates,
			&self.registry,
		);
		for (id, err) in &failed {
			warn!(route = %id, "dropping invalid route: {err}");
		}
		self.metrics.routes_invalid.inc_by(failed.len() as u64);
		self.metrics.routes_active.set(matcher.routes().len() as i64);

		let refs: Vec<_> = matcher
			.routes()
			.iter()
			.flat_map(|r| r.endpoint_refs())
			.collect();
		self.registry.post_process(&refs, SystemTime::now());

		let table = RouteTable::new(matcher, self.registry.clone());
		info!(
			routes = table.matcher.routes().len(),
			dropped = failed.len(),
			"published route table"
		);
		self.handle.publish(table);
	}
}

#[cfg(test)]
#[path = "manager_test.rs"]
mod tests;
