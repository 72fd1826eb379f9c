use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::*;
use crate::types::parse::{parse_document, parse_route};

struct TestSource {
	name: Strng,
	all: Mutex<Vec<RouteDefinition>>,
	fail_all: AtomicUsize,
	updates: Mutex<VecDeque<anyhow::Result<Update>>>,
}

impl TestSource {
	fn new(name: &str, doc: &str) -> Arc<TestSource> {
		Arc::new(TestSource {
			name: name.into(),
			all: Mutex::new(parse_document(doc).unwrap()),
			fail_all: AtomicUsize::new(0),
			updates: Mutex::new(VecDeque::new()),
		})
	}

	fn push_update(&self, update: anyhow::Result<Update>) {
		self.updates.lock().unwrap().push_back(update);
	}
}

#[async_trait]
impl DataSource for TestSource {
	fn name(&self) -> Strng {
		self.name.clone()
	}

	async fn load_all(&self) -> anyhow::Result<Vec<RouteDefinition>> {
		if self.fail_all.load(Ordering::SeqCst) > 0 {
			self.fail_all.fetch_sub(1, Ordering::SeqCst);
			anyhow::bail!("source unavailable");
		}
		Ok(self.all.lock().unwrap().clone())
	}

	async fn load_update(&self) -> anyhow::Result<Update> {
		self
			.updates
			.lock()
			.unwrap()
			.pop_front()
			.unwrap_or(Ok(Update::default()))
	}
}

fn manager(sources: Vec<Arc<dyn DataSource>>) -> (RouteManager, TableHandle, FirstLoad) {
	let mut registry = prometheus_client::registry::Registry::default();
	RouteManager::new(
		sources,
		Arc::new(FilterRegistry::builtin()),
		Arc::new(PredicateRegistry::builtin()),
		ManagerOptions::default(),
		Metrics::new(&mut registry),
	)
}

fn route_ids(handle: &TableHandle) -> Vec<String> {
	let table = handle.load();
	let mut ids: Vec<String> = table
		.matcher
		.routes()
		.iter()
		.map(|r| r.id.to_string())
		.collect();
	ids.sort();
	ids
}

fn upsert(doc: &str) -> Update {
	Update {
		upserts: vec![parse_route(doc).unwrap()],
		deletes: Vec::new(),
		reset: false,
	}
}

#[tokio::test]
async fn initial_load_publishes_and_opens_the_gate() {
	let source = TestSource::new("a", r#"r1: Path("/r1") -> <shunt>;"#);
	let (mut mgr, handle, first) = manager(vec![source]);
	assert!(!first.ready());
	mgr.load_initial().await;
	assert!(first.ready());
	first.clone().wait().await;
	assert_eq!(route_ids(&handle), vec!["r1"]);
}

#[tokio::test(start_paused = true)]
async fn initial_load_retries_with_backoff() {
	let source = TestSource::new("flaky", r#"r1: Path("/r1") -> <shunt>;"#);
	source.fail_all.store(3, Ordering::SeqCst);
	let (mut mgr, handle, _) = manager(vec![source]);
	mgr.load_initial().await;
	assert_eq!(route_ids(&handle), vec!["r1"]);
}

#[tokio::test]
async fn later_sources_win_on_id_collision() {
	let a = TestSource::new("a", r#"shared: Path("/from-a") -> <shunt>; only_a: Path("/oa") -> <shunt>;"#);
	let b = TestSource::new("b", r#"shared: Path("/from-b") -> <shunt>;"#);
	let (mut mgr, handle, _) = manager(vec![a, b]);
	mgr.load_initial().await;
	assert_eq!(route_ids(&handle), vec!["only_a", "shared"]);

	let table = handle.load();
	let parts = ::http::Request::builder()
		.uri("/from-b")
		.body(())
		.unwrap()
		.into_parts()
		.0;
	assert!(table.matcher.match_request(&parts).is_some());
	let parts = ::http::Request::builder()
		.uri("/from-a")
		.body(())
		.unwrap()
		.into_parts()
		.0;
	assert!(table.matcher.match_request(&parts).is_none());
}

#[tokio::test]
async fn upserts_and_deletes_apply() {
	let source = TestSource::new("a", r#"r1: Path("/r1") -> <shunt>;"#);
	let (mut mgr, handle, _) = manager(vec![source.clone()]);
	mgr.load_initial().await;

	source.push_update(Ok(upsert(r#"r2: Path("/r2") -> <shunt>;"#)));
	mgr.poll_once().await;
	assert_eq!(route_ids(&handle), vec!["r1", "r2"]);

	source.push_update(Ok(Update {
		upserts: Vec::new(),
		deletes: vec!["r1".into()],
		reset: false,
	}));
	mgr.poll_once().await;
	assert_eq!(route_ids(&handle), vec!["r2"]);
}

#[tokio::test]
async fn applying_the_same_update_twice_is_idempotent() {
	let source = TestSource::new("a", r#"r1: Path("/r1") -> <shunt>;"#);
	let (mut mgr, handle, _) = manager(vec![source.clone()]);
	mgr.load_initial().await;

	source.push_update(Ok(upsert(r#"r2: Path("/r2") -> <shunt>;"#)));
	mgr.poll_once().await;
	let after_first = handle.load();

	source.push_update(Ok(upsert(r#"r2: Path("/r2") -> <shunt>;"#)));
	mgr.poll_once().await;
	assert_eq!(route_ids(&handle), vec!["r1", "r2"]);
	// the identical update is a no-op: no new table was published
	assert!(Arc::ptr_eq(&after_first, &handle.load()));
}

#[tokio::test]
async fn source_error_keeps_the_last_good_table() {
	let source = TestSource::new("a", r#"r1: Path("/r1") -> <shunt>;"#);
	let (mut mgr, handle, _) = manager(vec![source.clone()]);
	mgr.load_initial().await;
	let before = handle.load();

	source.push_update(Err(anyhow::anyhow!("poll blew up")));
	mgr.poll_once().await;
	assert!(Arc::ptr_eq(&before, &handle.load()));
	assert_eq!(route_ids(&handle), vec!["r1"]);
}

#[tokio::test]
async fn reset_replaces_the_sources_set() {
	let source = TestSource::new("a", r#"r1: Path("/r1") -> <shunt>; r2: Path("/r2") -> <shunt>;"#);
	let (mut mgr, handle, _) = manager(vec![source.clone()]);
	mgr.load_initial().await;

	source.push_update(Ok(Update {
		upserts: parse_document(r#"r3: Path("/r3") -> <shunt>;"#).unwrap(),
		deletes: Vec::new(),
		reset: true,
	}));
	mgr.poll_once().await;
	assert_eq!(route_ids(&handle), vec!["r3"]);
}

#[tokio::test]
async fn invalid_routes_drop_but_valid_ones_publish() {
	let source = TestSource::new(
		"a",
		r#"
			good: Path("/good") -> <shunt>;
			bad: Path("/bad") -> noSuchFilter() -> <shunt>;
		"#,
	);
	let (mut mgr, handle, _) = manager(vec![source]);
	mgr.load_initial().await;
	assert_eq!(route_ids(&handle), vec!["good"]);
}

#[tokio::test]
async fn publish_feeds_the_endpoint_registry() {
	let source = TestSource::new(
		"a",
		r#"bar: Path("/bar") -> fadeIn("1m") -> <"http://10.0.0.1:8080", "http://10.0.0.2:8080">;"#,
	);
	let (mut mgr, handle, _) = manager(vec![source]);
	mgr.load_initial().await;
	let table = handle.load();
	for host in ["10.0.0.1:8080", "10.0.0.2:8080"] {
		let m = table.registry.get(host).unwrap();
		assert!(m.last_seen() >= table.created - Duration::from_secs(1));
		assert!(m.fade_in("bar").is_some());
	}
}

#[tokio::test]
async fn file_source_reloads_on_change() {
	let dir = std::env::temp_dir().join(format!("switchyard-test-{}", std::process::id()));
	std::fs::create_dir_all(&dir).unwrap();
	let path = dir.join("routes.txt");
	std::fs::write(&path, r#"r1: Path("/r1") -> <shunt>;"#).unwrap();

	let source: Arc<dyn DataSource> = Arc::new(FileSource::new(path.clone()));
	let (mut mgr, handle, _) = manager(vec![source]);
	mgr.load_initial().await;
	assert_eq!(route_ids(&handle), vec!["r1"]);

	// unchanged mtime: nothing to do
	mgr.poll_once().await;
	assert_eq!(route_ids(&handle), vec!["r1"]);

	std::fs::write(&path, r#"r2: Path("/r2") -> <shunt>;"#).unwrap();
	// some filesystems have coarse mtimes; force a visible change
	let bumped = SystemTime::now() + Duration::from_secs(2);
	let _ = std::fs::File::open(&path).and_then(|f| f.set_modified(bumped));
	mgr.poll_once().await;
	assert_eq!(route_ids(&handle), vec!["r2"]);

	std::fs::remove_dir_all(&dir).unwrap();
}
