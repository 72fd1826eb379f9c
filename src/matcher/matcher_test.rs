use ::http::request::Parts;

use super::*;
use crate::types::parse::parse_document;

fn build(doc: &str, options: MatchOptions) -> (Matcher, Vec<(Strng, CompileError)>) {
	let defs = parse_document(doc).unwrap();
	let filters = FilterRegistry::builtin();
	let predicates = PredicateRegistry::builtin();
	let endpoints = EndpointRegistry::new();
	let (m, failed) = Matcher::build(&defs, options, &filters, &predicates, &endpoints);
	(m, failed)
}

fn parts(method: &str, uri: &str, headers: &[(&str, &str)]) -> Parts {
	let mut b = ::http::Request::builder().method(method).uri(uri);
	for (k, v) in headers {
		b = b.header(*k, *v);
	}
	b.body(()).unwrap().into_parts().0
}

fn matched(m: &Matcher, p: &Parts) -> Option<String> {
	m.match_request(p).map(|(r, _)| r.id.to_string())
}

#[test]
fn clean_path_resolves_dots() {
	assert_eq!(clean_path("/a/b/../c"), "/a/c");
	assert_eq!(clean_path("/a/./b"), "/a/b");
	assert_eq!(clean_path("//a///b"), "/a/b");
	assert_eq!(clean_path("/.."), "/");
	assert_eq!(clean_path("/a/"), "/a/");
	assert_eq!(clean_path("/"), "/");
}

#[test]
fn subtree_and_method_selection() {
	let (m, failed) = build(
		r#"
			sub: PathSubtree("/foo/") && Method("PUT") -> status(200) -> <shunt>;
			path: Path("/foo") -> status(200) -> <shunt>;
		"#,
		MatchOptions::default(),
	);
	assert!(failed.is_empty());
	assert_eq!(matched(&m, &parts("PUT", "/foo/bar", &[])).as_deref(), Some("sub"));
	assert_eq!(matched(&m, &parts("PUT", "/foo", &[])).as_deref(), Some("sub"));
	assert_eq!(matched(&m, &parts("GET", "/foo", &[])).as_deref(), Some("path"));
	assert_eq!(matched(&m, &parts("GET", "/bar", &[])), None);
}

#[test]
fn subtree_exposes_tail_parameter() {
	let (m, _) = build(
		r#"p: PathSubtree("/p") -> <shunt>;"#,
		MatchOptions::default(),
	);
	for (path, tail) in [("/p", "/"), ("/p/", "/"), ("/p/x/y", "/x/y")] {
		let (_, params) = m.match_request(&parts("GET", path, &[])).unwrap();
		assert_eq!(params.get("*").map(String::as_str), Some(tail), "path {path}");
	}
}

#[test]
fn wildcard_parameters_are_captured() {
	let (m, _) = build(
		r#"api: Path("/api/:version/*rest") -> <shunt>;"#,
		MatchOptions::default(),
	);
	let (r, params) = m.match_request(&parts("GET", "/api/v2/users/7", &[])).unwrap();
	assert_eq!(r.id, "api");
	assert_eq!(params.get("version").map(String::as_str), Some("v2"));
	assert_eq!(params.get("rest").map(String::as_str), Some("/users/7"));
}

#[test]
fn trailing_slash_policy() {
	let strict = MatchOptions::default();
	let lax = MatchOptions {
		ignore_trailing_slash: true,
	};
	let doc = r#"r: Path("/foo") -> <shunt>;"#;

	let (m, _) = build(doc, strict);
	assert!(matched(&m, &parts("GET", "/foo", &[])).is_some());
	assert!(matched(&m, &parts("GET", "/foo/", &[])).is_none());

	let (m, _) = build(doc, lax);
	assert!(matched(&m, &parts("GET", "/foo", &[])).is_some());
	assert!(matched(&m, &parts("GET", "/foo/", &[])).is_some());
}

#[test]
fn non_path_conjunction() {
	let (m, failed) = build(
		r#"
			strict: Path("/x")
				&& Host(/^api[.]example[.]org$/)
				&& Header("X-Tenant", "blue")
				&& HeaderRegexp("Accept", /json/)
				&& QueryParam("token")
				-> <shunt>;
		"#,
		MatchOptions::default(),
	);
	assert!(failed.is_empty());
	let ok = parts(
		"GET",
		"http://api.example.org/x?token=1",
		&[("x-tenant", "blue"), ("accept", "application/json")],
	);
	assert_eq!(matched(&m, &ok).as_deref(), Some("strict"));

	// each failing condition alone kills the match
	let wrong_host = parts(
		"GET",
		"http://other.example.org/x?token=1",
		&[("x-tenant", "blue"), ("accept", "application/json")],
	);
	assert_eq!(matched(&m, &wrong_host), None);
	let wrong_header = parts(
		"GET",
		"http://api.example.org/x?token=1",
		&[("x-tenant", "green"), ("accept", "application/json")],
	);
	assert_eq!(matched(&m, &wrong_header), None);
	let wrong_accept = parts(
		"GET",
		"http://api.example.org/x?token=1",
		&[("x-tenant", "blue"), ("accept", "text/html")],
	);
	assert_eq!(matched(&m, &wrong_accept), None);
	let no_token = parts(
		"GET",
		"http://api.example.org/x",
		&[("x-tenant", "blue"), ("accept", "application/json")],
	);
	assert_eq!(matched(&m, &no_token), None);
}

#[test]
fn path_regexp_checks_full_path() {
	let (m, _) = build(
		r#"r: PathSubtree("/files") && PathRegexp(/[.]pdf$/) -> <shunt>;"#,
		MatchOptions::default(),
	);
	assert!(matched(&m, &parts("GET", "/files/docs/a.pdf", &[])).is_some());
	assert!(matched(&m, &parts("GET", "/files/docs/a.txt", &[])).is_none());
}

#[test]
fn stricter_route_wins_at_same_position() {
	let (m, _) = build(
		r#"
			lax: Path("/x") -> <shunt>;
			strict: Path("/x") && Method("POST") && Header("X-A", "1") -> <shunt>;
		"#,
		MatchOptions::default(),
	);
	assert_eq!(
		matched(&m, &parts("POST", "/x", &[("x-a", "1")])).as_deref(),
		Some("strict")
	);
	assert_eq!(matched(&m, &parts("POST", "/x", &[])).as_deref(), Some("lax"));
}

#[test]
fn invalid_routes_drop_without_poisoning_the_set() {
	let (m, failed) = build(
		r#"
			ok: Path("/ok") -> <shunt>;
			badfilter: Path("/bf") -> noSuchFilter() -> <shunt>;
			badbackend: Path("/bb") -> "not a url";
			badpath: Path("/a/*x/*y") -> <shunt>;
			badpred: Path("/bp") && NoSuchPredicate() -> <shunt>;
			badalg: Path("/ba") -> <fancy, "http://a:80">;
		"#,
		MatchOptions::default(),
	);
	assert_eq!(failed.len(), 5);
	assert_eq!(m.routes().len(), 1);
	assert_eq!(matched(&m, &parts("GET", "/ok", &[])).as_deref(), Some("ok"));
	assert_eq!(matched(&m, &parts("GET", "/bf", &[])), None);
}

#[test]
fn match_all_route_covers_everything() {
	let (m, _) = build(
		r#"
			specific: Path("/a") -> <shunt>;
			all: * -> <shunt>;
		"#,
		MatchOptions::default(),
	);
	assert_eq!(matched(&m, &parts("GET", "/a", &[])).as_deref(), Some("specific"));
	assert_eq!(
		matched(&m, &parts("GET", "/somewhere/else", &[])).as_deref(),
		Some("all")
	);
	assert_eq!(matched(&m, &parts("GET", "/", &[])).as_deref(), Some("all"));
}

#[test]
fn load_balanced_backend_registers_endpoints() {
	let defs = parse_document(
		r#"bar: Path("/bar") -> fadeIn("1m") -> <"http://10.0.0.1:8080", "http://10.0.0.2:8080">;"#,
	)
	.unwrap();
	let filters = FilterRegistry::builtin();
	let predicates = PredicateRegistry::builtin();
	let endpoints = EndpointRegistry::new();
	let (m, failed) = Matcher::build(
		&defs,
		MatchOptions::default(),
		&filters,
		&predicates,
		&endpoints,
	);
	assert!(failed.is_empty());
	assert_eq!(endpoints.len(), 2);
	let refs = m.routes()[0].endpoint_refs();
	assert_eq!(refs.len(), 2);
	assert_eq!(refs[0].route, "bar");
	assert_eq!(
		refs[0].fade_in.unwrap().duration,
		Duration::from_secs(60)
	);
}

#[test]
fn round_robin_cycles_warm_endpoints() {
	let (m, _) = build(
		r#"lb: Path("/lb") -> <roundRobin, "http://a:80", "http://b:80", "http://c:80">;"#,
		MatchOptions::default(),
	);
	let route = &m.routes()[0];
	let now = SystemTime::now();
	let picks: Vec<Strng> = (0..6)
		.map(|_| {
			route
				.backend
				.select_endpoint(&route.id, now)
				.unwrap()
				.key
				.clone()
		})
		.collect();
	assert_eq!(picks[0..3], picks[3..6]);
	let mut distinct = picks[0..3].to_vec();
	distinct.sort();
	distinct.dedup();
	assert_eq!(distinct.len(), 3);
}

#[test]
fn select_endpoint_only_for_lb_backends() {
	let (m, _) = build(r#"r: Path("/r") -> "http://a:80";"#, MatchOptions::default());
	assert!(
		m.routes()[0]
			.backend
			.select_endpoint("r", SystemTime::now())
			.is_none()
	);
}

#[test]
fn power_of_two_prefers_idle_endpoint() {
	let (m, _) = build(
		r#"lb: Path("/lb") -> <powerOfRandomNChoices, "http://a:80", "http://b:80">;"#,
		MatchOptions::default(),
	);
	let route = &m.routes()[0];
	let CompiledBackend::LoadBalanced { endpoints, .. } = &route.backend else {
		panic!("expected lb backend");
	};
	for _ in 0..50 {
		endpoints[0].metrics.inc_inflight();
	}
	let now = SystemTime::now();
	for _ in 0..20 {
		let pick = route.backend.select_endpoint(&route.id, now).unwrap();
		assert_eq!(pick.key, "b:80");
	}
}
