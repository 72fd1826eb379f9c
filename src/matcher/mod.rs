//! Route compilation and request matching: turns parsed definitions into
//! materialized predicate/filter/backend objects and evaluates them against
//! request heads.

pub mod tree;

use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};

use ::http::request::Parts;
use ::http::{HeaderName, Method};
use rand::Rng;
use regex::Regex;
use thiserror::Error;

use crate::endpoints::{EndpointMetrics, EndpointRef, EndpointRegistry};
use crate::filters::{Filter, FilterRegistry};
use crate::http::get_host;
use crate::predicates::{Predicate, PredicateRegistry};
use crate::types::{Arg, Backend, Params, PredicateSpec, RouteDefinition};
use crate::*;
use tree::{PathTree, TreeError};

#[derive(Debug, Clone, Copy, Default)]
pub struct MatchOptions {
	/// Treat `/foo` and `/foo/` as the same path, at build and match time.
	pub ignore_trailing_slash: bool,
}

/// Resolve `.` and `..` segments and collapse duplicate slashes. A trailing
/// slash survives cleaning; whether it is significant is the tree's call.
pub fn clean_path(p: &str) -> String {
	let trailing = p.ends_with('/') && p.len() > 1;
	let mut kept: Vec<&str> = Vec::new();
	for seg in p.split('/') {
		match seg {
			"" | "." => {},
			".." => {
				kept.pop();
			},
			s => kept.push(s),
		}
	}
	let mut out = String::with_capacity(p.len());
	out.push('/');
	out.push_str(&kept.join("/"));
	if trailing && out.len() > 1 {
		out.push('/');
	}
	out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LbAlgorithm {
	#[default]
	RoundRobin,
	Random,
	PowerOfRandomNChoices,
}

impl LbAlgorithm {
	fn parse(name: Option<&Strng>) -> Result<Self, CompileError> {
		match name.map(|s| s.as_str()) {
			None | Some("roundRobin") => Ok(LbAlgorithm::RoundRobin),
			Some("random") => Ok(LbAlgorithm::Random),
			Some("powerOfRandomNChoices") => Ok(LbAlgorithm::PowerOfRandomNChoices),
			Some(other) => Err(CompileError::Algorithm(other.into())),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendAddress {
	pub scheme: Strng,
	pub authority: Strng,
}

#[derive(Debug, Clone)]
pub struct LbEndpoint {
	pub address: BackendAddress,
	/// `host:port` registry key.
	pub key: Strng,
	pub metrics: Arc<EndpointMetrics>,
}

#[derive(Debug)]
pub enum CompiledBackend {
	Network(BackendAddress),
	Shunt,
	Loopback,
	Dynamic,
	LoadBalanced {
		algorithm: LbAlgorithm,
		endpoints: Vec<LbEndpoint>,
		cursor: AtomicUsize,
	},
}

impl CompiledBackend {
	/// Pick an endpoint, weighting fresh endpoints down during their
	/// fade-in window.
	pub fn select_endpoint(&self, route: &str, now: SystemTime) -> Option<&LbEndpoint> {
		let CompiledBackend::LoadBalanced {
			algorithm,
			endpoints,
			cursor,
		} = self
		else {
			return None;
		};
		if endpoints.is_empty() {
			return None;
		}
		if endpoints.len() == 1 {
			return endpoints.first();
		}
		let mut rng = rand::rng();
		let weight = |ep: &LbEndpoint| ep.metrics.fade_weight(route, now);
		match algorithm {
			LbAlgorithm::RoundRobin => {
				let n = cursor.fetch_add(1, Ordering::Relaxed) % endpoints.len();
				let chosen = &endpoints[n];
				let w = weight(chosen);
				if w >= 1.0 || rng.random::<f64>() < w {
					return Some(chosen);
				}
				// skip the fading endpoint this round if a warm one exists
				for off in 1..endpoints.len() {
					let alt = &endpoints[(n + off) % endpoints.len()];
					if weight(alt) >= 1.0 {
						return Some(alt);
					}
				}
				Some(chosen)
			},
			LbAlgorithm::Random => {
				let weights: Vec<f64> = endpoints.iter().map(weight).collect();
				let total: f64 = weights.iter().sum();
				let mut x = rng.random::<f64>() * total;
				for (ep, w) in endpoints.iter().zip(&weights) {
					x -= w;
					if x <= 0.0 {
						return Some(ep);
					}
				}
				endpoints.last()
			},
			LbAlgorithm::PowerOfRandomNChoices => {
				let a = rng.random_range(0..endpoints.len());
				let mut b = rng.random_range(0..endpoints.len() - 1);
				if b >= a {
					b += 1;
				}
				let score = |ep: &LbEndpoint| (ep.metrics.inflight() + 1) as f64 / weight(ep);
				if score(&endpoints[a]) <= score(&endpoints[b]) {
					Some(&endpoints[a])
				} else {
					Some(&endpoints[b])
				}
			},
		}
	}
}

#[derive(Debug, Error)]
pub enum CompileError {
	#[error(transparent)]
	Path(#[from] TreeError),
	#[error("route has more than one path predicate")]
	MultiplePaths,
	#[error("invalid {name} arguments: {reason}")]
	Predicate { name: Strng, reason: String },
	#[error(transparent)]
	Filter(#[from] filters::CreateError),
	#[error(transparent)]
	Custom(#[from] predicates::CreateError),
	#[error("invalid backend {url:?}: {reason}")]
	Backend { url: Strng, reason: String },
	#[error("unknown load balancing algorithm {0:?}")]
	Algorithm(Strng),
}

fn predicate_error(name: &str, reason: impl Into<String>) -> CompileError {
	CompileError::Predicate {
		name: name.into(),
		reason: reason.into(),
	}
}

/// A route with everything materialized: predicate objects, filter
/// instances, and the parsed backend.
pub struct CompiledRoute {
	pub id: Strng,
	pub definition: Arc<RouteDefinition>,
	pub method: Option<Method>,
	pub host_regexps: Vec<Regex>,
	pub path_regexps: Vec<Regex>,
	pub headers_exact: Vec<(HeaderName, Strng)>,
	pub header_regexps: Vec<(HeaderName, Regex)>,
	pub custom: Vec<Arc<dyn Predicate>>,
	pub filters: Vec<Arc<dyn Filter>>,
	pub backend: CompiledBackend,
	/// Count of non-path conditions; leaves at one tree position are tried
	/// most-strict first.
	pub strictness: usize,
}

impl Debug for CompiledRoute {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CompiledRoute")
			.field("id", &self.id)
			.field("strictness", &self.strictness)
			.field("backend", &self.backend)
			.finish()
	}
}

impl CompiledRoute {
	/// Conjunction of every non-path condition.
	pub fn matches_non_path(&self, parts: &Parts, path: &str) -> bool {
		if let Some(m) = &self.method {
			if parts.method != *m {
				return false;
			}
		}
		if !self.host_regexps.is_empty() {
			let Some(host) = get_host(parts) else {
				return false;
			};
			if !self.host_regexps.iter().all(|re| re.is_match(host)) {
				return false;
			}
		}
		if !self.path_regexps.iter().all(|re| re.is_match(path)) {
			return false;
		}
		for (name, want) in &self.headers_exact {
			if !parts
				.headers
				.get_all(name)
				.iter()
				.any(|v| v.as_bytes() == want.as_bytes())
			{
				return false;
			}
		}
		for (name, re) in &self.header_regexps {
			let mut any = false;
			for v in parts.headers.get_all(name) {
				if let Ok(s) = v.to_str() {
					if re.is_match(s) {
						any = true;
						break;
					}
				}
			}
			if !any {
				return false;
			}
		}
		self.custom.iter().all(|p| p.matches(parts))
	}

	/// What this route asserts about its load-balanced endpoints; consumed
	/// by the endpoint registry on table publish.
	pub fn endpoint_refs(&self) -> Vec<EndpointRef> {
		let CompiledBackend::LoadBalanced { endpoints, .. } = &self.backend else {
			return Vec::new();
		};
		let fade = self.filters.iter().find_map(|f| f.fade_in());
		let created: Vec<(Strng, SystemTime)> = self
			.filters
			.iter()
			.filter_map(|f| f.endpoint_created())
			.collect();
		endpoints
			.iter()
			.map(|ep| EndpointRef {
				host: ep.key.clone(),
				route: self.id.clone(),
				fade_in: fade,
				created: created
					.iter()
					.find(|(h, _)| *h == ep.key)
					.map(|(_, t)| *t),
			})
			.collect()
	}

	pub fn close(&self) {
		for f in &self.filters {
			f.close();
		}
	}
}

struct PathSpec {
	pattern: Strng,
	subtree: bool,
}

fn pattern_arg(p: &PredicateSpec) -> Result<Strng, CompileError> {
	p.args
		.first()
		.and_then(Arg::as_str)
		.map(Strng::from)
		.ok_or_else(|| predicate_error(&p.name, "expected a path literal"))
}

fn regex_args(p: &PredicateSpec) -> Result<Vec<Regex>, CompileError> {
	if p.args.is_empty() {
		return Err(predicate_error(&p.name, "expected at least one pattern"));
	}
	p.args
		.iter()
		.map(|a| {
			let pat = a
				.as_pattern()
				.ok_or_else(|| predicate_error(&p.name, "expected a pattern"))?;
			Regex::new(pat).map_err(|e| predicate_error(&p.name, e.to_string()))
		})
		.collect()
}

fn header_name_arg(p: &PredicateSpec) -> Result<HeaderName, CompileError> {
	p.args
		.first()
		.and_then(Arg::as_str)
		.and_then(|n| n.parse::<HeaderName>().ok())
		.ok_or_else(|| predicate_error(&p.name, "expected a header name"))
}

fn parse_backend_address(url: &Strng) -> Result<BackendAddress, CompileError> {
	let err = |reason: &str| CompileError::Backend {
		url: url.clone(),
		reason: reason.to_string(),
	};
	let uri: ::http::Uri = url
		.parse()
		.map_err(|_| err("not a valid url"))?;
	let scheme = uri.scheme_str().ok_or_else(|| err("missing scheme"))?;
	if scheme != "http" && scheme != "https" {
		return Err(err("unsupported scheme"));
	}
	let authority = uri.authority().ok_or_else(|| err("missing host"))?;
	Ok(BackendAddress {
		scheme: scheme.into(),
		authority: authority.as_str().into(),
	})
}

fn compile_route(
	def: &RouteDefinition,
	filter_registry: &FilterRegistry,
	predicate_registry: &PredicateRegistry,
	endpoint_registry: &EndpointRegistry,
) -> Result<(CompiledRoute, PathSpec), CompileError> {
	let mut path: Option<PathSpec> = None;
	let mut method = None;
	let mut host_regexps = Vec::new();
	let mut path_regexps = Vec::new();
	let mut headers_exact = Vec::new();
	let mut header_regexps = Vec::new();
	let mut custom = Vec::new();

	for p in &def.predicates {
		match p.name.as_str() {
			"Path" | "PathSubtree" => {
				if path.is_some() {
					return Err(CompileError::MultiplePaths);
				}
				path = Some(PathSpec {
					pattern: pattern_arg(p)?,
					subtree: p.name == "PathSubtree",
				});
			},
			"Method" => {
				let m = p
					.args
					.first()
					.and_then(Arg::as_str)
					.and_then(|m| Method::from_bytes(m.as_bytes()).ok())
					.ok_or_else(|| predicate_error("Method", "expected a method name"))?;
				method = Some(m);
			},
			"Host" => host_regexps.extend(regex_args(p)?),
			"PathRegexp" => path_regexps.extend(regex_args(p)?),
			"Header" => {
				let name = header_name_arg(p)?;
				let value = p
					.args
					.get(1)
					.and_then(Arg::as_str)
					.ok_or_else(|| predicate_error("Header", "expected a header value"))?;
				headers_exact.push((name, value.into()));
			},
			"HeaderRegexp" => {
				let name = header_name_arg(p)?;
				let pat = p
					.args
					.get(1)
					.and_then(Arg::as_pattern)
					.ok_or_else(|| predicate_error("HeaderRegexp", "expected a value pattern"))?;
				let re =
					Regex::new(pat).map_err(|e| predicate_error("HeaderRegexp", e.to_string()))?;
				header_regexps.push((name, re));
			},
			_ => custom.push(predicate_registry.create(&p.name, &p.args)?),
		}
	}

	let filters = def
		.filters
		.iter()
		.map(|f| filter_registry.create(f))
		.collect::<Result<Vec<_>, _>>()?;

	let backend = match &def.backend {
		Backend::Network(url) => CompiledBackend::Network(parse_backend_address(url)?),
		Backend::Shunt => CompiledBackend::Shunt,
		Backend::Loopback => CompiledBackend::Loopback,
		Backend::Dynamic => CompiledBackend::Dynamic,
		Backend::LoadBalanced {
			algorithm,
			endpoints,
		} => {
			let algorithm = LbAlgorithm::parse(algorithm.as_ref())?;
			let endpoints = endpoints
				.iter()
				.map(|url| {
					let address = parse_backend_address(url)?;
					let key = endpoints::endpoint_key(url).ok_or_else(|| CompileError::Backend {
						url: url.clone(),
						reason: "missing host".to_string(),
					})?;
					let metrics = endpoint_registry.metrics(&key);
					Ok(LbEndpoint {
						address,
						key,
						metrics,
					})
				})
				.collect::<Result<Vec<_>, CompileError>>()?;
			CompiledBackend::LoadBalanced {
				algorithm,
				endpoints,
				cursor: AtomicUsize::new(0),
			}
		},
	};

	let strictness = usize::from(method.is_some())
		+ host_regexps.len()
		+ path_regexps.len()
		+ headers_exact.len()
		+ header_regexps.len()
		+ custom.len();

	let route = CompiledRoute {
		id: def.id.clone(),
		definition: Arc::new(def.clone()),
		method,
		host_regexps,
		path_regexps,
		headers_exact,
		header_regexps,
		custom,
		filters,
		backend,
		strictness,
	};
	// routes without a path predicate cover every path
	let path = path.unwrap_or(PathSpec {
		pattern: strng::literal!("/"),
		subtree: true,
	});
	Ok((route, path))
}

/// The compiled lookup structure for one route table.
pub struct Matcher {
	tree: PathTree<Arc<CompiledRoute>>,
	routes: Vec<Arc<CompiledRoute>>,
}

impl Debug for Matcher {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Matcher")
			.field("routes", &self.routes.len())
			.finish()
	}
}

impl Matcher {
	/// Compile a definition set. Routes that fail to compile are dropped and
	/// reported; the rest of the set builds normally.
	pub fn build(
		defs: &[RouteDefinition],
		options: MatchOptions,
		filter_registry: &FilterRegistry,
		predicate_registry: &PredicateRegistry,
		endpoint_registry: &EndpointRegistry,
	) -> (Matcher, Vec<(Strng, CompileError)>) {
		let mut tree = PathTree::new(options.ignore_trailing_slash);
		let mut routes = Vec::with_capacity(defs.len());
		let mut failed = Vec::new();
		for def in defs {
			match compile_route(def, filter_registry, predicate_registry, endpoint_registry) {
				Ok((route, path)) => {
					let route = Arc::new(route);
					match tree.add(&path.pattern, path.subtree, route.strictness, route.clone()) {
						Ok(()) => routes.push(route),
						Err(e) => failed.push((def.id.clone(), e.into())),
					}
				},
				Err(e) => failed.push((def.id.clone(), e)),
			}
		}
		(Matcher { tree, routes }, failed)
	}

	pub fn match_request(&self, parts: &Parts) -> Option<(Arc<CompiledRoute>, Params)> {
		let path = clean_path(parts.uri.path());
		self
			.tree
			.lookup(&path, |route| route.matches_non_path(parts, &path))
	}

	pub fn routes(&self) -> &[Arc<CompiledRoute>] {
		&self.routes
	}
}

#[cfg(test)]
#[path = "matcher_test.rs"]
mod tests;
