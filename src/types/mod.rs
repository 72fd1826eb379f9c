pub mod parse;

use std::fmt;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::*;

/// Path parameters captured by wildcard segments during matching.
pub type Params = std::collections::HashMap<Strng, String>;

/// A literal argument to a predicate or filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Arg {
	String(Strng),
	Number(f64),
	/// Regexp source text, without the `/` delimiters.
	Regexp(Strng),
	Bool(bool),
}

impl Arg {
	pub fn as_str(&self) -> Option<&str> {
		match self {
			Arg::String(s) => Some(s),
			_ => None,
		}
	}

	pub fn as_number(&self) -> Option<f64> {
		match self {
			Arg::Number(n) => Some(*n),
			_ => None,
		}
	}

	/// String and regexp args both carry pattern text; predicates like
	/// `Host` accept either form.
	pub fn as_pattern(&self) -> Option<&str> {
		match self {
			Arg::String(s) | Arg::Regexp(s) => Some(s),
			_ => None,
		}
	}
}

impl fmt::Display for Arg {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Arg::String(s) => {
				// JSON string escaping matches what the lexer understands
				let quoted = serde_json::to_string(s.as_str()).map_err(|_| fmt::Error)?;
				f.write_str(&quoted)
			},
			Arg::Number(n) => {
				if n.fract() == 0.0 && n.abs() < 1e15 {
					write!(f, "{}", *n as i64)
				} else {
					write!(f, "{n}")
				}
			},
			Arg::Regexp(r) => {
				write!(f, "/")?;
				for c in r.chars() {
					if c == '/' {
						write!(f, "\\/")?;
					} else {
						write!(f, "{c}")?;
					}
				}
				write!(f, "/")
			},
			Arg::Bool(b) => write!(f, "{b}"),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredicateSpec {
	pub name: Strng,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub args: Vec<Arg>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterSpec {
	pub name: Strng,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub args: Vec<Arg>,
}

impl fmt::Display for PredicateSpec {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write_call(f, &self.name, &self.args)
	}
}

impl fmt::Display for FilterSpec {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write_call(f, &self.name, &self.args)
	}
}

fn write_call(f: &mut fmt::Formatter<'_>, name: &str, args: &[Arg]) -> fmt::Result {
	write!(f, "{name}({})", args.iter().map(Arg::to_string).join(", "))
}

/// Where a matched request goes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Backend {
	/// Forward to a single network address, e.g. `https://host:port`.
	Network(Strng),
	/// Respond without any network call; filters produce the response.
	Shunt,
	/// Re-enter routing with the (possibly rewritten) request.
	Loopback,
	/// Target is derived from the request itself at dispatch time.
	Dynamic,
	/// Forward to one of a set of endpoints.
	LoadBalanced {
		#[serde(default, skip_serializing_if = "Option::is_none")]
		algorithm: Option<Strng>,
		endpoints: Vec<Strng>,
	},
}

impl fmt::Display for Backend {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Backend::Network(addr) => {
				let quoted = serde_json::to_string(addr.as_str()).map_err(|_| fmt::Error)?;
				f.write_str(&quoted)
			},
			Backend::Shunt => write!(f, "<shunt>"),
			Backend::Loopback => write!(f, "<loopback>"),
			Backend::Dynamic => write!(f, "<dynamic>"),
			Backend::LoadBalanced {
				algorithm,
				endpoints,
			} => {
				write!(f, "<")?;
				let mut first = true;
				if let Some(alg) = algorithm {
					write!(f, "{alg}")?;
					first = false;
				}
				for ep in endpoints {
					if !first {
						write!(f, ", ")?;
					}
					first = false;
					let quoted = serde_json::to_string(ep.as_str()).map_err(|_| fmt::Error)?;
					f.write_str(&quoted)?;
				}
				write!(f, ">")
			},
		}
	}
}

/// One parsed route: `id: PREDICATES -> FILTERS -> BACKEND`.
///
/// Ids are unique within one data source; collisions across sources are
/// resolved last-writer-wins by the route manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteDefinition {
	pub id: Strng,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub predicates: Vec<PredicateSpec>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub filters: Vec<FilterSpec>,
	pub backend: Backend,
}

impl fmt::Display for RouteDefinition {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}: ", self.id)?;
		if self.predicates.is_empty() {
			write!(f, "*")?;
		} else {
			for (i, p) in self.predicates.iter().enumerate() {
				if i > 0 {
					write!(f, " && ")?;
				}
				write!(f, "{p}")?;
			}
		}
		for filter in &self.filters {
			write!(f, " -> {filter}")?;
		}
		write!(f, " -> {};", self.backend)
	}
}

/// Print a route set the way `parse::parse_document` reads it back.
pub fn format_document(routes: &[RouteDefinition]) -> String {
	use std::fmt::Write;
	let mut out = String::new();
	for r in routes {
		let _ = writeln!(out, "{r}");
	}
	out
}

#[derive(Debug, Error, PartialEq)]
#[error("invalid duration {0:?}")]
pub struct DurationError(pub String);

/// Durations in flag grammars: `150ms`, `10s`, `5m`, `1h`, or a bare integer
/// taken as milliseconds.
pub fn parse_flag_duration(s: &str) -> Result<Duration, DurationError> {
	let s = s.trim();
	let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
		Some(i) => s.split_at(i),
		None => (s, ""),
	};
	let n: u64 = digits
		.parse()
		.map_err(|_| DurationError(s.to_string()))?;
	match unit {
		"" => Ok(Duration::from_millis(n)),
		"ms" => Ok(Duration::from_millis(n)),
		"s" => Ok(Duration::from_secs(n)),
		"m" => Ok(Duration::from_secs(n * 60)),
		"h" => Ok(Duration::from_secs(n * 3600)),
		_ => Err(DurationError(s.to_string())),
	}
}
