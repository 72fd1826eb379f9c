//! Pluggable request predicates. The structural predicates (path, method,
//! host, headers) compile directly into routes; everything else is looked up
//! here by name.

use std::collections::HashMap;
use std::fmt::Debug;

use ::http::request::Parts;
use thiserror::Error;

use crate::types::Arg;
use crate::*;

pub trait Predicate: Debug + Send + Sync {
	fn matches(&self, req: &Parts) -> bool;
}

#[derive(Debug, Error, PartialEq)]
pub enum CreateError {
	#[error("unknown predicate {0:?}")]
	Unknown(Strng),
	#[error("invalid arguments for {name}: {reason}")]
	InvalidArgs { name: Strng, reason: String },
}

pub type PredicateFactory =
	Arc<dyn Fn(&[Arg]) -> Result<Arc<dyn Predicate>, CreateError> + Send + Sync>;

pub struct PredicateRegistry {
	factories: HashMap<Strng, PredicateFactory>,
}

impl Debug for PredicateRegistry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PredicateRegistry")
			.field("predicates", &self.factories.keys().collect::<Vec<_>>())
			.finish()
	}
}

impl PredicateRegistry {
	pub fn empty() -> Self {
		PredicateRegistry {
			factories: HashMap::new(),
		}
	}

	pub fn builtin() -> Self {
		let mut r = Self::empty();
		r.register(strng::literal!("QueryParam"), Arc::new(QueryParam::create));
		r
	}

	pub fn register(&mut self, name: Strng, factory: PredicateFactory) {
		self.factories.insert(name, factory);
	}

	pub fn create(&self, name: &Strng, args: &[Arg]) -> Result<Arc<dyn Predicate>, CreateError> {
		let factory = self
			.factories
			.get(name)
			.ok_or_else(|| CreateError::Unknown(name.clone()))?;
		factory(args)
	}
}

/// `QueryParam("key")`: the parameter is present;
/// `QueryParam("key", /pattern/)`: some value of it matches.
#[derive(Debug)]
struct QueryParam {
	key: Strng,
	value: Option<regex::Regex>,
}

impl QueryParam {
	fn create(args: &[Arg]) -> Result<Arc<dyn Predicate>, CreateError> {
		let key = args
			.first()
			.and_then(Arg::as_str)
			.ok_or_else(|| CreateError::InvalidArgs {
				name: "QueryParam".into(),
				reason: "expected a parameter name".into(),
			})?;
		let value = args
			.get(1)
			.map(|a| {
				a.as_pattern()
					.and_then(|p| regex::Regex::new(p).ok())
					.ok_or_else(|| CreateError::InvalidArgs {
						name: "QueryParam".into(),
						reason: "expected a value pattern".into(),
					})
			})
			.transpose()?;
		Ok(Arc::new(QueryParam {
			key: key.into(),
			value,
		}))
	}
}

impl Predicate for QueryParam {
	fn matches(&self, req: &Parts) -> bool {
		let Some(query) = req.uri.query() else {
			return false;
		};
		query.split('&').any(|pair| {
			let (k, v) = match pair.split_once('=') {
				Some((k, v)) => (k, v),
				None => (pair, ""),
			};
			if k != self.key.as_str() {
				return false;
			}
			match &self.value {
				Some(re) => re.is_match(v),
				None => true,
			}
		})
	}
}
