//! Path trie. Nodes key literal segments, at most one `:name` simple
//! wildcard edge, and free-form `*name` tails that capture the rest of the
//! path including slashes. Leaves at one position are ordered by priority
//! (strictness) descending; lookup backtracks on dead ends.

use std::collections::HashMap;

use thiserror::Error;

use crate::types::Params;
use crate::*;

#[derive(Debug, Error, PartialEq)]
pub enum TreeError {
	#[error("path pattern {0:?} must start with '/'")]
	InvalidPattern(String),
	#[error("free-form wildcard {0:?} must be the final segment")]
	CatchAllNotLast(String),
	#[error("subtree pattern {0:?} may not contain a free-form wildcard")]
	CatchAllInSubtree(String),
	#[error("wildcard segment in {0:?} has no name")]
	EmptyWildcard(String),
	#[error("conflicting wildcard names {0:?} and {1:?} at the same position")]
	WildcardConflict(Strng, Strng),
}

struct Wildcard<L> {
	name: Strng,
	node: Box<Node<L>>,
}

struct LeafEntry<L> {
	priority: usize,
	leaf: L,
}

struct CatchLeaf<L> {
	name: Strng,
	/// Subtree leaves also match when the tail is empty (`/p` and `/p/`).
	allow_empty: bool,
	priority: usize,
	leaf: L,
}

struct Node<L> {
	literal: HashMap<String, Node<L>>,
	wildcard: Option<Wildcard<L>>,
	catchall: Vec<CatchLeaf<L>>,
	leaves: Vec<LeafEntry<L>>,
}

impl<L> Default for Node<L> {
	fn default() -> Self {
		Node {
			literal: HashMap::new(),
			wildcard: None,
			catchall: Vec::new(),
			leaves: Vec::new(),
		}
	}
}

pub struct PathTree<L> {
	root: Node<L>,
	ignore_trailing_slash: bool,
}

/// Stable insert keeping the vec sorted by priority descending; equal
/// priorities keep registration order.
fn insert_by_priority<T>(v: &mut Vec<T>, item: T, priority: impl Fn(&T) -> usize) {
	let p = priority(&item);
	let at = v
		.iter()
		.position(|existing| priority(existing) < p)
		.unwrap_or(v.len());
	v.insert(at, item);
}

impl<L: Clone> PathTree<L> {
	pub fn new(ignore_trailing_slash: bool) -> Self {
		PathTree {
			root: Node::default(),
			ignore_trailing_slash,
		}
	}

	/// Register a leaf under a path pattern. `subtree` attaches a synthetic
	/// `*` tail that also accepts the empty remainder.
	pub fn add(
		&mut self,
		pattern: &str,
		subtree: bool,
		priority: usize,
		leaf: L,
	) -> Result<(), TreeError> {
		if !pattern.starts_with('/') {
			return Err(TreeError::InvalidPattern(pattern.to_string()));
		}
		let mut pat = pattern;
		if (subtree || self.ignore_trailing_slash) && pat.len() > 1 {
			pat = pat.trim_end_matches('/');
			if pat.is_empty() {
				pat = "/";
			}
		}
		let segments = split_segments(pat);
		let mut node = &mut self.root;
		for (i, seg) in segments.iter().enumerate() {
			if let Some(name) = seg.strip_prefix('*') {
				if name.is_empty() {
					return Err(TreeError::EmptyWildcard(pattern.to_string()));
				}
				if i != segments.len() - 1 {
					return Err(TreeError::CatchAllNotLast(pattern.to_string()));
				}
				if subtree {
					return Err(TreeError::CatchAllInSubtree(pattern.to_string()));
				}
				insert_by_priority(
					&mut node.catchall,
					CatchLeaf {
						name: name.into(),
						allow_empty: false,
						priority,
						leaf,
					},
					|c| c.priority,
				);
				return Ok(());
			}
			if let Some(name) = seg.strip_prefix(':') {
				if name.is_empty() {
					return Err(TreeError::EmptyWildcard(pattern.to_string()));
				}
				let w = node.wildcard.get_or_insert_with(|| Wildcard {
					name: name.into(),
					node: Box::default(),
				});
				if w.name != name {
					return Err(TreeError::WildcardConflict(w.name.clone(), name.into()));
				}
				node = w.node.as_mut();
			} else {
				node = node.literal.entry((*seg).to_string()).or_default();
			}
		}
		if subtree {
			insert_by_priority(
				&mut node.catchall,
				CatchLeaf {
					name: strng::literal!("*"),
					allow_empty: true,
					priority,
					leaf,
				},
				|c| c.priority,
			);
		} else {
			insert_by_priority(&mut node.leaves, LeafEntry { priority, leaf }, |l| {
				l.priority
			});
		}
		Ok(())
	}

	/// Find the highest-priority leaf whose pattern covers `path` and which
	/// passes `check`. Captured wildcard segments come back as parameters;
	/// free-form tails include the leading slash.
	pub fn lookup<F>(&self, path: &str, check: F) -> Option<(L, Params)>
	where
		F: Fn(&L) -> bool,
	{
		if !path.starts_with('/') {
			return None;
		}
		let mut path = path;
		if self.ignore_trailing_slash && path.len() > 1 && path.ends_with('/') {
			path = path.trim_end_matches('/');
			if path.is_empty() {
				path = "/";
			}
		}
		let segments = split_segments(path);
		let mut captures: Vec<(Strng, String)> = Vec::new();
		let (leaf, tail) = walk(&self.root, &segments, &mut captures, &check)?;
		let mut params: Params = captures.into_iter().collect();
		if let Some((name, value)) = tail {
			params.insert(name, value);
		}
		Some((leaf, params))
	}
}

fn split_segments(path: &str) -> Vec<&str> {
	let rest = &path[1..];
	if rest.is_empty() {
		Vec::new()
	} else {
		rest.split('/').collect()
	}
}

type Hit<L> = (L, Option<(Strng, String)>);

fn walk<L: Clone, F>(
	node: &Node<L>,
	segments: &[&str],
	captures: &mut Vec<(Strng, String)>,
	check: &F,
) -> Option<Hit<L>>
where
	F: Fn(&L) -> bool,
{
	let Some((head, rest)) = segments.split_first() else {
		return terminal(node, check);
	};
	if let Some(child) = node.literal.get(*head) {
		if let Some(hit) = walk(child, rest, captures, check) {
			return Some(hit);
		}
	}
	if !head.is_empty() {
		if let Some(w) = &node.wildcard {
			captures.push((w.name.clone(), (*head).to_string()));
			if let Some(hit) = walk(&w.node, rest, captures, check) {
				return Some(hit);
			}
			captures.pop();
		}
	}
	for c in &node.catchall {
		if check(&c.leaf) {
			let tail = format!("/{}", segments.join("/"));
			return Some((c.leaf.clone(), Some((c.name.clone(), tail))));
		}
	}
	None
}

/// Path fully consumed: exact leaves and empty-accepting subtree tails
/// compete at the same position, ordered by priority across both lists.
fn terminal<L: Clone, F>(node: &Node<L>, check: &F) -> Option<Hit<L>>
where
	F: Fn(&L) -> bool,
{
	let mut leaves = node.leaves.iter().peekable();
	let mut tails = node
		.catchall
		.iter()
		.filter(|c| c.allow_empty)
		.peekable();
	loop {
		let take_leaf = match (leaves.peek(), tails.peek()) {
			(Some(l), Some(c)) => l.priority >= c.priority,
			(Some(_), None) => true,
			(None, Some(_)) => false,
			(None, None) => return None,
		};
		if take_leaf {
			let l = leaves.next().unwrap();
			if check(&l.leaf) {
				return Some((l.leaf.clone(), None));
			}
		} else {
			let c = tails.next().unwrap();
			if check(&c.leaf) {
				return Some((c.leaf.clone(), Some((c.name.clone(), "/".to_string()))));
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn any(_: &&str) -> bool {
		true
	}

	#[test]
	fn literal_wins_over_wildcards() {
		let mut t: PathTree<&str> = PathTree::new(false);
		t.add("/a/b", false, 0, "literal").unwrap();
		t.add("/a/:x", false, 0, "simple").unwrap();
		t.add("/a/*rest", false, 0, "free").unwrap();
		assert_eq!(t.lookup("/a/b", any).unwrap().0, "literal");
		assert_eq!(t.lookup("/a/c", any).unwrap().0, "simple");
		assert_eq!(t.lookup("/a/c/d", any).unwrap().0, "free");
	}

	#[test]
	fn wildcard_captures_segment() {
		let mut t: PathTree<&str> = PathTree::new(false);
		t.add("/users/:id/posts/:post", false, 0, "r").unwrap();
		let (_, params) = t.lookup("/users/7/posts/42", any).unwrap();
		assert_eq!(params.get("id").map(String::as_str), Some("7"));
		assert_eq!(params.get("post").map(String::as_str), Some("42"));
	}

	#[test]
	fn free_form_captures_tail_with_slashes() {
		let mut t: PathTree<&str> = PathTree::new(false);
		t.add("/static/*filepath", false, 0, "r").unwrap();
		let (_, params) = t.lookup("/static/css/site.css", any).unwrap();
		assert_eq!(
			params.get("filepath").map(String::as_str),
			Some("/css/site.css")
		);
		// no tail at all does not match a plain free-form wildcard
		assert!(t.lookup("/static", any).is_none());
	}

	#[test]
	fn backtracks_from_dead_literal() {
		let mut t: PathTree<&str> = PathTree::new(false);
		t.add("/a/b/c", false, 0, "deep").unwrap();
		t.add("/a/*rest", false, 0, "free").unwrap();
		// /a/b/x walks into the b literal child, dead-ends, and falls back
		assert_eq!(t.lookup("/a/b/x", any).unwrap().0, "free");
	}

	#[test]
	fn subtree_matches_prefix_and_suffixes() {
		let mut t: PathTree<&str> = PathTree::new(false);
		t.add("/p", true, 0, "sub").unwrap();
		for (path, tail) in [("/p", "/"), ("/p/", "/"), ("/p/x/y", "/x/y")] {
			let (leaf, params) = t.lookup(path, any).unwrap();
			assert_eq!(leaf, "sub", "path {path}");
			assert_eq!(params.get("*").map(String::as_str), Some(tail), "path {path}");
		}
		assert!(t.lookup("/q", any).is_none());
	}

	#[test]
	fn strictness_orders_leaves_across_kinds() {
		// a stricter subtree leaf is tried before a lax exact leaf at the
		// same position
		let mut t: PathTree<&str> = PathTree::new(false);
		t.add("/foo", false, 0, "lax").unwrap();
		t.add("/foo/", true, 1, "strict").unwrap();
		assert_eq!(t.lookup("/foo", |l| *l != "strict").unwrap().0, "lax");
		assert_eq!(t.lookup("/foo", any).unwrap().0, "strict");
	}

	#[test]
	fn trailing_slash_distinct_by_default() {
		let mut t: PathTree<&str> = PathTree::new(false);
		t.add("/foo", false, 0, "bare").unwrap();
		t.add("/foo/", false, 0, "slash").unwrap();
		assert_eq!(t.lookup("/foo", any).unwrap().0, "bare");
		assert_eq!(t.lookup("/foo/", any).unwrap().0, "slash");
	}

	#[test]
	fn trailing_slash_ignored_when_configured() {
		let mut t: PathTree<&str> = PathTree::new(true);
		t.add("/foo/", false, 0, "r").unwrap();
		assert_eq!(t.lookup("/foo", any).unwrap().0, "r");
		assert_eq!(t.lookup("/foo/", any).unwrap().0, "r");
	}

	#[test]
	fn rejects_malformed_patterns() {
		let mut t: PathTree<&str> = PathTree::new(false);
		assert_eq!(
			t.add("relative", false, 0, "r"),
			Err(TreeError::InvalidPattern("relative".into()))
		);
		assert_eq!(
			t.add("/a/*x/b", false, 0, "r"),
			Err(TreeError::CatchAllNotLast("/a/*x/b".into()))
		);
		assert_eq!(
			t.add("/a/*x/*y", false, 0, "r"),
			Err(TreeError::CatchAllNotLast("/a/*x/*y".into()))
		);
		assert_eq!(
			t.add("/a/:/b", false, 0, "r"),
			Err(TreeError::EmptyWildcard("/a/:/b".into()))
		);
		t.add("/c/:id", false, 0, "r").unwrap();
		assert_eq!(
			t.add("/c/:other", false, 0, "r"),
			Err(TreeError::WildcardConflict("id".into(), "other".into()))
		);
	}

	#[test]
	fn priority_orders_candidates() {
		let mut t: PathTree<&str> = PathTree::new(false);
		t.add("/x", false, 1, "one").unwrap();
		t.add("/x", false, 3, "three").unwrap();
		t.add("/x", false, 2, "two").unwrap();
		assert_eq!(t.lookup("/x", any).unwrap().0, "three");
		assert_eq!(t.lookup("/x", |l| *l != "three").unwrap().0, "two");
		assert_eq!(
			t.lookup("/x", |l| *l != "three" && *l != "two").unwrap().0,
			"one"
		);
	}

	#[test]
	fn match_all_via_root_subtree() {
		let mut t: PathTree<&str> = PathTree::new(false);
		t.add("/", true, 0, "all").unwrap();
		t.add("/api", false, 1, "api").unwrap();
		assert_eq!(t.lookup("/api", any).unwrap().0, "api");
		assert_eq!(t.lookup("/anything/else", any).unwrap().0, "all");
		assert_eq!(t.lookup("/", any).unwrap().0, "all");
	}
}
