//! Parser for the textual route document syntax.
//!
//! ```text
//! api: Path("/api/:version/*rest") && Method("GET")
//!   -> setRequestHeader("X-Gateway", "switchyard")
//!   -> <roundRobin, "http://10.0.0.1:8080", "http://10.0.0.2:8080">;
//! health: Path("/healthz") -> status(200) -> <shunt>;
//! ```
//!
//! `parse_document(format_document(routes))` returns the same routes.

use thiserror::Error;

use super::{Arg, Backend, FilterSpec, PredicateSpec, RouteDefinition};
use crate::*;

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
	#[error("unexpected character {ch:?} at offset {at}")]
	UnexpectedChar { ch: char, at: usize },
	#[error("unterminated string literal at offset {at}")]
	UnterminatedString { at: usize },
	#[error("unterminated regexp literal at offset {at}")]
	UnterminatedRegexp { at: usize },
	#[error("invalid number {text:?} at offset {at}")]
	InvalidNumber { text: String, at: usize },
	#[error("expected {expected} at offset {at}, found {found}")]
	Expected {
		expected: &'static str,
		found: String,
		at: usize,
	},
	#[error("unexpected end of document, expected {expected}")]
	Eof { expected: &'static str },
	#[error("load balanced backend has no endpoints at offset {at}")]
	EmptyLoadBalanced { at: usize },
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
	Ident(String),
	Str(String),
	Number(f64),
	Regexp(String),
	Colon,
	Semi,
	Arrow,
	And,
	LParen,
	RParen,
	LAngle,
	RAngle,
	Comma,
	Star,
}

impl Tok {
	fn describe(&self) -> String {
		match self {
			Tok::Ident(s) => format!("identifier {s:?}"),
			Tok::Str(s) => format!("string {s:?}"),
			Tok::Number(n) => format!("number {n}"),
			Tok::Regexp(_) => "regexp".to_string(),
			Tok::Colon => "':'".to_string(),
			Tok::Semi => "';'".to_string(),
			Tok::Arrow => "'->'".to_string(),
			Tok::And => "'&&'".to_string(),
			Tok::LParen => "'('".to_string(),
			Tok::RParen => "')'".to_string(),
			Tok::LAngle => "'<'".to_string(),
			Tok::RAngle => "'>'".to_string(),
			Tok::Comma => "','".to_string(),
			Tok::Star => "'*'".to_string(),
		}
	}
}

fn lex(input: &str) -> Result<Vec<(Tok, usize)>, ParseError> {
	let mut toks = Vec::new();
	let bytes = input.as_bytes();
	let mut i = 0;
	while i < bytes.len() {
		let c = bytes[i] as char;
		match c {
			' ' | '\t' | '\r' | '\n' => i += 1,
			'/' if bytes.get(i + 1) == Some(&b'/') => {
				while i < bytes.len() && bytes[i] != b'\n' {
					i += 1;
				}
			},
			'/' => {
				// regexp literal, `\/` escapes the delimiter
				let start = i;
				i += 1;
				let mut raw = Vec::new();
				loop {
					match bytes.get(i) {
						None => return Err(ParseError::UnterminatedRegexp { at: start }),
						Some(b'/') => {
							i += 1;
							break;
						},
						Some(b'\\') if bytes.get(i + 1) == Some(&b'/') => {
							raw.push(b'/');
							i += 2;
						},
						Some(&b) => {
							raw.push(b);
							i += 1;
						},
					}
				}
				let text = String::from_utf8(raw)
					.map_err(|_| ParseError::UnterminatedRegexp { at: start })?;
				toks.push((Tok::Regexp(text), start));
			},
			'"' => {
				let start = i;
				i += 1;
				let mut raw = Vec::new();
				loop {
					match bytes.get(i) {
						None => return Err(ParseError::UnterminatedString { at: start }),
						Some(b'"') => {
							i += 1;
							break;
						},
						Some(b'\\') => {
							let esc = bytes
								.get(i + 1)
								.ok_or(ParseError::UnterminatedString { at: start })?;
							match esc {
								b'"' => raw.push(b'"'),
								b'\\' => raw.push(b'\\'),
								b'n' => raw.push(b'\n'),
								b't' => raw.push(b'\t'),
								b'r' => raw.push(b'\r'),
								b'/' => raw.push(b'/'),
								other => {
									return Err(ParseError::UnexpectedChar {
										ch: *other as char,
										at: i + 1,
									});
								},
							}
							i += 2;
						},
						Some(&b) => {
							raw.push(b);
							i += 1;
						},
					}
				}
				let text = String::from_utf8(raw)
					.map_err(|_| ParseError::UnterminatedString { at: start })?;
				toks.push((Tok::Str(text), start));
			},
			':' => {
				toks.push((Tok::Colon, i));
				i += 1;
			},
			';' => {
				toks.push((Tok::Semi, i));
				i += 1;
			},
			'(' => {
				toks.push((Tok::LParen, i));
				i += 1;
			},
			')' => {
				toks.push((Tok::RParen, i));
				i += 1;
			},
			'<' => {
				toks.push((Tok::LAngle, i));
				i += 1;
			},
			'>' => {
				toks.push((Tok::RAngle, i));
				i += 1;
			},
			',' => {
				toks.push((Tok::Comma, i));
				i += 1;
			},
			'*' => {
				toks.push((Tok::Star, i));
				i += 1;
			},
			'-' if bytes.get(i + 1) == Some(&b'>') => {
				toks.push((Tok::Arrow, i));
				i += 2;
			},
			'&' if bytes.get(i + 1) == Some(&b'&') => {
				toks.push((Tok::And, i));
				i += 2;
			},
			'-' | '0'..='9' => {
				let start = i;
				i += 1;
				while i < bytes.len()
					&& (bytes[i].is_ascii_digit() || bytes[i] == b'.' || bytes[i] == b'e' || bytes[i] == b'E')
				{
					i += 1;
				}
				let text = &input[start..i];
				let n: f64 = text.parse().map_err(|_| ParseError::InvalidNumber {
					text: text.to_string(),
					at: start,
				})?;
				toks.push((Tok::Number(n), start));
			},
			c if c.is_ascii_alphabetic() || c == '_' => {
				let start = i;
				while i < bytes.len()
					&& ((bytes[i] as char).is_ascii_alphanumeric() || bytes[i] == b'_')
				{
					i += 1;
				}
				toks.push((Tok::Ident(input[start..i].to_string()), start));
			},
			other => return Err(ParseError::UnexpectedChar { ch: other, at: i }),
		}
	}
	Ok(toks)
}

struct Parser {
	toks: Vec<(Tok, usize)>,
	pos: usize,
}

impl Parser {
	fn peek(&self) -> Option<&Tok> {
		self.toks.get(self.pos).map(|(t, _)| t)
	}

	fn next(&mut self, expected: &'static str) -> Result<(Tok, usize), ParseError> {
		let t = self
			.toks
			.get(self.pos)
			.cloned()
			.ok_or(ParseError::Eof { expected })?;
		self.pos += 1;
		Ok(t)
	}

	fn expect(&mut self, want: Tok, expected: &'static str) -> Result<usize, ParseError> {
		let (t, at) = self.next(expected)?;
		if t == want {
			Ok(at)
		} else {
			Err(ParseError::Expected {
				expected,
				found: t.describe(),
				at,
			})
		}
	}

	fn ident(&mut self, expected: &'static str) -> Result<(String, usize), ParseError> {
		let (t, at) = self.next(expected)?;
		match t {
			Tok::Ident(s) => Ok((s, at)),
			other => Err(ParseError::Expected {
				expected,
				found: other.describe(),
				at,
			}),
		}
	}

	fn args(&mut self) -> Result<Vec<Arg>, ParseError> {
		self.expect(Tok::LParen, "'('")?;
		let mut args = Vec::new();
		if self.peek() == Some(&Tok::RParen) {
			self.pos += 1;
			return Ok(args);
		}
		loop {
			let (t, at) = self.next("argument")?;
			let arg = match t {
				Tok::Str(s) => Arg::String(s.into()),
				Tok::Number(n) => Arg::Number(n),
				Tok::Regexp(r) => Arg::Regexp(r.into()),
				Tok::Ident(id) if id == "true" => Arg::Bool(true),
				Tok::Ident(id) if id == "false" => Arg::Bool(false),
				other => {
					return Err(ParseError::Expected {
						expected: "argument",
						found: other.describe(),
						at,
					});
				},
			};
			args.push(arg);
			let (t, at) = self.next("',' or ')'")?;
			match t {
				Tok::Comma => {},
				Tok::RParen => break,
				other => {
					return Err(ParseError::Expected {
						expected: "',' or ')'",
						found: other.describe(),
						at,
					});
				},
			}
		}
		Ok(args)
	}

	fn predicates(&mut self) -> Result<Vec<PredicateSpec>, ParseError> {
		if self.peek() == Some(&Tok::Star) {
			// match-all: no predicates
			self.pos += 1;
			return Ok(Vec::new());
		}
		let mut preds = Vec::new();
		loop {
			let (name, _) = self.ident("predicate name")?;
			let args = self.args()?;
			preds.push(PredicateSpec {
				name: name.into(),
				args,
			});
			if self.peek() == Some(&Tok::And) {
				self.pos += 1;
			} else {
				break;
			}
		}
		Ok(preds)
	}

	fn angle_backend(&mut self, at: usize) -> Result<Backend, ParseError> {
		// after the '<': either a special keyword or a load balanced set
		let mut algorithm = None;
		let mut endpoints = Vec::new();
		let mut first = true;
		loop {
			let (t, tat) = self.next("backend endpoint or '>'")?;
			match t {
				Tok::Ident(kw) if first => match kw.as_str() {
					"shunt" | "loopback" | "dynamic" => {
						self.expect(Tok::RAngle, "'>'")?;
						return Ok(match kw.as_str() {
							"shunt" => Backend::Shunt,
							"loopback" => Backend::Loopback,
							_ => Backend::Dynamic,
						});
					},
					_ => algorithm = Some(Strng::from(kw)),
				},
				Tok::Str(ep) => endpoints.push(Strng::from(ep)),
				other => {
					return Err(ParseError::Expected {
						expected: "backend endpoint",
						found: other.describe(),
						at: tat,
					});
				},
			}
			first = false;
			let (t, tat) = self.next("',' or '>'")?;
			match t {
				Tok::Comma => {},
				Tok::RAngle => break,
				other => {
					return Err(ParseError::Expected {
						expected: "',' or '>'",
						found: other.describe(),
						at: tat,
					});
				},
			}
		}
		if endpoints.is_empty() {
			return Err(ParseError::EmptyLoadBalanced { at });
		}
		Ok(Backend::LoadBalanced {
			algorithm,
			endpoints,
		})
	}

	fn route(&mut self) -> Result<RouteDefinition, ParseError> {
		let (id, _) = self.ident("route id")?;
		self.expect(Tok::Colon, "':'")?;
		let predicates = self.predicates()?;
		let mut filters = Vec::new();
		let backend = loop {
			self.expect(Tok::Arrow, "'->'")?;
			let (t, at) = self.next("filter or backend")?;
			match t {
				Tok::Str(addr) => break Backend::Network(addr.into()),
				Tok::LAngle => break self.angle_backend(at)?,
				Tok::Ident(name) => {
					let args = self.args()?;
					filters.push(FilterSpec {
						name: name.into(),
						args,
					});
				},
				other => {
					return Err(ParseError::Expected {
						expected: "filter or backend",
						found: other.describe(),
						at,
					});
				},
			}
		};
		Ok(RouteDefinition {
			id: id.into(),
			predicates,
			filters,
			backend,
		})
	}
}

/// Parse a route document: routes separated by `;`, `//` comments allowed.
pub fn parse_document(input: &str) -> Result<Vec<RouteDefinition>, ParseError> {
	let mut p = Parser {
		toks: lex(input)?,
		pos: 0,
	};
	let mut routes = Vec::new();
	loop {
		// tolerate stray separators between routes
		while p.peek() == Some(&Tok::Semi) {
			p.pos += 1;
		}
		if p.peek().is_none() {
			return Ok(routes);
		}
		routes.push(p.route()?);
		match p.peek() {
			Some(Tok::Semi) => p.pos += 1,
			None => return Ok(routes),
			Some(other) => {
				let at = p.toks[p.pos].1;
				return Err(ParseError::Expected {
					expected: "';'",
					found: other.describe(),
					at,
				});
			},
		}
	}
}

/// Parse exactly one route.
pub fn parse_route(input: &str) -> Result<RouteDefinition, ParseError> {
	let routes = parse_document(input)?;
	match routes.len() {
		1 => Ok(routes.into_iter().next().unwrap()),
		_ => Err(ParseError::Eof {
			expected: "exactly one route",
		}),
	}
}
