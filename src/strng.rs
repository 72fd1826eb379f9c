/// Interned string used for route ids, hosts, parameter names, and other
/// small keys that are cloned on the hot path.
pub type Strng = arcstr::ArcStr;

pub use arcstr::format;
pub use arcstr::literal;

pub fn new<A: AsRef<str>>(s: A) -> Strng {
	Strng::from(s.as_ref())
}
