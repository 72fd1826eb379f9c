use ::http::request::Parts;
use ::http::{HeaderMap, header};

pub type Error = axum_core::Error;
pub type Body = axum_core::body::Body;
pub type Request = ::http::Request<Body>;
pub type Response = ::http::Response<Body>;

pub use ::http::uri::{Authority, Scheme};
pub use ::http::{HeaderName, HeaderValue, Method, StatusCode, Uri};

pub mod x_headers {
	use ::http::HeaderName;

	pub const CIRCUIT_OPEN: HeaderName = HeaderName::from_static("x-circuit-open");
	pub const RATE_LIMIT: HeaderName = HeaderName::from_static("x-rate-limit");
	pub const FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
}

/// Request host: the URI authority when present (HTTP/2, absolute form),
/// otherwise the Host header. Ports are stripped.
pub fn get_host(parts: &Parts) -> Option<&str> {
	let raw = parts
		.uri
		.authority()
		.map(|a| a.as_str())
		.or_else(|| {
			parts
				.headers
				.get(header::HOST)
				.and_then(|h| h.to_str().ok())
		})?;
	// strip :port; v6 literals keep their brackets
	Some(match raw.rfind(':') {
		Some(i) if !raw[i..].contains(']') => &raw[..i],
		_ => raw,
	})
}

// Hop-by-hop headers, removed on the forward path per RFC 7230. The
// non-standard proxy-connection is still emitted by some clients.
static HOP_HEADERS: [HeaderName; 9] = [
	header::CONNECTION,
	HeaderName::from_static("proxy-connection"),
	HeaderName::from_static("keep-alive"),
	header::PROXY_AUTHENTICATE,
	header::PROXY_AUTHORIZATION,
	header::TE,
	header::TRAILER,
	header::TRANSFER_ENCODING,
	header::UPGRADE,
];

pub fn strip_hop_headers(headers: &mut HeaderMap) {
	for h in HOP_HEADERS.iter() {
		headers.remove(h);
	}
}

/// Append the peer address to X-Forwarded-For.
pub fn append_forwarded_for(headers: &mut HeaderMap, peer: std::net::IpAddr) {
	let entry = match headers.get(x_headers::FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
		Some(existing) => format!("{existing}, {peer}"),
		None => peer.to_string(),
	};
	if let Ok(v) = HeaderValue::try_from(entry) {
		headers.insert(x_headers::FORWARDED_FOR, v);
	}
}
