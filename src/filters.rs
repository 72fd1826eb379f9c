//! The filter surface: objects that observe or mutate the request on the way
//! in and the response on the way out, created by name from route documents.

use std::collections::HashMap;
use std::fmt::Debug;

use thiserror::Error;

use crate::endpoints::{self, FadeIn};
use crate::http::{Body, Request, Response, StatusCode};
use crate::types::{Arg, FilterSpec, Params, parse_flag_duration};
use crate::*;

/// Opaque per-request values filters share with each other and with the
/// dispatcher.
pub type StateBag = HashMap<Strng, serde_json::Value>;

/// Everything a filter may touch while a request is in flight.
pub struct RequestContext {
	pub request: Request,
	/// Set by the dispatcher after a backend call, or by a request-phase
	/// filter to short-circuit the rest of the chain.
	pub response: Option<Response>,
	pub state: StateBag,
	pub params: Params,
}

impl RequestContext {
	pub fn new(request: Request) -> Self {
		RequestContext {
			request,
			response: None,
			state: StateBag::new(),
			params: Params::new(),
		}
	}

	/// Short-circuit: the chain stops and this response is returned.
	pub fn serve(&mut self, response: Response) {
		self.response = Some(response);
	}

	pub fn served(&self) -> bool {
		self.response.is_some()
	}
}

#[cfg(test)]
impl PartialEq for dyn Filter {
	fn eq(&self, other: &Self) -> bool {
		std::ptr::eq(self, other)
	}
}

pub trait Filter: Debug + Send + Sync {
	fn request(&self, _ctx: &mut RequestContext) {}
	fn response(&self, _ctx: &mut RequestContext) {}
	/// Fade-in parameters this filter asserts for the route's endpoints.
	fn fade_in(&self) -> Option<FadeIn> {
		None
	}
	/// Endpoint replacement assertion, `(host:port, creation time)`.
	fn endpoint_created(&self) -> Option<(Strng, SystemTime)> {
		None
	}
	/// Called once when the owning table snapshot is retired.
	fn close(&self) {}
}

#[derive(Debug, Error, PartialEq)]
pub enum CreateError {
	#[error("unknown filter {0:?}")]
	Unknown(Strng),
	#[error("invalid arguments for {name}: {reason}")]
	InvalidArgs { name: Strng, reason: String },
}

pub type FilterFactory =
	Arc<dyn Fn(&[Arg]) -> Result<Arc<dyn Filter>, CreateError> + Send + Sync>;

pub struct FilterRegistry {
	factories: HashMap<Strng, FilterFactory>,
}

impl Debug for FilterRegistry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("FilterRegistry")
			.field("filters", &self.factories.keys().collect::<Vec<_>>())
			.finish()
	}
}

impl FilterRegistry {
	pub fn empty() -> Self {
		FilterRegistry {
			factories: HashMap::new(),
		}
	}

	pub fn builtin() -> Self {
		let mut r = Self::empty();
		r.register(strng::literal!("status"), Arc::new(Status::create));
		r.register(strng::literal!("inlineContent"), Arc::new(InlineContent::create));
		r.register(strng::literal!("setPath"), Arc::new(SetPath::create));
		r.register(
			strng::literal!("setRequestHeader"),
			Arc::new(SetRequestHeader::create),
		);
		r.register(
			strng::literal!("setResponseHeader"),
			Arc::new(SetResponseHeader::create),
		);
		r.register(strng::literal!("fadeIn"), Arc::new(FadeInFilter::create));
		r.register(
			strng::literal!("endpointCreated"),
			Arc::new(EndpointCreated::create),
		);
		r
	}

	pub fn register(&mut self, name: Strng, factory: FilterFactory) {
		self.factories.insert(name, factory);
	}

	pub fn create(&self, spec: &FilterSpec) -> Result<Arc<dyn Filter>, CreateError> {
		let factory = self
			.factories
			.get(&spec.name)
			.ok_or_else(|| CreateError::Unknown(spec.name.clone()))?;
		factory(&spec.args)
	}
}

fn invalid(name: &str, reason: impl Into<String>) -> CreateError {
	CreateError::InvalidArgs {
		name: name.into(),
		reason: reason.into(),
	}
}

fn duration_arg(a: &Arg) -> Option<Duration> {
	match a {
		Arg::String(s) => parse_flag_duration(s).ok(),
		Arg::Number(n) if *n >= 0.0 => Some(Duration::from_millis(*n as u64)),
		_ => None,
	}
}

/// `status(503)`: force the response status.
#[derive(Debug)]
struct Status(StatusCode);

impl Status {
	fn create(args: &[Arg]) -> Result<Arc<dyn Filter>, CreateError> {
		let code = args
			.first()
			.and_then(Arg::as_number)
			.and_then(|n| StatusCode::from_u16(n as u16).ok())
			.ok_or_else(|| invalid("status", "expected a status code"))?;
		Ok(Arc::new(Status(code)))
	}
}

impl Filter for Status {
	fn response(&self, ctx: &mut RequestContext) {
		if let Some(resp) = ctx.response.as_mut() {
			*resp.status_mut() = self.0;
		}
	}
}

/// `inlineContent("body")`: replace the response body.
#[derive(Debug)]
struct InlineContent {
	content: Strng,
	content_type: Strng,
}

impl InlineContent {
	fn create(args: &[Arg]) -> Result<Arc<dyn Filter>, CreateError> {
		let content = args
			.first()
			.and_then(Arg::as_str)
			.ok_or_else(|| invalid("inlineContent", "expected content"))?;
		let content_type = args.get(1).and_then(Arg::as_str).unwrap_or("text/plain");
		Ok(Arc::new(InlineContent {
			content: content.into(),
			content_type: content_type.into(),
		}))
	}
}

impl Filter for InlineContent {
	fn response(&self, ctx: &mut RequestContext) {
		if let Some(resp) = ctx.response.as_mut() {
			resp.headers_mut().remove(::http::header::CONTENT_LENGTH);
			if let Ok(ct) = ::http::HeaderValue::try_from(self.content_type.as_str()) {
				resp.headers_mut().insert(::http::header::CONTENT_TYPE, ct);
			}
			*resp.body_mut() = Body::from(self.content.to_string());
		}
	}
}

/// `setPath("/new/path")`: rewrite the request path, keeping the query.
#[derive(Debug)]
struct SetPath(Strng);

impl SetPath {
	fn create(args: &[Arg]) -> Result<Arc<dyn Filter>, CreateError> {
		let path = args
			.first()
			.and_then(Arg::as_str)
			.filter(|p| p.starts_with('/'))
			.ok_or_else(|| invalid("setPath", "expected an absolute path"))?;
		Ok(Arc::new(SetPath(path.into())))
	}
}

impl Filter for SetPath {
	fn request(&self, ctx: &mut RequestContext) {
		let uri = ctx.request.uri();
		let pq = match uri.query() {
			Some(q) => format!("{}?{q}", self.0),
			None => self.0.to_string(),
		};
		let mut parts = uri.clone().into_parts();
		match pq.parse() {
			Ok(pq) => parts.path_and_query = Some(pq),
			Err(e) => {
				debug!("setPath produced an invalid target {pq:?}: {e}");
				return;
			},
		}
		match ::http::Uri::from_parts(parts) {
			Ok(uri) => *ctx.request.uri_mut() = uri,
			Err(e) => debug!("setPath produced an invalid uri: {e}"),
		}
	}
}

#[derive(Debug)]
struct SetRequestHeader {
	name: ::http::HeaderName,
	value: ::http::HeaderValue,
}

impl SetRequestHeader {
	fn create(args: &[Arg]) -> Result<Arc<dyn Filter>, CreateError> {
		let (name, value) = header_args("setRequestHeader", args)?;
		Ok(Arc::new(SetRequestHeader { name, value }))
	}
}

impl Filter for SetRequestHeader {
	fn request(&self, ctx: &mut RequestContext) {
		ctx
			.request
			.headers_mut()
			.insert(self.name.clone(), self.value.clone());
	}
}

#[derive(Debug)]
struct SetResponseHeader {
	name: ::http::HeaderName,
	value: ::http::HeaderValue,
}

impl SetResponseHeader {
	fn create(args: &[Arg]) -> Result<Arc<dyn Filter>, CreateError> {
		let (name, value) = header_args("setResponseHeader", args)?;
		Ok(Arc::new(SetResponseHeader { name, value }))
	}
}

impl Filter for SetResponseHeader {
	fn response(&self, ctx: &mut RequestContext) {
		if let Some(resp) = ctx.response.as_mut() {
			resp.headers_mut().insert(self.name.clone(), self.value.clone());
		}
	}
}

fn header_args(
	filter: &str,
	args: &[Arg],
) -> Result<(::http::HeaderName, ::http::HeaderValue), CreateError> {
	let name = args
		.first()
		.and_then(Arg::as_str)
		.and_then(|n| n.parse::<::http::HeaderName>().ok())
		.ok_or_else(|| invalid(filter, "expected a header name"))?;
	let value = args
		.get(1)
		.and_then(Arg::as_str)
		.and_then(|v| ::http::HeaderValue::try_from(v).ok())
		.ok_or_else(|| invalid(filter, "expected a header value"))?;
	Ok((name, value))
}

/// `fadeIn("3m", 1.5)`: ramp up traffic to endpoints detected less than
/// the duration ago. Consumed by the endpoint registry post-processor.
#[derive(Debug)]
struct FadeInFilter(FadeIn);

impl FadeInFilter {
	fn create(args: &[Arg]) -> Result<Arc<dyn Filter>, CreateError> {
		let duration = args
			.first()
			.and_then(duration_arg)
			.filter(|d| !d.is_zero())
			.ok_or_else(|| invalid("fadeIn", "expected a positive duration"))?;
		let exponent = args.get(1).and_then(Arg::as_number).unwrap_or(1.0);
		Ok(Arc::new(FadeInFilter(FadeIn { duration, exponent })))
	}
}

impl Filter for FadeInFilter {
	fn fade_in(&self) -> Option<FadeIn> {
		Some(self.0)
	}
}

/// `endpointCreated("http://10.0.0.1:8080", 1718000000)`: assert the
/// creation time of an endpoint, resetting its detection time when the
/// endpoint was replaced behind an unchanged address.
#[derive(Debug)]
struct EndpointCreated {
	host: Strng,
	created: SystemTime,
}

impl EndpointCreated {
	fn create(args: &[Arg]) -> Result<Arc<dyn Filter>, CreateError> {
		let host = args
			.first()
			.and_then(Arg::as_str)
			.and_then(endpoints::endpoint_key)
			.ok_or_else(|| invalid("endpointCreated", "expected an endpoint url"))?;
		let secs = args
			.get(1)
			.and_then(Arg::as_number)
			.filter(|s| *s >= 0.0)
			.ok_or_else(|| invalid("endpointCreated", "expected a unix timestamp"))?;
		Ok(Arc::new(EndpointCreated {
			host,
			created: std::time::UNIX_EPOCH + Duration::from_secs_f64(secs),
		}))
	}
}

impl Filter for EndpointCreated {
	fn endpoint_created(&self) -> Option<(Strng, SystemTime)> {
		Some((self.host.clone(), self.created))
	}
}
