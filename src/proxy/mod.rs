//! Per-request orchestration: match a route, run its filter chain, consult
//! breakers and rate limits, dispatch (or shunt, or loop back), and stream
//! the response while keeping every counter honest, including when the
//! client goes away mid-request.

use std::convert::Infallible;
use std::net::IpAddr;

use ::http::uri::Uri;
use bytes::Bytes;
use hyper::body::Incoming;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};
use thiserror::Error;

use crate::breaker::{Breaker, BreakerRegistry};
use crate::endpoints::EndpointMetrics;
use crate::filters::{RequestContext, StateBag};
use crate::http::{Body, Request, Response, StatusCode, x_headers};
use crate::matcher::{BackendAddress, CompiledBackend, CompiledRoute};
use crate::metrics::Metrics;
use crate::ratelimit::RatelimitRegistry;
use crate::table::TableHandle;
use crate::*;

#[derive(Debug, Error)]
pub enum ProxyError {
	#[error("no route matched")]
	RouteNotFound,
	#[error("circuit breaker open")]
	BreakerOpen,
	#[error("rate limited, retry after {retry_after:?}")]
	RateLimited {
		hourly_equivalent: u64,
		retry_after: Duration,
	},
	#[error("loopback budget exhausted")]
	LoopbackBudget,
	#[error("backend {0} unreachable: {1}")]
	Backend(Strng, String),
	#[error("backend request timed out")]
	Timeout,
	#[error("no backend endpoints available")]
	NoEndpoints,
	#[error("invalid request: {0}")]
	Processing(String),
}

impl ProxyError {
	pub fn as_response(&self, default_status: StatusCode) -> Response {
		let builder = ::http::Response::builder();
		let resp = match self {
			ProxyError::RouteNotFound => builder.status(default_status).body(Body::empty()),
			ProxyError::BreakerOpen => builder
				.status(StatusCode::SERVICE_UNAVAILABLE)
				.header(x_headers::CIRCUIT_OPEN, "true")
				.body(Body::empty()),
			ProxyError::RateLimited {
				hourly_equivalent,
				retry_after,
			} => builder
				.status(StatusCode::TOO_MANY_REQUESTS)
				.header(x_headers::RATE_LIMIT, hourly_equivalent.to_string())
				.header(
					::http::header::RETRY_AFTER,
					retry_after_seconds(*retry_after).to_string(),
				)
				.body(Body::empty()),
			ProxyError::Timeout => builder
				.status(StatusCode::GATEWAY_TIMEOUT)
				.body(Body::empty()),
			ProxyError::Backend(..) | ProxyError::NoEndpoints => builder
				.status(StatusCode::BAD_GATEWAY)
				.body(Body::empty()),
			ProxyError::LoopbackBudget => builder
				.status(StatusCode::INTERNAL_SERVER_ERROR)
				.body(Body::empty()),
			ProxyError::Processing(_) => builder
				.status(StatusCode::BAD_REQUEST)
				.body(Body::empty()),
		};
		resp.expect("static response construction")
	}
}

fn retry_after_seconds(d: Duration) -> u64 {
	(d.as_secs_f64().ceil() as u64).max(1)
}

#[derive(Debug, Clone)]
pub struct ProxyOptions {
	/// Returned when no route matches.
	pub default_status: StatusCode,
	/// How many times a single request may re-enter routing.
	pub max_loopbacks: usize,
	pub backend_timeout: Duration,
	pub strip_hop_headers: bool,
}

impl Default for ProxyOptions {
	fn default() -> Self {
		ProxyOptions {
			default_status: StatusCode::NOT_FOUND,
			max_loopbacks: 9,
			backend_timeout: Duration::from_secs(60),
			strip_hop_headers: true,
		}
	}
}

struct ProxyInner {
	table: TableHandle,
	breakers: Arc<BreakerRegistry>,
	limits: Arc<RatelimitRegistry>,
	client: hyper_util::client::legacy::Client<HttpConnector, Body>,
	options: ProxyOptions,
	metrics: Arc<Metrics>,
}

#[derive(Clone)]
pub struct Proxy {
	inner: Arc<ProxyInner>,
}

impl Proxy {
	pub fn new(
		table: TableHandle,
		breakers: Arc<BreakerRegistry>,
		limits: Arc<RatelimitRegistry>,
		options: ProxyOptions,
		metrics: Arc<Metrics>,
	) -> Proxy {
		let client = hyper_util::client::legacy::Client::builder(TokioExecutor::new())
			.build_http::<Body>();
		Proxy {
			inner: Arc::new(ProxyInner {
				table,
				breakers,
				limits,
				client,
				options,
				metrics,
			}),
		}
	}

	/// Serve one admitted connection until the peer is done with it.
	pub async fn serve_connection(&self, conn: crate::listener::Connection) {
		let peer = conn.peer_addr();
		let proxy = self.clone();
		let service = hyper::service::service_fn(move |req: ::http::Request<Incoming>| {
			let proxy = proxy.clone();
			async move { Ok::<_, Infallible>(proxy.handle(req, peer.ip()).await) }
		});
		let builder = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
		if let Err(e) = builder
			.serve_connection_with_upgrades(TokioIo::new(conn), service)
			.await
		{
			debug!(%peer, "connection closed with error: {e}");
		}
	}

	/// One request, start to finish. Never fails: errors become the
	/// responses the policy table mandates.
	pub async fn handle<B>(&self, req: ::http::Request<B>, client: IpAddr) -> Response
	where
		B: http_body::Body<Data = Bytes> + Send + 'static,
		B::Error: Into<axum_core::BoxError>,
	{
		let req = req.map(Body::new);
		match self.handle_internal(req, client).await {
			Ok(resp) => resp,
			Err(e) => {
				debug!(client = %client, "request rejected: {e}");
				e.as_response(self.inner.options.default_status)
			},
		}
	}

	async fn handle_internal(
		&self,
		mut req: Request,
		client: IpAddr,
	) -> Result<Response, ProxyError> {
		// one snapshot for the whole request, loopbacks included
		let table = self.inner.table.load();
		let mut state = StateBag::new();

		for _ in 0..=self.inner.options.max_loopbacks {
			let (parts, body) = req.into_parts();
			let Some((route, params)) = table.matcher.match_request(&parts) else {
				return Err(ProxyError::RouteNotFound);
			};
			trace!(route = %route.id, path = parts.uri.path(), "matched");

			let mut ctx = RequestContext::new(Request::from_parts(parts, body));
			ctx.params = params;
			ctx.state = std::mem::take(&mut state);

			for f in &route.filters {
				f.request(&mut ctx);
				if ctx.served() {
					break;
				}
			}

			if !ctx.served() {
				match &route.backend {
					CompiledBackend::Shunt => {
						// filters shape the response; without any, a shunt
						// is an empty not-found
						ctx.serve(
							::http::Response::builder()
								.status(StatusCode::NOT_FOUND)
								.body(Body::empty())
								.expect("static response construction"),
						);
					},
					CompiledBackend::Loopback => {
						state = ctx.state;
						req = ctx.request;
						continue;
					},
					backend => {
						let resp = self.dispatch(&route, backend, &mut ctx, client).await?;
						ctx.serve(resp);
					},
				}
			}

			for f in route.filters.iter().rev() {
				f.response(&mut ctx);
			}
			return Ok(ctx.response.take().unwrap_or_else(|| {
				ProxyError::RouteNotFound.as_response(self.inner.options.default_status)
			}));
		}
		self.inner.metrics.loopback_exceeded.inc();
		Err(ProxyError::LoopbackBudget)
	}

	/// Policy checks and the backend call itself.
	async fn dispatch(
		&self,
		route: &CompiledRoute,
		backend: &CompiledBackend,
		ctx: &mut RequestContext,
		client: IpAddr,
	) -> Result<Response, ProxyError> {
		let now = SystemTime::now();
		let (address, endpoint) = match backend {
			CompiledBackend::Network(addr) => (addr.clone(), None),
			CompiledBackend::LoadBalanced { .. } => {
				let ep = backend
					.select_endpoint(&route.id, now)
					.ok_or(ProxyError::NoEndpoints)?;
				(ep.address.clone(), Some(ep.metrics.clone()))
			},
			CompiledBackend::Dynamic => {
				let authority = ctx
					.request
					.uri()
					.authority()
					.map(|a| a.as_str().to_string())
					.or_else(|| {
						ctx
							.request
							.headers()
							.get(::http::header::HOST)
							.and_then(|h| h.to_str().ok())
							.map(str::to_string)
					})
					.ok_or_else(|| ProxyError::Processing("dynamic backend without host".into()))?;
				(
					BackendAddress {
						scheme: strng::literal!("http"),
						authority: authority.into(),
					},
					None,
				)
			},
			// shunt and loopback never reach dispatch
			_ => return Err(ProxyError::Processing("backend is not dispatchable".into())),
		};

		let host = host_of(&address.authority);
		self.check_rate_limits(&host, client).await?;
		let breaker = self.inner.breakers.get(&host, None);
		if let Some(b) = &breaker {
			if !b.allow() {
				self.inner.metrics.breaker_rejected.inc();
				return Err(ProxyError::BreakerOpen);
			}
		}

		let report = breaker.clone().map(BreakerReport::new);
		let inflight = InflightGuard::new(endpoint);
		let resp = self.call_backend(&address, ctx, client).await;

		let outcome = match resp {
			Ok(mut resp) => {
				// the caller-side failure definition: 5xx counts against
				// the backend, everything else is a success
				let success = !resp.status().is_server_error();
				if let Some(r) = report {
					r.report(success);
				}
				if self.inner.options.strip_hop_headers {
					crate::http::strip_hop_headers(resp.headers_mut());
				}
				let endpoint = inflight.take();
				Ok(resp.map(|b| Body::new(CountedBody { inner: b, endpoint })))
			},
			Err(e) => {
				if let Some(r) = report {
					r.report(false);
				}
				drop(inflight);
				Err(e)
			},
		};
		if let Some(b) = &breaker {
			if b.state() == breaker::State::Open {
				self.inner.metrics.breaker_opens.inc();
			}
		}
		outcome
	}

	async fn check_rate_limits(&self, host: &Strng, client: IpAddr) -> Result<(), ProxyError> {
		let client = client.to_string();
		for limiter in self.inner.limits.limiters() {
			let settings = limiter.settings();
			let key = settings.key(&client, host);
			if !limiter.allow(&key).await {
				self.inner.metrics.ratelimit_rejected.inc();
				let retry_after = limiter.retry_after(&key).await;
				return Err(ProxyError::RateLimited {
					hourly_equivalent: settings.hourly_equivalent(),
					retry_after,
				});
			}
		}
		Ok(())
	}

	async fn call_backend(
		&self,
		address: &BackendAddress,
		ctx: &mut RequestContext,
		client: IpAddr,
	) -> Result<::http::Response<Incoming>, ProxyError> {
		let placeholder = ::http::Request::new(Body::empty());
		let req = std::mem::replace(&mut ctx.request, placeholder);
		let (mut parts, body) = req.into_parts();

		if self.inner.options.strip_hop_headers {
			crate::http::strip_hop_headers(&mut parts.headers);
		}
		crate::http::append_forwarded_for(&mut parts.headers, client);
		parts.uri = backend_uri(address, &parts.uri)?;

		let req = Request::from_parts(parts, body);
		debug!(uri = %req.uri(), "dispatching");
		let call = self.inner.client.request(req);
		match tokio::time::timeout(self.inner.options.backend_timeout, call).await {
			Ok(Ok(resp)) => Ok(resp),
			Ok(Err(e)) => Err(ProxyError::Backend(
				address.authority.clone(),
				e.to_string(),
			)),
			Err(_) => Err(ProxyError::Timeout),
		}
	}
}

fn host_of(authority: &str) -> Strng {
	match authority.rfind(':') {
		Some(i) if !authority[i..].contains(']') => strng::new(&authority[..i]),
		_ => strng::new(authority),
	}
}

fn backend_uri(address: &BackendAddress, uri: &Uri) -> Result<Uri, ProxyError> {
	let pq = uri
		.path_and_query()
		.map(|p| p.as_str())
		.unwrap_or("/");
	Uri::builder()
		.scheme(address.scheme.as_str())
		.authority(address.authority.as_str())
		.path_and_query(pq)
		.build()
		.map_err(|e| ProxyError::Processing(format!("backend uri: {e}")))
}

/// Reports to the breaker exactly once: explicitly on an outcome, or as a
/// failure if the request future is dropped mid-dispatch.
struct BreakerReport {
	breaker: Arc<Breaker>,
	reported: bool,
}

impl BreakerReport {
	fn new(breaker: Arc<Breaker>) -> BreakerReport {
		BreakerReport {
			breaker,
			reported: false,
		}
	}

	fn report(mut self, success: bool) {
		self.reported = true;
		self.breaker.done(success);
	}
}

impl Drop for BreakerReport {
	fn drop(&mut self) {
		if !self.reported {
			self.breaker.done(false);
		}
	}
}

/// Holds the endpoint in-flight count between selection and response-body
/// completion; cancellation anywhere on that path releases it.
struct InflightGuard {
	endpoint: Option<Arc<EndpointMetrics>>,
}

impl InflightGuard {
	fn new(endpoint: Option<Arc<EndpointMetrics>>) -> InflightGuard {
		if let Some(e) = &endpoint {
			e.inc_inflight();
		}
		InflightGuard { endpoint }
	}

	fn take(mut self) -> Option<Arc<EndpointMetrics>> {
		self.endpoint.take()
	}
}

impl Drop for InflightGuard {
	fn drop(&mut self) {
		if let Some(e) = &self.endpoint {
			e.dec_inflight();
		}
	}
}

pin_project_lite::pin_project! {
	/// Decrements the endpoint in-flight counter when the response body is
	/// done: fully streamed or dropped early, it ends exactly once.
	struct CountedBody {
		#[pin]
		inner: Incoming,
		endpoint: Option<Arc<EndpointMetrics>>,
	}

	impl PinnedDrop for CountedBody {
		fn drop(this: Pin<&mut Self>) {
			if let Some(e) = this.project().endpoint.take() {
				e.dec_inflight();
			}
		}
	}
}

impl http_body::Body for CountedBody {
	type Data = Bytes;
	type Error = hyper::Error;

	fn poll_frame(
		self: Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
	) -> std::task::Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
		self.project().inner.poll_frame(cx)
	}

	fn is_end_stream(&self) -> bool {
		self.inner.is_end_stream()
	}

	fn size_hint(&self) -> http_body::SizeHint {
		self.inner.size_hint()
	}
}

#[cfg(test)]
#[path = "proxy_test.rs"]
mod tests;
