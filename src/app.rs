//! Process wiring: data sources into the route manager, the manager's table
//! into the proxy, the proxy behind the queueing listener, all of it behind
//! the first-load gate and the shutdown signal.

use crate::breaker::BreakerRegistry;
use crate::filters::FilterRegistry;
use crate::listener::QueueListener;
use crate::manager::{DataSource, FileSource, InlineSource, ManagerOptions, RouteManager};
use crate::matcher::MatchOptions;
use crate::metrics::Metrics;
use crate::predicates::PredicateRegistry;
use crate::proxy::{Proxy, ProxyOptions};
use crate::ratelimit::RatelimitRegistry;
use crate::*;

pub async fn run(config: Arc<Config>) -> anyhow::Result<()> {
	let shutdown = signal::Shutdown::new();
	let mut registry = prometheus_client::registry::Registry::with_prefix("switchyard");
	let metrics = Metrics::new(&mut registry);

	let mut sources: Vec<Arc<dyn DataSource>> = Vec::new();
	if let Some(doc) = &config.inline_routes {
		sources.push(Arc::new(InlineSource::parse(doc)?));
	}
	if let Some(path) = &config.routes_file {
		sources.push(Arc::new(FileSource::new(path.clone())));
	}
	if sources.is_empty() {
		anyhow::bail!("no route sources configured (set routesFile or inlineRoutes)");
	}

	let (manager, table, first_load) = RouteManager::new(
		sources,
		Arc::new(FilterRegistry::builtin()),
		Arc::new(PredicateRegistry::builtin()),
		ManagerOptions {
			poll_interval: config.poll_interval,
			match_options: MatchOptions {
				ignore_trailing_slash: config.ignore_trailing_slash,
			},
		},
		metrics.clone(),
	);
	let manager_task = tokio::spawn(manager.run());

	let breakers = Arc::new(BreakerRegistry::new(config.breakers.clone()));
	let redis_client = config
		.redis_url
		.as_deref()
		.map(redis::Client::open)
		.transpose()
		.map_err(|e| anyhow::anyhow!("redis url: {e}"))?;
	let limits = Arc::new(RatelimitRegistry::new(
		config.ratelimits.clone(),
		None,
		redis_client,
	));
	limits.spawn_janitors();

	let proxy = Proxy::new(
		table,
		breakers,
		limits,
		ProxyOptions {
			default_status: config.default_status,
			max_loopbacks: config.max_loopbacks,
			backend_timeout: config.backend_timeout,
			strip_hop_headers: config.strip_hop_headers,
		},
		metrics.clone(),
	);

	// do not accept a single connection before the first table is up
	first_load.wait().await;
	let listener = Arc::new(QueueListener::bind(
		config.address,
		config.listener.clone(),
		metrics,
	)?);
	info!(address = %listener.local_addr(), "serving");

	let accept_loop = {
		let listener = listener.clone();
		let proxy = proxy.clone();
		async move {
			loop {
				match listener.accept().await {
					Ok(conn) => {
						let proxy = proxy.clone();
						tokio::spawn(async move {
							proxy.serve_connection(conn).await;
						});
					},
					Err(e) => return anyhow::anyhow!("listener failed: {e}"),
				}
			}
		}
	};

	tokio::select! {
		err = accept_loop => {
			manager_task.abort();
			listener.shutdown();
			Err(err)
		},
		_ = shutdown.wait() => {
			info!("shutting down");
			listener.shutdown();
			manager_task.abort();
			Ok(())
		},
	}
}
