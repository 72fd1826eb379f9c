use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;

use crate::breaker::BreakerSettings;
use crate::http::StatusCode;
use crate::listener::ListenerOptions;
use crate::ratelimit::RatelimitSettings;
use crate::*;

#[derive(Debug, Clone)]
pub struct Config {
	pub address: SocketAddr,
	pub routes_file: Option<PathBuf>,
	pub inline_routes: Option<String>,
	pub poll_interval: Duration,
	pub ignore_trailing_slash: bool,
	pub default_status: StatusCode,
	pub max_loopbacks: usize,
	pub backend_timeout: Duration,
	pub strip_hop_headers: bool,
	pub breakers: Vec<BreakerSettings>,
	pub ratelimits: Vec<RatelimitSettings>,
	pub redis_url: Option<String>,
	pub listener: ListenerOptions,
	pub num_worker_threads: usize,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawConfig {
	address: Option<String>,
	routes_file: Option<PathBuf>,
	inline_routes: Option<String>,
	poll_interval: Option<String>,
	ignore_trailing_slash: Option<bool>,
	default_status: Option<u16>,
	max_loopbacks: Option<usize>,
	backend_timeout: Option<String>,
	strip_hop_headers: Option<bool>,
	#[serde(default)]
	breakers: Vec<String>,
	#[serde(default)]
	ratelimits: Vec<String>,
	redis_url: Option<String>,
	listener: Option<RawListener>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawListener {
	max_concurrency: Option<usize>,
	max_queue_size: Option<usize>,
	queue_timeout: Option<String>,
	memory_limit: Option<u64>,
	connection_bytes: Option<u64>,
}

/// Build the effective configuration from an optional YAML document, with
/// environment variables taking precedence over the file.
pub fn parse_config(contents: &str) -> anyhow::Result<Config> {
	let raw: RawConfig = if contents.trim().is_empty() {
		RawConfig::default()
	} else {
		serde_yaml::from_str(contents)?
	};

	let address = parse::<String>("ADDRESS")?
		.or(raw.address)
		.unwrap_or_else(|| "0.0.0.0:9090".to_string())
		.parse::<SocketAddr>()
		.map_err(|e| anyhow::anyhow!("invalid listen address: {e}"))?;

	let default_status = parse::<u16>("DEFAULT_STATUS")?
		.or(raw.default_status)
		.map(|code| {
			StatusCode::from_u16(code).map_err(|_| anyhow::anyhow!("invalid default status {code}"))
		})
		.transpose()?
		.unwrap_or(StatusCode::NOT_FOUND);

	// breaker and rate limit flags contain commas, so env lists split on ';'
	let mut breakers = raw.breakers;
	if let Some(env) = parse::<String>("BREAKERS")? {
		breakers = env.split(';').map(str::to_string).collect();
	}
	let breakers = breakers
		.iter()
		.map(|f| {
			BreakerSettings::from_str(f).map_err(|e| anyhow::anyhow!("breaker flag {f:?}: {e}"))
		})
		.collect::<anyhow::Result<Vec<_>>>()?;

	let mut ratelimits = raw.ratelimits;
	if let Some(env) = parse::<String>("RATELIMITS")? {
		ratelimits = env.split(';').map(str::to_string).collect();
	}
	let ratelimits = ratelimits
		.iter()
		.map(|f| {
			RatelimitSettings::from_str(f).map_err(|e| anyhow::anyhow!("rate limit flag {f:?}: {e}"))
		})
		.collect::<anyhow::Result<Vec<_>>>()?;

	let raw_listener = raw.listener.unwrap_or_default();
	let defaults = ListenerOptions::default();
	let listener = ListenerOptions {
		max_concurrency: parse("MAX_CONCURRENCY")?
			.or(raw_listener.max_concurrency)
			.unwrap_or(0),
		max_queue_size: parse("MAX_QUEUE_SIZE")?
			.or(raw_listener.max_queue_size)
			.unwrap_or(0),
		queue_timeout: parse_duration("QUEUE_TIMEOUT")?
			.or(parse_raw_duration(raw_listener.queue_timeout.as_deref())?)
			.unwrap_or(defaults.queue_timeout),
		memory_limit: parse("MEMORY_LIMIT")?.or(raw_listener.memory_limit),
		connection_bytes: parse("CONNECTION_BYTES")?
			.or(raw_listener.connection_bytes)
			.unwrap_or(defaults.connection_bytes),
	};

	Ok(Config {
		address,
		routes_file: parse::<PathBuf>("ROUTES_FILE")?.or(raw.routes_file),
		inline_routes: parse::<String>("INLINE_ROUTES")?.or(raw.inline_routes),
		poll_interval: parse_duration("POLL_INTERVAL")?
			.or(parse_raw_duration(raw.poll_interval.as_deref())?)
			.unwrap_or(Duration::from_secs(3)),
		ignore_trailing_slash: parse("IGNORE_TRAILING_SLASH")?
			.or(raw.ignore_trailing_slash)
			.unwrap_or(false),
		default_status,
		max_loopbacks: parse("MAX_LOOPBACKS")?.or(raw.max_loopbacks).unwrap_or(9),
		backend_timeout: parse_duration("BACKEND_TIMEOUT")?
			.or(parse_raw_duration(raw.backend_timeout.as_deref())?)
			.unwrap_or(Duration::from_secs(60)),
		strip_hop_headers: parse("STRIP_HOP_HEADERS")?
			.or(raw.strip_hop_headers)
			.unwrap_or(true),
		breakers,
		ratelimits,
		redis_url: parse::<String>("REDIS_URL")?.or(raw.redis_url),
		listener,
		num_worker_threads: parse_worker_threads()?,
	})
}

fn parse<T: FromStr>(env: &str) -> anyhow::Result<Option<T>>
where
	<T as FromStr>::Err: ToString,
{
	match std::env::var(env) {
		Ok(val) => val
			.parse()
			.map(Some)
			.map_err(|e: <T as FromStr>::Err| {
				anyhow::anyhow!("invalid env var {}={} ({})", env, val, e.to_string())
			}),
		Err(_) => Ok(None),
	}
}

fn parse_duration(env: &str) -> anyhow::Result<Option<Duration>> {
	parse::<String>(env)?
		.map(|ds| {
			duration_str::parse(&ds).map_err(|e| anyhow::anyhow!("invalid env var {env}={ds} ({e})"))
		})
		.transpose()
}

fn parse_raw_duration(raw: Option<&str>) -> anyhow::Result<Option<Duration>> {
	raw
		.map(|ds| duration_str::parse(ds).map_err(|e| anyhow::anyhow!("invalid duration {ds:?} ({e})")))
		.transpose()
}

fn parse_worker_threads() -> anyhow::Result<usize> {
	match parse::<usize>("WORKER_THREADS")? {
		Some(n) if n > 0 => Ok(n),
		Some(_) => anyhow::bail!("WORKER_THREADS must be positive"),
		None => Ok(num_cpus::get()),
	}
}
