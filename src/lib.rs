pub mod app;
pub mod breaker;
pub mod config;
pub mod endpoints;
pub mod filters;
pub mod http;
pub mod listener;
pub mod manager;
pub mod matcher;
pub mod metrics;
pub mod predicates;
pub mod proxy;
pub mod ratelimit;
pub mod sampler;
pub mod signal;
pub mod strng;
pub mod table;
pub mod telemetry;
pub mod types;

pub use config::Config;
pub use strng::Strng;

// Shared imports, pulled in by modules with `use crate::*`.
pub use std::pin::Pin;
pub use std::sync::Arc;
pub use std::time::{Duration, Instant, SystemTime};

pub use tracing::{debug, error, info, trace, warn};
