//! Metric monitoring for the master.
//! Counters are always live; serving them to a scraper is optional and
//! bound to a loopback port.

use std::net::IpAddr;

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, Opts, Registry};
use serde::Deserialize;
use tracing::info;
use utilities::task_scope;
use warp::Filter;

lazy_static! {
	static ref REGISTRY: Registry = Registry::new();
	pub static ref AUTH_REJECTS: IntCounterVec = IntCounterVec::new(
		Opts::new("auth_rejects", "Count of rejected authentication attempts"),
		&["reason"]
	)
	.expect("Metric successfully created");
	pub static ref RATE_LIMITED_REQUESTS: IntCounter = IntCounter::new(
		"rate_limited_requests",
		"Requests dropped by the malformed-token rate limiter"
	)
	.expect("Metric successfully created");
	pub static ref EVENTS_DROPPED: IntCounter = IntCounter::new(
		"events_dropped",
		"Contract events dropped because the bridge backlog was full"
	)
	.expect("Metric successfully created");
	pub static ref EVENTS_UNPARSEABLE: IntCounter = IntCounter::new(
		"events_unparseable",
		"Contract events skipped because their type or payload was unrecognized"
	)
	.expect("Metric successfully created");
	pub static ref STORE_WRITES_DROPPED: IntCounter = IntCounter::new(
		"store_writes_dropped",
		"Non-core store writes dropped over the soft capacity limit"
	)
	.expect("Metric successfully created");
	pub static ref PROXIED_REQUESTS: IntCounter = IntCounter::new(
		"proxied_requests",
		"Requests forwarded to the embedded control plane"
	)
	.expect("Metric successfully created");
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsSettings {
	pub enabled: bool,
	pub hostname: String,
	pub port: u16,
}

impl Default for MetricsSettings {
	fn default() -> Self {
		Self { enabled: false, hostname: "127.0.0.1".to_string(), port: 5566 }
	}
}

pub fn register_metrics() {
	for collector in [
		Box::new(AUTH_REJECTS.clone()) as Box<dyn prometheus::core::Collector>,
		Box::new(RATE_LIMITED_REQUESTS.clone()),
		Box::new(EVENTS_DROPPED.clone()),
		Box::new(EVENTS_UNPARSEABLE.clone()),
		Box::new(STORE_WRITES_DROPPED.clone()),
		Box::new(PROXIED_REQUESTS.clone()),
	] {
		REGISTRY.register(collector).expect("Metric successfully registered");
	}
}

#[tracing::instrument(name = "prometheus-metrics", skip_all)]
pub fn start(
	scope: &task_scope::Scope<anyhow::Error>,
	settings: &MetricsSettings,
) -> Result<(), anyhow::Error> {
	info!("Starting");
	let future = warp::serve(
		warp::any()
			.and(warp::path("metrics"))
			.and(warp::path::end())
			.map(metrics_handler),
	)
	.bind((settings.hostname.parse::<IpAddr>()?, settings.port));

	scope.spawn_weak(async move {
		future.await;
		Ok(())
	});

	Ok(())
}

fn metrics_handler() -> String {
	use prometheus::Encoder;
	let encoder = prometheus::TextEncoder::new();

	let mut buffer = Vec::new();
	if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
		tracing::error!("Could not encode metrics: {}", e);
	};
	String::from_utf8(buffer).unwrap_or_default()
}
