//! Long-lived contract event subscription over WebSocket.
//!
//! Reconnects with the crate's backoff policy on any failure, resuming from
//! the last observed event cursor. A watchdog tears the connection down
//! when nothing (not even a keep-alive) arrives within twice the keep-alive
//! interval.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use jsonrpsee::{
	core::client::{Subscription, SubscriptionClientT},
	rpc_params,
	ws_client::WsClientBuilder,
};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::{
	events::{ContractEvent, EventCursor},
	retrier::BackoffPolicy,
};

pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

// Reconnect attempts are unbounded; only the delay growth is capped.
const MAX_BACKOFF_EXPONENT: u32 = 5;

/// Server-side event filter: the emitting package and module.
#[derive(Debug, Clone, Serialize)]
pub struct EventFilter {
	pub package: String,
	pub module: String,
}

pub struct EventSubscription {
	ws_endpoint: String,
	filter: EventFilter,
	keep_alive_interval: Duration,
	backoff: BackoffPolicy,
	cursor: Option<EventCursor>,
}

impl EventSubscription {
	pub fn new(ws_endpoint: &str, filter: EventFilter) -> Self {
		Self {
			ws_endpoint: ws_endpoint.to_string(),
			filter,
			keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
			backoff: BackoffPolicy::default(),
			cursor: None,
		}
	}

	pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
		self.keep_alive_interval = interval;
		self
	}

	/// Drive the subscription until `event_sender`'s receiver is dropped.
	/// Every delivered event advances the resume cursor first, so a crash
	/// between delivery and processing re-delivers rather than skips.
	#[tracing::instrument(name = "event-subscription", skip_all)]
	pub async fn run(mut self, event_sender: mpsc::Sender<ContractEvent>) -> Result<()> {
		info!(endpoint = %self.ws_endpoint, "Starting contract event subscription");
		let mut attempt: u32 = 0;
		loop {
			match self.connect_and_drain(&event_sender).await {
				Ok(()) => {
					// Server closed the stream cleanly; reconnect at once.
					attempt = 0;
				},
				Err(error) => {
					warn!("Event subscription dropped: {error:#}");
				},
			}
			if event_sender.is_closed() {
				info!("Event consumer gone, stopping subscription");
				return Ok(());
			}
			let delay = self.backoff.delay(attempt.min(MAX_BACKOFF_EXPONENT));
			tokio::time::sleep(delay).await;
			attempt = attempt.saturating_add(1);
		}
	}

	async fn connect_and_drain(
		&mut self,
		event_sender: &mpsc::Sender<ContractEvent>,
	) -> Result<()> {
		let client = WsClientBuilder::default()
			.build(&self.ws_endpoint)
			.await
			.with_context(|| format!("Failed to connect to {}", self.ws_endpoint))?;

		let mut subscription: Subscription<Value> = client
			.subscribe(
				"subscribe_events",
				rpc_params![serde_json::to_value(&self.filter)?, self.cursor.clone()],
				"unsubscribe_events",
			)
			.await
			.context("Failed to subscribe to contract events")?;

		let watchdog_deadline = self.keep_alive_interval * 2;
		loop {
			let next = tokio::time::timeout(watchdog_deadline, subscription.next()).await;
			match next {
				Err(_elapsed) => {
					bail!("watchdog: no event or keep-alive within {watchdog_deadline:?}")
				},
				Ok(None) => return Ok(()),
				Ok(Some(Err(error))) => {
					return Err(error).context("subscription stream error")
				},
				Ok(Some(Ok(raw_event))) => match ContractEvent::parse(&raw_event) {
					Ok(event) => {
						self.cursor = Some(event.id.clone());
						if event_sender.send(event).await.is_err() {
							return Ok(());
						}
					},
					Err(error) => {
						warn!("Skipping event with broken envelope: {error:#}");
					},
				},
			}
		}
	}
}
