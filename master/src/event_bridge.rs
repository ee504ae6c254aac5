//! Drains the contract event stream into the worker registry.
//!
//! Events apply in arrival order through the registry mailbox. A single bad
//! event never stops the stream: per-event failures are logged and skipped.
//! Application is idempotent per `(tx_digest, event_seq)` within a bounded
//! dedup window, and the backlog is bounded with oldest-first dropping.

use std::{
	collections::{HashSet, VecDeque},
	sync::Arc,
};

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use daas_chain::{ContractEvent, ContractEventKind, EventId};

use crate::{
	auth::Authenticator,
	constants::EVENT_BACKLOG_CAPACITY,
	metrics::{EVENTS_DROPPED, EVENTS_UNPARSEABLE},
	registry::RegistryHandle,
	store::StateStore,
	supervisor::ControlPlaneApi,
};

/// Size of the `(tx_digest, event_seq)` window used for idempotence. Events
/// older than this many are assumed to never be re-delivered.
const DEDUP_WINDOW: usize = 4096;

pub struct EventBridge {
	registry: RegistryHandle,
	auth: Arc<Authenticator>,
	control_plane: Arc<dyn ControlPlaneApi>,
	store: Arc<StateStore>,
	seen: HashSet<EventId>,
	seen_order: VecDeque<EventId>,
}

impl EventBridge {
	pub fn new(
		registry: RegistryHandle,
		auth: Arc<Authenticator>,
		control_plane: Arc<dyn ControlPlaneApi>,
		store: Arc<StateStore>,
	) -> Self {
		Self {
			registry,
			auth,
			control_plane,
			store,
			seen: HashSet::new(),
			seen_order: VecDeque::new(),
		}
	}

	#[tracing::instrument(name = "event-bridge", skip_all)]
	pub async fn run(
		mut self,
		mut event_receiver: mpsc::Receiver<ContractEvent>,
	) -> Result<()> {
		info!("Starting");
		let mut backlog: VecDeque<ContractEvent> = VecDeque::new();
		loop {
			// Pull everything already waiting so the backlog bound applies
			// while we are busy dispatching.
			loop {
				match event_receiver.try_recv() {
					Ok(event) => push_bounded(&mut backlog, event),
					Err(mpsc::error::TryRecvError::Empty) => break,
					Err(mpsc::error::TryRecvError::Disconnected) => {
						self.drain(&mut backlog).await;
						info!("Event stream ended");
						return Ok(());
					},
				}
			}

			match backlog.pop_front() {
				Some(event) => self.process(event).await,
				None => match event_receiver.recv().await {
					Some(event) => push_bounded(&mut backlog, event),
					None => {
						info!("Event stream ended");
						return Ok(());
					},
				},
			}
		}
	}

	async fn drain(&mut self, backlog: &mut VecDeque<ContractEvent>) {
		while let Some(event) = backlog.pop_front() {
			self.process(event).await;
		}
	}

	async fn process(&mut self, event: ContractEvent) {
		if !self.remember(event.id.clone()) {
			debug!(?event.id, "Skipping duplicate event");
			return;
		}
		self.audit(&event);
		if let Err(error) = self.dispatch(&event).await {
			warn!(?event.id, "Failed to process event: {error:#}");
		}
	}

	/// Returns false when the event was already applied.
	fn remember(&mut self, id: EventId) -> bool {
		if !self.seen.insert(id.clone()) {
			return false;
		}
		self.seen_order.push_back(id);
		if self.seen_order.len() > DEDUP_WINDOW {
			if let Some(oldest) = self.seen_order.pop_front() {
				self.seen.remove(&oldest);
			}
		}
		true
	}

	// Droppable audit trail; the store may refuse these under pressure.
	fn audit(&self, event: &ContractEvent) {
		let key = format!(
			"/registry/events/{}:{}",
			event.id.tx_digest, event.id.event_seq
		);
		let summary = serde_json::json!({
			"package_id": event.package_id,
			"timestamp_ms": event.timestamp_ms,
			"kind": format!("{:?}", event.kind),
		});
		self.store.put(&key, summary.to_string().into_bytes());
	}

	async fn dispatch(&self, event: &ContractEvent) -> Result<()> {
		match &event.kind {
			ContractEventKind::WorkerRegistered { node_id, wallet, stake_amount } => {
				self.registry
					.upsert_from_event(
						node_id.clone(),
						wallet.clone(),
						*stake_amount,
						event.timestamp_ms,
					)
					.await?;
				// Promote as soon as the control plane can mint a join
				// credential; until then the worker stays pending and the
				// registration endpoint answers 202.
				match self.control_plane.join_credential() {
					Ok(credential) => {
						self.registry
							.assign_join_credential(node_id.clone(), credential)
							.await?;
						info!(%node_id, "Worker promoted to active");
					},
					Err(_) => {
						info!(%node_id, "Control plane not ready, worker stays pending")
					},
				}
			},
			ContractEventKind::WorkerHeartbeat { node_id, timestamp_ms } => {
				self.registry.mark_heartbeat(node_id.clone(), *timestamp_ms, false).await?;
			},
			ContractEventKind::WorkerSlashed { node_id, reason } => {
				info!(%node_id, reason = reason.as_deref().unwrap_or(""), "Worker slashed on chain");
				let wallet = self
					.registry
					.get(node_id.clone())
					.await?
					.map(|record| record.wallet_address);
				self.registry.mark_slashed(node_id.clone()).await?;
				if let Some(wallet) = wallet {
					self.auth.invalidate_wallet(&wallet);
				}
			},
			ContractEventKind::WorkerUnregistered { node_id } => {
				self.registry.remove(node_id.clone()).await?;
			},
			ContractEventKind::StakeDeposited { wallet, amount }
			| ContractEventKind::StakeWithdrawn { wallet, amount } => {
				debug!(%wallet, amount, "Stake changed, invalidating cached identities");
				self.auth.invalidate_wallet(wallet);
			},
			ContractEventKind::K8sApiRequest { .. } => {
				// Reserved for the event-driven gateway mode; deliberately
				// not dispatched.
				debug!(?event.id, "Ignoring reserved K8sAPIRequest event");
			},
			ContractEventKind::Unknown { event_type } => {
				EVENTS_UNPARSEABLE.inc();
				warn!(event_type, "Skipping unrecognized event type");
			},
		}
		Ok(())
	}
}

fn push_bounded(backlog: &mut VecDeque<ContractEvent>, event: ContractEvent) {
	if backlog.len() >= EVENT_BACKLOG_CAPACITY {
		backlog.pop_front();
		EVENTS_DROPPED.inc();
	}
	backlog.push_back(event);
}
