//! The authoritative worker roster.
//!
//! All mutation flows through one mailbox so events apply in chain order:
//! `WorkerRegistered` followed by `WorkerSlashed` always lands in the
//! terminal `Slashed` state regardless of who observed what concurrently.
//! Reads are request/response through the same mailbox, giving callers a
//! consistent snapshot.

use std::{
	collections::HashMap,
	future::Future,
	sync::Arc,
	time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use daas_primitives::{NodeId, SealToken, WalletAddress, WorkerStatus};

use crate::store::StateStore;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerRecord {
	pub node_id: NodeId,
	pub wallet_address: WalletAddress,
	/// Set once the worker has registered through the admin endpoint.
	pub seal_token: Option<SealToken>,
	pub stake_amount: u64,
	pub status: WorkerStatus,
	pub registered_at: u64,
	pub last_heartbeat: u64,
	pub join_credential: Option<String>,
	pub reputation: u32,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
	#[error("node_id is already registered to a different wallet")]
	Conflict,
	#[error("worker registry is at capacity")]
	CapacityExhausted,
	#[error("unknown node_id")]
	UnknownWorker,
	#[error("worker is slashed")]
	Slashed,
	#[error("registry task is gone")]
	Unavailable,
}

enum Command {
	UpsertFromEvent {
		node_id: NodeId,
		wallet: WalletAddress,
		stake_amount: u64,
		now_ms: u64,
		reply: oneshot::Sender<Result<WorkerStatus, RegistryError>>,
	},
	Get {
		node_id: NodeId,
		reply: oneshot::Sender<Option<WorkerRecord>>,
	},
	ByWallet {
		wallet: WalletAddress,
		reply: oneshot::Sender<Vec<WorkerRecord>>,
	},
	MarkHeartbeat {
		node_id: NodeId,
		now_ms: u64,
		busy: bool,
		reply: oneshot::Sender<Result<WorkerStatus, RegistryError>>,
	},
	MarkSlashed {
		node_id: NodeId,
		reply: oneshot::Sender<Result<(), RegistryError>>,
	},
	AssignJoinCredential {
		node_id: NodeId,
		credential: String,
		reply: oneshot::Sender<Result<(), RegistryError>>,
	},
	RecordSealToken {
		node_id: NodeId,
		token: SealToken,
		reply: oneshot::Sender<Result<(), RegistryError>>,
	},
	Remove {
		node_id: NodeId,
		reply: oneshot::Sender<bool>,
	},
	SweepLiveness {
		now_ms: u64,
		deadline: Duration,
		reply: oneshot::Sender<usize>,
	},
	Snapshot {
		reply: oneshot::Sender<Vec<WorkerRecord>>,
	},
}

#[derive(Clone)]
pub struct RegistryHandle {
	command_sender: mpsc::Sender<Command>,
}

macro_rules! request {
	($self:expr, $command:ident { $($field:ident: $value:expr),* $(,)? }) => {{
		let (reply, response) = oneshot::channel();
		if $self
			.command_sender
			.send(Command::$command { $($field: $value,)* reply })
			.await
			.is_err()
		{
			return Err(RegistryError::Unavailable);
		}
		response.await.map_err(|_| RegistryError::Unavailable)
	}};
}

impl RegistryHandle {
	pub async fn upsert_from_event(
		&self,
		node_id: NodeId,
		wallet: WalletAddress,
		stake_amount: u64,
		now_ms: u64,
	) -> Result<WorkerStatus, RegistryError> {
		request!(self, UpsertFromEvent {
			node_id: node_id,
			wallet: wallet,
			stake_amount: stake_amount,
			now_ms: now_ms,
		})?
	}

	pub async fn get(&self, node_id: NodeId) -> Result<Option<WorkerRecord>, RegistryError> {
		request!(self, Get { node_id: node_id })
	}

	pub async fn by_wallet(
		&self,
		wallet: WalletAddress,
	) -> Result<Vec<WorkerRecord>, RegistryError> {
		request!(self, ByWallet { wallet: wallet })
	}

	pub async fn mark_heartbeat(
		&self,
		node_id: NodeId,
		now_ms: u64,
		busy: bool,
	) -> Result<WorkerStatus, RegistryError> {
		request!(self, MarkHeartbeat { node_id: node_id, now_ms: now_ms, busy: busy })?
	}

	pub async fn mark_slashed(&self, node_id: NodeId) -> Result<(), RegistryError> {
		request!(self, MarkSlashed { node_id: node_id })?
	}

	pub async fn assign_join_credential(
		&self,
		node_id: NodeId,
		credential: String,
	) -> Result<(), RegistryError> {
		request!(self, AssignJoinCredential { node_id: node_id, credential: credential })?
	}

	pub async fn record_seal_token(
		&self,
		node_id: NodeId,
		token: SealToken,
	) -> Result<(), RegistryError> {
		request!(self, RecordSealToken { node_id: node_id, token: token })?
	}

	pub async fn remove(&self, node_id: NodeId) -> Result<bool, RegistryError> {
		request!(self, Remove { node_id: node_id })
	}

	pub async fn sweep_liveness(
		&self,
		now_ms: u64,
		deadline: Duration,
	) -> Result<usize, RegistryError> {
		request!(self, SweepLiveness { now_ms: now_ms, deadline: deadline })
	}

	pub async fn snapshot(&self) -> Result<Vec<WorkerRecord>, RegistryError> {
		request!(self, Snapshot {})
	}

	/// Periodic liveness sweep: workers whose heartbeat has gone stale move
	/// to `Offline` within one sweep period.
	#[tracing::instrument(name = "registry-liveness-sweeper", skip_all)]
	pub async fn run_liveness_sweeper(
		self,
		sweep_interval: Duration,
		deadline: Duration,
	) -> anyhow::Result<()> {
		info!("Starting");
		let mut interval = tokio::time::interval(sweep_interval);
		interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		loop {
			interval.tick().await;
			let marked = self.sweep_liveness(epoch_ms(), deadline).await?;
			if marked > 0 {
				info!(marked, "Workers marked offline by liveness sweep");
			}
		}
	}
}

struct WorkerRegistry {
	workers: HashMap<NodeId, WorkerRecord>,
	by_wallet: HashMap<WalletAddress, Vec<NodeId>>,
	capacity: usize,
	store: Arc<StateStore>,
}

/// Build the registry actor. The returned future is the actor task; spawn
/// it on the scope and it runs until every handle is dropped.
pub fn start(
	capacity: usize,
	store: Arc<StateStore>,
) -> (RegistryHandle, impl Future<Output = anyhow::Result<()>> + Send) {
	let (command_sender, mut command_receiver) = mpsc::channel(256);
	let mut registry =
		WorkerRegistry { workers: HashMap::new(), by_wallet: HashMap::new(), capacity, store };
	let task = async move {
		while let Some(command) = command_receiver.recv().await {
			registry.handle(command);
		}
		Ok(())
	};
	(RegistryHandle { command_sender }, task)
}

impl WorkerRegistry {
	fn handle(&mut self, command: Command) {
		match command {
			Command::UpsertFromEvent { node_id, wallet, stake_amount, now_ms, reply } => {
				let _ = reply.send(self.upsert_from_event(node_id, wallet, stake_amount, now_ms));
			},
			Command::Get { node_id, reply } => {
				let _ = reply.send(self.workers.get(&node_id).cloned());
			},
			Command::ByWallet { wallet, reply } => {
				let records = self
					.by_wallet
					.get(&wallet)
					.into_iter()
					.flatten()
					.filter_map(|node_id| self.workers.get(node_id).cloned())
					.collect();
				let _ = reply.send(records);
			},
			Command::MarkHeartbeat { node_id, now_ms, busy, reply } => {
				let _ = reply.send(self.mark_heartbeat(node_id, now_ms, busy));
			},
			Command::MarkSlashed { node_id, reply } => {
				let _ = reply.send(self.mark_slashed(node_id));
			},
			Command::AssignJoinCredential { node_id, credential, reply } => {
				let _ = reply.send(self.assign_join_credential(node_id, credential));
			},
			Command::RecordSealToken { node_id, token, reply } => {
				let _ = reply.send(self.with_record(node_id, |record| {
					record.seal_token = Some(token);
					Ok(())
				}));
			},
			Command::Remove { node_id, reply } => {
				let _ = reply.send(self.remove(node_id));
			},
			Command::SweepLiveness { now_ms, deadline, reply } => {
				let _ = reply.send(self.sweep_liveness(now_ms, deadline));
			},
			Command::Snapshot { reply } => {
				let _ = reply.send(self.workers.values().cloned().collect());
			},
		}
	}

	fn upsert_from_event(
		&mut self,
		node_id: NodeId,
		wallet: WalletAddress,
		stake_amount: u64,
		now_ms: u64,
	) -> Result<WorkerStatus, RegistryError> {
		if let Some(existing) = self.workers.get_mut(&node_id) {
			if existing.wallet_address != wallet {
				warn!(%node_id, "Registration event for known node with different wallet");
				return Err(RegistryError::Conflict);
			}
			// Idempotent re-registration: refresh the stake, keep the state.
			existing.stake_amount = stake_amount;
			let status = existing.status;
			self.persist(&node_id);
			return Ok(status);
		}

		if self.workers.len() >= self.capacity {
			return Err(RegistryError::CapacityExhausted);
		}

		let record = WorkerRecord {
			node_id: node_id.clone(),
			wallet_address: wallet.clone(),
			seal_token: None,
			stake_amount,
			status: WorkerStatus::Pending,
			registered_at: now_ms,
			last_heartbeat: now_ms,
			join_credential: None,
			reputation: 0,
		};
		self.workers.insert(node_id.clone(), record);
		self.by_wallet.entry(wallet).or_default().push(node_id.clone());
		self.persist(&node_id);
		info!(%node_id, "Worker registered as pending");
		Ok(WorkerStatus::Pending)
	}

	fn mark_heartbeat(
		&mut self,
		node_id: NodeId,
		now_ms: u64,
		busy: bool,
	) -> Result<WorkerStatus, RegistryError> {
		self.with_record(node_id, |record| {
			record.last_heartbeat = now_ms;
			// A worker only goes live once its join credential exists; a
			// heartbeat observed while still Pending is recorded but does
			// not promote.
			if record.join_credential.is_some() {
				let target = if busy { WorkerStatus::Busy } else { WorkerStatus::Active };
				if record.status != target {
					if record.status.can_transition_to(target) {
						record.status = target;
					} else if record.status.can_transition_to(WorkerStatus::Active) {
						record.status = WorkerStatus::Active;
					}
				}
			}
			record.reputation = record.reputation.saturating_add(1);
			Ok(record.status)
		})
	}

	fn mark_slashed(&mut self, node_id: NodeId) -> Result<(), RegistryError> {
		self.with_record(node_id, |record| {
			if record.status != WorkerStatus::Slashed {
				info!(node_id = %record.node_id, "Worker slashed, record retained for audit");
				record.status = WorkerStatus::Slashed;
				record.join_credential = None;
			}
			Ok(())
		})
	}

	fn assign_join_credential(
		&mut self,
		node_id: NodeId,
		credential: String,
	) -> Result<(), RegistryError> {
		self.with_record(node_id, |record| {
			if record.status == WorkerStatus::Slashed {
				return Err(RegistryError::Slashed);
			}
			record.join_credential = Some(credential);
			if record.status == WorkerStatus::Pending {
				record.status = WorkerStatus::Active;
			}
			Ok(())
		})
	}

	fn remove(&mut self, node_id: NodeId) -> bool {
		match self.workers.remove(&node_id) {
			Some(record) => {
				if let Some(ids) = self.by_wallet.get_mut(&record.wallet_address) {
					ids.retain(|id| id != &node_id);
					if ids.is_empty() {
						self.by_wallet.remove(&record.wallet_address);
					}
				}
				self.store.delete(&worker_key(&node_id));
				true
			},
			None => false,
		}
	}

	fn sweep_liveness(&mut self, now_ms: u64, deadline: Duration) -> usize {
		let deadline_ms = deadline.as_millis() as u64;
		let mut marked = 0;
		let stale: Vec<NodeId> = self
			.workers
			.values()
			.filter(|record| {
				record.status.is_live()
					&& record.last_heartbeat.saturating_add(deadline_ms) < now_ms
			})
			.map(|record| record.node_id.clone())
			.collect();
		for node_id in stale {
			if let Some(record) = self.workers.get_mut(&node_id) {
				record.status = WorkerStatus::Offline;
				marked += 1;
			}
			self.persist(&node_id);
		}
		marked
	}

	fn with_record<T>(
		&mut self,
		node_id: NodeId,
		mutate: impl FnOnce(&mut WorkerRecord) -> Result<T, RegistryError>,
	) -> Result<T, RegistryError> {
		let record = self.workers.get_mut(&node_id).ok_or(RegistryError::UnknownWorker)?;
		let result = mutate(record);
		if result.is_ok() {
			self.persist(&node_id);
		}
		result
	}

	fn persist(&self, node_id: &NodeId) {
		if let Some(record) = self.workers.get(node_id) {
			match serde_json::to_vec(record) {
				Ok(bytes) => {
					self.store.put(&worker_key(node_id), bytes);
				},
				Err(error) => warn!(%node_id, "Could not serialize worker record: {error}"),
			}
		}
	}
}

fn worker_key(node_id: &NodeId) -> String {
	format!("/registry/workers/{node_id}")
}

pub fn epoch_ms() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.expect("system clock before unix epoch")
		.as_millis() as u64
}
