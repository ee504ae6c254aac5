//! The worker agent lifecycle: stake on chain, derive a seal token,
//! register with the master, run the node agent, and keep heartbeating.
//!
//! `Initializing → Staking → Registering → Running ↔ Degraded → Terminating`
//! with `Terminating` terminal. Slashing observed in any heartbeat response
//! stops the node agent and exits the process within the heartbeat tick.

use std::{sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use futures::FutureExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use utilities::task_scope::task_scope;

use daas_chain::{ChainClient, ChainError, ChainRpcApi, ChainSigner, ContractCall};
use daas_primitives::StakeStatus;

use crate::{
	node_agent::{NodeAgentSupervisor, SupervisorCommand},
	settings::WorkerSettings,
	token::TokenManager,
};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Consecutive heartbeat failures tolerated before the node agent child is
/// restarted.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

const REGISTRATION_ATTEMPTS: u32 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
	Initializing,
	Staking,
	Registering,
	Running,
	Degraded,
	Terminating,
}

impl AgentState {
	pub fn can_transition_to(self, next: AgentState) -> bool {
		use AgentState::*;
		match (self, next) {
			(Terminating, _) => false,
			(_, Terminating) => true,
			(Initializing, Staking) => true,
			(Staking, Registering) => true,
			(Registering, Running) => true,
			(Running, Degraded) | (Degraded, Running) => true,
			_ => false,
		}
	}
}

/// What one heartbeat round told us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
	Healthy,
	/// Master (or the chain) says our stake is gone. Fatal.
	Slashed,
	/// Master does not know us anymore. Fatal.
	NotRegistered,
	/// Token rejected for a non-slashing reason. Fatal: the credential
	/// derivation is broken and retrying will not fix it.
	Unauthenticated,
	/// Network or 5xx trouble; retried.
	Transport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentAction {
	None,
	RestartNodeAgent,
	Shutdown,
}

/// Pure decision core of the heartbeat loop, separated so the policy is
/// testable without a master or a child process.
pub fn next_step(
	state: AgentState,
	outcome: HeartbeatOutcome,
	consecutive_failures: &mut u32,
) -> (AgentState, AgentAction) {
	match outcome {
		HeartbeatOutcome::Healthy => {
			*consecutive_failures = 0;
			(AgentState::Running, AgentAction::None)
		},
		HeartbeatOutcome::Slashed
		| HeartbeatOutcome::NotRegistered
		| HeartbeatOutcome::Unauthenticated => (AgentState::Terminating, AgentAction::Shutdown),
		HeartbeatOutcome::Transport => {
			*consecutive_failures += 1;
			if *consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
				*consecutive_failures = 0;
				(AgentState::Degraded, AgentAction::RestartNodeAgent)
			} else {
				(state, AgentAction::None)
			}
		},
	}
}

#[derive(Debug, Deserialize)]
struct HeartbeatResponse {
	status: String,
	#[serde(default)]
	reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RegisterResponse {
	status: String,
	#[serde(default)]
	join_credential: Option<String>,
	#[serde(default)]
	#[allow(dead_code)]
	server_url: Option<String>,
}

pub struct WorkerAgent<Rpc> {
	settings: WorkerSettings,
	chain: Arc<ChainClient<Rpc>>,
	signer: Arc<ChainSigner>,
	http: reqwest::Client,
}

impl<Rpc: ChainRpcApi + 'static> WorkerAgent<Rpc> {
	pub fn new(
		settings: WorkerSettings,
		chain: Arc<ChainClient<Rpc>>,
		signer: Arc<ChainSigner>,
	) -> Result<Self> {
		let http = reqwest::Client::builder()
			.danger_accept_invalid_certs(settings.master.accept_invalid_certs)
			.timeout(Duration::from_secs(10))
			.build()
			.context("Failed to build master HTTP client")?;
		Ok(Self { settings, chain, signer, http })
	}

	pub async fn run(self) -> Result<()> {
		let mut state = AgentState::Initializing;
		transition(&mut state, AgentState::Staking);

		let token_manager = self.stake().await?;
		transition(&mut state, AgentState::Registering);

		let join_credential = self.register(&token_manager).await?;
		transition(&mut state, AgentState::Running);

		let (command_sender, command_receiver) = mpsc::channel(4);
		let supervisor = NodeAgentSupervisor::new(
			self.settings.node.node_agent_binary.clone(),
			self.settings.master.url.clone(),
			self.settings.node.id.clone(),
		);

		task_scope(|scope| {
			async move {
				scope.spawn(supervisor.run(join_credential, command_receiver));
				self.heartbeat_loop(state, token_manager, command_sender).await
			}
			.boxed()
		})
		.await
	}

	/// Lock the stake under our fresh node id. Non-retryable chain errors
	/// abort startup; transient ones were already retried inside the client.
	async fn stake(&self) -> Result<TokenManager> {
		info!(
			node_id = %self.settings.node.id,
			amount = self.settings.node.stake_amount_mist,
			"Submitting staking transaction"
		);
		let response = self
			.chain
			.execute(
				ContractCall {
					package: self.settings.chain.registry_package.clone(),
					module: self.settings.chain.registry_module.clone(),
					function: "stake_entry".to_string(),
					arguments: vec![
						json!(self.settings.node.id),
						json!(self.settings.node.stake_amount_mist),
					],
				},
				self.settings.node.gas_budget,
			)
			.await
			.context("Staking transaction failed")?;
		info!(digest = %response.digest, "Stake confirmed");

		Ok(TokenManager::from_staking_effects(
			&response.created_objects,
			self.signer.clone(),
			self.settings.node.token_cache_file.clone(),
		))
	}

	/// Register against the master, honouring 202 + retry-after while the
	/// event bridge catches up with our registration event.
	async fn register(&self, token_manager: &TokenManager) -> Result<String> {
		let url = format!("{}/admin/v1/register-worker", self.settings.master.url);
		for attempt in 0..REGISTRATION_ATTEMPTS {
			let token = token_manager.current();
			let response = self
				.http
				.post(&url)
				.header("x-seal-token", token.expose())
				.json(&json!({
					"node_id": self.settings.node.id,
					"seal_token": token.expose(),
					"timestamp": unix_now(),
				}))
				.send()
				.await;

			match response {
				Ok(response) if response.status().as_u16() == 200 => {
					let body: RegisterResponse =
						response.json().await.context("Malformed registration response")?;
					let join_credential = body
						.join_credential
						.context("Registration succeeded without a join credential")?;
					info!("Registered with master");
					return Ok(join_credential);
				},
				Ok(response) if response.status().as_u16() == 202 => {
					let retry_after = response
						.headers()
						.get(reqwest::header::RETRY_AFTER)
						.and_then(|value| value.to_str().ok())
						.and_then(|value| value.parse::<u64>().ok())
						.unwrap_or(5);
					info!(attempt, retry_after, "Master still promoting us, retrying");
					tokio::time::sleep(Duration::from_secs(retry_after)).await;
				},
				// Registration event not observed yet; same backoff as 202.
				Ok(response) if response.status().as_u16() == 404 => {
					info!(attempt, "Master has not seen our registration event yet");
					tokio::time::sleep(Duration::from_secs(5)).await;
				},
				Ok(response) => {
					let status = response.status();
					let body = response.text().await.unwrap_or_default();
					bail!("Registration rejected with {status}: {body}");
				},
				Err(error) => {
					warn!(attempt, "Registration request failed: {error}");
					tokio::time::sleep(Duration::from_secs(5)).await;
				},
			}
		}
		bail!("Could not register with master after {REGISTRATION_ATTEMPTS} attempts")
	}

	async fn heartbeat_loop(
		&self,
		mut state: AgentState,
		token_manager: TokenManager,
		command_sender: mpsc::Sender<SupervisorCommand>,
	) -> Result<()> {
		let url = format!("{}/admin/v1/heartbeat", self.settings.master.url);
		let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
		interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		let mut consecutive_failures = 0u32;

		loop {
			interval.tick().await;
			let outcome = self.heartbeat_once(&url, &token_manager).await;
			let (next_state, action) = next_step(state, outcome, &mut consecutive_failures);
			if next_state != state {
				transition(&mut state, next_state);
			}
			match action {
				AgentAction::None => {},
				AgentAction::RestartNodeAgent => {
					warn!("Heartbeats degraded, restarting node agent");
					if command_sender.send(SupervisorCommand::Restart).await.is_err() {
						bail!("Node agent supervisor is gone");
					}
				},
				AgentAction::Shutdown => {
					// Stake slashed or registration revoked: stop the child
					// and exit. Even if the supervisor is mid-teardown when
					// the scope cancels it, kill_on_drop reaps the child.
					error!(?outcome, "Terminal heartbeat response, shutting down");
					let _ = command_sender.send(SupervisorCommand::Shutdown).await;
					bail!("Worker terminated by heartbeat response: {outcome:?}");
				},
			}
		}
	}

	/// One heartbeat round: re-read our stake from the chain, report to the
	/// master, classify the answer.
	async fn heartbeat_once(
		&self,
		url: &str,
		token_manager: &TokenManager,
	) -> HeartbeatOutcome {
		let (stake_status, stake_amount) =
			match self.chain.get_stake(self.signer.address()).await {
				Ok(Some(stake)) => {
					if stake.status == StakeStatus::Slashed {
						return HeartbeatOutcome::Slashed;
					}
					(stake.status.to_string(), stake.amount)
				},
				Ok(None) => return HeartbeatOutcome::Slashed,
				Err(ChainError::Transient(_)) | Err(ChainError::Timeout(_)) => {
					// The master re-validates the stake anyway; report what
					// we knew last.
					("unknown".to_string(), 0)
				},
				Err(_) => return HeartbeatOutcome::Transport,
			};

		let token = token_manager.current();
		let response = self
			.http
			.post(url)
			.json(&json!({
				"node_id": self.settings.node.id,
				"seal_token": token.expose(),
				"stake_status": stake_status,
				"stake_amount": stake_amount,
				"pods_running": 0,
				"resource_usage": {},
				"timestamp": unix_now(),
			}))
			.send()
			.await;

		match response {
			Ok(response) => classify_heartbeat_response(
				response.status().as_u16(),
				&response.json::<HeartbeatResponse>().await.ok(),
			),
			Err(error) => {
				warn!("Heartbeat request failed: {error}");
				HeartbeatOutcome::Transport
			},
		}
	}
}

fn classify_heartbeat_response(
	status: u16,
	body: &Option<HeartbeatResponse>,
) -> HeartbeatOutcome {
	match (status, body) {
		(200, Some(body)) if body.status == "slashed" => HeartbeatOutcome::Slashed,
		(200, _) => HeartbeatOutcome::Healthy,
		(401, Some(body)) => {
			// Distinguish revocation from transient chain trouble reported
			// through the master.
			match body.reason.as_deref() {
				Some("Inactive") | Some("NoStake") => HeartbeatOutcome::Slashed,
				_ => HeartbeatOutcome::Unauthenticated,
			}
		},
		(401, None) => HeartbeatOutcome::Unauthenticated,
		(404, _) => HeartbeatOutcome::NotRegistered,
		_ => HeartbeatOutcome::Transport,
	}
}

fn transition(state: &mut AgentState, next: AgentState) {
	debug_assert!(state.can_transition_to(next), "{state:?} -> {next:?}");
	info!(from = ?state, to = ?next, "Agent state change");
	*state = next;
}

fn unix_now() -> u64 {
	std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.expect("system clock before unix epoch")
		.as_secs()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn state_machine_edges() {
		use AgentState::*;
		assert!(Initializing.can_transition_to(Staking));
		assert!(Staking.can_transition_to(Registering));
		assert!(Registering.can_transition_to(Running));
		assert!(Running.can_transition_to(Degraded));
		assert!(Degraded.can_transition_to(Running));
		assert!(Degraded.can_transition_to(Terminating));

		assert!(!Running.can_transition_to(Staking));
		assert!(!Terminating.can_transition_to(Running));
		assert!(!Initializing.can_transition_to(Running));
	}

	#[test]
	fn three_transport_failures_restart_the_child() {
		let mut failures = 0;
		let (state, action) =
			next_step(AgentState::Running, HeartbeatOutcome::Transport, &mut failures);
		assert_eq!((state, action), (AgentState::Running, AgentAction::None));
		let (state, action) =
			next_step(state, HeartbeatOutcome::Transport, &mut failures);
		assert_eq!(action, AgentAction::None);
		let (state, action) =
			next_step(state, HeartbeatOutcome::Transport, &mut failures);
		assert_eq!((state, action), (AgentState::Degraded, AgentAction::RestartNodeAgent));
		// Counter reset: the next failure does not immediately restart.
		let (_, action) = next_step(state, HeartbeatOutcome::Transport, &mut failures);
		assert_eq!(action, AgentAction::None);
	}

	#[test]
	fn success_recovers_from_degraded() {
		let mut failures = 2;
		let (state, action) =
			next_step(AgentState::Degraded, HeartbeatOutcome::Healthy, &mut failures);
		assert_eq!((state, action), (AgentState::Running, AgentAction::None));
		assert_eq!(failures, 0);
	}

	#[test]
	fn slashing_shuts_the_agent_down() {
		let mut failures = 0;
		let (state, action) =
			next_step(AgentState::Running, HeartbeatOutcome::Slashed, &mut failures);
		assert_eq!((state, action), (AgentState::Terminating, AgentAction::Shutdown));
	}

	#[test]
	fn heartbeat_responses_classify() {
		assert_eq!(
			classify_heartbeat_response(
				200,
				&Some(HeartbeatResponse { status: "ok".into(), reason: None })
			),
			HeartbeatOutcome::Healthy
		);
		assert_eq!(
			classify_heartbeat_response(
				200,
				&Some(HeartbeatResponse { status: "slashed".into(), reason: None })
			),
			HeartbeatOutcome::Slashed
		);
		assert_eq!(
			classify_heartbeat_response(
				401,
				&Some(HeartbeatResponse {
					status: "unauthenticated".into(),
					reason: Some("Inactive".into()),
				})
			),
			HeartbeatOutcome::Slashed
		);
		assert_eq!(
			classify_heartbeat_response(
				401,
				&Some(HeartbeatResponse {
					status: "unauthenticated".into(),
					reason: Some("Expired".into()),
				})
			),
			HeartbeatOutcome::Unauthenticated
		);
		assert_eq!(classify_heartbeat_response(404, &None), HeartbeatOutcome::NotRegistered);
		assert_eq!(classify_heartbeat_response(502, &None), HeartbeatOutcome::Transport);
	}
}
