//! Admin API handlers: worker registration, heartbeats, attestation export
//! and kubeconfig generation.

use std::{convert::Infallible, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use warp::{
	http::StatusCode,
	reply::{self, Reply},
};

use daas_primitives::{NodeId, SealToken, TokenKind, WorkerStatus};

use crate::{
	auth::AuthError,
	gateway::{kubeconfig::KubeConfig, GatewayState},
	registry::{epoch_ms, RegistryError},
};

/// How often the registration handler re-checks the registry while waiting
/// for the event bridge to promote a pending worker.
const REGISTRATION_POLL_INTERVAL: Duration = Duration::from_millis(250);

const RETRY_AFTER_SECS: u64 = 5;

#[derive(Debug, Deserialize)]
pub struct RegisterWorkerRequest {
	pub node_id: NodeId,
	pub seal_token: SealToken,
	#[allow(dead_code)]
	pub timestamp: u64,
}

#[derive(Debug, Serialize)]
struct RegisterWorkerResponse {
	status: &'static str,
	#[serde(skip_serializing_if = "Option::is_none")]
	join_credential: Option<String>,
	server_url: String,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
	pub node_id: NodeId,
	pub seal_token: SealToken,
	#[serde(default)]
	pub stake_status: Option<String>,
	#[serde(default)]
	pub stake_amount: Option<u64>,
	#[serde(default)]
	pub pods_running: u32,
	#[serde(default)]
	pub resource_usage: Value,
	#[allow(dead_code)]
	pub timestamp: u64,
}

pub async fn register_worker(
	request: RegisterWorkerRequest,
	header_token: Option<String>,
	state: Arc<GatewayState>,
) -> Result<warp::reply::Response, Infallible> {
	if let Some(header_token) = header_token {
		if header_token != request.seal_token.expose() {
			return Ok(status_json(
				StatusCode::UNAUTHORIZED,
				serde_json::json!({ "status": "unauthenticated", "reason": "TokenMismatch" }),
			));
		}
	}

	let node_id = request.node_id.clone();
	let deadline = tokio::time::Instant::now() + state.registration_wait;
	loop {
		let record = match state.registry.get(node_id.clone()).await {
			Ok(record) => record,
			Err(error) => return Ok(registry_unavailable(error)),
		};

		match record {
			// The on-chain registration event may not have arrived yet;
			// give the bridge the same grace as a pending promotion.
			None if tokio::time::Instant::now() < deadline => {
				tokio::time::sleep(REGISTRATION_POLL_INTERVAL).await;
			},
			None => {
				return Ok(status_json(
					StatusCode::NOT_FOUND,
					serde_json::json!({
						"status": "not-registered",
						"reason": "UnknownWorker",
					}),
				))
			},
			Some(record) if record.status == WorkerStatus::Pending => {
				if tokio::time::Instant::now() < deadline {
					tokio::time::sleep(REGISTRATION_POLL_INTERVAL).await;
				} else {
					return Ok(retry_later());
				}
			},
			Some(record) if record.status.is_live() => {
				// A dotted token names its wallet; it must be the staking
				// wallet the chain announced for this node.
				if let Ok(TokenKind::Dotted { address, .. }) = request.seal_token.kind() {
					if address != record.wallet_address {
						return Ok(status_json(
							StatusCode::UNAUTHORIZED,
							serde_json::json!({
								"status": "unauthenticated",
								"reason": "TokenWalletMismatch",
							}),
						));
					}
				}

				state.auth.index_token(&request.seal_token, record.wallet_address.clone());
				if let Err(error) = state.auth.authenticate(&request.seal_token).await {
					return Ok(auth_error_response(&error));
				}
				let _ = state
					.registry
					.record_seal_token(node_id.clone(), request.seal_token.clone())
					.await;

				return Ok(match record.join_credential {
					Some(join_credential) => {
						info!(%node_id, "Worker registered");
						status_json(
							StatusCode::OK,
							serde_json::to_value(RegisterWorkerResponse {
								status: "registered",
								join_credential: Some(join_credential),
								server_url: state.server_url.clone(),
							})
							.expect("response serializes"),
						)
					},
					// Live without a credential should not happen; let the
					// agent retry rather than inventing one here.
					None => retry_later(),
				});
			},
			Some(record) => {
				warn!(%node_id, status = %record.status, "Registration refused");
				return Ok(status_json(
					StatusCode::CONFLICT,
					serde_json::json!({
						"status": record.status.to_string(),
						"reason": "RegistryConflict",
					}),
				));
			},
		}
	}
}

pub async fn heartbeat(
	request: HeartbeatRequest,
	state: Arc<GatewayState>,
) -> Result<warp::reply::Response, Infallible> {
	let record = match state.registry.get(request.node_id.clone()).await {
		Ok(record) => record,
		Err(error) => return Ok(registry_unavailable(error)),
	};

	let Some(record) = record else {
		return Ok(status_json(
			StatusCode::NOT_FOUND,
			serde_json::json!({ "status": "not-registered" }),
		));
	};

	// A slashed worker learns its fate from the heartbeat response; this is
	// what makes it tear its node agent down without master-side eviction.
	if record.status == WorkerStatus::Slashed {
		return Ok(status_json(
			StatusCode::OK,
			serde_json::json!({ "status": "slashed" }),
		));
	}

	if let Err(error) = state.auth.authenticate(&request.seal_token).await {
		return Ok(auth_error_response(&error));
	}

	match state
		.registry
		.mark_heartbeat(request.node_id, epoch_ms(), request.pods_running > 0)
		.await
	{
		Ok(WorkerStatus::Slashed) => Ok(status_json(
			StatusCode::OK,
			serde_json::json!({ "status": "slashed" }),
		)),
		Ok(_) => Ok(status_json(StatusCode::OK, serde_json::json!({ "status": "ok" }))),
		Err(RegistryError::UnknownWorker) => Ok(status_json(
			StatusCode::NOT_FOUND,
			serde_json::json!({ "status": "not-registered" }),
		)),
		Err(error) => Ok(registry_unavailable(error)),
	}
}

pub async fn attestation(
	query: std::collections::HashMap<String, String>,
	state: Arc<GatewayState>,
) -> Result<warp::reply::Response, Infallible> {
	let nonce = query.get("nonce").map(String::as_str).unwrap_or("");
	let document = state.attestation.attest(nonce);
	Ok(status_json(
		StatusCode::OK,
		serde_json::json!({
			"document": document,
			"simulated": state.attestation.simulated(),
		}),
	))
}

pub async fn kubeconfig(
	query: std::collections::HashMap<String, String>,
	state: Arc<GatewayState>,
) -> Result<warp::reply::Response, Infallible> {
	let Some(token) = query.get("token").map(|token| SealToken::new(token.clone()))
	else {
		return Ok(status_json(
			StatusCode::UNAUTHORIZED,
			serde_json::json!({ "status": "unauthenticated", "reason": "MissingToken" }),
		));
	};

	if let Err(error) = state.auth.authenticate(&token).await {
		return Ok(auth_error_response(&error));
	}

	match KubeConfig::for_token(&state.server_url, &state.cluster_name, &token).to_yaml() {
		Ok(yaml) => Ok(warp::http::Response::builder()
			.status(StatusCode::OK)
			.header(warp::http::header::CONTENT_TYPE, "application/yaml")
			.body(yaml.into())
			.expect("static response builds")),
		Err(error) => {
			warn!("Could not render kubeconfig: {error}");
			Ok(status_json(
				StatusCode::INTERNAL_SERVER_ERROR,
				serde_json::json!({ "status": "error" }),
			))
		},
	}
}

fn retry_later() -> warp::reply::Response {
	let mut response = status_json(
		StatusCode::ACCEPTED,
		serde_json::json!({ "status": "pending", "retry_after": RETRY_AFTER_SECS }),
	);
	response.headers_mut().insert(
		warp::http::header::RETRY_AFTER,
		warp::http::HeaderValue::from(RETRY_AFTER_SECS),
	);
	response
}

fn registry_unavailable(error: RegistryError) -> warp::reply::Response {
	warn!("Registry unavailable: {error}");
	status_json(
		StatusCode::SERVICE_UNAVAILABLE,
		serde_json::json!({ "status": "error", "reason": "RegistryUnavailable" }),
	)
}

/// 401 for identity problems, 503 when the chain is unreachable and the
/// cache cannot answer. The message names the seal token for diagnosability.
pub fn auth_error_response(error: &AuthError) -> warp::reply::Response {
	crate::metrics::AUTH_REJECTS.with_label_values(&[error.reason()]).inc();
	let status = match error {
		AuthError::ChainUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
		_ => StatusCode::UNAUTHORIZED,
	};
	status_json(
		status,
		serde_json::json!({
			"status": "unauthenticated",
			"reason": error.reason(),
			"message": format!("seal token rejected: {}", error.reason()),
		}),
	)
}

pub fn status_json(status: StatusCode, body: Value) -> warp::reply::Response {
	reply::with_status(reply::json(&body), status).into_response()
}
