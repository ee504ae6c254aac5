//! The JSON-RPC transport to the chain node.
//!
//! The trait carries exactly the three read/write methods the registry
//! contract exposes; subscriptions live in [`crate::subscription`] on their
//! own WebSocket connection.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use jsonrpsee::{
	core::client::ClientT,
	http_client::{HttpClient, HttpClientBuilder},
	rpc_params,
};
use serde::Deserialize;
use serde_json::Value;

use crate::error::ChainError;

#[cfg(test)]
use mockall::automock;

/// Result of a submitted transaction, as reported by the node.
#[derive(Debug, Clone, Deserialize)]
pub struct TransactionResponse {
	pub digest: String,
	#[serde(default)]
	pub effects: Value,
	#[serde(default)]
	pub created_objects: Vec<String>,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChainRpcApi: Send + Sync {
	/// `read_object(id)` — `None` when the node reports no such object.
	async fn read_object(&self, object_id: &str) -> Result<Option<Value>>;

	/// `read_object_by_type(type, filter)` — all live objects of a contract
	/// type matching the filter.
	async fn read_objects_by_type(&self, type_tag: &str, filter: Value) -> Result<Vec<Value>>;

	/// `execute_transaction(tx_bytes, signatures, options)`.
	async fn execute_transaction(
		&self,
		tx_bytes: Vec<u8>,
		signatures: Vec<String>,
	) -> Result<TransactionResponse, ChainError>;
}

#[derive(Clone)]
pub struct ChainHttpRpcClient {
	client: HttpClient,
}

impl ChainHttpRpcClient {
	pub fn new(http_endpoint: &str, request_timeout: Duration) -> Result<Self> {
		Ok(Self {
			client: HttpClientBuilder::default()
				.request_timeout(request_timeout)
				.build(http_endpoint)
				.with_context(|| {
					format!("Failed to create chain RPC client for endpoint: {http_endpoint}")
				})?,
		})
	}
}

#[async_trait]
impl ChainRpcApi for ChainHttpRpcClient {
	async fn read_object(&self, object_id: &str) -> Result<Option<Value>> {
		self.client
			.request("read_object", rpc_params![object_id])
			.await
			.context("read_object failed")
	}

	async fn read_objects_by_type(&self, type_tag: &str, filter: Value) -> Result<Vec<Value>> {
		self.client
			.request("read_object_by_type", rpc_params![type_tag, filter])
			.await
			.context("read_object_by_type failed")
	}

	async fn execute_transaction(
		&self,
		tx_bytes: Vec<u8>,
		signatures: Vec<String>,
	) -> Result<TransactionResponse, ChainError> {
		let encoded_tx = base64::engine::general_purpose::STANDARD.encode(tx_bytes);
		self.client
			.request(
				"execute_transaction",
				rpc_params![
					encoded_tx,
					signatures,
					serde_json::json!({ "showEffects": true, "showObjectChanges": true })
				],
			)
			.await
			.map_err(|error| ChainError::classify(error.into()))
	}
}
