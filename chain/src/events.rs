//! Contract events as delivered on the subscription stream, and their
//! parsing out of the node's JSON envelope.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use daas_primitives::{NodeId, WalletAddress};

/// Position of an event in the chain, used for de-duplication and for
/// resuming a subscription after reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId {
	pub tx_digest: String,
	pub event_seq: u64,
}

/// Subscription resume point: the last event id the consumer has seen.
pub type EventCursor = EventId;

#[derive(Debug, Clone, PartialEq)]
pub struct ContractEvent {
	pub id: EventId,
	pub package_id: String,
	pub timestamp_ms: u64,
	pub kind: ContractEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContractEventKind {
	WorkerRegistered {
		node_id: NodeId,
		wallet: WalletAddress,
		stake_amount: u64,
	},
	WorkerHeartbeat {
		node_id: NodeId,
		timestamp_ms: u64,
	},
	WorkerSlashed {
		node_id: NodeId,
		reason: Option<String>,
	},
	WorkerUnregistered {
		node_id: NodeId,
	},
	StakeDeposited {
		wallet: WalletAddress,
		amount: u64,
	},
	StakeWithdrawn {
		wallet: WalletAddress,
		amount: u64,
	},
	/// Reserved for the event-driven gateway mode; parsed but never
	/// dispatched.
	K8sApiRequest {
		payload: Value,
	},
	/// Recognized envelope, unrecognized event type. Counted and skipped
	/// downstream.
	Unknown {
		event_type: String,
	},
}

impl ContractEvent {
	/// Parse one event out of the subscription notification. Fails only on
	/// a broken envelope; unknown event types parse to
	/// [`ContractEventKind::Unknown`].
	pub fn parse(value: &Value) -> Result<Self> {
		let id = value.get("id").context("event envelope has no id")?;
		let id = EventId {
			tx_digest: str_field(id, "txDigest")?.to_string(),
			event_seq: u64_field(id, "eventSeq")?,
		};
		let package_id = str_field(value, "packageId")?.to_string();
		let timestamp_ms = u64_field(value, "timestampMs")?;
		let event_type = str_field(value, "type")?;
		let payload = value.get("parsedJson").cloned().unwrap_or(Value::Null);

		let kind = match event_type.rsplit("::").next().unwrap_or(event_type) {
			"WorkerRegistered" => ContractEventKind::WorkerRegistered {
				node_id: NodeId(str_field(&payload, "node_id")?.to_string()),
				wallet: WalletAddress(str_field(&payload, "wallet_address")?.to_string()),
				stake_amount: u64_field(&payload, "stake_amount")?,
			},
			"WorkerHeartbeat" => ContractEventKind::WorkerHeartbeat {
				node_id: NodeId(str_field(&payload, "node_id")?.to_string()),
				timestamp_ms: u64_field(&payload, "timestamp").unwrap_or(timestamp_ms),
			},
			"WorkerSlashed" => ContractEventKind::WorkerSlashed {
				node_id: NodeId(str_field(&payload, "node_id")?.to_string()),
				reason: payload
					.get("reason")
					.and_then(Value::as_str)
					.map(str::to_string),
			},
			"WorkerUnregistered" => ContractEventKind::WorkerUnregistered {
				node_id: NodeId(str_field(&payload, "node_id")?.to_string()),
			},
			"StakeDeposited" => ContractEventKind::StakeDeposited {
				wallet: WalletAddress(str_field(&payload, "wallet_address")?.to_string()),
				amount: u64_field(&payload, "amount")?,
			},
			"StakeWithdrawn" => ContractEventKind::StakeWithdrawn {
				wallet: WalletAddress(str_field(&payload, "wallet_address")?.to_string()),
				amount: u64_field(&payload, "amount")?,
			},
			"K8sAPIRequest" => ContractEventKind::K8sApiRequest { payload },
			other => ContractEventKind::Unknown { event_type: other.to_string() },
		};

		Ok(ContractEvent { id, package_id, timestamp_ms, kind })
	}
}

pub(crate) fn str_field<'a>(value: &'a Value, field: &str) -> Result<&'a str> {
	value
		.get(field)
		.and_then(Value::as_str)
		.ok_or_else(|| anyhow!("missing or non-string field '{field}'"))
}

// Node implementations serialize u64s either as JSON numbers or as decimal
// strings; accept both.
pub(crate) fn u64_field(value: &Value, field: &str) -> Result<u64> {
	let field_value =
		value.get(field).ok_or_else(|| anyhow!("missing field '{field}'"))?;
	match field_value {
		Value::Number(n) => n.as_u64().ok_or_else(|| anyhow!("field '{field}' out of range")),
		Value::String(s) => s
			.parse()
			.with_context(|| format!("field '{field}' is not a decimal string")),
		_ => Err(anyhow!("field '{field}' is neither number nor string")),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn envelope(event_type: &str, parsed: Value) -> Value {
		json!({
			"id": { "txDigest": "9xAbCdEf", "eventSeq": "3" },
			"packageId": "0x77aa",
			"transactionModule": "registry",
			"type": format!("0x77aa::registry::{event_type}"),
			"timestampMs": "1700000000000",
			"parsedJson": parsed,
		})
	}

	#[test]
	fn worker_registered_parsing() {
		let event = ContractEvent::parse(&envelope(
			"WorkerRegistered",
			json!({
				"node_id": "w1",
				"wallet_address": "0xabc",
				"stake_amount": "2000000000",
			}),
		))
		.unwrap();

		assert_eq!(event.id, EventId { tx_digest: "9xAbCdEf".into(), event_seq: 3 });
		assert_eq!(event.package_id, "0x77aa");
		assert_eq!(event.timestamp_ms, 1_700_000_000_000);
		assert_eq!(
			event.kind,
			ContractEventKind::WorkerRegistered {
				node_id: NodeId::from("w1"),
				wallet: WalletAddress::from("0xabc"),
				stake_amount: 2_000_000_000,
			}
		);
	}

	#[test]
	fn worker_slashed_parsing_with_numeric_fields() {
		let event = ContractEvent::parse(&envelope(
			"WorkerSlashed",
			json!({ "node_id": "w2", "reason": "missed-epochs" }),
		))
		.unwrap();
		assert_eq!(
			event.kind,
			ContractEventKind::WorkerSlashed {
				node_id: NodeId::from("w2"),
				reason: Some("missed-epochs".to_string()),
			}
		);
	}

	#[test]
	fn heartbeat_falls_back_to_envelope_timestamp() {
		let event = ContractEvent::parse(&envelope(
			"WorkerHeartbeat",
			json!({ "node_id": "w1" }),
		))
		.unwrap();
		assert_eq!(
			event.kind,
			ContractEventKind::WorkerHeartbeat {
				node_id: NodeId::from("w1"),
				timestamp_ms: 1_700_000_000_000,
			}
		);
	}

	#[test]
	fn stake_events_carry_wallet_and_amount() {
		let event = ContractEvent::parse(&envelope(
			"StakeWithdrawn",
			json!({ "wallet_address": "0xdef", "amount": 5_000_000_000u64 }),
		))
		.unwrap();
		assert_eq!(
			event.kind,
			ContractEventKind::StakeWithdrawn {
				wallet: WalletAddress::from("0xdef"),
				amount: 5_000_000_000,
			}
		);
	}

	#[test]
	fn unknown_event_types_are_preserved_not_dropped() {
		let event =
			ContractEvent::parse(&envelope("EpochAdvanced", json!({ "epoch": 9 }))).unwrap();
		assert_eq!(
			event.kind,
			ContractEventKind::Unknown { event_type: "EpochAdvanced".to_string() }
		);
	}

	#[test]
	fn reserved_api_request_events_parse() {
		let event = ContractEvent::parse(&envelope(
			"K8sAPIRequest",
			json!({ "verb": "get", "path": "/api/v1/pods" }),
		))
		.unwrap();
		assert!(matches!(event.kind, ContractEventKind::K8sApiRequest { .. }));
	}

	#[test]
	fn broken_envelope_is_an_error() {
		assert!(ContractEvent::parse(&json!({ "type": "x" })).is_err());
		let mut missing_payload_field = envelope("WorkerRegistered", json!({}));
		missing_payload_field["parsedJson"] = json!({ "node_id": "w1" });
		assert!(ContractEvent::parse(&missing_payload_field).is_err());
	}
}
