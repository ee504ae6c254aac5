//! TEE attestation document issuance and verification.
//!
//! On hardware without an enclave the provider runs in simulated mode: the
//! measurement and signing key are derived deterministically from the
//! cluster identity and the document is marked `simulated`. Downstream
//! components treat both kinds identically; only the flag differs.

use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Allowed clock skew when checking `issued_at`.
const ISSUED_AT_SKEW_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationDocument {
	pub enclave_measurement: String,
	pub signing_public_key: String,
	pub user_data_hash: String,
	pub nonce: String,
	pub issued_at: u64,
	pub signature: String,
	pub certificate_chain: Vec<String>,
	pub simulated: bool,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AttestationError {
	#[error("attestation document has a malformed field: {0}")]
	BadEncoding(&'static str),
	#[error("attestation signature does not verify")]
	BadSignature,
	#[error("attestation document is issued in the future")]
	IssuedInFuture,
}

pub struct AttestationProvider {
	signing_key: SigningKey,
	enclave_measurement: String,
	user_data_hash: String,
	simulated: bool,
}

impl AttestationProvider {
	/// Simulated provider: everything is a deterministic function of the
	/// cluster identity, so restarts attest to the same measurement.
	pub fn new_simulated(cluster_id: &str, control_plane_public_key: &[u8]) -> Self {
		let seed: [u8; 32] =
			Sha256::digest(format!("daas-simulated-attestation:{cluster_id}")).into();
		let measurement: [u8; 32] =
			Sha256::digest(format!("daas-simulated-enclave:{cluster_id}")).into();
		Self {
			signing_key: SigningKey::from_bytes(&seed),
			enclave_measurement: hex::encode(measurement),
			user_data_hash: user_data_hash(cluster_id, control_plane_public_key),
			simulated: true,
		}
	}

	pub fn simulated(&self) -> bool {
		self.simulated
	}

	/// Issue a document over the enclave measurement, our signing key and
	/// the caller-supplied nonce.
	pub fn attest(&self, nonce: &str) -> AttestationDocument {
		let issued_at = unix_now();
		let signing_public_key = hex::encode(self.signing_key.verifying_key().as_bytes());
		let signature = self.signing_key.sign(&signing_payload(
			&self.enclave_measurement,
			&signing_public_key,
			&self.user_data_hash,
			nonce,
			issued_at,
		));
		AttestationDocument {
			enclave_measurement: self.enclave_measurement.clone(),
			signing_public_key,
			user_data_hash: self.user_data_hash.clone(),
			nonce: nonce.to_string(),
			issued_at,
			signature: hex::encode(signature.to_bytes()),
			certificate_chain: Vec::new(),
			simulated: self.simulated,
		}
	}

	/// Check a document's signature and freshness. Verification is
	/// self-contained; trusting the measurement is the remote party's call.
	pub fn verify(document: &AttestationDocument) -> Result<(), AttestationError> {
		let public_key_bytes: [u8; 32] = hex::decode(&document.signing_public_key)
			.map_err(|_| AttestationError::BadEncoding("signing_public_key"))?
			.try_into()
			.map_err(|_| AttestationError::BadEncoding("signing_public_key"))?;
		let public_key = VerifyingKey::from_bytes(&public_key_bytes)
			.map_err(|_| AttestationError::BadEncoding("signing_public_key"))?;
		let signature_bytes = hex::decode(&document.signature)
			.map_err(|_| AttestationError::BadEncoding("signature"))?;
		let signature = Signature::from_slice(&signature_bytes)
			.map_err(|_| AttestationError::BadEncoding("signature"))?;

		if document.issued_at > unix_now() + ISSUED_AT_SKEW_SECS {
			return Err(AttestationError::IssuedInFuture);
		}

		public_key
			.verify(
				&signing_payload(
					&document.enclave_measurement,
					&document.signing_public_key,
					&document.user_data_hash,
					&document.nonce,
					document.issued_at,
				),
				&signature,
			)
			.map_err(|_| AttestationError::BadSignature)
	}
}

/// Binds the cluster identity string and the control-plane signing key.
fn user_data_hash(cluster_id: &str, control_plane_public_key: &[u8]) -> String {
	let mut hasher = Sha256::new();
	hasher.update(cluster_id.as_bytes());
	hasher.update(control_plane_public_key);
	hex::encode(hasher.finalize())
}

fn signing_payload(
	measurement: &str,
	public_key: &str,
	user_data_hash: &str,
	nonce: &str,
	issued_at: u64,
) -> Vec<u8> {
	format!("{measurement}|{public_key}|{user_data_hash}|{nonce}|{issued_at}").into_bytes()
}

fn unix_now() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.expect("system clock before unix epoch")
		.as_secs()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn provider() -> AttestationProvider {
		AttestationProvider::new_simulated("daas-test-cluster", b"control-plane-key")
	}

	#[test]
	fn issued_documents_verify() {
		let document = provider().attest("nonce-1");
		assert!(document.simulated);
		AttestationProvider::verify(&document).unwrap();
	}

	#[test]
	fn simulated_measurement_is_deterministic() {
		let a = provider().attest("n");
		let b = provider().attest("n");
		assert_eq!(a.enclave_measurement, b.enclave_measurement);
		assert_eq!(a.signing_public_key, b.signing_public_key);
		assert_eq!(a.user_data_hash, b.user_data_hash);
	}

	#[test]
	fn tampered_measurement_fails_verification() {
		let mut document = provider().attest("nonce-1");
		document.enclave_measurement = hex::encode([0u8; 32]);
		assert_eq!(
			AttestationProvider::verify(&document),
			Err(AttestationError::BadSignature)
		);
	}

	#[test]
	fn future_documents_are_rejected() {
		let mut document = provider().attest("nonce-1");
		document.issued_at = unix_now() + 3600;
		assert_eq!(
			AttestationProvider::verify(&document),
			Err(AttestationError::IssuedInFuture)
		);
	}

	#[test]
	fn garbage_encoding_is_reported_as_such() {
		let mut document = provider().attest("nonce-1");
		document.signature = "zz".to_string();
		assert_eq!(
			AttestationProvider::verify(&document),
			Err(AttestationError::BadEncoding("signature"))
		);
	}

	#[test]
	fn user_data_hash_binds_the_control_plane_key() {
		let a = AttestationProvider::new_simulated("c", b"key-one").attest("n");
		let b = AttestationProvider::new_simulated("c", b"key-two").attest("n");
		assert_ne!(a.user_data_hash, b.user_data_hash);
	}
}
