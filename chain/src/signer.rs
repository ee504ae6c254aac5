//! Transaction signing. The Ed25519 key is loaded from enclave-local
//! material and never leaves this module; signing is serialized through a
//! single lock.

use std::{fmt, path::Path, sync::Mutex};

use anyhow::{anyhow, Context, Result};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use daas_primitives::WalletAddress;

pub struct ChainSigner {
	signing_key: Mutex<SigningKey>,
	public_key: VerifyingKey,
	address: WalletAddress,
}

impl ChainSigner {
	/// Load the signer from a hex-encoded 32-byte seed file. The path must
	/// point inside the enclave-visible filesystem; this is the caller's
	/// contract, not something this module can check.
	pub fn from_key_file(path: &Path) -> Result<Self> {
		let mut contents = std::fs::read_to_string(path)
			.with_context(|| format!("Failed to read signing key file at {}", path.display()))?;
		let result = Self::from_hex_seed(contents.trim());
		contents.zeroize();
		result
	}

	fn from_hex_seed(hex_seed: &str) -> Result<Self> {
		let mut seed_bytes = hex::decode(hex_seed).context("Signing key file is not hex")?;
		let seed: &[u8; 32] = seed_bytes
			.as_slice()
			.try_into()
			.map_err(|_| anyhow!("Signing key seed must be exactly 32 bytes"))?;
		let signing_key = SigningKey::from_bytes(seed);
		seed_bytes.zeroize();

		let public_key = signing_key.verifying_key();
		Ok(Self {
			address: address_of(&public_key),
			signing_key: Mutex::new(signing_key),
			public_key,
		})
	}

	#[cfg(any(test, feature = "test-utils"))]
	pub fn generate() -> Self {
		let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
		let public_key = signing_key.verifying_key();
		Self {
			address: address_of(&public_key),
			signing_key: Mutex::new(signing_key),
			public_key,
		}
	}

	/// Sign a message, returning the hex-encoded signature.
	pub fn sign(&self, message: &[u8]) -> String {
		let signature = self
			.signing_key
			.lock()
			.expect("signer lock only held for the duration of a signature")
			.sign(message);
		hex::encode(signature.to_bytes())
	}

	pub fn public_key(&self) -> &VerifyingKey {
		&self.public_key
	}

	pub fn address(&self) -> &WalletAddress {
		&self.address
	}
}

impl fmt::Debug for ChainSigner {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ChainSigner").field("address", &self.address).finish_non_exhaustive()
	}
}

/// The wallet address is the hex digest of the public key, 0x-prefixed.
fn address_of(public_key: &VerifyingKey) -> WalletAddress {
	let digest = Sha256::digest(public_key.as_bytes());
	WalletAddress(format!("0x{}", hex::encode(digest)))
}

#[cfg(test)]
mod tests {
	use super::*;
	use ed25519_dalek::{Signature, Verifier};
	use std::io::Write;

	#[test]
	fn loads_from_key_file_and_signs() {
		let seed = [7u8; 32];
		let mut key_file = tempfile::NamedTempFile::new().unwrap();
		writeln!(key_file, "{}", hex::encode(seed)).unwrap();

		let signer = ChainSigner::from_key_file(key_file.path()).unwrap();
		let signature_hex = signer.sign(b"canonical tx bytes");

		let signature =
			Signature::from_slice(&hex::decode(signature_hex).unwrap()).unwrap();
		signer.public_key().verify(b"canonical tx bytes", &signature).unwrap();
	}

	#[test]
	fn rejects_short_seed() {
		let mut key_file = tempfile::NamedTempFile::new().unwrap();
		writeln!(key_file, "{}", hex::encode([1u8; 16])).unwrap();
		assert!(ChainSigner::from_key_file(key_file.path()).is_err());
	}

	#[test]
	fn address_is_stable_and_prefixed() {
		let mut key_file = tempfile::NamedTempFile::new().unwrap();
		writeln!(key_file, "{}", hex::encode([9u8; 32])).unwrap();
		let a = ChainSigner::from_key_file(key_file.path()).unwrap();
		let b = ChainSigner::from_key_file(key_file.path()).unwrap();
		assert_eq!(a.address(), b.address());
		assert!(a.address().0.starts_with("0x"));
	}

	#[test]
	fn debug_does_not_leak_key_material() {
		let signer = ChainSigner::generate();
		let rendered = format!("{signer:?}");
		assert!(rendered.contains("address"));
		assert!(!rendered.contains("signing_key"));
	}
}
