//! Seal-token derivation on the worker side.
//!
//! The durable form is the 64-hex id of the Seal object created by the
//! staking transaction. When the staking effects carry no usable object id,
//! the agent falls back to the short-lived dotted form, re-signed whenever
//! it approaches the master's acceptance window.

use std::{
	path::{Path, PathBuf},
	time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result};
use rand::RngCore;
use tracing::{debug, warn};

use daas_chain::ChainSigner;
use daas_primitives::{SealToken, TokenKind, TOKEN_TIMESTAMP_WINDOW_SECS};

/// Re-derive a dotted token once it is within this many seconds of falling
/// out of the master's acceptance window.
const REDERIVE_MARGIN_SECS: u64 = 60;

pub enum TokenSource {
	/// Fixed hex token minted by the staking transaction.
	SealObject(SealToken),
	/// Challenge-signed dotted tokens, re-derived as they age.
	Derived,
}

pub struct TokenManager {
	source: TokenSource,
	signer: std::sync::Arc<ChainSigner>,
	cache_file: PathBuf,
}

impl TokenManager {
	pub fn new(
		source: TokenSource,
		signer: std::sync::Arc<ChainSigner>,
		cache_file: PathBuf,
	) -> Self {
		Self { source, signer, cache_file }
	}

	/// Pick the token source out of staking-transaction effects: the first
	/// created object whose id is a well-formed hex token.
	pub fn from_staking_effects(
		created_objects: &[String],
		signer: std::sync::Arc<ChainSigner>,
		cache_file: PathBuf,
	) -> Self {
		let seal_object = created_objects.iter().find_map(|object_id| {
			let token = SealToken::new(object_id.trim_start_matches("0x"));
			matches!(token.kind(), Ok(TokenKind::Hex)).then_some(token)
		});
		match seal_object {
			Some(token) => {
				debug!("Using seal object id from staking effects");
				Self::new(TokenSource::SealObject(token), signer, cache_file)
			},
			None => {
				debug!("No seal object in staking effects, deriving dotted tokens");
				Self::new(TokenSource::Derived, signer, cache_file)
			},
		}
	}

	/// A token currently acceptable to the master. Hex tokens never rot;
	/// dotted tokens are re-signed when they get close to the window edge.
	pub fn current(&self) -> SealToken {
		match &self.source {
			TokenSource::SealObject(token) => token.clone(),
			TokenSource::Derived => {
				if let Some(cached) = self.load_cached() {
					if let Ok(TokenKind::Dotted { timestamp, .. }) = cached.kind() {
						let now = unix_now();
						if now.saturating_sub(timestamp)
							< TOKEN_TIMESTAMP_WINDOW_SECS - REDERIVE_MARGIN_SECS
						{
							return cached;
						}
					}
				}
				let fresh = derive_dotted_token(&self.signer, unix_now());
				self.cache(&fresh);
				fresh
			},
		}
	}

	fn load_cached(&self) -> Option<SealToken> {
		let contents = std::fs::read_to_string(&self.cache_file).ok()?;
		let trimmed = contents.trim();
		(!trimmed.is_empty()).then(|| SealToken::new(trimmed))
	}

	fn cache(&self, token: &SealToken) {
		if let Some(parent) = self.cache_file.parent() {
			let _ = std::fs::create_dir_all(parent);
		}
		if let Err(error) = std::fs::write(&self.cache_file, token.expose()) {
			warn!(path = %self.cache_file.display(), "Could not cache seal token: {error}");
		}
	}
}

/// `seal_<address>_<sig>_challenge_<nonce>_<ts>_<ts>`: the signature covers
/// the challenge string, the trailing timestamp dates the token itself.
pub fn derive_dotted_token(signer: &ChainSigner, now: u64) -> SealToken {
	let mut nonce_bytes = [0u8; 8];
	rand::thread_rng().fill_bytes(&mut nonce_bytes);
	let nonce = hex::encode(nonce_bytes);
	let challenge = format!("challenge_{nonce}_{now}");
	let signature = signer.sign(challenge.as_bytes());
	SealToken::new(format!(
		"seal_{}_{}_{}_{}",
		signer.address(),
		signature,
		challenge,
		now
	))
}

/// Persist a signing key seed if none exists yet, then load it. Worker
/// hosts derive their wallet from this enclave-local file.
pub fn load_or_create_signer(path: &Path) -> Result<ChainSigner> {
	if !path.exists() {
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent)
				.with_context(|| format!("Failed to create {}", parent.display()))?;
		}
		let mut seed = [0u8; 32];
		rand::rngs::OsRng.fill_bytes(&mut seed);
		std::fs::write(path, hex::encode(seed))
			.with_context(|| format!("Failed to write signing key to {}", path.display()))?;
	}
	ChainSigner::from_key_file(path)
}

fn unix_now() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.expect("system clock before unix epoch")
		.as_secs()
}
