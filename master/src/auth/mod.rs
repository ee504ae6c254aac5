//! Seal-token authentication: an opaque bearer token in, an identity with
//! groups out. Authority comes from the on-chain stake object, never from
//! the token bits; a bounded cache keeps chain reads off the hot path.

mod cache;

use std::{
	collections::HashMap,
	sync::{Arc, RwLock},
	time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use tracing::{debug, info};

use daas_chain::{ChainClient, ChainError, ChainRpcApi};
use daas_primitives::{
	Identity, SealToken, StakeInfo, StakeStatus, StakeTiers, TokenKind, WalletAddress,
	TOKEN_TIMESTAMP_WINDOW_SECS,
};

use crate::constants::{AUTH_CACHE_CAPACITY, AUTH_CACHE_TTL};

pub use cache::ShardedCache;

#[cfg(test)]
use mockall::automock;

/// The chain reads the authenticator needs. Narrow on purpose so tests can
/// stand in a mock without a full chain client.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StakeReader: Send + Sync {
	async fn get_stake(&self, wallet: &WalletAddress)
		-> Result<Option<StakeInfo>, ChainError>;
}

#[async_trait]
impl<Rpc: ChainRpcApi> StakeReader for ChainClient<Rpc> {
	async fn get_stake(
		&self,
		wallet: &WalletAddress,
	) -> Result<Option<StakeInfo>, ChainError> {
		ChainClient::get_stake(self, wallet).await
	}
}

/// Rejection reasons. Everything except `ChainUnavailable` maps to a 401;
/// an unreachable chain with a cold cache is a 503.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
	#[error("MalformedToken")]
	MalformedToken,
	#[error("Expired")]
	Expired,
	#[error("UnknownToken")]
	UnknownToken,
	#[error("NoStake")]
	NoStake,
	#[error("InsufficientStake")]
	InsufficientStake,
	#[error("Inactive")]
	Inactive,
	#[error("TransientChainError")]
	ChainUnavailable(#[source] ChainError),
}

impl AuthError {
	/// Stable label for the reject counter and response bodies.
	pub fn reason(&self) -> &'static str {
		match self {
			AuthError::MalformedToken => "MalformedToken",
			AuthError::Expired => "Expired",
			AuthError::UnknownToken => "UnknownToken",
			AuthError::NoStake => "NoStake",
			AuthError::InsufficientStake => "InsufficientStake",
			AuthError::Inactive => "Inactive",
			AuthError::ChainUnavailable(_) => "TransientChainError",
		}
	}
}

pub struct Authenticator {
	chain: Arc<dyn StakeReader>,
	cache: ShardedCache,
	/// Hex tokens carry no wallet; this index is populated at worker
	/// registration and consulted on their first authentication.
	token_wallets: RwLock<HashMap<String, WalletAddress>>,
	tiers: StakeTiers,
	cache_ttl: Duration,
}

impl Authenticator {
	pub fn new(chain: Arc<dyn StakeReader>, tiers: StakeTiers) -> Self {
		Self::with_cache(chain, tiers, AUTH_CACHE_CAPACITY, AUTH_CACHE_TTL)
	}

	pub fn with_cache(
		chain: Arc<dyn StakeReader>,
		tiers: StakeTiers,
		cache_capacity: usize,
		cache_ttl: Duration,
	) -> Self {
		Self {
			chain,
			cache: ShardedCache::new(cache_capacity, cache_ttl),
			token_wallets: RwLock::new(HashMap::new()),
			tiers,
			cache_ttl,
		}
	}

	/// Record which wallet a hex token belongs to. Called by the worker
	/// registration path once the registry has confirmed the worker.
	pub fn index_token(&self, token: &SealToken, wallet: WalletAddress) {
		if matches!(token.kind(), Ok(TokenKind::Hex)) {
			self.token_wallets
				.write()
				.expect("token index lock")
				.insert(token.expose().to_string(), wallet);
		}
	}

	/// Drop all cached identities for a wallet, forcing the next
	/// authentication through the chain.
	pub fn invalidate_wallet(&self, wallet: &WalletAddress) {
		let removed = self.cache.remove_wallet(wallet);
		if removed > 0 {
			debug!(%wallet, removed, "Invalidated cached identities");
		}
	}

	pub async fn authenticate(&self, token: &SealToken) -> Result<Identity, AuthError> {
		let kind = token.kind().map_err(|_| AuthError::MalformedToken)?;

		if let TokenKind::Dotted { timestamp, .. } = &kind {
			let now = unix_now();
			if now.abs_diff(*timestamp) > TOKEN_TIMESTAMP_WINDOW_SECS {
				return Err(AuthError::Expired);
			}
		}

		if let Some(identity) = self.cache.get(token.expose()) {
			return Ok(identity);
		}

		let wallet = match kind {
			TokenKind::Dotted { address, .. } => address,
			TokenKind::Hex => self
				.token_wallets
				.read()
				.expect("token index lock")
				.get(token.expose())
				.cloned()
				.ok_or(AuthError::UnknownToken)?,
		};

		let stake = self
			.chain
			.get_stake(&wallet)
			.await
			.map_err(AuthError::ChainUnavailable)?
			.ok_or(AuthError::NoStake)?;

		match stake.status {
			StakeStatus::Active => {},
			StakeStatus::Inactive | StakeStatus::Slashed => return Err(AuthError::Inactive),
		}

		let groups =
			self.tiers.groups_for(stake.amount).ok_or(AuthError::InsufficientStake)?;

		let identity = Identity {
			principal_name: wallet.0.clone(),
			groups,
			wallet_address: wallet,
			stake_amount: stake.amount,
			not_after: unix_now() + self.cache_ttl.as_secs(),
		};
		self.cache.insert(token.expose().to_string(), identity.clone());
		Ok(identity)
	}

	/// Periodic eviction of expired cache entries.
	#[tracing::instrument(name = "auth-cache-sweeper", skip_all)]
	pub async fn run_sweeper(
		self: Arc<Self>,
		sweep_interval: Duration,
	) -> anyhow::Result<()> {
		info!("Starting");
		let mut interval = tokio::time::interval(sweep_interval);
		interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		loop {
			interval.tick().await;
			let removed = self.cache.sweep_expired();
			if removed > 0 {
				debug!(removed, "Swept expired auth cache entries");
			}
		}
	}

	#[cfg(test)]
	pub fn cached_entries(&self) -> usize {
		self.cache.len()
	}
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
	use daas_primitives::{groups, MIST_PER_SUI};

	fn active_stake(amount: u64) -> StakeInfo {
		StakeInfo { amount, status: StakeStatus::Active, last_update: 0 }
	}

	fn dotted_token(wallet: &str, age_secs: i64) -> SealToken {
		let timestamp = (unix_now() as i64 - age_secs) as u64;
		SealToken::new(format!("seal_{wallet}_sigbytes_challenge_1_{timestamp}"))
	}

	fn hex_token() -> SealToken {
		SealToken::new("ab".repeat(32))
	}

	fn authenticator(chain: MockStakeReader) -> Authenticator {
		Authenticator::with_cache(
			Arc::new(chain),
			StakeTiers::default(),
			64,
			Duration::from_secs(300),
		)
	}

	#[tokio::test]
	async fn short_tokens_are_malformed() {
		let auth = authenticator(MockStakeReader::new());
		let result = auth.authenticate(&SealToken::new("abcd")).await;
		assert!(matches!(result, Err(AuthError::MalformedToken)));
	}

	#[tokio::test]
	async fn dotted_tokens_outside_the_window_are_expired() {
		let auth = authenticator(MockStakeReader::new());
		assert!(matches!(
			auth.authenticate(&dotted_token("0xabc", 301)).await,
			Err(AuthError::Expired)
		));
		// Timestamps from the future are just as dead.
		assert!(matches!(
			auth.authenticate(&dotted_token("0xabc", -301)).await,
			Err(AuthError::Expired)
		));
		// The boundary itself is accepted (and then fails on the stake read).
		let mut chain = MockStakeReader::new();
		chain.expect_get_stake().returning(|_| Ok(None));
		let auth = authenticator(chain);
		assert!(matches!(
			auth.authenticate(&dotted_token("0xabc", 299)).await,
			Err(AuthError::NoStake)
		));
	}

	#[tokio::test]
	async fn unindexed_hex_tokens_are_unknown() {
		let auth = authenticator(MockStakeReader::new());
		assert!(matches!(
			auth.authenticate(&hex_token()).await,
			Err(AuthError::UnknownToken)
		));
	}

	#[tokio::test]
	async fn indexed_hex_token_resolves_and_caches() {
		let mut chain = MockStakeReader::new();
		chain
			.expect_get_stake()
			.times(1)
			.returning(|_| Ok(Some(active_stake(2 * MIST_PER_SUI))));
		let auth = authenticator(chain);

		let token = hex_token();
		auth.index_token(&token, WalletAddress::from("0xabc"));

		let identity = auth.authenticate(&token).await.unwrap();
		assert_eq!(identity.wallet_address, WalletAddress::from("0xabc"));
		assert!(identity.groups.contains(groups::USER));

		// Second call must come from the cache: the mock allows one read.
		let cached = auth.authenticate(&token).await.unwrap();
		assert_eq!(cached, identity);
	}

	#[tokio::test]
	async fn stake_tier_boundary_is_exact() {
		let mut chain = MockStakeReader::new();
		chain
			.expect_get_stake()
			.returning(|_| Ok(Some(active_stake(MIST_PER_SUI - 1))));
		let auth = authenticator(chain);
		assert!(matches!(
			auth.authenticate(&dotted_token("0xabc", 0)).await,
			Err(AuthError::InsufficientStake)
		));

		let mut chain = MockStakeReader::new();
		chain.expect_get_stake().returning(|_| Ok(Some(active_stake(MIST_PER_SUI))));
		let auth = authenticator(chain);
		let identity = auth.authenticate(&dotted_token("0xabc", 0)).await.unwrap();
		assert!(identity.groups.contains(groups::USER));
		assert!(identity.groups.contains(groups::DEVELOPER));
	}

	#[tokio::test]
	async fn admin_tier_gets_cluster_admin() {
		let mut chain = MockStakeReader::new();
		chain
			.expect_get_stake()
			.returning(|_| Ok(Some(active_stake(10 * MIST_PER_SUI))));
		let identity = authenticator(chain)
			.authenticate(&dotted_token("0xadmin", 0))
			.await
			.unwrap();
		assert!(identity.groups.contains(groups::CLUSTER_ADMIN));
		assert!(identity.groups.contains(groups::AUTHENTICATED));
	}

	#[tokio::test]
	async fn slashed_stake_is_inactive() {
		let mut chain = MockStakeReader::new();
		chain.expect_get_stake().returning(|_| {
			Ok(Some(StakeInfo {
				amount: 10 * MIST_PER_SUI,
				status: StakeStatus::Slashed,
				last_update: 0,
			}))
		});
		assert!(matches!(
			authenticator(chain).authenticate(&dotted_token("0xabc", 0)).await,
			Err(AuthError::Inactive)
		));
	}

	#[tokio::test]
	async fn warm_cache_survives_chain_outage() {
		let mut chain = MockStakeReader::new();
		let mut calls = 0;
		chain.expect_get_stake().returning(move |_| {
			calls += 1;
			if calls == 1 {
				Ok(Some(active_stake(2 * MIST_PER_SUI)))
			} else {
				Err(ChainError::Transient(anyhow::anyhow!("rpc unreachable")))
			}
		});
		let auth = authenticator(chain);
		let token = dotted_token("0xabc", 0);

		auth.authenticate(&token).await.unwrap();
		// Chain is now down; the cached identity still serves.
		auth.authenticate(&token).await.unwrap();

		// Once the wallet is invalidated the outage becomes visible.
		auth.invalidate_wallet(&WalletAddress::from("0xabc"));
		assert!(matches!(
			auth.authenticate(&token).await,
			Err(AuthError::ChainUnavailable(_))
		));
	}

	#[tokio::test]
	async fn invalidate_wallet_forces_revalidation() {
		let mut chain = MockStakeReader::new();
		let mut calls = 0;
		chain.expect_get_stake().times(2).returning(move |_| {
			calls += 1;
			if calls == 1 {
				Ok(Some(active_stake(2 * MIST_PER_SUI)))
			} else {
				Ok(Some(StakeInfo {
					amount: 2 * MIST_PER_SUI,
					status: StakeStatus::Slashed,
					last_update: 0,
				}))
			}
		});
		let auth = authenticator(chain);
		let token = dotted_token("0xabc", 0);

		auth.authenticate(&token).await.unwrap();
		auth.invalidate_wallet(&WalletAddress::from("0xabc"));
		assert!(matches!(auth.authenticate(&token).await, Err(AuthError::Inactive)));
	}

	#[tokio::test]
	async fn expired_entries_never_serve() {
		let mut chain = MockStakeReader::new();
		chain
			.expect_get_stake()
			.times(2)
			.returning(|_| Ok(Some(active_stake(2 * MIST_PER_SUI))));
		let auth = Authenticator::with_cache(
			Arc::new(chain),
			StakeTiers::default(),
			64,
			Duration::ZERO,
		);
		let token = dotted_token("0xabc", 0);
		auth.authenticate(&token).await.unwrap();
		// TTL zero: the entry expired immediately, so the chain is hit again.
		auth.authenticate(&token).await.unwrap();
		assert_eq!(auth.cached_entries(), 1);
	}
}
