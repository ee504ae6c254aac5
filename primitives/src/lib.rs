//! Shared domain types for the daas control plane and worker agent.

use std::{
	collections::BTreeSet,
	fmt::{self, Display},
	str::FromStr,
};

use serde::{Deserialize, Serialize};

/// Smallest unit of the native token. 1 SUI = 10^9 MIST.
pub const MIST_PER_SUI: u64 = 1_000_000_000;

/// How far a dotted token's timestamp may deviate from the local clock.
pub const TOKEN_TIMESTAMP_WINDOW_SECS: u64 = 300;

pub mod groups {
	pub const AUTHENTICATED: &str = "system:authenticated";
	pub const ADMIN: &str = "daas:admin";
	pub const CLUSTER_ADMIN: &str = "daas:cluster-admin";
	pub const OPERATOR: &str = "daas:operator";
	pub const NAMESPACE_ADMIN: &str = "daas:namespace-admin";
	pub const USER: &str = "daas:user";
	pub const DEVELOPER: &str = "daas:developer";
}

/// Unique identifier of a worker host.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl Display for NodeId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for NodeId {
	fn from(s: &str) -> Self {
		NodeId(s.to_string())
	}
}

/// An on-chain account address.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WalletAddress(pub String);

impl Display for WalletAddress {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for WalletAddress {
	fn from(s: &str) -> Self {
		WalletAddress(s.to_string())
	}
}

/// An opaque bearer credential. The token's bits carry no authority; it is
/// resolved against the on-chain registry on every cache miss.
///
/// `Debug` and `Display` render at most the first 8 characters. The full
/// string is only reachable through [`SealToken::expose`], which keeps
/// accidental logging greppable.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SealToken(String);

impl SealToken {
	pub fn new(token: impl Into<String>) -> Self {
		Self(token.into())
	}

	/// The full token string, for wire use only.
	pub fn expose(&self) -> &str {
		&self.0
	}

	/// First 8 characters, the only form that may be logged.
	pub fn redacted(&self) -> String {
		let prefix: String = self.0.chars().take(8).collect();
		format!("{prefix}…")
	}

	/// Classify the token shape without consulting the chain.
	pub fn kind(&self) -> Result<TokenKind, MalformedToken> {
		let s = self.0.as_str();
		if s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
			return Ok(TokenKind::Hex);
		}
		if let Some(rest) = s.strip_prefix("seal_") {
			let parts: Vec<&str> = rest.split('_').collect();
			// challenge may itself contain underscores, so only the first
			// two and the last segment have fixed positions
			if parts.len() < 4 {
				return Err(MalformedToken);
			}
			let timestamp =
				u64::from_str(parts[parts.len() - 1]).map_err(|_| MalformedToken)?;
			let (address, signature) = (parts[0], parts[1]);
			if address.is_empty() || signature.is_empty() {
				return Err(MalformedToken);
			}
			return Ok(TokenKind::Dotted {
				address: WalletAddress(address.to_string()),
				signature: signature.to_string(),
				challenge: parts[2..parts.len() - 1].join("_"),
				timestamp,
			});
		}
		Err(MalformedToken)
	}
}

impl fmt::Debug for SealToken {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "SealToken({})", self.redacted())
	}
}

impl Display for SealToken {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.redacted())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("token is neither 64-char lowercase hex nor of the dotted seal_ form")]
pub struct MalformedToken;

/// The two recognized token shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
	/// 64 lowercase hex characters; the wallet is resolved through the
	/// token index populated at worker registration.
	Hex,
	/// `seal_<address>_<sig>_<challenge>_<unix-ts>`; carries the wallet.
	Dotted {
		address: WalletAddress,
		signature: String,
		challenge: String,
		timestamp: u64,
	},
}

/// Status of an on-chain stake object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StakeStatus {
	Active,
	Inactive,
	Slashed,
}

impl Display for StakeStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			StakeStatus::Active => f.write_str("active"),
			StakeStatus::Inactive => f.write_str("inactive"),
			StakeStatus::Slashed => f.write_str("slashed"),
		}
	}
}

/// Projection of a stake object as read from the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeInfo {
	pub amount: u64,
	pub status: StakeStatus,
	pub last_update: u64,
}

/// Worker lifecycle as tracked by the registry.
///
/// `Slashed` is absorbing: every attempted transition out of it is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerStatus {
	Pending,
	Active,
	Busy,
	Offline,
	Slashed,
}

impl WorkerStatus {
	/// Whether the worker may serve traffic and authenticate.
	pub fn is_live(self) -> bool {
		matches!(self, WorkerStatus::Active | WorkerStatus::Busy)
	}

	/// The allowed edges of the status machine:
	/// `Pending → Active (↔ Busy | ↔ Offline)* → Slashed`.
	pub fn can_transition_to(self, next: WorkerStatus) -> bool {
		use WorkerStatus::*;
		match (self, next) {
			(Slashed, _) => false,
			(_, Slashed) => true,
			(Pending, Active) => true,
			(Active, Busy) | (Busy, Active) => true,
			(Active, Offline) | (Busy, Offline) => true,
			(Offline, Active) => true,
			_ => false,
		}
	}
}

impl Display for WorkerStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			WorkerStatus::Pending => "pending",
			WorkerStatus::Active => "active",
			WorkerStatus::Busy => "busy",
			WorkerStatus::Offline => "offline",
			WorkerStatus::Slashed => "slashed",
		};
		f.write_str(s)
	}
}

/// An authenticated caller, as produced by the seal-token authenticator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
	pub principal_name: String,
	pub groups: BTreeSet<String>,
	pub wallet_address: WalletAddress,
	pub stake_amount: u64,
	/// Unix seconds after which this identity must be re-resolved.
	pub not_after: u64,
}

/// The three stake tiers, in MIST. A single configured source of truth for
/// the minimum-stake constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeTiers {
	pub user_stake_mist: u64,
	pub operator_stake_mist: u64,
	pub admin_stake_mist: u64,
}

impl Default for StakeTiers {
	fn default() -> Self {
		Self {
			user_stake_mist: MIST_PER_SUI,
			operator_stake_mist: 5 * MIST_PER_SUI,
			admin_stake_mist: 10 * MIST_PER_SUI,
		}
	}
}

impl StakeTiers {
	/// Group membership for a stake amount, or `None` below the user tier.
	pub fn groups_for(&self, stake_amount: u64) -> Option<BTreeSet<String>> {
		let tier: &[&str] = if stake_amount >= self.admin_stake_mist {
			&[groups::ADMIN, groups::CLUSTER_ADMIN]
		} else if stake_amount >= self.operator_stake_mist {
			&[groups::OPERATOR, groups::NAMESPACE_ADMIN]
		} else if stake_amount >= self.user_stake_mist {
			&[groups::USER, groups::DEVELOPER]
		} else {
			return None;
		};
		Some(
			std::iter::once(groups::AUTHENTICATED)
				.chain(tier.iter().copied())
				.map(String::from)
				.collect(),
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn hex_token(len: usize) -> SealToken {
		SealToken::new("ab".repeat(len / 2 + 1)[..len].to_string())
	}

	#[test]
	fn hex_tokens_must_be_exactly_64_chars() {
		assert_eq!(hex_token(64).kind().unwrap(), TokenKind::Hex);
		assert_eq!(hex_token(63).kind(), Err(MalformedToken));
		assert_eq!(hex_token(65).kind(), Err(MalformedToken));
	}

	#[test]
	fn uppercase_hex_is_rejected() {
		let token = SealToken::new("AB".repeat(32));
		assert_eq!(token.kind(), Err(MalformedToken));
	}

	#[test]
	fn dotted_token_parses_with_underscored_challenge() {
		let token = SealToken::new("seal_0xabc_sigbytes_challenge_42_1700000000_1700000300");
		match token.kind().unwrap() {
			TokenKind::Dotted { address, signature, challenge, timestamp } => {
				assert_eq!(address, WalletAddress::from("0xabc"));
				assert_eq!(signature, "sigbytes");
				assert_eq!(challenge, "challenge_42_1700000000");
				assert_eq!(timestamp, 1700000300);
			},
			other => panic!("expected dotted token, got {other:?}"),
		}
	}

	#[test]
	fn dotted_token_requires_numeric_timestamp() {
		assert_eq!(
			SealToken::new("seal_0xabc_sig_challenge_soon").kind(),
			Err(MalformedToken)
		);
		assert_eq!(SealToken::new("seal_0xabc_sig").kind(), Err(MalformedToken));
	}

	#[test]
	fn token_debug_is_redacted() {
		let token = SealToken::new("ab".repeat(32));
		let rendered = format!("{token:?}");
		assert!(rendered.contains("abababab…"));
		assert!(!rendered.contains(&"ab".repeat(32)));
	}

	#[test]
	fn slashed_is_absorbing() {
		use WorkerStatus::*;
		for next in [Pending, Active, Busy, Offline, Slashed] {
			assert!(!Slashed.can_transition_to(next));
		}
		for from in [Pending, Active, Busy, Offline] {
			assert!(from.can_transition_to(Slashed));
		}
	}

	#[test]
	fn offline_worker_returns_via_active_only() {
		use WorkerStatus::*;
		assert!(Offline.can_transition_to(Active));
		assert!(!Offline.can_transition_to(Busy));
		assert!(!Offline.can_transition_to(Pending));
	}

	#[test]
	fn stake_tier_boundaries() {
		let tiers = StakeTiers::default();
		assert!(tiers.groups_for(MIST_PER_SUI - 1).is_none());

		let user = tiers.groups_for(MIST_PER_SUI).unwrap();
		assert!(user.contains(groups::USER));
		assert!(user.contains(groups::AUTHENTICATED));
		assert!(!user.contains(groups::ADMIN));

		let operator = tiers.groups_for(5 * MIST_PER_SUI).unwrap();
		assert!(operator.contains(groups::OPERATOR));
		assert!(operator.contains(groups::NAMESPACE_ADMIN));

		let admin = tiers.groups_for(10 * MIST_PER_SUI).unwrap();
		assert!(admin.contains(groups::ADMIN));
		assert!(admin.contains(groups::CLUSTER_ADMIN));
	}

	#[test]
	fn stake_status_round_trips_lowercase() {
		assert_eq!(
			serde_json::from_str::<StakeStatus>("\"slashed\"").unwrap(),
			StakeStatus::Slashed
		);
		assert_eq!(serde_json::to_string(&StakeStatus::Active).unwrap(), "\"active\"");
	}
}
