//! Sharded LRU cache for resolved identities. One lock per shard keeps
//! parallel lookups from serializing on a single mutex; capacity is split
//! evenly across shards.

use std::{
	collections::hash_map::DefaultHasher,
	hash::{Hash, Hasher},
	num::NonZeroUsize,
	sync::Mutex,
	time::{Duration, Instant},
};

use lru::LruCache;

use daas_primitives::{Identity, WalletAddress};

const SHARD_COUNT: usize = 16;

struct CacheEntry {
	identity: Identity,
	inserted_at: Instant,
}

pub struct ShardedCache {
	shards: Vec<Mutex<LruCache<String, CacheEntry>>>,
	ttl: Duration,
}

impl ShardedCache {
	pub fn new(capacity: usize, ttl: Duration) -> Self {
		let per_shard = NonZeroUsize::new((capacity / SHARD_COUNT).max(1))
			.expect("max(1) keeps the capacity non-zero");
		Self {
			shards: (0..SHARD_COUNT).map(|_| Mutex::new(LruCache::new(per_shard))).collect(),
			ttl,
		}
	}

	fn shard(&self, token: &str) -> &Mutex<LruCache<String, CacheEntry>> {
		let mut hasher = DefaultHasher::new();
		token.hash(&mut hasher);
		&self.shards[(hasher.finish() as usize) % SHARD_COUNT]
	}

	/// An expired entry is never returned; it is removed on access.
	pub fn get(&self, token: &str) -> Option<Identity> {
		let mut shard = self.shard(token).lock().expect("cache shard lock");
		match shard.get(token) {
			Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
				Some(entry.identity.clone())
			},
			Some(_) => {
				shard.pop(token);
				None
			},
			None => None,
		}
	}

	pub fn insert(&self, token: String, identity: Identity) {
		self.shard(&token)
			.lock()
			.expect("cache shard lock")
			.put(token, CacheEntry { identity, inserted_at: Instant::now() });
	}

	/// Drop every cached identity resolved for `wallet`. Used when a stake
	/// event makes previously resolved identities suspect.
	pub fn remove_wallet(&self, wallet: &WalletAddress) -> usize {
		let mut removed = 0;
		for shard in &self.shards {
			let mut shard = shard.lock().expect("cache shard lock");
			let stale: Vec<String> = shard
				.iter()
				.filter(|(_, entry)| &entry.identity.wallet_address == wallet)
				.map(|(token, _)| token.clone())
				.collect();
			for token in stale {
				shard.pop(&token);
				removed += 1;
			}
		}
		removed
	}

	/// Evict every expired entry; returns how many were removed.
	pub fn sweep_expired(&self) -> usize {
		let mut removed = 0;
		for shard in &self.shards {
			let mut shard = shard.lock().expect("cache shard lock");
			let expired: Vec<String> = shard
				.iter()
				.filter(|(_, entry)| entry.inserted_at.elapsed() >= self.ttl)
				.map(|(token, _)| token.clone())
				.collect();
			for token in expired {
				shard.pop(&token);
				removed += 1;
			}
		}
		removed
	}

	pub fn len(&self) -> usize {
		self.shards.iter().map(|shard| shard.lock().expect("cache shard lock").len()).sum()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::BTreeSet;

	fn identity(wallet: &str) -> Identity {
		Identity {
			principal_name: wallet.to_string(),
			groups: BTreeSet::new(),
			wallet_address: WalletAddress::from(wallet),
			stake_amount: 1,
			not_after: 0,
		}
	}

	#[test]
	fn expired_entries_are_removed_on_access() {
		let cache = ShardedCache::new(64, Duration::ZERO);
		cache.insert("t1".to_string(), identity("0xa"));
		assert!(cache.get("t1").is_none());
		assert_eq!(cache.len(), 0);
	}

	#[test]
	fn wallet_invalidation_spans_shards() {
		let cache = ShardedCache::new(64, Duration::from_secs(60));
		for i in 0..40 {
			let wallet = if i % 2 == 0 { "0xeven" } else { "0xodd" };
			cache.insert(format!("token-{i}"), identity(wallet));
		}
		assert_eq!(cache.remove_wallet(&WalletAddress::from("0xeven")), 20);
		assert_eq!(cache.len(), 20);
	}

	#[test]
	fn sweep_removes_only_expired() {
		let cache = ShardedCache::new(64, Duration::from_millis(30));
		cache.insert("old".to_string(), identity("0xa"));
		std::thread::sleep(Duration::from_millis(40));
		cache.insert("fresh".to_string(), identity("0xb"));
		assert_eq!(cache.sweep_expired(), 1);
		assert!(cache.get("fresh").is_some());
	}

	#[test]
	fn capacity_is_bounded_per_shard() {
		let cache = ShardedCache::new(16, Duration::from_secs(60));
		// Capacity splits to one entry per shard; occupancy stays bounded.
		for i in 0..1000 {
			cache.insert(format!("token-{i}"), identity("0xa"));
		}
		assert!(cache.len() <= 16);
	}
}
