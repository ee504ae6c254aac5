//! In-enclave key/value store for control-plane bookkeeping.
//!
//! Volatile by design: nothing is written outside the enclave and nothing
//! survives a master restart. Writes are totally ordered under one writer
//! lock and every mutation bumps the revision counter.

use std::{collections::BTreeMap, sync::RwLock};

use tracing::warn;

use crate::metrics::STORE_WRITES_DROPPED;

/// Keys under this prefix are droppable bookkeeping (event audit trail);
/// they are the first writes refused when the store is over its soft limit.
pub const NON_CORE_PREFIX: &str = "/registry/events/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
	/// Stored; carries the new store revision.
	Stored(u64),
	/// A non-core write was refused because the store is over its limit.
	DroppedOverCapacity,
}

#[derive(Debug, Default)]
struct StoreInner {
	entries: BTreeMap<String, Vec<u8>>,
	revision: u64,
	total_bytes: usize,
}

pub struct StateStore {
	inner: RwLock<StoreInner>,
	soft_limit_bytes: usize,
}

impl StateStore {
	pub fn new(soft_limit_bytes: usize) -> Self {
		Self { inner: RwLock::new(StoreInner::default()), soft_limit_bytes }
	}

	pub fn get(&self, key: &str) -> Option<Vec<u8>> {
		self.inner.read().expect("store lock").entries.get(key).cloned()
	}

	pub fn put(&self, key: &str, value: Vec<u8>) -> PutOutcome {
		let mut inner = self.inner.write().expect("store lock");
		let over_limit = inner.total_bytes >= self.soft_limit_bytes;
		if over_limit && key.starts_with(NON_CORE_PREFIX) {
			warn!(key, "Dropping non-core write, store over soft limit");
			STORE_WRITES_DROPPED.inc();
			return PutOutcome::DroppedOverCapacity;
		}

		let new_bytes = key.len() + value.len();
		if let Some(previous) = inner.entries.insert(key.to_string(), value) {
			inner.total_bytes -= key.len() + previous.len();
		}
		inner.total_bytes += new_bytes;
		inner.revision += 1;
		PutOutcome::Stored(inner.revision)
	}

	pub fn delete(&self, key: &str) -> bool {
		let mut inner = self.inner.write().expect("store lock");
		match inner.entries.remove(key) {
			Some(removed) => {
				inner.total_bytes -= key.len() + removed.len();
				inner.revision += 1;
				true
			},
			None => false,
		}
	}

	pub fn list(&self, prefix: &str) -> Vec<(String, Vec<u8>)> {
		let inner = self.inner.read().expect("store lock");
		inner
			.entries
			.range(prefix.to_string()..)
			.take_while(|(key, _)| key.starts_with(prefix))
			.map(|(key, value)| (key.clone(), value.clone()))
			.collect()
	}

	pub fn revision(&self) -> u64 {
		self.inner.read().expect("store lock").revision
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn put_get_delete_round_trip() {
		let store = StateStore::new(1024);
		assert_eq!(store.put("/registry/workers/w1", b"record".to_vec()), PutOutcome::Stored(1));
		assert_eq!(store.get("/registry/workers/w1"), Some(b"record".to_vec()));
		assert!(store.delete("/registry/workers/w1"));
		assert_eq!(store.get("/registry/workers/w1"), None);
		assert!(!store.delete("/registry/workers/w1"));
	}

	#[test]
	fn revision_is_monotonic_across_mutations() {
		let store = StateStore::new(1024);
		store.put("/a", vec![1]);
		store.put("/b", vec![2]);
		store.delete("/a");
		assert_eq!(store.revision(), 3);
		// Reads do not advance the revision.
		store.get("/b");
		store.list("/");
		assert_eq!(store.revision(), 3);
	}

	#[test]
	fn list_returns_only_the_prefix_in_order() {
		let store = StateStore::new(1024);
		store.put("/registry/workers/w2", vec![2]);
		store.put("/registry/workers/w1", vec![1]);
		store.put("/registry/events/e1", vec![9]);

		let listed = store.list("/registry/workers/");
		assert_eq!(
			listed.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(),
			vec!["/registry/workers/w1", "/registry/workers/w2"]
		);
	}

	#[test]
	fn over_limit_drops_event_writes_but_not_core_writes() {
		let store = StateStore::new(8);
		store.put("/registry/workers/w1", vec![0; 32]);

		assert_eq!(
			store.put("/registry/events/e1", vec![1]),
			PutOutcome::DroppedOverCapacity
		);
		assert_eq!(store.get("/registry/events/e1"), None);

		// Core kinds are still accepted over the soft limit.
		assert!(matches!(
			store.put("/registry/workers/w2", vec![0; 8]),
			PutOutcome::Stored(_)
		));
	}

	#[test]
	fn overwrites_release_previous_bytes() {
		let store = StateStore::new(64);
		store.put("/k", vec![0; 40]);
		store.put("/k", vec![0; 4]);
		// After shrinking the value the store is under the limit again.
		assert!(matches!(store.put("/registry/events/e1", vec![1]), PutOutcome::Stored(_)));
	}
}
