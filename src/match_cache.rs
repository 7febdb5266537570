//! Per-call-site memo of "does this site match any target pattern"
//!
//! The cache sits on the hot path of every intercepted call, so it is built
//! for read-mostly concurrent access:
//!
//! ```text
//! CallSiteId ──hash──▶ shard[i]  (SHARD_COUNT independent locks)
//!                          │
//!                          ▼
//!            ShardedLock<FnvHashMap<CallSiteId, bool>>
//!              read:  per-thread reader slot, no shared cache line
//!              write: only on first sight of an identity
//! ```
//!
//! Unrelated call sites land on different shards, so a first-sight write
//! never blocks lookups for the rest of the program. Two threads that miss
//! on the same identity at the same time both compute `matches_any`; the
//! answer is deterministic for a given pattern set, and the first insert
//! wins.

use crate::host::CallSiteId;
use crate::pattern::{matches_any, TargetPattern};
use crossbeam::sync::ShardedLock;
use fnv::FnvHashMap;
use std::sync::PoisonError;

/// Number of key shards (power of two)
const SHARD_COUNT: usize = 16;

/// Fibonacci-hashing multiplier used to spread identities over shards
const SHARD_MIX: u64 = 0x9E37_79B9_7F4A_7C15;

/// Concurrent identity → match-result cache
#[derive(Debug)]
pub struct MatchCache {
    shards: Box<[ShardedLock<FnvHashMap<CallSiteId, bool>>]>,
}

impl Default for MatchCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MatchCache {
    pub fn new() -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| ShardedLock::new(FnvHashMap::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { shards }
    }

    fn shard(&self, id: CallSiteId) -> &ShardedLock<FnvHashMap<CallSiteId, bool>> {
        let index = (id.as_raw().wrapping_mul(SHARD_MIX) >> (64 - SHARD_COUNT.trailing_zeros()))
            as usize;
        &self.shards[index]
    }

    /// Cached result for `id`, if one has been stored
    pub fn get(&self, id: CallSiteId) -> Option<bool> {
        let shard = self
            .shard(id)
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        shard.get(&id).copied()
    }

    /// Return the cached result for `id`, computing and storing it on a miss
    pub fn get_or_compute(
        &self,
        id: CallSiteId,
        module: &str,
        qualified_name: &str,
        patterns: &[TargetPattern],
    ) -> bool {
        if let Some(hit) = self.get(id) {
            return hit;
        }

        // Computed outside the lock; racing threads converge on the same value
        let computed = matches_any(patterns, module, qualified_name);

        let mut shard = self
            .shard(id)
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *shard.entry(id).or_insert(computed)
    }

    /// Drop every cached entry
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        }
    }

    /// Number of cached identities
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
