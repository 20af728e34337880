// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Token blacklist: token-id to expiry, sharded to bound contention.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use parking_lot::Mutex;

const SHARDS: usize = 16;

/// Revoked token ids with their expiry (epoch seconds). Entries whose
/// expiry has passed count as absent; compaction removes them.
pub struct Blacklist {
    shards: Vec<Mutex<HashMap<String, u64>>>,
}

impl Default for Blacklist {
    fn default() -> Self {
        Self::new()
    }
}

impl Blacklist {
    pub fn new() -> Self {
        Self { shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect() }
    }

    fn shard(&self, jti: &str) -> &Mutex<HashMap<String, u64>> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        jti.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARDS]
    }

    /// Revoke a token id until `expires_at` (epoch seconds). The blacklist
    /// TTL must cover the token's remaining lifetime, so the later of the
    /// two expiries wins on re-insertion.
    pub fn insert(&self, jti: &str, expires_at: u64) {
        let mut shard = self.shard(jti).lock();
        let entry = shard.entry(jti.to_owned()).or_insert(expires_at);
        *entry = (*entry).max(expires_at);
    }

    pub fn contains(&self, jti: &str) -> bool {
        let now = crate::epoch_ms() / 1000;
        self.shard(jti).lock().get(jti).is_some_and(|&exp| exp > now)
    }

    /// Drop entries whose expiry has passed. Returns how many were removed.
    pub fn compact(&self) -> usize {
        let now = crate::epoch_ms() / 1000;
        let mut removed = 0;
        for shard in &self.shards {
            let mut map = shard.lock();
            let before = map.len();
            map.retain(|_, &mut exp| exp > now);
            removed += before - map.len();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
