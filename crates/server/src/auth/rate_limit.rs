// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Sliding-window rate limiter, sharded by subject hash.
//!
//! Heartbeats and pongs never reach this limiter; the transport layer
//! filters them out before counting.

use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};

use parking_lot::Mutex;

const SHARDS: usize = 16;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// Blocked until the embedded epoch-millis instant.
    Blocked { until: u64 },
}

#[derive(Debug, Default)]
struct SubjectWindow {
    /// Request timestamps inside the window, oldest first.
    hits: VecDeque<u64>,
    blocked_until: Option<u64>,
}

pub struct RateLimiter {
    shards: Vec<Mutex<HashMap<String, SubjectWindow>>>,
    max_requests: usize,
    window_ms: u64,
    block_ms: u64,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window_ms: u64, block_ms: u64) -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            max_requests,
            window_ms,
            block_ms,
        }
    }

    fn shard(&self, subject: &str) -> &Mutex<HashMap<String, SubjectWindow>> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        subject.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARDS]
    }

    /// Count one request for `subject` and decide whether it may proceed.
    pub fn check(&self, subject: &str) -> RateDecision {
        self.check_at(subject, crate::epoch_ms())
    }

    /// Clock-injected variant for tests.
    pub fn check_at(&self, subject: &str, now: u64) -> RateDecision {
        let mut shard = self.shard(subject).lock();
        let window = shard.entry(subject.to_owned()).or_default();

        if let Some(until) = window.blocked_until {
            if now < until {
                return RateDecision::Blocked { until };
            }
            window.blocked_until = None;
            window.hits.clear();
        }

        let cutoff = now.saturating_sub(self.window_ms);
        while window.hits.front().is_some_and(|&t| t < cutoff) {
            window.hits.pop_front();
        }

        if window.hits.len() >= self.max_requests {
            let until = now + self.block_ms;
            window.blocked_until = Some(until);
            return RateDecision::Blocked { until };
        }

        window.hits.push_back(now);
        RateDecision::Allowed
    }

    /// Drop windows with no recent hits and no active block.
    pub fn compact(&self) -> usize {
        let now = crate::epoch_ms();
        let cutoff = now.saturating_sub(self.window_ms);
        let mut removed = 0;
        for shard in &self.shards {
            let mut map = shard.lock();
            let before = map.len();
            map.retain(|_, w| {
                w.blocked_until.is_some_and(|until| until > now)
                    || w.hits.back().is_some_and(|&t| t >= cutoff)
            });
            removed += before - map.len();
        }
        removed
    }
}

#[cfg(test)]
#[path = "rate_limit_tests.rs"]
mod tests;
