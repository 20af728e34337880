// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-user session tracking with a hard cap and oldest-first eviction.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

/// An authenticated principal's active context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
    pub session_id: String,
    pub token_id: String,
    /// Epoch seconds.
    pub issued_at: u64,
    pub expires_at: u64,
    pub fingerprint: String,
}

/// Tracks live sessions per user; creating one beyond the cap evicts the
/// oldest, which the caller reports as a `session_invalidated` event.
pub struct SessionManager {
    max_per_user: usize,
    sessions: Mutex<HashMap<String, VecDeque<Session>>>,
}

impl SessionManager {
    pub fn new(max_per_user: usize) -> Self {
        Self { max_per_user, sessions: Mutex::new(HashMap::new()) }
    }

    /// Register a session. Returns the evicted oldest session when the
    /// per-user cap was exceeded.
    pub fn register(&self, session: Session) -> Option<Session> {
        let mut sessions = self.sessions.lock();
        let user_sessions = sessions.entry(session.user_id.clone()).or_default();

        // Re-registration of the same session id replaces in place.
        user_sessions.retain(|s| s.session_id != session.session_id);
        user_sessions.push_back(session);

        if user_sessions.len() > self.max_per_user {
            user_sessions.pop_front()
        } else {
            None
        }
    }

    pub fn remove(&self, user_id: &str, session_id: &str) -> bool {
        let mut sessions = self.sessions.lock();
        let Some(user_sessions) = sessions.get_mut(user_id) else {
            return false;
        };
        let before = user_sessions.len();
        user_sessions.retain(|s| s.session_id != session_id);
        let removed = user_sessions.len() != before;
        if user_sessions.is_empty() {
            sessions.remove(user_id);
        }
        removed
    }

    pub fn count(&self, user_id: &str) -> usize {
        self.sessions.lock().get(user_id).map_or(0, |s| s.len())
    }

    /// Detect a fingerprint change for an existing session id, for anomaly
    /// reporting.
    pub fn fingerprint_changed(&self, user_id: &str, session_id: &str, fingerprint: &str) -> bool {
        let sessions = self.sessions.lock();
        sessions
            .get(user_id)
            .and_then(|u| u.iter().find(|s| s.session_id == session_id))
            .is_some_and(|s| s.fingerprint != fingerprint)
    }
}

/// Session fingerprint over the client address and user agent.
pub fn fingerprint(ip: &str, user_agent: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(ip.as_bytes());
    hasher.update([0u8]);
    hasher.update(user_agent.as_bytes());
    let digest = hasher.finalize();
    digest.iter().take(16).map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
