// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Session Registry.
//!
//! Holds per-session HMAC keys that make tokenization deterministic within a
//! session and independent across sessions. Bounded by `MAX_SESSIONS`
//! (default 1000) with oldest-by-`created_at` eviction on capacity pressure,
//! and a 24-hour TTL with lazy removal on access.

use crate::locks::{resilient_read, resilient_write};
use chrono::{DateTime, Utc};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::RwLock;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Default maximum number of live sessions before oldest-by-`created_at` eviction.
pub const MAX_SESSIONS: usize = 1000;

/// Session time-to-live: 24 hours.
pub const SESSION_TTL_SECS: i64 = 24 * 60 * 60;

/// Session lifecycle events, logged via `tracing` at creation/eviction/expiry.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Created { session_id: String, created_at: DateTime<Utc> },
    EvictedForCapacity { session_id: String },
    ExpiredOnAccess { session_id: String },
    Cleared { session_id: String },
    AllCleared { count: usize },
}

impl SessionEvent {
    pub fn to_audit_string(&self) -> String {
        let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
        match self {
            Self::Created { session_id, .. } => {
                format!("{timestamp} | SESSION_CREATED | session={session_id}")
            }
            Self::EvictedForCapacity { session_id } => {
                format!("{timestamp} | SESSION_EVICTED_CAPACITY | session={session_id}")
            }
            Self::ExpiredOnAccess { session_id } => {
                format!("{timestamp} | SESSION_EXPIRED | session={session_id}")
            }
            Self::Cleared { session_id } => {
                format!("{timestamp} | SESSION_CLEARED | session={session_id}")
            }
            Self::AllCleared { count } => {
                format!("{timestamp} | SESSION_ALL_CLEARED | count={count}")
            }
        }
    }
}

/// A session-scoped HMAC key. Zeroized on drop so the key never lingers in
/// freed memory after the session is removed from the registry.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; 32]);

impl SessionKey {
    fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// A bounded-lifetime scope holding the HMAC key that makes tokenization
/// deterministic (spec data model: `{ id, key, created_at, expires_at }`).
#[derive(Clone, Debug)]
pub struct Session {
    pub id: String,
    key: SessionKey,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    fn new(id: String) -> Self {
        let created_at = Utc::now();
        Self {
            id,
            key: SessionKey::generate(),
            created_at,
            expires_at: created_at + chrono::Duration::seconds(SESSION_TTL_SECS),
        }
    }

    pub fn key(&self) -> &[u8; 32] {
        self.key.as_bytes()
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

fn generate_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Holds all live sessions. Single in-process map, mutated only on
/// `generate_session`, `clear_session`, `clear_all_sessions`, or eviction —
/// per spec §5, concurrent readers of the same session observe the same key.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Session>>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::with_capacity(MAX_SESSIONS)
    }

    pub fn with_capacity(max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
        }
    }

    /// Allocate a new session, evicting the oldest-by-`created_at` session
    /// first if the registry is at capacity.
    pub fn generate_session(&self) -> Session {
        let mut sessions = resilient_write(&self.sessions);

        if sessions.len() >= self.max_sessions {
            if let Some(oldest_id) = sessions
                .values()
                .min_by_key(|s| s.created_at)
                .map(|s| s.id.clone())
            {
                sessions.remove(&oldest_id);
                tracing::info!(
                    "{}",
                    SessionEvent::EvictedForCapacity { session_id: oldest_id }.to_audit_string()
                );
            }
        }

        let session = Session::new(generate_session_id());
        tracing::info!(
            "{}",
            SessionEvent::Created { session_id: session.id.clone(), created_at: session.created_at }
                .to_audit_string()
        );
        sessions.insert(session.id.clone(), session.clone());
        session
    }

    /// Fetch a live session by id. Expired sessions are removed lazily here
    /// and treated as absent.
    pub fn get(&self, session_id: &str) -> Option<Session> {
        {
            let sessions = resilient_read(&self.sessions);
            match sessions.get(session_id) {
                Some(session) if !session.is_expired() => return Some(session.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        let mut sessions = resilient_write(&self.sessions);
        if let Some(session) = sessions.get(session_id) {
            if session.is_expired() {
                sessions.remove(session_id);
                tracing::info!(
                    "{}",
                    SessionEvent::ExpiredOnAccess { session_id: session_id.to_string() }.to_audit_string()
                );
            }
        }
        None
    }

    /// Zeroize and drop a single session's key and entry.
    pub fn clear_session(&self, session_id: &str) {
        let mut sessions = resilient_write(&self.sessions);
        if sessions.remove(session_id).is_some() {
            tracing::info!(
                "{}",
                SessionEvent::Cleared { session_id: session_id.to_string() }.to_audit_string()
            );
        }
    }

    /// Zeroize and drop every session.
    pub fn clear_all_sessions(&self) {
        let mut sessions = resilient_write(&self.sessions);
        let count = sessions.len();
        sessions.clear();
        tracing::info!("{}", SessionEvent::AllCleared { count }.to_audit_string());
    }

    pub fn active_session_count(&self) -> usize {
        let sessions = resilient_read(&self.sessions);
        sessions.values().filter(|s| !s.is_expired()).count()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_session_produces_hex_id_and_fresh_key() {
        let registry = SessionRegistry::new();
        let session = registry.generate_session();
        assert_eq!(session.id.len(), 32);
        assert!(session.id.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(!session.is_expired());
    }

    #[test]
    fn distinct_sessions_have_independent_keys() {
        let registry = SessionRegistry::new();
        let a = registry.generate_session();
        let b = registry.generate_session();
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn get_returns_live_session() {
        let registry = SessionRegistry::new();
        let session = registry.generate_session();
        let fetched = registry.get(&session.id).expect("session present");
        assert_eq!(fetched.id, session.id);
        assert_eq!(fetched.key(), session.key());
    }

    #[test]
    fn capacity_pressure_evicts_oldest_created_at() {
        let registry = SessionRegistry::with_capacity(2);
        let first = registry.generate_session();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let _second = registry.generate_session();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let _third = registry.generate_session();

        assert_eq!(registry.active_session_count(), 2);
        assert!(registry.get(&first.id).is_none());
    }

    #[test]
    fn clear_session_removes_entry() {
        let registry = SessionRegistry::new();
        let session = registry.generate_session();
        registry.clear_session(&session.id);
        assert!(registry.get(&session.id).is_none());
    }

    #[test]
    fn clear_all_sessions_empties_registry() {
        let registry = SessionRegistry::new();
        registry.generate_session();
        registry.generate_session();
        registry.clear_all_sessions();
        assert_eq!(registry.active_session_count(), 0);
    }

    #[test]
    fn ttl_is_24_hours() {
        assert_eq!(SESSION_TTL_SECS, 86_400);
    }

    #[test]
    fn max_sessions_default_is_1000() {
        assert_eq!(MAX_SESSIONS, 1000);
    }
}
