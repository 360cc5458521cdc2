//! Session Context Store
//!
//! Ephemeral, TTL-bound key/value state scoped by session id. Holds the
//! working variables of an in-flight workflow execution: accumulated step
//! outputs (`<key>`, `<key>_result`) and OTP sub-state (`otp_<step_id>`).
//!
//! Expiry is a correctness boundary, not a cache miss: an execution whose
//! context has expired must be treated as abandoned by callers, never
//! resumed with empty state. The store is a capability (`get/set/expire`)
//! rather than a process-local map so that a shared backend (e.g. Redis)
//! can replace [`MemorySessionStore`] in multi-instance deployments.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::error::EngineError;

/// JSON object held per session.
pub type ContextMap = serde_json::Map<String, Value>;

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Fetch the context, or `None` when absent or expired.
    async fn get(&self, session_id: &str) -> Result<Option<ContextMap>, EngineError>;

    /// Create or replace the context with a fresh TTL.
    async fn set(
        &self,
        session_id: &str,
        value: ContextMap,
        ttl: Duration,
    ) -> Result<(), EngineError>;

    /// Merge `partial` into the context. A `null` value deletes its key.
    /// Returns `false` when the session is absent or expired.
    async fn update(&self, session_id: &str, partial: ContextMap) -> Result<bool, EngineError>;

    /// Drop the context. Idempotent: clearing a missing session is not an error.
    async fn clear(&self, session_id: &str) -> Result<(), EngineError>;

    /// Push the expiry out to `now + ttl`. Returns `false` when the session
    /// is absent or already expired.
    async fn extend(&self, session_id: &str, ttl: Duration) -> Result<bool, EngineError>;
}

struct SessionEntry {
    value: ContextMap,
    deadline: Instant,
}

/// In-process session store backed by a concurrent map.
///
/// Expired entries are reaped lazily on access.
pub struct MemorySessionStore {
    entries: DashMap<String, SessionEntry>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, session_id: &str) -> Result<Option<ContextMap>, EngineError> {
        let expired = match self.entries.get(session_id) {
            Some(entry) => {
                if entry.deadline > Instant::now() {
                    return Ok(Some(entry.value.clone()));
                }
                true
            }
            None => false,
        };

        if expired {
            self.entries.remove(session_id);
        }
        Ok(None)
    }

    async fn set(
        &self,
        session_id: &str,
        value: ContextMap,
        ttl: Duration,
    ) -> Result<(), EngineError> {
        self.entries.insert(
            session_id.to_string(),
            SessionEntry {
                value,
                deadline: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn update(&self, session_id: &str, partial: ContextMap) -> Result<bool, EngineError> {
        match self.entries.get_mut(session_id) {
            Some(mut entry) => {
                if entry.deadline <= Instant::now() {
                    drop(entry);
                    self.entries.remove(session_id);
                    return Ok(false);
                }
                for (key, value) in partial {
                    if value.is_null() {
                        entry.value.remove(&key);
                    } else {
                        entry.value.insert(key, value);
                    }
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn clear(&self, session_id: &str) -> Result<(), EngineError> {
        self.entries.remove(session_id);
        Ok(())
    }

    async fn extend(&self, session_id: &str, ttl: Duration) -> Result<bool, EngineError> {
        match self.entries.get_mut(session_id) {
            Some(mut entry) => {
                if entry.deadline <= Instant::now() {
                    drop(entry);
                    self.entries.remove(session_id);
                    return Ok(false);
                }
                entry.deadline = Instant::now() + ttl;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
