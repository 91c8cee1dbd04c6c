//! In-process session cache
//!
//! The durable `sessions` table is the source of truth; the cache only
//! avoids a lookup for hot sessions and is repaired on every miss.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

/// Cached view of a live session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedSession {
    pub session_id: String,
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

pub trait SessionCache: Send + Sync {
    fn get(&self, session_id: &str) -> Option<CachedSession>;

    fn put(&self, entry: CachedSession);

    fn remove(&self, session_id: &str) -> Option<CachedSession>;

    /// Drop every entry of `user_id`, returning the removed session ids
    fn remove_user(&self, user_id: Uuid) -> Vec<String>;

    /// Drop entries whose expiry is at or before `now`
    fn purge_expired(&self, now: DateTime<Utc>) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `DashMap`-backed cache
#[derive(Debug, Default)]
pub struct InMemorySessionCache {
    entries: DashMap<String, CachedSession>,
}

impl InMemorySessionCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionCache for InMemorySessionCache {
    fn get(&self, session_id: &str) -> Option<CachedSession> {
        self.entries.get(session_id).map(|e| e.value().clone())
    }

    fn put(&self, entry: CachedSession) {
        self.entries.insert(entry.session_id.clone(), entry);
    }

    fn remove(&self, session_id: &str) -> Option<CachedSession> {
        self.entries.remove(session_id).map(|(_, v)| v)
    }

    fn remove_user(&self, user_id: Uuid) -> Vec<String> {
        let ids: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().user_id == user_id)
            .map(|e| e.key().clone())
            .collect();

        for id in &ids {
            self.entries.remove(id);
        }
        ids
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, v| v.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}
