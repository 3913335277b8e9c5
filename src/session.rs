//! # Session Store (external collaborator)
//!
//! The spec scopes the session store's *implementation* out of the core
//! ("external collaborators, spec only their interface", §1) — it's backed
//! by an external key-value service in production. This module spec's
//! only the interface a route handler needs, plus an in-memory
//! implementation for tests and local development.

use async_trait::async_trait;
use dashmap::DashMap;

/// Opaque-bytes session storage keyed by an opaque string id. A route
/// handler never needs to know whether the backing store is in-memory,
/// Redis, or anything else — only this contract.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<Vec<u8>>;
    async fn set(&self, key: &str, value: Vec<u8>);
    async fn delete(&self, key: &str);
}

/// In-memory session store. Not durable across restarts — suitable for
/// tests and single-process deployments, not for the external KV service
/// the spec assumes in production.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    entries: DashMap<String, Vec<u8>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    async fn set(&self, key: &str, value: Vec<u8>) {
        self.entries.insert(key.to_string(), value);
    }

    async fn delete(&self, key: &str) {
        self.entries.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_value() {
        let store = InMemorySessionStore::new();
        store.set("sid-1", b"payload".to_vec()).await;
        assert_eq!(store.get("sid-1").await, Some(b"payload".to_vec()));

        store.delete("sid-1").await;
        assert_eq!(store.get("sid-1").await, None);
    }
}
