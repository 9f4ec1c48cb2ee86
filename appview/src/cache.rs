//! Component F — Session Read-Through Cache (`spec.md` §4.F).
//!
//! Purely advisory: a strictly-invalidating (never merging) in-memory TTL
//! cache in front of the authenticated XRPC client, keyed per session. The
//! shared-map-behind-a-read-write-lock shape mirrors the session cache in
//! `server/src/oauth.rs`'s `SharedAuthStore`, generalized from "one session
//! blob" to "per-collection lists plus per-URI singletons."

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::RwLock;

const TTL: Duration = Duration::from_secs(5 * 60);
const REAP_INTERVAL: Duration = Duration::from_secs(10 * 60);

struct Entry<T> {
    value: T,
    inserted_at: Instant,
}

impl<T> Entry<T> {
    fn fresh(value: T) -> Self {
        Self {
            value,
            inserted_at: Instant::now(),
        }
    }

    fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() > TTL
    }
}

#[derive(Default)]
struct SessionBucket {
    lists: HashMap<String, Entry<Vec<(String, Value)>>>,
    singletons: HashMap<String, Entry<(Value, String)>>,
}

/// Per-session read-through cache, shared across the request handlers that
/// serve one session's `listX`/`getX` calls.
#[derive(Clone, Default)]
pub struct SessionCache {
    sessions: Arc<RwLock<HashMap<String, SessionBucket>>>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_list(&self, session_key: &str, collection: &str) -> Option<Vec<(String, Value)>> {
        let sessions = self.sessions.read().await;
        let bucket = sessions.get(session_key)?;
        let entry = bucket.lists.get(collection)?;
        if entry.is_expired() {
            return None;
        }
        Some(entry.value.clone())
    }

    pub async fn put_list(&self, session_key: &str, collection: &str, records: Vec<(String, Value)>) {
        let mut sessions = self.sessions.write().await;
        let bucket = sessions.entry(session_key.to_string()).or_default();
        bucket
            .lists
            .insert(collection.to_string(), Entry::fresh(records));
    }

    pub async fn get_record(&self, session_key: &str, uri: &str) -> Option<(Value, String)> {
        let sessions = self.sessions.read().await;
        let bucket = sessions.get(session_key)?;
        let entry = bucket.singletons.get(uri)?;
        if entry.is_expired() {
            return None;
        }
        Some(entry.value.clone())
    }

    pub async fn put_record(&self, session_key: &str, uri: &str, record: Value, cid: String) {
        let mut sessions = self.sessions.write().await;
        let bucket = sessions.entry(session_key.to_string()).or_default();
        bucket
            .singletons
            .insert(uri.to_string(), Entry::fresh((record, cid)));
    }

    /// Write-through invalidation: removes the owning collection list and
    /// the URI entry, so the next read falls through to the PDS.
    pub async fn invalidate(&self, session_key: &str, collection: &str, uri: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(bucket) = sessions.get_mut(session_key) {
            bucket.lists.remove(collection);
            bucket.singletons.remove(uri);
        }
    }

    /// Background reaper, spawned once in `main.rs`, sweeping expired
    /// entries every 10 minutes so sessions that never return don't leak.
    pub async fn run_reaper(self) {
        let mut ticker = tokio::time::interval(REAP_INTERVAL);
        loop {
            ticker.tick().await;
            self.reap_once().await;
        }
    }

    async fn reap_once(&self) {
        let mut sessions = self.sessions.write().await;
        sessions.retain(|_, bucket| {
            bucket.lists.retain(|_, e| !e.is_expired());
            bucket.singletons.retain(|_, e| !e.is_expired());
            !bucket.lists.is_empty() || !bucket.singletons.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_invalidation_clears_list_and_singleton() {
        let cache = SessionCache::new();
        cache
            .put_list("did:1", "social.arabica.alpha.brew", vec![("at://a/b/1".into(), Value::Null)])
            .await;
        cache
            .put_record("did:1", "at://a/b/1", Value::Null, "cid1".into())
            .await;

        assert!(cache.get_list("did:1", "social.arabica.alpha.brew").await.is_some());
        assert!(cache.get_record("did:1", "at://a/b/1").await.is_some());

        cache.invalidate("did:1", "social.arabica.alpha.brew", "at://a/b/1").await;

        assert!(cache.get_list("did:1", "social.arabica.alpha.brew").await.is_none());
        assert!(cache.get_record("did:1", "at://a/b/1").await.is_none());
    }

    #[tokio::test]
    async fn reaper_drops_only_expired_entries() {
        let cache = SessionCache::new();
        cache.put_list("did:1", "coll", vec![]).await;
        {
            let mut sessions = cache.sessions.write().await;
            sessions
                .get_mut("did:1")
                .unwrap()
                .lists
                .get_mut("coll")
                .unwrap()
                .inserted_at = Instant::now() - Duration::from_secs(3600);
        }
        cache.reap_once().await;
        assert!(cache.get_list("did:1", "coll").await.is_none());
    }
}
