//! Component H — Local Index (`spec.md` §4.H).
//!
//! Backed by the `records`/`by_time`/`meta`/`known_dids`/`backfilled`
//! buckets in the index database. The firehose consumer (component G) is
//! the sole writer; everything here that mutates state assumes single-writer
//! discipline, matching `spec.md` §5 and the teacher's own single-writer
//! jetstream-ingestor pattern in `server/src/jetstream.rs`.

use redb::ReadableTable;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::store::Kv;
use crate::store::tables::{
    BACKFILLED, BY_TIME, CURSOR_KEY, KNOWN_DIDS, META, RECORDS, split_time_index_key,
    time_index_key,
};
use crate::xrpc::PublicXrpcClient;

/// A record as stored in the `records` bucket: the decoded wire value plus
/// enough addressing metadata to rebuild a feed item without a second PDS
/// round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedRecord {
    pub uri: String,
    pub did: String,
    pub collection: String,
    pub rkey: String,
    pub raw_record: serde_json::Value,
    pub cid: String,
    pub indexed_at: chrono::DateTime<chrono::Utc>,
    pub created_at_micros: u64,
}

#[derive(Clone)]
pub struct LocalIndex {
    kv: Kv,
}

impl LocalIndex {
    pub fn new(kv: Kv) -> Self {
        Self { kv }
    }

    /// Transactional insert/update: writes `records[uri]` and the matching
    /// `by_time` entry in one write transaction, per `spec.md` §5 ("no
    /// external calls occur inside a transaction").
    pub fn put(&self, record: &IndexedRecord) -> Result<()> {
        let db = self.kv.database();
        let txn = db.begin_write().map_err(|e| Error::Internal(e.to_string()))?;
        {
            let mut records = txn
                .open_table(RECORDS)
                .map_err(|e| Error::Internal(e.to_string()))?;
            let json = serde_json::to_string(record)?;
            records
                .insert(record.uri.as_str(), json.as_str())
                .map_err(|e| Error::Internal(e.to_string()))?;

            let mut by_time = txn
                .open_table(BY_TIME)
                .map_err(|e| Error::Internal(e.to_string()))?;
            let key = time_index_key(record.created_at_micros, &record.uri);
            by_time
                .insert(key.as_slice(), record.uri.as_str())
                .map_err(|e| Error::Internal(e.to_string()))?;
        }
        txn.commit().map_err(|e| Error::Internal(e.to_string()))?;
        Ok(())
    }

    /// `update` events per `spec.md` §9 overwrite the record entry but leave
    /// the original `by_time` key untouched (no rewrite of `createdAt`).
    /// Implemented by looking up the existing entry's timestamp and using it
    /// instead of whatever's on the incoming record.
    pub fn update_preserving_time(&self, mut record: IndexedRecord) -> Result<()> {
        if let Some(existing) = self.get(&record.uri)? {
            record.created_at_micros = existing.created_at_micros;
        }
        self.put(&record)
    }

    /// Removes both the `records` and `by_time` entries for a URI. The
    /// time-index key is recomputed from the stored record rather than kept
    /// redundantly, per `spec.md` §4.H.
    pub fn delete(&self, uri: &str) -> Result<()> {
        let db = self.kv.database();
        let txn = db.begin_write().map_err(|e| Error::Internal(e.to_string()))?;
        {
            let mut records = txn
                .open_table(RECORDS)
                .map_err(|e| Error::Internal(e.to_string()))?;
            let existing = records
                .remove(uri)
                .map_err(|e| Error::Internal(e.to_string()))?;

            if let Some(guard) = existing {
                let record: IndexedRecord = serde_json::from_str(guard.value())?;
                let mut by_time = txn
                    .open_table(BY_TIME)
                    .map_err(|e| Error::Internal(e.to_string()))?;
                let key = time_index_key(record.created_at_micros, uri);
                by_time
                    .remove(key.as_slice())
                    .map_err(|e| Error::Internal(e.to_string()))?;
            }
        }
        txn.commit().map_err(|e| Error::Internal(e.to_string()))?;
        Ok(())
    }

    pub fn get(&self, uri: &str) -> Result<Option<IndexedRecord>> {
        self.kv.get_json(RECORDS, uri)
    }

    /// `getRecentFeed(limit)` — scans `by_time` from its first key (smallest
    /// inverted timestamp = newest `createdAt`) and resolves each URI,
    /// stopping at `limit`.
    pub fn get_recent_feed(&self, limit: usize) -> Result<Vec<IndexedRecord>> {
        let db = self.kv.database();
        let txn = db.begin_read().map_err(|e| Error::Internal(e.to_string()))?;
        let by_time = match txn.open_table(BY_TIME) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(Error::Internal(e.to_string())),
        };
        let records = match txn.open_table(RECORDS) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(Error::Internal(e.to_string())),
        };

        let mut out = Vec::with_capacity(limit);
        for entry in by_time.iter().map_err(|e| Error::Internal(e.to_string()))? {
            if out.len() >= limit {
                break;
            }
            let (key, uri_value) = entry.map_err(|e| Error::Internal(e.to_string()))?;
            let uri = uri_value.value();
            debug_assert!(split_time_index_key(key.value()).is_some());
            if let Some(guard) = records
                .get(uri)
                .map_err(|e| Error::Internal(e.to_string()))?
            {
                let record: IndexedRecord = serde_json::from_str(guard.value())?;
                out.push(record);
            }
        }
        Ok(out)
    }

    pub fn record_count(&self) -> Result<u64> {
        let db = self.kv.database();
        let txn = db.begin_read().map_err(|e| Error::Internal(e.to_string()))?;
        match txn.open_table(RECORDS) {
            Ok(t) => t.len().map_err(|e| Error::Internal(e.to_string())),
            Err(redb::TableError::TableDoesNotExist(_)) => Ok(0),
            Err(e) => Err(Error::Internal(e.to_string())),
        }
    }

    pub fn load_cursor(&self) -> Result<Option<u64>> {
        let value: Option<String> = self.kv.get_json(META, CURSOR_KEY)?;
        Ok(value.and_then(|s| s.parse().ok()))
    }

    /// Persists the cursor as a plain decimal string (not JSON-wrapped)
    /// so it round-trips through `u64::parse` directly.
    pub fn save_cursor(&self, time_us: u64) -> Result<()> {
        self.kv.put_json(META, CURSOR_KEY, &time_us.to_string())
    }

    pub fn mark_known_did(&self, did: &str) -> Result<()> {
        self.kv.mark(KNOWN_DIDS, did)
    }

    pub fn is_backfilled(&self, did: &str) -> Result<bool> {
        self.kv.contains(BACKFILLED, did)
    }

    fn mark_backfilled(&self, did: &str) -> Result<()> {
        self.kv.mark(BACKFILLED, did)
    }

    /// `backfillDID(did)` — idempotent one-shot historical pull, per
    /// `spec.md` §4.H. Runs over the unauthenticated XRPC client since the
    /// AppView has no session for arbitrary DIDs discovered on the firehose.
    pub async fn backfill_did(
        &self,
        did: &str,
        pds_url: &str,
        xrpc: &PublicXrpcClient,
        collections: &[&str],
    ) -> Result<()> {
        if self.is_backfilled(did)? {
            return Ok(());
        }

        for &collection in collections {
            let mut cursor = None;
            loop {
                let page = xrpc
                    .list_records(pds_url, did, collection, 100, cursor.as_deref())
                    .await?;
                for (uri, value) in &page.records {
                    let Some(rkey) = uri.rsplit('/').next() else {
                        continue;
                    };
                    let created_at_micros = extract_created_at_micros(value)
                        .unwrap_or_else(|| chrono::Utc::now().timestamp_micros() as u64);
                    let record = IndexedRecord {
                        uri: uri.clone(),
                        did: did.to_string(),
                        collection: collection.to_string(),
                        rkey: rkey.to_string(),
                        raw_record: value.clone(),
                        cid: String::new(),
                        indexed_at: chrono::Utc::now(),
                        created_at_micros,
                    };
                    self.put(&record)?;
                }
                cursor = page.cursor;
                if cursor.is_none() {
                    break;
                }
            }
        }

        self.mark_backfilled(did)
    }
}

fn extract_created_at_micros(value: &serde_json::Value) -> Option<u64> {
    let created_at = value.get("createdAt")?.as_str()?;
    let parsed = chrono::DateTime::parse_from_rfc3339(created_at).ok()?;
    u64::try_from(parsed.timestamp_micros()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(uri: &str, created_at_micros: u64) -> IndexedRecord {
        IndexedRecord {
            uri: uri.to_string(),
            did: "did:plc:alice".to_string(),
            collection: "social.arabica.alpha.brew".to_string(),
            rkey: uri.rsplit('/').next().unwrap().to_string(),
            raw_record: serde_json::json!({}),
            cid: "bafy".to_string(),
            indexed_at: chrono::Utc::now(),
            created_at_micros,
        }
    }

    #[test]
    fn put_then_get_round_trips() {
        let index = LocalIndex::new(Kv::open_in_memory().unwrap());
        let record = sample("at://did:plc:alice/social.arabica.alpha.brew/1", 1000);
        index.put(&record).unwrap();
        let loaded = index.get(&record.uri).unwrap().unwrap();
        assert_eq!(loaded.uri, record.uri);
    }

    #[test]
    fn recent_feed_is_newest_first() {
        let index = LocalIndex::new(Kv::open_in_memory().unwrap());
        index.put(&sample("at://did:plc:alice/x/1", 1_000)).unwrap();
        index.put(&sample("at://did:plc:alice/x/2", 2_000)).unwrap();
        index.put(&sample("at://did:plc:alice/x/3", 3_000)).unwrap();

        let feed = index.get_recent_feed(10).unwrap();
        let uris: Vec<_> = feed.iter().map(|r| r.uri.as_str()).collect();
        assert_eq!(uris, vec!["at://did:plc:alice/x/3", "at://did:plc:alice/x/2", "at://did:plc:alice/x/1"]);
    }

    #[test]
    fn delete_removes_both_entries() {
        let index = LocalIndex::new(Kv::open_in_memory().unwrap());
        let record = sample("at://did:plc:alice/x/1", 1_000);
        index.put(&record).unwrap();
        index.delete(&record.uri).unwrap();
        assert!(index.get(&record.uri).unwrap().is_none());
        assert_eq!(index.get_recent_feed(10).unwrap().len(), 0);
    }

    #[test]
    fn update_preserves_original_created_at() {
        let index = LocalIndex::new(Kv::open_in_memory().unwrap());
        let mut record = sample("at://did:plc:alice/x/1", 1_000);
        index.put(&record).unwrap();

        record.created_at_micros = 9_999;
        record.raw_record = serde_json::json!({"rating": 8});
        index.update_preserving_time(record).unwrap();

        let loaded = index.get("at://did:plc:alice/x/1").unwrap().unwrap();
        assert_eq!(loaded.created_at_micros, 1_000);
        assert_eq!(loaded.raw_record, serde_json::json!({"rating": 8}));
    }

    #[test]
    fn cursor_round_trips() {
        let index = LocalIndex::new(Kv::open_in_memory().unwrap());
        assert!(index.load_cursor().unwrap().is_none());
        index.save_cursor(42).unwrap();
        assert_eq!(index.load_cursor().unwrap(), Some(42));
    }
}
