//! Table (bucket) definitions for the two `redb` databases Arabica keeps on
//! disk, per the persistence layout in `spec.md` §6.
//!
//! Two physical files, five logical buckets between them:
//! - `ARABICA_DB_PATH` (the "sessions" database): [`OAUTH_SESSIONS`],
//!   [`OAUTH_AUTH_REQUESTS`], [`FEED_REGISTRY`].
//! - `ARABICA_FEED_INDEX_PATH` (the "index" database): [`RECORDS`],
//!   [`BY_TIME`], [`META`], [`KNOWN_DIDS`], [`BACKFILLED`].
//!
//! Splitting across two files (rather than one database with eight tables)
//! matches the teacher's own DB split in spirit (a dedicated jetstream pool
//! vs. the app pool) and keeps the firehose consumer's single-writer
//! database physically separate from the OAuth session database, which is
//! written by every authenticated request.

use redb::TableDefinition;

// -- sessions database --

/// Key `"{did}:{sessionID}"`, value JSON-encoded `OAuthSession`.
pub const OAUTH_SESSIONS: TableDefinition<&str, &str> = TableDefinition::new("oauth_sessions");

/// Key `state`, value JSON-encoded `AuthRequestState`.
pub const OAUTH_AUTH_REQUESTS: TableDefinition<&str, &str> =
    TableDefinition::new("oauth_auth_requests");

/// Key DID, value JSON `{registeredAt}`.
pub const FEED_REGISTRY: TableDefinition<&str, &str> = TableDefinition::new("feed_registry");

// -- index database --

/// Key AT-URI, value JSON-encoded `IndexedRecord`.
pub const RECORDS: TableDefinition<&str, &str> = TableDefinition::new("records");

/// Key `big_endian(!created_at_micros) || uri_bytes`, value the URI string.
/// Ascending key order over this table is descending `createdAt` order.
pub const BY_TIME: TableDefinition<&[u8], &str> = TableDefinition::new("by_time");

/// Single-row meta bucket. Currently holds only the `"cursor"` key.
pub const META: TableDefinition<&str, &str> = TableDefinition::new("meta");

/// Key DID, value unused (presence is the signal) — the set of DIDs ever
/// authenticated, driving backfill targets.
pub const KNOWN_DIDS: TableDefinition<&str, &str> = TableDefinition::new("known_dids");

/// Key DID, value unused — the set of DIDs whose historical records have
/// already been pulled.
pub const BACKFILLED: TableDefinition<&str, &str> = TableDefinition::new("backfilled");

pub const CURSOR_KEY: &str = "cursor";

/// Builds the `by_time` composite key: inverted microsecond timestamp
/// (so ascending byte order is descending time order) followed by the
/// raw URI bytes, so a prefix scan or a deletion-by-record lookup can
/// locate the exact entry.
pub fn time_index_key(created_at_micros: u64, uri: &str) -> Vec<u8> {
    let inverted = !created_at_micros;
    let mut key = Vec::with_capacity(8 + uri.len());
    key.extend_from_slice(&inverted.to_be_bytes());
    key.extend_from_slice(uri.as_bytes());
    key
}

/// Splits a `by_time` key back into its timestamp and URI parts. Used by
/// property tests and by the delete path, which needs to recompute the key
/// from `IndexedRecord.created_at` rather than store it redundantly.
pub fn split_time_index_key(key: &[u8]) -> Option<(u64, &str)> {
    if key.len() < 8 {
        return None;
    }
    let (ts_bytes, uri_bytes) = key.split_at(8);
    let inverted = u64::from_be_bytes(ts_bytes.try_into().ok()?);
    let uri = std::str::from_utf8(uri_bytes).ok()?;
    Some((!inverted, uri))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inverted_timestamp_orders_descending() {
        let k1 = time_index_key(1_000, "at://did:plc:a/social.arabica.alpha.brew/1");
        let k2 = time_index_key(2_000, "at://did:plc:a/social.arabica.alpha.brew/2");
        // t1 < t2 implies key(t1) > key(t2) lexicographically.
        assert!(k1 > k2);
    }

    #[test]
    fn time_index_key_round_trips() {
        let uri = "at://did:plc:a/social.arabica.alpha.brew/3";
        let key = time_index_key(42, uri);
        let (ts, parsed_uri) = split_time_index_key(&key).unwrap();
        assert_eq!(ts, 42);
        assert_eq!(parsed_uri, uri);
    }
}
