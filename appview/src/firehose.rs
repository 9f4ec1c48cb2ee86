//! Component G — Firehose Consumer (`spec.md` §4.G).
//!
//! Grounded directly on `server/src/jetstream.rs`'s `rocketman` usage: one
//! [`LexiconIngestor`] registered per collection NSID in `Ingestors.commits`,
//! generalized from the teacher's `vg.nat.istat.*`/`app.bsky.actor.profile`
//! set to this application's five `social.arabica.alpha.*` collections, all
//! closing over one shared [`LocalIndex`] instead of one ingestor per
//! sqlite table.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lexicons::nsid;
use rocketman::connection::JetstreamConnection;
use rocketman::handler::{self, Ingestors};
use rocketman::ingestion::LexiconIngestor;
use rocketman::options::JetstreamOptions;
use rocketman::types::event::{Event, Operation};
use serde_json::Value;

use crate::index::{IndexedRecord, LocalIndex};

/// Shared readiness flag, per `spec.md` §4.G point 7: true once the first
/// event (or a confirmed empty backlog) has been processed.
#[derive(Clone, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn mark_ready(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

struct CollectionIngestor {
    index: Arc<LocalIndex>,
    collection: &'static str,
    readiness: Readiness,
}

impl CollectionIngestor {
    fn at_uri(&self, did: &str, rkey: &str) -> String {
        format!("at://{did}/{}/{rkey}", self.collection)
    }
}

#[async_trait]
impl LexiconIngestor for CollectionIngestor {
    async fn ingest(&self, event: Event<Value>) -> anyhow::Result<()> {
        self.readiness.mark_ready();

        let Some(commit) = event.commit else {
            return Ok(());
        };

        let uri = self.at_uri(&event.did, &commit.rkey);

        match commit.operation {
            Operation::Delete => {
                self.index.delete(&uri)?;
            }
            Operation::Create | Operation::Update => {
                let Some(raw_record) = commit.record else {
                    return Ok(());
                };

                let created_at_micros = match extract_created_at_micros(&raw_record) {
                    Some(micros) => micros,
                    None => {
                        tracing::warn!(uri, "skipping malformed record: missing/invalid createdAt");
                        return Ok(());
                    }
                };

                self.index.mark_known_did(&event.did)?;

                let record = IndexedRecord {
                    uri: uri.clone(),
                    did: event.did.clone(),
                    collection: self.collection.to_string(),
                    rkey: commit.rkey.clone(),
                    raw_record,
                    cid: commit.cid.clone().unwrap_or_default(),
                    indexed_at: chrono::Utc::now(),
                    created_at_micros,
                };

                match commit.operation {
                    Operation::Update => self.index.update_preserving_time(record)?,
                    _ => self.index.put(&record)?,
                }
            }
        }

        Ok(())
    }
}

fn extract_created_at_micros(value: &Value) -> Option<u64> {
    let created_at = value.get("createdAt")?.as_str()?;
    let parsed = chrono::DateTime::parse_from_rfc3339(created_at).ok()?;
    u64::try_from(parsed.timestamp_micros()).ok()
}

/// Connects to the Jetstream endpoint and runs forever, indexing commits for
/// this application's collections. Intended to be the body of a long-lived
/// `tokio::spawn`'d task in `main.rs`; `rocketman` owns the handshake-failure
/// and connection-loss reconnect/backoff internally (`spec.md` §4.G points
/// 1 and 6). The application-level stall watchdog below — no events within
/// `stall_timeout` — is this crate's own addition, since rocketman has no
/// opinion on an upstream that stays connected but goes quiet.
pub async fn run(
    jetstream_url: String,
    index: Arc<LocalIndex>,
    readiness: Readiness,
    stall_timeout: Duration,
) -> anyhow::Result<()> {
    let opts = JetstreamOptions::builder()
        .ws_url(jetstream_url)
        .wanted_collections(nsid::ALL.iter().map(|s| s.to_string()).collect())
        .bound(8 * 8 * 8 * 8 * 8 * 8)
        .build();

    let jetstream = JetstreamConnection::new(opts);

    let mut ingestors: Ingestors = Ingestors::new();
    for &collection in nsid::ALL {
        ingestors.commits.insert(
            collection.to_string(),
            Box::new(CollectionIngestor {
                index: index.clone(),
                collection,
                readiness: readiness.clone(),
            }),
        );
    }

    let cursor: Arc<Mutex<Option<u64>>> = Arc::new(Mutex::new(index.load_cursor()?));

    let msg_rx = jetstream.get_msg_rx();
    let reconnect_tx = jetstream.get_reconnect_tx();

    let c_cursor = cursor.clone();
    let c_index = index.clone();
    tokio::spawn(async move {
        let mut since_flush = 0u32;
        loop {
            let message = match tokio::time::timeout(stall_timeout, msg_rx.recv_async()).await {
                Ok(Ok(message)) => message,
                Ok(Err(_)) => break, // channel closed, connection task is gone
                Err(_) => {
                    // No events within `stall_timeout` (`spec.md` §4.G point 6):
                    // force a close + reconnect through the same channel
                    // `handle_message` itself uses to request one.
                    tracing::warn!(
                        stall_timeout_secs = stall_timeout.as_secs(),
                        "firehose connection stalled, requesting reconnect"
                    );
                    let _ = reconnect_tx.send(());
                    continue;
                }
            };

            if let Err(e) =
                handler::handle_message(message, &ingestors, reconnect_tx.clone(), c_cursor.clone())
                    .await
            {
                tracing::warn!(error = %e, "error processing firehose message");
                continue;
            }

            // Persist the in-memory cursor every 50 events rather than per
            // event, per `spec.md` §4.G point 5 ("at most every N events").
            since_flush += 1;
            if since_flush >= 50 {
                since_flush = 0;
                if let Some(cursor_value) = *c_cursor.lock().unwrap() {
                    if let Err(e) = c_index.save_cursor(cursor_value) {
                        tracing::warn!(error = %e, "failed to persist firehose cursor");
                    }
                }
            }
        }
    });

    jetstream.connect(cursor).await
}
