//! Component I — Feed Aggregator (`spec.md` §4.I).
//!
//! Combines the firehose-derived [`LocalIndex`] with per-author profile
//! hydration over the unauthenticated XRPC path, the same direct-reqwest
//! profile-lookup shape as `server/src/jetstream.rs::hydrate_profile`
//! (PLC directory for the handle, `app.bsky.actor.profile` self-record for
//! display metadata), fanned out with a bounded worker pool. `Brew` items
//! additionally dereference their `beanRef`/`grinderRef`/`brewerRef` fields
//! the same way, tolerating dangling references per `spec.md` §3.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::identity::IdentityClient;
use crate::index::{IndexedRecord, LocalIndex};
use crate::xrpc::PublicXrpcClient;

const HYDRATION_CONCURRENCY: usize = 16;
const HYDRATION_TIMEOUT: Duration = Duration::from_secs(2);
const PUBLIC_FEED_LIMIT: usize = 50;
const AUTHENTICATED_FEED_LIMIT: usize = 100;

/// Consumed, not implemented here — moderation's own schema is out of scope
/// (`spec.md` §1, §6). Anything failing either check is dropped post-fetch,
/// including at cache-read time so a freshly-hidden record doesn't resurface.
#[async_trait::async_trait]
pub trait ModerationFilter: Send + Sync {
    async fn is_record_hidden(&self, uri: &str) -> bool;
    async fn is_blacklisted(&self, did: &str) -> bool;
}

/// Default filter when no moderation store is wired in: nothing is hidden.
pub struct NoopModerationFilter;

#[async_trait::async_trait]
impl ModerationFilter for NoopModerationFilter {
    async fn is_record_hidden(&self, _uri: &str) -> bool {
        false
    }
    async fn is_blacklisted(&self, _did: &str) -> bool {
        false
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthorProfile {
    pub did: String,
    pub handle: Option<String>,
    pub display_name: Option<String>,
    pub avatar: Option<String>,
}

/// The result of dereferencing one of a `Brew`'s `*Ref` fields, per
/// `spec.md` §3 ("consumers must tolerate dangling references (render
/// placeholder, never fail)") and §8 scenario 5.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum RefPreview {
    Resolved { uri: String, value: serde_json::Value },
    Dangling { uri: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedItem {
    pub uri: String,
    pub collection: String,
    pub record: serde_json::Value,
    pub created_at_micros: u64,
    pub author: AuthorProfile,
    /// Populated only for `social.arabica.alpha.brew` items.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bean: Option<RefPreview>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grinder: Option<RefPreview>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brewer: Option<RefPreview>,
}

struct CachedFeed {
    items: Vec<FeedItem>,
    fetched_at: Instant,
}

pub struct FeedAggregator {
    index: Arc<LocalIndex>,
    http: reqwest::Client,
    identity: Arc<IdentityClient>,
    public_xrpc: Arc<PublicXrpcClient>,
    moderation: Arc<dyn ModerationFilter>,
    public_cache: RwLock<Option<CachedFeed>>,
    cache_ttl: Duration,
}

impl FeedAggregator {
    pub fn new(
        index: Arc<LocalIndex>,
        http: reqwest::Client,
        identity: Arc<IdentityClient>,
        public_xrpc: Arc<PublicXrpcClient>,
        moderation: Arc<dyn ModerationFilter>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            index,
            http,
            identity,
            public_xrpc,
            moderation,
            public_cache: RwLock::new(None),
            cache_ttl,
        }
    }

    /// `getPublicFeed()` — TTL-cached, serves stale on a refresh failure
    /// rather than erroring, per `spec.md` §4.I.
    pub async fn get_public_feed(&self) -> Vec<FeedItem> {
        {
            let cache = self.public_cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.fetched_at.elapsed() < self.cache_ttl {
                    return self.refilter(cached.items.clone()).await;
                }
            }
        }

        match self.build_feed(PUBLIC_FEED_LIMIT).await {
            Ok(items) => {
                let mut cache = self.public_cache.write().await;
                // Double-check under the write lock to avoid a refresh
                // stampede (`spec.md` §5).
                if cache
                    .as_ref()
                    .map(|c| c.fetched_at.elapsed() < self.cache_ttl)
                    .unwrap_or(false)
                {
                    return self.refilter(cache.as_ref().unwrap().items.clone()).await;
                }
                *cache = Some(CachedFeed {
                    items: items.clone(),
                    fetched_at: Instant::now(),
                });
                self.refilter(items).await
            }
            Err(e) => {
                tracing::warn!(error = %e, "public feed refresh failed, serving stale cache if any");
                let cache = self.public_cache.read().await;
                match cache.as_ref() {
                    Some(cached) => self.refilter(cached.items.clone()).await,
                    None => Vec::new(),
                }
            }
        }
    }

    /// `getAuthenticatedFeed(session)` — larger, uncached slice; the caller
    /// already holds a live session so there's no stale-PDS concern to cache
    /// around.
    pub async fn get_authenticated_feed(&self) -> Vec<FeedItem> {
        self.build_feed(AUTHENTICATED_FEED_LIMIT)
            .await
            .unwrap_or_default()
    }

    async fn build_feed(&self, limit: usize) -> crate::error::Result<Vec<FeedItem>> {
        let records = self.index.get_recent_feed(limit)?;

        let mut profiles: HashMap<String, AuthorProfile> = HashMap::new();
        let dids: Vec<String> = {
            let mut seen = std::collections::HashSet::new();
            records
                .iter()
                .map(|r| r.did.clone())
                .filter(|d| seen.insert(d.clone()))
                .collect()
        };

        let hydrated = stream::iter(dids.into_iter().map(|did| {
            let http = self.http.clone();
            async move {
                let profile = tokio::time::timeout(HYDRATION_TIMEOUT, hydrate_profile(&http, &did))
                    .await
                    .ok()
                    .flatten()
                    .unwrap_or(AuthorProfile {
                        did: did.clone(),
                        handle: None,
                        display_name: None,
                        avatar: None,
                    });
                (did, profile)
            }
        }))
        .buffer_unordered(HYDRATION_CONCURRENCY)
        .collect::<Vec<_>>()
        .await;

        for (did, profile) in hydrated {
            profiles.insert(did, profile);
        }

        let mut items: Vec<FeedItem> = Vec::with_capacity(records.len());
        for record in records {
            if self.moderation.is_record_hidden(&record.uri).await
                || self.moderation.is_blacklisted(&record.did).await
            {
                continue;
            }
            let author = profiles.get(&record.did).cloned().unwrap_or(AuthorProfile {
                did: record.did.clone(),
                handle: None,
                display_name: None,
                avatar: None,
            });
            items.push(self.to_feed_item(record, author).await);
        }

        // Ordering is strictly createdAt desc, URI tiebreak (`spec.md` §4.I);
        // `get_recent_feed` already returns descending time order, so only
        // the tiebreak needs enforcing here.
        items.sort_by(|a, b| {
            b.created_at_micros
                .cmp(&a.created_at_micros)
                .then_with(|| a.uri.cmp(&b.uri))
        });

        Ok(items)
    }

    async fn refilter(&self, items: Vec<FeedItem>) -> Vec<FeedItem> {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            if self.moderation.is_record_hidden(&item.uri).await
                || self.moderation.is_blacklisted(&item.author.did).await
            {
                continue;
            }
            out.push(item);
        }
        out
    }

    /// Builds one feed item, dereferencing a `Brew`'s reference fields
    /// (`spec.md` §3, §8 scenario 5) concurrently. Any other collection
    /// carries no refs, so `bean`/`grinder`/`brewer` stay `None`.
    async fn to_feed_item(&self, record: IndexedRecord, author: AuthorProfile) -> FeedItem {
        let (bean, grinder, brewer) = if record.collection == lexicons::nsid::BREW {
            let bean_ref = record
                .raw_record
                .get("beanRef")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            let grinder_ref = record
                .raw_record
                .get("grinderRef")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            let brewer_ref = record
                .raw_record
                .get("brewerRef")
                .and_then(|v| v.as_str())
                .map(str::to_string);

            tokio::join!(
                self.resolve_optional_ref(bean_ref.as_deref()),
                self.resolve_optional_ref(grinder_ref.as_deref()),
                self.resolve_optional_ref(brewer_ref.as_deref()),
            )
        } else {
            (None, None, None)
        };

        FeedItem {
            uri: record.uri,
            collection: record.collection,
            record: record.raw_record,
            created_at_micros: record.created_at_micros,
            author,
            bean,
            grinder,
            brewer,
        }
    }

    async fn resolve_optional_ref(&self, uri: Option<&str>) -> Option<RefPreview> {
        let uri = uri?;
        Some(self.resolve_ref(uri).await)
    }

    /// Resolves one AT-URI reference via the unauthenticated XRPC path,
    /// falling back to a placeholder on any failure — a missing target, an
    /// unresolvable DID, or a slow PDS never turns into an error for the
    /// caller, per `spec.md` §3's dangling-reference contract.
    async fn resolve_ref(&self, uri: &str) -> RefPreview {
        let placeholder = || RefPreview::Dangling { uri: uri.to_string() };

        let Some((did, collection, rkey)) = split_at_uri(uri) else {
            return placeholder();
        };

        let resolved = tokio::time::timeout(HYDRATION_TIMEOUT, async {
            let parsed_did = jacquard_common::types::string::Did::new(did).ok()?;
            let pds_url = self.identity.resolve_pds(&parsed_did).await.ok()?;
            self.public_xrpc
                .get_record(pds_url.as_str(), did, collection, rkey)
                .await
                .ok()
                .flatten()
        })
        .await;

        match resolved {
            Ok(Some((value, _cid))) => RefPreview::Resolved {
                uri: uri.to_string(),
                value,
            },
            _ => placeholder(),
        }
    }
}

/// `at://<did>/<collection>/<rkey>` split into its three segments, without
/// going through the full `AtUri` parser — every URI reaching this helper
/// was already built or validated by [`crate::codec`] on the way in.
fn split_at_uri(uri: &str) -> Option<(&str, &str, &str)> {
    let rest = uri.strip_prefix("at://")?;
    let mut parts = rest.splitn(3, '/');
    let did = parts.next()?;
    let collection = parts.next()?;
    let rkey = parts.next()?;
    Some((did, collection, rkey))
}

/// Mirrors `server/src/jetstream.rs::hydrate_profile`'s two plain GETs
/// (PLC directory for the handle, the public API for the profile record),
/// adapted to return a value instead of writing to sqlite.
async fn hydrate_profile(http: &reqwest::Client, did: &str) -> Option<AuthorProfile> {
    let handle = fetch_handle(http, did).await;

    let profile_url = format!(
        "https://public.api.bsky.app/xrpc/com.atproto.repo.getRecord?repo={did}&collection=app.bsky.actor.profile&rkey=self"
    );
    let (display_name, avatar) = match http.get(&profile_url).send().await {
        Ok(resp) if resp.status().is_success() => {
            match resp.json::<serde_json::Value>().await {
                Ok(body) => {
                    let record = body.get("value");
                    let display_name = record
                        .and_then(|r| r.get("displayName"))
                        .and_then(|v| v.as_str())
                        .map(str::to_string);
                    let avatar = record
                        .and_then(|r| r.get("avatar"))
                        .and_then(|v| v.get("ref"))
                        .and_then(|v| v.get("$link"))
                        .and_then(|v| v.as_str())
                        .map(str::to_string);
                    (display_name, avatar)
                }
                Err(_) => (None, None),
            }
        }
        _ => (None, None),
    };

    Some(AuthorProfile {
        did: did.to_string(),
        handle,
        display_name,
        avatar,
    })
}

async fn fetch_handle(http: &reqwest::Client, did: &str) -> Option<String> {
    let url = format!("https://plc.directory/{did}");
    let resp = http.get(&url).send().await.ok()?;
    if !resp.status().is_success() {
        return None;
    }
    let doc: serde_json::Value = resp.json().await.ok()?;
    doc.get("alsoKnownAs")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .and_then(|v| v.as_str())
        .and_then(|s| s.strip_prefix("at://"))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Kv;

    #[tokio::test]
    async fn public_feed_serves_stale_on_refresh_failure() {
        let index = Arc::new(LocalIndex::new(Kv::open_in_memory().unwrap()));
        let record = IndexedRecord {
            uri: "at://did:plc:alice/social.arabica.alpha.brew/1".into(),
            did: "did:plc:alice".into(),
            collection: "social.arabica.alpha.brew".into(),
            rkey: "1".into(),
            raw_record: serde_json::json!({"rating": 7}),
            cid: "bafy".into(),
            indexed_at: chrono::Utc::now(),
            created_at_micros: 1_000,
        };
        index.put(&record).unwrap();

        let aggregator = FeedAggregator::new(
            index,
            reqwest::Client::new(),
            Arc::new(IdentityClient::new(reqwest::Client::new())),
            Arc::new(PublicXrpcClient::new(reqwest::Client::new())),
            Arc::new(NoopModerationFilter),
            Duration::from_millis(50),
        );

        let first = aggregator.get_public_feed().await;
        assert_eq!(first.len(), 1);

        // Second call within TTL should hit cache without re-fetching.
        let second = aggregator.get_public_feed().await;
        assert_eq!(second.len(), 1);
    }

    #[tokio::test]
    async fn moderation_filter_drops_hidden_records() {
        struct HideAll;
        #[async_trait::async_trait]
        impl ModerationFilter for HideAll {
            async fn is_record_hidden(&self, _uri: &str) -> bool {
                true
            }
            async fn is_blacklisted(&self, _did: &str) -> bool {
                false
            }
        }

        let index = Arc::new(LocalIndex::new(Kv::open_in_memory().unwrap()));
        index
            .put(&IndexedRecord {
                uri: "at://did:plc:alice/x/1".into(),
                did: "did:plc:alice".into(),
                collection: "social.arabica.alpha.brew".into(),
                rkey: "1".into(),
                raw_record: serde_json::json!({}),
                cid: "bafy".into(),
                indexed_at: chrono::Utc::now(),
                created_at_micros: 1_000,
            })
            .unwrap();

        let aggregator = FeedAggregator::new(
            index,
            reqwest::Client::new(),
            Arc::new(IdentityClient::new(reqwest::Client::new())),
            Arc::new(PublicXrpcClient::new(reqwest::Client::new())),
            Arc::new(HideAll),
            Duration::from_secs(300),
        );

        assert!(aggregator.get_authenticated_feed().await.is_empty());
    }

    /// `spec.md` §3 / §8 scenario 5: a `Brew`'s `*Ref` fields must never fail
    /// the feed build, whether the URI is malformed or the target DID simply
    /// doesn't resolve — both collapse to a `Dangling` placeholder.
    #[tokio::test]
    async fn dangling_ref_resolves_to_placeholder() {
        let index = Arc::new(LocalIndex::new(Kv::open_in_memory().unwrap()));
        let aggregator = FeedAggregator::new(
            index,
            reqwest::Client::new(),
            Arc::new(IdentityClient::new(reqwest::Client::new())),
            Arc::new(PublicXrpcClient::new(reqwest::Client::new())),
            Arc::new(NoopModerationFilter),
            Duration::from_secs(300),
        );

        let malformed = aggregator.resolve_ref("not-an-at-uri").await;
        assert!(matches!(malformed, RefPreview::Dangling { uri } if uri == "not-an-at-uri"));

        let unresolvable = aggregator
            .resolve_ref("at://did:plc:doesnotexistxxxxxxxxxxxxxxxxxxxxxxxx/social.arabica.alpha.bean/1")
            .await;
        assert!(matches!(unresolvable, RefPreview::Dangling { .. }));
    }

    #[tokio::test]
    async fn brew_feed_item_carries_ref_previews_without_failing_build() {
        let index = Arc::new(LocalIndex::new(Kv::open_in_memory().unwrap()));
        index
            .put(&IndexedRecord {
                uri: "at://did:plc:alice/social.arabica.alpha.brew/1".into(),
                did: "did:plc:alice".into(),
                collection: "social.arabica.alpha.brew".into(),
                rkey: "1".into(),
                raw_record: serde_json::json!({
                    "rating": 8,
                    "beanRef": "at://did:plc:alice/social.arabica.alpha.bean/missing",
                }),
                cid: "bafy".into(),
                indexed_at: chrono::Utc::now(),
                created_at_micros: 2_000,
            })
            .unwrap();

        let aggregator = FeedAggregator::new(
            index,
            reqwest::Client::new(),
            Arc::new(IdentityClient::new(reqwest::Client::new())),
            Arc::new(PublicXrpcClient::new(reqwest::Client::new())),
            Arc::new(NoopModerationFilter),
            Duration::from_secs(300),
        );

        let items = aggregator.get_public_feed().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0].bean, Some(RefPreview::Dangling { .. })));
        assert!(items[0].grinder.is_none());
        assert!(items[0].brewer.is_none());
    }
}
