//! Component D — XRPC Client (`spec.md` §4.D).
//!
//! Two read paths per `spec.md` §9 "Public vs. authenticated XRPC": an
//! authenticated client bound to one session's PDS (DPoP-signed, auto-
//! refreshing), and a bare unauthenticated client for anonymous reads
//! against any PDS (used by feed hydration and backfill for other users'
//! data). Both forward requests with a manually-minted DPoP proof and the
//! nonce-retry loop grounded on
//! `jacquard-oatproxy/src/server.rs::handle_xrpc_proxy`, rather than the
//! generic `jacquard_common::xrpc::XrpcClient` trait machinery (the teacher
//! itself only uses that machinery inside the OAuth library's own internals,
//! never for its own application-level PDS calls).

use std::time::Duration;

use rand::Rng;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::dpop;
use crate::error::{Error, Result};
use crate::oauth::OAuthManager;
use crate::session::OAuthSession;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const READ_RETRY_BACKOFFS_MS: [u64; 2] = [100, 400];

#[derive(Debug, Clone, serde::Serialize)]
pub struct CreatedRecord {
    pub uri: String,
    pub cid: String,
}

#[derive(Debug, Clone)]
pub struct ListPage<T> {
    pub records: Vec<(String, T)>,
    pub cursor: Option<String>,
}

/// Unauthenticated XRPC reads against an arbitrary PDS — resolution of which
/// PDS to hit is the caller's job (via [`crate::identity::IdentityClient`]).
#[derive(Clone)]
pub struct PublicXrpcClient {
    http: reqwest::Client,
}

impl PublicXrpcClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    pub async fn get_record(
        &self,
        pds_url: &str,
        did: &str,
        collection: &str,
        rkey: &str,
    ) -> Result<Option<(Value, String)>> {
        let url = format!(
            "{}/xrpc/com.atproto.repo.getRecord",
            pds_url.trim_end_matches('/')
        );
        let resp = self
            .retryable_get(&url, &[("repo", did), ("collection", collection), ("rkey", rkey)])
            .await?;

        let Some(resp) = resp else { return Ok(None) };
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = classify_and_parse::<GetRecordResponse>(resp).await?;
        Ok(Some((body.value, body.cid)))
    }

    pub async fn list_records(
        &self,
        pds_url: &str,
        did: &str,
        collection: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<ListPage<Value>> {
        let url = format!(
            "{}/xrpc/com.atproto.repo.listRecords",
            pds_url.trim_end_matches('/')
        );
        let limit_str = limit.to_string();
        let mut query = vec![
            ("repo", did),
            ("collection", collection),
            ("limit", limit_str.as_str()),
        ];
        if let Some(c) = cursor {
            query.push(("cursor", c));
        }

        let resp = self
            .retryable_get(&url, &query)
            .await?
            .ok_or_else(|| Error::Upstream("no response from PDS".into()))?;
        let body = classify_and_parse::<ListRecordsResponse>(resp).await?;
        Ok(ListPage {
            records: body
                .records
                .into_iter()
                .map(|r| (r.uri, r.value))
                .collect(),
            cursor: body.cursor,
        })
    }

    /// Idempotent-read retry: up to 2 attempts, 100ms/400ms backoff + jitter,
    /// only on transport error (never on a parsed HTTP error response).
    async fn retryable_get(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<Option<reqwest::Response>> {
        let mut last_err = None;
        for (attempt, backoff_ms) in [0u64].into_iter().chain(READ_RETRY_BACKOFFS_MS).enumerate() {
            if attempt > 0 {
                let jitter = rand::thread_rng().gen_range(0..50);
                tokio::time::sleep(Duration::from_millis(backoff_ms + jitter)).await;
            }
            match self
                .http
                .get(url)
                .query(query)
                .timeout(REQUEST_TIMEOUT)
                .send()
                .await
            {
                Ok(resp) => return Ok(Some(resp)),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.map(Error::from).unwrap_or(Error::Internal("retry loop exhausted".into())))
    }
}

/// Authenticated client, bound to one session's PDS via its DPoP key.
/// Transparently refreshes through the owning [`OAuthManager`] on
/// `401 invalid_token` or proactive expiry.
#[derive(Clone)]
pub struct AuthenticatedXrpcClient {
    http: reqwest::Client,
    oauth: std::sync::Arc<OAuthManager>,
}

impl AuthenticatedXrpcClient {
    pub fn new(http: reqwest::Client, oauth: std::sync::Arc<OAuthManager>) -> Self {
        Self { http, oauth }
    }

    pub async fn create_record(
        &self,
        session: &mut OAuthSession,
        collection: &str,
        record: Value,
    ) -> Result<CreatedRecord> {
        self.ensure_fresh(session).await?;
        let url = format!(
            "{}/xrpc/com.atproto.repo.createRecord",
            session.pds_url.trim_end_matches('/')
        );
        let body = serde_json::json!({
            "repo": session.did,
            "collection": collection,
            "record": record,
        });
        let resp = self.send_authenticated(session, "POST", &url, Some(body)).await?;
        let parsed: CreateRecordResponse = classify_and_parse(resp).await?;
        Ok(CreatedRecord {
            uri: parsed.uri,
            cid: parsed.cid,
        })
    }

    pub async fn put_record(
        &self,
        session: &mut OAuthSession,
        collection: &str,
        rkey: &str,
        record: Value,
    ) -> Result<String> {
        self.ensure_fresh(session).await?;
        let url = format!(
            "{}/xrpc/com.atproto.repo.putRecord",
            session.pds_url.trim_end_matches('/')
        );
        let body = serde_json::json!({
            "repo": session.did,
            "collection": collection,
            "rkey": rkey,
            "record": record,
        });
        let resp = self.send_authenticated(session, "POST", &url, Some(body)).await?;
        let parsed: CreateRecordResponse = classify_and_parse(resp).await?;
        Ok(parsed.cid)
    }

    pub async fn delete_record(
        &self,
        session: &mut OAuthSession,
        collection: &str,
        rkey: &str,
    ) -> Result<()> {
        self.ensure_fresh(session).await?;
        let url = format!(
            "{}/xrpc/com.atproto.repo.deleteRecord",
            session.pds_url.trim_end_matches('/')
        );
        let body = serde_json::json!({
            "repo": session.did,
            "collection": collection,
            "rkey": rkey,
        });
        let resp = self.send_authenticated(session, "POST", &url, Some(body)).await?;
        let _ = classify_status(&resp)?;
        Ok(())
    }

    pub async fn get_record(
        &self,
        session: &mut OAuthSession,
        collection: &str,
        rkey: &str,
    ) -> Result<Option<(Value, String)>> {
        self.ensure_fresh(session).await?;
        let url = format!(
            "{}/xrpc/com.atproto.repo.getRecord?repo={}&collection={}&rkey={}",
            session.pds_url.trim_end_matches('/'),
            urlencoding_lite(&session.did),
            urlencoding_lite(collection),
            urlencoding_lite(rkey),
        );
        let resp = self.send_authenticated(session, "GET", &url, None).await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let parsed: GetRecordResponse = classify_and_parse(resp).await?;
        Ok(Some((parsed.value, parsed.cid)))
    }

    pub async fn list_records(
        &self,
        session: &mut OAuthSession,
        collection: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<ListPage<Value>> {
        self.ensure_fresh(session).await?;
        let mut url = format!(
            "{}/xrpc/com.atproto.repo.listRecords?repo={}&collection={}&limit={}",
            session.pds_url.trim_end_matches('/'),
            urlencoding_lite(&session.did),
            urlencoding_lite(collection),
            limit,
        );
        if let Some(c) = cursor {
            url.push_str(&format!("&cursor={}", urlencoding_lite(c)));
        }
        let resp = self.send_authenticated(session, "GET", &url, None).await?;
        let parsed: ListRecordsResponse = classify_and_parse(resp).await?;
        Ok(ListPage {
            records: parsed.records.into_iter().map(|r| (r.uri, r.value)).collect(),
            cursor: parsed.cursor,
        })
    }

    async fn ensure_fresh(&self, session: &mut OAuthSession) -> Result<()> {
        if session.needs_refresh() {
            self.oauth.refresh(session).await?;
        }
        Ok(())
    }

    /// Sends one request, transparently refreshing and retrying exactly
    /// once on a reactive `401` from the PDS (`spec.md` §4.C: "performed
    /// transparently when an XRPC call sees a `401 invalid_token`"; §7: "one
    /// transparent refresh-and-retry; if refresh fails, emit
    /// `unauthenticated`"). `ensure_fresh` only catches expiry the *local*
    /// clock already knows about; this catches server-side revocation or
    /// clock skew the PDS notices first.
    async fn send_authenticated(
        &self,
        session: &mut OAuthSession,
        method: &str,
        url: &str,
        body: Option<Value>,
    ) -> Result<reqwest::Response> {
        match self
            .send_authenticated_once(session, method, url, body.clone())
            .await
        {
            Err(Error::Unauthenticated) => {
                self.oauth.refresh(session).await?;
                self.send_authenticated_once(session, method, url, body).await
            }
            other => other,
        }
    }

    /// Sends one request with a fresh DPoP proof, retrying exactly once on
    /// a `use_dpop_nonce` challenge (`spec.md` §4.C). Writes never retry on
    /// transport error; only the nonce challenge causes a second attempt.
    async fn send_authenticated_once(
        &self,
        session: &mut OAuthSession,
        method: &str,
        url: &str,
        body: Option<Value>,
    ) -> Result<reqwest::Response> {
        for attempt in 0..2 {
            let proof = dpop::mint_proof(
                &session.dpop_key,
                method,
                url,
                Some(&session.access_token),
                session.dpop_nonce.as_deref(),
            )?;

            let mut req = self
                .http
                .request(method.parse().unwrap(), url)
                .timeout(REQUEST_TIMEOUT)
                .header("Authorization", format!("DPoP {}", session.access_token))
                .header("DPoP", proof);
            if let Some(b) = &body {
                req = req.json(b);
            }

            let resp = req.send().await?;

            if let Some(nonce) = resp
                .headers()
                .get("DPoP-Nonce")
                .and_then(|v| v.to_str().ok())
            {
                session.dpop_nonce = Some(nonce.to_string());
            }

            let status = resp.status();
            if (status == reqwest::StatusCode::BAD_REQUEST || status == reqwest::StatusCode::UNAUTHORIZED)
                && attempt == 0
                && session.dpop_nonce.is_some()
            {
                continue;
            }

            if status == reqwest::StatusCode::UNAUTHORIZED {
                return Err(Error::Unauthenticated);
            }

            return Ok(resp);
        }
        Err(Error::Upstream("DPoP nonce retry exhausted".into()))
    }
}

async fn classify_and_parse<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    let status = classify_status(&resp)?;
    let _ = status;
    resp.json::<T>()
        .await
        .map_err(|e| Error::Upstream(format!("malformed PDS response: {e}")))
}

fn classify_status(resp: &reqwest::Response) -> Result<reqwest::StatusCode> {
    let status = resp.status();
    if status.is_success() {
        return Ok(status);
    }
    match status.as_u16() {
        401 | 403 => Err(Error::Unauthenticated),
        404 => Err(Error::not_found("record not found")),
        409 => Err(Error::Conflict("record precondition failed".into())),
        400 => Err(Error::validation("PDS rejected the request")),
        429 => {
            let retry_after = resp
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok());
            Err(Error::RateLimited {
                retry_after_secs: retry_after,
            })
        }
        500..=599 => Err(Error::Upstream(format!("PDS returned {status}"))),
        _ => Err(Error::Upstream(format!("unexpected PDS status {status}"))),
    }
}

fn urlencoding_lite(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

#[derive(serde::Deserialize)]
struct GetRecordResponse {
    #[allow(dead_code)]
    uri: String,
    cid: String,
    value: Value,
}

#[derive(serde::Deserialize)]
struct CreateRecordResponse {
    uri: String,
    cid: String,
}

#[derive(serde::Deserialize)]
struct ListRecordsRecord {
    uri: String,
    #[allow(dead_code)]
    cid: String,
    value: Value,
}

#[derive(serde::Deserialize)]
struct ListRecordsResponse {
    records: Vec<ListRecordsRecord>,
    cursor: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn public_get_record_returns_none_on_404() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/xrpc/com.atproto.repo.getRecord"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = PublicXrpcClient::new(reqwest::Client::new());
        let result = client
            .get_record(&server.uri(), "did:plc:alice", "social.arabica.alpha.bean", "abc")
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn public_list_records_parses_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/xrpc/com.atproto.repo.listRecords"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "records": [{"uri": "at://did:plc:alice/x/1", "cid": "bafy1", "value": {}}],
                "cursor": "next-page",
            })))
            .mount(&server)
            .await;

        let client = PublicXrpcClient::new(reqwest::Client::new());
        let page = client
            .list_records(&server.uri(), "did:plc:alice", "social.arabica.alpha.bean", 50, None)
            .await
            .unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.cursor.as_deref(), Some("next-page"));
    }
}
