//! HTTP surface (`spec.md` §6). Thin axum handlers over the components
//! built so far — cookie-based session middleware is grounded on
//! `server/src/oauth.rs::handle_callback`'s `Set-Cookie` construction,
//! generalized to the `account_did`+`session_id` pair the spec requires
//! instead of the teacher's single opaque `session_id`.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, header};
use axum::response::{IntoResponse, Redirect, Response};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::cache::SessionCache;
use crate::codec;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::feed::FeedAggregator;
use crate::firehose::Readiness;
use crate::identity::IdentityClient;
use crate::index::LocalIndex;
use crate::oauth::{CallbackParams, OAuthManager};
use crate::session::{OAuthSession, RegisteredDid};
use crate::store::Kv;
use crate::store::tables::FEED_REGISTRY;
use crate::xrpc::{AuthenticatedXrpcClient, PublicXrpcClient};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub oauth: Arc<OAuthManager>,
    pub identity: Arc<IdentityClient>,
    pub public_xrpc: Arc<PublicXrpcClient>,
    pub authed_xrpc: Arc<AuthenticatedXrpcClient>,
    pub cache: SessionCache,
    pub index: Arc<LocalIndex>,
    pub feed: Arc<FeedAggregator>,
    pub sessions_db: Kv,
    pub readiness: Readiness,
}

const DID_COOKIE: &str = "account_did";
const SESSION_COOKIE: &str = "session_id";

fn read_cookie<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|pair| {
        let pair = pair.trim();
        let (k, v) = pair.split_once('=')?;
        (k == name).then_some(v)
    })
}

fn session_cookies(did: &str, session_id: &str, secure: bool) -> [HeaderValue; 2] {
    let flag = if secure { "; Secure" } else { "" };
    [
        HeaderValue::from_str(&format!(
            "{DID_COOKIE}={did}; Path=/; HttpOnly; SameSite=Lax; Max-Age=2592000{flag}"
        ))
        .expect("cookie header is valid ascii"),
        HeaderValue::from_str(&format!(
            "{SESSION_COOKIE}={session_id}; Path=/; HttpOnly; SameSite=Lax; Max-Age=2592000{flag}"
        ))
        .expect("cookie header is valid ascii"),
    ]
}

fn clear_cookies() -> [HeaderValue; 2] {
    [
        HeaderValue::from_static(
            "account_did=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0",
        ),
        HeaderValue::from_static(
            "session_id=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0",
        ),
    ]
}

/// Middleware contract from `spec.md` §4.C: absent cookies means
/// unauthenticated (not an error); a present-but-dead pair means the caller
/// should clear cookies. Handlers that require auth turn `None` into
/// [`Error::Unauthenticated`] themselves.
async fn load_session(state: &AppState, headers: &HeaderMap) -> Result<Option<OAuthSession>> {
    let (Some(did), Some(session_id)) = (
        read_cookie(headers, DID_COOKIE),
        read_cookie(headers, SESSION_COOKIE),
    ) else {
        return Ok(None);
    };

    let Some(mut session) = state.oauth.load_session(did, session_id)? else {
        return Ok(None);
    };

    if session.needs_refresh() {
        match state.oauth.refresh(&mut session).await {
            Ok(()) => {}
            Err(_) => return Ok(None),
        }
    }

    Ok(Some(session))
}

async fn require_session(state: &AppState, headers: &HeaderMap) -> Result<OAuthSession> {
    load_session(state, headers)
        .await?
        .ok_or(Error::Unauthenticated)
}

#[derive(Deserialize)]
pub struct LoginBody {
    pub handle: String,
}

pub async fn post_auth_login(
    State(state): State<AppState>,
    Json(body): Json<LoginBody>,
) -> Result<Response> {
    let (auth_url, _state) = state.oauth.initiate_login(&body.handle).await?;
    Ok(Redirect::to(&auth_url).into_response())
}

#[derive(Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
}

pub async fn get_oauth_callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Result<Response> {
    let code = query.code.ok_or_else(|| Error::validation("missing code"))?;
    let oauth_state = query.state.ok_or_else(|| Error::validation("missing state"))?;

    let session_data = state
        .oauth
        .handle_callback(CallbackParams {
            code,
            state: oauth_state,
        })
        .await?;

    // First-login registration only: keep the original `registeredAt` on
    // repeat callbacks rather than bumping it every time a session refreshes.
    if state
        .sessions_db
        .get_json::<RegisteredDid>(FEED_REGISTRY, &session_data.did)?
        .is_none()
    {
        state.sessions_db.put_json(
            FEED_REGISTRY,
            &session_data.did,
            &RegisteredDid::new(&session_data.did),
        )?;
    }

    let secure = state.config.public_url.starts_with("https://");
    let cookies = session_cookies(&session_data.did, &session_data.session_id, secure);

    let mut response = Redirect::to("/").into_response();
    for cookie in cookies {
        response.headers_mut().append(header::SET_COOKIE, cookie);
    }
    Ok(response)
}

pub async fn post_logout(State(state): State<AppState>, headers: HeaderMap) -> Result<Response> {
    if let Some(session) = load_session(&state, &headers).await? {
        state.oauth.revoke(&session).await?;
    }

    let mut response = axum::http::StatusCode::NO_CONTENT.into_response();
    for cookie in clear_cookies() {
        response.headers_mut().append(header::SET_COOKIE, cookie);
    }
    Ok(response)
}

pub async fn get_client_metadata(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "client_id": state.config.client_id_url(),
        "client_name": state.config.oauth_client_name,
        "client_uri": state.config.public_url,
        "redirect_uris": [state.config.redirect_uri()],
        "scope": "atproto transition:generic",
        "grant_types": ["authorization_code", "refresh_token"],
        "response_types": ["code"],
        "token_endpoint_auth_method": "none",
        "application_type": "web",
        "dpop_bound_access_tokens": true,
    }))
}

pub async fn get_api_me(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Value>> {
    match load_session(&state, &headers).await? {
        Some(session) => Ok(Json(json!({ "did": session.did, "sessionId": session.session_id }))),
        None => Ok(Json(json!({ "did": Value::Null }))),
    }
}

/// `GET /api/data` — authenticated per-user snapshot across all collections,
/// read through the session cache (`spec.md` §6).
pub async fn get_api_data(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Value>> {
    let mut session = require_session(&state, &headers).await?;
    let session_key = session.storage_key();

    let mut out = serde_json::Map::new();
    for &collection in lexicons::nsid::ALL {
        let records = fetch_collection(&state, &mut session, &session_key, collection).await?;
        out.insert(
            short_name(collection).to_string(),
            Value::Array(
                records
                    .into_iter()
                    .map(|(uri, value)| json!({ "uri": uri, "value": value }))
                    .collect(),
            ),
        );
    }
    state.oauth.save_session(&session)?;

    Ok(Json(Value::Object(out)))
}

async fn fetch_collection(
    state: &AppState,
    session: &mut OAuthSession,
    session_key: &str,
    collection: &str,
) -> Result<Vec<(String, Value)>> {
    if let Some(cached) = state.cache.get_list(session_key, collection).await {
        return Ok(cached);
    }

    let page = state
        .authed_xrpc
        .list_records(session, collection, 100, None)
        .await?;
    state
        .cache
        .put_list(session_key, collection, page.records.clone())
        .await;
    Ok(page.records)
}

fn short_name(nsid: &str) -> &str {
    nsid.rsplit('.').next().unwrap_or(nsid)
}

pub async fn get_api_feed(State(state): State<AppState>, headers: HeaderMap) -> Json<Value> {
    let items = if load_session(&state, &headers).await.ok().flatten().is_some() {
        state.feed.get_authenticated_feed().await
    } else {
        state.feed.get_public_feed().await
    };
    Json(json!({ "items": items }))
}

pub async fn get_api_profile(
    State(state): State<AppState>,
    Path(actor): Path<String>,
) -> Result<Json<Value>> {
    let did = if actor.starts_with("did:") {
        jacquard_common::types::string::Did::new_owned(actor.clone())
            .map_err(|e| Error::validation(format!("invalid DID: {e}")))?
    } else {
        state.identity.resolve_handle(&actor).await?
    };
    let pds_url = state.identity.resolve_pds(&did).await?;
    let did_str = did.to_string();

    let mut snapshot = serde_json::Map::new();
    for &collection in lexicons::nsid::ALL {
        let page = state
            .public_xrpc
            .list_records(pds_url.as_str(), &did_str, collection, 50, None)
            .await?;
        snapshot.insert(
            short_name(collection).to_string(),
            Value::Array(
                page.records
                    .into_iter()
                    .map(|(uri, value)| json!({ "uri": uri, "value": value }))
                    .collect(),
            ),
        );
    }

    Ok(Json(json!({ "did": did_str, "records": snapshot })))
}

#[derive(Deserialize)]
pub struct CreateBody {
    pub record: Value,
}

pub async fn post_collection(
    State(state): State<AppState>,
    Path(collection_short): Path<String>,
    headers: HeaderMap,
    Json(body): Json<CreateBody>,
) -> Result<Json<Value>> {
    let mut session = require_session(&state, &headers).await?;
    let collection = full_collection_name(&collection_short)?;

    codec::decode_by_collection(collection, body.record.clone())?;

    let created = state
        .authed_xrpc
        .create_record(&mut session, collection, body.record)
        .await?;
    state.oauth.save_session(&session)?;
    state
        .cache
        .invalidate(&session.storage_key(), collection, &created.uri)
        .await;

    Ok(Json(json!({ "uri": created.uri, "cid": created.cid })))
}

pub async fn put_collection_record(
    State(state): State<AppState>,
    Path((collection_short, rkey)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<CreateBody>,
) -> Result<Json<Value>> {
    let mut session = require_session(&state, &headers).await?;
    let collection = full_collection_name(&collection_short)?;

    codec::decode_by_collection(collection, body.record.clone())?;

    let cid = state
        .authed_xrpc
        .put_record(&mut session, collection, &rkey, body.record)
        .await?;
    state.oauth.save_session(&session)?;

    let uri = codec::build_at_uri(&session.did, collection, &rkey)?;
    state
        .cache
        .invalidate(&session.storage_key(), collection, &uri)
        .await;

    Ok(Json(json!({ "uri": uri, "cid": cid })))
}

/// `GET /api/{collection}/{rkey}` — single authenticated record, read
/// through the per-session singleton cache before falling through to the
/// PDS (`spec.md` §4.F).
pub async fn get_collection_record(
    State(state): State<AppState>,
    Path((collection_short, rkey)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    let mut session = require_session(&state, &headers).await?;
    let collection = full_collection_name(&collection_short)?;
    let session_key = session.storage_key();
    let uri = codec::build_at_uri(&session.did, collection, &rkey)?;

    if let Some((value, cid)) = state.cache.get_record(&session_key, &uri).await {
        return Ok(Json(json!({ "uri": uri, "cid": cid, "value": value })));
    }

    let record = state
        .authed_xrpc
        .get_record(&mut session, collection, &rkey)
        .await?
        .ok_or_else(|| Error::not_found(format!("no record at {uri}")))?;
    state.oauth.save_session(&session)?;

    let (value, cid) = record;
    state
        .cache
        .put_record(&session_key, &uri, value.clone(), cid.clone())
        .await;

    Ok(Json(json!({ "uri": uri, "cid": cid, "value": value })))
}

pub async fn delete_collection_record(
    State(state): State<AppState>,
    Path((collection_short, rkey)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<axum::http::StatusCode> {
    let mut session = require_session(&state, &headers).await?;
    let collection = full_collection_name(&collection_short)?;

    state
        .authed_xrpc
        .delete_record(&mut session, collection, &rkey)
        .await?;
    state.oauth.save_session(&session)?;

    let uri = codec::build_at_uri(&session.did, collection, &rkey)?;
    state
        .cache
        .invalidate(&session.storage_key(), collection, &uri)
        .await;

    Ok(axum::http::StatusCode::NO_CONTENT)
}

fn full_collection_name(short_plural: &str) -> Result<&'static str> {
    match short_plural {
        "roasters" => Ok(lexicons::nsid::ROASTER),
        "beans" => Ok(lexicons::nsid::BEAN),
        "grinders" => Ok(lexicons::nsid::GRINDER),
        "brewers" => Ok(lexicons::nsid::BREWER),
        "brews" => Ok(lexicons::nsid::BREW),
        other => Err(Error::not_found(format!("unknown collection path {other}"))),
    }
}

pub async fn get_healthz(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "ready": state.readiness.is_ready() }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_cookie_pair_from_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("account_did=did:plc:alice; session_id=abc123"),
        );
        assert_eq!(read_cookie(&headers, DID_COOKIE), Some("did:plc:alice"));
        assert_eq!(read_cookie(&headers, SESSION_COOKIE), Some("abc123"));
    }

    #[test]
    fn full_collection_name_rejects_unknown_path() {
        assert!(full_collection_name("widgets").is_err());
        assert_eq!(full_collection_name("brews").unwrap(), lexicons::nsid::BREW);
    }
}
