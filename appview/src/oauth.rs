//! Component C — OAuth Session Manager (`spec.md` §4.C).
//!
//! Grounded on the teacher's own client-role flow in `server/src/oauth.rs`
//! (handle resolution → PDS discovery → authorize → callback → persisted
//! session), but rebuilt against this crate's `redb`-backed [`crate::store`]
//! instead of `MemoryAuthStore`/sqlite, because the spec requires sessions
//! to survive a restart. DPoP proof minting and the nonce-retry dance are
//! grounded on `jacquard-oatproxy/src/token.rs` and
//! `jacquard-oatproxy/src/server.rs::handle_xrpc_proxy`.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc::UnboundedSender;

use crate::config::Config;
use crate::dpop;
use crate::error::{Error, Result};
use crate::identity::IdentityClient;
use crate::session::{AuthRequestState, OAuthSession, SessionData};
use crate::store::Kv;
use crate::store::tables::OAUTH_AUTH_REQUESTS;
use crate::store::tables::OAUTH_SESSIONS;

pub struct CallbackParams {
    pub code: String,
    pub state: String,
}

#[derive(Clone)]
pub struct OAuthManager {
    kv: Kv,
    identity: Arc<IdentityClient>,
    http: reqwest::Client,
    config: Arc<Config>,
    /// Fired with a DID after each fresh callback, per the registration
    /// hook in `spec.md` §6. `main.rs` wires this into the feed registry
    /// and the backfiller; tests may leave it unset.
    on_auth_success: Option<UnboundedSender<String>>,
}

impl OAuthManager {
    pub fn new(
        kv: Kv,
        identity: Arc<IdentityClient>,
        http: reqwest::Client,
        config: Arc<Config>,
        on_auth_success: Option<UnboundedSender<String>>,
    ) -> Self {
        Self {
            kv,
            identity,
            http,
            config,
            on_auth_success,
        }
    }

    /// `initiateLogin(handle) -> (authURL, state)`.
    pub async fn initiate_login(&self, handle: &str) -> Result<(String, String)> {
        let did = self.identity.resolve_handle(handle).await?;
        let pds_url = self.identity.resolve_pds(&did).await?;
        let endpoints = self.identity.discover_oauth_endpoints(&pds_url).await?;

        let state = random_urlsafe(32);
        let code_verifier = random_urlsafe(64);
        let code_challenge = {
            let mut hasher = Sha256::new();
            hasher.update(code_verifier.as_bytes());
            URL_SAFE_NO_PAD.encode(hasher.finalize())
        };
        let dpop_key = dpop::generate_keypair();

        let auth_request = AuthRequestState {
            state: state.clone(),
            code_verifier,
            dpop_key,
            handle: handle.to_string(),
            did: did.to_string(),
            pds_url: pds_url.to_string(),
            authorization_endpoint: endpoints.authorization_endpoint.to_string(),
            token_endpoint: endpoints.token_endpoint.to_string(),
            created_at: chrono::Utc::now(),
        };
        self.kv
            .put_json(OAUTH_AUTH_REQUESTS, &state, &auth_request)?;

        let mut auth_url = endpoints.authorization_endpoint.clone();
        auth_url
            .query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id_url())
            .append_pair("redirect_uri", &self.config.redirect_uri())
            .append_pair("scope", "atproto transition:generic")
            .append_pair("code_challenge", &code_challenge)
            .append_pair("code_challenge_method", "S256")
            .append_pair("state", &state);

        Ok((auth_url.to_string(), state))
    }

    /// `handleCallback(queryParams) -> SessionData`.
    pub async fn handle_callback(&self, params: CallbackParams) -> Result<SessionData> {
        if params.code.is_empty() || params.state.is_empty() {
            return Err(Error::validation("callback missing code or state"));
        }

        let auth_request: AuthRequestState = self
            .kv
            .take_json(OAUTH_AUTH_REQUESTS, &params.state)?
            .ok_or_else(|| Error::validation("unknown or already-consumed login state"))?;

        if auth_request.is_expired() {
            return Err(Error::validation("login request expired"));
        }

        let token_response = self
            .exchange_code(&auth_request, &params.code)
            .await?;

        if token_response.sub != auth_request.did {
            return Err(Error::Upstream(format!(
                "token response sub {} does not match expected DID {}",
                token_response.sub, auth_request.did
            )));
        }

        let session = OAuthSession {
            did: token_response.sub.clone(),
            session_id: random_urlsafe(24),
            access_token: token_response.access_token,
            refresh_token: token_response.refresh_token,
            dpop_key: auth_request.dpop_key,
            pds_url: auth_request.pds_url,
            token_endpoint: auth_request.token_endpoint,
            dpop_nonce: None,
            expires_at: chrono::Utc::now()
                + chrono::Duration::seconds(token_response.expires_in.unwrap_or(3600)),
            created_at: chrono::Utc::now(),
        };

        self.kv
            .put_json(OAUTH_SESSIONS, &session.storage_key(), &session)?;

        if let Some(tx) = &self.on_auth_success {
            let _ = tx.send(session.did.clone());
        }

        Ok(SessionData::from(&session))
    }

    /// Transparent refresh, called by the XRPC client on `401 invalid_token`
    /// or proactively when `session.needs_refresh()`.
    pub async fn refresh(&self, session: &mut OAuthSession) -> Result<()> {
        let Some(refresh_token) = session.refresh_token.clone() else {
            self.revoke(session).await?;
            return Err(Error::Unauthenticated);
        };

        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
            ("client_id", self.config.client_id_url().as_str()),
        ];

        let response = match self
            .post_token_endpoint(&session.token_endpoint, &form, session)
            .await
        {
            Ok(r) => r,
            Err(_) => {
                self.revoke(session).await?;
                return Err(Error::Unauthenticated);
            }
        };

        session.access_token = response.access_token;
        if response.refresh_token.is_some() {
            session.refresh_token = response.refresh_token;
        }
        session.expires_at =
            chrono::Utc::now() + chrono::Duration::seconds(response.expires_in.unwrap_or(3600));

        self.kv
            .put_json(OAUTH_SESSIONS, &session.storage_key(), session)?;
        Ok(())
    }

    pub fn load_session(&self, did: &str, session_id: &str) -> Result<Option<OAuthSession>> {
        self.kv
            .get_json(OAUTH_SESSIONS, &format!("{did}:{session_id}"))
    }

    pub fn save_session(&self, session: &OAuthSession) -> Result<()> {
        self.kv
            .put_json(OAUTH_SESSIONS, &session.storage_key(), session)
    }

    /// `POST /logout` — deletes the session; its DPoP key dies with it.
    pub async fn revoke(&self, session: &OAuthSession) -> Result<()> {
        self.kv.delete(OAUTH_SESSIONS, &session.storage_key())
    }

    async fn exchange_code(
        &self,
        auth_request: &AuthRequestState,
        code: &str,
    ) -> Result<TokenResponse> {
        let form = vec![
            ("grant_type".to_string(), "authorization_code".to_string()),
            ("code".to_string(), code.to_string()),
            ("code_verifier".to_string(), auth_request.code_verifier.clone()),
            ("redirect_uri".to_string(), self.config.redirect_uri()),
            ("client_id".to_string(), self.config.client_id_url()),
        ];
        let form: Vec<(&str, &str)> = form.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();

        self.post_token_endpoint_with_key(
            &auth_request.token_endpoint,
            &form,
            &auth_request.dpop_key,
            None,
        )
        .await
    }

    /// Posts to a token endpoint using the session's own DPoP key, retrying
    /// once on a `use_dpop_nonce` challenge and persisting the nonce either
    /// way (`spec.md` §4.C "DPOP proof rules").
    async fn post_token_endpoint(
        &self,
        token_endpoint: &str,
        form: &[(&str, &str)],
        session: &mut OAuthSession,
    ) -> Result<TokenResponse> {
        let nonce = session.dpop_nonce.clone();
        let (response, new_nonce) = self
            .post_token_endpoint_inner(token_endpoint, form, &session.dpop_key, nonce)
            .await?;
        if let Some(n) = new_nonce {
            session.dpop_nonce = Some(n);
        }
        Ok(response)
    }

    async fn post_token_endpoint_with_key(
        &self,
        token_endpoint: &str,
        form: &[(&str, &str)],
        dpop_key: &jose_jwk::Jwk,
        nonce: Option<String>,
    ) -> Result<TokenResponse> {
        let (response, _nonce) = self
            .post_token_endpoint_inner(token_endpoint, form, dpop_key, nonce)
            .await?;
        Ok(response)
    }

    async fn post_token_endpoint_inner(
        &self,
        token_endpoint: &str,
        form: &[(&str, &str)],
        dpop_key: &jose_jwk::Jwk,
        nonce: Option<String>,
    ) -> Result<(TokenResponse, Option<String>)> {
        let mut nonce = nonce;

        for attempt in 0..2 {
            let proof = dpop::mint_proof(dpop_key, "POST", token_endpoint, None, nonce.as_deref())?;
            let resp = self
                .http
                .post(token_endpoint)
                .header("DPoP", proof)
                .form(form)
                .send()
                .await?;

            let status = resp.status();
            let challenge_nonce = resp
                .headers()
                .get("DPoP-Nonce")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());

            if (status.as_u16() == 400 || status.as_u16() == 401)
                && challenge_nonce.is_some()
                && attempt == 0
            {
                nonce = challenge_nonce;
                continue;
            }

            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(Error::Upstream(format!(
                    "token endpoint {status}: {body}"
                )));
            }

            let parsed: TokenResponse = resp
                .json()
                .await
                .map_err(|e| Error::Upstream(format!("malformed token response: {e}")))?;
            return Ok((parsed, challenge_nonce.or(nonce)));
        }

        Err(Error::Upstream("token endpoint requires a DPoP nonce retry loop".into()))
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    sub: String,
}

fn random_urlsafe(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_urlsafe_has_no_padding() {
        let s = random_urlsafe(32);
        assert!(!s.contains('='));
    }

    #[test]
    fn auth_request_expires_after_ttl() {
        let mut req = AuthRequestState {
            state: "s".into(),
            code_verifier: "v".into(),
            dpop_key: dpop::generate_keypair(),
            handle: "alice.example".into(),
            did: "did:plc:alice".into(),
            pds_url: "https://pds.example".into(),
            authorization_endpoint: "https://pds.example/oauth/authorize".into(),
            token_endpoint: "https://pds.example/oauth/token".into(),
            created_at: chrono::Utc::now(),
        };
        assert!(!req.is_expired());
        req.created_at = chrono::Utc::now() - chrono::Duration::minutes(11);
        assert!(req.is_expired());
    }
}
