//! Persisted OAuth state (`spec.md` §3 "Locally persisted entities",
//! §4.C). Both types are plain JSON values stored in the [`crate::store`]
//! sessions database; nothing here talks to redb directly — that's
//! [`crate::oauth::OAuthManager`]'s job.

use serde::{Deserialize, Serialize};

/// An established, DPoP-bound session against a user's PDS. The DPoP keypair
/// lives alongside the tokens it is bound to; deleting the session destroys
/// the key (`spec.md` §9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthSession {
    pub did: String,
    pub session_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub dpop_key: jose_jwk::Jwk,
    pub pds_url: String,
    pub token_endpoint: String,
    /// Last DPoP nonce observed from this PDS, if any.
    pub dpop_nonce: Option<String>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl OAuthSession {
    pub fn storage_key(&self) -> String {
        format!("{}:{}", self.did, self.session_id)
    }

    /// Within a jitter window of expiry — `refresh` is attempted proactively
    /// rather than waiting for the PDS to reject a call with `401`.
    pub fn needs_refresh(&self) -> bool {
        let jitter = chrono::Duration::seconds(30);
        chrono::Utc::now() + jitter >= self.expires_at
    }
}

/// A pending login, alive between `initiateLogin` and `handleCallback`.
/// One-shot: consumed (and deleted) exactly once, by [`crate::store::Kv::take_json`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequestState {
    pub state: String,
    pub code_verifier: String,
    pub dpop_key: jose_jwk::Jwk,
    pub handle: String,
    pub did: String,
    pub pds_url: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl AuthRequestState {
    /// TTL ~10 min (`spec.md` §3).
    pub fn is_expired(&self) -> bool {
        chrono::Utc::now() - self.created_at > chrono::Duration::minutes(10)
    }
}

/// The result handed back to HTTP handlers after a successful callback, for
/// setting the `account_did`/`session_id` cookies (`spec.md` §6).
#[derive(Debug, Clone)]
pub struct SessionData {
    pub did: String,
    pub session_id: String,
}

impl From<&OAuthSession> for SessionData {
    fn from(s: &OAuthSession) -> Self {
        SessionData {
            did: s.did.clone(),
            session_id: s.session_id.clone(),
        }
    }
}

/// `RegisteredDID { did, registeredAt }` (`spec.md` §3) — the set of users
/// ever authenticated, driving backfill targets. One row per DID in
/// `feed_registry`, keyed by the DID itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredDid {
    pub did: String,
    pub registered_at: chrono::DateTime<chrono::Utc>,
}

impl RegisteredDid {
    pub fn new(did: impl Into<String>) -> Self {
        Self {
            did: did.into(),
            registered_at: chrono::Utc::now(),
        }
    }
}
