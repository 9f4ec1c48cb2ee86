//! Component A — Identity Resolver (`spec.md` §4.A).
//!
//! `resolveHandle`/`resolvePDS` are a thin facade over `jacquard-identity`'s
//! `JacquardResolver`, which already implements the handle→DID and DID→doc
//! fallback chains (DNS TXT, HTTPS well-known, PDS XRPC, public API,
//! Slingshot). `discoverOAuthEndpoints` and `searchActors` aren't part of
//! that crate's surface, so they're implemented directly here with
//! `reqwest`, mirroring the HTTP-call style of `jetstream.rs::hydrate_profile`
//! in the teacher (plain unauthenticated GETs against a PDS/public API).

use jacquard_common::types::string::{Did, Handle};
use jacquard_identity::JacquardResolver;
use jacquard_identity::resolver::IdentityResolver as _;
use serde::Deserialize;
use url::Url;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct OAuthEndpoints {
    pub authorization_endpoint: Url,
    pub token_endpoint: Url,
    pub pushed_authorization_request_endpoint: Option<Url>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActorSummary {
    pub did: String,
    pub handle: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
}

#[derive(Clone)]
pub struct IdentityClient {
    resolver: JacquardResolver,
    http: reqwest::Client,
}

impl IdentityClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            resolver: JacquardResolver::new(http.clone(), Default::default()),
            http,
        }
    }

    /// `resolveHandle(handle) -> DID`. Failure is `unknown-handle` in the
    /// spec's taxonomy, surfaced here as [`Error::NotFound`].
    pub async fn resolve_handle(&self, handle: &str) -> Result<Did<'static>> {
        let handle = Handle::new_owned(handle.to_string())
            .map_err(|e| Error::validation(format!("invalid handle: {e}")))?;
        self.resolver
            .resolve_handle(&handle)
            .await
            .map_err(|e| Error::not_found(format!("unknown handle: {e}")))
    }

    /// `resolvePDS(DID) -> pdsURL`. Failure is `unreachable` or
    /// `malformed-descriptor`, both surfaced as [`Error::Upstream`].
    pub async fn resolve_pds(&self, did: &Did<'_>) -> Result<Url> {
        self.resolver
            .pds_for_did(did)
            .await
            .map_err(|e| Error::Upstream(format!("resolving PDS for {did}: {e}")))
    }

    /// `discoverOAuthEndpoints(pdsURL) -> {authEndpoint, tokenEndpoint}`.
    /// Fetches the PDS's own OAuth authorization-server metadata document
    /// (the same document the teacher's own proxy serves for itself at
    /// `/.well-known/oauth-authorization-server`) and verifies both
    /// endpoints are hosted on the PDS's origin, per the spec's contract.
    pub async fn discover_oauth_endpoints(&self, pds_url: &Url) -> Result<OAuthEndpoints> {
        let metadata_url = pds_url
            .join("/.well-known/oauth-protected-resource")
            .map_err(|e| Error::Internal(e.to_string()))?;
        let protected_resource: ProtectedResourceMetadata = self
            .http
            .get(metadata_url)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| Error::Upstream(e.to_string()))?
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("malformed protected-resource metadata: {e}")))?;

        let auth_server = protected_resource
            .authorization_servers
            .into_iter()
            .next()
            .ok_or_else(|| Error::Upstream("no authorization servers advertised".into()))?;

        let as_metadata_url = auth_server
            .join("/.well-known/oauth-authorization-server")
            .map_err(|e| Error::Internal(e.to_string()))?;
        let as_metadata: AuthorizationServerMetadata = self
            .http
            .get(as_metadata_url)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| Error::Upstream(e.to_string()))?
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("malformed authorization-server metadata: {e}")))?;

        if as_metadata.authorization_endpoint.origin() != auth_server.origin()
            || as_metadata.token_endpoint.origin() != auth_server.origin()
        {
            return Err(Error::Upstream(
                "authorization/token endpoints are not hosted on the PDS origin".into(),
            ));
        }

        Ok(OAuthEndpoints {
            authorization_endpoint: as_metadata.authorization_endpoint,
            token_endpoint: as_metadata.token_endpoint,
            pushed_authorization_request_endpoint: as_metadata
                .pushed_authorization_request_endpoint,
        })
    }

    /// `searchActors(query) -> [{handle, displayName?, avatar?}]`, via the
    /// unauthenticated public API, same origin the teacher uses for profile
    /// hydration fallback in `jetstream.rs::hydrate_profile`.
    pub async fn search_actors(&self, query: &str) -> Result<Vec<ActorSummary>> {
        #[derive(Deserialize)]
        struct SearchResponse {
            actors: Vec<ActorSummary>,
        }

        let resp: SearchResponse = self
            .http
            .get("https://public.api.bsky.app/xrpc/app.bsky.actor.searchActors")
            .query(&[("q", query), ("limit", "25")])
            .send()
            .await?
            .error_for_status()
            .map_err(|e| Error::Upstream(e.to_string()))?
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("malformed search response: {e}")))?;

        Ok(resp.actors)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProtectedResourceMetadata {
    authorization_servers: Vec<Url>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizationServerMetadata {
    authorization_endpoint: Url,
    token_endpoint: Url,
    #[serde(default)]
    pushed_authorization_request_endpoint: Option<Url>,
}
