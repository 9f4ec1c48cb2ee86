//! Binary entrypoint. Wiring mirrors `server/src/main.rs`: read env config,
//! stand up the persistence layer, spawn the firehose consumer as a
//! background task, then serve axum — just over this application's five
//! components instead of the teacher's sqlite pool and `jacquard_oatproxy`
//! server.

mod cache;
mod codec;
mod config;
mod dpop;
mod error;
mod feed;
mod firehose;
mod http;
mod identity;
mod index;
mod oauth;
mod session;
mod store;
mod xrpc;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use miette::{IntoDiagnostic, Result, miette};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::{Config, LogFormat};
use crate::feed::{FeedAggregator, NoopModerationFilter};
use crate::firehose::Readiness;
use crate::http::AppState;
use crate::identity::IdentityClient;
use crate::index::LocalIndex;
use crate::oauth::OAuthManager;
use crate::store::Kv;
use crate::xrpc::{AuthenticatedXrpcClient, PublicXrpcClient};

fn init_tracing(format: LogFormat) {
    // `LOG_LEVEL` is this application's own override (`spec.md` §6); fall
    // back to the conventional `RUST_LOG` before the hardcoded default, the
    // same layered precedence `server/src/main.rs` uses for its own
    // `EnvFilter::try_from_default_env()` call.
    let directive = std::env::var("LOG_LEVEL").or_else(|_| std::env::var("RUST_LOG"));
    let filter = match directive {
        Ok(d) => tracing_subscriber::filter::EnvFilter::try_new(d)
            .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new("arabica_appview=debug,info")),
        Err(_) => tracing_subscriber::filter::EnvFilter::new("arabica_appview=debug,info"),
    };

    match format {
        LogFormat::Json => {
            tracing_subscriber::fmt().json().with_env_filter(filter).init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(Config::from_env());
    init_tracing(config.log_format);

    tracing::info!(public_url = %config.public_url, bind_addr = %config.bind_addr, "starting arabica-appview");

    let http_client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .into_diagnostic()?;

    let sessions_db = Kv::open(&config.db_path)
        .map_err(|e| miette!("opening sessions database at {}: {e}", config.db_path))?;
    let index_db = Kv::open(&config.feed_index_path)
        .map_err(|e| miette!("opening index database at {}: {e}", config.feed_index_path))?;

    let identity = Arc::new(IdentityClient::new(http_client.clone()));
    let index = Arc::new(LocalIndex::new(index_db));

    // Fed by every fresh OAuth callback; drained below to register the DID
    // for the feed and kick off a one-time historical backfill.
    let (auth_tx, mut auth_rx) = tokio::sync::mpsc::unbounded_channel::<String>();

    let oauth = Arc::new(OAuthManager::new(
        sessions_db.clone(),
        identity.clone(),
        http_client.clone(),
        config.clone(),
        Some(auth_tx),
    ));

    let public_xrpc = Arc::new(PublicXrpcClient::new(http_client.clone()));
    let authed_xrpc = Arc::new(AuthenticatedXrpcClient::new(http_client.clone(), oauth.clone()));

    let cache = crate::cache::SessionCache::new();
    tokio::spawn(cache.clone().run_reaper());

    let feed = Arc::new(FeedAggregator::new(
        index.clone(),
        http_client.clone(),
        identity.clone(),
        public_xrpc.clone(),
        Arc::new(NoopModerationFilter),
        config.profile_cache_ttl,
    ));

    let readiness = Readiness::default();
    {
        let index = index.clone();
        let readiness = readiness.clone();
        let jetstream_url = config.jetstream_url.clone();
        let stall_timeout = config.stall_timeout;
        tokio::spawn(async move {
            if let Err(e) = firehose::run(jetstream_url, index, readiness, stall_timeout).await {
                tracing::error!(error = %e, "firehose consumer exited");
            }
        });
    }

    {
        let index = index.clone();
        let identity = identity.clone();
        let public_xrpc = public_xrpc.clone();
        tokio::spawn(async move {
            while let Some(did) = auth_rx.recv().await {
                if let Err(e) = index.mark_known_did(&did) {
                    tracing::warn!(error = %e, %did, "failed to register DID for feed");
                    continue;
                }
                let resolved_did = match jacquard_common::types::string::Did::new_owned(did.clone()) {
                    Ok(d) => d,
                    Err(e) => {
                        tracing::warn!(error = %e, %did, "login DID failed to parse, skipping backfill");
                        continue;
                    }
                };
                let pds_url = match identity.resolve_pds(&resolved_did).await {
                    Ok(url) => url,
                    Err(e) => {
                        tracing::warn!(error = %e, %did, "could not resolve PDS for backfill");
                        continue;
                    }
                };
                if let Err(e) = index
                    .backfill_did(&did, pds_url.as_str(), &public_xrpc, lexicons::nsid::ALL)
                    .await
                {
                    tracing::warn!(error = %e, %did, "backfill failed");
                }
            }
        });
    }

    let state = AppState {
        config: config.clone(),
        oauth,
        identity,
        public_xrpc,
        authed_xrpc,
        cache,
        index,
        feed,
        sessions_db,
        readiness,
    };

    let app = Router::new()
        .route("/auth/login", post(http::post_auth_login))
        .route("/oauth/callback", get(http::get_oauth_callback))
        .route("/logout", post(http::post_logout))
        .route("/client-metadata.json", get(http::get_client_metadata))
        .route(
            "/.well-known/oauth-client-metadata",
            get(http::get_client_metadata),
        )
        .route("/api/me", get(http::get_api_me))
        .route("/api/data", get(http::get_api_data))
        .route("/api/feed-json", get(http::get_api_feed))
        .route("/api/profile-json/{actor}", get(http::get_api_profile))
        .route("/api/{collection}", post(http::post_collection))
        .route(
            "/api/{collection}/{rkey}",
            axum::routing::get(http::get_collection_record)
                .put(http::put_collection_record)
                .delete(http::delete_collection_record),
        )
        .route("/healthz", get(http::get_healthz))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .into_diagnostic()?;
    tracing::info!(addr = %listener.local_addr().into_diagnostic()?, "listening");

    axum::serve(listener, app).await.into_diagnostic()?;

    Ok(())
}
