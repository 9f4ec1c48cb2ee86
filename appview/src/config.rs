//! Startup configuration, read from environment variables the way the
//! teacher's own `main()` reads `DATABASE_URL`/`PUBLIC_URL`/`BIND_ADDR` —
//! no config-file crate, just env reads with defaults at one call site.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub public_url: String,
    pub db_path: String,
    pub feed_index_path: String,
    pub profile_cache_ttl: Duration,
    pub jetstream_url: String,
    pub oauth_client_name: String,
    pub stall_timeout: Duration,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl Config {
    pub fn from_env() -> Self {
        let port = std::env::var("PORT").unwrap_or_else(|_| "18910".to_string());
        let bind_addr =
            std::env::var("BIND_ADDR").unwrap_or_else(|_| format!("0.0.0.0:{port}"));
        let public_url = std::env::var("SERVER_PUBLIC_URL")
            .unwrap_or_else(|_| format!("http://localhost:{port}"));

        Config {
            db_path: std::env::var("ARABICA_DB_PATH").unwrap_or_else(|_| "arabica-sessions.redb".into()),
            feed_index_path: std::env::var("ARABICA_FEED_INDEX_PATH")
                .unwrap_or_else(|_| "arabica-index.redb".into()),
            profile_cache_ttl: std::env::var("ARABICA_PROFILE_CACHE_TTL")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(300)),
            jetstream_url: std::env::var("ARABICA_JETSTREAM_URL")
                .unwrap_or_else(|_| "wss://jetstream2.us-east.bsky.network/subscribe".into()),
            oauth_client_name: std::env::var("ARABICA_OAUTH_CLIENT_NAME")
                .unwrap_or_else(|_| "Arabica".into()),
            stall_timeout: std::env::var("ARABICA_STALL_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(120)),
            log_format: match std::env::var("LOG_FORMAT").as_deref() {
                Ok("json") => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
            bind_addr,
            public_url,
        }
    }

    pub fn redirect_uri(&self) -> String {
        format!("{}/oauth/callback", self.public_url)
    }

    pub fn client_id_url(&self) -> String {
        format!("{}/client-metadata.json", self.public_url)
    }
}
