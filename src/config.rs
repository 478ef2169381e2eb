use std::env;
use std::path::PathBuf;
use std::time::Duration;

use dotenvy::dotenv;

use crate::constants::{
    DEFAULT_OLLAMA_URL, DEFAULT_PORT, DEFAULT_TOKEN_TTL_MINUTES, MAX_CONCURRENT_INFERENCE,
};

/// CORS configuration mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorsMode {
    /// Only allow localhost origins (default, for local development)
    LocalhostOnly,
    /// Allow all origins
    AllowAll,
    /// Allow specific origins (comma-separated list)
    AllowList(Vec<String>),
}

impl CorsMode {
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some("*") => CorsMode::AllowAll,
            Some(origins) if !origins.is_empty() => CorsMode::AllowList(
                origins
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            ),
            _ => CorsMode::LocalhostOnly,
        }
    }

    pub fn allows(&self, origin: &str) -> bool {
        match self {
            CorsMode::AllowAll => true,
            CorsMode::LocalhostOnly => {
                let Ok(url) = url::Url::parse(origin) else {
                    return false;
                };
                matches!(
                    url.host_str(),
                    Some("localhost") | Some("127.0.0.1") | Some("[::1]")
                )
            }
            CorsMode::AllowList(allowed) => allowed.iter().any(|a| a == origin),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub ollama_url: String,
    pub ollama_timeout: Duration,
    pub max_concurrent_inference: usize,
    pub cors_mode: CorsMode,
    pub token_ttl: Duration,
    /// `None` means a random per-process secret is generated at startup
    pub jwt_secret: Option<String>,
    pub open_registration: bool,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv().ok();

        let host = env::var("GATEWAY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = parse_env("GATEWAY_PORT").unwrap_or(DEFAULT_PORT);

        let db_path = env::var("DATABASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(|v| db_path_from_url(&v))
            .unwrap_or_else(|| {
                dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("ollama-gateway")
                    .join("gateway.db")
            });

        let ollama_url = env::var("OLLAMA_API_URL")
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|_| DEFAULT_OLLAMA_URL.to_string());
        let ollama_timeout = Duration::from_secs(parse_env("OLLAMA_TIMEOUT_SECS").unwrap_or(120));
        let max_concurrent_inference = concurrency_limit(parse_env("OLLAMA_MAX_CONCURRENCY"));

        // CORS configuration: unset (localhost only), "*" (allow all), or comma-separated origins
        let cors_mode = CorsMode::parse(env::var("GATEWAY_CORS_ORIGINS").ok().as_deref());

        let ttl_minutes =
            parse_env::<u64>("ACCESS_TOKEN_EXPIRE_MINUTES").unwrap_or(DEFAULT_TOKEN_TTL_MINUTES);
        let token_ttl = Duration::from_secs(ttl_minutes.saturating_mul(60));
        let jwt_secret = env::var("JWT_SECRET_KEY").ok().filter(|s| !s.is_empty());

        let open_registration = env::var("GATEWAY_OPEN_REGISTRATION")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(true);

        Self {
            host,
            port,
            db_path,
            ollama_url,
            ollama_timeout,
            max_concurrent_inference,
            cors_mode,
            token_ttl,
            jwt_secret,
            open_registration,
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// In-flight inference bound; zero would block every request
pub fn concurrency_limit(configured: Option<usize>) -> usize {
    match configured {
        Some(0) => {
            tracing::warn!("OLLAMA_MAX_CONCURRENCY=0 would block all inference; using 1");
            1
        }
        Some(n) => n,
        None => MAX_CONCURRENT_INFERENCE,
    }
}

/// Accepts a bare path or a `sqlite://` / `file:` URL
pub fn db_path_from_url(url: &str) -> PathBuf {
    let url = url.trim();
    let path = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("file:"))
        .unwrap_or(url);
    PathBuf::from(path)
}
