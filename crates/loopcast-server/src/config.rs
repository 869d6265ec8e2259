use std::{net::SocketAddr, path::PathBuf};

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

const DEFAULT_BIND: &str = "0.0.0.0:5000";
const DEFAULT_DATA_ROOT: &str = "./data";
const DEFAULT_MAX_UPLOAD_BYTES: u64 = 1024 * 1024 * 1024; // 1 GiB

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_allowed_origins(raw: &str) -> Vec<String> {
    // Examples:
    // - LOOPCAST_ALLOWED_ORIGINS=*
    // - LOOPCAST_ALLOWED_ORIGINS=https://panel.example.com,https://studio.example.com
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub data_root: PathBuf,
    pub max_upload_bytes: u64,
    pub allowed_origins: Vec<String>,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let bind_raw = env_non_empty("LOOPCAST_BIND").unwrap_or_else(|| DEFAULT_BIND.to_string());
        let bind = bind_raw
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid LOOPCAST_BIND: {bind_raw}"))?;

        let data_root = env_non_empty("LOOPCAST_DATA_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_ROOT));

        let max_upload_bytes = env_u64("LOOPCAST_MAX_UPLOAD_BYTES")
            .map(|v| v.clamp(1024 * 1024, 64 * 1024 * 1024 * 1024))
            .unwrap_or(DEFAULT_MAX_UPLOAD_BYTES);

        let allowed_origins = parse_allowed_origins(
            &env_non_empty("LOOPCAST_ALLOWED_ORIGINS").unwrap_or_else(|| "*".to_string()),
        );

        Ok(Self {
            bind,
            data_root,
            max_upload_bytes,
            allowed_origins,
        })
    }

    pub fn videos_dir(&self) -> PathBuf {
        self.data_root.join("videos")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.data_root.join("sessions")
    }

    pub fn cors_layer(&self) -> CorsLayer {
        let base = CorsLayer::new()
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers(Any);

        if self.allowed_origins.is_empty() || self.allowed_origins.iter().any(|o| o == "*") {
            return base.allow_origin(Any);
        }

        let origins: Vec<HeaderValue> = self
            .allowed_origins
            .iter()
            .filter_map(|o| match HeaderValue::from_str(o) {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!(origin = %o, "ignoring invalid CORS origin");
                    None
                }
            })
            .collect();
        base.allow_origin(AllowOrigin::list(origins))
    }
}
