use std::env;
#[cfg(test)]
use std::sync::Mutex;

use url::Url;

use crate::negotiation::webrtc::DEFAULT_STUN_SERVER;
use crate::registry::RegistryConfig;

pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8080";
pub const DEFAULT_SLOT_COUNT: usize = 4;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid signaling url {url:?}: {source}")]
    InvalidUrl { url: String, source: url::ParseError },
}

/// Client configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Signaling endpoint shared by every slot
    pub signaling_url: String,
    pub slot_count: usize,
    /// ICE server URLs handed to each peer connection (empty means host candidates only)
    pub ice_servers: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let signaling_url = env::var("BEACH_CAMS_SIGNALING_URL")
            .map(|url| normalize_localhost(&url))
            .unwrap_or_else(|_| DEFAULT_SIGNALING_URL.to_string());

        let slot_count = env::var("BEACH_CAMS_SLOTS")
            .ok()
            .and_then(|raw| raw.trim().parse::<usize>().ok())
            .unwrap_or(DEFAULT_SLOT_COUNT)
            .max(1);

        let ice_servers = if env_truthy("BEACH_CAMS_DISABLE_STUN") {
            Vec::new()
        } else {
            match env::var("BEACH_CAMS_ICE_SERVERS") {
                Ok(raw) => raw
                    .split(',')
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .map(str::to_string)
                    .collect(),
                Err(_) => vec![DEFAULT_STUN_SERVER.to_string()],
            }
        };

        Self {
            signaling_url,
            slot_count,
            ice_servers,
        }
    }

    pub fn with_signaling_url(mut self, url: &str) -> Self {
        self.signaling_url = normalize_localhost(url);
        self
    }

    pub fn with_slot_count(mut self, slot_count: usize) -> Self {
        self.slot_count = slot_count.max(1);
        self
    }

    pub fn signaling_endpoint(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.signaling_url).map_err(|source| ConfigError::InvalidUrl {
            url: self.signaling_url.clone(),
            source,
        })
    }

    pub fn registry_config(&self) -> Result<RegistryConfig, ConfigError> {
        Ok(RegistryConfig {
            slot_count: self.slot_count,
            endpoint: self.signaling_endpoint()?,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            slot_count: DEFAULT_SLOT_COUNT,
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
        }
    }
}

// Resolve to IPv4 so macOS does not prefer ::1 for localhost.
fn normalize_localhost(url: &str) -> String {
    let url = url.trim();
    if url.contains("://localhost") {
        url.replacen("://localhost", "://127.0.0.1", 1)
    } else {
        url.to_string()
    }
}

pub(crate) fn env_truthy(var: &str) -> bool {
    env::var(var)
        .map(|v| v != "0" && !v.is_empty())
        .unwrap_or(false)
}
