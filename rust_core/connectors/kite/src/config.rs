use std::env;
use std::str::FromStr;
use std::time::Duration;

use connectors_common::{ConnectorError, Result};
use serde::Deserialize;
use url::Url;

use crate::session::ReconnectPolicy;

pub const KITE_WS_ENDPOINT: &str = "wss://ws.kite.trade";

const SECRET_PARAMS: [&str; 3] = ["access_token", "enctoken", "api_key"];

/// Connection settings. The endpoint already carries its credentials.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FeedConfig {
    pub url: String,
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Silence longer than this is treated as a dead socket.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

fn default_reconnect_base_ms() -> u64 {
    1000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_read_timeout_ms() -> u64 {
    5_000
}

impl FeedConfig {
    pub fn new(url: impl Into<String>) -> Self {
        FeedConfig {
            url: url.into(),
            reconnect_base_ms: default_reconnect_base_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }

    pub fn kite_connect(api_key: &str, access_token: &str) -> Result<Self> {
        let mut url = Url::parse(KITE_WS_ENDPOINT)
            .map_err(|e| ConnectorError::Config(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("api_key", api_key)
            .append_pair("access_token", access_token);
        Ok(Self::new(url.to_string()))
    }

    /// `KITE_WS_URL`, or `KITE_API_KEY` with `KITE_ACCESS_TOKEN`, plus
    /// optional `KITE_*` overrides for the timing fields.
    pub fn from_env() -> Result<Self> {
        let mut config = match env::var("KITE_WS_URL") {
            Ok(url) if !url.trim().is_empty() => Self::new(url.trim()),
            _ => {
                let api_key = required("KITE_API_KEY")?;
                let access_token = required("KITE_ACCESS_TOKEN")?;
                Self::kite_connect(&api_key, &access_token)?
            }
        };
        if let Some(v) = optional("KITE_RECONNECT_BASE_MS")? {
            config.reconnect_base_ms = v;
        }
        if let Some(v) = optional("KITE_MAX_RECONNECT_ATTEMPTS")? {
            config.max_reconnect_attempts = v;
        }
        if let Some(v) = optional("KITE_CONNECT_TIMEOUT_MS")? {
            config.connect_timeout_ms = v;
        }
        if let Some(v) = optional("KITE_READ_TIMEOUT_MS")? {
            config.read_timeout_ms = v;
        }
        Ok(config)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.reconnect_base_ms),
            max_attempts: self.max_reconnect_attempts,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// The endpoint with credential query values masked, for logs.
    pub fn redacted_url(&self) -> String {
        let mut url = match Url::parse(&self.url) {
            Ok(url) => url,
            Err(_) => return "<invalid url>".to_string(),
        };
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| {
                let v = if SECRET_PARAMS.contains(&k.as_ref()) {
                    "***".to_string()
                } else {
                    v.into_owned()
                };
                (k.into_owned(), v)
            })
            .collect();
        if !pairs.is_empty() {
            url.query_pairs_mut().clear().extend_pairs(pairs);
        }
        url.to_string()
    }
}

fn required(key: &str) -> Result<String> {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ConnectorError::Config(format!("{} is not set", key)))
}

fn optional<T: FromStr>(key: &str) -> Result<Option<T>> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| {
                ConnectorError::Config(format!("{} is not a valid number: {:?}", key, raw))
            }),
        Err(_) => Ok(None),
    }
}
