use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::models::FeedType;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub store: StoreConfig,
    pub feed: FeedConfig,
    pub ingest: IngestConfig,
    pub api_server: ServerConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Redis,
    Memory,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    pub base_url: String,
    pub version: String,
    #[serde(skip_serializing, default)]
    pub api_token: String,
    pub feed_type: FeedType,
    pub realtime_enabled: bool,
    pub ipv6_enabled: bool,
    pub poll_interval_secs: u64,
}

impl FeedConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl fmt::Debug for FeedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedConfig")
            .field("base_url", &self.base_url)
            .field("version", &self.version)
            .field("api_token", &"<redacted>")
            .field("feed_type", &self.feed_type)
            .field("realtime_enabled", &self.realtime_enabled)
            .field("ipv6_enabled", &self.ipv6_enabled)
            .field("poll_interval_secs", &self.poll_interval_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub workers: usize,
    pub chunk_size: usize,
    pub ttl_hours: u64,
}

impl IngestConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_hours * 60 * 60)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Tokens accepted in the `TOKEN` header of lookup requests
    #[serde(skip_serializing, default)]
    pub local_tokens: Vec<String>,
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("local_tokens", &format_args!("<{} redacted>", self.local_tokens.len()))
            .finish()
    }
}

fn parse_bool(key: &str, value: &str) -> anyhow::Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => bail!("invalid {key}: expected a boolean, got '{other}'"),
    }
}

fn parse_number<T>(key: &str, value: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse::<T>()
        .with_context(|| format!("invalid {key}: '{value}'"))
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from any variable source
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let backend = match var("IPFEED_STORE_BACKEND").as_deref().map(str::to_lowercase) {
            None => StoreBackend::Redis,
            Some(value) if value == "redis" => StoreBackend::Redis,
            Some(value) if value == "memory" => StoreBackend::Memory,
            Some(other) => {
                bail!("invalid IPFEED_STORE_BACKEND '{other}', supported values: redis, memory")
            }
        };
        let store_url =
            var("IPFEED_REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379/0".to_string());

        let api_token = var("IPFEED_API_TOKEN").context("IPFEED_API_TOKEN must be set")?;
        let feed_type = match var("IPFEED_FEED_TYPE") {
            Some(value) => value
                .parse::<FeedType>()
                .context("invalid IPFEED_FEED_TYPE")?,
            None => FeedType::Anonymous,
        };
        let realtime_enabled = match var("IPFEED_REALTIME_ENABLED") {
            Some(value) => parse_bool("IPFEED_REALTIME_ENABLED", &value)?,
            None => false,
        };
        let ipv6_enabled = match var("IPFEED_IPV6_ENABLED") {
            Some(value) => parse_bool("IPFEED_IPV6_ENABLED", &value)?,
            None => false,
        };
        if ipv6_enabled && feed_type.ipv6_companion().is_none() {
            bail!("IPFEED_IPV6_ENABLED is set but feed type '{feed_type}' has no IPv6 feed");
        }
        let poll_interval_secs = match var("IPFEED_POLL_INTERVAL_SECS") {
            Some(value) => parse_number::<u64>("IPFEED_POLL_INTERVAL_SECS", &value)?.max(1),
            None => 60,
        };

        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let requested_workers = match var("IPFEED_WORKERS") {
            Some(value) => parse_number::<usize>("IPFEED_WORKERS", &value)?,
            None => 1,
        };
        if requested_workers > cpus {
            tracing::warn!("IPFEED_WORKERS={requested_workers} exceeds the {cpus} available CPUs, using {cpus}");
        }
        let workers = requested_workers.clamp(1, cpus);

        let chunk_size = match var("IPFEED_CHUNK_SIZE") {
            Some(value) => parse_number::<usize>("IPFEED_CHUNK_SIZE", &value)?.max(1),
            None => 5000,
        };
        let ttl_hours = match var("IPFEED_TTL_HOURS") {
            Some(value) => parse_number::<u64>("IPFEED_TTL_HOURS", &value)?,
            None => 24,
        };

        let api_host = var("IPFEED_API_HOST").unwrap_or_else(|| "127.0.0.1".to_string());
        let api_port = match var("IPFEED_API_PORT") {
            Some(value) => parse_number::<u16>("IPFEED_API_PORT", &value)?,
            None => 8080,
        };

        let local_tokens = var("IPFEED_LOCAL_API_TOKENS")
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|token| !token.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Config {
            store: StoreConfig {
                backend,
                url: store_url,
            },
            feed: FeedConfig {
                base_url: var("IPFEED_FEED_BASE_URL")
                    .unwrap_or_else(|| "https://feeds.spur.us".to_string()),
                version: var("IPFEED_FEED_VERSION").unwrap_or_else(|| "v2".to_string()),
                api_token,
                feed_type,
                realtime_enabled,
                ipv6_enabled,
                poll_interval_secs,
            },
            ingest: IngestConfig {
                workers,
                chunk_size,
                ttl_hours,
            },
            api_server: ServerConfig {
                host: api_host,
                port: api_port,
            },
            auth: AuthConfig { local_tokens },
        })
    }
}
