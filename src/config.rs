//! Layered configuration: defaults, optional file, then `RED_ROVER__*`
//! environment variables.

use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default lifetime of a claim record.
pub const DEFAULT_CLAIM_TTL_SECS: u64 = 300;

const DEFAULT_FILE: &str = "red_rover";
const ENV_PREFIX: &str = "RED_ROVER";

/// Connection settings for the Redis backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: Option<i64>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            db: None,
        }
    }
}

impl RedisConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoverConfig {
    /// Lifetime of a `<group>:<message-id>` claim.
    pub claim_ttl_secs: u64,
    /// Deadline after which pending command requests are evicted.
    /// `None` keeps them until cancelled.
    pub request_timeout_ms: Option<u64>,
    pub redis: RedisConfig,
}

impl Default for RoverConfig {
    fn default() -> Self {
        Self {
            claim_ttl_secs: DEFAULT_CLAIM_TTL_SECS,
            request_timeout_ms: None,
            redis: RedisConfig::default(),
        }
    }
}

impl RoverConfig {
    /// Load `red_rover.{toml,json,yaml}` from the working directory if present,
    /// then apply environment overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_FILE)
    }

    /// Like [`RoverConfig::load`] with an explicit file path (extension optional).
    pub fn load_from(path: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Parse a TOML document without touching the filesystem or environment.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn claim_ttl(&self) -> Duration {
        Duration::from_secs(self.claim_ttl_secs)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}
