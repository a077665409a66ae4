//! Configuration management for the rate limiter.
//!
//! Configuration files describe the backend as a flat section (a `type` tag
//! plus connection fields for either store). That shape is resolved into the
//! tagged [`BackendConfig`] enum during validation, so a mismatched pairing is
//! rejected up front instead of being discovered on the first request.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{RateLimitError, Result};

/// Default MongoDB collection for rate limit records.
pub const DEFAULT_COLLECTION_NAME: &str = "rateLimitingLogs";
/// Default prefix prepended to every Redis key.
pub const DEFAULT_REDIS_KEY_PREFIX: &str = "rate_limit:";
/// Default retention for stored records, measured from window start.
pub const DEFAULT_RECORD_TTL_SECS: u64 = 86_400;
/// Largest accepted window or retention, in seconds.
pub const MAX_WINDOW_SECS: u64 = u32::MAX as u64;

/// Prefix for environment variable overrides, e.g. `QUOTAGUARD__MAX_REQUESTS`.
const ENV_PREFIX: &str = "QUOTAGUARD";

/// The two supported storage substrates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Mongodb,
    Redis,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Mongodb => write!(f, "mongodb"),
            BackendKind::Redis => write!(f, "redis"),
        }
    }
}

/// Backend section as written in configuration files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSettings {
    /// Which backend to use
    #[serde(rename = "type")]
    pub kind: BackendKind,

    /// MongoDB connection URL (required for `mongodb`)
    #[serde(default)]
    pub mongo_url: Option<String>,

    /// Redis connection URL (required for `redis`)
    #[serde(default)]
    pub redis_url: Option<String>,

    /// MongoDB collection name
    #[serde(default)]
    pub collection_name: Option<String>,

    /// Redis key prefix
    #[serde(default)]
    pub redis_key_prefix: Option<String>,
}

/// Resolved backend selection with its connection descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Document store backend
    Mongodb {
        url: String,
        collection_name: String,
    },
    /// Key-value store backend
    Redis { url: String, key_prefix: String },
}

impl BackendConfig {
    /// MongoDB backend using the default collection.
    pub fn mongodb(url: impl Into<String>) -> Self {
        BackendConfig::Mongodb {
            url: url.into(),
            collection_name: DEFAULT_COLLECTION_NAME.to_string(),
        }
    }

    /// Redis backend using the default key prefix.
    pub fn redis(url: impl Into<String>) -> Self {
        BackendConfig::Redis {
            url: url.into(),
            key_prefix: DEFAULT_REDIS_KEY_PREFIX.to_string(),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            BackendConfig::Mongodb { .. } => BackendKind::Mongodb,
            BackendConfig::Redis { .. } => BackendKind::Redis,
        }
    }

    pub fn url(&self) -> &str {
        match self {
            BackendConfig::Mongodb { url, .. } | BackendConfig::Redis { url, .. } => url,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.url().trim().is_empty() {
            return Err(RateLimitError::Configuration(format!(
                "{} connection URL must not be empty",
                self.kind()
            )));
        }

        match self {
            BackendConfig::Mongodb {
                collection_name, ..
            } if collection_name.trim().is_empty() => Err(RateLimitError::Configuration(
                "collection_name must not be empty".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

impl TryFrom<BackendSettings> for BackendConfig {
    type Error = RateLimitError;

    fn try_from(settings: BackendSettings) -> Result<Self> {
        let config = match settings.kind {
            BackendKind::Mongodb => {
                if settings.redis_url.is_some() || settings.redis_key_prefix.is_some() {
                    return Err(RateLimitError::Configuration(
                        "redis connection parameters given for a mongodb backend".to_string(),
                    ));
                }
                let url = settings.mongo_url.ok_or_else(|| {
                    RateLimitError::Configuration(
                        "mongo_url is required when backend type is \"mongodb\"".to_string(),
                    )
                })?;
                BackendConfig::Mongodb {
                    url,
                    collection_name: settings
                        .collection_name
                        .unwrap_or_else(|| DEFAULT_COLLECTION_NAME.to_string()),
                }
            }
            BackendKind::Redis => {
                if settings.mongo_url.is_some() || settings.collection_name.is_some() {
                    return Err(RateLimitError::Configuration(
                        "mongodb connection parameters given for a redis backend".to_string(),
                    ));
                }
                let url = settings.redis_url.ok_or_else(|| {
                    RateLimitError::Configuration(
                        "redis_url is required when backend type is \"redis\"".to_string(),
                    )
                })?;
                BackendConfig::Redis {
                    url,
                    key_prefix: settings
                        .redis_key_prefix
                        .unwrap_or_else(|| DEFAULT_REDIS_KEY_PREFIX.to_string()),
                }
            }
        };

        config.validate()?;
        Ok(config)
    }
}

/// Rate limiter configuration as written in configuration files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterSettings {
    /// Maximum number of requests allowed in the window
    pub max_requests: u64,

    /// Window length in seconds
    pub window_seconds: u64,

    /// Storage backend selection
    pub backend: BackendSettings,

    /// Retention of stored records, measured from window start
    #[serde(default = "default_record_ttl")]
    pub record_ttl_seconds: u64,

    /// Message returned to rejected clients
    #[serde(default = "default_error_message")]
    pub error_message: String,

    /// Status code returned to rejected clients
    #[serde(default = "default_status_code")]
    pub status_code: u16,

    /// Whether adapters should attach rate limit headers
    #[serde(default = "default_include_headers")]
    pub include_headers: bool,
}

fn default_record_ttl() -> u64 {
    DEFAULT_RECORD_TTL_SECS
}

fn default_error_message() -> String {
    "Too many requests, please try again later.".to_string()
}

fn default_status_code() -> u16 {
    429
}

fn default_include_headers() -> bool {
    true
}

/// Validated rate limiter configuration with all defaults applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimiterConfig {
    pub max_requests: u64,
    pub window_seconds: u64,
    pub backend: BackendConfig,
    pub record_ttl_seconds: u64,
    pub error_message: String,
    pub status_code: u16,
    pub include_headers: bool,
}

impl RateLimiterConfig {
    /// Create a configuration with default adapter settings.
    ///
    /// The result is not validated until it is handed to
    /// [`RateLimiter::new`](crate::ratelimit::RateLimiter::new) or
    /// [`validate`](Self::validate) is called.
    pub fn new(backend: BackendConfig, max_requests: u64, window_seconds: u64) -> Self {
        Self {
            max_requests,
            window_seconds,
            backend,
            record_ttl_seconds: default_record_ttl(),
            error_message: default_error_message(),
            status_code: default_status_code(),
            include_headers: default_include_headers(),
        }
    }

    pub fn with_record_ttl(mut self, seconds: u64) -> Self {
        self.record_ttl_seconds = seconds;
        self
    }

    pub fn with_error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = message.into();
        self
    }

    pub fn with_status_code(mut self, status_code: u16) -> Self {
        self.status_code = status_code;
        self
    }

    pub fn with_headers(mut self, include_headers: bool) -> Self {
        self.include_headers = include_headers;
        self
    }

    /// Check invariants that every backend relies on.
    pub fn validate(&self) -> Result<()> {
        if self.window_seconds == 0 {
            return Err(RateLimitError::Configuration(
                "window_seconds must be greater than zero".to_string(),
            ));
        }
        if self.window_seconds > MAX_WINDOW_SECS {
            return Err(RateLimitError::Configuration(format!(
                "window_seconds must not exceed {MAX_WINDOW_SECS}"
            )));
        }
        if self.max_requests > i64::MAX as u64 {
            return Err(RateLimitError::Configuration(
                "max_requests is out of range".to_string(),
            ));
        }
        if self.record_ttl_seconds < self.window_seconds {
            return Err(RateLimitError::Configuration(format!(
                "record_ttl_seconds ({}) must be at least window_seconds ({})",
                self.record_ttl_seconds, self.window_seconds
            )));
        }
        if self.record_ttl_seconds > MAX_WINDOW_SECS {
            return Err(RateLimitError::Configuration(format!(
                "record_ttl_seconds must not exceed {MAX_WINDOW_SECS}"
            )));
        }
        if !(100..=599).contains(&self.status_code) {
            return Err(RateLimitError::Configuration(format!(
                "status_code {} is not a valid HTTP status",
                self.status_code
            )));
        }
        self.backend.validate()
    }

    /// Load configuration from a file, layered with `QUOTAGUARD__*` environment overrides.
    ///
    /// The format is picked from the file extension (YAML, TOML, JSON).
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limiter configuration");

        let settings: RateLimiterSettings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.try_into()
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let settings: RateLimiterSettings = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()?
            .try_deserialize()?;

        settings.try_into()
    }
}

impl TryFrom<RateLimiterSettings> for RateLimiterConfig {
    type Error = RateLimitError;

    fn try_from(settings: RateLimiterSettings) -> Result<Self> {
        let config = Self {
            max_requests: settings.max_requests,
            window_seconds: settings.window_seconds,
            backend: settings.backend.try_into()?,
            record_ttl_seconds: settings.record_ttl_seconds,
            error_message: settings.error_message,
            status_code: settings.status_code,
            include_headers: settings.include_headers,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_redis_defaults() {
        let yaml = r#"
max_requests: 10
window_seconds: 60
backend:
  type: redis
  redis_url: "redis://localhost:6379"
"#;
        let config = RateLimiterConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.max_requests, 10);
        assert_eq!(config.window_seconds, 60);
        assert_eq!(config.record_ttl_seconds, DEFAULT_RECORD_TTL_SECS);
        assert_eq!(config.status_code, 429);
        assert!(config.include_headers);
        assert_eq!(
            config.backend,
            BackendConfig::Redis {
                url: "redis://localhost:6379".to_string(),
                key_prefix: DEFAULT_REDIS_KEY_PREFIX.to_string(),
            }
        );
    }

    #[test]
    fn test_yaml_mongodb_with_collection() {
        let yaml = r#"
max_requests: 3
window_seconds: 30
error_message: "slow down"
status_code: 503
include_headers: false
backend:
  type: mongodb
  mongo_url: "mongodb://localhost:27017/limits"
  collection_name: "apiLimits"
"#;
        let config = RateLimiterConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.error_message, "slow down");
        assert_eq!(config.status_code, 503);
        assert!(!config.include_headers);
        assert_eq!(
            config.backend,
            BackendConfig::Mongodb {
                url: "mongodb://localhost:27017/limits".to_string(),
                collection_name: "apiLimits".to_string(),
            }
        );
    }

    #[test]
    fn test_redis_without_url_is_rejected() {
        let yaml = r#"
max_requests: 3
window_seconds: 30
backend:
  type: redis
"#;
        let err = RateLimiterConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, RateLimitError::Configuration(_)));
    }

    #[test]
    fn test_mismatched_connection_is_rejected() {
        let settings = BackendSettings {
            kind: BackendKind::Redis,
            mongo_url: Some("mongodb://localhost:27017".to_string()),
            redis_url: None,
            collection_name: None,
            redis_key_prefix: None,
        };

        let err = BackendConfig::try_from(settings).unwrap_err();
        assert!(matches!(err, RateLimitError::Configuration(_)));
    }

    #[test]
    fn test_zero_window_is_rejected() {
        let config = RateLimiterConfig::new(BackendConfig::redis("redis://localhost"), 5, 0);
        assert!(matches!(
            config.validate(),
            Err(RateLimitError::Configuration(_))
        ));
    }

    #[test]
    fn test_zero_max_requests_is_accepted() {
        let config = RateLimiterConfig::new(BackendConfig::redis("redis://localhost"), 0, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ttl_shorter_than_window_is_rejected() {
        let config = RateLimiterConfig::new(BackendConfig::mongodb("mongodb://localhost"), 5, 120)
            .with_record_ttl(60);
        assert!(matches!(
            config.validate(),
            Err(RateLimitError::Configuration(_))
        ));
    }

    #[test]
    fn test_empty_url_is_rejected() {
        let config = RateLimiterConfig::new(BackendConfig::mongodb("  "), 5, 60);
        assert!(matches!(
            config.validate(),
            Err(RateLimitError::Configuration(_))
        ));
    }
}
