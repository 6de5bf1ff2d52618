//! Configuration management for Turnstile.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{KeyStrategy, LimitRule};

/// Prefix for environment variable overrides, e.g.
/// `TURNSTILE__RATE_LIMITING__KEY_STRATEGY=user`.
const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Limit applied when no class-specific limit is configured
    #[serde(default)]
    pub default: LimitRule,

    /// Limit for callers with an authenticated identity
    #[serde(default)]
    pub authenticated: Option<LimitRule>,

    /// Limit for callers without an authenticated identity
    #[serde(default)]
    pub anonymous: Option<LimitRule>,

    /// Request paths that bypass admission control (exact match)
    #[serde(default)]
    pub exempt_paths: Vec<String>,

    /// How counting keys are derived
    #[serde(default)]
    pub key_strategy: KeyStrategy,

    /// Whether decisions carry rate limit header values
    #[serde(default = "default_true")]
    pub include_headers: bool,

    /// Whether denied requests consume a slot
    #[serde(default = "default_true")]
    pub count_denied: bool,

    /// Expired counter sweep interval in seconds
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            default: LimitRule::default(),
            authenticated: None,
            anonymous: None,
            exempt_paths: Vec::new(),
            key_strategy: KeyStrategy::default(),
            include_headers: true,
            count_denied: true,
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_cleanup_interval() -> u64 {
    60
}

/// Output format for log records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TurnstileConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file, overridden by
    /// `TURNSTILE__`-prefixed environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path));
        }
        let config: TurnstileConfig = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("rate_limiting.exempt_paths")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the limiter meaningless.
    pub fn validate(&self) -> Result<()> {
        let rl = &self.rate_limiting;
        let rules = [
            ("default", Some(&rl.default)),
            ("authenticated", rl.authenticated.as_ref()),
            ("anonymous", rl.anonymous.as_ref()),
        ];
        for (name, rule) in rules {
            let Some(rule) = rule else { continue };
            if rule.requests == 0 {
                return Err(TurnstileError::Config(format!(
                    "{} limit must allow at least one request",
                    name
                )));
            }
            if rule.window_secs == 0 {
                return Err(TurnstileError::Config(format!(
                    "{} window must be at least one second",
                    name
                )));
            }
        }
        if rl.cleanup_interval_secs == 0 {
            return Err(TurnstileError::Config(
                "cleanup interval must be at least one second".to_string(),
            ));
        }
        Ok(())
    }
}
