//! Limit selection and exemptions.
//!
//! A [`Policy`] is built once from configuration and answers three questions
//! for each request: is the path exempt, which key is it counted under, and
//! which limit applies. It performs no I/O and is fully deterministic.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::key::KeyStrategy;
use crate::config::RateLimitingConfig;

/// A limit and the window it applies over.
///
/// Fields missing from configuration take the values of [`LimitRule::default`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitRule {
    /// Requests allowed per window
    pub requests: u64,
    /// Window length in seconds
    pub window_secs: u64,
}

impl LimitRule {
    /// Build a rule; sub-second windows round up to whole seconds.
    pub fn new(requests: u64, window: Duration) -> Self {
        let window_secs = window
            .as_secs()
            .saturating_add(u64::from(window.subsec_nanos() > 0));
        Self {
            requests,
            window_secs,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for LimitRule {
    fn default() -> Self {
        Self {
            requests: 100,
            window_secs: 60,
        }
    }
}

/// Caller classification and key derivation.
#[derive(Debug, Clone)]
pub struct Policy {
    strategy: KeyStrategy,
    authenticated: LimitRule,
    anonymous: LimitRule,
    exempt_paths: HashSet<String>,
}

impl Policy {
    /// Build a policy from configuration.
    ///
    /// Missing class-specific limits fall back to the default limit.
    pub fn from_config(config: &RateLimitingConfig) -> Self {
        Self {
            strategy: config.key_strategy,
            authenticated: config.authenticated.unwrap_or(config.default),
            anonymous: config.anonymous.unwrap_or(config.default),
            exempt_paths: config.exempt_paths.iter().cloned().collect(),
        }
    }

    /// Whether `path` bypasses admission control. Exact match only.
    pub fn is_exempt(&self, path: &str) -> bool {
        self.exempt_paths.contains(path)
    }

    /// Counting key for a caller.
    pub fn key_for(&self, origin: &str, identity: Option<&str>) -> String {
        self.strategy.key_for(origin, identity)
    }

    /// Limit for a caller: authenticated when an identity is present.
    pub fn limits_for(&self, identity: Option<&str>) -> LimitRule {
        match identity {
            Some(id) if !id.is_empty() => self.authenticated,
            _ => self.anonymous,
        }
    }

    pub fn strategy(&self) -> KeyStrategy {
        self.strategy
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self::from_config(&RateLimitingConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> RateLimitingConfig {
        RateLimitingConfig {
            default: LimitRule::new(100, Duration::from_secs(60)),
            authenticated: Some(LimitRule::new(1000, Duration::from_secs(60))),
            anonymous: Some(LimitRule::new(10, Duration::from_secs(30))),
            exempt_paths: vec!["/health".to_string()],
            key_strategy: KeyStrategy::IpUser,
            ..RateLimitingConfig::default()
        }
    }

    #[test]
    fn test_exempt_paths_match_exactly() {
        let policy = Policy::from_config(&test_config());

        assert!(policy.is_exempt("/health"));
        assert!(!policy.is_exempt("/health/"));
        assert!(!policy.is_exempt("/healthz"));
        assert!(!policy.is_exempt("/api/health"));
    }

    #[test]
    fn test_limits_by_caller_class() {
        let policy = Policy::from_config(&test_config());

        assert_eq!(policy.limits_for(Some("u1")).requests, 1000);
        assert_eq!(policy.limits_for(None).requests, 10);
        assert_eq!(policy.limits_for(Some("")).requests, 10);
        assert_eq!(policy.limits_for(None).window(), Duration::from_secs(30));
    }

    #[test]
    fn test_class_limits_fall_back_to_default() {
        let config = RateLimitingConfig {
            default: LimitRule::new(42, Duration::from_secs(5)),
            ..RateLimitingConfig::default()
        };
        let policy = Policy::from_config(&config);

        assert_eq!(policy.limits_for(Some("u1")), LimitRule::new(42, Duration::from_secs(5)));
        assert_eq!(policy.limits_for(None), LimitRule::new(42, Duration::from_secs(5)));
    }

    #[test]
    fn test_key_uses_configured_strategy() {
        let policy = Policy::from_config(&test_config());

        assert_eq!(policy.key_for("10.0.0.1", Some("")), "ip:10.0.0.1");
        assert_eq!(policy.key_for("10.0.0.1", Some("u1")), "ip_user:10.0.0.1:u1");
        assert_eq!(policy.strategy(), KeyStrategy::IpUser);
    }

    #[test]
    fn test_sub_second_windows_round_up() {
        assert_eq!(LimitRule::new(5, Duration::from_millis(500)).window(), Duration::from_secs(1));
        assert_eq!(LimitRule::new(5, Duration::from_millis(1500)).window(), Duration::from_secs(2));
        assert_eq!(LimitRule::new(5, Duration::from_secs(3)).window_secs, 3);
        assert_eq!(LimitRule::new(5, Duration::MAX).window_secs, u64::MAX);
    }

    #[test]
    fn test_partial_rule_takes_defaults() {
        let rule: LimitRule = serde_yaml::from_str("requests: 7").unwrap();
        assert_eq!(rule, LimitRule { requests: 7, window_secs: 60 });

        let rule: LimitRule = serde_yaml::from_str("window_secs: 5").unwrap();
        assert_eq!(rule, LimitRule { requests: 100, window_secs: 5 });
    }
}
