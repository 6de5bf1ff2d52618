//! Counting key derivation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TurnstileError;

/// How a caller's attributes map to the key its requests are counted under.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// Count per origin address
    #[default]
    Ip,
    /// Count per authenticated identity, falling back to the address
    User,
    /// Count per address and identity pair, falling back to the address
    IpUser,
}

impl KeyStrategy {
    /// Derive the counting key for a caller.
    ///
    /// An absent or empty identity makes `User` and `IpUser` behave like `Ip`.
    pub fn key_for(&self, origin: &str, identity: Option<&str>) -> String {
        let identity = identity.filter(|id| !id.is_empty());

        match (self, identity) {
            (KeyStrategy::User, Some(id)) => format!("user:{}", id),
            (KeyStrategy::IpUser, Some(id)) => format!("ip_user:{}:{}", origin, id),
            _ => format!("ip:{}", origin),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStrategy::Ip => "ip",
            KeyStrategy::User => "user",
            KeyStrategy::IpUser => "ip_user",
        }
    }
}

impl fmt::Display for KeyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyStrategy {
    type Err = TurnstileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ip" => Ok(KeyStrategy::Ip),
            "user" => Ok(KeyStrategy::User),
            "ip_user" => Ok(KeyStrategy::IpUser),
            other => Err(TurnstileError::Config(format!(
                "unknown key strategy: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_strategy() {
        assert_eq!(KeyStrategy::Ip.key_for("10.0.0.1", Some("u1")), "ip:10.0.0.1");
        assert_eq!(KeyStrategy::Ip.key_for("10.0.0.1", None), "ip:10.0.0.1");
    }

    #[test]
    fn test_user_strategy() {
        assert_eq!(KeyStrategy::User.key_for("10.0.0.1", Some("u1")), "user:u1");
        assert_eq!(KeyStrategy::User.key_for("10.0.0.1", None), "ip:10.0.0.1");
        assert_eq!(KeyStrategy::User.key_for("10.0.0.1", Some("")), "ip:10.0.0.1");
    }

    #[test]
    fn test_ip_user_strategy() {
        assert_eq!(
            KeyStrategy::IpUser.key_for("10.0.0.1", Some("u1")),
            "ip_user:10.0.0.1:u1"
        );
        assert_eq!(KeyStrategy::IpUser.key_for("10.0.0.1", Some("")), "ip:10.0.0.1");
    }

    #[test]
    fn test_parse_round_trip() {
        for strategy in [KeyStrategy::Ip, KeyStrategy::User, KeyStrategy::IpUser] {
            assert_eq!(strategy.to_string().parse::<KeyStrategy>().unwrap(), strategy);
        }
        assert!("cookie".parse::<KeyStrategy>().is_err());
    }

    #[test]
    fn test_serde_names() {
        let strategy: KeyStrategy = serde_yaml::from_str("ip_user").unwrap();
        assert_eq!(strategy, KeyStrategy::IpUser);
    }
}
