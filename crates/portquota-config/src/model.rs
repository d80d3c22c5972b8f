//! Rule file data model

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::store::ConfigError;

/// Save interval used when the file leaves it unset, zero or negative
pub const DEFAULT_SAVE_INTERVAL_SECS: u64 = 600;

/// A single forwarding rule as stored in the rule file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    /// Display label, has no effect on forwarding
    #[serde(default, alias = "Name")]
    pub name: String,

    /// Port to accept connections on
    #[serde(alias = "Listen")]
    pub listen_port: u16,

    /// Upstream address in `host:port` form
    #[serde(alias = "Forward")]
    pub forward: String,

    /// Remaining byte budget. Negative means the rule is exhausted.
    #[serde(default, alias = "Quota")]
    pub quota: i64,

    /// UTC epoch seconds after which the rule stops accepting, 0 = never
    #[serde(default, alias = "ExpireDate")]
    pub expire_at: i64,

    /// Maximum concurrent connections, 0 = unlimited
    #[serde(default, alias = "Simultaneous")]
    pub simultaneous: u32,
}

impl Rule {
    /// Label used in log lines: the name if present, the port otherwise
    pub fn label(&self) -> String {
        if self.name.is_empty() {
            format!(":{}", self.listen_port)
        } else {
            self.name.clone()
        }
    }
}

/// The whole rule file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Seconds between two persistence passes
    #[serde(default, alias = "SaveDuration")]
    pub save_interval_seconds: i64,

    /// Seconds a connection may stay idle; values <= 0 disable the timeout
    #[serde(default, alias = "Timeout")]
    pub idle_timeout_seconds: i64,

    /// Forwarding rules in file order. The position of a rule is its index
    /// for the lifetime of the process.
    #[serde(default, alias = "Rules")]
    pub rules: Vec<Rule>,
}

impl Config {
    /// Effective persistence interval
    pub fn save_interval(&self) -> Duration {
        if self.save_interval_seconds <= 0 {
            Duration::from_secs(DEFAULT_SAVE_INTERVAL_SECS)
        } else {
            Duration::from_secs(self.save_interval_seconds as u64)
        }
    }

    /// Effective idle timeout, `None` when disabled
    pub fn idle_timeout(&self) -> Option<Duration> {
        if self.idle_timeout_seconds <= 0 {
            None
        } else {
            Some(Duration::from_secs(self.idle_timeout_seconds as u64))
        }
    }

    /// Same settings with a different rule list, used when persisting quota
    pub fn with_rules(&self, rules: Vec<Rule>) -> Self {
        Self {
            save_interval_seconds: self.save_interval_seconds,
            idle_timeout_seconds: self.idle_timeout_seconds,
            rules,
        }
    }

    /// Check every rule's forward address
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (index, rule) in self.rules.iter().enumerate() {
            validate_forward(&rule.forward).map_err(|reason| ConfigError::InvalidForward {
                index,
                forward: rule.forward.clone(),
                reason,
            })?;
        }
        Ok(())
    }
}

/// Validate `host:port` form
fn validate_forward(addr: &str) -> Result<(), String> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| "expected format: host:port".to_string())?;

    if host.is_empty() {
        return Err("host cannot be empty".to_string());
    }

    port.parse::<u16>()
        .map_err(|_| format!("invalid port '{}'", port))?;

    Ok(())
}
