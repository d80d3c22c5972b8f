//! Rule registry
//!
//! Holds the ordered rule list for the lifetime of the process. Rules are
//! addressed by their position in the rule file, which never changes. The only
//! mutation is quota consumption by finished relays; it may drive a quota below
//! zero, which is how exhaustion is signalled.

use portquota_config::Rule;
use std::sync::{PoisonError, RwLock};

/// Admission verdict for a rule at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleStatus {
    Active,
    QuotaExhausted,
    Expired,
}

impl RuleStatus {
    /// Evaluate quota and expiry against `now` (UTC epoch seconds)
    pub fn check(quota: i64, expire_at: i64, now: i64) -> Self {
        if quota < 0 {
            RuleStatus::QuotaExhausted
        } else if expire_at != 0 && now >= expire_at {
            RuleStatus::Expired
        } else {
            RuleStatus::Active
        }
    }

    pub fn is_active(self) -> bool {
        self == RuleStatus::Active
    }
}

/// Thread-safe rule list
///
/// Read-heavy: every accepted connection takes the read lock, every finished
/// relay takes the write lock once.
#[derive(Debug)]
pub struct RuleRegistry {
    rules: RwLock<Vec<Rule>>,
}

impl RuleRegistry {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self {
            rules: RwLock::new(rules),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Copy of a single rule
    #[cfg(test)]
    pub(crate) fn rule(&self, index: usize) -> Option<Rule> {
        let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner);
        rules.get(index).cloned()
    }

    /// Current quota and expiry date of a rule
    pub fn quota_and_expiry(&self, index: usize) -> Option<(i64, i64)> {
        let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner);
        rules.get(index).map(|rule| (rule.quota, rule.expire_at))
    }

    /// Admission verdict of a rule right now
    pub fn status(&self, index: usize, now: i64) -> Option<RuleStatus> {
        self.quota_and_expiry(index)
            .map(|(quota, expire_at)| RuleStatus::check(quota, expire_at, now))
    }

    /// Charge transferred bytes to a rule's quota
    ///
    /// Returns the remaining quota. No clamping: the value goes negative once
    /// the budget is used up.
    pub fn consume(&self, index: usize, bytes: u64) -> Option<i64> {
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        let rule = rules.get_mut(index)?;
        let bytes = i64::try_from(bytes).unwrap_or(i64::MAX);
        rule.quota = rule.quota.saturating_sub(bytes);
        Some(rule.quota)
    }

    /// Ordered copy of every rule, used for persistence
    pub fn snapshot(&self) -> Vec<Rule> {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
