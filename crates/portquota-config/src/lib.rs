//! Configuration for the portquota forwarder
//!
//! The rule file is a single JSON document holding the save interval, the idle
//! timeout and the ordered list of forwarding rules. It is read once at startup
//! and rewritten periodically with the remaining quota of every rule.

mod model;
mod store;

pub use model::{Config, Rule, DEFAULT_SAVE_INTERVAL_SECS};
pub use store::{ConfigError, ConfigStore};
