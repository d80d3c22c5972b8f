//! Quota-limited TCP forwarding engine
//!
//! Every rule gets its own listener. Accepted connections are admitted against
//! the rule's quota, expiry date and connection cap, then relayed to the
//! upstream target by two tasks, one per direction. Bytes written by the
//! relays are charged to the rule's quota, which is persisted back to the rule
//! file on an interval.

pub mod accounting;
mod error;
pub mod forwarder;
pub mod handler;
pub mod listener;
pub mod persistence;
pub mod registry;
pub mod relay;

pub use accounting::{ConnectionCounter, ConnectionSlot, SlotUnit};
pub use error::ForwardError;
pub use forwarder::{Forwarder, ForwarderSettings, RunningForwarder};
pub use handler::{ConnectionHandler, Handled, RelayPair, Route};
pub use listener::{ListenerHandle, ListenerState, ListenerSupervisor, StopReason};
pub use persistence::{PersistenceScheduler, Persister};
pub use registry::{RuleRegistry, RuleStatus};
pub use relay::{ConnectionLink, Direction, RelayEnd, RelayOutcome};

/// Log target for connections refused by the concurrency cap
pub const FLOOD_TARGET: &str = "portquota::flood";

/// Log target for connections dropped by the idle timeout
pub const TIMEOUT_TARGET: &str = "portquota::timeout";

/// Current UTC time in epoch seconds
pub(crate) fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}
