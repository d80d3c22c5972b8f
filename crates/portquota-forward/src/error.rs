use thiserror::Error;

/// Forwarding engine errors
///
/// Only startup failures surface here. Per-connection problems are logged and
/// contained by the connection handler and the relays.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind port {port} for rule '{rule}': {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different port in the rule file")]
    Bind {
        rule: String,
        port: u16,
        reason: String,
    },
}
