//! Per-rule listener supervisor
//!
//! ```text
//! Starting ──(exhausted or expired)──────────────────────────► Stopped
//!    │
//!    └─(bind)─► Accepting ──(exhausted or expired)─► Draining ─► Stopped
//! ```
//!
//! The rule is re-checked after every accept. Once it is exhausted or expired
//! the listener is dropped for good; connections already relaying keep going
//! until they end on their own.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ForwardError;
use crate::handler::{ConnectionHandler, Route};
use crate::persistence::Persister;
use crate::registry::{RuleRegistry, RuleStatus};
use crate::now_epoch;

/// Lifecycle of a rule's listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Starting,
    Accepting,
    Draining,
    Stopped,
}

/// Why a listener stopped accepting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    QuotaExhausted,
    Expired,
}

impl StopReason {
    fn from_status(status: RuleStatus) -> Option<Self> {
        match status {
            RuleStatus::Active => None,
            RuleStatus::QuotaExhausted => Some(StopReason::QuotaExhausted),
            RuleStatus::Expired => Some(StopReason::Expired),
        }
    }
}

/// Owns one rule's accept loop
pub struct ListenerSupervisor {
    route: Route,
    bind_ip: IpAddr,
    registry: Arc<RuleRegistry>,
    handler: ConnectionHandler,
    persister: Arc<Persister>,
    state: watch::Sender<ListenerState>,
}

impl ListenerSupervisor {
    pub fn new(
        route: Route,
        bind_ip: IpAddr,
        registry: Arc<RuleRegistry>,
        handler: ConnectionHandler,
        persister: Arc<Persister>,
    ) -> Self {
        let (state, _) = watch::channel(ListenerState::Starting);
        Self {
            route,
            bind_ip,
            registry,
            handler,
            persister,
            state,
        }
    }

    /// Pre-flight check and bind
    ///
    /// A rule that is already exhausted or expired never binds its port. A
    /// bind failure is returned to the caller; it is fatal for the process.
    pub async fn start(self) -> Result<ListenerHandle, ForwardError> {
        let status = self.current_status();

        if let Some(reason) = StopReason::from_status(status) {
            match reason {
                StopReason::QuotaExhausted => info!(
                    rule = %self.route.label,
                    port = self.route.listen_port,
                    "Skip enabling forward because the quota is reached"
                ),
                StopReason::Expired => info!(
                    rule = %self.route.label,
                    port = self.route.listen_port,
                    "Skip enabling forward because this rule is expired"
                ),
            }
            self.state.send_replace(ListenerState::Stopped);
            return Ok(ListenerHandle {
                local_addr: None,
                state: self.state.subscribe(),
                task: None,
                stop_reason: Some(reason),
            });
        }

        let addr = SocketAddr::new(self.bind_ip, self.route.listen_port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ForwardError::Bind {
                rule: self.route.label.clone(),
                port: self.route.listen_port,
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr()?;

        info!(
            rule = %self.route.label,
            "Forwarding from {} to {}",
            local_addr,
            self.route.forward
        );

        self.state.send_replace(ListenerState::Accepting);
        let state = self.state.subscribe();
        let task = tokio::spawn(self.accept_loop(listener));

        Ok(ListenerHandle {
            local_addr: Some(local_addr),
            state,
            task: Some(task),
            stop_reason: None,
        })
    }

    fn current_status(&self) -> RuleStatus {
        // Indices come from the registry itself, so the lookup cannot miss
        self.registry
            .status(self.route.index, now_epoch())
            .unwrap_or(RuleStatus::Active)
    }

    async fn accept_loop(self, listener: TcpListener) -> StopReason {
        loop {
            let accepted = listener.accept().await;

            if let Some(reason) = StopReason::from_status(self.current_status()) {
                // Refuse the connection that woke us up
                drop(accepted);
                match reason {
                    StopReason::QuotaExhausted => warn!(
                        rule = %self.route.label,
                        port = self.route.listen_port,
                        forward = %self.route.forward,
                        "Quota reached"
                    ),
                    StopReason::Expired => warn!(
                        rule = %self.route.label,
                        port = self.route.listen_port,
                        forward = %self.route.forward,
                        "Expire date reached"
                    ),
                }

                self.persister.save().await;

                self.state.send_replace(ListenerState::Draining);
                drop(listener);
                self.state.send_replace(ListenerState::Stopped);
                debug!(rule = %self.route.label, "Listener stopped");
                return reason;
            }

            match accepted {
                Ok((stream, peer)) => {
                    let handler = self.handler.clone();
                    let route = self.route.clone();
                    tokio::spawn(async move {
                        handler.handle(stream, peer, &route).await;
                    });
                }
                Err(e) => {
                    warn!(
                        rule = %self.route.label,
                        "Error on accepting connection: {}",
                        e
                    );
                }
            }
        }
    }
}

/// Handle to a started (or skipped) listener
#[derive(Debug)]
pub struct ListenerHandle {
    local_addr: Option<SocketAddr>,
    state: watch::Receiver<ListenerState>,
    task: Option<JoinHandle<StopReason>>,
    stop_reason: Option<StopReason>,
}

impl ListenerHandle {
    /// Bound address, `None` if the rule was skipped at startup
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    /// Wait for the listener to stop and report why
    ///
    /// Returns `None` if the accept loop was aborted.
    pub async fn wait_stopped(&mut self) -> Option<StopReason> {
        if let Some(task) = self.task.take() {
            self.stop_reason = task.await.ok();
        }
        self.stop_reason
    }

    /// Stop accepting immediately; used at shutdown
    pub fn abort(&self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}
