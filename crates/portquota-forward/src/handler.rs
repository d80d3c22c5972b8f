//! Connection handler
//!
//! Admits an accepted connection against the rule's concurrency cap, dials the
//! upstream target and starts the two relay directions.

use portquota_config::Rule;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::accounting::ConnectionCounter;
use crate::registry::RuleRegistry;
use crate::relay::{run_relay, ConnectionLink, Direction, RelayContext, RelayOutcome};
use crate::FLOOD_TARGET;

/// The fixed part of a rule a listener forwards by
#[derive(Debug, Clone)]
pub struct Route {
    pub index: usize,
    pub label: String,
    pub listen_port: u16,
    pub forward: String,
    pub max_simultaneous: u32,
}

impl Route {
    pub fn from_rule(index: usize, rule: &Rule) -> Self {
        Self {
            index,
            label: rule.label(),
            listen_port: rule.listen_port,
            forward: rule.forward.clone(),
            max_simultaneous: rule.simultaneous,
        }
    }
}

/// What happened to an accepted connection
#[derive(Debug)]
pub enum Handled {
    /// Concurrency cap reached, closed without dialing
    Rejected,
    /// Upstream unreachable, closed
    DialFailed,
    /// Upstream dialed but the socket pair could not be set up, both closed
    SetupFailed,
    /// Both directions are running
    Relaying(RelayPair),
}

/// The two relay tasks of one connection
#[derive(Debug)]
pub struct RelayPair {
    pub to_upstream: JoinHandle<RelayOutcome>,
    pub to_client: JoinHandle<RelayOutcome>,
}

impl RelayPair {
    /// Wait for both directions and return the bytes each one wrote
    /// (client to upstream, upstream to client)
    pub async fn join(self) -> (u64, u64) {
        let (up, down) = tokio::join!(self.to_upstream, self.to_client);
        (
            up.map(|o| o.written).unwrap_or(0),
            down.map(|o| o.written).unwrap_or(0),
        )
    }
}

/// Shared by every listener; cheap to clone
#[derive(Clone)]
pub struct ConnectionHandler {
    registry: Arc<RuleRegistry>,
    counter: Arc<ConnectionCounter>,
    idle_timeout: Option<Duration>,
}

impl ConnectionHandler {
    pub fn new(
        registry: Arc<RuleRegistry>,
        counter: Arc<ConnectionCounter>,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            registry,
            counter,
            idle_timeout,
        }
    }

    /// Serve one accepted connection
    ///
    /// Failures never leave this function: a rejected or undialable
    /// connection is simply closed.
    pub async fn handle(&self, inbound: TcpStream, peer: SocketAddr, route: &Route) -> Handled {
        let Some(slot) = self
            .counter
            .try_reserve(route.index, route.max_simultaneous)
        else {
            info!(
                target: FLOOD_TARGET,
                rule = %route.label,
                port = route.listen_port,
                peer = %peer,
                active = self.counter.live_connections(route.index),
                "Blocking new connection because the connection limit is reached"
            );
            return Handled::Rejected;
        };

        let upstream = match TcpStream::connect(&route.forward).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    rule = %route.label,
                    forward = %route.forward,
                    "Error on dialing remote host: {}",
                    e
                );
                return Handled::DialFailed;
            }
        };

        let link = match ConnectionLink::new(&inbound, &upstream) {
            Ok(link) => Arc::new(link),
            Err(e) => {
                warn!(
                    rule = %route.label,
                    peer = %peer,
                    "Connected to remote host but could not set up the relay: {}",
                    e
                );
                return Handled::SetupFailed;
            }
        };

        let (client_unit, upstream_unit) = slot.split();
        debug!(
            rule = %route.label,
            peer = %peer,
            forward = %route.forward,
            active = self.counter.live_connections(route.index),
            "Accepted connection"
        );

        let (client_read, client_write) = inbound.into_split();
        let (upstream_read, upstream_write) = upstream.into_split();

        let to_upstream = tokio::spawn(run_relay(
            client_read,
            upstream_write,
            RelayContext {
                registry: self.registry.clone(),
                link: link.clone(),
                unit: client_unit,
                idle_timeout: self.idle_timeout,
                direction: Direction::ClientToUpstream,
                peer,
            },
        ));

        let to_client = tokio::spawn(run_relay(
            upstream_read,
            client_write,
            RelayContext {
                registry: self.registry.clone(),
                link,
                unit: upstream_unit,
                idle_timeout: self.idle_timeout,
                direction: Direction::UpstreamToClient,
                peer,
            },
        ));

        Handled::Relaying(RelayPair {
            to_upstream,
            to_client,
        })
    }
}
