//! Forwarder engine: wires the registry, counters, listeners and persistence

use portquota_config::{Config, ConfigStore};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

use crate::accounting::ConnectionCounter;
use crate::error::ForwardError;
use crate::handler::{ConnectionHandler, Route};
use crate::listener::{ListenerHandle, ListenerSupervisor};
use crate::persistence::{PersistenceScheduler, Persister};
use crate::registry::RuleRegistry;

/// Runtime settings derived from the rule file
#[derive(Debug, Clone)]
pub struct ForwarderSettings {
    /// Address every listener binds on
    pub bind_ip: IpAddr,
    pub idle_timeout: Option<Duration>,
    pub save_interval: Duration,
}

impl ForwarderSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            idle_timeout: config.idle_timeout(),
            save_interval: config.save_interval(),
        }
    }

    pub fn with_bind_ip(mut self, bind_ip: IpAddr) -> Self {
        self.bind_ip = bind_ip;
        self
    }
}

/// A forwarder that has not started listening yet
pub struct Forwarder {
    settings: ForwarderSettings,
    registry: Arc<RuleRegistry>,
    counter: Arc<ConnectionCounter>,
    persister: Arc<Persister>,
}

impl Forwarder {
    pub fn new(config: Config, store: ConfigStore) -> Self {
        let settings = ForwarderSettings::from_config(&config);
        let registry = Arc::new(RuleRegistry::new(config.rules.clone()));
        let counter = Arc::new(ConnectionCounter::new(config.rules.len()));
        let persister = Arc::new(Persister::new(store, config, registry.clone()));

        Self {
            settings,
            registry,
            counter,
            persister,
        }
    }

    pub fn with_settings(mut self, settings: ForwarderSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn registry(&self) -> &Arc<RuleRegistry> {
        &self.registry
    }

    /// Start a listener per rule and the persistence scheduler
    ///
    /// Returns the first bind failure; listeners started before it are
    /// stopped again.
    pub async fn start(self) -> Result<RunningForwarder, ForwardError> {
        match self.settings.idle_timeout {
            Some(timeout) => info!(timeout_secs = timeout.as_secs(), "Set idle timeout"),
            None => info!("Disabled idle timeout"),
        }

        let handler = ConnectionHandler::new(
            self.registry.clone(),
            self.counter.clone(),
            self.settings.idle_timeout,
        );

        let mut listeners = Vec::with_capacity(self.registry.len());
        for (index, rule) in self.registry.snapshot().iter().enumerate() {
            let supervisor = ListenerSupervisor::new(
                Route::from_rule(index, rule),
                self.settings.bind_ip,
                self.registry.clone(),
                handler.clone(),
                self.persister.clone(),
            );

            match supervisor.start().await {
                Ok(handle) => listeners.push(handle),
                Err(e) => {
                    for listener in &listeners {
                        listener.abort();
                    }
                    return Err(e);
                }
            }
        }

        let scheduler =
            PersistenceScheduler::spawn(self.persister.clone(), self.settings.save_interval);

        Ok(RunningForwarder {
            registry: self.registry,
            counter: self.counter,
            persister: self.persister,
            listeners,
            scheduler,
        })
    }
}

/// A forwarder with its listeners running
pub struct RunningForwarder {
    registry: Arc<RuleRegistry>,
    counter: Arc<ConnectionCounter>,
    persister: Arc<Persister>,
    listeners: Vec<ListenerHandle>,
    scheduler: JoinHandle<()>,
}

impl RunningForwarder {
    pub fn registry(&self) -> &Arc<RuleRegistry> {
        &self.registry
    }

    pub fn counter(&self) -> &Arc<ConnectionCounter> {
        &self.counter
    }

    /// Listener handles in rule order
    pub fn listeners(&self) -> &[ListenerHandle] {
        &self.listeners
    }

    pub fn listener_mut(&mut self, index: usize) -> Option<&mut ListenerHandle> {
        self.listeners.get_mut(index)
    }

    /// Persist the current quota right away
    pub async fn save(&self) -> bool {
        self.persister.save().await
    }

    /// Stop accepting and the scheduler, then optionally save one last time
    ///
    /// Connections that are still relaying are not waited for.
    pub async fn shutdown(self, save: bool) {
        self.scheduler.abort();
        for listener in &self.listeners {
            listener.abort();
        }
        if save {
            self.persister.save().await;
        }
    }
}
