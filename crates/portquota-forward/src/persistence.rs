//! Persisting consumed quota back to the rule file

use portquota_config::{Config, ConfigStore};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, warn};

use crate::registry::RuleRegistry;

/// Writes registry snapshots into the rule file
///
/// Every save re-reads the registry, so whatever fired it (the scheduler, a
/// listener that just hit its quota, shutdown) writes the latest values.
pub struct Persister {
    store: ConfigStore,
    base: Arc<Config>,
    registry: Arc<RuleRegistry>,
    /// Held by the blocking writer for the whole snapshot-and-write, so an
    /// aborted save still finishes before the next one touches the file
    write_lock: Arc<Mutex<()>>,
}

impl Persister {
    /// `base` is the configuration as loaded; its settings are written back
    /// unchanged alongside the current rules.
    pub fn new(store: ConfigStore, base: Config, registry: Arc<RuleRegistry>) -> Self {
        Self {
            store,
            base: Arc::new(base),
            registry,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    #[cfg(test)]
    pub(crate) fn store(&self) -> &ConfigStore {
        &self.store
    }

    /// The configuration a save would write right now
    pub fn current_config(&self) -> Config {
        self.base.with_rules(self.registry.snapshot())
    }

    /// Write the current state; failures are logged and reported as `false`
    pub async fn save(&self) -> bool {
        let store = self.store.clone();
        let base = self.base.clone();
        let registry = self.registry.clone();
        let write_lock = self.write_lock.clone();

        let task = tokio::task::spawn_blocking(move || {
            let _guard = write_lock.lock().unwrap_or_else(PoisonError::into_inner);
            store.save(&base.with_rules(registry.snapshot()))
        });

        match task.await {
            Ok(Ok(())) => {
                debug!(path = %self.store.path().display(), "Saved the config");
                true
            }
            Ok(Err(e)) => {
                warn!("Error re-writing rules: {}", e);
                false
            }
            Err(e) => {
                error!("Config save task failed: {}", e);
                false
            }
        }
    }
}

/// Periodic saver
pub struct PersistenceScheduler;

impl PersistenceScheduler {
    /// Save every `interval`, starting one interval from now
    pub fn spawn(persister: Arc<Persister>, interval: Duration) -> JoinHandle<()> {
        debug!(interval_secs = interval.as_secs(), "Starting persistence scheduler");

        tokio::spawn(async move {
            let Some(first) = Instant::now().checked_add(interval) else {
                warn!(
                    interval_secs = interval.as_secs(),
                    "Save interval out of range, periodic saves disabled"
                );
                return;
            };
            let mut ticker = interval_at(first, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                persister.save().await;
            }
        })
    }
}
