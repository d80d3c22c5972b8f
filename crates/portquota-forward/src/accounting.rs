//! Live connection accounting
//!
//! Each rule has a counter of live relay directions. An admitted connection
//! reserves two units, one per direction, so a cap of `M` connections is
//! enforced as `2 * M` units. Units are handed out as RAII values: whichever
//! way a relay ends, dropping its unit releases it exactly once.
//!
//! Idle connections are not tracked here. The relays put a deadline on every
//! read and write instead, which makes an activity table and a sweeper task
//! unnecessary.

use std::sync::{Arc, Mutex, PoisonError};

/// Units consumed by one logical connection
const UNITS_PER_CONNECTION: u32 = 2;

/// Per-rule live connection counters
#[derive(Debug)]
pub struct ConnectionCounter {
    live: Mutex<Vec<u32>>,
}

impl ConnectionCounter {
    pub fn new(rule_count: usize) -> Self {
        Self {
            live: Mutex::new(vec![0; rule_count]),
        }
    }

    /// Reserve room for one connection on a rule
    ///
    /// `max_simultaneous` is the rule's connection cap, 0 meaning unlimited.
    /// The check and the increment happen under one lock, so racing
    /// admissions can never push a rule past its cap. Returns `None` when the
    /// rule is full.
    pub fn try_reserve(
        self: &Arc<Self>,
        index: usize,
        max_simultaneous: u32,
    ) -> Option<ConnectionSlot> {
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        let count = live.get_mut(index)?;

        if max_simultaneous != 0
            && u64::from(*count) >= u64::from(max_simultaneous) * u64::from(UNITS_PER_CONNECTION)
        {
            return None;
        }

        *count += UNITS_PER_CONNECTION;
        Some(ConnectionSlot {
            counter: self.clone(),
            index,
            units: UNITS_PER_CONNECTION,
        })
    }

    /// Live relay directions on a rule
    pub fn live_units(&self, index: usize) -> u32 {
        let live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        live.get(index).copied().unwrap_or(0)
    }

    /// Live logical connections on a rule
    pub fn live_connections(&self, index: usize) -> u32 {
        self.live_units(index) / UNITS_PER_CONNECTION
    }

    fn release(&self, index: usize, units: u32) {
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = live.get_mut(index) {
            *count = count.saturating_sub(units);
        }
    }
}

/// Two reserved units for one connection
///
/// Dropped unsplit (e.g. the upstream dial failed) it gives both units back.
#[derive(Debug)]
pub struct ConnectionSlot {
    counter: Arc<ConnectionCounter>,
    index: usize,
    units: u32,
}

impl ConnectionSlot {
    /// Hand one unit to each relay direction
    pub fn split(mut self) -> (SlotUnit, SlotUnit) {
        self.units = 0;
        (
            SlotUnit {
                counter: self.counter.clone(),
                index: self.index,
            },
            SlotUnit {
                counter: self.counter.clone(),
                index: self.index,
            },
        )
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        if self.units > 0 {
            self.counter.release(self.index, self.units);
        }
    }
}

/// One live relay direction
#[derive(Debug)]
pub struct SlotUnit {
    counter: Arc<ConnectionCounter>,
    index: usize,
}

impl SlotUnit {
    pub fn rule_index(&self) -> usize {
        self.index
    }
}

impl Drop for SlotUnit {
    fn drop(&mut self) {
        self.counter.release(self.index, 1);
    }
}
