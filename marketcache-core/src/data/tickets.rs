//! Per-instrument fetch tickets.
//!
//! Serializes read-fetch-merge-write sequences for one instrument across the
//! batch scheduler and the live poller. Independent of the store's own write
//! lock, which a ticket holder still takes inside `CacheStore::merge`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
pub struct FetchTickets {
    slots: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Held for the duration of one refresh of one instrument.
pub struct FetchTicket {
    slot: Arc<Mutex<()>>,
}

impl FetchTicket {
    /// Block until no other holder is refreshing this instrument.
    pub fn hold(&self) -> MutexGuard<'_, ()> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl FetchTickets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ticket(&self, symbol: &str) -> FetchTicket {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        FetchTicket {
            slot: slots.entry(symbol.to_string()).or_default().clone(),
        }
    }
}
