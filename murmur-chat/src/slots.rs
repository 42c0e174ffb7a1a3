//! Bounded admission slots.
//!
//! A slot is a small integer in `[0, capacity)`. The table is an arena of
//! `Option<SlotEntry>` indexed by [`SlotId`]; claiming always takes the
//! lowest free index so freed slots are reused first.
//!
//! Handlers hold a [`SlotGuard`]. Dropping it releases the slot and cancels
//! the handler's token, so every exit path (clean QUIT, timeout, I/O fault,
//! panic) frees the slot exactly once.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::server::ServerObserver;

pub type SlotId = usize;

/// Owner of an occupied slot.
#[derive(Debug, Clone)]
pub struct SlotEntry {
    pub connection_id: Uuid,
    pub peer: SocketAddr,
    pub cancel: CancellationToken,
}

#[derive(Debug)]
pub struct SlotTable {
    slots: Vec<Option<SlotEntry>>,
    occupied: usize,
}

impl SlotTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
            occupied: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn occupied(&self) -> usize {
        self.occupied
    }

    pub fn is_full(&self) -> bool {
        self.occupied == self.slots.len()
    }

    /// Occupy the lowest free slot. `None` when full.
    pub fn claim(&mut self, entry: SlotEntry) -> Option<SlotId> {
        let id = self.slots.iter().position(Option::is_none)?;
        self.slots[id] = Some(entry);
        self.occupied += 1;
        Some(id)
    }

    /// Free `id`, returning its owner if it was occupied.
    pub fn release(&mut self, id: SlotId) -> Option<SlotEntry> {
        let entry = self.slots.get_mut(id)?.take()?;
        self.occupied -= 1;
        Some(entry)
    }

    /// Free `id` only while it still belongs to `connection_id`.
    pub fn release_owned(&mut self, id: SlotId, connection_id: Uuid) -> Option<SlotEntry> {
        match self.get(id) {
            Some(entry) if entry.connection_id == connection_id => self.release(id),
            _ => None,
        }
    }

    pub fn get(&self, id: SlotId) -> Option<&SlotEntry> {
        self.slots.get(id)?.as_ref()
    }

    pub fn occupied_ids(&self) -> Vec<SlotId> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(id, s)| s.as_ref().map(|_| id))
            .collect()
    }
}

/// Slot table shared by the accept loop and every handler.
pub struct SlotRegistry {
    table: Mutex<SlotTable>,
    observer: Arc<dyn ServerObserver>,
}

impl SlotRegistry {
    pub fn new(capacity: usize, observer: Arc<dyn ServerObserver>) -> Self {
        Self {
            table: Mutex::new(SlotTable::new(capacity)),
            observer,
        }
    }

    fn table(&self) -> MutexGuard<'_, SlotTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the lowest free slot for `peer`, notifying the load observer.
    pub fn try_claim(
        self: &Arc<Self>,
        peer: SocketAddr,
        cancel: CancellationToken,
    ) -> Option<SlotGuard> {
        let connection_id = Uuid::new_v4();
        let entry = SlotEntry {
            connection_id,
            peer,
            cancel: cancel.clone(),
        };
        let (id, load) = {
            let mut table = self.table();
            let id = table.claim(entry)?;
            (id, table.occupied())
        };
        self.observer.on_load_changed(load);
        Some(SlotGuard {
            registry: self.clone(),
            id,
            connection_id,
            cancel,
        })
    }

    /// Free `id` regardless of owner and cancel the owning handler.
    pub fn free_slot(&self, id: SlotId) -> bool {
        let released = {
            let mut table = self.table();
            table.release(id).map(|entry| (entry, table.occupied()))
        };
        self.finish_release(released)
    }

    fn release_owned(&self, id: SlotId, connection_id: Uuid) -> bool {
        let released = {
            let mut table = self.table();
            table
                .release_owned(id, connection_id)
                .map(|entry| (entry, table.occupied()))
        };
        self.finish_release(released)
    }

    fn finish_release(&self, released: Option<(SlotEntry, usize)>) -> bool {
        match released {
            Some((entry, load)) => {
                entry.cancel.cancel();
                log::debug!("Released slot for {} ({})", entry.peer, entry.connection_id);
                self.observer.on_load_changed(load);
                true
            }
            None => false,
        }
    }

    pub fn occupied(&self) -> usize {
        self.table().occupied()
    }

    pub fn capacity(&self) -> usize {
        self.table().capacity()
    }

    pub fn is_full(&self) -> bool {
        self.table().is_full()
    }

    pub fn occupied_ids(&self) -> Vec<SlotId> {
        self.table().occupied_ids()
    }
}

/// Occupancy of one slot; released on drop.
pub struct SlotGuard {
    registry: Arc<SlotRegistry>,
    id: SlotId,
    connection_id: Uuid,
    cancel: CancellationToken,
}

impl SlotGuard {
    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Cancelled when the slot is released or the server stops.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        // A slot freed out from under us may already belong to someone else.
        self.registry.release_owned(self.id, self.connection_id);
        self.cancel.cancel();
    }
}
