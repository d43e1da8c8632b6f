// CPU slot allocator
//
// Fixed-size table of exclusive CPU reservations behind a single mutex.
// A slot is handed out as an opaque `CpuSlot`; it returns to the table when
// released (or dropped), never earlier. Every return wakes the tasks waiting
// on `released`.

use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct CpuSlots {
    table: Arc<Mutex<Vec<bool>>>,
    released: Arc<Notify>,
}

/// Exclusive reservation of one host CPU.
#[must_use = "dropping a CpuSlot releases it immediately"]
#[derive(Debug)]
pub struct CpuSlot {
    id: usize,
    table: Arc<Mutex<Vec<bool>>>,
    released: Arc<Notify>,
}

fn lock(table: &Mutex<Vec<bool>>) -> MutexGuard<'_, Vec<bool>> {
    // The table holds plain flags, a panic elsewhere cannot leave it inconsistent
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl CpuSlots {
    pub fn new(size: usize) -> Self {
        Self {
            table: Arc::new(Mutex::new(vec![false; size])),
            released: Arc::new(Notify::new()),
        }
    }

    /// First free slot, or `None` when every slot is busy. Never blocks on availability.
    pub fn acquire(&self) -> Option<CpuSlot> {
        let mut table = lock(&self.table);
        let id = table.iter().position(|busy| !busy)?;
        table[id] = true;
        debug!(cpu = id, "CPU slot acquired");
        Some(CpuSlot {
            id,
            table: Arc::clone(&self.table),
            released: Arc::clone(&self.released),
        })
    }

    /// Resolves on the next slot return.
    ///
    /// Create it before calling `acquire`: a return that happens in between
    /// still wakes it.
    pub fn released(&self) -> Notified<'_> {
        self.released.notified()
    }

    /// Return `slot` to the table. Only call once its container is gone.
    pub fn release(&self, slot: CpuSlot) {
        debug_assert!(Arc::ptr_eq(&self.table, &slot.table), "slot from another pool");
        drop(slot);
    }

    pub fn capacity(&self) -> usize {
        lock(&self.table).len()
    }

    pub fn busy(&self) -> usize {
        lock(&self.table).iter().filter(|busy| **busy).count()
    }
}

impl CpuSlot {
    pub fn id(&self) -> usize {
        self.id
    }
}

impl Drop for CpuSlot {
    fn drop(&mut self) {
        lock(&self.table)[self.id] = false;
        debug!(cpu = self.id, "CPU slot released");
        self.released.notify_waiters();
    }
}
