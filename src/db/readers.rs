//! Reader slot table: the gate for free-page reclamation.
//!
//! Every snapshot occupies one of `MAX_READERS` atomic slots holding its
//! transaction id. The writer reclaims FreeDB entries only up to the oldest
//! live slot, so no page reachable from a registered snapshot is ever
//! reused under it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::types::{Result, TxId, ZatError, MAX_READERS};

/// Slot values store `tx_id + 1`; zero marks a free slot.
pub struct ReaderTable {
    slots: [AtomicU64; MAX_READERS],
}

impl Default for ReaderTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ReaderTable {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Claim a slot for a snapshot at `tx`. Fails with `ReadersExhausted`
    /// when all slots are taken.
    pub fn acquire(self: &Arc<Self>, tx: TxId) -> Result<ReaderSlot> {
        let tagged = tx.0 + 1;
        for (idx, slot) in self.slots.iter().enumerate() {
            if slot
                .compare_exchange(0, tagged, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(ReaderSlot {
                    table: Arc::clone(self),
                    idx,
                });
            }
        }
        Err(ZatError::ReadersExhausted)
    }

    /// Oldest transaction id any live reader is pinned to.
    pub fn oldest(&self) -> Option<TxId> {
        self.slots
            .iter()
            .filter_map(|slot| match slot.load(Ordering::Acquire) {
                0 => None,
                tagged => Some(TxId(tagged - 1)),
            })
            .min()
    }

    pub fn active(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.load(Ordering::Acquire) != 0)
            .count()
    }
}

/// RAII handle: dropping it releases the slot with release ordering.
pub struct ReaderSlot {
    table: Arc<ReaderTable>,
    idx: usize,
}

impl Drop for ReaderSlot {
    fn drop(&mut self) {
        self.table.slots[self.idx].store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_tracks_oldest() {
        let table = Arc::new(ReaderTable::new());
        assert_eq!(table.oldest(), None);
        let a = table.acquire(TxId(7)).unwrap();
        let b = table.acquire(TxId(3)).unwrap();
        let c = table.acquire(TxId(9)).unwrap();
        assert_eq!(table.oldest(), Some(TxId(3)));
        assert_eq!(table.active(), 3);
        drop(b);
        assert_eq!(table.oldest(), Some(TxId(7)));
        drop(a);
        drop(c);
        assert_eq!(table.oldest(), None);
    }

    #[test]
    fn tx_zero_snapshots_are_representable() {
        let table = Arc::new(ReaderTable::new());
        let slot = table.acquire(TxId(0)).unwrap();
        assert_eq!(table.oldest(), Some(TxId(0)));
        drop(slot);
    }

    #[test]
    fn exhausting_all_slots_errors() {
        let table = Arc::new(ReaderTable::new());
        let slots: Vec<_> = (0..MAX_READERS)
            .map(|i| table.acquire(TxId(i as u64)).unwrap())
            .collect();
        assert!(matches!(
            table.acquire(TxId(1)),
            Err(ZatError::ReadersExhausted)
        ));
        drop(slots);
        assert!(table.acquire(TxId(1)).is_ok());
    }
}
