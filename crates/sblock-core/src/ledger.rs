//! Per-block ownership ledger.
//!
//! One entry per block of a storage area. An entry is `Pending` while a
//! local caller holds the block and `Done` everywhere else. Only recovery
//! reads it.

use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;

const DONE: u8 = 0;
const PENDING: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockState {
    Done,
    Pending,
}

pub(crate) struct Ledger {
    entries: Box<[AtomicU8]>,
}

impl Ledger {
    /// All entries start `Done`: a fresh pool holds every block.
    pub(crate) fn new(count: u32) -> Self {
        Self {
            entries: (0..count).map(|_| AtomicU8::new(DONE)).collect(),
        }
    }

    pub(crate) fn mark(&self, index: u32, state: BlockState) {
        let value = match state {
            BlockState::Done => DONE,
            BlockState::Pending => PENDING,
        };
        if let Some(entry) = self.entries.get(index as usize) {
            entry.store(value, Ordering::Release);
        }
    }

    pub(crate) fn state(&self, index: u32) -> Option<BlockState> {
        self.entries
            .get(index as usize)
            .map(|entry| match entry.load(Ordering::Acquire) {
                PENDING => BlockState::Pending,
                _ => BlockState::Done,
            })
    }

    pub(crate) fn pending_count(&self) -> u32 {
        self.entries
            .iter()
            .filter(|entry| entry.load(Ordering::Acquire) == PENDING)
            .count() as u32
    }

    pub(crate) fn done_indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.load(Ordering::Acquire) == DONE)
            .map(|(index, _)| index as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_done() {
        let ledger = Ledger::new(3);
        assert_eq!(ledger.state(2), Some(BlockState::Done));
        assert_eq!(ledger.state(3), None);
        assert_eq!(ledger.pending_count(), 0);
        assert_eq!(ledger.done_indices().collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn pending_entries_are_skipped() {
        let ledger = Ledger::new(4);
        ledger.mark(1, BlockState::Pending);
        ledger.mark(3, BlockState::Pending);
        assert_eq!(ledger.pending_count(), 2);
        assert_eq!(ledger.done_indices().collect::<Vec<_>>(), vec![0, 2]);

        ledger.mark(3, BlockState::Done);
        assert_eq!(ledger.state(3), Some(BlockState::Done));
        assert_eq!(ledger.state(1), Some(BlockState::Pending));
    }

    #[test]
    fn out_of_range_is_ignored() {
        let ledger = Ledger::new(2);
        ledger.mark(7, BlockState::Pending);
        assert_eq!(ledger.state(7), None);
        assert_eq!(ledger.pending_count(), 0);
    }
}
