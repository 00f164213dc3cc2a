//! # Builder Tables
//!
//! Bounded per-submission tables of gathers, relocations and waits.
//! Storage is allocated once at stream creation and never grows.

use alloc::vec::Vec;
use core::ops::Deref;

use cinder_core::{Error, GatherEntry, RelocEntry, Result, WaitEntry};

use crate::config::{GATHER_TABLE_SIZE, RELOC_TABLE_SIZE, WAIT_TABLE_SIZE};

/// Fixed-capacity table of submission entries
#[derive(Debug, Clone)]
pub struct BoundedTable<T, const N: usize> {
    entries: Vec<T>,
}

impl<T, const N: usize> BoundedTable<T, N> {
    /// Capacity
    pub const CAPACITY: usize = N;

    /// Create an empty table
    pub fn new() -> Self {
        Self { entries: Vec::with_capacity(N) }
    }

    /// Append an entry
    pub fn push(&mut self, entry: T) -> Result<()> {
        if self.entries.len() >= N {
            return Err(Error::InsufficientResources);
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Can `n` more entries be appended?
    #[inline]
    pub fn has_room(&self, n: usize) -> bool {
        self.entries.len() + n <= N
    }

    /// Entries left
    #[inline]
    pub fn remaining(&self) -> usize {
        N - self.entries.len()
    }

    /// Drop all entries, keeping the storage
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<T, const N: usize> Default for BoundedTable<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> Deref for BoundedTable<T, N> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.entries
    }
}

/// Gathers of the pending submission
pub type GatherTable = BoundedTable<GatherEntry, GATHER_TABLE_SIZE>;

/// Relocations of the pending submission
pub type RelocTable = BoundedTable<RelocEntry, RELOC_TABLE_SIZE>;

/// Elidable waits of the pending submission
pub type WaitTable = BoundedTable<WaitEntry, WAIT_TABLE_SIZE>;

// =============================================================================
// SUBMISSION TABLES
// =============================================================================

/// The three builder tables of one stream
#[derive(Debug, Clone, Default)]
pub struct SubmitTables {
    /// Gathers, in execution order
    pub gathers: GatherTable,
    /// Relocations
    pub relocs: RelocTable,
    /// Waits
    pub waits: WaitTable,
}

impl SubmitTables {
    /// Create empty tables
    pub fn new() -> Self {
        Self::default()
    }

    /// Are all three tables empty?
    pub fn is_empty(&self) -> bool {
        self.gathers.is_empty() && self.relocs.is_empty() && self.waits.is_empty()
    }

    /// Is there room for a reservation of this shape?
    ///
    /// Every caller gather may split the stream's own words, so each needs
    /// two slots, plus one for the words that follow and one for the
    /// bookkeeping tail.
    pub fn has_room(&self, gathers: u32, relocs: u32, waits: u32) -> bool {
        self.gathers.has_room(2 * gathers as usize + 2)
            && self.relocs.has_room(relocs as usize)
            && self.waits.has_room(waits as usize)
    }

    /// Bit per sync point waited on
    pub fn waited_mask(&self) -> u128 {
        self.waits
            .iter()
            .filter(|w| w.syncpt.index() < 128)
            .fold(0, |mask, w| mask | (1u128 << w.syncpt.index()))
    }

    /// Reset all tables
    pub fn clear(&mut self) {
        self.gathers.clear();
        self.relocs.clear();
        self.waits.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_core::{GatherKind, MemHandle, SyncPointId};

    fn gather(offset: u32) -> GatherEntry {
        GatherEntry { mem: MemHandle::Handle(1), offset, words: 4, kind: GatherKind::Plain }
    }

    fn wait(id: u32) -> WaitEntry {
        WaitEntry {
            cmdbuf: MemHandle::Handle(1),
            cmdbuf_offset: 0,
            syncpt: SyncPointId::new(id),
            thresh: 3,
        }
    }

    #[test]
    fn test_bounded_push() {
        let mut table: BoundedTable<u32, 2> = BoundedTable::new();
        table.push(1).unwrap();
        table.push(2).unwrap();
        assert_eq!(table.push(3), Err(Error::InsufficientResources));
        assert_eq!(&*table, &[1, 2]);
        table.clear();
        assert!(table.is_empty());
        assert_eq!(table.remaining(), 2);
    }

    #[test]
    fn test_gather_room() {
        let mut tables = SubmitTables::new();
        for i in 0..(GATHER_TABLE_SIZE - 4) as u32 {
            tables.gathers.push(gather(i * 16)).unwrap();
        }
        assert!(tables.has_room(1, 0, 0));
        assert!(!tables.has_room(2, 0, 0));
        assert!(tables.has_room(0, RELOC_TABLE_SIZE as u32, WAIT_TABLE_SIZE as u32));
        assert!(!tables.has_room(0, RELOC_TABLE_SIZE as u32 + 1, 0));
    }

    #[test]
    fn test_waited_mask() {
        let mut tables = SubmitTables::new();
        assert!(tables.is_empty());
        tables.waits.push(wait(3)).unwrap();
        tables.waits.push(wait(127)).unwrap();
        tables.waits.push(wait(3)).unwrap();
        assert_eq!(tables.waited_mask(), (1 << 3) | (1 << 127));
        assert!(!tables.is_empty());
        tables.clear();
        assert_eq!(tables.waited_mask(), 0);
    }
}
