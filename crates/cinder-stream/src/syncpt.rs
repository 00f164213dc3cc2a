//! # Sync Point Table
//!
//! One preallocated descriptor per sync point id. Touched sync points are
//! linked into a list in touch order; squeezing the list at flush produces
//! the submission's increment array and unlinks everything.

use arrayvec::ArrayVec;
use cinder_core::{Error, Result, SyncPointId, SyncPointIncr, WaitBaseId};

use crate::config::{MAX_SYNCPOINTS, MAX_SYNCPOINTS_PER_SUBMIT};

/// Increment array of one submission
pub type SyncPointIncrs = ArrayVec<SyncPointIncr, MAX_SYNCPOINTS_PER_SUBMIT>;

/// Bookkeeping for one sync point id
#[derive(Debug, Clone, Copy)]
pub struct SyncPointDescriptor {
    /// Sync point
    pub id: SyncPointId,
    /// Increments owed since the last submission
    pub incrs: u32,
    /// Wait base advanced with this sync point
    pub wait_base: Option<WaitBaseId>,
    next: Option<SyncPointId>,
    linked: bool,
}

impl SyncPointDescriptor {
    const fn new(id: SyncPointId) -> Self {
        Self { id, incrs: 0, wait_base: None, next: None, linked: false }
    }
}

/// Touched sync points of the pending submission
#[derive(Debug, Clone)]
pub struct SyncPointTable {
    slots: [SyncPointDescriptor; MAX_SYNCPOINTS],
    first: Option<SyncPointId>,
    last: Option<SyncPointId>,
    len: usize,
    max_wait_bases: usize,
}

impl SyncPointTable {
    /// Create an empty table allowing `max_wait_bases` wait-base sync points
    /// per submission
    pub fn new(max_wait_bases: usize) -> Self {
        Self {
            slots: core::array::from_fn(|i| SyncPointDescriptor::new(SyncPointId::new(i as u32))),
            first: None,
            last: None,
            len: 0,
            max_wait_bases,
        }
    }

    fn slot(&self, id: SyncPointId) -> Result<&SyncPointDescriptor> {
        self.slots.get(id.index()).ok_or(Error::InvalidParameter)
    }

    fn slot_mut(&mut self, id: SyncPointId) -> Result<&mut SyncPointDescriptor> {
        self.slots.get_mut(id.index()).ok_or(Error::InvalidParameter)
    }

    /// Number of linked sync points
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Nothing touched since the last squeeze?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Is `id` linked?
    pub fn is_linked(&self, id: SyncPointId) -> bool {
        self.slot(id).map(|s| s.linked).unwrap_or(false)
    }

    /// Increments owed to `id`
    pub fn incrs(&self, id: SyncPointId) -> u32 {
        self.slot(id).map(|s| s.incrs).unwrap_or(0)
    }

    /// Wait base attached to `id`
    pub fn wait_base(&self, id: SyncPointId) -> Option<WaitBaseId> {
        self.slot(id).ok().and_then(|s| s.wait_base)
    }

    /// Attach or detach a wait base
    ///
    /// Not allowed while `id` is linked, since the flush epilogue was sized
    /// when it was touched. A table allowing no wait bases rejects them.
    pub fn set_wait_base(&mut self, id: SyncPointId, wait_base: Option<WaitBaseId>) -> Result<()> {
        if wait_base.is_some() && self.max_wait_bases == 0 {
            return Err(Error::InvalidParameter);
        }
        let slot = self.slot_mut(id)?;
        if slot.linked {
            return Err(Error::InvalidState);
        }
        slot.wait_base = wait_base;
        Ok(())
    }

    /// Linked sync points that carry a wait base
    pub fn wait_base_count(&self) -> usize {
        self.iter().filter(|d| d.wait_base.is_some()).count()
    }

    /// Link `id` if it is not linked yet
    pub fn touch(&mut self, id: SyncPointId) -> Result<()> {
        let slot = self.slot(id)?;
        if slot.linked {
            return Ok(());
        }
        if self.len >= MAX_SYNCPOINTS_PER_SUBMIT {
            return Err(Error::InsufficientResources);
        }
        if slot.wait_base.is_some() && self.wait_base_count() >= self.max_wait_bases {
            return Err(Error::InsufficientResources);
        }

        match self.last {
            Some(tail) => self.slot_mut(tail)?.next = Some(id),
            None => self.first = Some(id),
        }
        let slot = self.slot_mut(id)?;
        slot.linked = true;
        slot.next = None;
        slot.incrs = 0;
        self.last = Some(id);
        self.len += 1;
        Ok(())
    }

    /// Link `id` and owe it `n` more increments
    pub fn add(&mut self, id: SyncPointId, n: u32) -> Result<()> {
        self.touch(id)?;
        let slot = self.slot_mut(id)?;
        slot.incrs = slot.incrs.wrapping_add(n);
        Ok(())
    }

    /// Walk linked sync points in touch order
    pub fn iter(&self) -> Iter<'_> {
        Iter { table: self, cursor: self.first }
    }

    /// Copy the list into an increment array and unlink everything
    pub fn squeeze(&mut self) -> SyncPointIncrs {
        let mut out = SyncPointIncrs::new();
        let mut cursor = self.first.take();
        while let Some(id) = cursor {
            let Some(slot) = self.slots.get_mut(id.index()) else { break };
            // len never exceeds the array capacity
            let _ = out.try_push(SyncPointIncr {
                id: slot.id,
                incrs: slot.incrs,
                wait_base: slot.wait_base,
            });
            cursor = slot.next.take();
            slot.linked = false;
            slot.incrs = 0;
        }
        self.last = None;
        self.len = 0;
        out
    }
}

/// Iterator over linked descriptors
#[derive(Debug)]
pub struct Iter<'a> {
    table: &'a SyncPointTable,
    cursor: Option<SyncPointId>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a SyncPointDescriptor;

    fn next(&mut self) -> Option<Self::Item> {
        let slot = self.table.slots.get(self.cursor?.index())?;
        self.cursor = slot.next;
        Some(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sp(id: u32) -> SyncPointId {
        SyncPointId::new(id)
    }

    #[test]
    fn test_touch_order_and_squeeze() {
        let mut table = SyncPointTable::new(2);
        table.add(sp(22), 1).unwrap();
        table.add(sp(5), 2).unwrap();
        table.add(sp(22), 3).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.incrs(sp(22)), 4);

        let incrs = table.squeeze();
        assert_eq!(incrs.len(), 2);
        assert_eq!((incrs[0].id, incrs[0].incrs), (sp(22), 4));
        assert_eq!((incrs[1].id, incrs[1].incrs), (sp(5), 2));

        assert!(table.is_empty());
        assert!(!table.is_linked(sp(22)));
        assert_eq!(table.incrs(sp(22)), 0);
        assert_eq!(table.iter().count(), 0);
    }

    #[test]
    fn test_out_of_range_id() {
        let mut table = SyncPointTable::new(2);
        assert_eq!(table.touch(sp(MAX_SYNCPOINTS as u32)), Err(Error::InvalidParameter));
    }

    #[test]
    fn test_exhaustion() {
        let mut table = SyncPointTable::new(2);
        for id in 0..MAX_SYNCPOINTS_PER_SUBMIT as u32 {
            table.add(sp(id), 1).unwrap();
        }
        assert_eq!(table.add(sp(100), 1), Err(Error::InsufficientResources));
        // already-linked ids still accept increments
        table.add(sp(0), 1).unwrap();
        assert_eq!(table.squeeze().len(), MAX_SYNCPOINTS_PER_SUBMIT);
    }

    #[test]
    fn test_wait_base_cap() {
        let mut table = SyncPointTable::new(1);
        table.set_wait_base(sp(1), Some(WaitBaseId::new(1))).unwrap();
        table.set_wait_base(sp(2), Some(WaitBaseId::new(2))).unwrap();
        table.touch(sp(1)).unwrap();
        assert_eq!(table.touch(sp(2)), Err(Error::InsufficientResources));
        // sync points without a wait base are unaffected
        table.touch(sp(3)).unwrap();
        assert_eq!(table.wait_base_count(), 1);
    }

    #[test]
    fn test_no_wait_bases_allowed() {
        let mut table = SyncPointTable::new(0);
        assert_eq!(table.set_wait_base(sp(1), Some(WaitBaseId::new(1))), Err(Error::InvalidParameter));
        table.set_wait_base(sp(1), None).unwrap();
        table.touch(sp(1)).unwrap();
    }

    #[test]
    fn test_wait_base_locked_while_linked() {
        let mut table = SyncPointTable::new(2);
        table.touch(sp(7)).unwrap();
        assert_eq!(table.set_wait_base(sp(7), Some(WaitBaseId::new(3))), Err(Error::InvalidState));
        let _ = table.squeeze();
        table.set_wait_base(sp(7), Some(WaitBaseId::new(3))).unwrap();
        assert_eq!(table.wait_base(sp(7)), Some(WaitBaseId::new(3)));

        table.add(sp(7), 2).unwrap();
        let incrs = table.squeeze();
        assert_eq!(incrs[0].wait_base, Some(WaitBaseId::new(3)));
    }
}
