//! # Command Buffer
//!
//! A ping-pong pair of command memory halves. One half is written while
//! the other may still be fetched by the engine. Each half remembers the
//! fences of the last submission that gathered from it; the pair only
//! swaps after the caller has waited those out.
//!
//! Words are staged in host memory and land in the command memory when
//! the cursor ends or the pending range is gathered.

use alloc::vec::Vec;

use arrayvec::ArrayVec;
use cinder_core::{CmdMemory, Error, Fence, GatherEntry, GatherKind, MemHandle, Result};

use crate::config::MAX_SYNCPOINTS_PER_SUBMIT;

/// Fences of one submission
pub type HalfFences = ArrayVec<Fence, MAX_SYNCPOINTS_PER_SUBMIT>;

/// One half of the pair
#[derive(Debug)]
struct Half {
    mem: CmdMemory,
    /// Must all be reached before the half is rewritten
    fences: HalfFences,
}

/// Ping-pong command buffer
#[derive(Debug)]
pub struct CommandBuffer {
    halves: [Half; 2],
    /// Index of the half being written
    active: usize,
    /// Write offset in words; `current <= fence <= capacity`
    current: u32,
    /// End of the writable region
    fence: u32,
    /// First word not yet covered by a gather
    gather_start: u32,
    /// Words up to here have landed in command memory
    committed: u32,
    staged: Vec<u32>,
}

impl CommandBuffer {
    /// Build the pair over two equally sized memories
    pub fn new(ping: CmdMemory, pong: CmdMemory) -> Result<Self> {
        let words = ping.len_words();
        if words == 0 || pong.len_words() != words {
            return Err(Error::InvalidParameter);
        }
        Ok(Self {
            halves: [
                Half { mem: ping, fences: HalfFences::new() },
                Half { mem: pong, fences: HalfFences::new() },
            ],
            active: 0,
            current: 0,
            fence: words,
            gather_start: 0,
            committed: 0,
            staged: Vec::with_capacity(words as usize),
        })
    }

    /// Words per half
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.halves[self.active].mem.len_words()
    }

    /// Write offset in words
    #[inline]
    pub fn current(&self) -> u32 {
        self.current
    }

    /// End of the writable region in words
    #[inline]
    pub fn fence(&self) -> u32 {
        self.fence
    }

    /// Index of the half being written
    #[inline]
    pub fn active_index(&self) -> usize {
        self.active
    }

    /// Memory of the half being written
    #[inline]
    pub fn active_mem(&self) -> &CmdMemory {
        &self.halves[self.active].mem
    }

    /// Handle of the half being written
    #[inline]
    pub fn active_handle(&self) -> MemHandle {
        self.halves[self.active].mem.handle()
    }

    /// Words written but not gathered yet
    #[inline]
    pub fn pending_words(&self) -> u32 {
        self.current - self.gather_start
    }

    /// Do `words` more words fit before the fence?
    #[inline]
    pub fn has_room(&self, words: u32) -> bool {
        self.current
            .checked_add(words)
            .is_some_and(|end| end <= self.fence)
    }

    /// Append one word
    pub fn push(&mut self, word: u32) -> Result<()> {
        if self.current >= self.fence {
            return Err(Error::BufferOverflow);
        }
        self.staged.push(word);
        self.current += 1;
        Ok(())
    }

    /// Byte offset of the next word in the active half
    #[inline]
    pub fn byte_offset(&self) -> u32 {
        self.current * 4
    }

    /// Land staged words in command memory
    pub fn commit(&mut self) -> Result<()> {
        if self.staged.is_empty() {
            return Ok(());
        }
        self.halves[self.active].mem.write(self.committed, &self.staged)?;
        self.committed = self.current;
        self.staged.clear();
        Ok(())
    }

    /// Commit and cover the pending words with a gather
    pub fn take_gather(&mut self) -> Result<Option<GatherEntry>> {
        self.commit()?;
        let words = self.pending_words();
        if words == 0 {
            return Ok(None);
        }
        let entry = GatherEntry {
            mem: self.active_handle(),
            offset: self.gather_start * 4,
            words,
            kind: GatherKind::Plain,
        };
        self.gather_start = self.current;
        Ok(Some(entry))
    }

    /// Drop the words written since the last gather
    ///
    /// They stay in memory but no gather will ever cover them.
    pub fn discard_pending(&mut self) {
        self.staged.clear();
        self.gather_start = self.current;
        self.committed = self.current;
    }

    /// Remember the fences of a submission that gathered from the active half
    pub fn record_fences(&mut self, fences: &[Fence]) {
        let half = &mut self.halves[self.active];
        half.fences.clear();
        half.fences.extend(fences.iter().copied().take(MAX_SYNCPOINTS_PER_SUBMIT));
    }

    /// Fences guarding the inactive half
    pub fn other_fences(&self) -> &[Fence] {
        &self.halves[self.active ^ 1].fences
    }

    /// Fences guarding both halves
    pub fn all_fences(&self) -> impl Iterator<Item = &Fence> {
        self.halves.iter().flat_map(|h| h.fences.iter())
    }

    /// Switch halves
    ///
    /// The caller must have waited out [`CommandBuffer::other_fences`] and
    /// gathered every pending word.
    pub fn swap(&mut self) {
        debug_assert_eq!(self.pending_words(), 0);
        self.active ^= 1;
        self.halves[self.active].fences.clear();
        self.current = 0;
        self.gather_start = 0;
        self.committed = 0;
        self.staged.clear();
    }

    /// Both memories, ping first
    pub fn memories(&self) -> [&CmdMemory; 2] {
        [&self.halves[0].mem, &self.halves[1].mem]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_core::SyncPointId;

    fn pair(words: u32) -> CommandBuffer {
        CommandBuffer::new(
            CmdMemory::new(MemHandle::Handle(1), words),
            CmdMemory::new(MemHandle::Handle(2), words),
        )
        .unwrap()
    }

    #[test]
    fn test_mismatched_halves() {
        let r = CommandBuffer::new(
            CmdMemory::new(MemHandle::Handle(1), 8),
            CmdMemory::new(MemHandle::Handle(2), 16),
        );
        assert_eq!(r.err(), Some(Error::InvalidParameter));
    }

    #[test]
    fn test_push_commit_gather() {
        let mut buf = pair(16);
        buf.push(0xa).unwrap();
        buf.push(0xb).unwrap();
        // staged words are not visible yet
        assert_eq!(buf.active_mem().read_word(0).unwrap(), 0);

        let gather = buf.take_gather().unwrap().unwrap();
        assert_eq!(gather.mem, MemHandle::Handle(1));
        assert_eq!((gather.offset, gather.words), (0, 2));
        assert_eq!(buf.active_mem().read(0, 2).unwrap(), [0xa, 0xb]);

        buf.push(0xc).unwrap();
        let gather = buf.take_gather().unwrap().unwrap();
        assert_eq!((gather.offset, gather.words), (8, 1));
        assert_eq!(buf.take_gather().unwrap(), None);
    }

    #[test]
    fn test_discard_pending() {
        let mut buf = pair(16);
        buf.push(0xa).unwrap();
        buf.take_gather().unwrap();
        buf.push(0xb).unwrap();
        buf.push(0xc).unwrap();
        buf.discard_pending();
        assert_eq!(buf.pending_words(), 0);
        assert_eq!(buf.active_mem().read_word(1).unwrap(), 0);

        buf.push(0xd).unwrap();
        let gather = buf.take_gather().unwrap().unwrap();
        assert_eq!((gather.offset, gather.words), (12, 1));
        assert_eq!(buf.active_mem().read_word(3).unwrap(), 0xd);
        buf.swap();
    }

    #[test]
    fn test_room_and_overflow() {
        let mut buf = pair(4);
        assert!(buf.has_room(4));
        assert!(!buf.has_room(5));
        assert!(!buf.has_room(u32::MAX));
        for w in 0..4 {
            buf.push(w).unwrap();
        }
        assert_eq!(buf.push(4), Err(Error::BufferOverflow));
        assert_eq!(buf.current(), buf.fence());
    }

    #[test]
    fn test_swap_keeps_fences_per_half() {
        let mut buf = pair(8);
        let fence = Fence::new(SyncPointId::new(5), 3);
        buf.push(1).unwrap();
        buf.take_gather().unwrap();
        buf.record_fences(&[fence]);
        assert!(buf.other_fences().is_empty());

        buf.swap();
        assert_eq!(buf.active_index(), 1);
        assert_eq!(buf.current(), 0);
        assert_eq!(buf.other_fences(), &[fence]);
        assert_eq!(buf.all_fences().count(), 1);

        buf.swap();
        // returning to a half forgets its old fences
        assert!(buf.all_fences().next().is_none());
    }
}
