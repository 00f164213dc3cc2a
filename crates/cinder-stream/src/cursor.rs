//! # Cursor
//!
//! Write access to a stream within one `begin` reservation. Every push
//! draws on the reservation; going past it is `Error::BufferOverflow`
//! and writes nothing.
//!
//! | Push | words | waits | relocs | gathers |
//! |------|-------|-------|--------|---------|
//! | `push_word` | 1 | | | |
//! | `push_set_class` | 1 | | | |
//! | `push_incr` | 2 | | | |
//! | `push_wait_last` | 6 | | | |
//! | `push_acquire_mutex` / `push_release_mutex` | 1 | | | |
//! | `push_wait` | | 1 | | |
//! | `push_wait_check` | | 1 | | |
//! | `push_reloc` | | | 1 | |
//! | `push_gather*` | | | | 1 |

use cinder_core::opcode::{self, IncrCond, GATHER_COUNT_MAX};
use cinder_core::{
    ClassId, Error, Fence, GatherEntry, GatherKind, MemHandle, ModuleId, MutexId, RelocEntry,
    Result, SyncPointId, WaitBaseId, WaitEntry,
};

use crate::cmdbuf::CommandBuffer;
use crate::stream::Stream;

/// Words `push_incr` writes
pub const INCR_WORDS: u32 = 2;

/// Words `push_wait_last` writes
pub const WAIT_LAST_WORDS: u32 = 6;

/// Reservation-bounded writer returned by [`Stream::begin`]
///
/// Written words land in command memory when the cursor ends or drops.
#[derive(Debug)]
pub struct Cursor<'a> {
    stream: &'a mut Stream,
    words: u32,
    waits: u32,
    relocs: u32,
    gathers: u32,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(stream: &'a mut Stream, words: u32, waits: u32, relocs: u32, gathers: u32) -> Self {
        Self { stream, words, waits, relocs, gathers }
    }

    fn take(budget: &mut u32, n: u32) -> Result<()> {
        *budget = budget.checked_sub(n).ok_or(Error::BufferOverflow)?;
        Ok(())
    }

    /// Words left in the reservation
    pub fn remaining_words(&self) -> u32 {
        self.words
    }

    /// Waits left in the reservation
    pub fn remaining_waits(&self) -> u32 {
        self.waits
    }

    /// Relocations left in the reservation
    pub fn remaining_relocs(&self) -> u32 {
        self.relocs
    }

    /// Gathers left in the reservation
    pub fn remaining_gathers(&self) -> u32 {
        self.gathers
    }

    /// Byte offset of the next word in the stream's active half
    pub fn offset(&self) -> u32 {
        self.stream.cmdbuf.byte_offset()
    }

    // =========================================================================
    // Words
    // =========================================================================

    /// Append a command or data word
    pub fn push_word(&mut self, word: u32) -> Result<()> {
        Self::take(&mut self.words, 1)?;
        self.stream.cmdbuf.push(word)
    }

    /// Append several words
    pub fn push_words(&mut self, words: &[u32]) -> Result<()> {
        let n = u32::try_from(words.len()).map_err(|_| Error::BufferOverflow)?;
        Self::take(&mut self.words, n)?;
        for &word in words {
            self.stream.cmdbuf.push(word)?;
        }
        Ok(())
    }

    /// Select `class` on `module`; later class restores return to it
    pub fn push_set_class(&mut self, module: ModuleId, class: ClassId) -> Result<()> {
        Self::take(&mut self.words, 1)?;
        self.stream.cmdbuf.push(opcode::set_class(class, 0, 0))?;
        self.stream.last_class = Some(class);
        self.stream.last_module = Some(module);
        Ok(())
    }

    // =========================================================================
    // Relocations and gathers
    // =========================================================================

    /// Append a placeholder patched at submit time with the address of
    /// `target + target_offset`, shifted right by `shift`
    pub fn push_reloc(&mut self, target: MemHandle, target_offset: u32, shift: u32) -> Result<()> {
        Self::take(&mut self.relocs, 1)?;
        let entry = RelocEntry {
            cmdbuf: self.stream.cmdbuf.active_handle(),
            cmdbuf_offset: self.stream.cmdbuf.byte_offset(),
            target,
            target_offset,
            shift,
        };
        self.stream.tables.relocs.push(entry)?;
        self.stream.cmdbuf.push(opcode::RELOC_PLACEHOLDER)
    }

    fn push_gather_kind(&mut self, mem: MemHandle, offset: u32, words: u32, kind: GatherKind) -> Result<()> {
        if words == 0 || words > GATHER_COUNT_MAX || offset % 4 != 0 {
            return Err(Error::InvalidParameter);
        }
        Self::take(&mut self.gathers, 1)?;
        let stream = &mut *self.stream;
        if let Some(own) = stream.cmdbuf.take_gather()? {
            stream.tables.gathers.push(own)?;
        }
        stream.tables.gathers.push(GatherEntry { mem, offset, words, kind })
    }

    /// Execute `words` command words of `mem` from byte `offset` in place
    pub fn push_gather(&mut self, mem: MemHandle, offset: u32, words: u32) -> Result<()> {
        self.push_gather_kind(mem, offset, words, GatherKind::Plain)
    }

    /// Write `words` data words of `mem` to consecutive registers from `reg`
    pub fn push_gather_incr(&mut self, reg: u32, mem: MemHandle, offset: u32, words: u32) -> Result<()> {
        self.push_gather_kind(mem, offset, words, GatherKind::Incr(reg))
    }

    /// Write `words` data words of `mem` to register `reg`
    pub fn push_gather_nonincr(&mut self, reg: u32, mem: MemHandle, offset: u32, words: u32) -> Result<()> {
        self.push_gather_kind(mem, offset, words, GatherKind::NonIncr(reg))
    }

    // =========================================================================
    // Sync points
    // =========================================================================

    /// Increment `syncpt` through register `reg` of the current class
    ///
    /// With `tracked` the increment is added to the submission's
    /// bookkeeping and shows up in the returned fences.
    pub fn push_incr(&mut self, syncpt: SyncPointId, reg: u32, cond: IncrCond, tracked: bool) -> Result<()> {
        if self.words < INCR_WORDS {
            return Err(Error::BufferOverflow);
        }
        if tracked {
            self.stream.touch(syncpt)?;
            self.stream.syncpts.add(syncpt, 1)?;
        }
        Self::take(&mut self.words, INCR_WORDS)?;
        self.stream.cmdbuf.push(opcode::nonincr(reg, 1))?;
        self.stream.cmdbuf.push(opcode::incr_syncpt(cond, syncpt))
    }

    /// Note `n` increments of the stream's own sync point that were
    /// written as raw words
    pub fn record_manual_incrs(&mut self, n: u32) {
        self.stream.manual_incrs = self.stream.manual_incrs.wrapping_add(n);
    }

    fn restore_class(cmdbuf: &mut CommandBuffer, class: Option<ClassId>) -> Result<()> {
        match class {
            Some(class) if !class.is_host() => cmdbuf.push(opcode::set_class(class, 0, 0)),
            _ => Ok(()),
        }
    }

    /// Make the channel wait for `fence`
    ///
    /// The wait is recorded so the transport may elide it when the fence
    /// has already passed.
    pub fn push_wait(&mut self, fence: Fence) -> Result<()> {
        Self::take(&mut self.waits, 1)?;
        let stream = &mut *self.stream;
        stream.cmdbuf.push(opcode::set_class(ClassId::HOST1X, 0, 0))?;
        stream.cmdbuf.push(opcode::nonincr(opcode::host::WAIT_SYNCPT, 1))?;
        stream.tables.waits.push(WaitEntry {
            cmdbuf: stream.cmdbuf.active_handle(),
            cmdbuf_offset: stream.cmdbuf.byte_offset(),
            syncpt: fence.id,
            thresh: fence.value,
        })?;
        stream.cmdbuf.push(opcode::wait_syncpt(fence.id, fence.value))?;
        Self::restore_class(&mut stream.cmdbuf, stream.last_class)
    }

    /// Make the channel wait for every fence in `fences`
    pub fn push_waits(&mut self, fences: &[Fence]) -> Result<()> {
        let n = u32::try_from(fences.len()).map_err(|_| Error::BufferOverflow)?;
        if n > self.waits {
            return Err(Error::BufferOverflow);
        }
        fences.iter().try_for_each(|&f| self.push_wait(f))
    }

    /// Record that the word just written is a WAIT_SYNCPT data word for
    /// `fence`
    pub fn push_wait_check(&mut self, fence: Fence) -> Result<()> {
        let at = self.stream.cmdbuf.byte_offset().checked_sub(4).ok_or(Error::InvalidState)?;
        Self::take(&mut self.waits, 1)?;
        let cmdbuf = self.stream.cmdbuf.active_handle();
        self.stream.tables.waits.push(WaitEntry {
            cmdbuf,
            cmdbuf_offset: at,
            syncpt: fence.id,
            thresh: fence.value,
        })
    }

    /// Increment `syncpt` and make the channel wait until it lands
    ///
    /// The wait is expressed against `wait_base`, so it stays correct
    /// however many other increments the sync point sees meanwhile.
    pub fn push_wait_last(
        &mut self,
        syncpt: SyncPointId,
        wait_base: WaitBaseId,
        reg: u32,
        cond: IncrCond,
    ) -> Result<()> {
        if self.words < WAIT_LAST_WORDS {
            return Err(Error::BufferOverflow);
        }
        self.push_incr(syncpt, reg, cond, true)?;
        Self::take(&mut self.words, WAIT_LAST_WORDS - INCR_WORDS)?;

        let stream = &mut *self.stream;
        let mut offset = stream.syncpts.incrs(syncpt);
        if syncpt == stream.syncpt {
            offset = offset.wrapping_add(stream.manual_incrs);
        }
        stream.cmdbuf.push(opcode::set_class(ClassId::HOST1X, 0, 0))?;
        stream.cmdbuf.push(opcode::nonincr(opcode::host::WAIT_SYNCPT_BASE, 1))?;
        stream.cmdbuf.push(opcode::wait_syncpt_base(syncpt, wait_base, offset))?;
        match stream.last_class {
            Some(class) => stream.cmdbuf.push(opcode::set_class(class, 0, 0)),
            // keep the word count fixed
            None => stream.cmdbuf.push(opcode::set_class(ClassId::HOST1X, 0, 0)),
        }
    }

    // =========================================================================
    // Mutexes
    // =========================================================================

    /// Acquire a hardware mutex; must be released in the same submission
    pub fn push_acquire_mutex(&mut self, id: MutexId) -> Result<()> {
        Self::take(&mut self.words, 1)?;
        self.stream.cmdbuf.push(opcode::acquire_mutex(id))?;
        self.stream.held_mutexes += 1;
        Ok(())
    }

    /// Release a hardware mutex
    pub fn push_release_mutex(&mut self, id: MutexId) -> Result<()> {
        Self::take(&mut self.words, 1)?;
        self.stream.cmdbuf.push(opcode::release_mutex(id))?;
        self.stream.held_mutexes = self.stream.held_mutexes.saturating_sub(1);
        Ok(())
    }

    /// End the reservation
    pub fn end(self) {}
}

impl Drop for Cursor<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.stream.cmdbuf.commit() {
            log::warn!("stream on {}: commit failed: {}", self.stream.syncpt, err);
        }
    }
}

// =============================================================================
// PRE-FLUSH WRITER
// =============================================================================

/// Bounded writer handed to the pre-flush hook
#[derive(Debug)]
pub struct PreFlushWriter<'a> {
    cmdbuf: &'a mut CommandBuffer,
    left: u32,
}

impl<'a> PreFlushWriter<'a> {
    pub(crate) fn new(cmdbuf: &'a mut CommandBuffer, words: u32) -> Self {
        Self { cmdbuf, left: words }
    }

    /// Words the hook may still write
    pub fn remaining(&self) -> u32 {
        self.left
    }

    /// Append one word
    pub fn push_word(&mut self, word: u32) -> Result<()> {
        Cursor::take(&mut self.left, 1)?;
        self.cmdbuf.push(word)
    }
}
