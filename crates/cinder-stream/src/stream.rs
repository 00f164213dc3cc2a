//! # Stream
//!
//! The submission engine: space accounting in front of the command buffer,
//! and the flush protocol behind it.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::fmt;

use arrayvec::ArrayVec;
use cinder_core::opcode::{self, Disassembled, Disassembler, IncrCond, GATHER_COUNT_MAX};
use cinder_core::{
    Channel, ClassId, Error, Fence, ModuleId, Priority, Result, Submit, SyncPointId, WaitBaseId,
    WaitTimeout,
};

use crate::cmdbuf::CommandBuffer;
use crate::config::{
    StreamConfig, StreamFlags, BEGIN_MAX_GATHERS, BEGIN_MAX_RELOCS, BEGIN_MAX_WAITS,
    BEGIN_MAX_WORDS, MAX_SYNCPOINTS, MAX_SYNCPOINTS_PER_SUBMIT, WAIT_WORDS,
};
use crate::cursor::{Cursor, PreFlushWriter};
use crate::syncpt::SyncPointTable;
use crate::tables::SubmitTables;

/// Fences returned by one flush
pub type FenceSet = ArrayVec<Fence, MAX_SYNCPOINTS_PER_SUBMIT>;

/// Hook run inside flush, before the trailing increment
pub type PreFlushHook = Box<dyn FnMut(&mut PreFlushWriter<'_>) + Send>;

/// Hook run after every flush that had work
pub type PostFlushHook = Box<dyn FnMut(&FlushReport) + Send>;

// =============================================================================
// FLUSH REPORT
// =============================================================================

/// What one flush did to the stream's own sync point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    /// The stream's sync point
    pub syncpoint: SyncPointId,
    /// Sync point value before this submission's increments
    pub base: u32,
    /// Increments the submission performs on the sync point; 0 on failure
    pub count: u32,
    /// How many of `count` the stream added itself (the trailing increment)
    pub bookkeeping_incrs: u32,
    /// Why nothing was submitted
    pub error: Option<Error>,
}

impl FlushReport {
    /// Fence reached when the whole submission is done
    pub fn fence(&self) -> Fence {
        Fence::new(self.syncpoint, self.base.wrapping_add(self.count))
    }
}

// =============================================================================
// STATISTICS
// =============================================================================

/// Stream statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Flushes that had work
    pub flushes: u64,
    /// Batches accepted by the channel
    pub submits: u64,
    /// Flushes with nothing pending
    pub empty_flushes: u64,
    /// Flushes forced by `begin`
    pub auto_flushes: u64,
    /// Ping-pong swaps
    pub swaps: u64,
    /// Batches that failed or were abandoned
    pub failed_submits: u64,
}

struct PreFlush {
    words: u32,
    hook: PreFlushHook,
}

// =============================================================================
// STREAM
// =============================================================================

/// A command stream bound to one channel
pub struct Stream {
    pub(crate) channel: Arc<dyn Channel>,
    module: ModuleId,
    config: StreamConfig,
    pub(crate) syncpt: SyncPointId,
    pub(crate) cmdbuf: CommandBuffer,
    pub(crate) tables: SubmitTables,
    pub(crate) syncpts: SyncPointTable,
    /// Class selected by the last `push_set_class`
    pub(crate) last_class: Option<ClassId>,
    pub(crate) last_module: Option<ModuleId>,
    /// Increments of the stream sync point written without the table
    pub(crate) manual_incrs: u32,
    /// Mutexes acquired and not yet released in the pending batch
    pub(crate) held_mutexes: u32,
    error: Option<Error>,
    last_fences: FenceSet,
    pre_flush: Option<PreFlush>,
    post_flush: Option<PostFlushHook>,
    stats: StreamStats,
    closed: bool,
}

impl Stream {
    /// Create a stream on `channel` for `module`
    pub fn new(channel: Arc<dyn Channel>, module: ModuleId, config: StreamConfig) -> Result<Self> {
        config.validate()?;

        let syncpt = match config.syncpoint {
            Some(id) => id,
            None => channel.module_syncpoint(module, 0)?,
        };
        if syncpt.index() >= MAX_SYNCPOINTS || syncpt.raw() >= channel.num_syncpoints() {
            return Err(Error::InvalidParameter);
        }

        let half = config.half_words();
        let ping = channel.alloc_memory(half)?;
        let pong = match channel.alloc_memory(half) {
            Ok(mem) => mem,
            Err(err) => {
                channel.free_memory(ping);
                return Err(err);
            }
        };
        let cmdbuf = CommandBuffer::new(ping, pong)?;

        let mut syncpts = SyncPointTable::new(config.max_wait_base_syncpts as usize);
        syncpts.set_wait_base(syncpt, config.wait_base)?;

        log::debug!("stream for {:?} on {}, {} words per half", module, syncpt, half);

        Ok(Self {
            channel,
            module,
            config,
            syncpt,
            cmdbuf,
            tables: SubmitTables::new(),
            syncpts,
            last_class: None,
            last_module: None,
            manual_incrs: 0,
            held_mutexes: 0,
            error: None,
            last_fences: FenceSet::new(),
            pre_flush: None,
            post_flush: None,
            stats: StreamStats::default(),
            closed: false,
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Channel the stream submits to
    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    /// Engine the stream was created for
    pub fn module(&self) -> ModuleId {
        self.module
    }

    /// The stream's own sync point
    pub fn syncpoint(&self) -> SyncPointId {
        self.syncpt
    }

    /// Behavior flags
    pub fn flags(&self) -> StreamFlags {
        self.config.flags
    }

    /// Replace the behavior flags
    pub fn set_flags(&mut self, flags: StreamFlags) {
        self.config.flags = flags;
    }

    /// Fences of the last successful submission
    pub fn last_fences(&self) -> &[Fence] {
        &self.last_fences
    }

    /// Statistics
    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    /// Has a submission failed since the last [`Stream::get_error`]?
    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// Nothing written or recorded since the last flush
    pub fn is_idle(&self) -> bool {
        self.cmdbuf.pending_words() == 0
            && self.tables.is_empty()
            && self.syncpts.is_empty()
            && self.manual_incrs == 0
    }

    // =========================================================================
    // Sync point setup
    // =========================================================================

    /// Wait base attached to `id`
    pub fn wait_base(&self, id: SyncPointId) -> Option<WaitBaseId> {
        self.syncpts.wait_base(id)
    }

    /// Attach or detach the wait base advanced with `id`
    pub fn set_wait_base(&mut self, id: SyncPointId, wait_base: Option<WaitBaseId>) -> Result<()> {
        self.syncpts.set_wait_base(id, wait_base)
    }

    /// Switch the stream to another sync point
    pub fn set_syncpoint(&mut self, id: SyncPointId) -> Result<()> {
        if !self.is_idle() {
            return Err(Error::InvalidState);
        }
        if id.index() >= MAX_SYNCPOINTS || id.raw() >= self.channel.num_syncpoints() {
            return Err(Error::InvalidParameter);
        }
        self.syncpt = id;
        Ok(())
    }

    /// Change the channel's priority, keeping the stream's sync point
    pub fn set_priority(&mut self, priority: Priority) -> Result<()> {
        self.channel.set_priority(priority)
    }

    /// Move the channel to `priority` and adopt the sync point and wait
    /// base it hands out
    ///
    /// Only channels that never handed out a static sync point can do
    /// this; a stream created without an explicit sync point has already
    /// asked for one.
    pub fn set_priority_dynamic(&mut self, priority: Priority) -> Result<(SyncPointId, WaitBaseId)> {
        if !self.is_idle() {
            return Err(Error::InvalidState);
        }
        let (syncpt, wait_base) = self.channel.set_priority_dynamic(priority, 0, 0)?;
        self.set_syncpoint(syncpt)?;
        self.syncpts.set_wait_base(syncpt, Some(wait_base))?;
        log::debug!("stream for {:?} moved to {} / {}", self.module, syncpt, wait_base);
        Ok((syncpt, wait_base))
    }

    /// Link `id` into the pending submission
    ///
    /// The stream's own sync point always goes first.
    pub(crate) fn touch(&mut self, id: SyncPointId) -> Result<()> {
        if self.syncpts.is_empty() && id != self.syncpt {
            self.syncpts.touch(self.syncpt)?;
        }
        self.syncpts.touch(id)
    }

    // =========================================================================
    // Hooks
    // =========================================================================

    /// Run `hook` inside every flush with room for `words` words
    pub fn set_pre_flush(&mut self, words: u32, hook: PreFlushHook) -> Result<()> {
        if self.pre_flush.is_some() {
            return Err(Error::NotSupported);
        }
        if !self.is_idle() {
            return Err(Error::InvalidState);
        }
        let largest = BEGIN_MAX_WORDS + BEGIN_MAX_WAITS * WAIT_WORDS;
        let needed = largest
            .checked_add(self.config.bookkeeping_words())
            .and_then(|n| n.checked_add(words));
        if needed.is_none_or(|n| n > self.cmdbuf.fence() || n > GATHER_COUNT_MAX) {
            return Err(Error::InsufficientResources);
        }
        self.pre_flush = Some(PreFlush { words, hook });
        Ok(())
    }

    /// Run `hook` after every flush that had work
    pub fn set_post_flush(&mut self, hook: PostFlushHook) -> Result<()> {
        if self.post_flush.is_some() {
            return Err(Error::NotSupported);
        }
        self.post_flush = Some(hook);
        Ok(())
    }

    fn pre_flush_words(&self) -> u32 {
        self.pre_flush.as_ref().map_or(0, |p| p.words)
    }

    // =========================================================================
    // Begin
    // =========================================================================

    fn check_request(words: u32, waits: u32, relocs: u32, gathers: u32) -> Result<()> {
        if relocs > BEGIN_MAX_RELOCS || gathers > BEGIN_MAX_GATHERS || waits > BEGIN_MAX_WAITS {
            return Err(Error::InvalidParameter);
        }
        if words == 0 && gathers == 0 {
            return Err(Error::InvalidParameter);
        }
        if words >= GATHER_COUNT_MAX || words + relocs > BEGIN_MAX_WORDS {
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }

    fn has_space(&self, words: u32, waits: u32, relocs: u32, gathers: u32) -> bool {
        let need = words + relocs + waits * WAIT_WORDS;
        let tail = self.config.bookkeeping_words() + self.pre_flush_words();
        self.cmdbuf.has_room(need + tail)
            && self.cmdbuf.pending_words() + need + tail <= GATHER_COUNT_MAX
            && self.tables.has_room(gathers, relocs, waits)
    }

    /// Reserve room for a batch of pushes
    ///
    /// `words` counts plain command words, including the two words of
    /// every `push_incr`. Each of `waits` covers one `push_wait` or
    /// `push_wait_check`, each of `relocs` one placeholder word and each of
    /// `gathers` one gather. If the active half or the tables cannot take
    /// the reservation the stream flushes; if the half is still too full
    /// it waits for the other half and swaps.
    pub fn begin(&mut self, words: u32, waits: u32, relocs: u32, gathers: u32) -> Result<Cursor<'_>> {
        Self::check_request(words, waits, relocs, gathers)?;

        if !self.has_space(words, waits, relocs, gathers) {
            self.stats.auto_flushes += 1;
            self.flush();
            if !self.has_space(words, waits, relocs, gathers) {
                self.swap()?;
                if !self.has_space(words, waits, relocs, gathers) {
                    return Err(Error::InsufficientResources);
                }
            }
        }

        Ok(Cursor::new(self, words, waits, relocs, gathers))
    }

    /// Wait for the inactive half to drain and make it active
    fn swap(&mut self) -> Result<()> {
        let fences: FenceSet = self.cmdbuf.other_fences().iter().copied().collect();
        for fence in &fences {
            self.channel
                .wait_syncpoint(fence.id, fence.value, WaitTimeout::Infinite)?;
        }
        self.cmdbuf.swap();
        self.stats.swaps += 1;
        log::debug!(
            "stream on {} swapped to half {} after {} fence waits",
            self.syncpt,
            self.cmdbuf.active_index(),
            fences.len()
        );
        Ok(())
    }

    // =========================================================================
    // Flush
    // =========================================================================

    fn bookkeeping_incrs(&self) -> u32 {
        if self.config.flags.contains(StreamFlags::CLIENT_MANAGED) {
            0
        } else {
            1
        }
    }

    /// Fold the stream's increments into the table and write the epilogue
    fn emit_epilogue(&mut self, bookkeeping: u32) -> Result<()> {
        let own = self.manual_incrs.wrapping_add(bookkeeping);
        self.touch(self.syncpt)?;
        self.syncpts.add(self.syncpt, own)?;

        let advances: ArrayVec<(WaitBaseId, u32), MAX_SYNCPOINTS_PER_SUBMIT> = self
            .syncpts
            .iter()
            .filter(|d| d.incrs > 0)
            .filter_map(|d| d.wait_base.map(|wb| (wb, d.incrs)))
            .collect();
        if !advances.is_empty() {
            self.cmdbuf.push(opcode::set_class(ClassId::HOST1X, 0, 0))?;
            for (wait_base, incrs) in &advances {
                self.cmdbuf.push(opcode::nonincr(opcode::host::INCR_SYNCPT_BASE, 1))?;
                self.cmdbuf.push(opcode::incr_syncpt_base(*wait_base, *incrs))?;
            }
            if let Some(class) = self.last_class {
                self.cmdbuf.push(opcode::set_class(class, 0, 0))?;
            }
        }

        if let Some(pre) = self.pre_flush.as_mut() {
            let mut writer = PreFlushWriter::new(&mut self.cmdbuf, pre.words);
            (pre.hook)(&mut writer);
        }

        if bookkeeping > 0 {
            let cond = if self.config.flags.contains(StreamFlags::USE_IMMEDIATE) {
                IncrCond::Immediate
            } else {
                IncrCond::OpDone
            };
            self.cmdbuf.push(opcode::nonincr(opcode::host::INCR_SYNCPT, 1))?;
            self.cmdbuf.push(opcode::incr_syncpt(cond, self.syncpt))?;
        }

        if let Some(gather) = self.cmdbuf.take_gather()? {
            self.tables.gathers.push(gather)?;
        }
        Ok(())
    }

    fn set_error(&mut self, err: Error) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    /// Submit everything written since the last flush
    ///
    /// Returns the fence of every sync point the batch increments, the
    /// stream's own included. Returns no fences when nothing was pending
    /// or the batch failed; a failure is kept for [`Stream::get_error`].
    pub fn flush(&mut self) -> FenceSet {
        if self.is_idle() {
            self.stats.empty_flushes += 1;
            return FenceSet::new();
        }
        self.stats.flushes += 1;

        let bookkeeping = self.bookkeeping_incrs();
        if let Err(err) = self.emit_epilogue(bookkeeping) {
            log::warn!("stream on {}: epilogue failed: {}", self.syncpt, err);
            self.set_error(err);
        }

        if self.held_mutexes > 0 {
            log::warn!(
                "stream on {}: submission leaves {} hardware mutex(es) held",
                self.syncpt,
                self.held_mutexes
            );
        }
        if self.config.flags.contains(StreamFlags::DISASM) {
            self.disassemble();
        }

        let incrs = self.syncpts.squeeze();
        let stream_index = incrs.iter().position(|i| i.id == self.syncpt).unwrap_or(0);
        let stream_incrs = incrs.get(stream_index).map_or(0, |i| i.incrs);

        let result = match self.error {
            Some(err) => {
                log::debug!("stream on {}: abandoning batch, error {} pending", self.syncpt, err);
                Err(err)
            }
            None => {
                let submit = Submit {
                    gathers: &self.tables.gathers,
                    relocs: &self.tables.relocs,
                    waits: &self.tables.waits,
                    syncpt_incrs: &incrs,
                    stream_syncpt_index: stream_index,
                    module: self.last_module.or(Some(self.module)),
                    null_kickoff: self.config.flags.contains(StreamFlags::NULL_KICKOFF),
                    waited_mask: self.tables.waited_mask(),
                };
                log::trace!(
                    "submit on {}: {} gathers ({} words), {} relocs, {} waits, {} sync points",
                    self.syncpt,
                    submit.gathers.len(),
                    submit.total_words(),
                    submit.relocs.len(),
                    submit.waits.len(),
                    incrs.len()
                );
                self.channel.submit(&submit).and_then(|values| {
                    if values.len() == incrs.len() {
                        Ok(values)
                    } else {
                        Err(Error::SubmissionFailed)
                    }
                })
            }
        };

        let (fences, report) = match result {
            Ok(values) => {
                let fences: FenceSet = incrs
                    .iter()
                    .zip(values)
                    .map(|(incr, value)| Fence::new(incr.id, value))
                    .collect();
                self.cmdbuf.record_fences(&fences);
                self.last_fences = fences.clone();
                self.stats.submits += 1;
                let end = fences.get(stream_index).map_or(0, |f| f.value);
                let report = FlushReport {
                    syncpoint: self.syncpt,
                    base: end.wrapping_sub(stream_incrs),
                    count: stream_incrs,
                    bookkeeping_incrs: bookkeeping,
                    error: None,
                };
                (fences, report)
            }
            Err(err) => {
                if self.error.is_none() {
                    log::warn!("stream on {}: submission failed: {}", self.syncpt, err);
                }
                self.set_error(err);
                self.stats.failed_submits += 1;
                let report = FlushReport {
                    syncpoint: self.syncpt,
                    base: 0,
                    count: 0,
                    bookkeeping_incrs: 0,
                    error: Some(err),
                };
                (FenceSet::new(), report)
            }
        };

        self.tables.clear();
        // an epilogue that failed before gathering leaves words behind
        self.cmdbuf.discard_pending();
        self.manual_incrs = 0;
        self.held_mutexes = 0;

        if let Some(hook) = self.post_flush.as_mut() {
            hook(&report);
        }
        fences
    }

    /// Take the sticky error
    ///
    /// The first failure since the last call is returned once; later calls
    /// succeed until something fails again.
    pub fn get_error(&mut self) -> Result<()> {
        match self.error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn disassemble(&self) {
        let own = self.cmdbuf.active_handle();
        for gather in self.tables.gathers.iter().filter(|g| g.mem == own) {
            let Ok(words) = self.cmdbuf.active_mem().read(gather.offset / 4, gather.words) else {
                continue;
            };
            log::trace!("gather {} @{:#x}, {} words", gather.mem, gather.offset, gather.words);
            for line in Disassembler::new(&words) {
                match line {
                    Disassembled::Command(op) => log::trace!("  {}", op),
                    Disassembled::Data(word) => log::trace!("      {:#010x}", word),
                }
            }
        }
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    fn release(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if !self.is_idle() {
            log::warn!("stream on {} closed with unflushed work", self.syncpt);
        }
        let fences: ArrayVec<Fence, { 2 * MAX_SYNCPOINTS_PER_SUBMIT }> =
            self.cmdbuf.all_fences().copied().collect();
        let mut result = Ok(());
        for fence in &fences {
            if let Err(err) = self.channel.wait_syncpoint(fence.id, fence.value, WaitTimeout::Infinite) {
                result = Err(err);
            }
        }
        // memory still in flight is leaked rather than freed
        if result.is_ok() {
            for mem in self.cmdbuf.memories() {
                self.channel.free_memory(mem.clone());
            }
        }
        log::debug!("stream on {} closed after {} submits", self.syncpt, self.stats.submits);
        result
    }

    /// Wait for every submission to finish and free the command memory
    pub fn close(mut self) -> Result<()> {
        self.release()
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            log::warn!("stream on {} dropped: {}", self.syncpt, err);
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("module", &self.module)
            .field("syncpt", &self.syncpt)
            .field("half", &self.cmdbuf.active_index())
            .field("current", &self.cmdbuf.current())
            .field("error", &self.error)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
