//! # Sched Client
//!
//! A stream plus the virtual sync point fed by its flushes.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::fmt;
use core::ops::Deref;

use cinder_core::opcode::{host, IncrCond};
use cinder_core::{
    Channel, ClassId, Error, Fence, MemHandle, ModuleId, MutexId, Result, SyncPointId, WaitBaseId,
    WaitTimeout,
};
use cinder_stream::{Cursor, FenceSet, FlushReport, Stream};
use spin::Mutex;

use crate::vsync::VirtualSyncPoint;

/// Callback run after every flush that had work
pub type FlushCallback = Box<dyn FnMut() + Send>;

/// State shared with the stream's post-flush hook
struct Shared {
    vsync: VirtualSyncPoint,
    callback: Option<FlushCallback>,
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("vsync", &self.vsync)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

// =============================================================================
// CLIENT
// =============================================================================

/// A stream whose own sync point is read through a virtual sync point
pub struct SchedClient {
    stream: Stream,
    channel: Arc<dyn Channel>,
    syncpt: SyncPointId,
    shared: Arc<Mutex<Shared>>,
}

impl SchedClient {
    /// Take over `stream`
    ///
    /// Installs the stream's post-flush hook; fails with
    /// `Error::NotSupported` if it already has one.
    pub fn new(mut stream: Stream) -> Result<Self> {
        let channel = Arc::clone(stream.channel());
        let syncpt = stream.syncpoint();
        let shared = Arc::new(Mutex::new(Shared {
            vsync: VirtualSyncPoint::new(syncpt),
            callback: None,
        }));

        let hook_shared = Arc::clone(&shared);
        let hook_channel = Arc::clone(&channel);
        stream.set_post_flush(Box::new(move |report: &FlushReport| {
            let min = if report.count > 0 && report.error.is_none() {
                hook_channel.read_syncpoint(report.syncpoint).unwrap_or(report.base)
            } else {
                report.base
            };
            let mut shared = hook_shared.lock();
            shared.vsync.on_flush(report, min);
            if let Some(callback) = shared.callback.as_mut() {
                callback();
            }
        }))?;

        log::debug!("sched client on {}", syncpt);
        Ok(Self { stream, channel, syncpt, shared })
    }

    /// The underlying stream
    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    /// Hardware sync point behind the virtual one
    pub fn syncpoint(&self) -> SyncPointId {
        self.syncpt
    }

    /// Next client value `push_incr` hands out
    pub fn next_value(&self) -> u32 {
        self.shared.lock().vsync.next_value()
    }

    /// Flushed ranges lost because the mapping table was full
    pub fn dropped_mappings(&self) -> u64 {
        self.shared.lock().vsync.dropped()
    }

    /// Run `callback` after every flush that had work
    pub fn set_flush_callback(&mut self, callback: FlushCallback) -> Result<()> {
        let mut shared = self.shared.lock();
        if shared.callback.is_some() {
            return Err(Error::NotSupported);
        }
        shared.callback = Some(callback);
        Ok(())
    }

    /// Reserve room on the stream, see [`Stream::begin`]
    pub fn begin(&mut self, words: u32, waits: u32, relocs: u32, gathers: u32) -> Result<SchedCursor<'_>> {
        let wait_base = self.stream.wait_base(self.syncpt);
        let cursor = self.stream.begin(words, waits, relocs, gathers)?;
        Ok(SchedCursor {
            cursor,
            shared: &self.shared,
            syncpt: self.syncpt,
            wait_base,
        })
    }

    /// Submit pending work
    pub fn flush(&mut self) -> FenceSet {
        self.stream.flush()
    }

    /// Take the stream's sticky error
    pub fn get_error(&mut self) -> Result<()> {
        self.stream.get_error()
    }

    /// Hardware value matching client `value`
    pub fn to_hardware(&self, value: u32) -> Option<u32> {
        self.shared.lock().vsync.to_hardware(value)
    }

    /// Newest client value known done, without touching hardware
    pub fn read_cached(&self) -> u32 {
        self.shared.lock().vsync.cached_min()
    }

    fn refresh(&self) -> Result<()> {
        let min = self.channel.read_syncpoint(self.syncpt)?;
        let max = self.channel.read_syncpoint_max(self.syncpt)?;
        self.shared.lock().vsync.update(min, max);
        Ok(())
    }

    /// Newest client value known done, after reading the hardware
    pub fn read_latest(&self) -> Result<u32> {
        self.refresh()?;
        Ok(self.read_cached())
    }

    /// Would waiting for `value` block right now?
    pub fn would_wait(&self, value: u32) -> Result<bool> {
        if !self.shared.lock().vsync.would_wait_cached(value) {
            return Ok(false);
        }
        self.refresh()?;
        Ok(self.shared.lock().vsync.would_wait_cached(value))
    }

    /// Block until client `value` is done
    ///
    /// Flushes first if `value` was not submitted yet. Fails with the
    /// stream's sticky error if a submission failed, `Error::Timeout` if
    /// `timeout` passes, and `Error::NotFound` if the value cannot be
    /// resolved to hardware.
    pub fn cpu_wait(&mut self, value: u32, timeout: WaitTimeout) -> Result<()> {
        self.stream.get_error()?;
        if !self.shared.lock().vsync.is_submitted(value) {
            self.stream.flush();
            self.stream.get_error()?;
        }

        let hw = {
            let shared = self.shared.lock();
            if !shared.vsync.would_wait_cached(value) {
                return Ok(());
            }
            shared.vsync.to_hardware(value)
        };
        let hw = hw.ok_or(Error::NotFound)?;

        let waited = self.channel.wait_syncpoint(self.syncpt, hw, timeout);
        self.refresh()?;
        waited.map(|_| ())
    }

    /// Flush and block until everything submitted so far is done
    pub fn flush_and_cpu_wait(&mut self) -> Result<()> {
        self.stream.flush();
        self.stream.get_error()?;
        let fences: FenceSet = self.stream.last_fences().iter().copied().collect();
        for fence in &fences {
            self.channel
                .wait_syncpoint(fence.id, fence.value, WaitTimeout::Infinite)?;
        }
        self.refresh()
    }

    /// Close the stream, waiting for its work
    pub fn close(self) -> Result<()> {
        {
            let shared = self.shared.lock();
            if shared.vsync.is_submitted(shared.vsync.next_value().wrapping_sub(1)) {
                log::debug!("sched client on {} closed", self.syncpt);
            } else {
                log::warn!(
                    "sched client on {} closed with client values reserved but never submitted",
                    self.syncpt
                );
            }
        }
        self.stream.close()
    }
}

impl fmt::Debug for SchedClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedClient")
            .field("syncpt", &self.syncpt)
            .field("stream", &self.stream)
            .field("shared", &self.shared)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// CURSOR
// =============================================================================

/// A stream cursor that also hands out virtual values
///
/// Reads go through to the [`Cursor`]. Writes are forwarded one by one so
/// that nothing but [`SchedCursor::push_incr`] and
/// [`SchedCursor::push_host_wait_last`] can count an increment of the
/// virtual sync point; an uncounted one would shift every later value.
#[derive(Debug)]
pub struct SchedCursor<'a> {
    cursor: Cursor<'a>,
    shared: &'a Mutex<Shared>,
    syncpt: SyncPointId,
    wait_base: Option<WaitBaseId>,
}

impl SchedCursor<'_> {
    /// Increment the virtual sync point; returns the client value that
    /// is done once the increment lands
    pub fn push_incr(&mut self, cond: IncrCond) -> Result<u32> {
        self.cursor.push_incr(self.syncpt, host::INCR_SYNCPT, cond, true)?;
        Ok(self.shared.lock().vsync.reserve())
    }

    /// Increment the virtual sync point and make the channel wait until
    /// it lands
    ///
    /// Needs a wait base on the stream's sync point.
    pub fn push_host_wait_last(&mut self, cond: IncrCond) -> Result<u32> {
        let wait_base = self.wait_base.ok_or(Error::NotSupported)?;
        self.cursor
            .push_wait_last(self.syncpt, wait_base, host::INCR_SYNCPT, cond)?;
        Ok(self.shared.lock().vsync.reserve())
    }

    /// Increment another sync point
    ///
    /// A tracked increment of the virtual sync point is
    /// `Error::InvalidParameter`; use [`SchedCursor::push_incr`].
    pub fn push_other_incr(&mut self, syncpt: SyncPointId, reg: u32, cond: IncrCond, tracked: bool) -> Result<()> {
        if tracked && syncpt == self.syncpt {
            return Err(Error::InvalidParameter);
        }
        self.cursor.push_incr(syncpt, reg, cond, tracked)
    }

    /// See [`Cursor::push_word`]
    pub fn push_word(&mut self, word: u32) -> Result<()> {
        self.cursor.push_word(word)
    }

    /// See [`Cursor::push_words`]
    pub fn push_words(&mut self, words: &[u32]) -> Result<()> {
        self.cursor.push_words(words)
    }

    /// See [`Cursor::push_set_class`]
    pub fn push_set_class(&mut self, module: ModuleId, class: ClassId) -> Result<()> {
        self.cursor.push_set_class(module, class)
    }

    /// See [`Cursor::push_reloc`]
    pub fn push_reloc(&mut self, target: MemHandle, target_offset: u32, shift: u32) -> Result<()> {
        self.cursor.push_reloc(target, target_offset, shift)
    }

    /// See [`Cursor::push_gather`]
    pub fn push_gather(&mut self, mem: MemHandle, offset: u32, words: u32) -> Result<()> {
        self.cursor.push_gather(mem, offset, words)
    }

    /// See [`Cursor::push_gather_incr`]
    pub fn push_gather_incr(&mut self, reg: u32, mem: MemHandle, offset: u32, words: u32) -> Result<()> {
        self.cursor.push_gather_incr(reg, mem, offset, words)
    }

    /// See [`Cursor::push_gather_nonincr`]
    pub fn push_gather_nonincr(&mut self, reg: u32, mem: MemHandle, offset: u32, words: u32) -> Result<()> {
        self.cursor.push_gather_nonincr(reg, mem, offset, words)
    }

    /// See [`Cursor::push_wait`]
    pub fn push_wait(&mut self, fence: Fence) -> Result<()> {
        self.cursor.push_wait(fence)
    }

    /// See [`Cursor::push_waits`]
    pub fn push_waits(&mut self, fences: &[Fence]) -> Result<()> {
        self.cursor.push_waits(fences)
    }

    /// See [`Cursor::push_wait_check`]
    pub fn push_wait_check(&mut self, fence: Fence) -> Result<()> {
        self.cursor.push_wait_check(fence)
    }

    /// See [`Cursor::push_acquire_mutex`]
    pub fn push_acquire_mutex(&mut self, id: MutexId) -> Result<()> {
        self.cursor.push_acquire_mutex(id)
    }

    /// See [`Cursor::push_release_mutex`]
    pub fn push_release_mutex(&mut self, id: MutexId) -> Result<()> {
        self.cursor.push_release_mutex(id)
    }

    /// End the reservation
    pub fn end(self) {}
}

impl<'a> Deref for SchedCursor<'a> {
    type Target = Cursor<'a>;

    fn deref(&self) -> &Cursor<'a> {
        &self.cursor
    }
}
