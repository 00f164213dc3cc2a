//! # Soft Host
//!
//! An emulated host1x unit behind the [`ControlDevice`] interface.
//!
//! The soft host keeps the kernel side of the sync point contract: it
//! accounts promised increments at submit, patches relocations and
//! already-satisfied waits, and moves sync point values forward when work
//! retires. Work retires strictly in submission order. When a submission
//! retires, its gathers are fetched again and compared with what they held
//! at submit time; a mismatch means the writer reused memory the engine had
//! not finished with.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use cinder_core::opcode::{self, RELOC_PLACEHOLDER};
use cinder_core::sync::is_expired;
use cinder_core::{
    CmdMemory, Error, GatherEntry, MemHandle, ModuleId, MutexId, Priority, RelocEntry, Result,
    Submit, SyncPointId, SyncPointIncr, WaitBaseId, WaitEntry, WaitTimeout, RESERVED_SYNCPOINT,
};

use crate::device::{ChannelFd, ControlDevice};

// =============================================================================
// CONFIGURATION
// =============================================================================

/// When submitted work completes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionMode {
    /// Work retires as soon as it is submitted
    #[default]
    Immediate,
    /// Work retires when a waiter needs it to
    OnWait,
    /// Work retires only through [`SoftHost::retire_next`]
    Manual,
}

/// Registers statically assigned to one engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleResources {
    /// Engine
    pub module: ModuleId,
    /// Sync points, by index
    pub syncpts: Vec<SyncPointId>,
    /// Wait bases, by index
    pub wait_bases: Vec<WaitBaseId>,
    /// Hardware mutexes, by index
    pub mutexes: Vec<MutexId>,
}

impl ModuleResources {
    fn new(module: ModuleId, syncpts: &[u32], wait_bases: &[u32], mutexes: &[u32]) -> Self {
        Self {
            module,
            syncpts: syncpts.iter().copied().map(SyncPointId::new).collect(),
            wait_bases: wait_bases.iter().copied().map(WaitBaseId::new).collect(),
            mutexes: mutexes.iter().copied().map(MutexId::new).collect(),
        }
    }
}

/// Soft host configuration
#[derive(Debug, Clone)]
pub struct SoftHostConfig {
    /// Sync point registers
    pub num_syncpoints: u32,
    /// Wait base registers
    pub num_wait_bases: u32,
    /// Static resource assignment
    pub modules: Vec<ModuleResources>,
    /// Completion behavior
    pub completion: CompletionMode,
}

impl SoftHostConfig {
    /// Use `mode` for completion
    pub fn with_completion(mut self, mode: CompletionMode) -> Self {
        self.completion = mode;
        self
    }

    /// Use `count` sync point registers
    pub fn with_syncpoints(mut self, count: u32) -> Self {
        self.num_syncpoints = count;
        self
    }
}

impl Default for SoftHostConfig {
    fn default() -> Self {
        Self {
            num_syncpoints: 32,
            num_wait_bases: 8,
            modules: vec![
                ModuleResources::new(ModuleId::Host, &[26], &[6], &[]),
                ModuleResources::new(ModuleId::Display, &[24, 25], &[], &[]),
                ModuleResources::new(ModuleId::Gr2d, &[18, 19], &[2], &[1]),
                ModuleResources::new(ModuleId::Gr3d, &[22], &[1], &[2]),
                ModuleResources::new(ModuleId::Mpe, &[17], &[3], &[4]),
                ModuleResources::new(ModuleId::Vi, &[12], &[], &[]),
                ModuleResources::new(ModuleId::Isp, &[13], &[], &[]),
                ModuleResources::new(ModuleId::Vic, &[10], &[4], &[3]),
                ModuleResources::new(ModuleId::Msenc, &[11], &[5], &[]),
                ModuleResources::new(ModuleId::Tsec, &[9], &[], &[]),
            ],
            completion: CompletionMode::Immediate,
        }
    }
}

// =============================================================================
// RECORDS
// =============================================================================

/// A submission as the soft host received it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRecord {
    /// Channel
    pub fd: ChannelFd,
    /// Gathers
    pub gathers: Vec<GatherEntry>,
    /// Words of each gather as fetched, after patching
    pub gather_words: Vec<Vec<u32>>,
    /// Relocations
    pub relocs: Vec<RelocEntry>,
    /// Wait checks
    pub waits: Vec<WaitEntry>,
    /// Increments
    pub incrs: Vec<SyncPointIncr>,
    /// Index of the stream's own sync point
    pub stream_syncpt_index: usize,
    /// Returned fence values
    pub fences: Vec<u32>,
    /// Engine
    pub module: Option<ModuleId>,
    /// Null kickoff requested
    pub null_kickoff: bool,
}

/// A blocking wait the soft host was asked to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitRecord {
    /// Sync point
    pub id: SyncPointId,
    /// Threshold
    pub thresh: u32,
    /// Timeout requested
    pub timeout: WaitTimeout,
}

// =============================================================================
// STATE
// =============================================================================

#[derive(Debug, Clone, Copy, Default)]
struct SyncPoint {
    min: u32,
    max: u32,
}

#[derive(Debug)]
struct Fetch {
    mem: CmdMemory,
    offset: u32,
    snapshot: Vec<u32>,
}

#[derive(Debug)]
struct InFlight {
    fences: Vec<(SyncPointId, u32)>,
    fetches: Vec<Fetch>,
}

#[derive(Debug)]
struct OpenChannel {
    modules: Vec<ModuleId>,
    priority: Priority,
    dynamic: Option<(SyncPointId, WaitBaseId)>,
}

#[derive(Debug)]
struct State {
    completion: CompletionMode,
    syncpts: Vec<SyncPoint>,
    channels: BTreeMap<ChannelFd, OpenChannel>,
    next_fd: u32,
    memory: BTreeMap<MemHandle, CmdMemory>,
    next_handle: u32,
    in_flight: VecDeque<InFlight>,
    free_syncpts: Vec<SyncPointId>,
    free_wait_bases: Vec<WaitBaseId>,
    fail_next: Option<Error>,
    submissions: Vec<SubmitRecord>,
    waits: Vec<WaitRecord>,
    stale_fetches: u32,
}

// =============================================================================
// SOFT HOST
// =============================================================================

/// Emulated host1x unit
#[derive(Debug)]
pub struct SoftHost {
    modules: Vec<ModuleResources>,
    num_syncpoints: u32,
    state: Mutex<State>,
    progress: Condvar,
}

impl SoftHost {
    /// Create a soft host
    pub fn new(config: SoftHostConfig) -> Self {
        let assigned_sp = |id: u32| {
            config.modules.iter().any(|m| m.syncpts.iter().any(|s| s.raw() == id))
        };
        let assigned_wb = |id: u32| {
            config.modules.iter().any(|m| m.wait_bases.iter().any(|w| w.raw() == id))
        };
        // Popped from the back, so the lowest free register goes first
        let free_syncpts = (1..config.num_syncpoints)
            .rev()
            .filter(|&id| !assigned_sp(id))
            .map(SyncPointId::new)
            .collect();
        let free_wait_bases = (1..config.num_wait_bases)
            .rev()
            .filter(|&id| !assigned_wb(id))
            .map(WaitBaseId::new)
            .collect();

        Self {
            num_syncpoints: config.num_syncpoints,
            state: Mutex::new(State {
                completion: config.completion,
                syncpts: vec![SyncPoint::default(); config.num_syncpoints as usize],
                channels: BTreeMap::new(),
                next_fd: 3,
                memory: BTreeMap::new(),
                next_handle: 1,
                in_flight: VecDeque::new(),
                free_syncpts,
                free_wait_bases,
                fail_next: None,
                submissions: Vec::new(),
                waits: Vec::new(),
                stale_fetches: 0,
            }),
            progress: Condvar::new(),
            modules: config.modules,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resources(&self, module: ModuleId) -> Result<&ModuleResources> {
        self.modules.iter().find(|m| m.module == module).ok_or(Error::NotFound)
    }

    fn check_id(&self, id: SyncPointId) -> Result<()> {
        if id.raw() < self.num_syncpoints {
            Ok(())
        } else {
            Err(Error::InvalidParameter)
        }
    }

    /// Device address the soft host assigns to a buffer
    pub fn iova(handle: MemHandle) -> u32 {
        match handle {
            MemHandle::Handle(h) => 0x4000_0000u32.wrapping_add(h.wrapping_mul(0x0010_0000)),
            MemHandle::FdBacked(fd) => 0x8000_0000u32.wrapping_add((fd as u32).wrapping_mul(0x0010_0000)),
        }
    }

    /// Register a buffer imported from a file descriptor
    pub fn import_fd(&self, fd: i32, words: u32) -> CmdMemory {
        let mem = CmdMemory::new(MemHandle::FdBacked(fd), words);
        self.state().memory.insert(mem.handle(), mem.clone());
        mem
    }

    /// Look up a live buffer
    pub fn memory(&self, handle: MemHandle) -> Option<CmdMemory> {
        self.state().memory.get(&handle).cloned()
    }

    // =========================================================================
    // TEST AND SIMULATION HOOKS
    // =========================================================================

    /// Change how work completes
    pub fn set_completion(&self, mode: CompletionMode) {
        self.state().completion = mode;
    }

    /// Fail the next submission with `err`
    pub fn fail_next_submit(&self, err: Error) {
        self.state().fail_next = Some(err);
    }

    /// Force a sync point to `value` with nothing outstanding
    pub fn set_syncpoint(&self, id: SyncPointId, value: u32) -> Result<()> {
        self.check_id(id)?;
        let mut st = self.state();
        st.syncpts[id.index()] = SyncPoint { min: value, max: value };
        Ok(())
    }

    /// Increment a sync point from the CPU
    pub fn cpu_incr(&self, id: SyncPointId) -> Result<u32> {
        self.check_id(id)?;
        let mut st = self.state();
        let sp = &mut st.syncpts[id.index()];
        sp.min = sp.min.wrapping_add(1);
        sp.max = sp.max.wrapping_add(1);
        let value = sp.min;
        drop(st);
        self.progress.notify_all();
        Ok(value)
    }

    /// Retire the oldest in-flight submission
    pub fn retire_next(&self) -> bool {
        let retired = Self::retire_locked(&mut self.state());
        if retired {
            self.progress.notify_all();
        }
        retired
    }

    /// Retire everything in flight
    pub fn retire_all(&self) -> usize {
        let mut st = self.state();
        let mut count = 0;
        while Self::retire_locked(&mut st) {
            count += 1;
        }
        drop(st);
        self.progress.notify_all();
        count
    }

    /// Priority last set on `fd`
    pub fn priority(&self, fd: ChannelFd) -> Option<Priority> {
        self.state().channels.get(&fd).map(|c| c.priority)
    }

    /// Submissions not yet retired
    pub fn in_flight(&self) -> usize {
        self.state().in_flight.len()
    }

    /// Every submission received
    pub fn submissions(&self) -> Vec<SubmitRecord> {
        self.state().submissions.clone()
    }

    /// Number of submissions received
    pub fn submit_count(&self) -> usize {
        self.state().submissions.len()
    }

    /// Every blocking wait requested
    pub fn waits(&self) -> Vec<WaitRecord> {
        self.state().waits.clone()
    }

    /// Gathers whose memory changed between submit and retirement
    pub fn stale_fetches(&self) -> u32 {
        self.state().stale_fetches
    }

    /// Channels currently open
    pub fn open_channels(&self) -> usize {
        self.state().channels.len()
    }

    // =========================================================================
    // INTERNALS
    // =========================================================================

    fn retire_locked(st: &mut State) -> bool {
        let Some(work) = st.in_flight.pop_front() else {
            return false;
        };
        for fetch in &work.fetches {
            let now = fetch.mem.read(fetch.offset, fetch.snapshot.len() as u32);
            if now.as_deref() != Ok(fetch.snapshot.as_slice()) {
                log::error!(
                    "stale fetch from {} at word {}: memory rewritten while in flight",
                    fetch.mem.handle(),
                    fetch.offset
                );
                st.stale_fetches += 1;
            }
        }
        for &(id, fence) in &work.fences {
            let sp = &mut st.syncpts[id.index()];
            if !is_expired(sp.min, fence, sp.max) {
                sp.min = fence;
            }
        }
        true
    }

    /// Check `module` is reachable from `fd`; returns the channel's dynamic
    /// pair if it has one
    fn reachable(&self, fd: ChannelFd, module: ModuleId) -> Result<Option<(SyncPointId, WaitBaseId)>> {
        let st = self.state();
        let channel = st.channels.get(&fd).ok_or(Error::InvalidParameter)?;
        if module != ModuleId::Host && !channel.modules.contains(&module) {
            return Err(Error::NotFound);
        }
        Ok(channel.dynamic)
    }

    fn resolve(st: &State, handle: MemHandle) -> Result<CmdMemory> {
        st.memory.get(&handle).cloned().ok_or(Error::NotFound)
    }

    /// Check every handle and offset a submission refers to, so a rejected
    /// submission leaves memory untouched
    fn validate(st: &State, submit: &Submit<'_>) -> Result<()> {
        for reloc in submit.relocs {
            Self::resolve(st, reloc.cmdbuf)?.read_word(reloc.cmdbuf_offset / 4)?;
            Self::resolve(st, reloc.target)?;
        }
        for wait in submit.waits {
            st.syncpts.get(wait.syncpt.index()).ok_or(Error::InvalidParameter)?;
            Self::resolve(st, wait.cmdbuf)?.read_word(wait.cmdbuf_offset / 4)?;
        }
        for gather in submit.gathers {
            if gather.offset % 4 != 0 {
                return Err(Error::InvalidParameter);
            }
            let mem = Self::resolve(st, gather.mem)?;
            let end = (gather.offset / 4).checked_add(gather.words).ok_or(Error::InvalidParameter)?;
            if end > mem.len_words() {
                return Err(Error::InvalidParameter);
            }
        }
        Ok(())
    }

    fn patch_relocs(st: &State, relocs: &[RelocEntry]) -> Result<()> {
        for reloc in relocs {
            let mem = Self::resolve(st, reloc.cmdbuf)?;
            let at = reloc.cmdbuf_offset / 4;
            if mem.read_word(at)? != RELOC_PLACEHOLDER {
                log::warn!("relocation at {}+{} does not cover a placeholder", reloc.cmdbuf, reloc.cmdbuf_offset);
            }
            Self::resolve(st, reloc.target)?;
            let addr = Self::iova(reloc.target).wrapping_add(reloc.target_offset) >> reloc.shift;
            mem.write(at, &[addr])?;
        }
        Ok(())
    }

    fn patch_waits(st: &State, waits: &[WaitEntry]) -> Result<()> {
        for wait in waits {
            let sp = st.syncpts.get(wait.syncpt.index()).ok_or(Error::InvalidParameter)?;
            if is_expired(sp.min, wait.thresh, sp.max) {
                let mem = Self::resolve(st, wait.cmdbuf)?;
                mem.write(wait.cmdbuf_offset / 4, &[opcode::wait_syncpt(RESERVED_SYNCPOINT, 0)])?;
            }
        }
        Ok(())
    }

    fn snapshot(st: &State, gathers: &[GatherEntry]) -> Result<Vec<Fetch>> {
        gathers
            .iter()
            .map(|g| {
                if g.offset % 4 != 0 {
                    return Err(Error::InvalidParameter);
                }
                let mem = Self::resolve(st, g.mem)?;
                let snapshot = mem.read(g.offset / 4, g.words).map_err(|_| Error::InvalidParameter)?;
                Ok(Fetch { mem, offset: g.offset / 4, snapshot })
            })
            .collect()
    }
}

impl ControlDevice for SoftHost {
    fn open_channel(&self, modules: &[ModuleId]) -> Result<ChannelFd> {
        for &module in modules {
            self.resources(module)?;
        }
        let mut st = self.state();
        let fd = ChannelFd(st.next_fd);
        st.next_fd += 1;
        st.channels.insert(
            fd,
            OpenChannel { modules: modules.to_vec(), priority: Priority::default(), dynamic: None },
        );
        Ok(fd)
    }

    fn close_channel(&self, fd: ChannelFd) {
        let mut st = self.state();
        if let Some(ch) = st.channels.remove(&fd) {
            if let Some((sp, wb)) = ch.dynamic {
                st.free_syncpts.push(sp);
                st.free_wait_bases.push(wb);
            }
        }
    }

    fn submit(&self, fd: ChannelFd, submit: &Submit<'_>) -> Result<Vec<u32>> {
        let mut st = self.state();
        if !st.channels.contains_key(&fd) {
            return Err(Error::InvalidParameter);
        }
        if let Some(err) = st.fail_next.take() {
            log::debug!("soft host failing submission on {:?} with {}", fd, err);
            return Err(err);
        }
        for incr in submit.syncpt_incrs {
            self.check_id(incr.id)?;
        }

        Self::validate(&st, submit)?;
        Self::patch_relocs(&st, submit.relocs)?;
        Self::patch_waits(&st, submit.waits)?;
        let fetches = Self::snapshot(&st, submit.gathers)?;

        let mut fences = Vec::with_capacity(submit.syncpt_incrs.len());
        for incr in submit.syncpt_incrs {
            let sp = &mut st.syncpts[incr.id.index()];
            sp.max = sp.max.wrapping_add(incr.incrs);
            fences.push(sp.max);
        }

        st.submissions.push(SubmitRecord {
            fd,
            gathers: submit.gathers.to_vec(),
            gather_words: fetches.iter().map(|f| f.snapshot.clone()).collect(),
            relocs: submit.relocs.to_vec(),
            waits: submit.waits.to_vec(),
            incrs: submit.syncpt_incrs.to_vec(),
            stream_syncpt_index: submit.stream_syncpt_index,
            fences: fences.clone(),
            module: submit.module,
            null_kickoff: submit.null_kickoff,
        });
        st.in_flight.push_back(InFlight {
            fences: submit.syncpt_incrs.iter().map(|i| i.id).zip(fences.iter().copied()).collect(),
            fetches,
        });

        if st.completion == CompletionMode::Immediate {
            while Self::retire_locked(&mut st) {}
            drop(st);
            self.progress.notify_all();
        }
        Ok(fences)
    }

    fn syncpt_read(&self, id: SyncPointId) -> Result<u32> {
        self.check_id(id)?;
        Ok(self.state().syncpts[id.index()].min)
    }

    fn syncpt_read_max(&self, id: SyncPointId) -> Result<u32> {
        self.check_id(id)?;
        Ok(self.state().syncpts[id.index()].max)
    }

    fn syncpt_wait(&self, id: SyncPointId, thresh: u32, timeout: WaitTimeout) -> Result<u32> {
        self.check_id(id)?;
        let deadline = timeout.as_duration().map(|d| Instant::now() + d);
        let mut st = self.state();
        st.waits.push(WaitRecord { id, thresh, timeout });
        loop {
            let sp = st.syncpts[id.index()];
            if is_expired(sp.min, thresh, sp.max) {
                return Ok(sp.min);
            }
            if st.completion == CompletionMode::OnWait && Self::retire_locked(&mut st) {
                self.progress.notify_all();
                continue;
            }
            match deadline {
                None => {
                    st = self.progress.wait(st).unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout);
                    }
                    st = self
                        .progress
                        .wait_timeout(st, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
    }

    fn channel_syncpoint(&self, fd: ChannelFd, module: ModuleId, index: u32) -> Result<SyncPointId> {
        if let Some((sp, _)) = self.reachable(fd, module)? {
            return Ok(sp);
        }
        let res = self.resources(module)?;
        res.syncpts.get(index as usize).copied().ok_or(Error::InvalidParameter)
    }

    fn channel_wait_base(&self, fd: ChannelFd, module: ModuleId, index: u32) -> Result<WaitBaseId> {
        if let Some((_, wb)) = self.reachable(fd, module)? {
            return Ok(wb);
        }
        let res = self.resources(module)?;
        res.wait_bases.get(index as usize).copied().ok_or(Error::InvalidParameter)
    }

    fn channel_mutex(&self, fd: ChannelFd, module: ModuleId, index: u32) -> Result<MutexId> {
        self.reachable(fd, module)?;
        let res = self.resources(module)?;
        res.mutexes.get(index as usize).copied().ok_or(Error::InvalidParameter)
    }

    fn set_priority(&self, fd: ChannelFd, priority: Priority) -> Result<()> {
        let mut st = self.state();
        let channel = st.channels.get_mut(&fd).ok_or(Error::InvalidParameter)?;
        channel.priority = priority;
        Ok(())
    }

    fn set_priority_dynamic(
        &self,
        fd: ChannelFd,
        priority: Priority,
        syncpt_index: u32,
        wait_base_index: u32,
    ) -> Result<(SyncPointId, WaitBaseId)> {
        // One dynamic pair per channel, whatever the index
        if syncpt_index != 0 || wait_base_index != 0 {
            return Err(Error::InvalidParameter);
        }
        let mut st = self.state();
        let st = &mut *st;
        let channel = st.channels.get_mut(&fd).ok_or(Error::InvalidParameter)?;
        channel.priority = priority;
        if let Some(pair) = channel.dynamic {
            return Ok(pair);
        }
        let (Some(&sp), Some(&wb)) = (st.free_syncpts.last(), st.free_wait_bases.last()) else {
            return Err(Error::InsufficientResources);
        };
        st.free_syncpts.pop();
        st.free_wait_bases.pop();
        log::debug!("soft host: {:?} at priority {} gets {} / {}", fd, priority.raw(), sp, wb);
        channel.dynamic = Some((sp, wb));
        Ok((sp, wb))
    }

    fn num_syncpoints(&self) -> u32 {
        self.num_syncpoints
    }

    fn alloc_memory(&self, words: u32) -> Result<CmdMemory> {
        if words == 0 {
            return Err(Error::InvalidParameter);
        }
        let mut st = self.state();
        let mem = CmdMemory::new(MemHandle::Handle(st.next_handle), words);
        st.next_handle += 1;
        st.memory.insert(mem.handle(), mem.clone());
        Ok(mem)
    }

    fn free_memory(&self, mem: CmdMemory) {
        self.state().memory.remove(&mem.handle());
    }
}
