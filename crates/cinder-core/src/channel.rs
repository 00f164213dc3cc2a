//! # Channel Contract
//!
//! A channel is one ordered hardware command queue. Streams build batches
//! and hand them to [`Channel::submit`]; everything else on the trait is
//! sync point observation and static resource discovery.
//!
//! Submissions from one channel begin execution in the order they were
//! submitted. Nothing here orders submissions across channels.

use alloc::vec::Vec;

use crate::error::Result;
use crate::memory::CmdMemory;
use crate::sync::WaitTimeout;
use crate::types::{MemHandle, ModuleId, MutexId, Priority, SyncPointId, WaitBaseId};

// =============================================================================
// SUBMISSION DESCRIPTORS
// =============================================================================

/// How the engine consumes a gathered range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GatherKind {
    /// The range holds command words
    #[default]
    Plain,
    /// The range is data written to consecutive registers from `reg`
    Incr(u32),
    /// The range is data written to register `reg` repeatedly
    NonIncr(u32),
}

/// Reference to a range of command memory executed in place
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatherEntry {
    /// Memory holding the range
    pub mem: MemHandle,
    /// Byte offset of the first word
    pub offset: u32,
    /// Number of words
    pub words: u32,
    /// Interpretation of the words
    pub kind: GatherKind,
}

/// A placeholder word to patch with a buffer address at submit time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocEntry {
    /// Command buffer holding the placeholder
    pub cmdbuf: MemHandle,
    /// Byte offset of the placeholder
    pub cmdbuf_offset: u32,
    /// Buffer whose address is written
    pub target: MemHandle,
    /// Byte offset added to the target address
    pub target_offset: u32,
    /// Right shift applied to the final address
    pub shift: u32,
}

/// Location of a WAIT_SYNCPT data word the transport may elide
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitEntry {
    /// Command buffer holding the wait
    pub cmdbuf: MemHandle,
    /// Byte offset of the data word
    pub cmdbuf_offset: u32,
    /// Sync point waited on
    pub syncpt: SyncPointId,
    /// Full 32-bit threshold (the command word only carries 24 bits)
    pub thresh: u32,
}

/// Increments one submission performs on one sync point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPointIncr {
    /// Sync point
    pub id: SyncPointId,
    /// Number of increments
    pub incrs: u32,
    /// Wait base advanced alongside, if any
    pub wait_base: Option<WaitBaseId>,
}

/// Everything a channel needs to run one batch
#[derive(Debug, Clone, Copy)]
pub struct Submit<'a> {
    /// Ranges to execute, in order
    pub gathers: &'a [GatherEntry],
    /// Address patches
    pub relocs: &'a [RelocEntry],
    /// Elidable waits
    pub waits: &'a [WaitEntry],
    /// Sync points incremented by the batch
    pub syncpt_incrs: &'a [SyncPointIncr],
    /// Index into `syncpt_incrs` of the submitting stream's own sync point
    pub stream_syncpt_index: usize,
    /// Engine the batch was last addressed to
    pub module: Option<ModuleId>,
    /// Skip execution but still account the increments
    pub null_kickoff: bool,
    /// Bit per sync point waited on in the batch
    pub waited_mask: u128,
}

impl Submit<'_> {
    /// Total words referenced by the gathers
    pub fn total_words(&self) -> u64 {
        self.gathers.iter().map(|g| g.words as u64).sum()
    }
}

// =============================================================================
// CHANNEL TRAIT
// =============================================================================

/// An ordered hardware command queue
///
/// Implementations synchronize internally; one channel may be shared by
/// many streams.
pub trait Channel: Send + Sync {
    /// Queue a batch
    ///
    /// Returns, for every entry of `submit.syncpt_incrs`, the value that
    /// sync point reaches once this batch's increments land. Either all of
    /// the batch's effects are accounted or none are.
    fn submit(&self, submit: &Submit<'_>) -> Result<Vec<u32>>;

    /// Current value of a sync point
    fn read_syncpoint(&self, id: SyncPointId) -> Result<u32>;

    /// Highest value promised to a sync point by submitted work
    fn read_syncpoint_max(&self, id: SyncPointId) -> Result<u32>;

    /// Block until `id` reaches `thresh`
    ///
    /// Returns the observed value, or `Error::Timeout` if `timeout` expires
    /// first. Never spins on the register.
    fn wait_syncpoint(&self, id: SyncPointId, thresh: u32, timeout: WaitTimeout) -> Result<u32>;

    /// Sync point `index` statically assigned to `module`
    fn module_syncpoint(&self, module: ModuleId, index: u32) -> Result<SyncPointId>;

    /// Wait base `index` statically assigned to `module`
    fn module_wait_base(&self, module: ModuleId, index: u32) -> Result<WaitBaseId>;

    /// Hardware mutex `index` guarding `module`
    fn module_mutex(&self, module: ModuleId, index: u32) -> Result<MutexId>;

    /// Set the channel's scheduling priority
    ///
    /// The sync point assignment is left alone, so this works in either
    /// mode.
    fn set_priority(&self, priority: Priority) -> Result<()>;

    /// Switch the channel to dynamically allocated sync points at `priority`
    ///
    /// Afterwards static discovery through [`Channel::module_syncpoint`]
    /// is no longer valid. Fails with `Error::InvalidState` once static
    /// sync points were handed out.
    fn set_priority_dynamic(
        &self,
        priority: Priority,
        syncpt_index: u32,
        wait_base_index: u32,
    ) -> Result<(SyncPointId, WaitBaseId)>;

    /// Number of sync point registers
    fn num_syncpoints(&self) -> u32;

    /// Allocate command memory of `words` words
    fn alloc_memory(&self, words: u32) -> Result<CmdMemory>;

    /// Release memory from [`Channel::alloc_memory`]
    fn free_memory(&self, mem: CmdMemory);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_words() {
        let gathers = [
            GatherEntry { mem: MemHandle::Handle(1), offset: 0, words: 10, kind: GatherKind::Plain },
            GatherEntry { mem: MemHandle::FdBacked(4), offset: 64, words: 6, kind: GatherKind::NonIncr(0x20) },
        ];
        let submit = Submit {
            gathers: &gathers,
            relocs: &[],
            waits: &[],
            syncpt_incrs: &[],
            stream_syncpt_index: 0,
            module: None,
            null_kickoff: false,
            waited_mask: 0,
        };
        assert_eq!(submit.total_words(), 16);
    }
}
