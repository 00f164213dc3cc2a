//! # Stream Configuration
//!
//! Sizes, limits and behavior flags of a stream.

use bitflags::bitflags;
use cinder_core::{Error, Result, SyncPointId, WaitBaseId};
use static_assertions::const_assert;

// =============================================================================
// LIMITS
// =============================================================================

/// Default size of both command buffer halves together, in bytes
pub const CMDBUF_SIZE_DEFAULT: u32 = 32 * 1024;

/// Smallest accepted command buffer size, in bytes
pub const CMDBUF_SIZE_MIN: u32 = 24 * 1024;

/// Command buffer sizes are multiples of this, in bytes
pub const CMDBUF_GRANULARITY: u32 = 8 * 1024;

/// Gather table capacity
pub const GATHER_TABLE_SIZE: usize = 256;

/// Relocation table capacity
pub const RELOC_TABLE_SIZE: usize = 1024;

/// Wait table capacity
pub const WAIT_TABLE_SIZE: usize = 256;

/// Most words plus relocations one `begin` may reserve
pub const BEGIN_MAX_WORDS: u32 = 2048;

/// Most relocations one `begin` may reserve
pub const BEGIN_MAX_RELOCS: u32 = 256;

/// Most gathers one `begin` may reserve
pub const BEGIN_MAX_GATHERS: u32 = 16;

/// Most waits one `begin` may reserve
pub const BEGIN_MAX_WAITS: u32 = 16;

/// Words one reserved wait may write: class switch, opcode, data, class restore
pub const WAIT_WORDS: u32 = 4;

/// Most distinct sync points one submission may increment
pub const MAX_SYNCPOINTS_PER_SUBMIT: usize = 32;

/// Sync point ids a stream can track
pub const MAX_SYNCPOINTS: usize = 128;

/// Default number of touched sync points with wait bases per submission
pub const MAX_WAIT_BASE_SYNCPTS_DEFAULT: u32 = 2;

const_assert!(CMDBUF_SIZE_MIN % CMDBUF_GRANULARITY == 0);
const_assert!(CMDBUF_SIZE_DEFAULT % CMDBUF_GRANULARITY == 0);
const_assert!(CMDBUF_SIZE_DEFAULT >= CMDBUF_SIZE_MIN);
// The largest single reservation fits in one half of the smallest buffer
const_assert!(
    (BEGIN_MAX_WORDS + BEGIN_MAX_WAITS * WAIT_WORDS + 2 + 4 * MAX_SYNCPOINTS_PER_SUBMIT as u32) * 4
        <= CMDBUF_SIZE_MIN / 2
);
const_assert!(BEGIN_MAX_GATHERS as usize * 2 + 2 <= GATHER_TABLE_SIZE);
const_assert!(BEGIN_MAX_RELOCS as usize <= RELOC_TABLE_SIZE);
const_assert!(BEGIN_MAX_WAITS as usize <= WAIT_TABLE_SIZE);
const_assert!(MAX_SYNCPOINTS_PER_SUBMIT <= MAX_SYNCPOINTS);
const_assert!(MAX_SYNCPOINTS <= 128);

// =============================================================================
// FLAGS
// =============================================================================

bitflags! {
    /// Stream behavior flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StreamFlags: u32 {
        /// The caller emits the stream sync point's trailing increment itself
        const CLIENT_MANAGED = 1 << 0;
        /// The trailing increment fires immediately instead of on op-done
        const USE_IMMEDIATE  = 1 << 1;
        /// Submissions account increments without executing
        const NULL_KICKOFF   = 1 << 2;
        /// Trace-log every submitted command word
        const DISASM         = 1 << 3;
    }
}

// =============================================================================
// STREAM CONFIG
// =============================================================================

/// Stream configuration
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Size of both halves together, in bytes
    pub cmdbuf_size: u32,
    /// Sync point override; the module's first sync point otherwise
    pub syncpoint: Option<SyncPointId>,
    /// Wait base attached to the stream sync point
    pub wait_base: Option<WaitBaseId>,
    /// Behavior flags
    pub flags: StreamFlags,
    /// Touched sync points with wait bases one submission may carry
    pub max_wait_base_syncpts: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            cmdbuf_size: CMDBUF_SIZE_DEFAULT,
            syncpoint: None,
            wait_base: None,
            flags: StreamFlags::empty(),
            max_wait_base_syncpts: MAX_WAIT_BASE_SYNCPTS_DEFAULT,
        }
    }
}

impl StreamConfig {
    /// Set the command buffer size in bytes
    pub fn with_cmdbuf_size(mut self, bytes: u32) -> Self {
        self.cmdbuf_size = bytes;
        self
    }

    /// Use a specific sync point
    pub fn with_syncpoint(mut self, id: SyncPointId) -> Self {
        self.syncpoint = Some(id);
        self
    }

    /// Attach a wait base to the stream sync point
    pub fn with_wait_base(mut self, id: WaitBaseId) -> Self {
        self.wait_base = Some(id);
        self
    }

    /// Set behavior flags
    pub fn with_flags(mut self, flags: StreamFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set how many wait-base sync points one submission may touch
    pub fn with_max_wait_base_syncpts(mut self, n: u32) -> Self {
        self.max_wait_base_syncpts = n;
        self
    }

    /// Words in each half
    pub fn half_words(&self) -> u32 {
        self.cmdbuf_size / 8
    }

    /// Words each half holds back for the flush epilogue
    ///
    /// Covers the trailing increment and one wait-base advance per allowed
    /// wait-base sync point.
    pub fn bookkeeping_words(&self) -> u32 {
        2 + 4 * self.max_wait_base_syncpts
    }

    /// Check the configuration
    pub fn validate(&self) -> Result<()> {
        if self.cmdbuf_size % CMDBUF_GRANULARITY != 0 {
            return Err(Error::InvalidParameter);
        }
        if self.cmdbuf_size < CMDBUF_SIZE_MIN {
            return Err(Error::InsufficientResources);
        }
        if self.max_wait_base_syncpts as usize > MAX_SYNCPOINTS_PER_SUBMIT {
            return Err(Error::InvalidParameter);
        }
        // the stream's own wait base needs a slot in every submission
        if self.wait_base.is_some() && self.max_wait_base_syncpts == 0 {
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = StreamConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.half_words(), 4096);
        assert_eq!(config.bookkeeping_words() * 4, 40);
    }

    #[test]
    fn test_size_rules() {
        let odd = StreamConfig::default().with_cmdbuf_size(CMDBUF_SIZE_MIN + 4);
        assert_eq!(odd.validate(), Err(Error::InvalidParameter));

        let small = StreamConfig::default().with_cmdbuf_size(CMDBUF_GRANULARITY * 2);
        assert_eq!(small.validate(), Err(Error::InsufficientResources));

        let min = StreamConfig::default().with_cmdbuf_size(CMDBUF_SIZE_MIN);
        assert!(min.validate().is_ok());
    }

    #[test]
    fn test_wait_base_cap() {
        let config = StreamConfig::default().with_max_wait_base_syncpts(33);
        assert_eq!(config.validate(), Err(Error::InvalidParameter));

        let config = StreamConfig::default()
            .with_wait_base(WaitBaseId::new(1))
            .with_max_wait_base_syncpts(0);
        assert_eq!(config.validate(), Err(Error::InvalidParameter));
        assert!(config.with_max_wait_base_syncpts(1).validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = StreamConfig::default()
            .with_syncpoint(SyncPointId::new(5))
            .with_wait_base(WaitBaseId::new(2))
            .with_flags(StreamFlags::CLIENT_MANAGED | StreamFlags::DISASM);
        assert_eq!(config.syncpoint, Some(SyncPointId::new(5)));
        assert_eq!(config.wait_base, Some(WaitBaseId::new(2)));
        assert!(config.flags.contains(StreamFlags::CLIENT_MANAGED));
        assert!(!config.flags.contains(StreamFlags::USE_IMMEDIATE));
    }
}
