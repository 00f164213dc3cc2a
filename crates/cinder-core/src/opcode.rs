//! # Host1x Opcodes
//!
//! Encoders for the channel command words the stream engine emits, and a
//! decoder used to disassemble submitted buffers in trace logs.
//!
//! Every command word carries its opcode in bits 31:28:
//!
//! ```text
//!  31   28 27      16 15                    0
//! ┌──────┬───────────┬──────────────────────┐
//! │  op  │  address  │  count / value / ... │
//! └──────┴───────────┴──────────────────────┘
//! ```

use core::fmt;

use static_assertions::const_assert;

use crate::types::{ClassId, MutexId, SyncPointId, WaitBaseId};

// =============================================================================
// LIMITS
// =============================================================================

/// Largest word count a gather (or INCR/NONINCR burst) can describe
pub const GATHER_COUNT_MAX: u32 = 0x3fff;

/// Word written where a relocation will be patched at submit time
pub const RELOC_PLACEHOLDER: u32 = 0xDEAD_BEEF;

/// Width of the hardware wait threshold field
pub const WAIT_THRESH_MASK: u32 = 0x00ff_ffff;

const_assert!(GATHER_COUNT_MAX < (1 << 16));

// =============================================================================
// HOST CLASS REGISTERS
// =============================================================================

/// Host class register offsets
pub mod host {
    /// Increment a sync point (also present at offset 0 of every client class)
    pub const INCR_SYNCPT: u32 = 0x00;
    /// Block the channel until a sync point reaches a threshold
    pub const WAIT_SYNCPT: u32 = 0x08;
    /// Block until a sync point reaches wait base + offset
    pub const WAIT_SYNCPT_BASE: u32 = 0x09;
    /// Load a wait base register
    pub const LOAD_SYNCPT_BASE: u32 = 0x0b;
    /// Advance a wait base register
    pub const INCR_SYNCPT_BASE: u32 = 0x0c;
}

// =============================================================================
// INCREMENT CONDITION
// =============================================================================

/// When an engine performs a requested sync point increment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum IncrCond {
    /// As soon as the command is decoded
    Immediate = 0,
    /// Once all preceding operations are complete
    OpDone = 1,
    /// Once all preceding reads are complete
    RdDone = 2,
    /// Once it is safe to write registers again
    RegWrSafe = 3,
}

impl IncrCond {
    /// Decode the condition field of an INCR_SYNCPT data word
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Immediate),
            1 => Some(Self::OpDone),
            2 => Some(Self::RdDone),
            3 => Some(Self::RegWrSafe),
            _ => None,
        }
    }
}

// =============================================================================
// OPCODE ENCODERS
// =============================================================================

const OP_SETCLASS: u32 = 0;
const OP_INCR: u32 = 1;
const OP_NONINCR: u32 = 2;
const OP_MASK: u32 = 3;
const OP_IMM: u32 = 4;
const OP_RESTART: u32 = 5;
const OP_GATHER: u32 = 6;
const OP_EXTEND: u32 = 14;

const EXTEND_ACQUIRE_MLOCK: u32 = 0;
const EXTEND_RELEASE_MLOCK: u32 = 1;

/// Switch the channel to `class`, optionally writing registers by mask
#[inline]
pub const fn set_class(class: ClassId, offset: u32, mask: u32) -> u32 {
    (OP_SETCLASS << 28) | ((offset & 0xfff) << 16) | ((class.raw() & 0x3ff) << 6) | (mask & 0x3f)
}

/// Write `count` following words to consecutive registers from `addr`
#[inline]
pub const fn incr(addr: u32, count: u32) -> u32 {
    (OP_INCR << 28) | ((addr & 0xfff) << 16) | (count & 0xffff)
}

/// Write `count` following words to register `addr`
#[inline]
pub const fn nonincr(addr: u32, count: u32) -> u32 {
    (OP_NONINCR << 28) | ((addr & 0xfff) << 16) | (count & 0xffff)
}

/// Write following words to the registers selected by `mask` from `addr`
#[inline]
pub const fn mask(addr: u32, mask: u32) -> u32 {
    (OP_MASK << 28) | ((addr & 0xfff) << 16) | (mask & 0xffff)
}

/// Write a 16-bit immediate to register `addr`
#[inline]
pub const fn imm(addr: u32, value: u32) -> u32 {
    (OP_IMM << 28) | ((addr & 0xfff) << 16) | (value & 0xffff)
}

/// Acquire a hardware mutex; the channel stalls until it is granted
#[inline]
pub const fn acquire_mutex(id: MutexId) -> u32 {
    (OP_EXTEND << 28) | (EXTEND_ACQUIRE_MLOCK << 24) | (id.raw() & 0xff_ffff)
}

/// Release a hardware mutex
#[inline]
pub const fn release_mutex(id: MutexId) -> u32 {
    (OP_EXTEND << 28) | (EXTEND_RELEASE_MLOCK << 24) | (id.raw() & 0xff_ffff)
}

// =============================================================================
// REGISTER DATA ENCODERS
// =============================================================================

/// Data word for INCR_SYNCPT
#[inline]
pub const fn incr_syncpt(cond: IncrCond, id: SyncPointId) -> u32 {
    ((cond as u32) << 8) | (id.raw() & 0xff)
}

/// Data word for WAIT_SYNCPT; the threshold is truncated to 24 bits
#[inline]
pub const fn wait_syncpt(id: SyncPointId, thresh: u32) -> u32 {
    ((id.raw() & 0xff) << 24) | (thresh & WAIT_THRESH_MASK)
}

/// Data word for WAIT_SYNCPT_BASE
#[inline]
pub const fn wait_syncpt_base(id: SyncPointId, base: WaitBaseId, offset: u32) -> u32 {
    ((id.raw() & 0xff) << 24) | ((base.raw() & 0xff) << 16) | (offset & 0xffff)
}

/// Data word for INCR_SYNCPT_BASE
#[inline]
pub const fn incr_syncpt_base(base: WaitBaseId, offset: u32) -> u32 {
    ((base.raw() & 0xff) << 24) | (offset & 0xff_ffff)
}

/// Data word for LOAD_SYNCPT_BASE
#[inline]
pub const fn load_syncpt_base(base: WaitBaseId, value: u32) -> u32 {
    ((base.raw() & 0xff) << 24) | (value & 0xff_ffff)
}

// =============================================================================
// DECODER
// =============================================================================

/// A decoded command word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// SETCLASS
    SetClass {
        /// Class selected
        class: ClassId,
        /// First register written through `mask`
        offset: u32,
        /// Register mask
        mask: u32,
    },
    /// INCR
    Incr {
        /// First register
        addr: u32,
        /// Data words following
        count: u32,
    },
    /// NONINCR
    NonIncr {
        /// Register
        addr: u32,
        /// Data words following
        count: u32,
    },
    /// MASK
    Mask {
        /// First register
        addr: u32,
        /// Register mask
        mask: u32,
    },
    /// IMM
    Imm {
        /// Register
        addr: u32,
        /// Immediate value
        value: u32,
    },
    /// RESTART
    Restart {
        /// Restart address (in 16-byte units)
        addr: u32,
    },
    /// GATHER, followed by one address word
    Gather {
        /// Gather word count
        count: u32,
    },
    /// ACQUIRE_MLOCK
    AcquireMutex(MutexId),
    /// RELEASE_MLOCK
    ReleaseMutex(MutexId),
    /// Anything else
    Unknown(u32),
}

impl Opcode {
    /// Decode a command word
    pub const fn decode(word: u32) -> Self {
        let addr = (word >> 16) & 0xfff;
        match word >> 28 {
            OP_SETCLASS => Opcode::SetClass {
                class: ClassId::new((word >> 6) & 0x3ff),
                offset: addr,
                mask: word & 0x3f,
            },
            OP_INCR => Opcode::Incr { addr, count: word & 0xffff },
            OP_NONINCR => Opcode::NonIncr { addr, count: word & 0xffff },
            OP_MASK => Opcode::Mask { addr, mask: word & 0xffff },
            OP_IMM => Opcode::Imm { addr, value: word & 0xffff },
            OP_RESTART => Opcode::Restart { addr: word & 0x0fff_ffff },
            OP_GATHER => Opcode::Gather { count: word & 0x3fff },
            OP_EXTEND => match (word >> 24) & 0xf {
                EXTEND_ACQUIRE_MLOCK => Opcode::AcquireMutex(MutexId::new(word & 0xff_ffff)),
                EXTEND_RELEASE_MLOCK => Opcode::ReleaseMutex(MutexId::new(word & 0xff_ffff)),
                _ => Opcode::Unknown(word),
            },
            _ => Opcode::Unknown(word),
        }
    }

    /// Number of data words that follow this command word
    pub const fn data_words(&self) -> u32 {
        match self {
            Opcode::SetClass { mask, .. } => mask.count_ones(),
            Opcode::Incr { count, .. } | Opcode::NonIncr { count, .. } => *count,
            Opcode::Mask { mask, .. } => mask.count_ones(),
            Opcode::Gather { .. } => 1,
            _ => 0,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Opcode::SetClass { class, offset, mask } => {
                write!(f, "SETCL(class=0x{:x}, offset=0x{:x}, mask=0x{:x})", class.raw(), offset, mask)
            }
            Opcode::Incr { addr, count } => write!(f, "INCR(addr=0x{:x}, count={})", addr, count),
            Opcode::NonIncr { addr, count } => write!(f, "NONINCR(addr=0x{:x}, count={})", addr, count),
            Opcode::Mask { addr, mask } => write!(f, "MASK(addr=0x{:x}, mask=0x{:x})", addr, mask),
            Opcode::Imm { addr, value } => write!(f, "IMM(addr=0x{:x}, value=0x{:x})", addr, value),
            Opcode::Restart { addr } => write!(f, "RESTART(0x{:x})", addr),
            Opcode::Gather { count } => write!(f, "GATHER(count={})", count),
            Opcode::AcquireMutex(id) => write!(f, "ACQUIRE_MLOCK({})", id.raw()),
            Opcode::ReleaseMutex(id) => write!(f, "RELEASE_MLOCK({})", id.raw()),
            Opcode::Unknown(word) => write!(f, "UNKNOWN(0x{:08x})", word),
        }
    }
}

/// One line of a disassembled command stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disassembled {
    /// Command word
    Command(Opcode),
    /// Payload word of the preceding command
    Data(u32),
}

/// Walks a word slice, telling command words from their payload
#[derive(Debug, Clone)]
pub struct Disassembler<'a> {
    words: core::slice::Iter<'a, u32>,
    pending_data: u32,
}

impl<'a> Disassembler<'a> {
    /// Start at the first word of `words`, which must be a command word
    pub fn new(words: &'a [u32]) -> Self {
        Self { words: words.iter(), pending_data: 0 }
    }
}

impl Iterator for Disassembler<'_> {
    type Item = Disassembled;

    fn next(&mut self) -> Option<Self::Item> {
        let word = *self.words.next()?;
        if self.pending_data > 0 {
            self.pending_data -= 1;
            return Some(Disassembled::Data(word));
        }
        let op = Opcode::decode(word);
        self.pending_data = op.data_words();
        Some(Disassembled::Command(op))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[test]
    fn test_encodings() {
        assert_eq!(set_class(ClassId::GR3D, 0, 0), 0x0000_1800);
        assert_eq!(nonincr(host::INCR_SYNCPT, 1), 0x2000_0001);
        assert_eq!(incr(0x10, 3), 0x1010_0003);
        assert_eq!(imm(0x4e, 0x12), 0x404e_0012);
        assert_eq!(acquire_mutex(MutexId::new(3)), 0xe000_0003);
        assert_eq!(release_mutex(MutexId::new(3)), 0xe100_0003);
    }

    #[test]
    fn test_register_data() {
        let sp = SyncPointId::new(22);
        assert_eq!(incr_syncpt(IncrCond::OpDone, sp), 0x116);
        assert_eq!(incr_syncpt(IncrCond::Immediate, sp), 0x16);
        assert_eq!(wait_syncpt(sp, 0x0123_4567), 0x1623_4567);
        assert_eq!(incr_syncpt_base(WaitBaseId::new(1), 4), 0x0100_0004);
        assert_eq!(wait_syncpt_base(sp, WaitBaseId::new(1), 2), 0x1601_0002);
    }

    #[test]
    fn test_decode_round_trip_of_emitted_words() {
        assert_eq!(
            Opcode::decode(set_class(ClassId::HOST1X, 0, 0)),
            Opcode::SetClass { class: ClassId::HOST1X, offset: 0, mask: 0 }
        );
        assert_eq!(
            Opcode::decode(nonincr(host::WAIT_SYNCPT, 1)),
            Opcode::NonIncr { addr: host::WAIT_SYNCPT, count: 1 }
        );
        assert_eq!(Opcode::decode(acquire_mutex(MutexId::new(7))), Opcode::AcquireMutex(MutexId::new(7)));
        assert_eq!(IncrCond::from_raw(1), Some(IncrCond::OpDone));
        assert_eq!(IncrCond::from_raw(9), None);
    }

    #[test]
    fn test_disassembler_skips_payload() {
        let sp = SyncPointId::new(5);
        let words = [
            set_class(ClassId::GR2D, 0, 0),
            incr(0x10, 2),
            0xaaaa,
            0xbbbb,
            nonincr(host::INCR_SYNCPT, 1),
            incr_syncpt(IncrCond::OpDone, sp),
        ];
        let lines: Vec<_> = Disassembler::new(&words).collect();
        assert_eq!(lines.len(), 6);
        assert_eq!(lines[2], Disassembled::Data(0xaaaa));
        assert_eq!(lines[3], Disassembled::Data(0xbbbb));
        assert!(matches!(lines[4], Disassembled::Command(Opcode::NonIncr { .. })));
        assert_eq!(lines[5], Disassembled::Data(0x105));
    }
}
