//! # CINDER Core Types
//!
//! Identifiers for host1x resources, memory handles and fences.

use core::fmt;

// =============================================================================
// HARDWARE IDENTIFIERS
// =============================================================================

macro_rules! hw_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(u32);

        impl $name {
            /// Create from a raw register index
            #[inline]
            pub const fn new(raw: u32) -> Self {
                Self(raw)
            }

            /// Get the raw register index
            #[inline]
            pub const fn raw(self) -> u32 {
                self.0
            }

            /// Index into per-id arrays
            #[inline]
            pub const fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

hw_id!(
    /// Hardware sync point register
    SyncPointId,
    "sp"
);

hw_id!(
    /// Wait base register paired with a sync point
    WaitBaseId,
    "wb"
);

hw_id!(
    /// Hardware mutex guarding an engine shared between channels
    MutexId,
    "mlock"
);

/// Sync point reserved by the host; it never increments, so a wait on
/// threshold 0 is always satisfied.
pub const RESERVED_SYNCPOINT: SyncPointId = SyncPointId::new(0);

// =============================================================================
// ENGINES AND CLASSES
// =============================================================================

/// Hardware engine reachable through a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum ModuleId {
    /// Host1x itself
    Host = 0,
    /// Display controller
    Display = 1,
    /// 2D blitter
    Gr2d = 2,
    /// 3D engine
    Gr3d = 3,
    /// MPEG encoder
    Mpe = 4,
    /// Video input
    Vi = 5,
    /// Image signal processor
    Isp = 6,
    /// Video image compositor
    Vic = 7,
    /// Media encoder
    Msenc = 8,
    /// Security engine
    Tsec = 9,
}

impl ModuleId {
    /// Every engine, in register order
    pub const ALL: [ModuleId; 10] = [
        ModuleId::Host,
        ModuleId::Display,
        ModuleId::Gr2d,
        ModuleId::Gr3d,
        ModuleId::Mpe,
        ModuleId::Vi,
        ModuleId::Isp,
        ModuleId::Vic,
        ModuleId::Msenc,
        ModuleId::Tsec,
    ];

    /// Class the engine accepts after a channel switch
    pub const fn default_class(self) -> ClassId {
        match self {
            ModuleId::Host | ModuleId::Display => ClassId::HOST1X,
            ModuleId::Gr2d => ClassId::GR2D,
            ModuleId::Gr3d => ClassId::GR3D,
            ModuleId::Mpe => ClassId::MPE,
            ModuleId::Vi => ClassId::VI,
            ModuleId::Isp => ClassId::ISP,
            ModuleId::Vic => ClassId::VIC,
            ModuleId::Msenc => ClassId::MSENC,
            ModuleId::Tsec => ClassId::TSEC,
        }
    }
}

/// Host1x class identifier, selected with a SETCLASS opcode
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ClassId(u32);

impl ClassId {
    /// Host1x class
    pub const HOST1X: Self = Self(0x01);
    /// MPEG encoder class
    pub const MPE: Self = Self(0x20);
    /// Media encoder class
    pub const MSENC: Self = Self(0x21);
    /// Video input class
    pub const VI: Self = Self(0x30);
    /// ISP class
    pub const ISP: Self = Self(0x32);
    /// 2D class
    pub const GR2D: Self = Self(0x51);
    /// 2D solid-fill class
    pub const GR2D_SB: Self = Self(0x52);
    /// VIC class
    pub const VIC: Self = Self(0x5D);
    /// 3D class
    pub const GR3D: Self = Self(0x60);
    /// TSEC class
    pub const TSEC: Self = Self(0xE0);

    /// Create from a raw class number
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw class number
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Check if this is the host class
    #[inline]
    pub const fn is_host(self) -> bool {
        self.0 == Self::HOST1X.0
    }
}

impl fmt::Debug for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClassId(0x{:02x})", self.0)
    }
}

// =============================================================================
// MEMORY HANDLE
// =============================================================================

/// Reference to a memory object known to the transport
///
/// A buffer is either allocated through the memory manager or imported
/// from a file descriptor. The two never share a numbering space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MemHandle {
    /// Memory manager handle
    Handle(u32),
    /// Buffer backed by a file descriptor (dma-buf style import)
    FdBacked(i32),
}

impl MemHandle {
    /// Check if the buffer was imported from a file descriptor
    #[inline]
    pub const fn is_fd_backed(self) -> bool {
        matches!(self, MemHandle::FdBacked(_))
    }
}

impl fmt::Display for MemHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemHandle::Handle(h) => write!(f, "mem#{}", h),
            MemHandle::FdBacked(fd) => write!(f, "fd#{}", fd),
        }
    }
}

// =============================================================================
// FENCE
// =============================================================================

/// A sync point threshold: work is done once the sync point reaches `value`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Fence {
    /// Sync point being counted
    pub id: SyncPointId,
    /// Threshold value
    pub value: u32,
}

impl Fence {
    /// Create a new fence
    #[inline]
    pub const fn new(id: SyncPointId, value: u32) -> Self {
        Self { id, value }
    }
}

impl fmt::Display for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}>={}", self.id, self.value)
    }
}

// =============================================================================
// PRIORITY
// =============================================================================

/// Channel scheduling priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Priority(u32);

impl Priority {
    /// Background work
    pub const LOW: Self = Self(50);
    /// Default priority
    pub const DEFAULT: Self = Self(100);
    /// Latency sensitive work
    pub const HIGH: Self = Self(150);

    /// Create from a raw priority level
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw level
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::format;

    #[test]
    fn test_id_formatting() {
        let sp = SyncPointId::new(22);
        assert_eq!(format!("{}", sp), "sp22");
        assert_eq!(format!("{:?}", sp), "SyncPointId(22)");
        assert_eq!(format!("{}", Fence::new(sp, 7)), "sp22>=7");
    }

    #[test]
    fn test_mem_handle_variants() {
        assert!(MemHandle::FdBacked(3).is_fd_backed());
        assert!(!MemHandle::Handle(3).is_fd_backed());
        assert_ne!(MemHandle::Handle(3), MemHandle::FdBacked(3));
    }

    #[test]
    fn test_default_class() {
        assert_eq!(ModuleId::Gr3d.default_class(), ClassId::GR3D);
        assert!(ModuleId::Host.default_class().is_host());
        assert!(Priority::HIGH > Priority::DEFAULT);
    }
}
