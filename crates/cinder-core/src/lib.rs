//! # CINDER Core
//!
//! Foundational types for the CINDER command-stream engine.
//!
//! This crate has no hardware dependencies. It defines the vocabulary shared
//! by every layer above it: sync point and memory identifiers, fences, the
//! wrap-safe counter comparisons, the host1x opcode encoders and the
//! [`Channel`] contract that submissions are handed to.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      cinder-core                            │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │  Channel    │  │   Types     │  │  Opcodes / Sync     │  │
//! │  │  (Submit,   │  │ (Fence,     │  │  (encoders, wrap-   │  │
//! │  │   waits)    │  │  MemHandle) │  │   safe compares)    │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod channel;
pub mod error;
pub mod memory;
pub mod opcode;
pub mod sync;
pub mod types;

// Re-exports for convenience
pub use channel::{Channel, GatherEntry, GatherKind, RelocEntry, Submit, SyncPointIncr, WaitEntry};
pub use error::{Error, Result};
pub use memory::CmdMemory;
pub use sync::WaitTimeout;
pub use types::*;
