//! # CINDER Sched
//!
//! Virtual sync points: a client-side counter that only moves forward,
//! mapped onto a wrapping hardware sync point one flush at a time.
//!
//! [`SchedClient`] wraps a [`cinder_stream::Stream`], hands out virtual
//! values for the increments it writes, and resolves them back to hardware
//! values for CPU waits.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

pub mod client;
pub mod vsync;

pub use client::{FlushCallback, SchedClient, SchedCursor};
pub use vsync::{Mapping, VirtualSyncPoint, MAPPING_TABLE_SIZE};
