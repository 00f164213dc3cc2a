//! # CINDER Stream
//!
//! Builds command batches and submits them to a channel.
//!
//! A [`Stream`] owns two command buffer halves. Callers reserve room with
//! [`Stream::begin`], write through the returned [`Cursor`], and call
//! [`Stream::flush`] to submit. When a half fills up the stream flushes,
//! waits for the other half to drain, and swaps.
//!
//! ```text
//!  begin ──► cursor pushes ──► end ──► flush
//!                                       │
//!        ┌──────────────────────────────┘
//!        ▼
//!  wait-base advances ─► pre-flush hook ─► trailing incr ─► squeeze ─► submit
//!                                                                     │
//!                                             post-flush hook ◄───────┘
//! ```
//!
//! A stream is used from one thread at a time; it does no locking of its
//! own.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

pub mod cmdbuf;
pub mod config;
pub mod cursor;
pub mod stream;
pub mod syncpt;
pub mod tables;

pub use config::{StreamConfig, StreamFlags};
pub use cursor::{Cursor, PreFlushWriter};
pub use stream::{FenceSet, FlushReport, PostFlushHook, PreFlushHook, Stream, StreamStats};
