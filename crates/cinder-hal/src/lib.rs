//! # CINDER HAL
//!
//! Host side of the channel contract.
//!
//! - [`device`]: the [`ControlDevice`] transport trait and [`DeviceChannel`],
//!   the [`Channel`](cinder_core::Channel) built on it
//! - [`registry`]: process-wide device state with explicit init and teardown
//! - [`soft`]: an emulated host1x unit implementing [`ControlDevice`]
//! - [`notify`]: fence completion delivered to a semaphore

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod device;
pub mod notify;
pub mod registry;
pub mod soft;

pub use device::{ChannelFd, ControlDevice, DeviceChannel, SyncPointMode};
pub use notify::{Semaphore, signal_on_fence};
pub use registry::ChannelRegistry;
pub use soft::{CompletionMode, ModuleResources, SoftHost, SoftHostConfig};
