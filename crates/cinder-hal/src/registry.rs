//! # Channel Registry
//!
//! Process-wide host state. Create one registry at start-up with the
//! control device, hand it to everything that opens channels, and shut it
//! down once at exit.

use std::fmt;
use std::sync::{Arc, Weak};

use cinder_core::{Channel, ModuleId, Result};
use spin::Mutex;

use crate::device::{ControlDevice, DeviceChannel};

/// Owner of the control device and the channels opened on it
pub struct ChannelRegistry {
    /// Transport shared by every channel
    device: Arc<dyn ControlDevice>,
    /// Channels handed out, for leak reporting at shutdown
    channels: Mutex<Vec<Weak<DeviceChannel>>>,
}

impl ChannelRegistry {
    /// Initialize the registry over `device`
    pub fn new(device: Arc<dyn ControlDevice>) -> Self {
        log::debug!("channel registry up ({} sync points)", device.num_syncpoints());
        Self {
            device,
            channels: Mutex::new(Vec::new()),
        }
    }

    /// Open a channel reaching `modules`
    ///
    /// Fails with `Error::NotFound` if the device has no such engine.
    pub fn open(&self, modules: &[ModuleId]) -> Result<Arc<dyn Channel>> {
        let channel = Arc::new(DeviceChannel::open(Arc::clone(&self.device), modules)?);
        let mut channels = self.channels.lock();
        channels.retain(|c| c.strong_count() > 0);
        channels.push(Arc::downgrade(&channel));
        Ok(channel)
    }

    /// The control device
    pub fn device(&self) -> &Arc<dyn ControlDevice> {
        &self.device
    }

    /// Channels still referenced somewhere
    pub fn live_channels(&self) -> usize {
        self.channels.lock().iter().filter(|c| c.strong_count() > 0).count()
    }

    /// Tear the registry down
    ///
    /// Channels still alive keep the device open until they drop.
    pub fn shutdown(self) {
        let live = self.live_channels();
        if live > 0 {
            log::warn!("channel registry shut down with {} channel(s) still open", live);
        } else {
            log::debug!("channel registry down");
        }
    }
}

impl fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("live_channels", &self.live_channels())
            .finish()
    }
}
