//! # Control Device
//!
//! The control device is the OS transport to the host1x driver: an ioctl
//! file on one platform, a devctl endpoint on another. [`DeviceChannel`]
//! turns a transport and an open channel descriptor into a
//! [`Channel`].

use std::fmt;
use std::sync::Arc;

use cinder_core::{
    Channel, CmdMemory, Error, ModuleId, MutexId, Priority, Result, Submit, SyncPointId,
    WaitBaseId, WaitTimeout,
};
use spin::Mutex;

// =============================================================================
// TRANSPORT
// =============================================================================

/// Descriptor of a channel opened on a control device
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ChannelFd(pub u32);

/// Request surface of a host1x control device
pub trait ControlDevice: Send + Sync {
    /// Open a channel able to reach `modules`
    fn open_channel(&self, modules: &[ModuleId]) -> Result<ChannelFd>;

    /// Close a channel
    fn close_channel(&self, fd: ChannelFd);

    /// Queue a batch on `fd`; returns the post-batch value of every
    /// incremented sync point
    fn submit(&self, fd: ChannelFd, submit: &Submit<'_>) -> Result<Vec<u32>>;

    /// Read a sync point's current value
    fn syncpt_read(&self, id: SyncPointId) -> Result<u32>;

    /// Read a sync point's promised value
    fn syncpt_read_max(&self, id: SyncPointId) -> Result<u32>;

    /// Wait for a sync point threshold
    fn syncpt_wait(&self, id: SyncPointId, thresh: u32, timeout: WaitTimeout) -> Result<u32>;

    /// Static sync point of a module reachable from `fd`
    fn channel_syncpoint(&self, fd: ChannelFd, module: ModuleId, index: u32) -> Result<SyncPointId>;

    /// Static wait base of a module reachable from `fd`
    fn channel_wait_base(&self, fd: ChannelFd, module: ModuleId, index: u32) -> Result<WaitBaseId>;

    /// Hardware mutex of a module reachable from `fd`
    fn channel_mutex(&self, fd: ChannelFd, module: ModuleId, index: u32) -> Result<MutexId>;

    /// Move `fd` to a priority level
    fn set_priority(&self, fd: ChannelFd, priority: Priority) -> Result<()>;

    /// Move `fd` to a priority level, allocating fresh sync point and wait base
    fn set_priority_dynamic(
        &self,
        fd: ChannelFd,
        priority: Priority,
        syncpt_index: u32,
        wait_base_index: u32,
    ) -> Result<(SyncPointId, WaitBaseId)>;

    /// Number of sync point registers
    fn num_syncpoints(&self) -> u32;

    /// Allocate command memory
    fn alloc_memory(&self, words: u32) -> Result<CmdMemory>;

    /// Free command memory
    fn free_memory(&self, mem: CmdMemory);
}

// =============================================================================
// SYNC POINT MODE
// =============================================================================

/// How a channel's sync points are assigned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPointMode {
    /// No sync point has been requested yet
    Unknown,
    /// Fixed per-module sync points were handed out
    Static,
    /// Sync points come from a priority level
    Dynamic {
        /// Sync point allocated for the priority
        syncpt: SyncPointId,
        /// Wait base allocated for the priority
        wait_base: WaitBaseId,
    },
}

// =============================================================================
// DEVICE CHANNEL
// =============================================================================

/// A [`Channel`] backed by a control device
pub struct DeviceChannel {
    /// Transport
    device: Arc<dyn ControlDevice>,
    /// Open descriptor
    fd: ChannelFd,
    /// Engines this channel was opened for
    modules: Vec<ModuleId>,
    /// Static or dynamic sync point assignment
    mode: Mutex<SyncPointMode>,
}

impl DeviceChannel {
    /// Open a channel on `device` for `modules`
    pub fn open(device: Arc<dyn ControlDevice>, modules: &[ModuleId]) -> Result<Self> {
        if modules.is_empty() {
            return Err(Error::InvalidParameter);
        }
        let fd = device.open_channel(modules)?;
        log::debug!("opened channel {:?} for {:?}", fd, modules);
        Ok(Self {
            device,
            fd,
            modules: modules.to_vec(),
            mode: Mutex::new(SyncPointMode::Unknown),
        })
    }

    /// Channel descriptor
    pub fn fd(&self) -> ChannelFd {
        self.fd
    }

    /// Engines the channel reaches
    pub fn modules(&self) -> &[ModuleId] {
        &self.modules
    }

    /// Current sync point assignment
    pub fn mode(&self) -> SyncPointMode {
        *self.mode.lock()
    }

    fn check_module(&self, module: ModuleId) -> Result<()> {
        // The host module is reachable from every channel
        if module == ModuleId::Host || self.modules.contains(&module) {
            Ok(())
        } else {
            Err(Error::NotFound)
        }
    }
}

impl Channel for DeviceChannel {
    fn submit(&self, submit: &Submit<'_>) -> Result<Vec<u32>> {
        if submit.stream_syncpt_index >= submit.syncpt_incrs.len() {
            return Err(Error::InvalidParameter);
        }
        let fences = self.device.submit(self.fd, submit)?;
        if fences.len() != submit.syncpt_incrs.len() {
            return Err(Error::SubmissionFailed);
        }
        Ok(fences)
    }

    fn read_syncpoint(&self, id: SyncPointId) -> Result<u32> {
        self.device.syncpt_read(id)
    }

    fn read_syncpoint_max(&self, id: SyncPointId) -> Result<u32> {
        self.device.syncpt_read_max(id)
    }

    fn wait_syncpoint(&self, id: SyncPointId, thresh: u32, timeout: WaitTimeout) -> Result<u32> {
        self.device.syncpt_wait(id, thresh, timeout)
    }

    fn module_syncpoint(&self, module: ModuleId, index: u32) -> Result<SyncPointId> {
        self.check_module(module)?;
        let mut mode = self.mode.lock();
        if matches!(*mode, SyncPointMode::Dynamic { .. }) {
            return Err(Error::InvalidState);
        }
        let id = self.device.channel_syncpoint(self.fd, module, index)?;
        *mode = SyncPointMode::Static;
        Ok(id)
    }

    fn module_wait_base(&self, module: ModuleId, index: u32) -> Result<WaitBaseId> {
        self.check_module(module)?;
        if let SyncPointMode::Dynamic { wait_base, .. } = *self.mode.lock() {
            return Ok(wait_base);
        }
        self.device.channel_wait_base(self.fd, module, index)
    }

    fn module_mutex(&self, module: ModuleId, index: u32) -> Result<MutexId> {
        self.check_module(module)?;
        self.device.channel_mutex(self.fd, module, index)
    }

    fn set_priority(&self, priority: Priority) -> Result<()> {
        self.device.set_priority(self.fd, priority)?;
        log::debug!("channel {:?} priority {}", self.fd, priority.raw());
        Ok(())
    }

    fn set_priority_dynamic(
        &self,
        priority: Priority,
        syncpt_index: u32,
        wait_base_index: u32,
    ) -> Result<(SyncPointId, WaitBaseId)> {
        let mut mode = self.mode.lock();
        if *mode == SyncPointMode::Static {
            return Err(Error::InvalidState);
        }
        let (syncpt, wait_base) =
            self.device.set_priority_dynamic(self.fd, priority, syncpt_index, wait_base_index)?;
        *mode = SyncPointMode::Dynamic { syncpt, wait_base };
        log::debug!(
            "channel {:?} priority {} uses {} / {}",
            self.fd,
            priority.raw(),
            syncpt,
            wait_base
        );
        Ok((syncpt, wait_base))
    }

    fn num_syncpoints(&self) -> u32 {
        self.device.num_syncpoints()
    }

    fn alloc_memory(&self, words: u32) -> Result<CmdMemory> {
        self.device.alloc_memory(words)
    }

    fn free_memory(&self, mem: CmdMemory) {
        self.device.free_memory(mem)
    }
}

impl Drop for DeviceChannel {
    fn drop(&mut self) {
        self.device.close_channel(self.fd);
    }
}

impl fmt::Debug for DeviceChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceChannel")
            .field("fd", &self.fd)
            .field("modules", &self.modules)
            .field("mode", &self.mode())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::soft::{SoftHost, SoftHostConfig};

    fn host() -> Arc<SoftHost> {
        Arc::new(SoftHost::new(SoftHostConfig::default()))
    }

    #[test]
    fn test_open_requires_modules() {
        let device: Arc<dyn ControlDevice> = host();
        assert_eq!(DeviceChannel::open(device, &[]).err(), Some(Error::InvalidParameter));
    }

    #[test]
    fn test_unknown_module_not_found() {
        let ch = DeviceChannel::open(host(), &[ModuleId::Gr2d]).unwrap();
        assert_eq!(ch.module_syncpoint(ModuleId::Vic, 0), Err(Error::NotFound));
        assert!(ch.module_syncpoint(ModuleId::Gr2d, 0).is_ok());
    }

    #[test]
    fn test_static_then_priority_is_invalid() {
        let ch = DeviceChannel::open(host(), &[ModuleId::Gr3d]).unwrap();
        ch.module_syncpoint(ModuleId::Gr3d, 0).unwrap();
        assert_eq!(ch.mode(), SyncPointMode::Static);
        assert_eq!(ch.set_priority_dynamic(Priority::HIGH, 0, 0), Err(Error::InvalidState));
    }

    #[test]
    fn test_priority_only_keeps_static_mode() {
        let host = host();
        let ch = DeviceChannel::open(host.clone(), &[ModuleId::Gr3d]).unwrap();
        let sp = ch.module_syncpoint(ModuleId::Gr3d, 0).unwrap();
        ch.set_priority(Priority::HIGH).unwrap();
        assert_eq!(ch.mode(), SyncPointMode::Static);
        assert_eq!(host.priority(ch.fd()), Some(Priority::HIGH));
        assert_eq!(ch.module_syncpoint(ModuleId::Gr3d, 0), Ok(sp));
    }

    #[test]
    fn test_dynamic_then_static_is_invalid() {
        let ch = DeviceChannel::open(host(), &[ModuleId::Gr3d]).unwrap();
        let (sp, wb) = ch.set_priority_dynamic(Priority::HIGH, 0, 0).unwrap();
        assert_eq!(ch.mode(), SyncPointMode::Dynamic { syncpt: sp, wait_base: wb });
        assert_eq!(ch.module_syncpoint(ModuleId::Gr3d, 0), Err(Error::InvalidState));
        assert_eq!(ch.module_wait_base(ModuleId::Gr3d, 0), Ok(wb));
    }
}
