//! # Fence Notification
//!
//! Deliver fence completion to a semaphore without blocking the caller.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use cinder_core::sync::is_expired;
use cinder_core::{Channel, Fence, Result, WaitTimeout};

// =============================================================================
// SEMAPHORE
// =============================================================================

/// Counting semaphore
#[derive(Debug, Default)]
pub struct Semaphore {
    count: Mutex<u32>,
    cond: Condvar,
}

impl Semaphore {
    /// Create with `initial` permits
    pub fn new(initial: u32) -> Self {
        Self { count: Mutex::new(initial), cond: Condvar::new() }
    }

    /// Add one permit
    pub fn signal(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count += 1;
        self.cond.notify_one();
    }

    /// Take a permit if one is available
    pub fn try_wait(&self) -> bool {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }

    /// Block until a permit is available and take it
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        while *count == 0 {
            count = self.cond.wait(count).unwrap_or_else(PoisonError::into_inner);
        }
        *count -= 1;
    }

    /// Like [`Semaphore::wait`], giving up after `timeout`
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        while *count == 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            count = self
                .cond
                .wait_timeout(count, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *count -= 1;
        true
    }
}

// =============================================================================
// SIGNAL ON FENCE
// =============================================================================

/// Signal `sem` once `fence` is reached
///
/// A fence that has already been reached signals before returning.
/// Otherwise a detached thread performs the wait; if no thread can be
/// started the wait happens on the calling thread.
pub fn signal_on_fence(channel: &Arc<dyn Channel>, fence: Fence, sem: &Arc<Semaphore>) -> Result<()> {
    let current = channel.read_syncpoint(fence.id)?;
    let max = channel.read_syncpoint_max(fence.id)?;
    if is_expired(current, fence.value, max) {
        sem.signal();
        return Ok(());
    }

    let waiter = {
        let channel = Arc::clone(channel);
        let sem = Arc::clone(sem);
        move || {
            if let Err(err) = channel.wait_syncpoint(fence.id, fence.value, WaitTimeout::Infinite) {
                log::warn!("wait for {} failed: {}", fence, err);
            }
            sem.signal();
        }
    };
    if let Err(err) = thread::Builder::new().name("cinder-fence".into()).spawn(waiter) {
        log::warn!("no fence thread ({}), waiting for {} inline", err, fence);
        channel.wait_syncpoint(fence.id, fence.value, WaitTimeout::Infinite)?;
        sem.signal();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ChannelRegistry;
    use crate::soft::{CompletionMode, SoftHost, SoftHostConfig};
    use cinder_core::{ModuleId, Submit, SyncPointIncr};

    #[test]
    fn test_semaphore_counts() {
        let sem = Semaphore::new(1);
        assert!(sem.try_wait());
        assert!(!sem.try_wait());
        sem.signal();
        sem.wait();
        assert!(!sem.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn test_signal_on_reached_fence_is_immediate() {
        let host = Arc::new(SoftHost::new(SoftHostConfig::default()));
        let registry = ChannelRegistry::new(host.clone());
        let ch = registry.open(&[ModuleId::Gr2d]).unwrap();
        let sem = Arc::new(Semaphore::new(0));
        signal_on_fence(&ch, Fence::new(cinder_core::SyncPointId::new(18), 0), &sem).unwrap();
        assert!(sem.try_wait());
    }

    #[test]
    fn test_signal_on_pending_fence_from_thread() {
        let host = Arc::new(SoftHost::new(SoftHostConfig::default().with_completion(CompletionMode::Manual)));
        let registry = ChannelRegistry::new(host.clone());
        let ch = registry.open(&[ModuleId::Gr2d]).unwrap();
        let sp = ch.module_syncpoint(ModuleId::Gr2d, 0).unwrap();
        let incrs = [SyncPointIncr { id: sp, incrs: 1, wait_base: None }];
        let fences = ch
            .submit(&Submit {
                gathers: &[],
                relocs: &[],
                waits: &[],
                syncpt_incrs: &incrs,
                stream_syncpt_index: 0,
                module: Some(ModuleId::Gr2d),
                null_kickoff: false,
                waited_mask: 0,
            })
            .unwrap();

        let sem = Arc::new(Semaphore::new(0));
        signal_on_fence(&ch, Fence::new(sp, fences[0]), &sem).unwrap();
        assert!(!sem.try_wait());
        host.retire_all();
        assert!(sem.wait_timeout(Duration::from_secs(5)));
    }
}
