//! # Command Memory
//!
//! Host-visible memory that both the stream writer and the engine fetching
//! gathers can see.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use spin::Mutex;

use crate::error::{Error, Result};
use crate::types::MemHandle;

/// A mapped command memory object
///
/// Clones share the same storage, the way two mappings of one buffer do.
#[derive(Clone)]
pub struct CmdMemory {
    /// Handle the transport knows this memory by
    handle: MemHandle,
    /// Backing words
    words: Arc<Mutex<Vec<u32>>>,
}

impl CmdMemory {
    /// Create zeroed memory of `len` words
    pub fn new(handle: MemHandle, len: u32) -> Self {
        Self {
            handle,
            words: Arc::new(Mutex::new(vec![0; len as usize])),
        }
    }

    /// Transport handle
    #[inline]
    pub fn handle(&self) -> MemHandle {
        self.handle
    }

    /// Size in words
    pub fn len_words(&self) -> u32 {
        self.words.lock().len() as u32
    }

    /// Size in bytes
    pub fn len_bytes(&self) -> u32 {
        self.len_words() * 4
    }

    /// Write `data` starting at word `offset`
    pub fn write(&self, offset: u32, data: &[u32]) -> Result<()> {
        let mut words = self.words.lock();
        let start = offset as usize;
        let end = start.checked_add(data.len()).ok_or(Error::BufferOverflow)?;
        let dst = words.get_mut(start..end).ok_or(Error::BufferOverflow)?;
        dst.copy_from_slice(data);
        Ok(())
    }

    /// Copy `len` words starting at word `offset`
    pub fn read(&self, offset: u32, len: u32) -> Result<Vec<u32>> {
        let words = self.words.lock();
        let start = offset as usize;
        let end = start + len as usize;
        words.get(start..end).map(<[u32]>::to_vec).ok_or(Error::BufferOverflow)
    }

    /// Read one word
    pub fn read_word(&self, offset: u32) -> Result<u32> {
        self.words.lock().get(offset as usize).copied().ok_or(Error::BufferOverflow)
    }

    /// Whether two values refer to the same storage
    pub fn same_storage(&self, other: &CmdMemory) -> bool {
        Arc::ptr_eq(&self.words, &other.words)
    }
}

impl fmt::Debug for CmdMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CmdMemory")
            .field("handle", &self.handle)
            .field("words", &self.len_words())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read() {
        let mem = CmdMemory::new(MemHandle::Handle(1), 8);
        mem.write(2, &[1, 2, 3]).unwrap();
        assert_eq!(mem.read(1, 4).unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(mem.read_word(4).unwrap(), 3);
        assert_eq!(mem.len_bytes(), 32);
    }

    #[test]
    fn test_out_of_bounds() {
        let mem = CmdMemory::new(MemHandle::Handle(1), 4);
        assert_eq!(mem.write(3, &[1, 2]), Err(Error::BufferOverflow));
        assert_eq!(mem.read(2, 3), Err(Error::BufferOverflow));
        assert_eq!(mem.read_word(4), Err(Error::BufferOverflow));
    }

    #[test]
    fn test_clones_share_storage() {
        let a = CmdMemory::new(MemHandle::Handle(1), 4);
        let b = a.clone();
        b.write(0, &[9]).unwrap();
        assert_eq!(a.read_word(0).unwrap(), 9);
        assert!(a.same_storage(&b));
    }
}
