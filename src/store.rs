//! The block store: a contiguous in-memory byte array partitioned into
//! fixed-size blocks.
//!
//! Block numbers are 1-based in the VFS-facing APIs only insofar as 0 is the
//! sentinel "no block"; the store itself is 0-indexed and block 0 is the boot
//! block, permanently reserved and never interpreted.
use crate::error::{FsError, Result};
use crate::layout::BLOCK_SIZE;

/// Hook invoked before every block write. Returning `Err` simulates an I/O
/// fault at that exact write, without mutating the backing array — used by
/// the fault-injection test harness to probe every possible crash point in a
/// journal transaction.
pub type WriteHook = Box<dyn FnMut(u32) -> Result<()> + Send>;

/// A single block-addressed memory image.
pub struct BlockStore {
    data: Vec<u8>,
    block_count: u32,
    hook: Option<WriteHook>,
}

impl BlockStore {
    /// Creates a zeroed store with `block_count` blocks.
    pub fn new(block_count: u32) -> Self {
        Self {
            data: vec![0u8; block_count as usize * BLOCK_SIZE],
            block_count,
            hook: None,
        }
    }

    /// Wraps an existing byte buffer as a store, e.g. to mount a previously
    /// formatted image. `bytes.len()` must be a multiple of `BLOCK_SIZE`.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() % BLOCK_SIZE != 0 {
            return Err(FsError::Corrupted("backing buffer is not block-aligned"));
        }
        let block_count = (bytes.len() / BLOCK_SIZE) as u32;
        Ok(Self {
            data: bytes,
            block_count,
            hook: None,
        })
    }

    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    /// Installs a write-fault hook, replacing any previous one.
    pub fn set_write_hook(&mut self, hook: WriteHook) {
        self.hook = Some(hook);
    }

    pub fn clear_write_hook(&mut self) {
        self.hook = None;
    }

    fn offset(&self, block: u32) -> Result<usize> {
        if block >= self.block_count {
            return Err(FsError::Io);
        }
        Ok(block as usize * BLOCK_SIZE)
    }

    /// Returns an immutable view of a block.
    pub fn read(&self, block: u32) -> Result<&[u8]> {
        let off = self.offset(block)?;
        Ok(&self.data[off..off + BLOCK_SIZE])
    }

    /// Returns a mutable view of a block, bypassing the write hook. Used for
    /// staging scratch content that is not itself the durable write (the
    /// hook models durability of the *journal region*, not scratch buffers).
    pub fn read_mut_unlogged(&mut self, block: u32) -> Result<&mut [u8]> {
        let off = self.offset(block)?;
        Ok(&mut self.data[off..off + BLOCK_SIZE])
    }

    /// Writes a full block, running the fault hook first.
    pub fn write(&mut self, block: u32, content: &[u8]) -> Result<()> {
        debug_assert_eq!(content.len(), BLOCK_SIZE);
        let off = self.offset(block)?;
        if let Some(hook) = self.hook.as_mut() {
            hook(block)?;
        }
        self.data[off..off + BLOCK_SIZE].copy_from_slice(content);
        Ok(())
    }

    /// Copies `block` `src` to `dst` within the store (used by journal
    /// replay for WRITE / block-content restores).
    pub fn copy_block(&mut self, src: u32, dst: u32) -> Result<()> {
        let mut buf = [0u8; BLOCK_SIZE];
        buf.copy_from_slice(self.read(src)?);
        self.write(dst, &buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_roundtrip() {
        let mut s = BlockStore::new(4);
        let mut buf = [0u8; BLOCK_SIZE];
        buf[0] = 0xAB;
        s.write(2, &buf).unwrap();
        assert_eq!(s.read(2).unwrap()[0], 0xAB);
    }

    #[test]
    fn out_of_range_block_is_io_error() {
        let s = BlockStore::new(2);
        assert_eq!(s.read(5), Err(FsError::Io));
    }

    #[test]
    fn write_hook_can_inject_fault() {
        let mut s = BlockStore::new(4);
        s.set_write_hook(Box::new(|b| if b == 1 { Err(FsError::Io) } else { Ok(()) }));
        let buf = [0u8; BLOCK_SIZE];
        assert!(s.write(0, &buf).is_ok());
        assert_eq!(s.write(1, &buf), Err(FsError::Io));
    }
}
