//! In-memory inode wrapper, the file-index classifier, and `blockno_of`.
use crate::error::Result;
use crate::layout::{DiskInode, FileType, IndirectBlock, BLOCK_SIZE, ND, NI};
use crate::store::BlockStore;

/// Classifies a 0-based block index within a file into the chain location
/// that holds its pointer.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Location {
    /// Index into `inode.direct`, in `0..ND`.
    Direct(usize),
    /// Index into the indirect block, in `0..NI`.
    Indirect(usize),
    /// `i` indexes the doubly-indirect block (selecting an indirect block),
    /// `d` indexes within that indirect block.
    Indirect2 { i: usize, d: usize },
}

/// Classifies 0-based block index `q` within a file.
pub fn locate(q: usize) -> Location {
    if q < ND {
        Location::Direct(q)
    } else if q < ND + NI {
        Location::Indirect(q - ND)
    } else {
        let r = q - (ND + NI);
        Location::Indirect2 {
            i: r / NI,
            d: r % NI,
        }
    }
}

/// Number of blocks reachable for a file of the given byte size.
pub fn nblocks_for_size(size: u64) -> usize {
    ((size as usize) + BLOCK_SIZE - 1) / BLOCK_SIZE
}

/// An in-memory handle to one inode's on-disk record plus its identity.
#[derive(Clone, Copy, Debug)]
pub struct Inode {
    pub number: u32,
    pub disk: DiskInode,
}

impl Inode {
    pub fn new(number: u32, disk: DiskInode) -> Self {
        Self { number, disk }
    }

    pub fn is_free_slot(&self) -> bool {
        self.disk.nlink == 0
    }

    pub fn file_type(&self) -> Result<FileType> {
        FileType::try_from(self.disk.ftype)
    }

    pub fn nblocks(&self) -> usize {
        nblocks_for_size(self.disk.size as u64)
    }

    /// Translates a byte offset to the block number holding it, or `0` if
    /// the offset is outside the file or the file is a symlink.
    ///
    /// A symlink's target text lives inline in the inode record itself
    /// (see [`DiskInode::symlink_storage`]), not in a block chain, so
    /// `read`/`write` are rejected for symlinks before reaching here.
    pub fn blockno_of(&self, store: &BlockStore, offset: u64) -> Result<u32> {
        if self.disk.ftype == FileType::Symlink as u32 {
            return Ok(0);
        }
        if offset >= self.disk.size as u64 {
            return Ok(0);
        }
        let q = (offset as usize) / BLOCK_SIZE;
        match locate(q) {
            Location::Direct(idx) => Ok(self.disk.direct[idx]),
            Location::Indirect(idx) => {
                if self.disk.indirect == 0 {
                    return Ok(0);
                }
                let block = unsafe { IndirectBlock::from_bytes(store.read(self.disk.indirect)?) };
                Ok(block.ptrs[idx])
            }
            Location::Indirect2 { i, d } => {
                if self.disk.indirect2 == 0 {
                    return Ok(0);
                }
                let i2 = unsafe { IndirectBlock::from_bytes(store.read(self.disk.indirect2)?) };
                let indirect_blockno = i2.ptrs[i];
                if indirect_blockno == 0 {
                    return Ok(0);
                }
                let block = unsafe { IndirectBlock::from_bytes(store.read(indirect_blockno)?) };
                Ok(block.ptrs[d])
            }
        }
    }

    /// Returns an error if a needed indirect pointer is missing where the
    /// classifier expects one (address translation failure).
    pub fn require_blockno_of(&self, store: &BlockStore, offset: u64) -> Result<u32> {
        crate::journal::corrupted_if_zero(self.blockno_of(store, offset)?, "address translation miss")
    }
}
