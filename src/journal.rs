//! The write-ahead journal.
//!
//! A sum-typed record: `op_kind` selects which header fields and journal
//! slots are meaningful. Modeled here as
//! a tagged `OpKind` plus a flat `JournalHeader` the caller must only
//! interpret through the matching `stage_*`/`replay` path, rather than a Rust
//! enum-with-payload, because the header is also the on-disk record.
use crate::error::{FsError, Result};
use crate::layout::{DiskInode, Geometry, IndirectBlock, BLOCK_SIZE, MAX_BATCH};
use crate::store::BlockStore;
use bitflags::bitflags;
use log::{debug, error};

/// Discriminant for the journal's tagged record.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u32)]
pub enum OpKind {
    Empty = 0,
    Write = 1,
    Free = 2,
    Alloc = 3,
    Symlink = 4,
    HardLink = 5,
    Create = 6,
}

impl TryFrom<u32> for OpKind {
    type Error = FsError;
    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::Empty),
            1 => Ok(Self::Write),
            2 => Ok(Self::Free),
            3 => Ok(Self::Alloc),
            4 => Ok(Self::Symlink),
            5 => Ok(Self::HardLink),
            6 => Ok(Self::Create),
            _ => Err(FsError::Corrupted("invalid journal op_kind")),
        }
    }
}

bitflags! {
    /// Meaning of each bit depends on `op_kind`: for ALLOC it marks "write
    /// the saved scratch block on replay"; for FREE it marks "this whole
    /// chain-level block is being freed".
    #[derive(Default)]
    pub struct ResizeFlags: u32 {
        const INDIRECT_TOUCHED = 0b01;
        const INDIRECT2_TOUCHED = 0b10;
    }
}

/// On-disk journal header.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct JournalHeader {
    pub op_kind: u32,
    pub completed: u32,
    pub inode_no: u32,
    pub inode: DiskInode,
    pub n_blocks: u32,
    pub indirect_blockno: u32,
    pub indirect2_blockno: u32,
    pub resize_flags: u32,
    pub dir_data_blockno: u32,
}

impl JournalHeader {
    pub fn empty() -> Self {
        Self {
            op_kind: OpKind::Empty as u32,
            completed: 0,
            inode_no: 0,
            inode: DiskInode::zeroed(),
            n_blocks: 0,
            indirect_blockno: 0,
            indirect2_blockno: 0,
            resize_flags: 0,
            dir_data_blockno: 0,
        }
    }

    /// # Safety
    /// `bytes` must be at least `size_of::<JournalHeader>()` long.
    unsafe fn from_bytes(bytes: &[u8]) -> Self {
        core::ptr::read_unaligned(bytes.as_ptr() as *const Self)
    }

    fn write_to(&self, bytes: &mut [u8]) {
        unsafe {
            core::ptr::write_unaligned(bytes.as_mut_ptr() as *mut Self, *self);
        }
    }
}

/// Handle to the journal's fixed block range, addressed relative to the
/// journal's first block.
#[derive(Clone, Copy, Debug)]
pub struct Journal {
    start: u32,
}

impl Journal {
    pub fn new(start: u32) -> Self {
        Self { start }
    }

    fn header_block(&self) -> u32 {
        self.start
    }
    fn list_block(&self) -> u32 {
        self.start + 1
    }
    fn indirect2_saved_block(&self) -> u32 {
        self.start + 2
    }
    fn indirect_saved_block(&self) -> u32 {
        self.start + 3
    }
    fn data_block(&self, i: usize) -> u32 {
        self.start + 4 + i as u32
    }

    pub fn read_header(&self, store: &BlockStore) -> Result<JournalHeader> {
        Ok(unsafe { JournalHeader::from_bytes(store.read(self.header_block())?) })
    }

    fn write_header(&self, store: &mut BlockStore, header: &JournalHeader) -> Result<()> {
        let mut buf = [0u8; BLOCK_SIZE];
        header.write_to(&mut buf);
        store.write(self.header_block(), &buf)
    }

    fn write_block_list(&self, store: &mut BlockStore, list: &[u32]) -> Result<()> {
        let mut buf = [0u8; BLOCK_SIZE];
        for (i, b) in list.iter().enumerate() {
            buf[i * 4..i * 4 + 4].copy_from_slice(&b.to_le_bytes());
        }
        store.write(self.list_block(), &buf)
    }

    pub fn read_block_list(&self, store: &BlockStore, n: usize) -> Result<Vec<u32>> {
        let raw = store.read(self.list_block())?;
        Ok((0..n)
            .map(|i| u32::from_le_bytes(raw[i * 4..i * 4 + 4].try_into().unwrap()))
            .collect())
    }

    /// Commits a WRITE transaction: data slots, then block list, then header
    /// with `completed=1`.
    pub fn commit_write(
        &self,
        store: &mut BlockStore,
        destinations: &[u32],
        data: &[[u8; BLOCK_SIZE]],
    ) -> Result<()> {
        debug_assert_eq!(destinations.len(), data.len());
        debug_assert!(destinations.len() <= MAX_BATCH);
        for (i, d) in data.iter().enumerate() {
            store.write(self.data_block(i), d)?;
        }
        self.write_block_list(store, destinations)?;
        let header = JournalHeader {
            op_kind: OpKind::Write as u32,
            completed: 1,
            n_blocks: destinations.len() as u32,
            ..JournalHeader::empty()
        };
        self.write_header(store, &header)?;
        debug!("journal: committed WRITE batch of {} blocks", destinations.len());
        Ok(())
    }

    /// Commits an ALLOC transaction: scratch saved blocks, then block list,
    /// then header.
    #[allow(clippy::too_many_arguments)]
    pub fn commit_alloc(
        &self,
        store: &mut BlockStore,
        inode_no: u32,
        staged_inode: DiskInode,
        allocated: &[u32],
        indirect_blockno: u32,
        indirect2_blockno: u32,
        flags: ResizeFlags,
        indirect_saved: Option<&IndirectBlock>,
        indirect2_saved: Option<&IndirectBlock>,
    ) -> Result<()> {
        debug_assert!(allocated.len() <= MAX_BATCH);
        if let Some(blk) = indirect2_saved {
            let mut buf = [0u8; BLOCK_SIZE];
            blk.write_to(&mut buf);
            store.write(self.indirect2_saved_block(), &buf)?;
        }
        if let Some(blk) = indirect_saved {
            let mut buf = [0u8; BLOCK_SIZE];
            blk.write_to(&mut buf);
            store.write(self.indirect_saved_block(), &buf)?;
        }
        self.write_block_list(store, allocated)?;
        let header = JournalHeader {
            op_kind: OpKind::Alloc as u32,
            completed: 1,
            inode_no,
            inode: staged_inode,
            n_blocks: allocated.len() as u32,
            indirect_blockno,
            indirect2_blockno,
            resize_flags: flags.bits(),
            ..JournalHeader::empty()
        };
        self.write_header(store, &header)?;
        debug!(
            "journal: committed ALLOC batch of {} blocks for inode {}",
            allocated.len(),
            inode_no
        );
        Ok(())
    }

    /// Commits a FREE transaction, same slot usage as ALLOC.
    #[allow(clippy::too_many_arguments)]
    pub fn commit_free(
        &self,
        store: &mut BlockStore,
        inode_no: u32,
        staged_inode: DiskInode,
        freed: &[u32],
        indirect_blockno: u32,
        indirect2_blockno: u32,
        flags: ResizeFlags,
        indirect_saved: Option<&IndirectBlock>,
        indirect2_saved: Option<&IndirectBlock>,
    ) -> Result<()> {
        debug_assert!(freed.len() <= MAX_BATCH);
        if let Some(blk) = indirect2_saved {
            let mut buf = [0u8; BLOCK_SIZE];
            blk.write_to(&mut buf);
            store.write(self.indirect2_saved_block(), &buf)?;
        }
        if let Some(blk) = indirect_saved {
            let mut buf = [0u8; BLOCK_SIZE];
            blk.write_to(&mut buf);
            store.write(self.indirect_saved_block(), &buf)?;
        }
        self.write_block_list(store, freed)?;
        let header = JournalHeader {
            op_kind: OpKind::Free as u32,
            completed: 1,
            inode_no,
            inode: staged_inode,
            n_blocks: freed.len() as u32,
            indirect_blockno,
            indirect2_blockno,
            resize_flags: flags.bits(),
            ..JournalHeader::empty()
        };
        self.write_header(store, &header)?;
        debug!("journal: committed FREE batch of {} blocks for inode {}", freed.len(), inode_no);
        Ok(())
    }

    /// Commits a CREATE or HARDLINK transaction: the directory block
    /// post-image goes in data slot 0.
    pub fn commit_create_or_hardlink(
        &self,
        store: &mut BlockStore,
        op: OpKind,
        inode_no: u32,
        staged_inode: DiskInode,
        dir_data_blockno: u32,
        dir_block_image: &[u8; BLOCK_SIZE],
    ) -> Result<()> {
        debug_assert!(matches!(op, OpKind::Create | OpKind::HardLink));
        store.write(self.data_block(0), dir_block_image)?;
        let header = JournalHeader {
            op_kind: op as u32,
            completed: 1,
            inode_no,
            inode: staged_inode,
            dir_data_blockno,
            ..JournalHeader::empty()
        };
        self.write_header(store, &header)?;
        debug!("journal: committed {:?} for inode {}", op, inode_no);
        Ok(())
    }

    /// Commits a SYMLINK transaction: staged inode plus optional directory
    /// block post-image (mirrors CREATE's slot usage).
    pub fn commit_symlink(
        &self,
        store: &mut BlockStore,
        inode_no: u32,
        staged_inode: DiskInode,
        dir_data_blockno: u32,
        dir_block_image: &[u8; BLOCK_SIZE],
    ) -> Result<()> {
        store.write(self.data_block(0), dir_block_image)?;
        let header = JournalHeader {
            op_kind: OpKind::Symlink as u32,
            completed: 1,
            inode_no,
            inode: staged_inode,
            dir_data_blockno,
            ..JournalHeader::empty()
        };
        self.write_header(store, &header)?;
        debug!("journal: committed SYMLINK for inode {}", inode_no);
        Ok(())
    }

    /// Clears the journal back to `EMPTY` after a replay has been applied.
    fn clear(&self, store: &mut BlockStore) -> Result<()> {
        self.write_header(store, &JournalHeader::empty())
    }

    /// Applies (if `completed==1`) or discards (otherwise) the journal,
    /// writing back the inode table entry and bitmap/data mutations per the
    /// op kind's replay table. Idempotent: replaying an already-cleared
    /// journal is a no-op, and replaying a committed journal twice yields
    /// the same state.
    pub fn recover(
        &self,
        store: &mut BlockStore,
        geometry: &Geometry,
        write_inode: impl FnOnce(&mut BlockStore, u32, DiskInode) -> Result<()>,
    ) -> Result<()> {
        let header = self.read_header(store)?;
        if header.completed == 0 {
            debug!("journal: no committed transaction found, discarding");
            return self.clear(store);
        }
        let op = OpKind::try_from(header.op_kind)?;
        debug!("journal: replaying committed {:?} transaction", op);
        let flags = ResizeFlags::from_bits_truncate(header.resize_flags);
        match op {
            OpKind::Empty => {}
            OpKind::Write => {
                let list = self.read_block_list(store, header.n_blocks as usize)?;
                for (i, dest) in list.iter().enumerate() {
                    store.copy_block(self.data_block(i), *dest)?;
                }
            }
            OpKind::Alloc => {
                write_inode(store, header.inode_no, header.inode)?;
                let list = self.read_block_list(store, header.n_blocks as usize)?;
                for b in &list {
                    crate::bitmap::mark_allocated(
                        store,
                        geometry.bitmap_start,
                        geometry.first_data_block,
                        geometry.total_blocks,
                        *b,
                    );
                }
                if flags.contains(ResizeFlags::INDIRECT_TOUCHED) {
                    crate::bitmap::mark_allocated(
                        store,
                        geometry.bitmap_start,
                        geometry.first_data_block,
                        geometry.total_blocks,
                        header.indirect_blockno,
                    );
                    store.copy_block(self.indirect_saved_block(), header.indirect_blockno)?;
                }
                if flags.contains(ResizeFlags::INDIRECT2_TOUCHED) {
                    crate::bitmap::mark_allocated(
                        store,
                        geometry.bitmap_start,
                        geometry.first_data_block,
                        geometry.total_blocks,
                        header.indirect2_blockno,
                    );
                    store.copy_block(self.indirect2_saved_block(), header.indirect2_blockno)?;
                }
            }
            OpKind::Free => {
                write_inode(store, header.inode_no, header.inode)?;
                if flags.contains(ResizeFlags::INDIRECT2_TOUCHED) {
                    crate::bitmap::mark_free(
                        store,
                        geometry.bitmap_start,
                        geometry.first_data_block,
                        geometry.total_blocks,
                        header.indirect2_blockno,
                    );
                } else if header.indirect2_blockno != 0 {
                    store.copy_block(self.indirect2_saved_block(), header.indirect2_blockno)?;
                }
                if flags.contains(ResizeFlags::INDIRECT_TOUCHED) {
                    crate::bitmap::mark_free(
                        store,
                        geometry.bitmap_start,
                        geometry.first_data_block,
                        geometry.total_blocks,
                        header.indirect_blockno,
                    );
                } else if header.indirect_blockno != 0 {
                    store.copy_block(self.indirect_saved_block(), header.indirect_blockno)?;
                }
                let list = self.read_block_list(store, header.n_blocks as usize)?;
                for b in &list {
                    crate::bitmap::mark_free(
                        store,
                        geometry.bitmap_start,
                        geometry.first_data_block,
                        geometry.total_blocks,
                        *b,
                    );
                }
            }
            OpKind::Create | OpKind::HardLink => {
                write_inode(store, header.inode_no, header.inode)?;
                store.copy_block(self.data_block(0), header.dir_data_blockno)?;
            }
            OpKind::Symlink => {
                write_inode(store, header.inode_no, header.inode)?;
                if header.dir_data_blockno != 0 {
                    store.copy_block(self.data_block(0), header.dir_data_blockno)?;
                }
            }
        }
        self.clear(store)?;
        debug!("journal: replay applied and journal cleared");
        Ok(())
    }
}

pub(crate) fn corrupted_if_zero(block: u32, what: &'static str) -> Result<u32> {
    if block == 0 {
        error!("journal: unexpected zero pointer for {}", what);
        Err(FsError::Corrupted(what))
    } else {
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Geometry;

    fn geometry() -> Geometry {
        Geometry::compute(1024, 64)
    }

    #[test]
    fn empty_journal_recovers_as_noop() {
        let g = geometry();
        let mut store = BlockStore::new(g.total_blocks);
        let j = Journal::new(g.journal_start);
        j.recover(&mut store, &g, |_, _, _| Ok(())).unwrap();
        let h = j.read_header(&store).unwrap();
        assert_eq!(h.completed, 0);
    }

    #[test]
    fn write_commit_then_replay_applies_data() {
        let g = geometry();
        let mut store = BlockStore::new(g.total_blocks);
        let j = Journal::new(g.journal_start);
        let dest = g.first_data_block;
        let mut data = [0u8; BLOCK_SIZE];
        data[0] = 0x42;
        j.commit_write(&mut store, &[dest], &[data]).unwrap();
        j.recover(&mut store, &g, |_, _, _| Ok(())).unwrap();
        assert_eq!(store.read(dest).unwrap()[0], 0x42);
        let h = j.read_header(&store).unwrap();
        assert_eq!(h.completed, 0);
    }

    #[test]
    fn uncommitted_journal_is_discarded() {
        let g = geometry();
        let mut store = BlockStore::new(g.total_blocks);
        let j = Journal::new(g.journal_start);
        let dest = g.first_data_block;
        let data = [0xFFu8; BLOCK_SIZE];
        // Stage everything but don't flip completed.
        j.write_block_list(&mut store, &[dest]).unwrap();
        store.write(j.data_block(0), &data).unwrap();
        j.recover(&mut store, &g, |_, _, _| Ok(())).unwrap();
        assert_eq!(store.read(dest).unwrap()[0], 0);
    }

    #[test]
    fn replay_is_idempotent() {
        let g = geometry();
        let mut store = BlockStore::new(g.total_blocks);
        let j = Journal::new(g.journal_start);
        let dest = g.first_data_block;
        let mut data = [0u8; BLOCK_SIZE];
        data[3] = 7;
        j.commit_write(&mut store, &[dest], &[data]).unwrap();
        j.recover(&mut store, &g, |_, _, _| Ok(())).unwrap();
        let first = store.read(dest).unwrap().to_vec();
        // Re-running recover on an already-cleared journal must be a no-op.
        j.recover(&mut store, &g, |_, _, _| Ok(())).unwrap();
        assert_eq!(store.read(dest).unwrap(), &first[..]);
    }
}
