//! Top-level filesystem: formatting, mounting, and the VFS-facing surface.
//! Concurrency model is a single exclusive lock per mount — every public
//! method locks internally via [`std::sync::Mutex`], matching the
//! grounding repo's single-mount-at-a-time design without its
//! kernel-specific `SpinLock`/`RwLock` types.
use std::sync::Mutex;

use crate::dir;
use crate::error::{FsError, Result};
use crate::file::{self, OpenFlags};
use crate::inode::Inode;
use crate::journal::Journal;
use crate::layout::{DiskInode, FileType, Geometry, SuperBlock, BLOCK_SIZE, MAGIC, ROOT_INODE};
use crate::resize;
use crate::store::BlockStore;
use log::{debug, info, warn};

struct Inner {
    store: BlockStore,
    geometry: Geometry,
    journal: Journal,
}

/// An in-memory, block-addressed filesystem image with a write-ahead
/// journal. All operations are serialized behind a single internal lock;
/// there is no reader/writer split.
pub struct FileSystem {
    inner: Mutex<Inner>,
}

impl Inner {
    fn read_inode(&self, number: u32) -> Result<Inode> {
        if number == 0 || number >= self.geometry.inode_count {
            return Err(FsError::NotFound);
        }
        let per_block = Geometry::inodes_per_block();
        let block = self.geometry.inode_table_start + number / per_block;
        let idx = (number % per_block) as usize;
        let disk = unsafe { DiskInode::read_at(self.store.read(block)?, idx) };
        Ok(Inode::new(number, disk))
    }

    fn writer(&mut self) -> (&mut BlockStore, &Geometry, &Journal) {
        (&mut self.store, &self.geometry, &self.journal)
    }
}

/// Durable write-back closure shared by every mutation path; captured as a
/// plain function pointer (not a closure over `&mut Inner`) so it can be
/// threaded through `resize`/`dir`/`file` without a second mutable borrow of
/// `self.inner`. Each call site re-derives the table block address itself.
fn write_inode_into(store: &mut BlockStore, geometry: &Geometry, number: u32, disk: DiskInode) -> Result<()> {
    let per_block = Geometry::inodes_per_block();
    let block = geometry.inode_table_start + number / per_block;
    let idx = (number % per_block) as usize;
    let buf = store.read_mut_unlogged(block)?;
    disk.write_at(buf, idx);
    Ok(())
}

impl FileSystem {
    /// Formats a fresh image of `total_blocks` blocks with `inode_count`
    /// inodes and creates the root directory at [`ROOT_INODE`].
    pub fn format(total_blocks: u32, inode_count: u32) -> Result<Self> {
        let geometry = Geometry::compute(total_blocks, inode_count);
        if geometry.first_data_block >= total_blocks {
            return Err(FsError::NoSpace);
        }
        let mut store = BlockStore::new(total_blocks);

        let sb = geometry.to_superblock();
        debug_assert_eq!(sb.magic, MAGIC);
        sb.write_to(store.read_mut_unlogged(1)?);

        // Reserved blocks (boot, superblock, bitmap, inode table, journal)
        // stay permanently allocated by leaving their bitmap bits clear;
        // every block in the data region starts free.
        for b in geometry.bitmap_start..geometry.first_data_block {
            let blk = store.read_mut_unlogged(b)?;
            blk.fill(0);
        }
        for blockno in geometry.first_data_block..total_blocks {
            crate::bitmap::mark_free(
                &mut store,
                geometry.bitmap_start,
                geometry.first_data_block,
                total_blocks,
                blockno,
            );
        }

        let root_disk = DiskInode {
            size: 0,
            ftype: FileType::Directory as u32,
            mode: 0o755,
            nlink: 1,
            ..DiskInode::zeroed()
        };
        write_inode_into(&mut store, &geometry, ROOT_INODE, root_disk)?;

        let journal = Journal::new(geometry.journal_start);
        info!(
            "format: {} blocks, {} inodes, data region starts at {}",
            total_blocks, inode_count, geometry.first_data_block
        );
        let fs = Self {
            inner: Mutex::new(Inner { store, geometry, journal }),
        };
        Ok(fs)
    }

    /// Mounts an existing image, replaying any committed-but-unapplied
    /// journal transaction.
    pub fn mount(bytes: Vec<u8>) -> Result<Self> {
        let mut store = BlockStore::from_bytes(bytes)?;
        let sb = unsafe { SuperBlock::from_bytes(store.read(1)?) };
        if sb.magic != MAGIC {
            return Err(FsError::Corrupted("bad superblock magic"));
        }
        let geometry = Geometry::from_superblock(&sb);
        let journal = Journal::new(geometry.journal_start);
        let geom_for_cb = geometry;
        journal.recover(&mut store, &geometry, |store, n, disk| {
            write_inode_into(store, &geom_for_cb, n, disk)
        })?;
        debug!("mount: recovered journal state for {} blocks", geometry.total_blocks);
        Ok(Self {
            inner: Mutex::new(Inner { store, geometry, journal }),
        })
    }

    fn with_inner<T>(&self, f: impl FnOnce(&mut Inner) -> Result<T>) -> Result<T> {
        let mut guard = self.inner.lock().expect("filesystem lock poisoned");
        f(&mut guard)
    }

    /// `lookup(dir, name)`: returns the inode number, or
    /// [`FsError::NotFound`] ("negative") if absent.
    pub fn lookup(&self, dir_no: u32, name: &str) -> Result<u32> {
        self.with_inner(|inner| {
            let dir = inner.read_inode(dir_no)?;
            match dir::find_entry(&inner.store, &dir, name)? {
                Some((_, ino)) => Ok(ino),
                None => Err(FsError::NotFound),
            }
        })
    }

    /// `readdir(dir, pos)`.
    pub fn readdir(&self, dir_no: u32, parent_no: u32, pos: usize) -> Result<Option<(Vec<u8>, u32, u8, usize)>> {
        self.with_inner(|inner| {
            let dir = inner.read_inode(dir_no)?;
            dir::readdir(&inner.store, dir_no, parent_no, &dir, pos, |n| inner.read_inode(n))
        })
    }

    /// `create(dir, name, mode)`.
    pub fn create(&self, dir_no: u32, name: &str, mode: u32) -> Result<u32> {
        self.with_inner(|inner| {
            let dir = inner.read_inode(dir_no)?;
            let inode_count = inner.geometry.inode_count;
            let new_no = dir::allocate_inode_slot(|n| inner.read_inode(n), inode_count)?;
            let geom = inner.geometry;
            let (store, geometry, journal) = inner.writer();
            let (_, new_inode) = dir::create(store, geometry, journal, dir_no, dir, name, mode, new_no, |s, n, d| {
                write_inode_into(s, &geom, n, d)
            })?;
            Ok(new_inode.number)
        })
    }

    /// `link(src_ino, dir, name)`.
    pub fn link(&self, src_ino: u32, dir_no: u32, name: &str) -> Result<()> {
        self.with_inner(|inner| {
            let dir = inner.read_inode(dir_no)?;
            let target = inner.read_inode(src_ino)?;
            let geom = inner.geometry;
            let (store, geometry, journal) = inner.writer();
            dir::link(store, geometry, journal, dir_no, dir, name, src_ino, target, |s, n, d| {
                write_inode_into(s, &geom, n, d)
            })?;
            Ok(())
        })
    }

    /// `unlink(dir, name)`.
    pub fn unlink(&self, dir_no: u32, name: &str) -> Result<()> {
        self.with_inner(|inner| {
            let dir = inner.read_inode(dir_no)?;
            let (_, target_no) = dir::find_entry(&inner.store, &dir, name)?.ok_or(FsError::NotFound)?;
            let target = inner.read_inode(target_no)?;
            let geom = inner.geometry;
            let (store, geometry, journal) = inner.writer();
            dir::unlink(store, geometry, journal, dir_no, &dir, name, target, |s, n, d| {
                write_inode_into(s, &geom, n, d)
            })?;
            Ok(())
        })
    }

    /// `symlink(dir, name, target)`.
    pub fn symlink(&self, dir_no: u32, name: &str, target: &str) -> Result<u32> {
        self.with_inner(|inner| {
            let dir = inner.read_inode(dir_no)?;
            let inode_count = inner.geometry.inode_count;
            let new_no = dir::allocate_inode_slot(|n| inner.read_inode(n), inode_count)?;
            let geom = inner.geometry;
            let (store, geometry, journal) = inner.writer();
            let (_, new_inode) = dir::symlink(store, geometry, journal, dir_no, dir, name, target, new_no, |s, n, d| {
                write_inode_into(s, &geom, n, d)
            })?;
            Ok(new_inode.number)
        })
    }

    /// `follow_link(ino)`.
    pub fn follow_link(&self, ino: u32, effective_uid: u32) -> Result<Vec<u8>> {
        self.with_inner(|inner| {
            let inode = inner.read_inode(ino)?;
            if inode.file_type()? != FileType::Symlink {
                return Err(FsError::Io);
            }
            let stored = dir::read_symlink_content(&inode);
            Ok(dir::follow_link(&stored, effective_uid).to_vec())
        })
    }

    /// `read(file, buf, count, &pos)`.
    pub fn read(&self, ino: u32, out: &mut [u8], pos: u64) -> Result<usize> {
        self.with_inner(|inner| {
            let inode = inner.read_inode(ino)?;
            file::read(&inner.store, &inode, out, pos)
        })
    }

    /// `write(file, buf, count, &pos)`.
    pub fn write(&self, ino: u32, data: &[u8], pos: u64, append: bool) -> Result<usize> {
        self.with_inner(|inner| {
            let inode = inner.read_inode(ino)?;
            let geom = inner.geometry;
            let (store, geometry, journal) = inner.writer();
            let flags = if append { OpenFlags::APPEND } else { OpenFlags::empty() };
            let (_, n) = file::write(store, geometry, journal, ino, inode, data, pos, flags, |s, n, d| {
                write_inode_into(s, &geom, n, d)
            })?;
            Ok(n)
        })
    }

    /// `setattr(size, mode)`: `size` drives [`resize::change_size`];
    /// `mode` is moved opaquely into the inode record.
    pub fn setattr(&self, ino: u32, size: Option<u64>, mode: Option<u32>) -> Result<()> {
        self.with_inner(|inner| {
            let mut inode = inner.read_inode(ino)?;
            let geom = inner.geometry;
            if let Some(size) = size {
                let (store, geometry, journal) = inner.writer();
                inode = resize::change_size(store, geometry, journal, ino, inode, size, |s, n, d| {
                    write_inode_into(s, &geom, n, d)
                })?;
            }
            if let Some(mode) = mode {
                inode.disk.mode = mode;
                let (store, geometry, journal) = inner.writer();
                journal.commit_free(
                    store,
                    ino,
                    inode.disk,
                    &[],
                    0,
                    0,
                    crate::journal::ResizeFlags::empty(),
                    None,
                    None,
                )?;
                journal.recover(store, geometry, |s, n, d| write_inode_into(s, &geom, n, d))?;
            }
            Ok(())
        })
    }

    /// Returns the total block count (for diagnostics/tests).
    pub fn block_count(&self) -> u32 {
        self.inner.lock().expect("filesystem lock poisoned").geometry.total_blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logger() {
        use std::sync::Once;
        static ONCE: Once = Once::new();
        ONCE.call_once(|| {
            let _ = env_logger::Builder::new().is_test(true).try_init();
        });
    }

    #[test]
    fn format_creates_root_directory() {
        logger();
        let fs = FileSystem::format(2048, 128).unwrap();
        let ino = fs.lookup(ROOT_INODE, ".").ok();
        assert!(ino.is_none() || ino == Some(ROOT_INODE));
    }

    #[test]
    fn create_then_lookup_then_write_read() {
        logger();
        let fs = FileSystem::format(4096, 128).unwrap();
        let ino = fs.create(ROOT_INODE, "hello.txt", 0o644).unwrap();
        assert_eq!(fs.lookup(ROOT_INODE, "hello.txt").unwrap(), ino);

        let n = fs.write(ino, b"hello world", 0, false).unwrap();
        assert_eq!(n, 11);
        let mut buf = [0u8; 11];
        let r = fs.read(ino, &mut buf, 0).unwrap();
        assert_eq!(r, 11);
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn hard_link_then_unlink_scenario_s5() {
        logger();
        let fs = FileSystem::format(4096, 128).unwrap();
        let a = fs.create(ROOT_INODE, "a", 0o644).unwrap();
        fs.write(a, b"payload", 0, false).unwrap();
        fs.link(a, ROOT_INODE, "b").unwrap();
        fs.unlink(ROOT_INODE, "a").unwrap();

        let b_ino = fs.lookup(ROOT_INODE, "b").unwrap();
        assert_eq!(b_ino, a);
        let mut buf = [0u8; 7];
        fs.read(b_ino, &mut buf, 0).unwrap();
        assert_eq!(&buf, b"payload");
        assert!(fs.lookup(ROOT_INODE, "a").is_err());
    }

    #[test]
    fn conditional_symlink_scenario_s6() {
        logger();
        let fs = FileSystem::format(4096, 128).unwrap();
        let link_ino = fs.symlink(ROOT_INODE, "cond", "root?/x:/y").unwrap();
        assert_eq!(fs.follow_link(link_ino, 0).unwrap(), b"/x");
        assert_eq!(fs.follow_link(link_ino, 1000).unwrap(), b"/y");
    }

    #[test]
    fn setattr_size_zero_frees_blocks_scenario_s2() {
        logger();
        let fs = FileSystem::format(4096, 128).unwrap();
        let ino = fs.create(ROOT_INODE, "big", 0o644).unwrap();
        let payload = vec![7u8; 11 * BLOCK_SIZE];
        fs.write(ino, &payload, 0, false).unwrap();
        fs.setattr(ino, Some(0), None).unwrap();
        let mut buf = [0u8; 4];
        let n = fs.read(ino, &mut buf, 0).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn create_duplicate_name_fails() {
        logger();
        let fs = FileSystem::format(2048, 128).unwrap();
        fs.create(ROOT_INODE, "dup", 0o644).unwrap();
        let err = fs.create(ROOT_INODE, "dup", 0o644).unwrap_err();
        assert_eq!(err, FsError::AlreadyExists);
    }

    #[test]
    fn lookup_missing_name_is_not_found() {
        logger();
        let fs = FileSystem::format(2048, 128).unwrap();
        assert_eq!(fs.lookup(ROOT_INODE, "nope").unwrap_err(), FsError::NotFound);
        warn!("expected-not-found probe complete");
    }

    #[test]
    fn unlink_symlink_clears_inline_target_and_frees_the_name() {
        logger();
        let fs = FileSystem::format(2048, 128).unwrap();
        let link_ino = fs.symlink(ROOT_INODE, "cond", "root?/x:/y").unwrap();
        fs.unlink(ROOT_INODE, "cond").unwrap();
        assert!(fs.lookup(ROOT_INODE, "cond").is_err());
        assert!(fs.follow_link(link_ino, 0).is_err());
    }

    #[test]
    fn readdir_reports_each_entrys_own_file_type() {
        logger();
        let fs = FileSystem::format(4096, 128).unwrap();
        fs.create(ROOT_INODE, "a_file", 0o644).unwrap();
        fs.symlink(ROOT_INODE, "a_link", "/etc/passwd").unwrap();

        let mut seen = std::collections::HashMap::new();
        let mut pos = 0usize;
        while let Some((name, _, ftype, next)) = fs.readdir(ROOT_INODE, ROOT_INODE, pos).unwrap() {
            seen.insert(name, ftype);
            pos = next;
        }
        assert_eq!(seen.get(b"a_file".as_slice()), Some(&(FileType::RegularFile as u8)));
        assert_eq!(seen.get(b"a_link".as_slice()), Some(&(FileType::Symlink as u8)));
    }
}
