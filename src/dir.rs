//! Directory operations: entry lookup, creation, linking, unlinking, and
//! symlink handling.
use crate::error::{FsError, Result};
use crate::inode::Inode;
use crate::journal::Journal;
use crate::layout::{DirectoryEntry, DiskInode, FileType, Geometry, BLOCK_SIZE, ENTRIES_PER_BLOCK, MAX_SYMLINK_LEN};
use crate::resize;
use crate::store::BlockStore;
use log::{debug, trace};

/// Location of a directory entry within its owning directory's data blocks.
#[derive(Clone, Copy, Debug)]
pub struct EntryLocation {
    pub block_index_in_dir: usize,
    pub slot_in_block: usize,
}

fn read_dir_block(store: &BlockStore, dir: &Inode, block_index: usize) -> Result<[u8; BLOCK_SIZE]> {
    let blockno = dir.require_blockno_of(store, (block_index * BLOCK_SIZE) as u64)?;
    let mut buf = [0u8; BLOCK_SIZE];
    buf.copy_from_slice(store.read(blockno)?);
    Ok(buf)
}

/// Linear scan for `name` in `dir`'s data bytes at `ENTRY_SIZE` stride.
pub fn find_entry(store: &BlockStore, dir: &Inode, name: &str) -> Result<Option<(EntryLocation, u32)>> {
    let blocks = dir.nblocks();
    for block_index in 0..blocks {
        let buf = read_dir_block(store, dir, block_index)?;
        for slot in 0..ENTRIES_PER_BLOCK {
            let entry = unsafe { DirectoryEntry::read_at(&buf, slot) };
            trace!("find_entry: dir {} block {} slot {}", dir.number, block_index, slot);
            if entry.matches(name) {
                return Ok(Some((
                    EntryLocation {
                        block_index_in_dir: block_index,
                        slot_in_block: slot,
                    },
                    entry.ino,
                )));
            }
        }
    }
    Ok(None)
}

/// Finds the first blank (`inode_no==0`) slot in `dir`, growing the
/// directory by exactly one zeroed block via [`resize::change_size`] if none
/// exists.
pub fn find_blank_entry(
    store: &mut BlockStore,
    geometry: &Geometry,
    journal: &Journal,
    dir_no: u32,
    dir: Inode,
    write_inode: impl Fn(&mut BlockStore, u32, DiskInode) -> Result<()> + Copy,
) -> Result<(Inode, EntryLocation)> {
    let blocks = dir.nblocks();
    for block_index in 0..blocks {
        let buf = read_dir_block(store, &dir, block_index)?;
        for slot in 0..ENTRIES_PER_BLOCK {
            let entry = unsafe { DirectoryEntry::read_at(&buf, slot) };
            if entry.ino == 0 {
                return Ok((
                    dir,
                    EntryLocation {
                        block_index_in_dir: block_index,
                        slot_in_block: slot,
                    },
                ));
            }
        }
    }
    let new_size = dir.disk.size as u64 + BLOCK_SIZE as u64;
    let grown = resize::change_size(store, geometry, journal, dir_no, dir, new_size, write_inode)?;
    debug!("find_blank_entry: grew directory {} to {} blocks", dir_no, grown.nblocks());
    Ok((
        grown,
        EntryLocation {
            block_index_in_dir: blocks,
            slot_in_block: 0,
        },
    ))
}

fn dir_block_image_with_entry(
    store: &BlockStore,
    dir: &Inode,
    loc: EntryLocation,
    entry: DirectoryEntry,
) -> Result<(u32, [u8; BLOCK_SIZE])> {
    let blockno = dir.require_blockno_of(store, (loc.block_index_in_dir * BLOCK_SIZE) as u64)?;
    let mut buf = [0u8; BLOCK_SIZE];
    buf.copy_from_slice(store.read(blockno)?);
    entry.write_at(&mut buf, loc.slot_in_block);
    Ok((blockno, buf))
}

/// Links `target_inode` into `dir` under `name`. Requires
/// the caller already resolved `target_inode` and bumped nothing; the
/// staged `link_count+1` happens here.
pub fn link(
    store: &mut BlockStore,
    geometry: &Geometry,
    journal: &Journal,
    dir_no: u32,
    dir: Inode,
    name: &str,
    target_no: u32,
    mut target: Inode,
    write_inode: impl Fn(&mut BlockStore, u32, DiskInode) -> Result<()> + Copy,
) -> Result<(Inode, Inode)> {
    if find_entry(store, &dir, name)?.is_some() {
        return Err(FsError::AlreadyExists);
    }
    let (dir, loc) = find_blank_entry(store, geometry, journal, dir_no, dir, write_inode)?;
    let entry = DirectoryEntry::from_ino_name(target_no, name)?;
    let (dir_blockno, image) = dir_block_image_with_entry(store, &dir, loc, entry)?;

    target.disk.nlink += 1;
    journal.commit_create_or_hardlink(
        store,
        crate::journal::OpKind::HardLink,
        target_no,
        target.disk,
        dir_blockno,
        &image,
    )?;
    journal.recover(store, geometry, write_inode)?;
    debug!("link: {} -> inode {} in dir {}", name, target_no, dir_no);
    Ok((dir, target))
}

/// Scans the inode table for a free slot (`nlink==0`), starting low-to-high
/// after the reserved root.
pub fn allocate_inode_slot(
    read_inode: impl Fn(u32) -> Result<Inode>,
    inode_count: u32,
) -> Result<u32> {
    for n in (crate::layout::ROOT_INODE + 1)..inode_count {
        if read_inode(n)?.is_free_slot() {
            return Ok(n);
        }
    }
    Err(FsError::OutOfMemory)
}

/// Creates a new regular file `name` in `dir`.
#[allow(clippy::too_many_arguments)]
pub fn create(
    store: &mut BlockStore,
    geometry: &Geometry,
    journal: &Journal,
    dir_no: u32,
    dir: Inode,
    name: &str,
    mode: u32,
    new_inode_no: u32,
    write_inode: impl Fn(&mut BlockStore, u32, DiskInode) -> Result<()> + Copy,
) -> Result<(Inode, Inode)> {
    if find_entry(store, &dir, name)?.is_some() {
        return Err(FsError::AlreadyExists);
    }
    let (dir, loc) = find_blank_entry(store, geometry, journal, dir_no, dir, write_inode)?;
    let entry = DirectoryEntry::from_ino_name(new_inode_no, name)?;
    let (dir_blockno, image) = dir_block_image_with_entry(store, &dir, loc, entry)?;

    let new_disk = DiskInode {
        size: 0,
        ftype: FileType::RegularFile as u32,
        mode,
        nlink: 1,
        ..DiskInode::zeroed()
    };
    journal.commit_create_or_hardlink(
        store,
        crate::journal::OpKind::Create,
        new_inode_no,
        new_disk,
        dir_blockno,
        &image,
    )?;
    journal.recover(store, geometry, write_inode)?;
    debug!("create: {} as inode {} in dir {}", name, new_inode_no, dir_no);
    Ok((dir, Inode::new(new_inode_no, new_disk)))
}

/// Removes `name` from `dir`; decrements the target's link count and frees
/// it when the count reaches zero.
pub fn unlink(
    store: &mut BlockStore,
    geometry: &Geometry,
    journal: &Journal,
    dir_no: u32,
    dir: &Inode,
    name: &str,
    mut target: Inode,
    write_inode: impl Fn(&mut BlockStore, u32, DiskInode) -> Result<()> + Copy,
) -> Result<Inode> {
    let (loc, _) = find_entry(store, dir, name)?.ok_or(FsError::NotFound)?;
    let blockno = dir.require_blockno_of(store, (loc.block_index_in_dir * BLOCK_SIZE) as u64)?;
    // A single-word write is atomic on word-aligned storage; no journal
    // transaction is required to blank the entry itself.
    let mut buf = [0u8; BLOCK_SIZE];
    buf.copy_from_slice(store.read(blockno)?);
    DirectoryEntry::blank().write_at(&mut buf, loc.slot_in_block);
    store.write(blockno, &buf)?;

    target.disk.nlink = target.disk.nlink.saturating_sub(1);
    if target.disk.nlink == 0 {
        if target.file_type()? == FileType::Symlink {
            // The target text lives inline in the pointer region; there is
            // no block chain to free.
            target.disk.symlink_storage_mut().fill(0);
            target.disk.size = 0;
        } else {
            target = resize::change_size(store, geometry, journal, target.number, target, 0, write_inode)?;
        }
        target.disk.ftype = FileType::RegularFile as u32;
        journal.commit_free(
            store,
            target.number,
            target.disk,
            &[],
            0,
            0,
            crate::journal::ResizeFlags::empty(),
            None,
            None,
        )?;
        journal.recover(store, geometry, write_inode)?;
    } else {
        journal.commit_free(
            store,
            target.number,
            target.disk,
            &[],
            0,
            0,
            crate::journal::ResizeFlags::empty(),
            None,
            None,
        )?;
        journal.recover(store, geometry, write_inode)?;
    }
    debug!(
        "unlink: {} from dir {} ({})",
        name,
        dir_no,
        if target.disk.nlink == 0 { "freed" } else { "still linked" }
    );
    Ok(target)
}

/// Converts a `root?A:B` conditional-link target into the stored
/// `root?A\0B\0` form; otherwise returns the target unchanged.
pub fn encode_symlink_target(target: &str) -> Vec<u8> {
    const PREFIX: &str = "root?";
    if let Some(rest) = target.strip_prefix(PREFIX) {
        if let Some(colon) = rest.find(':') {
            let mut out = Vec::with_capacity(target.len());
            out.extend_from_slice(PREFIX.as_bytes());
            out.extend_from_slice(rest[..colon].as_bytes());
            out.push(0);
            out.extend_from_slice(rest[colon + 1..].as_bytes());
            out.push(0);
            return out;
        }
    }
    target.as_bytes().to_vec()
}

/// Creates a symlink `name -> target` in `dir`.
#[allow(clippy::too_many_arguments)]
pub fn symlink(
    store: &mut BlockStore,
    geometry: &Geometry,
    journal: &Journal,
    dir_no: u32,
    dir: Inode,
    name: &str,
    target: &str,
    new_inode_no: u32,
    write_inode: impl Fn(&mut BlockStore, u32, DiskInode) -> Result<()> + Copy,
) -> Result<(Inode, Inode)> {
    if find_entry(store, &dir, name)?.is_some() {
        return Err(FsError::AlreadyExists);
    }
    let encoded = encode_symlink_target(target);
    if encoded.len() > MAX_SYMLINK_LEN {
        return Err(FsError::NameTooLong);
    }
    let (dir, loc) = find_blank_entry(store, geometry, journal, dir_no, dir, write_inode)?;
    let entry = DirectoryEntry::from_ino_name(new_inode_no, name)?;
    let (dir_blockno, image) = dir_block_image_with_entry(store, &dir, loc, entry)?;

    let mut new_disk = DiskInode {
        size: encoded.len() as u32,
        ftype: FileType::Symlink as u32,
        mode: 0,
        nlink: 1,
        ..DiskInode::zeroed()
    };
    new_disk.symlink_storage_mut()[..encoded.len()].copy_from_slice(&encoded);
    journal.commit_symlink(store, new_inode_no, new_disk, dir_blockno, &image)?;
    journal.recover(store, geometry, write_inode)?;
    debug!("symlink: {} -> {:?} as inode {} in dir {}", name, target, new_inode_no, dir_no);
    Ok((dir, Inode::new(new_inode_no, new_disk)))
}

/// Reads a symlink's inline stored bytes (the `root?A\0B\0`-encoded or
/// plain target text) for [`follow_link`].
pub fn read_symlink_content(inode: &Inode) -> Vec<u8> {
    let size = inode.disk.size as usize;
    inode.disk.symlink_storage()[..size].to_vec()
}

/// Resolves a stored symlink target for `follow_link`: if the
/// stored form starts with `root?`, returns the text after the literal
/// prefix when `effective_uid == 0`, otherwise the bytes after the first
/// internal NUL.
pub fn follow_link(stored: &[u8], effective_uid: u32) -> &[u8] {
    const PREFIX: &[u8] = b"root?";
    if let Some(rest) = stored.strip_prefix(PREFIX) {
        if effective_uid == 0 {
            return trim_trailing_nul(rest);
        }
        if let Some(nul_pos) = rest.iter().position(|&b| b == 0) {
            return trim_trailing_nul(&rest[nul_pos + 1..]);
        }
    }
    trim_trailing_nul(stored)
}

fn trim_trailing_nul(bytes: &[u8]) -> &[u8] {
    match bytes.iter().position(|&b| b == 0) {
        Some(p) => &bytes[..p],
        None => bytes,
    }
}

/// Synthesizes `.`/`..` at positions 0/1 then yields stored entries,
/// skipping blank slots. `read_inode` resolves each entry's target so its
/// real file type (regular/directory/symlink) can be reported rather than
/// assumed.
pub fn readdir(
    store: &BlockStore,
    dir_no: u32,
    parent_no: u32,
    dir: &Inode,
    pos: usize,
    read_inode: impl Fn(u32) -> Result<Inode>,
) -> Result<Option<(Vec<u8>, u32, u8, usize)>> {
    match pos {
        0 => return Ok(Some((b".".to_vec(), dir_no, FileType::Directory as u8, 1))),
        1 => return Ok(Some((b"..".to_vec(), parent_no, FileType::Directory as u8, 2))),
        _ => {}
    }
    let storage_slot = pos - 2;
    let total_slots = dir.nblocks() * ENTRIES_PER_BLOCK;
    let mut slot = storage_slot;
    while slot < total_slots {
        let block_index = slot / ENTRIES_PER_BLOCK;
        let in_block = slot % ENTRIES_PER_BLOCK;
        let buf = read_dir_block(store, dir, block_index)?;
        let entry = unsafe { DirectoryEntry::read_at(&buf, in_block) };
        if entry.ino != 0 {
            let ftype = read_inode(entry.ino)?.file_type()? as u8;
            return Ok(Some((
                entry.name_bytes().to_vec(),
                entry.ino,
                ftype,
                pos + (slot - storage_slot) + 1,
            )));
        }
        slot += 1;
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conditional_symlink_encoding() {
        let encoded = encode_symlink_target("root?/x:/y");
        assert_eq!(encoded, b"root?/x\0/y\0");
    }

    #[test]
    fn plain_symlink_target_is_unmodified() {
        let encoded = encode_symlink_target("/etc/passwd");
        assert_eq!(encoded, b"/etc/passwd");
    }

    #[test]
    fn follow_link_resolves_by_effective_uid() {
        let stored = encode_symlink_target("root?/x:/y");
        assert_eq!(follow_link(&stored, 0), b"/x");
        assert_eq!(follow_link(&stored, 1000), b"/y");
    }

    #[test]
    fn follow_link_plain_target_ignores_uid() {
        let stored = encode_symlink_target("/etc/passwd");
        assert_eq!(follow_link(&stored, 0), b"/etc/passwd");
        assert_eq!(follow_link(&stored, 1000), b"/etc/passwd");
    }
}
