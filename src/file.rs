//! Block-wise file read/write.
use crate::error::{FsError, Result};
use crate::inode::Inode;
use crate::journal::Journal;
use crate::layout::{DiskInode, Geometry, BLOCK_SIZE, MAX_BATCH};
use crate::resize;
use crate::store::BlockStore;
use log::debug;

bitflags::bitflags! {
    /// Open-mode flags relevant to `write`.
    pub struct OpenFlags: u32 {
        const APPEND = 0b1;
    }
}

/// Reads up to `count` bytes at `pos` into `out`, clamped to the file's
/// current size. Returns the number of bytes copied.
pub fn read(store: &BlockStore, inode: &Inode, out: &mut [u8], pos: u64) -> Result<usize> {
    let size = inode.disk.size as u64;
    if pos >= size {
        return Ok(0);
    }
    let count = out.len().min((size - pos) as usize);
    let mut copied = 0usize;
    while copied < count {
        let cur = pos + copied as u64;
        let blockno = inode.require_blockno_of(store, cur)?;
        let in_block = (cur as usize) % BLOCK_SIZE;
        let n = (BLOCK_SIZE - in_block).min(count - copied);
        let block = store.read(blockno)?;
        out[copied..copied + n].copy_from_slice(&block[in_block..in_block + n]);
        copied += n;
    }
    Ok(copied)
}

/// Writes `data` at `pos` (or at EOF if `flags` has `APPEND`), growing the
/// file first if the write extends past its current size, then committing
/// in bounded journal batches of up to `MAX_BATCH` data blocks.
#[allow(clippy::too_many_arguments)]
pub fn write(
    store: &mut BlockStore,
    geometry: &Geometry,
    journal: &Journal,
    inode_no: u32,
    mut inode: Inode,
    data: &[u8],
    pos: u64,
    flags: OpenFlags,
    write_inode: impl Fn(&mut BlockStore, u32, DiskInode) -> Result<()> + Copy,
) -> Result<(Inode, usize)> {
    let pos = if flags.contains(OpenFlags::APPEND) {
        inode.disk.size as u64
    } else {
        pos
    };

    let end = pos + data.len() as u64;
    if end > inode.disk.size as u64 {
        inode = resize::change_size(store, geometry, journal, inode_no, inode, end, write_inode)?;
    }

    let mut destinations: Vec<u32> = Vec::with_capacity(MAX_BATCH);
    let mut scratch: Vec<[u8; BLOCK_SIZE]> = Vec::with_capacity(MAX_BATCH);
    let mut written = 0usize;

    while written < data.len() {
        let cur = pos + written as u64;
        let blockno = inode.require_blockno_of(store, cur)?;
        let in_block = (cur as usize) % BLOCK_SIZE;
        let n = (BLOCK_SIZE - in_block).min(data.len() - written);

        let mut buf = [0u8; BLOCK_SIZE];
        buf.copy_from_slice(store.read(blockno)?);
        buf[in_block..in_block + n].copy_from_slice(&data[written..written + n]);

        destinations.push(blockno);
        scratch.push(buf);
        written += n;

        if destinations.len() == MAX_BATCH {
            flush(journal, store, geometry, &destinations, &scratch, write_inode)?;
            destinations.clear();
            scratch.clear();
        }
    }
    if !destinations.is_empty() {
        flush(journal, store, geometry, &destinations, &scratch, write_inode)?;
    }
    debug!("write: {} bytes at pos {} for inode {}", written, pos, inode_no);
    Ok((inode, written))
}

fn flush(
    journal: &Journal,
    store: &mut BlockStore,
    geometry: &Geometry,
    destinations: &[u32],
    scratch: &[[u8; BLOCK_SIZE]],
    write_inode: impl Fn(&mut BlockStore, u32, DiskInode) -> Result<()> + Copy,
) -> Result<()> {
    journal.commit_write(store, destinations, scratch)?;
    journal.recover(store, geometry, write_inode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::FileType;

    fn env() -> (BlockStore, Geometry, Journal) {
        let g = Geometry::compute(4096, 64);
        let store = BlockStore::new(g.total_blocks);
        let journal = Journal::new(g.journal_start);
        (store, g, journal)
    }

    fn fresh_inode() -> Inode {
        let mut d = DiskInode::zeroed();
        d.ftype = FileType::RegularFile as u32;
        d.nlink = 1;
        Inode::new(7, d)
    }

    fn noop_write_inode(_: &mut BlockStore, _: u32, _: DiskInode) -> Result<()> {
        Ok(())
    }

    #[test]
    fn write_then_read_roundtrips() {
        let (mut store, g, journal) = env();
        let inode = fresh_inode();
        let payload = b"hello, filesystem";
        let (inode, n) = write(
            &mut store,
            &g,
            &journal,
            7,
            inode,
            payload,
            0,
            OpenFlags::empty(),
            noop_write_inode,
        )
        .unwrap();
        assert_eq!(n, payload.len());
        assert_eq!(inode.disk.size as usize, payload.len());

        let mut out = vec![0u8; payload.len()];
        let read_n = read(&store, &inode, &mut out, 0).unwrap();
        assert_eq!(read_n, payload.len());
        assert_eq!(&out, payload);
    }

    #[test]
    fn read_clamps_to_file_size() {
        let (mut store, g, journal) = env();
        let inode = fresh_inode();
        let (inode, _) = write(
            &mut store,
            &g,
            &journal,
            7,
            inode,
            b"abc",
            0,
            OpenFlags::empty(),
            noop_write_inode,
        )
        .unwrap();
        let mut out = [0u8; 16];
        let n = read(&store, &inode, &mut out, 0).unwrap();
        assert_eq!(n, 3);
    }

    #[test]
    fn append_flag_writes_at_eof() {
        let (mut store, g, journal) = env();
        let inode = fresh_inode();
        let (inode, _) = write(
            &mut store,
            &g,
            &journal,
            7,
            inode,
            b"abc",
            0,
            OpenFlags::empty(),
            noop_write_inode,
        )
        .unwrap();
        let (inode, _) = write(
            &mut store,
            &g,
            &journal,
            7,
            inode,
            b"def",
            0,
            OpenFlags::APPEND,
            noop_write_inode,
        )
        .unwrap();
        let mut out = [0u8; 6];
        read(&store, &inode, &mut out, 0).unwrap();
        assert_eq!(&out, b"abcdef");
    }
}
