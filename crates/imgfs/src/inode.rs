use std::time::{SystemTime, UNIX_EPOCH};

use dataview::PodMethods as _;
use imgfs_types::{
    BLOCK_SIZE, BlockNo, IndirectBlock, InodeNo, InodeRecord, MAX_FILE_BLOCKS, TimeSpec,
};
use log::trace;

use crate::{Error, Result, image::Image};

/// Inode address.
///
/// The root record lives in the image header; every other record is a slot
/// of the inode table, addressed by index. Converting an id to a record
/// reference is a local operation on the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeId {
    Root,
    Node(InodeNo),
}

impl InodeId {
    /// Id as stored in directory blobs: the root serializes as -1.
    pub(crate) fn to_entry(self) -> i32 {
        match self {
            Self::Root => -1,
            Self::Node(ino) => i32::try_from(ino.value()).unwrap(),
        }
    }

    /// Inverse of [`InodeId::to_entry`].
    pub(crate) fn from_entry(id: i32) -> Result<Self> {
        match id {
            -1 => Ok(Self::Root),
            id => {
                let ino = u32::try_from(id).map_err(|_| Error::CorruptDirectory)?;
                Ok(Self::Node(InodeNo::new(ino)))
            }
        }
    }
}

/// Content read out of an inode; owned by the caller.
pub struct ReadData {
    pub mode: u32,
    pub size: u64,
    pub bytes: Vec<u8>,
}

/// Current wall clock as an on-disk timestamp.
fn now() -> TimeSpec {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    TimeSpec {
        sec: i64::try_from(elapsed.as_secs()).unwrap(),
        nsec: i64::from(elapsed.subsec_nanos()),
    }
}

/// Takes the lowest free inode-table slot.
pub(crate) fn allocate(img: &mut Image) -> Result<InodeNo> {
    let Some(n) = img.header().inode_bitmap.first_clear() else {
        return Err(Error::NoSpace);
    };
    img.header_mut().inode_bitmap.set_bit(n);
    let ino = InodeNo::new(u32::try_from(n).unwrap());
    trace!("allocate inode {ino}");
    Ok(ino)
}

/// Returns an inode-table slot to the free pool and clears its record.
pub(crate) fn release(img: &mut Image, ino: InodeNo) {
    trace!("release inode {ino}");
    img.header_mut().inode_bitmap.clear_bit(ino.as_index());
    *img.inode_mut(InodeId::Node(ino)) = InodeRecord::zeroed();
}

/// Fills a fresh record: the caller's mode, one link, the mounting user's
/// uid/gid, no content, all three timestamps now.
pub(crate) fn set_defaults(img: &mut Image, id: InodeId, mode: u32) {
    let t = now();
    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };
    let node = img.inode_mut(id);
    node.mode = mode;
    node.nlink = 1;
    node.uid = uid;
    node.gid = gid;
    node.rdev = 0;
    node.size = 0;
    node.set_direct(None);
    node.set_indirect(None);
    node.atim = t;
    node.mtim = t;
    node.ctim = t;
}

/// Stamps a content modification.
pub(crate) fn touch_modified(img: &mut Image, id: InodeId) {
    let t = now();
    let node = img.inode_mut(id);
    node.mtim = t;
    node.ctim = t;
}

/// Stamps a metadata change.
pub(crate) fn touch_changed(img: &mut Image, id: InodeId) {
    img.inode_mut(id).ctim = now();
}

/// Copy of an inode's indirect array.
fn indirect_copy(img: &Image, bn: BlockNo) -> IndirectBlock {
    let mut ind = IndirectBlock::zeroed();
    ind.as_bytes_mut().copy_from_slice(img.block(bn));
    ind
}

/// Block backing the `index`th content block, if present.
fn nth_block(img: &Image, id: InodeId, index: usize) -> Option<BlockNo> {
    let node = img.inode(id);
    if index == 0 {
        return node.direct();
    }
    let ind_bn = node.indirect()?;
    img.block(ind_bn)
        .as_data_view()
        .get::<IndirectBlock>(0)
        .get(index - 1)
}

/// Ordered list of the blocks backing content blocks `0 .. count`.
fn block_list(img: &Image, id: InodeId, count: usize) -> Vec<BlockNo> {
    let node = img.inode(id);
    let mut blocks = Vec::with_capacity(count);
    if count == 0 {
        return blocks;
    }
    if let Some(bn) = node.direct() {
        blocks.push(bn);
    }
    if count > 1 {
        if let Some(ind_bn) = node.indirect() {
            let ind = img.block(ind_bn).as_data_view().get::<IndirectBlock>(0);
            for slot in 0..count - 1 {
                let Some(bn) = ind.get(slot) else { break };
                blocks.push(bn);
            }
        }
    }
    blocks
}

/// Reconciles an inode's block allocation to `new_size`, then records the
/// new size.
///
/// A grow that runs out of space releases every block taken by this call
/// and leaves the inode unchanged, so the size/pointer invariants survive
/// `NoSpace`. A shrink zeroes the tail of the last surviving block, which
/// is what makes a later truncate-up read zeros there.
pub(crate) fn resize(img: &mut Image, id: InodeId, new_size: u64) -> Result<()> {
    let len = usize::try_from(new_size).map_err(|_| Error::FileTooBig)?;
    let want = len.div_ceil(BLOCK_SIZE);
    if want > MAX_FILE_BLOCKS {
        return Err(Error::FileTooBig);
    }

    let old_size = img.inode(id).size;
    let cur = img.inode(id).block_count();
    if want > cur {
        grow(img, id, cur, want)?;
    } else if want < cur {
        shrink(img, id, cur, want);
    }
    img.inode_mut(id).size = new_size;
    if new_size < old_size {
        zero_tail(img, id, len);
    }
    Ok(())
}

fn grow(img: &mut Image, id: InodeId, cur: usize, want: usize) -> Result<()> {
    let prior_direct = img.inode(id).direct();
    let prior_indirect = img.inode(id).indirect();
    let mut taken = Vec::new();

    let res = (|| -> Result<()> {
        if img.inode(id).direct().is_none() {
            let bn = img.take_block()?;
            taken.push(bn);
            img.inode_mut(id).set_direct(Some(bn));
        }
        if want > 1 {
            let ind_bn = match img.inode(id).indirect() {
                Some(bn) => bn,
                None => {
                    // zeroed on take, so unused slots read as "no block"
                    let bn = img.take_block()?;
                    taken.push(bn);
                    img.inode_mut(id).set_indirect(Some(bn));
                    bn
                }
            };
            let mut ind = indirect_copy(img, ind_bn);
            for slot in cur.saturating_sub(1)..want - 1 {
                if ind.get(slot).is_none() {
                    let bn = img.take_block()?;
                    taken.push(bn);
                    ind.set(slot, Some(bn));
                }
            }
            img.block_mut(ind_bn).copy_from_slice(ind.as_bytes());
        }
        Ok(())
    })();

    if let Err(err) = res {
        for bn in taken {
            img.release_block(bn);
        }
        let node = img.inode_mut(id);
        node.set_direct(prior_direct);
        node.set_indirect(prior_indirect);
        return Err(err);
    }
    Ok(())
}

fn shrink(img: &mut Image, id: InodeId, cur: usize, want: usize) {
    if let Some(ind_bn) = img.inode(id).indirect() {
        let mut ind = indirect_copy(img, ind_bn);
        for slot in (want.saturating_sub(1)..cur.saturating_sub(1)).rev() {
            if let Some(bn) = ind.get(slot) {
                img.release_block(bn);
                ind.set(slot, None);
            }
        }
        img.block_mut(ind_bn).copy_from_slice(ind.as_bytes());
        if want <= 1 {
            img.release_block(ind_bn);
            img.inode_mut(id).set_indirect(None);
        }
    }
    if want == 0 {
        if let Some(bn) = img.inode(id).direct() {
            img.release_block(bn);
            img.inode_mut(id).set_direct(None);
        }
    }
}

/// Zeroes the bytes past `len` in the block holding byte `len`.
fn zero_tail(img: &mut Image, id: InodeId, len: usize) {
    let within = len % BLOCK_SIZE;
    if within == 0 {
        return;
    }
    let Some(bn) = nth_block(img, id, len / BLOCK_SIZE) else {
        return;
    };
    img.block_mut(bn)[within..].fill(0);
}

/// Materializes an inode's full content.
pub(crate) fn read_all(img: &Image, id: InodeId) -> ReadData {
    let node = img.inode(id);
    let mode = node.mode;
    let size = node.size;
    let len = usize::try_from(size).unwrap();

    let mut bytes = Vec::with_capacity(len);
    if let Some(bn) = node.direct() {
        bytes.extend_from_slice(&img.read_block(bn, len));
    }
    if len > BLOCK_SIZE {
        if let Some(ind_bn) = node.indirect() {
            for slot in 0..MAX_FILE_BLOCKS - 1 {
                if bytes.len() == len {
                    break;
                }
                let Some(bn) = img
                    .block(ind_bn)
                    .as_data_view()
                    .get::<IndirectBlock>(0)
                    .get(slot)
                else {
                    break;
                };
                bytes.extend_from_slice(&img.read_block(bn, len - bytes.len()));
            }
        }
    }
    ReadData { mode, size, bytes }
}

/// Writes `src` at byte `offset`, growing the inode first when the write
/// reaches past the current size. Returns the number of bytes written.
pub(crate) fn write_at(img: &mut Image, id: InodeId, src: &[u8], offset: u64) -> Result<usize> {
    if src.is_empty() {
        return Ok(0);
    }
    let end = offset
        .checked_add(u64::try_from(src.len()).unwrap())
        .ok_or(Error::FileTooBig)?;
    if end > img.inode(id).size {
        resize(img, id, end)?;
    }

    let blocks = block_list(img, id, img.inode(id).block_count());
    let offset = usize::try_from(offset).map_err(|_| Error::FileTooBig)?;
    let mut cursor = offset / BLOCK_SIZE;
    let mut within = offset % BLOCK_SIZE;
    let mut written = 0;
    while written < src.len() {
        written += img.write_block(blocks[cursor], &src[written..], within);
        within = 0;
        cursor += 1;
    }
    Ok(written)
}
