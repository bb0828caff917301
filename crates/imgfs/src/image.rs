use std::{
    fs::File,
    io::{self, Read as _, Seek as _, SeekFrom, Write as _},
    path::Path,
};

use dataview::PodMethods as _;
use imgfs_types::{BLOCK_SIZE, BlockNo, DISK_SIZE, Header, InodeRecord};
use log::trace;

use crate::{Error, Result, inode::InodeId};

/// The mounted image: one contiguous region read from the image file at
/// mount and written back at flush.
///
/// The region is backed by `u64` words so the [`Header`] overlay at offset
/// 0 is properly aligned for its typed view.
pub(crate) struct Image {
    file: File,
    words: Vec<u64>,
}

impl Image {
    /// Opens (or creates) the image file and loads the region.
    ///
    /// Existing content is preserved: the file is sized with `set_len`,
    /// never truncated to zero, so a re-mount sees the previous contents.
    pub(crate) fn open(path: &Path) -> io::Result<Self> {
        let mut file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.set_len(u64::try_from(DISK_SIZE).unwrap())?;

        let mut words = vec![0_u64; DISK_SIZE / size_of::<u64>()];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(words.as_mut_slice().as_bytes_mut())?;
        Ok(Self { file, words })
    }

    /// Writes the whole region back to the image file.
    pub(crate) fn flush(&mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(self.words.as_slice().as_bytes())?;
        self.file.sync_data()
    }

    fn bytes(&self) -> &[u8] {
        self.words.as_slice().as_bytes()
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        self.words.as_mut_slice().as_bytes_mut()
    }

    pub(crate) fn header(&self) -> &Header {
        self.bytes().as_data_view().get(0)
    }

    pub(crate) fn header_mut(&mut self) -> &mut Header {
        self.bytes_mut().as_data_view_mut().get_mut(0)
    }

    pub(crate) fn inode(&self, id: InodeId) -> &InodeRecord {
        match id {
            InodeId::Root => &self.header().root,
            InodeId::Node(ino) => self.header().inode(ino),
        }
    }

    pub(crate) fn inode_mut(&mut self, id: InodeId) -> &mut InodeRecord {
        match id {
            InodeId::Root => &mut self.header_mut().root,
            InodeId::Node(ino) => self.header_mut().inode_mut(ino),
        }
    }

    /// Bounded view of one block's payload.
    pub(crate) fn block(&self, bn: BlockNo) -> &[u8; BLOCK_SIZE] {
        self.bytes().as_data_view().get(bn.as_index() * BLOCK_SIZE)
    }

    /// Mutable bounded view of one block's payload.
    pub(crate) fn block_mut(&mut self, bn: BlockNo) -> &mut [u8; BLOCK_SIZE] {
        self.bytes_mut()
            .as_data_view_mut()
            .get_mut(bn.as_index() * BLOCK_SIZE)
    }

    /// Copies out up to `len` bytes of a block, clamped to the block size.
    pub(crate) fn read_block(&self, bn: BlockNo, len: usize) -> Vec<u8> {
        let len = usize::min(len, BLOCK_SIZE);
        self.block(bn)[..len].to_vec()
    }

    /// Copies `src` into a block starting at `off`, clamped to the block
    /// end. Returns the number of bytes written.
    pub(crate) fn write_block(&mut self, bn: BlockNo, src: &[u8], off: usize) -> usize {
        assert!(off < BLOCK_SIZE);
        let len = usize::min(src.len(), BLOCK_SIZE - off);
        self.block_mut(bn)[off..off + len].copy_from_slice(&src[..len]);
        len
    }

    /// Takes the lowest free block and zeroes its payload so readers see
    /// zeros. Blocks inside the reserved header region are left as-is.
    pub(crate) fn take_block(&mut self) -> Result<BlockNo> {
        let Some(n) = self.header().block_bitmap.first_clear() else {
            return Err(Error::NoSpace);
        };
        self.header_mut().block_bitmap.set_bit(n);
        let bn = BlockNo::new(u32::try_from(n).unwrap());
        if n >= self.data_start() {
            self.block_mut(bn).fill(0);
        }
        trace!("take block {bn}");
        Ok(bn)
    }

    /// Clears a block's allocation bit. Releases at or below the root
    /// directory's block (the whole reserved region) are ignored.
    pub(crate) fn release_block(&mut self, bn: BlockNo) {
        if bn.as_index() <= self.data_start() {
            return;
        }
        trace!("release block {bn}");
        self.header_mut().block_bitmap.clear_bit(bn.as_index());
    }

    /// Index of the first block available for file data.
    pub(crate) fn data_start(&self) -> usize {
        usize::try_from(self.header().data_start).unwrap()
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}
