use std::path::Path;

use imgfs_types::{BLOCK_SIZE, DATA_START_BLOCK, FileMode, TimeSpec};
use log::debug;

use crate::{
    Error, Result,
    dir::Directory,
    image::Image,
    inode::{self, InodeId, ReadData},
    path,
    stat::{DirEntry, Stat},
};

/// Mode given to `/` at initialization.
const ROOT_DIR_MODE: u32 = FileMode::DIR
    .union(FileMode::OWNER_ALL)
    .union(FileMode::GROUP_ALL)
    .union(FileMode::OTHER_READ)
    .union(FileMode::OTHER_EXEC)
    .bits();

/// Mode for files the write path creates implicitly.
const IMPLICIT_FILE_MODE: u32 = FileMode::REG.bits() | 0o644;

/// Root content below this marks an image that was never initialized.
const MIN_ROOT_SIZE: u64 = Directory::MIN_SIZE_ON_DISK as u64;

/// A mounted image and the operations the host shim calls on it.
///
/// One value per mount; operations are synchronous and run to completion
/// against the in-memory region. There is no global state.
pub struct Filesystem {
    image: Image,
}

impl Filesystem {
    /// Opens the image at `path`, initializing it on first mount.
    ///
    /// An image whose root inode holds less than one minimum serialized
    /// directory is considered fresh; anything else is re-mounted as-is.
    pub fn mount<P: AsRef<Path>>(path: P) -> Result<Self> {
        let image = Image::open(path.as_ref())?;
        let mut fs = Self { image };
        if fs.image.header().root.size < MIN_ROOT_SIZE {
            fs.init()?;
        }
        Ok(fs)
    }

    /// Persists the region to the image file.
    pub fn flush(&mut self) -> Result<()> {
        self.image.flush()?;
        Ok(())
    }

    /// Lays out a fresh image: reserve the header region, then give the
    /// root its defaults, its first data block and an empty directory.
    fn init(&mut self) -> Result<()> {
        debug!("initializing fresh image");
        self.image.header_mut().data_start = u32::try_from(DATA_START_BLOCK).unwrap();
        for _ in 0..DATA_START_BLOCK {
            self.image.take_block()?;
        }

        inode::set_defaults(&mut self.image, InodeId::Root, ROOT_DIR_MODE);
        let bn = self.image.take_block()?;
        self.image.inode_mut(InodeId::Root).set_direct(Some(bn));

        let root_entry = InodeId::Root.to_entry();
        self.store_dir(InodeId::Root, &Directory::new(root_entry, root_entry))
    }

    fn load_dir(&self, id: InodeId) -> Result<Directory> {
        let data = inode::read_all(&self.image, id);
        Directory::deserialize(&data.bytes)
    }

    /// Rewrites a directory inode's content to exactly the serialized
    /// blob; shrink-to-fit keeps removed entries from resurfacing.
    fn store_dir(&mut self, id: InodeId, dir: &Directory) -> Result<()> {
        let bytes = dir.serialize();
        inode::resize(&mut self.image, id, u64::try_from(bytes.len()).unwrap())?;
        inode::write_at(&mut self.image, id, &bytes, 0)?;
        Ok(())
    }

    fn walk(&self, mut cur: InodeId, segments: &[&str]) -> Result<InodeId> {
        for name in segments {
            if !self.image.inode(cur).is_dir() {
                return Err(Error::NotADirectory);
            }
            let id = self.load_dir(cur)?.file_inode(name)?;
            cur = InodeId::from_entry(id)?;
        }
        Ok(cur)
    }

    fn resolve(&self, path: &str) -> Result<InodeId> {
        let segments = path::parse(path)?;
        self.walk(InodeId::Root, &segments)
    }

    /// Resolves a path's parent directory and attempts its final segment.
    fn resolve_pair<'p>(&self, path: &'p str) -> Result<(InodeId, Option<InodeId>, &'p str)> {
        let segments = path::parse(path)?;
        let Some((&leaf, parents)) = segments.split_last() else {
            // the root is nobody's directory entry
            return Err(Error::InvalidArgument);
        };
        let parent = self.walk(InodeId::Root, parents)?;
        if !self.image.inode(parent).is_dir() {
            return Err(Error::NotADirectory);
        }
        let child = match self.load_dir(parent)?.file_inode(leaf) {
            Ok(id) => Some(InodeId::from_entry(id)?),
            Err(Error::NotFound) => None,
            Err(err) => return Err(err),
        };
        Ok((parent, child, leaf))
    }

    fn stat_id(&self, id: InodeId) -> Stat {
        let node = self.image.inode(id);
        Stat {
            ino: match id {
                InodeId::Root => 0,
                InodeId::Node(ino) => ino.value(),
            },
            mode: node.mode,
            nlink: node.nlink,
            uid: node.uid,
            gid: node.gid,
            rdev: node.rdev,
            size: node.size,
            blksize: u32::try_from(BLOCK_SIZE).unwrap(),
            blocks: u64::try_from(node.block_count()).unwrap(),
            atim: node.atim,
            mtim: node.mtim,
            ctim: node.ctim,
        }
    }

    /// Attributes of the object at `path`.
    pub fn stat(&self, path: &str) -> Result<Stat> {
        debug!("stat({path})");
        let id = self.resolve(path)?;
        Ok(self.stat_id(id))
    }

    /// Lists a directory: `"."` synthesized from the directory itself,
    /// then every entry in blob order.
    pub fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        debug!("readdir({path})");
        let id = self.resolve(path)?;
        if !self.image.inode(id).is_dir() {
            return Err(Error::NotADirectory);
        }
        let dir = self.load_dir(id)?;
        let mut out = Vec::with_capacity(dir.num_files() + 1);
        out.push(DirEntry {
            name: ".".to_owned(),
            stat: self.stat_id(id),
        });
        for (name, entry) in dir.entries() {
            let child = InodeId::from_entry(entry)?;
            out.push(DirEntry {
                name: name.to_owned(),
                stat: self.stat_id(child),
            });
        }
        Ok(out)
    }

    /// Allocates an inode for `path`'s leaf and links it into the parent.
    fn create(&mut self, path: &str, mode: u32, rdev: u64) -> Result<(InodeId, InodeId)> {
        let (parent, child, leaf) = self.resolve_pair(path)?;
        if child.is_some() {
            return Err(Error::AlreadyExists);
        }

        let ino = inode::allocate(&mut self.image)?;
        let id = InodeId::Node(ino);
        let res = (|| -> Result<()> {
            let mut dir = self.load_dir(parent)?;
            dir.add_file(leaf, id.to_entry())?;
            self.store_dir(parent, &dir)
        })();
        if let Err(err) = res {
            inode::release(&mut self.image, ino);
            return Err(err);
        }

        inode::set_defaults(&mut self.image, id, mode);
        self.image.inode_mut(id).rdev = rdev;
        Ok((parent, id))
    }

    /// Creates a filesystem object.
    pub fn mknod(&mut self, path: &str, mode: u32, rdev: u64) -> Result<()> {
        debug!("mknod({path}, {mode:o})");
        self.create(path, mode, rdev)?;
        Ok(())
    }

    /// Creates a directory, including its freshly serialized empty blob.
    pub fn mkdir(&mut self, path: &str, mode: u32) -> Result<()> {
        debug!("mkdir({path}, {mode:o})");
        let (parent, id) = self.create(path, mode | FileMode::DIR.bits(), 0)?;
        self.store_dir(id, &Directory::new(id.to_entry(), parent.to_entry()))
    }

    /// Succeeds when the path resolves; no open-file state is kept.
    pub fn open(&self, path: &str) -> Result<()> {
        debug!("open({path})");
        self.resolve(path).map(|_| ())
    }

    /// The full content of `path` along with its mode and size.
    pub fn read_all(&self, path: &str) -> Result<ReadData> {
        let id = self.resolve(path)?;
        Ok(inode::read_all(&self.image, id))
    }

    /// Copies content starting at `offset` into `buf` and returns the
    /// byte count. Short reads happen only at end of file; no terminator
    /// is appended.
    pub fn read(&self, path: &str, buf: &mut [u8], offset: u64) -> Result<usize> {
        debug!("read({path}, {} bytes @{offset})", buf.len());
        let data = self.read_all(path)?;
        let Ok(off) = usize::try_from(offset) else {
            return Ok(0);
        };
        if off >= data.bytes.len() {
            return Ok(0);
        }
        let n = usize::min(buf.len(), data.bytes.len() - off);
        buf[..n].copy_from_slice(&data.bytes[off..off + n]);
        Ok(n)
    }

    /// Writes `buf` at `offset`, creating a regular file when the path
    /// does not resolve. Returns the byte count.
    pub fn write(&mut self, path: &str, buf: &[u8], offset: u64) -> Result<usize> {
        debug!("write({path}, {} bytes @{offset})", buf.len());
        let id = match self.resolve(path) {
            Ok(id) => id,
            Err(Error::NotFound) => self.create(path, IMPLICIT_FILE_MODE, 0)?.1,
            Err(err) => return Err(err),
        };
        let written = inode::write_at(&mut self.image, id, buf, offset)?;
        inode::touch_modified(&mut self.image, id);
        Ok(written)
    }

    /// Sets the content length, freeing or zero-filling as needed.
    pub fn truncate(&mut self, path: &str, size: u64) -> Result<()> {
        debug!("truncate({path}, {size})");
        let id = self.resolve(path)?;
        inode::resize(&mut self.image, id, size)?;
        inode::touch_modified(&mut self.image, id);
        Ok(())
    }

    /// Overwrites the mode; the caller is expected to preserve type bits.
    pub fn chmod(&mut self, path: &str, mode: u32) -> Result<()> {
        debug!("chmod({path}, {mode:o})");
        let id = self.resolve(path)?;
        self.image.inode_mut(id).mode = mode;
        inode::touch_changed(&mut self.image, id);
        Ok(())
    }

    /// Overwrites the access and modification timestamps.
    pub fn utimens(&mut self, path: &str, atim: TimeSpec, mtim: TimeSpec) -> Result<()> {
        debug!("utimens({path})");
        let id = self.resolve(path)?;
        let node = self.image.inode_mut(id);
        node.atim = atim;
        node.mtim = mtim;
        Ok(())
    }

    /// Adds a second directory entry for `from`'s inode at `to`.
    pub fn link(&mut self, from: &str, to: &str) -> Result<()> {
        debug!("link({from} -> {to})");
        let (_, from_child, _) = self.resolve_pair(from)?;
        let target = from_child.ok_or(Error::NotFound)?;
        if self.image.inode(target).is_dir() {
            // directory aliases would let the namespace form cycles
            return Err(Error::InvalidArgument);
        }
        let (to_parent, to_child, to_leaf) = self.resolve_pair(to)?;
        if to_child.is_some() {
            return Err(Error::AlreadyExists);
        }

        let mut dir = self.load_dir(to_parent)?;
        dir.add_file(to_leaf, target.to_entry())?;
        self.store_dir(to_parent, &dir)?;
        self.image.inode_mut(target).nlink += 1;
        inode::touch_changed(&mut self.image, target);
        Ok(())
    }

    /// Drops `leaf` from `parent` and decrements the child's link count,
    /// freeing content and inode when the last link goes.
    fn unlink_entry(&mut self, parent: InodeId, leaf: &str, child: InodeId) -> Result<()> {
        let mut dir = self.load_dir(parent)?;
        dir.remove_file(leaf);
        self.store_dir(parent, &dir)?;

        let remaining = {
            let node = self.image.inode_mut(child);
            node.nlink = node.nlink.saturating_sub(1);
            node.nlink
        };
        if remaining == 0 {
            inode::resize(&mut self.image, child, 0)?;
            if let InodeId::Node(ino) = child {
                inode::release(&mut self.image, ino);
            }
        } else {
            inode::touch_changed(&mut self.image, child);
        }
        Ok(())
    }

    /// Removes a directory entry; a directory target takes its whole
    /// subtree with it.
    pub fn unlink(&mut self, path: &str) -> Result<()> {
        debug!("unlink({path})");
        let (parent, child, leaf) = self.resolve_pair(path)?;
        let child = child.ok_or(Error::NotFound)?;
        if self.image.inode(child).is_dir() {
            return self.remove_tree(parent, leaf, child);
        }
        self.unlink_entry(parent, leaf, child)
    }

    /// Removes a directory and everything beneath it.
    pub fn rmdir(&mut self, path: &str) -> Result<()> {
        debug!("rmdir({path})");
        let (parent, child, leaf) = self.resolve_pair(path)?;
        let child = child.ok_or(Error::NotFound)?;
        if !self.image.inode(child).is_dir() {
            return Err(Error::NotADirectory);
        }
        self.remove_tree(parent, leaf, child)
    }

    /// Tears a directory tree down with an explicit worklist; recursion
    /// depth must not track tree depth.
    fn remove_tree(&mut self, parent: InodeId, leaf: &str, root: InodeId) -> Result<()> {
        // pass 1: walk the tree, unlinking plain files on the way and
        // queueing every directory
        let mut dirs = vec![(parent, leaf.to_owned(), root)];
        let mut next = 0;
        while next < dirs.len() {
            let dir_id = dirs[next].2;
            let listing = self.load_dir(dir_id)?;
            for (name, entry) in listing.entries() {
                let child = InodeId::from_entry(entry)?;
                if self.image.inode(child).is_dir() {
                    dirs.push((dir_id, name.to_owned(), child));
                } else {
                    self.unlink_entry(dir_id, name, child)?;
                }
            }
            next += 1;
        }
        // pass 2: every queued directory is empty now; drop them
        // deepest-first
        for (parent, name, dir_id) in dirs.into_iter().rev() {
            self.unlink_entry(parent, &name, dir_id)?;
        }
        Ok(())
    }

    /// Moves a directory entry between parents; the inode id and link
    /// count are untouched.
    pub fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        debug!("rename({from} -> {to})");
        let (from_parent, from_child, from_leaf) = self.resolve_pair(from)?;
        let moved = from_child.ok_or(Error::NotFound)?;
        let (to_parent, to_child, to_leaf) = self.resolve_pair(to)?;
        if to_child.is_some() {
            return Err(Error::AlreadyExists);
        }
        if self.image.inode(moved).is_dir() {
            self.ensure_not_beneath(to_parent, moved)?;
        }

        // link under the new name first so a failure cannot orphan the
        // inode
        let mut dir = self.load_dir(to_parent)?;
        dir.add_file(to_leaf, moved.to_entry())?;
        self.store_dir(to_parent, &dir)?;

        let mut dir = self.load_dir(from_parent)?;
        dir.remove_file(from_leaf);
        self.store_dir(from_parent, &dir)?;

        if self.image.inode(moved).is_dir() && from_parent != to_parent {
            let mut dir = self.load_dir(moved)?;
            dir.set_parent(to_parent.to_entry());
            self.store_dir(moved, &dir)?;
        }
        inode::touch_changed(&mut self.image, moved);
        Ok(())
    }

    /// Refuses to move a directory underneath itself.
    fn ensure_not_beneath(&self, mut cursor: InodeId, ancestor: InodeId) -> Result<()> {
        loop {
            if cursor == ancestor {
                return Err(Error::InvalidArgument);
            }
            if cursor == InodeId::Root {
                return Ok(());
            }
            cursor = InodeId::from_entry(self.load_dir(cursor)?.parent_id())?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> (tempfile::TempDir, Filesystem) {
        let dir = tempfile::tempdir().unwrap();
        let fs = Filesystem::mount(dir.path().join("test.img")).unwrap();
        (dir, fs)
    }

    #[test]
    fn fresh_mount_has_an_empty_root() {
        let (_dir, fs) = scratch();
        let st = fs.stat("/").unwrap();
        assert!(FileMode::is_dir(st.mode));
        assert_eq!(st.ino, 0);
        assert_eq!(st.nlink, 1);

        let entries = fs.read_dir("/").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, ".");
    }

    #[test]
    fn root_block_is_the_first_data_block() {
        let (_dir, fs) = scratch();
        let root = fs.image.inode(InodeId::Root);
        assert_eq!(root.direct().unwrap().as_index(), DATA_START_BLOCK);
        assert_eq!(fs.image.data_start(), DATA_START_BLOCK);
    }

    #[test]
    fn resolve_reports_the_right_errors() {
        let (_dir, mut fs) = scratch();
        fs.mknod("/f", IMPLICIT_FILE_MODE, 0).unwrap();

        assert!(matches!(fs.stat("/missing"), Err(Error::NotFound)));
        assert!(matches!(fs.stat("/f/x"), Err(Error::NotADirectory)));
        assert!(matches!(fs.read_dir("/f"), Err(Error::NotADirectory)));
        assert!(matches!(fs.stat("relative"), Err(Error::InvalidArgument)));
        assert!(matches!(
            fs.mknod("/", 0o755, 0),
            Err(Error::InvalidArgument)
        ));
        assert!(matches!(
            fs.mknod("/f", IMPLICIT_FILE_MODE, 0),
            Err(Error::AlreadyExists)
        ));
    }

    #[test]
    fn mknod_with_a_digit_name_releases_the_inode() {
        let (_dir, mut fs) = scratch();
        assert!(matches!(
            fs.mknod("/2k.txt", IMPLICIT_FILE_MODE, 0),
            Err(Error::InvalidArgument)
        ));
        assert_eq!(fs.image.header().inode_bitmap.first_clear(), Some(0));
        assert_eq!(fs.read_dir("/").unwrap().len(), 1);
    }

    #[test]
    fn chmod_and_utimens_overwrite_metadata() {
        let (_dir, mut fs) = scratch();
        fs.mknod("/f", IMPLICIT_FILE_MODE, 0).unwrap();
        fs.chmod("/f", FileMode::REG.bits() | 0o600).unwrap();
        assert_eq!(fs.stat("/f").unwrap().mode, FileMode::REG.bits() | 0o600);

        let atim = TimeSpec { sec: 1, nsec: 2 };
        let mtim = TimeSpec { sec: 3, nsec: 4 };
        fs.utimens("/f", atim, mtim).unwrap();
        let st = fs.stat("/f").unwrap();
        assert_eq!(st.atim, atim);
        assert_eq!(st.mtim, mtim);
    }

    #[test]
    fn rename_into_own_subtree_is_refused() {
        let (_dir, mut fs) = scratch();
        fs.mkdir("/a", 0o755).unwrap();
        fs.mkdir("/a/b", 0o755).unwrap();
        assert!(matches!(
            fs.rename("/a", "/a/b/c"),
            Err(Error::InvalidArgument)
        ));
        assert!(fs.stat("/a/b").is_ok());
    }

    #[test]
    fn link_refuses_directories() {
        let (_dir, mut fs) = scratch();
        fs.mkdir("/d", 0o755).unwrap();
        assert!(matches!(
            fs.link("/d", "/alias"),
            Err(Error::InvalidArgument)
        ));
    }
}
