use imgfs_types::TimeSpec;

/// Attribute snapshot handed to the host shim.
///
/// `blocks` counts occupied content blocks (`⌈size / BLOCK_SIZE⌉`); the
/// root directory reports `ino` 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub ino: u32,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u32,
    pub blocks: u64,
    pub atim: TimeSpec,
    pub mtim: TimeSpec,
    pub ctim: TimeSpec,
}

/// One row of a directory listing.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub stat: Stat,
}
