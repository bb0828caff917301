//! Storage engine for a single-image, user-space filesystem.
//!
//! Four layers, each a pure consumer of the one below:
//!
//!   + Image: one fixed-size byte region split into blocks, with a
//!     free-block bitmap and a typed header overlay.
//!   + Inodes: a fixed table of records plus an allocation bitmap;
//!     block expansion and shrinkage under one direct and one indirect
//!     pointer per inode.
//!   + Directories: `name -> inode` mappings serialized into a byte blob
//!     stored as the directory inode's content.
//!   + Names: path resolution and the operations a host shim calls.
//!
//! The host-facing surface is [`Filesystem`]; everything it returns is
//! plain owned data, and every error maps onto a negative POSIX code via
//! [`Error::errno`].

pub use self::{
    dir::Directory,
    error::{Error, Result},
    fs::Filesystem,
    inode::{InodeId, ReadData},
    stat::{DirEntry, Stat},
};

mod dir;
mod error;
mod fs;
mod image;
mod inode;
mod path;
mod stat;
