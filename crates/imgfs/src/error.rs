use std::io;

/// Engine result type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the engine.
///
/// The host shim speaks negative POSIX codes; [`Error::errno`] provides
/// that mapping so errors bubble up without transformation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no such file or directory")]
    NotFound,
    #[error("not a directory")]
    NotADirectory,
    #[error("invalid path or name")]
    InvalidArgument,
    #[error("file exists")]
    AlreadyExists,
    #[error("no free block or inode")]
    NoSpace,
    #[error("file exceeds the indirect block's reach")]
    FileTooBig,
    #[error("corrupt directory blob")]
    CorruptDirectory,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// The negative errno for the host callback convention.
    #[must_use]
    pub fn errno(&self) -> i32 {
        let code = match self {
            Self::NotFound => libc::ENOENT,
            Self::NotADirectory => libc::ENOTDIR,
            Self::InvalidArgument | Self::CorruptDirectory => libc::EINVAL,
            Self::AlreadyExists => libc::EEXIST,
            Self::NoSpace => libc::ENOSPC,
            Self::FileTooBig => libc::EFBIG,
            Self::Io(_) => libc::EIO,
        };
        -code
    }
}
