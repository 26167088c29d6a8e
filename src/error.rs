//! Error kinds shared by every layer of the filesystem.
//!
//! Nothing is retried internally: an append that failed halfway must not be
//! replayed, so every error goes straight back to the caller of the
//! operation that produced it. `CorruptLog` and `BadMagic` raised while
//! mounting are fatal and the volume is not opened.

use std::io;

pub type LfsResult<T> = Result<T, LfsError>;

#[derive(Debug, onlyerror::Error)]
pub enum LfsError {
    /// Path or component does not resolve to a live record.
    #[error("no such file or directory")]
    NotFound,
    /// The parent of a create does not resolve to a directory.
    #[error("parent directory does not exist")]
    NoSuchParent,
    #[error("file exists")]
    AlreadyExists,
    #[error("not a directory")]
    NotADirectory,
    #[error("not a regular file")]
    NotAFile,
    #[error("directory not empty")]
    NotEmpty,
    /// Negative offset, or a read offset past the end of the file.
    #[error("invalid offset {0}")]
    InvalidOffset(i64),
    #[error("invalid file name {0:?}")]
    InvalidName(String),
    #[error("file name longer than {max} bytes: {name:?}")]
    NameTooLong { name: String, max: usize },
    /// The log cannot grow within the capacity of the backing device.
    #[error("no space left on device (need {needed} bytes, {available} available)")]
    NoSpace { needed: u64, available: u64 },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt log at offset {offset}: {detail}")]
    CorruptLog { offset: u64, detail: String },
    #[error("bad superblock magic {found:#010x}")]
    BadMagic { found: u32 },
}

impl LfsError {
    pub(crate) fn corrupt(offset: u64, detail: impl Into<String>) -> Self {
        LfsError::CorruptLog {
            offset,
            detail: detail.into(),
        }
    }

    /// POSIX errno for the call layer. Exhaustive so a new variant cannot
    /// slip through without an errno.
    #[cfg(feature = "fuse")]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            LfsError::NotFound | LfsError::NoSuchParent => libc::ENOENT,
            LfsError::AlreadyExists => libc::EEXIST,
            LfsError::NotADirectory => libc::ENOTDIR,
            LfsError::NotAFile => libc::EISDIR,
            LfsError::NotEmpty => libc::ENOTEMPTY,
            LfsError::InvalidOffset(_) => libc::EINVAL,
            LfsError::InvalidName(_) => libc::EINVAL,
            LfsError::NameTooLong { .. } => libc::ENAMETOOLONG,
            LfsError::NoSpace { .. } => libc::ENOSPC,
            LfsError::Io(_) => libc::EIO,
            LfsError::CorruptLog { .. } => libc::EIO,
            LfsError::BadMagic { .. } => libc::EINVAL,
        }
    }
}
