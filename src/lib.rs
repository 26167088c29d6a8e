//! Log-structured filesystem kept in a single disk image.
//!
//! All metadata and file content live in one append-only log behind a small
//! superblock. Changing a file or directory appends a new version of its
//! record; the newest version of an identity is the live one.

macro_rules! u32 {
    ($x:expr) => {
        u32::from_le_bytes($x.try_into().unwrap())
    };
}

macro_rules! u64 {
    ($x:expr) => {
        u64::from_le_bytes($x.try_into().unwrap())
    };
}

macro_rules! i64 {
    ($x:expr) => {
        i64::from_le_bytes($x.try_into().unwrap())
    };
}

pub mod cursor;
pub mod device;
pub mod error;
pub mod record;
pub mod resolver;
pub mod store;
pub mod volume;

#[cfg(feature = "fuse")]
pub mod fuse;


pub use device::{BlockDevice, MemDevice, MmapDevice};
pub use error::{LfsError, LfsResult};
pub use record::{FileKind, Ino, Owner, ROOT_INO};
pub use volume::{Attr, FormatOptions, Volume};

#[cfg(feature = "cap16m")]
pub const DEFAULT_CAPACITY: u64 = 16 * 1024 * 1024;

#[cfg(all(feature = "cap4m", not(feature = "cap16m")))]
pub const DEFAULT_CAPACITY: u64 = 4 * 1024 * 1024;

#[cfg(not(any(feature = "cap4m", feature = "cap16m")))]
pub const DEFAULT_CAPACITY: u64 = 1024 * 1024;
