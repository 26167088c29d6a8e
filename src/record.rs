//! On-disk layout of log records and directory entries.
//!
//! A record is a fixed 64-byte header followed by exactly `size` payload
//! bytes. Regular files carry their content as payload, directories carry a
//! packed array of 40-byte dentries. All integers are little-endian.

use std::time::{SystemTime, UNIX_EPOCH};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{LfsError, LfsResult};

/// Stable identity of a file or directory across all of its versions.
pub type Ino = u64;

/// Identity of the root directory.
pub const ROOT_INO: Ino = 0;

pub const RECORD_HEADER_SIZE: usize = 64;
pub const DENTRY_SIZE: usize = 40;
/// Bytes reserved for a name inside a dentry, NUL terminator included.
pub const MAX_FILE_NAME_LEN: usize = 32;
/// Longest name that still leaves room for the terminator.
pub const MAX_NAME_LEN: usize = MAX_FILE_NAME_LEN - 1;

bitflags! {
    /// POSIX type and permission bits stored in `mode`.
    pub struct FileMode: u32 {
        const S_IFMT = 0o170000;
        const S_IFDIR = 0o040000;
        const S_IFREG = 0o100000;

        const S_ISUID = 0o4000;
        const S_ISGID = 0o2000;
        const S_ISVTX = 0o1000;

        const S_IRUSR = 0o400;
        const S_IWUSR = 0o200;
        const S_IXUSR = 0o100;
        const S_IRGRP = 0o040;
        const S_IWGRP = 0o020;
        const S_IXGRP = 0o010;
        const S_IROTH = 0o004;
        const S_IWOTH = 0o002;
        const S_IXOTH = 0o001;

        const PERMISSIONS = 0o7777;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    File,
    Directory,
}

impl FileKind {
    pub fn type_bits(self) -> FileMode {
        match self {
            FileKind::File => FileMode::S_IFREG,
            FileKind::Directory => FileMode::S_IFDIR,
        }
    }

    /// Kind encoded in the type bits of `mode`. Anything that is not a
    /// directory is treated as a regular file.
    pub fn from_mode(mode: u32) -> Self {
        let bits = FileMode::from_bits_truncate(mode) & FileMode::S_IFMT;
        if bits == FileMode::S_IFDIR {
            FileKind::Directory
        } else {
            FileKind::File
        }
    }

    /// Link count of a freshly created object of this kind.
    pub fn initial_links(self) -> u32 {
        match self {
            FileKind::File => 1,
            FileKind::Directory => 2,
        }
    }
}

/// Owner recorded on newly created records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

/// Seconds since the epoch, the resolution the log stores.
pub fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordHeader {
    pub inode_number: Ino,
    pub mode: u32,
    pub links: u32,
    pub uid: u32,
    pub gid: u32,
    pub deleted: bool,
    /// Payload length in bytes, header excluded.
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

impl RecordHeader {
    /// Header of a brand-new, empty object.
    pub fn new(ino: Ino, kind: FileKind, perm: u32, owner: Owner, time: i64) -> Self {
        let mode = kind.type_bits() | (FileMode::from_bits_truncate(perm) & FileMode::PERMISSIONS);
        Self {
            inode_number: ino,
            mode: mode.bits(),
            links: kind.initial_links(),
            uid: owner.uid,
            gid: owner.gid,
            deleted: false,
            size: 0,
            atime: time,
            mtime: time,
            ctime: time,
        }
    }

    pub fn kind(&self) -> FileKind {
        FileKind::from_mode(self.mode)
    }

    pub fn is_dir(&self) -> bool {
        self.kind() == FileKind::Directory
    }

    pub fn perm(&self) -> u32 {
        self.mode & FileMode::PERMISSIONS.bits()
    }

    /// Size of the whole record in the log.
    pub fn record_len(&self) -> u64 {
        RECORD_HEADER_SIZE as u64 + self.size
    }

    /// Tombstone version of this identity.
    pub fn tombstone(&self, time: i64) -> Self {
        Self {
            deleted: true,
            size: 0,
            links: 0,
            ctime: time,
            ..*self
        }
    }

    pub fn encode(&self) -> [u8; RECORD_HEADER_SIZE] {
        let mut buf = [0u8; RECORD_HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.inode_number.to_le_bytes());
        buf[8..12].copy_from_slice(&self.mode.to_le_bytes());
        buf[12..16].copy_from_slice(&self.links.to_le_bytes());
        buf[16..20].copy_from_slice(&self.uid.to_le_bytes());
        buf[20..24].copy_from_slice(&self.gid.to_le_bytes());
        buf[24..28].copy_from_slice(&(self.deleted as u32).to_le_bytes());
        // 28..32 reserved
        buf[32..40].copy_from_slice(&self.size.to_le_bytes());
        buf[40..48].copy_from_slice(&self.atime.to_le_bytes());
        buf[48..56].copy_from_slice(&self.mtime.to_le_bytes());
        buf[56..64].copy_from_slice(&self.ctime.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; RECORD_HEADER_SIZE]) -> Self {
        Self {
            inode_number: u64!(buf[0..8]),
            mode: u32!(buf[8..12]),
            links: u32!(buf[12..16]),
            uid: u32!(buf[16..20]),
            gid: u32!(buf[20..24]),
            deleted: u32!(buf[24..28]) != 0,
            size: u64!(buf[32..40]),
            atime: i64!(buf[40..48]),
            mtime: i64!(buf[48..56]),
            ctime: i64!(buf[56..64]),
        }
    }
}

/// One `(name, identity)` pair inside a directory payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dentry {
    pub name: String,
    pub inode_number: Ino,
}

impl Dentry {
    pub fn new(name: &str, ino: Ino) -> LfsResult<Self> {
        validate_name(name)?;
        Ok(Self {
            name: name.to_string(),
            inode_number: ino,
        })
    }

    pub fn encode(&self) -> [u8; DENTRY_SIZE] {
        let mut buf = [0u8; DENTRY_SIZE];
        let name = self.name.as_bytes();
        buf[..name.len()].copy_from_slice(name);
        buf[MAX_FILE_NAME_LEN..].copy_from_slice(&self.inode_number.to_le_bytes());
        buf
    }

    /// `offset` is where the dentry sits in the log, for error reports.
    pub fn decode(buf: &[u8; DENTRY_SIZE], offset: u64) -> LfsResult<Self> {
        let raw = &buf[..MAX_FILE_NAME_LEN];
        let len = raw
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| LfsError::corrupt(offset, "dentry name is not NUL-terminated"))?;
        let name = core::str::from_utf8(&raw[..len])
            .map_err(|_| LfsError::corrupt(offset, "dentry name is not UTF-8"))?;
        if name.is_empty() {
            return Err(LfsError::corrupt(offset, "dentry name is empty"));
        }
        Ok(Self {
            name: name.to_string(),
            inode_number: u64!(buf[MAX_FILE_NAME_LEN..DENTRY_SIZE]),
        })
    }
}

/// Reject names that cannot be stored in a dentry or would confuse path
/// resolution.
pub fn validate_name(name: &str) -> LfsResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0']) {
        return Err(LfsError::InvalidName(name.to_string()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(LfsError::NameTooLong {
            name: name.to_string(),
            max: MAX_NAME_LEN,
        });
    }
    Ok(())
}

pub fn pack_dentries(entries: &[Dentry]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(entries.len() * DENTRY_SIZE);
    for entry in entries {
        payload.extend_from_slice(&entry.encode());
    }
    payload
}

/// Decode a directory payload that starts at log offset `base`.
pub fn unpack_dentries(payload: &[u8], base: u64) -> LfsResult<Vec<Dentry>> {
    if payload.len() % DENTRY_SIZE != 0 {
        return Err(LfsError::corrupt(
            base,
            format!(
                "directory payload of {} bytes is not a whole number of dentries",
                payload.len()
            ),
        ));
    }
    payload
        .chunks_exact(DENTRY_SIZE)
        .enumerate()
        .map(|(i, chunk)| {
            let mut buf = [0u8; DENTRY_SIZE];
            buf.copy_from_slice(chunk);
            Dentry::decode(&buf, base + (i * DENTRY_SIZE) as u64)
        })
        .collect()
}

/// A header together with its payload, ready to be appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub header: RecordHeader,
    pub payload: Vec<u8>,
}

impl Record {
    /// Build a record, fixing `size` to the payload length.
    pub fn new(mut header: RecordHeader, payload: Vec<u8>) -> Self {
        header.size = payload.len() as u64;
        Self { header, payload }
    }

    pub fn directory(header: RecordHeader, entries: &[Dentry]) -> Self {
        Self::new(header, pack_dentries(entries))
    }

    pub fn encoded_len(&self) -> u64 {
        self.header.record_len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len() as usize);
        buf.extend_from_slice(&self.header.encode());
        buf.extend_from_slice(&self.payload);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> Owner {
        Owner { uid: 1000, gid: 100 }
    }

    #[test]
    fn header_layout_is_fixed() {
        let mut header = RecordHeader::new(7, FileKind::File, 0o644, owner(), 1_700_000_000);
        header.size = 5;
        let buf = header.encode();
        assert_eq!(&buf[0..8], &7u64.to_le_bytes());
        assert_eq!(u32::from_le_bytes(buf[8..12].try_into().unwrap()), 0o100644);
        assert_eq!(&buf[32..40], &5u64.to_le_bytes());
        assert_eq!(RecordHeader::decode(&buf), header);
    }

    #[test]
    fn kinds_and_link_counts() {
        let dir = RecordHeader::new(1, FileKind::Directory, 0o755, owner(), 0);
        assert!(dir.is_dir());
        assert_eq!(dir.links, 2);
        assert_eq!(dir.perm(), 0o755);

        let file = RecordHeader::new(2, FileKind::File, 0o100600, owner(), 0);
        assert_eq!(file.kind(), FileKind::File);
        assert_eq!(file.links, 1);
        assert_eq!(file.mode, 0o100600);
    }

    #[test]
    fn tombstone_clears_payload() {
        let mut header = RecordHeader::new(3, FileKind::File, 0o644, owner(), 10);
        header.size = 99;
        let tomb = header.tombstone(20);
        assert!(tomb.deleted);
        assert_eq!(tomb.size, 0);
        assert_eq!(tomb.inode_number, 3);
        assert!(RecordHeader::decode(&tomb.encode()).deleted);
    }

    #[test]
    fn dentry_names_are_bounded() {
        let longest = "x".repeat(MAX_NAME_LEN);
        let entry = Dentry::new(&longest, 9).expect("31-byte name fits");
        let decoded = Dentry::decode(&entry.encode(), 0).expect("decode");
        assert_eq!(decoded, entry);

        let too_long = "x".repeat(MAX_FILE_NAME_LEN);
        assert!(matches!(
            Dentry::new(&too_long, 9),
            Err(LfsError::NameTooLong { .. })
        ));
    }

    #[test]
    fn invalid_names_rejected() {
        for name in ["", ".", "..", "a/b", "nul\0byte"] {
            assert!(
                matches!(validate_name(name), Err(LfsError::InvalidName(_))),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn unterminated_dentry_is_corrupt() {
        let mut buf = [b'a'; DENTRY_SIZE];
        buf[MAX_FILE_NAME_LEN..].copy_from_slice(&1u64.to_le_bytes());
        assert!(matches!(
            Dentry::decode(&buf, 200),
            Err(LfsError::CorruptLog { offset: 200, .. })
        ));
    }

    #[test]
    fn dentry_array_packing() {
        let entries = vec![
            Dentry::new("docs", 1).unwrap(),
            Dentry::new("a.txt", 2).unwrap(),
        ];
        let payload = pack_dentries(&entries);
        assert_eq!(payload.len(), 2 * DENTRY_SIZE);
        assert_eq!(unpack_dentries(&payload, 0).expect("unpack"), entries);

        assert!(matches!(
            unpack_dentries(&payload[..DENTRY_SIZE + 1], 0),
            Err(LfsError::CorruptLog { .. })
        ));
    }

    #[test]
    fn record_size_tracks_payload() {
        let header = RecordHeader::new(4, FileKind::File, 0o644, owner(), 0);
        let record = Record::new(header, b"hello".to_vec());
        assert_eq!(record.header.size, 5);
        assert_eq!(record.encoded_len(), RECORD_HEADER_SIZE as u64 + 5);
        let bytes = record.encode();
        assert_eq!(&bytes[RECORD_HEADER_SIZE..], b"hello");
    }
}
