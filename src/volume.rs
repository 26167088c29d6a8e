//! Copy-on-write mutations over the log.
//!
//! Every change that alters a record's shape appends a new version of that
//! record at the tail; the old version stays where it is. Only content and
//! timestamp updates that fit entirely inside a record's committed payload
//! are written in place.

use std::collections::BTreeMap;

use log::{debug, info, warn};
use serde::Serialize;

use crate::{
    cursor::LogEntry,
    device::BlockDevice,
    error::{LfsError, LfsResult},
    record::{
        now, validate_name, Dentry, FileKind, FileMode, Ino, Owner, Record, RecordHeader,
        MAX_NAME_LEN, RECORD_HEADER_SIZE, ROOT_INO,
    },
    resolver,
    store::{LogStore, Superblock},
};

pub struct FormatOptions {
    /// Permission bits of the root directory.
    pub root_perm: u32,
    pub owner: Owner,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            root_perm: 0o755,
            owner: Owner::default(),
        }
    }
}

/// Attributes of the current version of a file or directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Attr {
    pub ino: Ino,
    pub kind: FileKind,
    pub perm: u32,
    pub links: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

impl From<&RecordHeader> for Attr {
    fn from(header: &RecordHeader) -> Self {
        Self {
            ino: header.inode_number,
            kind: header.kind(),
            perm: header.perm(),
            links: header.links,
            uid: header.uid,
            gid: header.gid,
            size: header.size,
            atime: header.atime,
            mtime: header.mtime,
            ctime: header.ctime,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntry {
    pub name: String,
    pub ino: Ino,
    pub kind: FileKind,
}

/// Which kinds of object a removal accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveKind {
    File,
    Directory,
    Any,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SetAttr {
    pub perm: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<i64>,
    pub mtime: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FsStats {
    pub capacity: u64,
    pub used: u64,
    pub free: u64,
    pub records: u64,
    pub live_files: u64,
    pub max_name_len: usize,
}

/// One record as seen by `dump`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DumpEntry {
    pub offset: u64,
    pub header: RecordHeader,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<Dentry>>,
}

/// A mounted log-structured volume.
pub struct Volume<D: BlockDevice> {
    store: LogStore<D>,
}

impl<D: BlockDevice> Volume<D> {
    /// Lay down a fresh superblock and an empty root directory.
    pub fn format(device: D, options: &FormatOptions) -> LfsResult<Self> {
        let mut store = LogStore::format(device)?;
        let root = RecordHeader::new(
            ROOT_INO,
            FileKind::Directory,
            options.root_perm,
            options.owner,
            now(),
        );
        store.append_records(&[Record::new(root, Vec::new())])?;
        store.sync()?;
        info!(
            "formatted volume: capacity {} bytes, head {}",
            store.capacity(),
            store.head()
        );
        Ok(Self { store })
    }

    /// Open a formatted device. The whole log is checked first; a volume
    /// with any corrupt record is refused.
    pub fn mount(device: D) -> LfsResult<Self> {
        let volume = Self {
            store: LogStore::open(device)?,
        };
        let records = volume.verify()?;
        let root = resolver::current_version(&volume.store, ROOT_INO).map_err(|_| {
            LfsError::corrupt(volume.store.head(), "no live root directory in the log")
        })?;
        if !root.header.is_dir() {
            return Err(LfsError::corrupt(root.offset, "root is not a directory"));
        }
        info!(
            "mounted volume: {} records, head {} of {}",
            records,
            volume.store.head(),
            volume.store.capacity()
        );
        Ok(volume)
    }

    /// Flush and hand the device back.
    pub fn unmount(self) -> LfsResult<D> {
        self.store.sync()?;
        info!("unmounted volume at head {}", self.store.head());
        Ok(self.store.into_device())
    }

    pub fn store(&self) -> &LogStore<D> {
        &self.store
    }

    pub fn superblock(&self) -> Superblock {
        self.store.superblock()
    }

    pub fn sync(&self) -> LfsResult<()> {
        self.store.sync()
    }

    /// Decode every header and every directory payload in the log. Returns
    /// the number of records.
    pub fn verify(&self) -> LfsResult<usize> {
        let mut count = 0;
        for entry in self.store.records() {
            let entry = entry?;
            if entry.header.is_dir() && !entry.header.deleted {
                resolver::read_dentries(&self.store, &entry)?;
            }
            count += 1;
        }
        Ok(count)
    }

    /// Every record in log order, with decoded entries for directories.
    pub fn dump(&self) -> LfsResult<Vec<DumpEntry>> {
        self.store
            .records()
            .map(|entry| {
                let entry = entry?;
                let entries = if entry.header.is_dir() && !entry.header.deleted {
                    Some(resolver::read_dentries(&self.store, &entry)?)
                } else {
                    None
                };
                Ok(DumpEntry {
                    offset: entry.offset,
                    header: entry.header,
                    entries,
                })
            })
            .collect()
    }

    pub fn resolve(&self, path: &str) -> LfsResult<LogEntry> {
        resolver::resolve(&self.store, path)
    }

    /// One past the largest identity ever written, tombstones included.
    pub fn next_identity(&self) -> LfsResult<Ino> {
        let mut max = ROOT_INO;
        for entry in self.store.records() {
            max = max.max(entry?.header.inode_number);
        }
        Ok(max + 1)
    }

    /// Fail with `NoSpace` unless a new version carrying `size` payload bytes
    /// fits behind `head`. Checked before the payload is built in memory.
    fn ensure_version_fits(&self, size: u64) -> LfsResult<()> {
        let needed = (RECORD_HEADER_SIZE as u64)
            .checked_add(size)
            .ok_or_else(|| LfsError::NoSpace {
                needed: u64::MAX,
                available: self.store.available(),
            })?;
        self.store.ensure_space(needed)
    }

    // ---- create ------------------------------------------------------------

    /// Create `name` under the directory at `parent_path`.
    pub fn create(
        &mut self,
        parent_path: &str,
        name: &str,
        perm: u32,
        kind: FileKind,
        owner: Owner,
    ) -> LfsResult<Ino> {
        let parent = self.resolve(parent_path).map_err(no_such_parent)?;
        self.create_in(parent, name, perm, kind, owner)
    }

    /// Create `name` under the directory with identity `parent`.
    pub fn create_at(
        &mut self,
        parent: Ino,
        name: &str,
        perm: u32,
        kind: FileKind,
        owner: Owner,
    ) -> LfsResult<Ino> {
        let parent = resolver::current_version(&self.store, parent).map_err(no_such_parent)?;
        self.create_in(parent, name, perm, kind, owner)
    }

    fn create_in(
        &mut self,
        parent: LogEntry,
        name: &str,
        perm: u32,
        kind: FileKind,
        owner: Owner,
    ) -> LfsResult<Ino> {
        if !parent.header.is_dir() {
            return Err(LfsError::NoSuchParent);
        }
        validate_name(name)?;
        let mut entries = resolver::read_dentries(&self.store, &parent)?;
        if entries.iter().any(|d| d.name == name) {
            return Err(LfsError::AlreadyExists);
        }

        let ino = self.next_identity()?;
        let time = now();
        entries.push(Dentry::new(name, ino)?);

        let mut parent_header = parent.header;
        parent_header.mtime = time;
        parent_header.ctime = time;
        if kind == FileKind::Directory {
            parent_header.links += 1;
        }
        let child = RecordHeader::new(ino, kind, perm, owner, time);

        self.store.append_records(&[
            Record::directory(parent_header, &entries),
            Record::new(child, Vec::new()),
        ])?;
        self.store.sync()?;
        debug!(
            "create {:?} ({:?}) as {} under {}",
            name, kind, ino, parent.header.inode_number
        );
        Ok(ino)
    }

    // ---- read / write ------------------------------------------------------

    /// Read up to `len` bytes at `offset`. The result is short only at end
    /// of file.
    pub fn read(&self, path: &str, offset: i64, len: usize) -> LfsResult<Vec<u8>> {
        let entry = self.resolve(path)?;
        self.read_entry(&entry, offset, len)
    }

    pub fn read_at(&self, ino: Ino, offset: i64, len: usize) -> LfsResult<Vec<u8>> {
        let entry = resolver::current_version(&self.store, ino)?;
        self.read_entry(&entry, offset, len)
    }

    fn read_entry(&self, entry: &LogEntry, offset: i64, len: usize) -> LfsResult<Vec<u8>> {
        if entry.header.is_dir() {
            return Err(LfsError::NotAFile);
        }
        if offset < 0 || offset as u64 > entry.header.size {
            return Err(LfsError::InvalidOffset(offset));
        }
        let offset = offset as u64;
        let len = core::cmp::min(len as u64, entry.header.size - offset);
        self.store
            .read(entry.payload_offset() + offset, len as usize)
    }

    /// Write `data` at `offset`, growing the file if needed. Returns
    /// `data.len()`.
    pub fn write(&mut self, path: &str, offset: i64, data: &[u8]) -> LfsResult<usize> {
        let entry = self.resolve(path)?;
        self.write_entry(entry, offset, data)
    }

    pub fn write_at(&mut self, ino: Ino, offset: i64, data: &[u8]) -> LfsResult<usize> {
        let entry = resolver::current_version(&self.store, ino)?;
        self.write_entry(entry, offset, data)
    }

    fn write_entry(&mut self, entry: LogEntry, offset: i64, data: &[u8]) -> LfsResult<usize> {
        if entry.header.is_dir() {
            return Err(LfsError::NotAFile);
        }
        if offset < 0 {
            return Err(LfsError::InvalidOffset(offset));
        }
        if data.is_empty() {
            return Ok(0);
        }
        let start = offset as u64;
        let end = start + data.len() as u64;
        let mut header = entry.header;
        header.mtime = now();

        if end <= header.size {
            // fits in the committed payload
            self.store
                .write_in_place(entry.payload_offset() + start, data)?;
            self.store.write_in_place(entry.offset, &header.encode())?;
            debug!(
                "write {} bytes in place to {} at {}",
                data.len(),
                header.inode_number,
                start
            );
        } else {
            self.ensure_version_fits(end)?;
            let mut payload = resolver::read_payload(&self.store, &entry)?;
            // zero-fills any gap between the old end and `start`
            payload.resize(end as usize, 0);
            payload[start as usize..end as usize].copy_from_slice(data);
            self.store.append_records(&[Record::new(header, payload)])?;
            debug!(
                "write {} bytes to {} at {}, new version of {} bytes",
                data.len(),
                header.inode_number,
                start,
                end
            );
        }
        self.store.sync()?;
        Ok(data.len())
    }

    // ---- remove ------------------------------------------------------------

    /// Remove the file or empty directory at `path`.
    pub fn unlink(&mut self, path: &str) -> LfsResult<()> {
        self.remove(path, RemoveKind::Any)
    }

    pub fn rmdir(&mut self, path: &str) -> LfsResult<()> {
        self.remove(path, RemoveKind::Directory)
    }

    fn remove(&mut self, path: &str, kind: RemoveKind) -> LfsResult<()> {
        let (parent, name) = resolver::split_parent(path)?;
        let parent = resolver::resolve_components(&self.store, &parent)?;
        self.remove_in(parent, name, kind)
    }

    /// Remove `name` from the directory with identity `parent`.
    pub fn remove_at(&mut self, parent: Ino, name: &str, kind: RemoveKind) -> LfsResult<()> {
        let parent = resolver::current_version(&self.store, parent)?;
        self.remove_in(parent, name, kind)
    }

    fn remove_in(&mut self, parent: LogEntry, name: &str, kind: RemoveKind) -> LfsResult<()> {
        let mut entries = resolver::read_dentries(&self.store, &parent)?;
        let pos = entries
            .iter()
            .position(|d| d.name == name)
            .ok_or(LfsError::NotFound)?;
        let target = resolver::current_version(&self.store, entries[pos].inode_number)?;
        let is_dir = target.header.is_dir();
        match kind {
            RemoveKind::File if is_dir => return Err(LfsError::NotAFile),
            RemoveKind::Directory if !is_dir => return Err(LfsError::NotADirectory),
            _ => {}
        }
        if is_dir && !resolver::read_dentries(&self.store, &target)?.is_empty() {
            return Err(LfsError::NotEmpty);
        }

        entries.remove(pos);
        let time = now();
        let mut parent_header = parent.header;
        parent_header.mtime = time;
        parent_header.ctime = time;
        if is_dir {
            parent_header.links = parent_header.links.saturating_sub(1).max(2);
        }
        let tombstone = target.header.tombstone(time);

        self.store.append_records(&[
            Record::directory(parent_header, &entries),
            Record::new(tombstone, Vec::new()),
        ])?;
        self.store.sync()?;
        debug!(
            "removed {:?} ({}) from {}",
            name, target.header.inode_number, parent.header.inode_number
        );
        Ok(())
    }

    // ---- directories and attributes -----------------------------------------

    /// Names in the directory at `path`, `.` and `..` first.
    pub fn readdir(&self, path: &str) -> LfsResult<Vec<String>> {
        let dir = self.resolve(path)?;
        let children = self.live_children(&dir)?;
        let mut names = Vec::with_capacity(children.len() + 2);
        names.push(".".to_string());
        names.push("..".to_string());
        names.extend(children.into_iter().map(|c| c.name));
        Ok(names)
    }

    /// Live children of the directory `ino`, without `.` and `..`.
    pub fn list_at(&self, ino: Ino) -> LfsResult<Vec<DirEntry>> {
        let dir = resolver::current_version(&self.store, ino)?;
        self.live_children(&dir)
    }

    /// Entries of `dir` whose identity still has a live version. Dangling
    /// entries are skipped.
    fn live_children(&self, dir: &LogEntry) -> LfsResult<Vec<DirEntry>> {
        let ino = dir.header.inode_number;
        let mut out = Vec::new();
        for dentry in resolver::read_dentries(&self.store, dir)? {
            match resolver::current_version(&self.store, dentry.inode_number) {
                Ok(child) => out.push(DirEntry {
                    name: dentry.name,
                    ino: dentry.inode_number,
                    kind: child.header.kind(),
                }),
                Err(LfsError::NotFound) => {
                    warn!("skipping dangling entry {:?} in directory {}", dentry.name, ino)
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Identity of the live directory listing `ino`. The root is its own
    /// parent.
    pub fn parent_of(&self, ino: Ino) -> LfsResult<Ino> {
        if ino == ROOT_INO {
            return Ok(ROOT_INO);
        }
        let mut latest: BTreeMap<Ino, LogEntry> = BTreeMap::new();
        for entry in self.store.records() {
            let entry = entry?;
            latest.insert(entry.header.inode_number, entry);
        }
        for dir in latest.values() {
            if dir.header.deleted || !dir.header.is_dir() {
                continue;
            }
            if resolver::read_dentries(&self.store, dir)?
                .iter()
                .any(|d| d.inode_number == ino)
            {
                return Ok(dir.header.inode_number);
            }
        }
        Err(LfsError::NotFound)
    }

    /// Attributes of `name` inside the directory `parent`.
    pub fn lookup_at(&self, parent: Ino, name: &str) -> LfsResult<Attr> {
        let dir = resolver::current_version(&self.store, parent)?;
        let entry = resolver::lookup(&self.store, &dir, name)?;
        Ok(Attr::from(&entry.header))
    }

    pub fn stat(&self, path: &str) -> LfsResult<Attr> {
        Ok(Attr::from(&self.resolve(path)?.header))
    }

    pub fn stat_ino(&self, ino: Ino) -> LfsResult<Attr> {
        Ok(Attr::from(
            &resolver::current_version(&self.store, ino)?.header,
        ))
    }

    /// Apply attribute changes. Timestamp-only changes are written in place;
    /// anything else appends a new version.
    pub fn setattr(&mut self, ino: Ino, changes: &SetAttr) -> LfsResult<Attr> {
        let entry = resolver::current_version(&self.store, ino)?;
        let mut header = entry.header;
        let mut payload = None;
        let time = now();

        if let Some(perm) = changes.perm {
            let perm = FileMode::from_bits_truncate(perm) & FileMode::PERMISSIONS;
            header.mode = header.kind().type_bits().bits() | perm.bits();
        }
        if let Some(uid) = changes.uid {
            header.uid = uid;
        }
        if let Some(gid) = changes.gid {
            header.gid = gid;
        }
        if let Some(size) = changes.size {
            if header.is_dir() {
                return Err(LfsError::NotAFile);
            }
            if size != header.size {
                self.ensure_version_fits(size)?;
                let mut content = resolver::read_payload(&self.store, &entry)?;
                content.resize(size as usize, 0);
                payload = Some(content);
                header.mtime = time;
            }
        }
        if let Some(atime) = changes.atime {
            header.atime = atime;
        }
        if let Some(mtime) = changes.mtime {
            header.mtime = mtime;
        }

        let reshaped = payload.is_some()
            || header.mode != entry.header.mode
            || header.uid != entry.header.uid
            || header.gid != entry.header.gid;
        if reshaped {
            header.ctime = time;
            let payload = match payload {
                Some(payload) => payload,
                None => resolver::read_payload(&self.store, &entry)?,
            };
            self.store.append_records(&[Record::new(header, payload)])?;
        } else if header != entry.header {
            self.store.write_in_place(entry.offset, &header.encode())?;
        } else {
            return Ok(Attr::from(&header));
        }
        self.store.sync()?;
        debug!("setattr {} -> {:?}", ino, changes);
        Ok(Attr::from(&header))
    }

    pub fn statfs(&self) -> LfsResult<FsStats> {
        let mut latest: BTreeMap<Ino, bool> = BTreeMap::new();
        let mut records = 0;
        for entry in self.store.records() {
            let entry = entry?;
            latest.insert(entry.header.inode_number, entry.header.deleted);
            records += 1;
        }
        Ok(FsStats {
            capacity: self.store.capacity(),
            used: self.store.head(),
            free: self.store.available(),
            records,
            live_files: latest.values().filter(|deleted| !**deleted).count() as u64,
            max_name_len: MAX_NAME_LEN,
        })
    }
}

fn no_such_parent(err: LfsError) -> LfsError {
    match err {
        LfsError::NotFound => LfsError::NoSuchParent,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use crate::store::SUPERBLOCK_SIZE;

    const OWNER: Owner = Owner { uid: 1000, gid: 1000 };

    fn fresh(capacity: usize) -> Volume<MemDevice> {
        Volume::format(MemDevice::new(capacity), &FormatOptions::default()).expect("format")
    }

    #[test]
    fn format_writes_root_only() {
        let volume = fresh(4096);
        assert_eq!(
            volume.store().head(),
            SUPERBLOCK_SIZE + RECORD_HEADER_SIZE as u64
        );
        let root = volume.stat("/").expect("root");
        assert_eq!(root.ino, ROOT_INO);
        assert_eq!(root.kind, FileKind::Directory);
        assert_eq!(root.perm, 0o755);
        assert_eq!(root.size, 0);
        assert_eq!(volume.next_identity().unwrap(), 1);
    }

    #[test]
    fn create_appends_parent_then_child() {
        let mut volume = fresh(4096);
        let before = volume.store().head();
        let ino = volume
            .create("/", "notes", 0o644, FileKind::File, OWNER)
            .expect("create");
        assert_eq!(ino, 1);

        let dentry_bytes = crate::record::DENTRY_SIZE as u64;
        let expected = 2 * RECORD_HEADER_SIZE as u64 + dentry_bytes;
        assert_eq!(volume.store().head(), before + expected);

        let attr = volume.stat("/notes").expect("stat");
        assert_eq!(attr.links, 1);
        assert_eq!(attr.uid, 1000);
        assert_eq!(attr.size, 0);
    }

    #[test]
    fn create_rejects_bad_parents_and_names() {
        let mut volume = fresh(4096);
        volume
            .create("/", "file", 0o644, FileKind::File, OWNER)
            .unwrap();
        assert!(matches!(
            volume.create("/missing", "x", 0o644, FileKind::File, OWNER),
            Err(LfsError::NoSuchParent)
        ));
        assert!(matches!(
            volume.create("/file", "x", 0o644, FileKind::File, OWNER),
            Err(LfsError::NoSuchParent)
        ));
        assert!(matches!(
            volume.create("/", "a/b", 0o644, FileKind::File, OWNER),
            Err(LfsError::InvalidName(_))
        ));
        let long = "n".repeat(MAX_NAME_LEN + 1);
        assert!(matches!(
            volume.create("/", &long, 0o644, FileKind::File, OWNER),
            Err(LfsError::NameTooLong { .. })
        ));
    }

    #[test]
    fn subdirectories_bump_parent_links() {
        let mut volume = fresh(4096);
        volume
            .create("/", "d", 0o755, FileKind::Directory, OWNER)
            .unwrap();
        assert_eq!(volume.stat("/").unwrap().links, 3);
        assert_eq!(volume.stat("/d").unwrap().links, 2);
        volume.rmdir("/d").expect("rmdir");
        assert_eq!(volume.stat("/").unwrap().links, 2);
    }

    #[test]
    fn overwrite_inside_payload_is_in_place() {
        let mut volume = fresh(4096);
        volume
            .create("/", "f", 0o644, FileKind::File, OWNER)
            .unwrap();
        volume.write("/f", 0, b"hello world").unwrap();
        let head = volume.store().head();

        assert_eq!(volume.write("/f", 6, b"WORLD").unwrap(), 5);
        assert_eq!(volume.store().head(), head, "no new version appended");
        assert_eq!(volume.read("/f", 0, 64).unwrap(), b"hello WORLD");
    }

    #[test]
    fn growth_appends_new_version_and_zero_fills() {
        let mut volume = fresh(4096);
        let ino = volume
            .create("/", "f", 0o644, FileKind::File, OWNER)
            .unwrap();
        volume.write_at(ino, 0, b"abc").unwrap();
        let head = volume.store().head();

        volume.write_at(ino, 5, b"xy").unwrap();
        assert_eq!(volume.store().head(), head + RECORD_HEADER_SIZE as u64 + 7);
        assert_eq!(volume.read_at(ino, 0, 16).unwrap(), b"abc\0\0xy");
        assert_eq!(volume.stat_ino(ino).unwrap().size, 7);
    }

    #[test]
    fn read_offsets() {
        let mut volume = fresh(4096);
        let ino = volume
            .create("/", "f", 0o644, FileKind::File, OWNER)
            .unwrap();
        volume.write_at(ino, 0, b"12345").unwrap();
        assert_eq!(volume.read_at(ino, 3, 10).unwrap(), b"45");
        assert!(volume.read_at(ino, 5, 10).unwrap().is_empty());
        assert!(matches!(
            volume.read_at(ino, 6, 1),
            Err(LfsError::InvalidOffset(6))
        ));
        assert!(matches!(
            volume.read_at(ino, -1, 1),
            Err(LfsError::InvalidOffset(-1))
        ));
        assert!(matches!(
            volume.write_at(ino, -3, b"x"),
            Err(LfsError::InvalidOffset(-3))
        ));
    }

    #[test]
    fn file_operations_on_directories_fail() {
        let mut volume = fresh(4096);
        assert!(matches!(volume.read("/", 0, 1), Err(LfsError::NotAFile)));
        assert!(matches!(volume.write("/", 0, b"x"), Err(LfsError::NotAFile)));
        volume
            .create("/", "f", 0o644, FileKind::File, OWNER)
            .unwrap();
        assert!(matches!(volume.readdir("/f"), Err(LfsError::NotADirectory)));
    }

    #[test]
    fn remove_kinds_are_enforced() {
        let mut volume = fresh(4096);
        volume
            .create("/", "d", 0o755, FileKind::Directory, OWNER)
            .unwrap();
        volume
            .create("/d", "f", 0o644, FileKind::File, OWNER)
            .unwrap();

        assert!(matches!(volume.unlink("/d"), Err(LfsError::NotEmpty)));
        assert!(matches!(volume.rmdir("/d/f"), Err(LfsError::NotADirectory)));
        assert!(matches!(
            volume.remove_at(ROOT_INO, "d", RemoveKind::File),
            Err(LfsError::NotAFile)
        ));
        assert!(matches!(volume.unlink("/d/nope"), Err(LfsError::NotFound)));
        assert!(matches!(volume.unlink("/"), Err(LfsError::InvalidName(_))));

        volume.unlink("/d/f").expect("unlink file");
        volume.unlink("/d").expect("unlink empty dir");
        assert_eq!(volume.readdir("/").unwrap(), vec![".", ".."]);
    }

    #[test]
    fn setattr_truncates_and_extends() {
        let mut volume = fresh(4096);
        let ino = volume
            .create("/", "f", 0o644, FileKind::File, OWNER)
            .unwrap();
        volume.write_at(ino, 0, b"truncate me").unwrap();

        let attr = volume
            .setattr(ino, &SetAttr { size: Some(5), ..Default::default() })
            .expect("shrink");
        assert_eq!(attr.size, 5);
        assert_eq!(volume.read_at(ino, 0, 64).unwrap(), b"trunc");

        volume
            .setattr(ino, &SetAttr { size: Some(7), ..Default::default() })
            .expect("grow");
        assert_eq!(volume.read_at(ino, 0, 64).unwrap(), b"trunc\0\0");

        assert!(matches!(
            volume.setattr(ROOT_INO, &SetAttr { size: Some(0), ..Default::default() }),
            Err(LfsError::NotAFile)
        ));
    }

    #[test]
    fn setattr_mode_keeps_type_bits() {
        let mut volume = fresh(4096);
        let ino = volume
            .create("/", "d", 0o755, FileKind::Directory, OWNER)
            .unwrap();
        let attr = volume
            .setattr(
                ino,
                &SetAttr {
                    perm: Some(0o100700),
                    uid: Some(7),
                    ..Default::default()
                },
            )
            .expect("chmod");
        assert_eq!(attr.kind, FileKind::Directory);
        assert_eq!(attr.perm, 0o700);
        assert_eq!(attr.uid, 7);
        assert_eq!(attr.gid, 1000);
    }

    #[test]
    fn timestamp_only_setattr_is_in_place() {
        let mut volume = fresh(4096);
        let ino = volume
            .create("/", "f", 0o644, FileKind::File, OWNER)
            .unwrap();
        let head = volume.store().head();
        let attr = volume
            .setattr(
                ino,
                &SetAttr {
                    atime: Some(42),
                    mtime: Some(43),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!((attr.atime, attr.mtime), (42, 43));
        assert_eq!(volume.store().head(), head);
        assert_eq!(volume.stat_ino(ino).unwrap().mtime, 43);
    }

    #[test]
    fn full_volume_reports_no_space_without_partial_create() {
        let capacity = SUPERBLOCK_SIZE as usize + RECORD_HEADER_SIZE * 2 + 8;
        let mut volume = fresh(capacity);
        let head = volume.store().head();
        assert!(matches!(
            volume.create("/", "f", 0o644, FileKind::File, OWNER),
            Err(LfsError::NoSpace { .. })
        ));
        assert_eq!(volume.store().head(), head);
        assert_eq!(volume.readdir("/").unwrap().len(), 2);
    }

    #[test]
    fn growth_past_capacity_is_no_space() {
        let mut volume = fresh(4096);
        let ino = volume
            .create("/", "f", 0o644, FileKind::File, OWNER)
            .unwrap();
        volume.write_at(ino, 0, b"keep").unwrap();
        let head = volume.store().head();

        for offset in [i64::MAX - 10, 4096] {
            assert!(matches!(
                volume.write_at(ino, offset, b"x"),
                Err(LfsError::NoSpace { .. })
            ));
        }
        for size in [u64::MAX, 4096] {
            assert!(matches!(
                volume.setattr(ino, &SetAttr { size: Some(size), ..Default::default() }),
                Err(LfsError::NoSpace { .. })
            ));
        }
        assert_eq!(volume.store().head(), head);
        assert_eq!(volume.stat_ino(ino).unwrap().size, 4);
        assert_eq!(volume.read_at(ino, 0, 64).unwrap(), b"keep");
    }

    #[test]
    fn readdir_skips_dangling_entries() {
        let mut volume = fresh(4096);
        volume
            .create("/", "f", 0o644, FileKind::File, OWNER)
            .unwrap();
        let root = volume.resolve("/").unwrap();
        let mut entries = resolver::read_dentries(volume.store(), &root).unwrap();
        entries.push(Dentry::new("ghost", 42).unwrap());
        volume
            .store
            .append_records(&[Record::directory(root.header, &entries)])
            .unwrap();

        assert_eq!(volume.readdir("/").unwrap(), vec![".", "..", "f"]);
        assert_eq!(volume.list_at(ROOT_INO).unwrap().len(), 1);
    }

    #[test]
    fn parent_of_finds_the_listing_directory() {
        let mut volume = fresh(4096);
        let d = volume
            .create("/", "d", 0o755, FileKind::Directory, OWNER)
            .unwrap();
        let f = volume
            .create("/d", "f", 0o644, FileKind::File, OWNER)
            .unwrap();
        assert_eq!(volume.parent_of(f).unwrap(), d);
        assert_eq!(volume.parent_of(d).unwrap(), ROOT_INO);
        assert_eq!(volume.parent_of(ROOT_INO).unwrap(), ROOT_INO);
        volume.unlink("/d/f").unwrap();
        assert!(matches!(volume.parent_of(f), Err(LfsError::NotFound)));
    }

    #[test]
    fn sync_failure_is_reported() {
        let mut volume = fresh(4096);
        volume.store().device().set_fail_flush(true);
        assert!(matches!(
            volume.create("/", "f", 0o644, FileKind::File, OWNER),
            Err(LfsError::Io(_))
        ));
    }

    #[test]
    fn statfs_counts_live_identities() {
        let mut volume = fresh(4096);
        volume
            .create("/", "a", 0o644, FileKind::File, OWNER)
            .unwrap();
        volume
            .create("/", "b", 0o644, FileKind::File, OWNER)
            .unwrap();
        volume.unlink("/a").unwrap();
        let stats = volume.statfs().expect("statfs");
        assert_eq!(stats.live_files, 2); // root and b
        assert_eq!(stats.used, volume.store().head());
        assert_eq!(stats.free, 4096 - stats.used);
        assert_eq!(stats.records, 7);
    }

    #[test]
    fn list_at_reports_kinds() {
        let mut volume = fresh(4096);
        volume
            .create("/", "d", 0o755, FileKind::Directory, OWNER)
            .unwrap();
        volume
            .create("/", "f", 0o644, FileKind::File, OWNER)
            .unwrap();
        let entries = volume.list_at(ROOT_INO).expect("list");
        assert_eq!(
            entries,
            vec![
                DirEntry { name: "d".into(), ino: 1, kind: FileKind::Directory },
                DirEntry { name: "f".into(), ino: 2, kind: FileKind::File },
            ]
        );
        assert_eq!(volume.lookup_at(ROOT_INO, "f").unwrap().ino, 2);
        assert!(matches!(
            volume.lookup_at(ROOT_INO, "zzz"),
            Err(LfsError::NotFound)
        ));
    }
}
