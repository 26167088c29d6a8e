//! Path resolution over the log.
//!
//! Every lookup scans the log for the latest version of an identity, since
//! old versions are never removed. Later records always win.

use log::debug;
use smallvec::SmallVec;

use crate::{
    cursor::LogEntry,
    device::BlockDevice,
    error::{LfsError, LfsResult},
    record::{unpack_dentries, Dentry, Ino, ROOT_INO},
    store::LogStore,
};

pub type Components<'p> = SmallVec<[&'p str; 8]>;

/// Split on `/`, dropping empty and `.` components.
pub fn components(path: &str) -> Components<'_> {
    path.split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect()
}

/// Split a path into its parent's components and the final name.
pub fn split_parent(path: &str) -> LfsResult<(Components<'_>, &str)> {
    let mut parts = components(path);
    let name = parts
        .pop()
        .ok_or_else(|| LfsError::InvalidName(path.to_string()))?;
    Ok((parts, name))
}

/// Last record carrying `ino`, tombstones included.
pub fn latest_version<D: BlockDevice>(store: &LogStore<D>, ino: Ino) -> LfsResult<Option<LogEntry>> {
    let mut latest = None;
    for entry in store.records() {
        let entry = entry?;
        if entry.header.inode_number == ino {
            latest = Some(entry);
        }
    }
    Ok(latest)
}

/// Current live version of `ino`. An identity whose latest record is a
/// tombstone is gone, whatever came before it.
pub fn current_version<D: BlockDevice>(store: &LogStore<D>, ino: Ino) -> LfsResult<LogEntry> {
    match latest_version(store, ino)? {
        Some(entry) if !entry.header.deleted => Ok(entry),
        _ => Err(LfsError::NotFound),
    }
}

pub fn read_payload<D: BlockDevice>(store: &LogStore<D>, entry: &LogEntry) -> LfsResult<Vec<u8>> {
    store.read(entry.payload_offset(), entry.header.size as usize)
}

pub fn read_dentries<D: BlockDevice>(store: &LogStore<D>, dir: &LogEntry) -> LfsResult<Vec<Dentry>> {
    if !dir.header.is_dir() {
        return Err(LfsError::NotADirectory);
    }
    let payload = read_payload(store, dir)?;
    unpack_dentries(&payload, dir.payload_offset())
}

/// Identity named `name` inside `dir`, if any.
pub fn find_child<D: BlockDevice>(store: &LogStore<D>, dir: &LogEntry, name: &str) -> LfsResult<Option<Ino>> {
    Ok(read_dentries(store, dir)?
        .into_iter()
        .find(|d| d.name == name)
        .map(|d| d.inode_number))
}

/// Current version of the child `name` of `dir`. A dentry pointing at an
/// identity with no live record reads as absent.
pub fn lookup<D: BlockDevice>(store: &LogStore<D>, dir: &LogEntry, name: &str) -> LfsResult<LogEntry> {
    let ino = find_child(store, dir, name)?.ok_or(LfsError::NotFound)?;
    current_version(store, ino)
}

pub fn resolve_components<D: BlockDevice>(store: &LogStore<D>, parts: &[&str]) -> LfsResult<LogEntry> {
    // identities walked so far, for `..`
    let mut trail: SmallVec<[Ino; 8]> = SmallVec::new();
    let mut current = ROOT_INO;
    for part in parts {
        let dir = current_version(store, current)?;
        if !dir.header.is_dir() {
            return Err(LfsError::NotFound);
        }
        if *part == ".." {
            current = trail.pop().unwrap_or(ROOT_INO);
            continue;
        }
        let child = find_child(store, &dir, part)?.ok_or(LfsError::NotFound)?;
        trail.push(current);
        current = child;
    }
    current_version(store, current)
}

/// Map a slash-separated path to the current version of the record it names.
pub fn resolve<D: BlockDevice>(store: &LogStore<D>, path: &str) -> LfsResult<LogEntry> {
    let result = resolve_components(store, &components(path));
    if let Err(LfsError::NotFound) = result {
        debug!("resolve {:?}: not found", path);
    }
    result
}
