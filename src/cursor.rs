//! Validating walk over the records of the log.

use serde::Serialize;

use crate::{
    device::BlockDevice,
    error::{LfsError, LfsResult},
    record::{RecordHeader, RECORD_HEADER_SIZE},
    store::{LogStore, SUPERBLOCK_SIZE},
};

/// A record header and where it sits in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub offset: u64,
    pub header: RecordHeader,
}

impl LogEntry {
    pub fn payload_offset(&self) -> u64 {
        self.offset + RECORD_HEADER_SIZE as u64
    }

    /// Offset of the record that follows this one.
    pub fn end(&self) -> u64 {
        self.offset + self.header.record_len()
    }
}

/// Iterator over the log from the superblock to `head`.
///
/// Each header is checked against `head` before its `size` is trusted. The
/// first bad record yields an `Err` and ends the walk. Create a new cursor
/// with [`LogStore::records`] to start over.
pub struct LogCursor<'a, D: BlockDevice> {
    store: &'a LogStore<D>,
    pos: u64,
    done: bool,
}

impl<'a, D: BlockDevice> LogCursor<'a, D> {
    pub(crate) fn new(store: &'a LogStore<D>) -> Self {
        Self {
            store,
            pos: SUPERBLOCK_SIZE,
            done: false,
        }
    }

    fn read_entry(&self) -> LfsResult<LogEntry> {
        let head = self.store.head();
        if head - self.pos < RECORD_HEADER_SIZE as u64 {
            return Err(LfsError::corrupt(
                self.pos,
                format!("truncated record header, {} bytes before head", head - self.pos),
            ));
        }
        let mut buf = [0u8; RECORD_HEADER_SIZE];
        self.store.read_exact(self.pos, &mut buf)?;
        let header = RecordHeader::decode(&buf);
        let fits = (self.pos + RECORD_HEADER_SIZE as u64)
            .checked_add(header.size)
            .map_or(false, |end| end <= head);
        if !fits {
            return Err(LfsError::corrupt(
                self.pos,
                format!("record size {} runs past head {}", header.size, head),
            ));
        }
        Ok(LogEntry {
            offset: self.pos,
            header,
        })
    }
}

impl<D: BlockDevice> Iterator for LogCursor<'_, D> {
    type Item = LfsResult<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.pos >= self.store.head() {
            return None;
        }
        match self.read_entry() {
            Ok(entry) => {
                self.pos = entry.end();
                Some(Ok(entry))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
