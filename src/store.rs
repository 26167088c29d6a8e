//! Backing store: superblock plus the append-only log behind it.
//!
//! ```text
//! [0 .. 16)            superblock { magic: u32, pad: u32, head: u64 }
//! [16 .. head)         records in write order
//! [head .. capacity)   free
//! ```

use log::{debug, error};
use serde::Serialize;

use crate::{
    cursor::LogCursor,
    device::BlockDevice,
    error::{LfsError, LfsResult},
    record::Record,
};

pub const MAGIC: u32 = 0xdead_beef;
pub const SUPERBLOCK_SIZE: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Superblock {
    pub magic: u32,
    /// One past the last committed byte of the log.
    pub head: u64,
}

impl Superblock {
    pub fn encode(&self) -> [u8; SUPERBLOCK_SIZE as usize] {
        let mut buf = [0u8; SUPERBLOCK_SIZE as usize];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[8..16].copy_from_slice(&self.head.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; SUPERBLOCK_SIZE as usize]) -> Self {
        Self {
            magic: u32!(buf[0..4]),
            head: u64!(buf[8..16]),
        }
    }
}

pub struct LogStore<D: BlockDevice> {
    device: D,
    head: u64,
}

impl<D: BlockDevice> LogStore<D> {
    /// Write an empty superblock onto `device`, discarding any log on it.
    pub fn format(device: D) -> LfsResult<Self> {
        if device.size() < SUPERBLOCK_SIZE {
            return Err(LfsError::NoSpace {
                needed: SUPERBLOCK_SIZE,
                available: device.size(),
            });
        }
        let store = Self {
            device,
            head: SUPERBLOCK_SIZE,
        };
        store.write_superblock()?;
        store.sync()?;
        Ok(store)
    }

    /// Open an existing log. Refuses devices whose superblock is not ours or
    /// whose head points outside the device.
    pub fn open(device: D) -> LfsResult<Self> {
        let mut buf = [0u8; SUPERBLOCK_SIZE as usize];
        let n = device.read_at(0, &mut buf)?;
        if n < buf.len() {
            return Err(LfsError::corrupt(0, "device too small for a superblock"));
        }
        let sb = Superblock::decode(&buf);
        if sb.magic != MAGIC {
            return Err(LfsError::BadMagic { found: sb.magic });
        }
        if sb.head < SUPERBLOCK_SIZE || sb.head > device.size() {
            return Err(LfsError::corrupt(
                0,
                format!(
                    "head {} outside [{}, {}]",
                    sb.head,
                    SUPERBLOCK_SIZE,
                    device.size()
                ),
            ));
        }
        debug!("opened log, head at {}", sb.head);
        Ok(Self {
            device,
            head: sb.head,
        })
    }

    pub fn superblock(&self) -> Superblock {
        Superblock {
            magic: MAGIC,
            head: self.head,
        }
    }

    pub fn head(&self) -> u64 {
        self.head
    }

    pub fn capacity(&self) -> u64 {
        self.device.size()
    }

    pub fn available(&self) -> u64 {
        self.capacity().saturating_sub(self.head)
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn into_device(self) -> D {
        self.device
    }

    /// Lazy walk over every record from the superblock to `head`.
    pub fn records(&self) -> LogCursor<'_, D> {
        LogCursor::new(self)
    }

    /// Fill `buf` from the committed log starting at `offset`.
    pub fn read_exact(&self, offset: u64, buf: &mut [u8]) -> LfsResult<()> {
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| LfsError::corrupt(offset, "read range overflows"))?;
        if offset < SUPERBLOCK_SIZE || end > self.head {
            return Err(LfsError::corrupt(
                offset,
                format!("read of {} bytes outside the committed log", buf.len()),
            ));
        }
        let n = self.device.read_at(offset, buf)?;
        if n != buf.len() {
            return Err(LfsError::corrupt(offset, "short read from device"));
        }
        Ok(())
    }

    pub fn read(&self, offset: u64, len: usize) -> LfsResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_exact(offset, &mut buf)?;
        Ok(buf)
    }

    /// Fail with `NoSpace` unless `len` more bytes fit behind `head`.
    pub fn ensure_space(&self, len: u64) -> LfsResult<()> {
        if len > self.available() {
            return Err(LfsError::NoSpace {
                needed: len,
                available: self.available(),
            });
        }
        Ok(())
    }

    /// Reserve `bytes.len()` bytes at the tail, write them there and advance
    /// `head`. Returns the offset the bytes landed at. Durable only after
    /// [`sync`](Self::sync).
    pub fn append(&mut self, bytes: &[u8]) -> LfsResult<u64> {
        self.ensure_space(bytes.len() as u64)?;
        let offset = self.head;
        let n = self.device.write_at(offset, bytes)?;
        if n != bytes.len() {
            return Err(LfsError::NoSpace {
                needed: bytes.len() as u64,
                available: n as u64,
            });
        }
        self.head += bytes.len() as u64;
        self.write_superblock()?;
        debug!("appended {} bytes at {}, head now {}", bytes.len(), offset, self.head);
        Ok(offset)
    }

    /// Append several records in order, all or none: space for the whole
    /// batch is checked before the first byte is written.
    pub fn append_records(&mut self, records: &[Record]) -> LfsResult<Vec<u64>> {
        let total = records.iter().map(Record::encoded_len).sum();
        self.ensure_space(total)?;
        records
            .iter()
            .map(|record| self.append(&record.encode()))
            .collect()
    }

    /// Overwrite bytes that are already part of the committed log. Never
    /// moves `head`; anything reaching past it is refused.
    pub fn write_in_place(&mut self, offset: u64, bytes: &[u8]) -> LfsResult<()> {
        let end = offset
            .checked_add(bytes.len() as u64)
            .ok_or_else(|| LfsError::corrupt(offset, "write range overflows"))?;
        if offset < SUPERBLOCK_SIZE || end > self.head {
            return Err(LfsError::corrupt(
                offset,
                format!("in-place write of {} bytes outside the committed log", bytes.len()),
            ));
        }
        let n = self.device.write_at(offset, bytes)?;
        if n != bytes.len() {
            return Err(LfsError::corrupt(offset, "short write to device"));
        }
        Ok(())
    }

    /// Flush the device. Only after this returns is `head` durable.
    pub fn sync(&self) -> LfsResult<()> {
        self.device.flush().map_err(|e| {
            error!("sync failed at head {}: {}", self.head, e);
            e
        })
    }

    fn write_superblock(&self) -> LfsResult<()> {
        let buf = self.superblock().encode();
        let n = self.device.write_at(0, &buf)?;
        if n != buf.len() {
            return Err(LfsError::corrupt(0, "short superblock write"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use crate::record::{FileKind, Owner, RecordHeader, RECORD_HEADER_SIZE};

    #[test]
    fn format_then_open() {
        let store = LogStore::format(MemDevice::new(256)).expect("format");
        assert_eq!(store.head(), SUPERBLOCK_SIZE);
        let store = LogStore::open(store.into_device()).expect("open");
        assert_eq!(store.head(), SUPERBLOCK_SIZE);
        assert_eq!(store.available(), 256 - SUPERBLOCK_SIZE);
    }

    #[test]
    fn open_rejects_bad_magic() {
        let dev = MemDevice::new(64);
        dev.write_at(0, &0x1234_5678u32.to_le_bytes()).unwrap();
        assert!(matches!(
            LogStore::open(dev),
            Err(LfsError::BadMagic { found: 0x1234_5678 })
        ));
    }

    #[test]
    fn open_rejects_head_past_device() {
        let dev = MemDevice::new(64);
        let sb = Superblock { magic: MAGIC, head: 65 };
        dev.write_at(0, &sb.encode()).unwrap();
        assert!(matches!(LogStore::open(dev), Err(LfsError::CorruptLog { .. })));
    }

    #[test]
    fn append_advances_head_and_superblock() {
        let mut store = LogStore::format(MemDevice::new(128)).expect("format");
        let at = store.append(b"abcdef").expect("append");
        assert_eq!(at, SUPERBLOCK_SIZE);
        assert_eq!(store.head(), SUPERBLOCK_SIZE + 6);
        assert_eq!(store.read(at, 6).expect("read"), b"abcdef");

        let snapshot = store.device().snapshot();
        let mut buf = [0u8; SUPERBLOCK_SIZE as usize];
        buf.copy_from_slice(&snapshot[..SUPERBLOCK_SIZE as usize]);
        assert_eq!(Superblock::decode(&buf).head, SUPERBLOCK_SIZE + 6);
    }

    #[test]
    fn append_without_room_is_no_space() {
        let mut store = LogStore::format(MemDevice::new(20)).expect("format");
        let err = store.append(b"too many bytes").expect_err("must not fit");
        assert!(matches!(err, LfsError::NoSpace { needed: 14, available: 4 }));
        assert_eq!(store.head(), SUPERBLOCK_SIZE);
    }

    #[test]
    fn batch_append_is_all_or_nothing() {
        let capacity = SUPERBLOCK_SIZE as usize + RECORD_HEADER_SIZE + 10;
        let mut store = LogStore::format(MemDevice::new(capacity)).expect("format");
        let header = RecordHeader::new(1, FileKind::File, 0o644, Owner::default(), 0);
        let records = vec![
            Record::new(header, vec![1; 4]),
            Record::new(header, vec![2; 4]),
        ];
        assert!(matches!(
            store.append_records(&records),
            Err(LfsError::NoSpace { .. })
        ));
        assert_eq!(store.head(), SUPERBLOCK_SIZE);
    }

    #[test]
    fn reads_and_in_place_writes_stay_below_head() {
        let mut store = LogStore::format(MemDevice::new(128)).expect("format");
        let at = store.append(b"0123").expect("append");
        store.write_in_place(at + 1, b"xy").expect("in place");
        assert_eq!(store.read(at, 4).unwrap(), b"0xy3");

        assert!(store.write_in_place(at + 2, b"xyz").is_err());
        assert!(store.read(at, 5).is_err());
        assert!(store.write_in_place(0, b"no").is_err());
    }

    #[test]
    fn sync_failure_surfaces_as_io() {
        let store = LogStore::format(MemDevice::new(64)).expect("format");
        store.device().set_fail_flush(true);
        assert!(matches!(store.sync(), Err(LfsError::Io(_))));
    }
}
