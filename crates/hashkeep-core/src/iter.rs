//! Record traversal in bucket-then-chain order.
//!
//! The handle keeps one cursor. It names either a bucket to start from or
//! a record that will be yielded next. Before a record is yielded the
//! cursor is checked against the bucket's current chain; if the record is
//! gone the traversal resumes at the next bucket. Unlinking or moving the
//! record under the cursor adjusts the cursor instead.

use crate::db::HashDb;
use crate::engine::Core;
use crate::error::{HdbError, HdbResult};
use crate::format::RecordHeader;

/// Slots read per batch when looking for the next non-empty bucket
const SLOT_BATCH: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Cursor {
    /// Continue with the first non-empty bucket at or after this index
    Bucket(u64),
    /// Yield this record next
    Record { bucket: u64, offset: u64 },
}

impl Default for Cursor {
    fn default() -> Self {
        Cursor::Bucket(0)
    }
}

impl Cursor {
    /// The record at `offset` in `bucket` was unlinked; `next` followed it.
    pub fn unlinked(&mut self, bucket: u64, offset: u64, next: u64) {
        if *self == (Cursor::Record { bucket, offset }) {
            *self = if next != 0 { Cursor::Record { bucket, offset: next } } else { Cursor::Bucket(bucket + 1) };
        }
    }

    /// The record at `from` now lives at `to`.
    pub fn moved(&mut self, from: u64, to: u64) {
        if let Cursor::Record { bucket, offset } = *self {
            if offset == from {
                *self = Cursor::Record { bucket, offset: to };
            }
        }
    }
}

/// A record reached by the cursor.
#[derive(Debug, Clone)]
pub(crate) struct IterEntry {
    pub key: Vec<u8>,
    pub offset: u64,
    pub header: RecordHeader,
}

impl Core {
    pub fn iter_init(&mut self) {
        self.cursor = Cursor::default();
    }

    /// First non-empty bucket at or after `from`, with its chain head.
    fn next_nonempty_bucket(&self, from: u64) -> HdbResult<Option<(u64, u64)>> {
        let width = self.layout.width;
        let mut start = from;
        while start < self.layout.bnum {
            let count = SLOT_BATCH.min(self.layout.bnum - start);
            let bytes = self
                .storage
                .read_vec(self.layout.bucket_offset(start), count as usize * width)?;
            for (i, slot) in bytes.chunks_exact(width).enumerate() {
                let packed = self.layout.read_packed(slot);
                if packed != 0 {
                    return Ok(Some((start + i as u64, self.layout.unpack_offset(packed))));
                }
            }
            start += count;
        }
        Ok(None)
    }

    /// Header of the record at `offset` if it is still linked in `bucket`.
    fn chain_member(&self, bucket: u64, offset: u64) -> HdbResult<Option<RecordHeader>> {
        if bucket >= self.layout.bnum {
            return Ok(None);
        }
        let mut current = self.read_slot(bucket)?;
        let mut visited = 0u64;
        while current != 0 {
            if visited >= self.header.rnum {
                return Err(HdbError::bad_record(&self.path, current, "bucket chain longer than record count"));
            }
            visited += 1;
            let header = self.read_record(current)?;
            if current == offset {
                return Ok(Some(header));
            }
            current = header.link;
        }
        Ok(None)
    }

    pub fn iter_next(&mut self) -> HdbResult<Option<IterEntry>> {
        loop {
            match self.cursor {
                Cursor::Bucket(from) => match self.next_nonempty_bucket(from)? {
                    Some((bucket, head)) => self.cursor = Cursor::Record { bucket, offset: head },
                    None => {
                        self.cursor = Cursor::Bucket(self.layout.bnum);
                        return Ok(None);
                    }
                },
                Cursor::Record { bucket, offset } => match self.chain_member(bucket, offset)? {
                    Some(header) => {
                        let key = self.read_key(offset, &header)?;
                        self.cursor = if header.link != 0 {
                            Cursor::Record { bucket, offset: header.link }
                        } else {
                            Cursor::Bucket(bucket + 1)
                        };
                        return Ok(Some(IterEntry { key, offset, header }));
                    }
                    None => self.cursor = Cursor::Bucket(bucket + 1),
                },
            }
        }
    }

    /// Position the cursor so the next call yields `key`.
    pub fn iter_init_at(&mut self, key: &[u8]) -> HdbResult<bool> {
        match self.locate(key)? {
            Some(found) => {
                self.cursor = Cursor::Record { bucket: found.bucket, offset: found.offset };
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Position the cursor so the next call yields the record after `key`.
    pub fn iter_init_after(&mut self, key: &[u8]) -> HdbResult<bool> {
        match self.locate(key)? {
            Some(found) => {
                self.cursor = if found.header.link != 0 {
                    Cursor::Record { bucket: found.bucket, offset: found.header.link }
                } else {
                    Cursor::Bucket(found.bucket + 1)
                };
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Visit every live record without touching the shared cursor. The
    /// visitor returns `false` to stop early.
    pub fn scan<F>(&self, mut visit: F) -> HdbResult<()>
    where
        F: FnMut(u64, &RecordHeader) -> HdbResult<bool>,
    {
        let mut next = 0u64;
        while let Some((bucket, head)) = self.next_nonempty_bucket(next)? {
            let mut offset = head;
            let mut visited = 0u64;
            while offset != 0 {
                if visited >= self.header.rnum {
                    return Err(HdbError::bad_record(&self.path, offset, "bucket chain longer than record count"));
                }
                visited += 1;
                let header = self.read_record(offset)?;
                if !visit(offset, &header)? {
                    return Ok(());
                }
                offset = header.link;
            }
            next = bucket + 1;
        }
        Ok(())
    }

    /// Keys starting with `prefix`, at most `max`.
    pub fn fwm_keys(&self, prefix: &[u8], max: Option<usize>) -> HdbResult<Vec<Vec<u8>>> {
        let limit = max.unwrap_or(usize::MAX);
        let mut keys = Vec::new();
        if limit == 0 {
            return Ok(keys);
        }
        self.scan(|offset, header| {
            if header.ksiz as usize >= prefix.len() {
                let key = self.read_key(offset, header)?;
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
            Ok(keys.len() < limit)
        })?;
        Ok(keys)
    }
}

/// Pull-style key iterator driving a handle's cursor; see [`HashDb::keys`].
pub struct Keys<'a> {
    db: &'a HashDb,
    done: bool,
}

impl<'a> Keys<'a> {
    pub(crate) fn new(db: &'a HashDb) -> Self {
        Self { db, done: false }
    }
}

impl Iterator for Keys<'_> {
    type Item = HdbResult<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.db.iter_next() {
            Ok(Some(key)) => Some(Ok(key)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_follows_unlink_and_move() {
        let mut cursor = Cursor::Record { bucket: 3, offset: 640 };
        cursor.moved(640, 320);
        assert_eq!(cursor, Cursor::Record { bucket: 3, offset: 320 });

        cursor.unlinked(3, 320, 960);
        assert_eq!(cursor, Cursor::Record { bucket: 3, offset: 960 });

        cursor.unlinked(3, 960, 0);
        assert_eq!(cursor, Cursor::Bucket(4));

        // Unrelated records leave the cursor alone.
        cursor.unlinked(4, 128, 0);
        cursor.moved(128, 64);
        assert_eq!(cursor, Cursor::Bucket(4));
    }
}
