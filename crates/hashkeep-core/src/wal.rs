//! Transaction journal (`<path>.wal`)
//!
//! The journal holds pre-images: before a byte range below the
//! pre-transaction file size is overwritten, the 512-byte blocks it touches
//! are copied into the journal, once per block per transaction. Rolling
//! back writes every pre-image back (newest first) and truncates the file
//! to the recorded original size, which restores the exact image the file
//! had at `tran_begin`.
//!
//! Journal layout:
//!
//! ```text
//! [0..4)   magic "HKWL"
//! [4..8)   reserved
//! [8..16)  original file size (u64)
//! entries: magic "HKWE", len u32, offset u64, crc32c u32, reserved u32, data
//! ```
//!
//! The CRC covers the offset and the data. Recovery skips corrupt entries
//! by scanning for the next entry magic and stops at a torn entry at EOF.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use hashbrown::HashSet;

use crate::error::{ErrorCode, HdbError, HdbResult};
use crate::format::{read_u32, read_u64};
use crate::platform::{durable_sync, write_all_at};

/// Granularity of pre-image logging
pub const JOURNAL_BLOCK: u64 = 512;

const FILE_MAGIC: [u8; 4] = *b"HKWL";
const ENTRY_MAGIC: [u8; 4] = *b"HKWE";
const FILE_HEADER_SIZE: usize = 16;
const ENTRY_HEADER_SIZE: usize = 24;

/// Journal path for a database file.
pub fn journal_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push(".wal");
    PathBuf::from(name)
}

fn entry_checksum(offset: u64, data: &[u8]) -> u32 {
    crc32c::crc32c_append(crc32c::crc32c(&offset.to_le_bytes()), data)
}

fn encode_entry(offset: u64, data: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(&ENTRY_MAGIC);
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(&offset.to_le_bytes());
    out.extend_from_slice(&entry_checksum(offset, data).to_le_bytes());
    out.extend_from_slice(&[0u8; 4]);
    out.extend_from_slice(data);
}

/// Writer side of an active transaction.
pub struct Journal {
    file: File,
    path: PathBuf,
    /// File size when the transaction began
    orig_fsiz: u64,
    /// Block numbers already logged
    logged: HashSet<u64>,
    /// Bytes written so far
    size: u64,
    /// Durably sync after every append
    sync_each: bool,
}

impl Journal {
    /// Create a fresh journal recording `orig_fsiz`. The header is synced
    /// before returning so recovery always knows the size to restore.
    pub fn create(path: PathBuf, orig_fsiz: u64, sync_each: bool) -> HdbResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| HdbError::io(ErrorCode::Open, &path, "failed to create journal", &e))?;

        let mut header = [0u8; FILE_HEADER_SIZE];
        header[0..4].copy_from_slice(&FILE_MAGIC);
        header[8..16].copy_from_slice(&orig_fsiz.to_le_bytes());
        write_all_at(&file, &header, 0)
            .map_err(|e| HdbError::io(ErrorCode::Write, &path, "journal header write failed", &e))?;
        durable_sync(&file)
            .map_err(|e| HdbError::io(ErrorCode::Sync, &path, "journal sync failed", &e))?;

        Ok(Self {
            file,
            path,
            orig_fsiz,
            logged: HashSet::new(),
            size: FILE_HEADER_SIZE as u64,
            sync_each,
        })
    }

    pub fn orig_fsiz(&self) -> u64 {
        self.orig_fsiz
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of blocks logged so far.
    pub fn logged_blocks(&self) -> usize {
        self.logged.len()
    }

    /// Log the pre-images of `[offset, offset + len)` that are not logged
    /// yet. `read(start, len)` must return the current bytes of that range
    /// (shorter if the file currently ends inside it).
    pub fn record<F>(&mut self, offset: u64, len: u64, mut read: F) -> HdbResult<()>
    where
        F: FnMut(u64, usize) -> HdbResult<Vec<u8>>,
    {
        if len == 0 || offset >= self.orig_fsiz {
            return Ok(());
        }
        let end = (offset + len).min(self.orig_fsiz);
        let first = offset / JOURNAL_BLOCK;
        let last = (end - 1) / JOURNAL_BLOCK;

        let mut batch = Vec::new();
        for block in first..=last {
            if !self.logged.insert(block) {
                continue;
            }
            let start = block * JOURNAL_BLOCK;
            let block_len = JOURNAL_BLOCK.min(self.orig_fsiz - start) as usize;
            let data = read(start, block_len)?;
            if !data.is_empty() {
                encode_entry(start, &data, &mut batch);
            }
        }
        if batch.is_empty() {
            return Ok(());
        }

        write_all_at(&self.file, &batch, self.size)
            .map_err(|e| HdbError::io(ErrorCode::Write, &self.path, "journal append failed", &e))?;
        self.size += batch.len() as u64;
        if self.sync_each {
            self.sync()?;
        }
        Ok(())
    }

    pub fn sync(&self) -> HdbResult<()> {
        durable_sync(&self.file)
            .map_err(|e| HdbError::io(ErrorCode::Sync, &self.path, "journal sync failed", &e))
    }

    /// Close and delete the journal.
    pub fn remove(self) -> HdbResult<()> {
        let Journal { file, path, .. } = self;
        drop(file);
        std::fs::remove_file(&path)
            .map_err(|e| HdbError::io(ErrorCode::Unlink, &path, "failed to remove journal", &e))
    }
}

/// One logged pre-image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreImage {
    pub offset: u64,
    pub data: Vec<u8>,
}

/// Parsed journal contents.
#[derive(Debug, Clone)]
pub struct JournalContents {
    pub orig_fsiz: u64,
    pub entries: Vec<PreImage>,
}

/// Read a journal. `Ok(None)` when there is no journal or it never got a
/// complete header (nothing was modified before its header was durable).
pub fn read_journal(path: &Path) -> HdbResult<Option<JournalContents>> {
    let buffer = match std::fs::read(path) {
        Ok(buffer) => buffer,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(HdbError::io(ErrorCode::Read, path, "failed to read journal", &e)),
    };
    if buffer.len() < FILE_HEADER_SIZE || buffer[0..4] != FILE_MAGIC {
        tracing::warn!(path = %path.display(), "journal without a valid header ignored");
        return Ok(None);
    }
    let orig_fsiz = read_u64(&buffer, 8);

    let mut entries = Vec::new();
    let mut offset = FILE_HEADER_SIZE;
    while offset + ENTRY_HEADER_SIZE <= buffer.len() {
        if buffer[offset..offset + 4] != ENTRY_MAGIC {
            tracing::warn!(at = offset, "bad journal entry magic, scanning for next entry");
            match find_next_magic(&buffer, offset + 1) {
                Some(next) => {
                    offset = next;
                    continue;
                }
                None => break,
            }
        }

        let len = read_u32(&buffer, offset + 4) as usize;
        let total = ENTRY_HEADER_SIZE + len;
        if offset + total > buffer.len() {
            tracing::warn!(
                at = offset,
                need = total,
                have = buffer.len() - offset,
                "torn journal entry at end of log"
            );
            break;
        }

        let block_offset = read_u64(&buffer, offset + 8);
        let crc = read_u32(&buffer, offset + 16);
        let data = &buffer[offset + ENTRY_HEADER_SIZE..offset + total];
        if entry_checksum(block_offset, data) != crc {
            tracing::warn!(at = offset, "journal entry checksum mismatch, skipping");
            match find_next_magic(&buffer, offset + 1) {
                Some(next) => {
                    offset = next;
                    continue;
                }
                None => break,
            }
        }
        entries.push(PreImage { offset: block_offset, data: data.to_vec() });
        offset += total;
    }

    Ok(Some(JournalContents { orig_fsiz, entries }))
}

fn find_next_magic(buffer: &[u8], start: usize) -> Option<usize> {
    (start..buffer.len().saturating_sub(3)).find(|&i| buffer[i..i + 4] == ENTRY_MAGIC)
}

/// Restore `file` to the image described by `journal`: pre-images are
/// written back newest first, then the file is cut to the original size
/// and synced.
pub fn apply_rollback(file: &File, file_path: &Path, journal: &JournalContents) -> HdbResult<()> {
    for image in journal.entries.iter().rev() {
        write_all_at(file, &image.data, image.offset)
            .map_err(|e| HdbError::io(ErrorCode::Write, file_path, "rollback write failed", &e))?;
    }
    file.set_len(journal.orig_fsiz)
        .map_err(|e| HdbError::io(ErrorCode::Trunc, file_path, "rollback truncate failed", &e))?;
    durable_sync(file).map_err(|e| HdbError::io(ErrorCode::Sync, file_path, "rollback sync failed", &e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::read_exact_at;
    use tempfile::TempDir;

    fn reader_for(file: &File) -> impl FnMut(u64, usize) -> HdbResult<Vec<u8>> + '_ {
        move |start, len| {
            let mut buf = vec![0u8; len];
            read_exact_at(file, &mut buf, start).map_err(HdbError::from)?;
            Ok(buf)
        }
    }

    #[test]
    fn test_rollback_restores_image() {
        let temp = TempDir::new().unwrap();
        let data_path = temp.path().join("casket.hkh");
        let original: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&data_path, &original).unwrap();
        let file = OpenOptions::new().read(true).write(true).open(&data_path).unwrap();

        let mut journal = Journal::create(journal_path(&data_path), 2000, false).unwrap();
        journal.record(100, 700, reader_for(&file)).unwrap();
        write_all_at(&file, &[0xEE; 700], 100).unwrap();
        // Second write to an already logged block adds nothing.
        journal.record(150, 10, reader_for(&file)).unwrap();
        write_all_at(&file, &[0xDD; 10], 150).unwrap();
        assert_eq!(journal.logged_blocks(), 2);
        // Growth past the original size is undone by truncation.
        write_all_at(&file, b"tail", 2000).unwrap();

        let contents = read_journal(journal.path()).unwrap().unwrap();
        assert_eq!(contents.orig_fsiz, 2000);
        assert_eq!(contents.entries.len(), 2);

        apply_rollback(&file, &data_path, &contents).unwrap();
        assert_eq!(std::fs::read(&data_path).unwrap(), original);
        journal.remove().unwrap();
        assert!(!journal_path(&data_path).exists());
    }

    #[test]
    fn test_ranges_past_original_size_are_not_logged() {
        let temp = TempDir::new().unwrap();
        let data_path = temp.path().join("casket.hkh");
        std::fs::write(&data_path, vec![1u8; 600]).unwrap();
        let file = File::open(&data_path).unwrap();

        let mut journal = Journal::create(journal_path(&data_path), 600, false).unwrap();
        journal.record(600, 100, reader_for(&file)).unwrap();
        assert_eq!(journal.logged_blocks(), 0);
        journal.record(500, 200, reader_for(&file)).unwrap();
        assert_eq!(journal.logged_blocks(), 1);

        let contents = read_journal(journal.path()).unwrap().unwrap();
        assert_eq!(contents.entries[0].offset, 0);
        assert_eq!(contents.entries[0].data.len(), 512);
    }

    #[test]
    fn test_torn_and_corrupt_entries() {
        let temp = TempDir::new().unwrap();
        let data_path = temp.path().join("casket.hkh");
        std::fs::write(&data_path, vec![7u8; 2048]).unwrap();
        let file = File::open(&data_path).unwrap();

        let mut journal = Journal::create(journal_path(&data_path), 2048, false).unwrap();
        journal.record(0, 2048, reader_for(&file)).unwrap();
        let path = journal.path().to_path_buf();
        drop(journal);

        let mut bytes = std::fs::read(&path).unwrap();
        // Corrupt the data of the second entry.
        let second = FILE_HEADER_SIZE + ENTRY_HEADER_SIZE + 512;
        bytes[second + ENTRY_HEADER_SIZE + 3] ^= 0xFF;
        // Simulate a torn append.
        bytes.extend_from_slice(&ENTRY_MAGIC);
        bytes.extend_from_slice(&[0xFF, 0x00, 0x00, 0x00]);
        std::fs::write(&path, bytes).unwrap();

        let contents = read_journal(&path).unwrap().unwrap();
        let offsets: Vec<u64> = contents.entries.iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![0, 1024, 1536]);
    }

    #[test]
    fn test_missing_journal() {
        let temp = TempDir::new().unwrap();
        assert!(read_journal(&temp.path().join("nothing.wal")).unwrap().is_none());
    }
}
