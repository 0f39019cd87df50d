//! Positional file access for an open database.
//!
//! Three layers sit between the engine and the file:
//!
//! - the extra mapped region: an anonymous mapping of `xmsiz` bytes that
//!   mirrors the head of the file (header, bucket array, first records).
//!   Reads inside it never touch the file; writes go to both.
//! - the write-behind tail: bytes appended by asynchronous puts are held in
//!   memory past the on-disk end and written out in one batch.
//! - the transaction journal: while a transaction is active every write
//!   and truncation logs the pre-images of the bytes it replaces first.
//!
//! `fsiz()` is the logical size, i.e. the on-disk length plus the pending
//! tail.

use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::error::{ErrorCode, HdbError, HdbResult};
use crate::platform::{durable_sync, read_exact_at, write_all_at};
use crate::wal::Journal;

/// Pending tail bytes that trigger an automatic flush
pub const TAIL_FLUSH_SIZE: usize = 256 * 1024;

/// The file plus its mirrored head.
struct Backing {
    file: File,
    path: PathBuf,
    map: Option<MmapMut>,
    /// Bytes of the file on disk
    disk_len: u64,
}

impl Backing {
    fn mapped_end(&self) -> u64 {
        self.map.as_ref().map_or(0, |m| (m.len() as u64).min(self.disk_len))
    }

    /// Read from the on-disk part; the range must lie below `disk_len`.
    fn read(&self, offset: u64, buf: &mut [u8]) -> HdbResult<()> {
        let end = offset + buf.len() as u64;
        let mapped = self.mapped_end();
        let mut done = 0usize;
        if offset < mapped {
            if let Some(map) = &self.map {
                let take = (mapped.min(end) - offset) as usize;
                let start = offset as usize;
                buf[..take].copy_from_slice(&map[start..start + take]);
                done = take;
            }
        }
        if done < buf.len() {
            read_exact_at(&self.file, &mut buf[done..], offset + done as u64).map_err(|e| {
                HdbError::io(ErrorCode::Read, &self.path, &format!("read at offset {} failed", offset), &e)
            })?;
        }
        Ok(())
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> HdbResult<()> {
        write_all_at(&self.file, data, offset).map_err(|e| {
            HdbError::io(ErrorCode::Write, &self.path, &format!("write at offset {} failed", offset), &e)
        })?;
        if let Some(map) = self.map.as_mut() {
            let map_len = map.len() as u64;
            if offset < map_len {
                let take = (map_len - offset).min(data.len() as u64) as usize;
                let start = offset as usize;
                map[start..start + take].copy_from_slice(&data[..take]);
            }
        }
        self.disk_len = self.disk_len.max(offset + data.len() as u64);
        Ok(())
    }

    fn set_len(&mut self, len: u64) -> HdbResult<()> {
        self.file
            .set_len(len)
            .map_err(|e| HdbError::io(ErrorCode::Trunc, &self.path, "truncate failed", &e))?;
        if let Some(map) = self.map.as_mut() {
            let start = (len as usize).min(map.len());
            let stop = (self.disk_len as usize).min(map.len());
            if start < stop {
                map[start..stop].fill(0);
            }
        }
        self.disk_len = len;
        Ok(())
    }

    /// Refill the mirror from disk.
    fn load_map(&mut self) -> HdbResult<()> {
        if let Some(map) = self.map.as_mut() {
            let filled = (map.len() as u64).min(self.disk_len) as usize;
            read_exact_at(&self.file, &mut map[..filled], 0)
                .map_err(|e| HdbError::io(ErrorCode::Mmap, &self.path, "failed to fill mapped region", &e))?;
            map[filled..].fill(0);
        }
        Ok(())
    }
}

/// File access for one open database.
pub struct Storage {
    backing: Backing,
    /// Bytes logically at `[disk_len, disk_len + tail.len())`
    tail: Vec<u8>,
    journal: Option<Journal>,
}

impl Storage {
    /// Wrap an open file. `xmsiz` bytes of the head are mirrored (0
    /// disables the mirror).
    pub fn open(file: File, path: &Path, xmsiz: usize) -> HdbResult<Self> {
        let disk_len = file
            .metadata()
            .map_err(|e| HdbError::io(ErrorCode::Stat, path, "failed to stat file", &e))?
            .len();
        let map = if xmsiz > 0 {
            Some(MmapMut::map_anon(xmsiz).map_err(|e| {
                HdbError::io(ErrorCode::Mmap, path, "failed to map extra memory", &e)
            })?)
        } else {
            None
        };
        let mut backing = Backing { file, path: path.to_path_buf(), map, disk_len };
        backing.load_map()?;
        Ok(Self { backing, tail: Vec::new(), journal: None })
    }

    pub fn file(&self) -> &File {
        &self.backing.file
    }

    pub fn path(&self) -> &Path {
        &self.backing.path
    }

    /// Logical size including the pending tail.
    pub fn fsiz(&self) -> u64 {
        self.backing.disk_len + self.tail.len() as u64
    }

    /// Size of the mirrored head region.
    pub fn map_size(&self) -> usize {
        self.backing.map.as_ref().map_or(0, |m| m.len())
    }

    fn out_of_range(&self, offset: u64, len: usize) -> HdbError {
        HdbError::with_path(
            ErrorCode::Read,
            &self.backing.path,
            format!("range {}+{} beyond end of file {}", offset, len, self.fsiz()),
        )
    }

    /// Fill `buf` from `offset`.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> HdbResult<()> {
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| self.out_of_range(offset, buf.len()))?;
        if end > self.fsiz() {
            return Err(self.out_of_range(offset, buf.len()));
        }
        read_split(&self.backing, &self.tail, offset, buf)
    }

    pub fn read_vec(&self, offset: u64, len: usize) -> HdbResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read(offset, &mut buf)?;
        Ok(buf)
    }

    /// Up to `len` bytes from `offset`, fewer when the file ends first.
    pub fn read_clipped(&self, offset: u64, len: usize) -> HdbResult<Vec<u8>> {
        let avail = self.fsiz().saturating_sub(offset).min(len as u64) as usize;
        self.read_vec(offset, avail)
    }

    /// Write `data` at `offset`, logging pre-images first when a
    /// transaction is active. Writes may extend the file.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> HdbResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let fsiz = self.fsiz();
        if offset > fsiz {
            // Zero-fill so the logical file has no holes in the tail.
            let gap = vec![0u8; (offset - fsiz) as usize];
            self.write(fsiz, &gap)?;
        }
        self.log_pre_images(offset, data.len() as u64)?;

        // Only buffered appends stay in memory; growing writes go to disk.
        if offset + data.len() as u64 > fsiz {
            self.flush()?;
        }
        let disk_len = self.backing.disk_len;
        if self.tail.is_empty() || offset + data.len() as u64 <= disk_len {
            return self.backing.write(offset, data);
        }
        let split = if offset >= disk_len { 0 } else { (disk_len - offset).min(data.len() as u64) as usize };
        if split > 0 {
            self.backing.write(offset, &data[..split])?;
        }
        if split < data.len() {
            let rest = &data[split..];
            let at = (offset + split as u64 - disk_len) as usize;
            if at + rest.len() > self.tail.len() {
                self.tail.resize(at + rest.len(), 0);
            }
            self.tail[at..at + rest.len()].copy_from_slice(rest);
            if self.tail.len() >= TAIL_FLUSH_SIZE {
                self.flush()?;
            }
        }
        Ok(())
    }

    /// Append at the logical end, through the file. Returns the offset.
    pub fn append(&mut self, data: &[u8]) -> HdbResult<u64> {
        self.flush()?;
        let offset = self.fsiz();
        self.write(offset, data)?;
        Ok(offset)
    }

    /// Append into the write-behind tail. Returns the offset.
    pub fn append_buffered(&mut self, data: &[u8]) -> HdbResult<u64> {
        let offset = self.fsiz();
        self.tail.extend_from_slice(data);
        if self.tail.len() >= TAIL_FLUSH_SIZE {
            self.flush()?;
        }
        Ok(offset)
    }

    /// Write the pending tail to disk.
    pub fn flush(&mut self) -> HdbResult<()> {
        if self.tail.is_empty() {
            return Ok(());
        }
        let offset = self.backing.disk_len;
        let tail = std::mem::take(&mut self.tail);
        if let Err(err) = self.backing.write(offset, &tail) {
            self.tail = tail;
            return Err(err);
        }
        Ok(())
    }

    /// Forget the pending tail without writing it.
    pub fn discard_tail(&mut self) {
        self.tail.clear();
    }

    /// Cut the logical file to `len` bytes.
    pub fn truncate(&mut self, len: u64) -> HdbResult<()> {
        let fsiz = self.fsiz();
        if len >= fsiz {
            return Ok(());
        }
        self.log_pre_images(len, fsiz - len)?;
        let disk_len = self.backing.disk_len;
        if len >= disk_len {
            self.tail.truncate((len - disk_len) as usize);
            return Ok(());
        }
        self.tail.clear();
        self.backing.set_len(len)
    }

    /// Flush the tail and sync the file; `durable` uses the platform's
    /// strongest guarantee.
    pub fn sync(&mut self, durable: bool) -> HdbResult<()> {
        self.flush()?;
        let result = if durable { durable_sync(&self.backing.file) } else { self.backing.file.sync_data() };
        result.map_err(|e| HdbError::io(ErrorCode::Sync, &self.backing.path, "sync failed", &e))
    }

    /// Re-read length and mirrored head after the file was changed behind
    /// this handle's back (rollback).
    pub fn reload(&mut self) -> HdbResult<()> {
        self.tail.clear();
        self.backing.disk_len = self
            .backing
            .file
            .metadata()
            .map_err(|e| HdbError::io(ErrorCode::Stat, &self.backing.path, "failed to stat file", &e))?
            .len();
        self.backing.load_map()
    }

    pub fn begin_journal(&mut self, journal: Journal) {
        self.journal = Some(journal);
    }

    pub fn take_journal(&mut self) -> Option<Journal> {
        self.journal.take()
    }

    pub fn journal(&self) -> Option<&Journal> {
        self.journal.as_ref()
    }

    fn log_pre_images(&mut self, offset: u64, len: u64) -> HdbResult<()> {
        let Some(journal) = self.journal.as_mut() else {
            return Ok(());
        };
        let backing = &self.backing;
        let tail = &self.tail;
        let fsiz = backing.disk_len + tail.len() as u64;
        journal.record(offset, len, |start, want| {
            let avail = fsiz.saturating_sub(start).min(want as u64) as usize;
            let mut buf = vec![0u8; avail];
            read_split(backing, tail, start, &mut buf)?;
            Ok(buf)
        })
    }
}

/// Read a range that may straddle the on-disk end and the pending tail.
fn read_split(backing: &Backing, tail: &[u8], offset: u64, buf: &mut [u8]) -> HdbResult<()> {
    let disk_len = backing.disk_len;
    let split = if offset >= disk_len { 0 } else { (disk_len - offset).min(buf.len() as u64) as usize };
    if split > 0 {
        backing.read(offset, &mut buf[..split])?;
    }
    if split < buf.len() {
        let at = (offset + split as u64 - disk_len) as usize;
        let want = buf.len() - split;
        buf[split..].copy_from_slice(&tail[at..at + want]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::TempDir;

    fn open_storage(dir: &TempDir, xmsiz: usize) -> Storage {
        let path = dir.path().join("casket.hkh");
        let file = OpenOptions::new().read(true).write(true).create(true).open(&path).unwrap();
        Storage::open(file, &path, xmsiz).unwrap()
    }

    #[test]
    fn test_reads_span_mirror_and_file() {
        let dir = TempDir::new().unwrap();
        let mut storage = open_storage(&dir, 64);
        let data: Vec<u8> = (0..200u8).collect();
        storage.write(0, &data).unwrap();

        assert_eq!(storage.read_vec(60, 10).unwrap(), data[60..70].to_vec());
        assert_eq!(storage.read_vec(0, 200).unwrap(), data);
        assert_eq!(std::fs::read(storage.path()).unwrap(), data);
    }

    #[test]
    fn test_tail_buffer_is_readable_before_flush() {
        let dir = TempDir::new().unwrap();
        let mut storage = open_storage(&dir, 0);
        storage.write(0, b"head").unwrap();
        let at = storage.append_buffered(b"pending").unwrap();
        assert_eq!(at, 4);
        assert_eq!(storage.fsiz(), 11);
        assert_eq!(std::fs::metadata(storage.path()).unwrap().len(), 4);

        // Overwrite straddling disk and tail.
        storage.write(2, b"XXYY").unwrap();
        assert_eq!(storage.read_vec(0, 11).unwrap(), b"heXXYYnding".to_vec());

        storage.flush().unwrap();
        assert_eq!(std::fs::read(storage.path()).unwrap(), b"heXXYYnding".to_vec());
    }

    #[test]
    fn test_truncate_clears_mirror() {
        let dir = TempDir::new().unwrap();
        let mut storage = open_storage(&dir, 4096);
        storage.write(0, &[9u8; 100]).unwrap();
        storage.truncate(40).unwrap();
        storage.write(60, &[1u8; 4]).unwrap();

        let bytes = storage.read_vec(0, 64).unwrap();
        assert!(bytes[40..60].iter().all(|&b| b == 0));
        assert!(storage.read_vec(60, 10).is_err());
    }

    #[test]
    fn test_read_past_end_is_an_error() {
        let dir = TempDir::new().unwrap();
        let mut storage = open_storage(&dir, 0);
        storage.write(0, b"abc").unwrap();
        assert!(storage.read_vec(2, 2).is_err());
        assert_eq!(storage.read_clipped(2, 10).unwrap(), b"c".to_vec());
    }
}
