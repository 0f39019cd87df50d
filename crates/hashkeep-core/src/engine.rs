//! Record engine for one open file.
//!
//! `Core` owns the file, its decoded header, the free block pool and the
//! iterator/defrag cursors. It is not synchronized; [`crate::HashDb`] wraps
//! it in a lock.
//!
//! Records live in singly linked chains hanging off the bucket array. New
//! and relocated records are prepended to their bucket's chain. A record is
//! rewritten in place when the new encoding fits its block; otherwise it
//! moves to a best-fit free block or to the end of the file and its old
//! block goes back to the pool.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::codec::{Codec, ValueCodec};
use crate::config::{OpenMode, Tuning};
use crate::error::{ErrorCode, HdbError, HdbResult};
use crate::format::{
    align_up, bucket_index, check_hash, free_block_prefix, read_u32, FileHeader, Layout, RecordHeader,
    BLOCK_PREFIX_SIZE, FLAGS_OFFSET, FLAG_FATAL, FLAG_OPEN, HEADER_SIZE, OPAQUE_OFFSET, OPAQUE_SIZE, POOL_ENTRY_SIZE, POOL_PREFIX_SIZE,
};
use crate::freepool::{FreeBlock, FreePool};
use crate::iter::Cursor;
use crate::platform::{file_identity, lock_file, now_secs, read_exact_at, unlock_file, LockOutcome};
use crate::storage::Storage;
use crate::wal::{apply_rollback, journal_path, read_journal, Journal};

/// Handle settings that affect how a file is opened.
#[derive(Clone, Default)]
pub(crate) struct CoreSettings {
    pub xmsiz: usize,
    pub dfunit: u32,
    pub custom_codec: Option<Arc<dyn ValueCodec>>,
}

/// Where the pointer to a record is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkSite {
    /// A bucket array slot
    Bucket(u64),
    /// The chain link of the record at this offset
    Record(u64),
}

/// A record found by key.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Located {
    pub bucket: u64,
    pub offset: u64,
    pub header: RecordHeader,
    pub site: LinkSite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PutMode {
    Overwrite,
    Keep,
    Concat,
    /// Append through the write-behind tail
    Async,
}

pub(crate) struct Core {
    pub path: PathBuf,
    pub mode: OpenMode,
    pub header: FileHeader,
    pub layout: Layout,
    pub storage: Storage,
    pub pool: FreePool,
    pub codec: Codec,
    pub cursor: Cursor,
    /// Resume offset of incremental defragmentation
    pub dfcur: u64,
    pub freed_since_defrag: u32,
    pub settings: CoreSettings,
    /// Records changed since the header was last written
    pub dirty: bool,
}

impl Core {
    /// Open `path`. `tuning` is used when the file is created; when
    /// `tuned` is set its codec must also match an existing file's.
    pub fn open(
        path: &Path,
        mode: OpenMode,
        tuning: &Tuning,
        tuned: bool,
        settings: CoreSettings,
    ) -> HdbResult<Core> {
        let writer = mode.is_writer();
        if !writer && !mode.contains(OpenMode::READER) {
            return Err(HdbError::invalid("open mode needs READER or WRITER"));
        }
        tuning.validate().map_err(HdbError::invalid)?;

        let mut options = OpenOptions::new();
        options.read(true);
        if writer {
            options.write(true).create(mode.contains(OpenMode::CREAT));
        }
        let file = options
            .open(path)
            .map_err(|e| HdbError::io(ErrorCode::Open, path, "failed to open database file", &e))?;

        if !mode.contains(OpenMode::NOLCK) {
            let outcome = lock_file(&file, writer, mode.contains(OpenMode::LCKNB))
                .map_err(|e| HdbError::io(ErrorCode::Lock, path, "failed to lock database file", &e))?;
            if outcome == LockOutcome::Contended {
                return Err(HdbError::with_path(ErrorCode::Lock, path, "database file is locked by another handle"));
            }
        }

        let len = file
            .metadata()
            .map_err(|e| HdbError::io(ErrorCode::Stat, path, "failed to stat database file", &e))?
            .len();
        let wal_path = journal_path(path);
        let mut rolled_back = false;

        if writer && (mode.contains(OpenMode::TRUNC) || len == 0) {
            let header = FileHeader::new(tuning);
            file.set_len(0)
                .and_then(|_| file.set_len(header.frec))
                .map_err(|e| HdbError::io(ErrorCode::Trunc, path, "failed to size new file", &e))?;
            crate::platform::write_all_at(&file, &header.to_bytes(), 0)
                .map_err(|e| HdbError::io(ErrorCode::Write, path, "failed to write header", &e))?;
            remove_if_exists(&wal_path)?;
        } else if writer {
            if let Some(contents) = read_journal(&wal_path)? {
                apply_rollback(&file, path, &contents)?;
                tracing::warn!(
                    path = %path.display(),
                    entries = contents.entries.len(),
                    fsiz = contents.orig_fsiz,
                    "rolled back interrupted transaction"
                );
                rolled_back = true;
            }
            remove_if_exists(&wal_path)?;
        } else if wal_path.exists() {
            tracing::warn!(path = %path.display(), "uncommitted journal present; reading file as is");
        }

        let mut raw = [0u8; HEADER_SIZE];
        read_exact_at(&file, &mut raw, 0)
            .map_err(|e| HdbError::bad_meta(path, format!("failed to read header: {}", e)))?;
        let header = FileHeader::from_bytes(&raw).map_err(|reason| HdbError::bad_meta(path, reason))?;

        if tuned && tuning.opts.codec_bits() != header.opts.codec_bits() {
            return Err(HdbError::with_path(
                ErrorCode::Invalid,
                path,
                format!(
                    "file codec bits 0x{:02x} differ from tuned 0x{:02x}",
                    header.opts.codec_bits(),
                    tuning.opts.codec_bits()
                ),
            ));
        }
        let codec = Codec::from_options(header.opts, settings.custom_codec.as_ref())
            .map_err(|reason| HdbError::with_path(ErrorCode::Invalid, path, reason))?;

        let disk_len = file
            .metadata()
            .map_err(|e| HdbError::io(ErrorCode::Stat, path, "failed to stat database file", &e))?
            .len();
        let unclean = writer && !rolled_back && header.flags & (FLAG_OPEN | FLAG_FATAL) != 0;
        if !unclean && header.fsiz > disk_len {
            return Err(HdbError::bad_meta(
                path,
                format!("file is {} bytes, header records {}", disk_len, header.fsiz),
            ));
        }
        if writer && !unclean && disk_len > header.fsiz {
            file.set_len(header.fsiz)
                .map_err(|e| HdbError::io(ErrorCode::Trunc, path, "failed to drop bytes past recorded end", &e))?;
        }

        let layout = header.layout();
        let storage = Storage::open(file, path, settings.xmsiz)?;
        let mut core = Core {
            path: path.to_path_buf(),
            mode,
            pool: FreePool::new(layout.fbpmax, layout.frec),
            dfcur: layout.frec,
            header,
            layout,
            storage,
            codec,
            cursor: Cursor::default(),
            freed_since_defrag: 0,
            settings,
            dirty: false,
        };

        if unclean {
            tracing::warn!(path = %core.path.display(), "file was not closed cleanly, rebuilding index");
            core.rebuild_index()?;
        } else {
            core.load_pool()?;
        }

        if writer {
            core.header.flags |= FLAG_OPEN;
            core.header.flags &= !FLAG_FATAL;
            core.persist_meta()?;
        }

        tracing::info!(
            path = %core.path.display(),
            writer,
            rnum = core.header.rnum,
            fsiz = core.storage.fsiz(),
            free_blocks = core.pool.len(),
            free_bytes = core.pool.total_size(),
            "opened database"
        );
        Ok(core)
    }

    /// Flush everything, clear the open flag and release the file.
    pub fn close(mut self) -> HdbResult<()> {
        if self.tran_active() {
            tracing::warn!(path = %self.path.display(), "closing with an active transaction, aborting it");
            self.tran_abort()?;
        }
        if self.is_writer() {
            self.header.flags &= !FLAG_OPEN;
            self.persist_meta()?;
        }
        if !self.mode.contains(OpenMode::NOLCK) {
            unlock_file(self.storage.file())
                .map_err(|e| HdbError::io(ErrorCode::Lock, &self.path, "failed to unlock database file", &e))?;
        }
        tracing::info!(path = %self.path.display(), rnum = self.header.rnum, "closed database");
        Ok(())
    }

    pub fn is_writer(&self) -> bool {
        self.mode.is_writer()
    }

    pub fn require_writer(&self) -> HdbResult<()> {
        if !self.is_writer() {
            return Err(HdbError::with_path(ErrorCode::Invalid, &self.path, "handle is opened read-only"));
        }
        if self.header.flags & FLAG_FATAL != 0 {
            return Err(HdbError::with_path(
                ErrorCode::Misc,
                &self.path,
                "an earlier write failed; reopen the file to recover",
            ));
        }
        Ok(())
    }

    /// Flag the file after a failed write. Further writes through this
    /// handle are refused and the next writer open rebuilds the index.
    pub fn mark_fatal(&mut self) {
        self.header.flags |= FLAG_FATAL;
        if let Err(err) = self.storage.write(FLAGS_OFFSET as u64, &[self.header.flags]) {
            tracing::warn!(path = %self.path.display(), error = %err, "failed to persist fatal flag");
        }
    }

    pub fn tran_active(&self) -> bool {
        self.storage.journal().is_some()
    }

    fn load_pool(&mut self) -> HdbResult<()> {
        let prefix = self.storage.read_vec(self.layout.pool_offset, POOL_PREFIX_SIZE)?;
        let count = (read_u32(&prefix, 0) as usize).min(self.layout.fbpmax);
        let bytes = self
            .storage
            .read_vec(self.layout.pool_offset, POOL_PREFIX_SIZE + count * POOL_ENTRY_SIZE)?;
        let fsiz = self.header.fsiz.min(self.storage.fsiz());
        let (pool, rejected) = FreePool::decode(&bytes, self.layout.fbpmax, self.layout.frec, fsiz);
        if rejected > 0 {
            tracing::warn!(path = %self.path.display(), rejected, "dropped invalid free pool entries");
        }
        self.pool = pool;
        Ok(())
    }

    /// Write pending tail, pool and header to the file.
    pub fn persist_meta(&mut self) -> HdbResult<()> {
        self.storage.flush()?;
        if self.dirty {
            self.header.mtime = now_secs();
            self.dirty = false;
        }
        self.header.fsiz = self.storage.fsiz();
        let (inode, _) = file_identity(self.storage.file())
            .map_err(|e| HdbError::io(ErrorCode::Stat, &self.path, "failed to stat database file", &e))?;
        self.header.inode = inode;
        let pool = self.pool.encode();
        self.storage.write(self.layout.pool_offset, &pool)?;
        let header = self.header.to_bytes();
        self.storage.write(0, &header)
    }

    pub fn set_opaque(&mut self, data: &[u8]) -> HdbResult<()> {
        self.require_writer()?;
        let mut opaque = [0u8; OPAQUE_SIZE];
        let len = data.len().min(OPAQUE_SIZE);
        opaque[..len].copy_from_slice(&data[..len]);
        self.storage.write(OPAQUE_OFFSET as u64, &opaque)?;
        self.header.opaque = opaque;
        Ok(())
    }

    // ---- bucket array and chains ----

    pub fn read_slot(&self, bucket: u64) -> HdbResult<u64> {
        let width = self.layout.width;
        let mut buf = [0u8; 8];
        self.storage.read(self.layout.bucket_offset(bucket), &mut buf[..width])?;
        Ok(self.layout.unpack_offset(self.layout.read_packed(&buf[..width])))
    }

    fn pack(&self, offset: u64) -> HdbResult<u64> {
        if offset == 0 {
            return Ok(0);
        }
        self.layout.pack_offset(offset).ok_or_else(|| {
            HdbError::with_path(
                ErrorCode::Misc,
                &self.path,
                format!("offset {} is not addressable without the LARGE option", offset),
            )
        })
    }

    /// Point `site` at `target` (0 ends the chain).
    pub fn write_site(&mut self, site: LinkSite, target: u64) -> HdbResult<()> {
        let packed = self.pack(target)?;
        let mut buf = Vec::with_capacity(8);
        self.layout.write_packed(packed, &mut buf);
        let at = match site {
            LinkSite::Bucket(index) => self.layout.bucket_offset(index),
            LinkSite::Record(offset) => offset + BLOCK_PREFIX_SIZE as u64,
        };
        self.storage.write(at, &buf)
    }

    fn check_block_offset(&self, offset: u64) -> HdbResult<()> {
        if offset < self.layout.frec || offset >= self.storage.fsiz() || offset % self.layout.align() != 0 {
            return Err(HdbError::bad_record(&self.path, offset, "offset outside the record region"));
        }
        Ok(())
    }

    /// Read and validate the header of the live record at `offset`.
    pub fn read_record(&self, offset: u64) -> HdbResult<RecordHeader> {
        self.check_block_offset(offset)?;
        let bytes = self.storage.read_clipped(offset, self.layout.record_header_size())?;
        let header = RecordHeader::from_bytes(&bytes, &self.layout)
            .map_err(|reason| HdbError::bad_record(&self.path, offset, reason))?;
        if offset + header.rsiz as u64 > self.storage.fsiz() {
            return Err(HdbError::bad_record(&self.path, offset, "block extends past end of file"));
        }
        Ok(header)
    }

    pub fn read_key(&self, offset: u64, header: &RecordHeader) -> HdbResult<Vec<u8>> {
        self.storage
            .read_vec(offset + RecordHeader::key_offset(&self.layout), header.ksiz as usize)
    }

    /// Decoded value of the record at `offset`.
    pub fn read_value(&self, offset: u64, header: &RecordHeader) -> HdbResult<Vec<u8>> {
        let stored = self
            .storage
            .read_vec(offset + header.value_offset(&self.layout), header.vsiz as usize)?;
        if self.codec.is_identity() {
            return Ok(stored);
        }
        self.codec.decode(&stored).map_err(|reason| {
            HdbError::with_path(
                ErrorCode::RHead,
                &self.path,
                format!("record at offset {}: value decode failed: {}", offset, reason),
            )
        })
    }

    /// Find the record for `key`.
    pub fn locate(&self, key: &[u8]) -> HdbResult<Option<Located>> {
        let bucket = bucket_index(key, self.layout.bnum);
        let hcheck = check_hash(key);
        let mut site = LinkSite::Bucket(bucket);
        let mut offset = self.read_slot(bucket)?;
        let mut visited = 0u64;
        while offset != 0 {
            if visited >= self.header.rnum {
                return Err(HdbError::bad_record(&self.path, offset, "bucket chain longer than record count"));
            }
            visited += 1;
            let header = self.read_record(offset)?;
            if header.hcheck == hcheck
                && header.ksiz as usize == key.len()
                && self.read_key(offset, &header)? == key
            {
                return Ok(Some(Located { bucket, offset, header, site }));
            }
            site = LinkSite::Record(offset);
            offset = header.link;
        }
        Ok(None)
    }

    fn unlink(&mut self, found: &Located) -> HdbResult<()> {
        self.write_site(found.site, found.header.link)?;
        self.cursor.unlinked(found.bucket, found.offset, found.header.link);
        Ok(())
    }

    // ---- block allocation ----

    /// Reserve a block of at least `need` bytes. Returns offset and block
    /// size; an offset equal to the current end means "append".
    fn allocate(&mut self, need: u64) -> HdbResult<(u64, u64)> {
        let fsiz = self.storage.fsiz();
        let block = self
            .pool
            .take_best_fit(need, fsiz)
            .map_err(|reason| HdbError::with_path(ErrorCode::RHead, &self.path, reason))?;
        let Some(block) = block else {
            return Ok((fsiz, need));
        };
        // Coalesced pool entries span several on-disk blocks; the defrag
        // cursor must stay on a block boundary.
        if block.offset < self.dfcur && self.dfcur < block.end() {
            self.dfcur = block.offset;
        }
        let rest = block.size - need;
        if rest >= self.layout.record_header_size() as u64 {
            let remainder = FreeBlock { offset: block.offset + need, size: rest };
            self.storage.write(remainder.offset, &free_block_prefix(rest as u32))?;
            self.pool_insert(remainder);
            Ok((block.offset, need))
        } else {
            Ok((block.offset, block.size))
        }
    }

    fn pool_insert(&mut self, block: FreeBlock) {
        let dropped = self.pool.insert(block);
        if dropped > 0 {
            tracing::debug!(dropped, pool = self.pool.len(), "free pool full, dropped smallest entries");
        }
    }

    /// Give a block back: truncated away at the tail, pooled elsewhere.
    pub fn release(&mut self, offset: u64, size: u64) -> HdbResult<()> {
        self.freed_since_defrag = self.freed_since_defrag.saturating_add(1);
        if offset + size == self.storage.fsiz() {
            let mut end = offset;
            while let Some(prev) = self.pool.take_ending_at(end) {
                end = prev.offset;
            }
            self.storage.truncate(end)?;
            self.dfcur = self.dfcur.min(end);
            return Ok(());
        }
        let prefix_size = u32::try_from(size)
            .map_err(|_| HdbError::bad_record(&self.path, offset, "block size exceeds 32 bits"))?;
        self.storage.write(offset, &free_block_prefix(prefix_size))?;
        self.pool_insert(FreeBlock { offset, size });
        Ok(())
    }

    fn encode_record(
        &self,
        hcheck: u8,
        rsiz: u64,
        link: u64,
        key: &[u8],
        stored: &[u8],
        pad: bool,
    ) -> HdbResult<Vec<u8>> {
        let header = RecordHeader {
            hcheck,
            rsiz: rsiz as u32,
            link,
            ksiz: key.len() as u32,
            vsiz: stored.len() as u32,
        };
        let mut buf = header.to_bytes(&self.layout).ok_or_else(|| {
            HdbError::with_path(ErrorCode::Misc, &self.path, "chain link is not addressable without LARGE")
        })?;
        buf.reserve(if pad { rsiz as usize } else { key.len() + stored.len() });
        buf.extend_from_slice(key);
        buf.extend_from_slice(stored);
        if pad {
            buf.resize(rsiz as usize, 0);
        }
        Ok(buf)
    }

    // ---- record operations ----

    /// Store `value` under `key`. Returns `false` only for
    /// [`PutMode::Keep`] when the key already exists.
    pub fn put(&mut self, key: &[u8], value: &[u8], mode: PutMode) -> HdbResult<bool> {
        self.require_writer()?;
        let found = self.locate(key)?;
        let joined;
        let value = match (&found, mode) {
            (Some(_), PutMode::Keep) => return Ok(false),
            (Some(loc), PutMode::Concat) => {
                let mut old = self.read_value(loc.offset, &loc.header)?;
                old.extend_from_slice(value);
                joined = old;
                &joined[..]
            }
            _ => value,
        };

        let stored = if self.codec.is_identity() {
            value.to_vec()
        } else {
            self.codec.encode(value).map_err(|reason| {
                HdbError::with_path(ErrorCode::Misc, &self.path, format!("value encode failed: {}", reason))
            })?
        };
        if key.len() > u32::MAX as usize || stored.len() > u32::MAX as usize {
            return Err(HdbError::invalid("key or value exceeds 4 GiB"));
        }
        let body = self.layout.record_header_size() as u64 + key.len() as u64 + stored.len() as u64;
        let need = align_up(body, self.layout.align());
        if need > u32::MAX as u64 {
            return Err(HdbError::invalid(format!("record of {} bytes exceeds the block size limit", need)));
        }
        let hcheck = check_hash(key);
        self.dirty = true;

        if let Some(loc) = &found {
            if mode != PutMode::Async && need <= loc.header.rsiz as u64 {
                let record =
                    self.encode_record(hcheck, loc.header.rsiz as u64, loc.header.link, key, &stored, false)?;
                self.storage.write(loc.offset, &record)?;
                return Ok(true);
            }
            self.unlink(loc)?;
        }

        let bucket = bucket_index(key, self.layout.bnum);
        let head = self.read_slot(bucket)?;
        let (offset, rsiz) = if mode == PutMode::Async {
            (self.storage.fsiz(), need)
        } else {
            self.allocate(need)?
        };
        self.pack(offset)?;
        let record = self.encode_record(hcheck, rsiz, head, key, &stored, true)?;
        if mode == PutMode::Async {
            self.storage.append_buffered(&record)?;
        } else {
            self.storage.write(offset, &record)?;
        }
        self.write_site(LinkSite::Bucket(bucket), offset)?;

        match found {
            Some(loc) => self.release(loc.offset, loc.header.rsiz as u64)?,
            None => self.header.rnum += 1,
        }
        self.maybe_auto_defrag()?;
        Ok(true)
    }

    /// Remove `key`. Returns `false` when it does not exist.
    pub fn out(&mut self, key: &[u8]) -> HdbResult<bool> {
        self.require_writer()?;
        let Some(found) = self.locate(key)? else {
            return Ok(false);
        };
        self.dirty = true;
        self.unlink(&found)?;
        self.release(found.offset, found.header.rsiz as u64)?;
        self.header.rnum -= 1;
        self.maybe_auto_defrag()?;
        Ok(true)
    }

    pub fn get(&self, key: &[u8]) -> HdbResult<Option<Vec<u8>>> {
        match self.locate(key)? {
            Some(found) => self.read_value(found.offset, &found.header).map(Some),
            None => Ok(None),
        }
    }

    pub fn vsiz(&self, key: &[u8]) -> HdbResult<Option<usize>> {
        match self.locate(key)? {
            Some(found) if self.codec.is_identity() => Ok(Some(found.header.vsiz as usize)),
            Some(found) => Ok(Some(self.read_value(found.offset, &found.header)?.len())),
            None => Ok(None),
        }
    }

    /// Add to a 4-byte native-endian integer value, creating it if absent.
    pub fn add_int(&mut self, key: &[u8], delta: i32) -> HdbResult<i32> {
        self.require_writer()?;
        let sum = match self.locate(key)? {
            Some(found) => {
                let current = self.read_value(found.offset, &found.header)?;
                let raw: [u8; 4] = current.as_slice().try_into().map_err(|_| {
                    HdbError::new(
                        ErrorCode::Keep,
                        format!("existing value of {} bytes is not a 4-byte integer", current.len()),
                    )
                })?;
                i32::from_ne_bytes(raw)
                    .checked_add(delta)
                    .ok_or_else(|| HdbError::new(ErrorCode::Misc, "integer addition overflowed"))?
            }
            None => delta,
        };
        self.put(key, &sum.to_ne_bytes(), PutMode::Overwrite)?;
        Ok(sum)
    }

    /// Add to an 8-byte native-endian float value, creating it if absent.
    pub fn add_double(&mut self, key: &[u8], delta: f64) -> HdbResult<f64> {
        self.require_writer()?;
        let sum = match self.locate(key)? {
            Some(found) => {
                let current = self.read_value(found.offset, &found.header)?;
                let raw: [u8; 8] = current.as_slice().try_into().map_err(|_| {
                    HdbError::new(
                        ErrorCode::Keep,
                        format!("existing value of {} bytes is not an 8-byte double", current.len()),
                    )
                })?;
                f64::from_ne_bytes(raw) + delta
            }
            None => delta,
        };
        self.put(key, &sum.to_ne_bytes(), PutMode::Overwrite)?;
        Ok(sum)
    }

    fn maybe_auto_defrag(&mut self) -> HdbResult<()> {
        let unit = self.settings.dfunit;
        if unit > 0 && self.freed_since_defrag >= unit {
            self.freed_since_defrag = 0;
            self.defrag(unit as i64 * 2 + 1)?;
        }
        Ok(())
    }

    /// Number of non-empty bucket slots.
    pub fn bnum_used(&self) -> HdbResult<u64> {
        const CHUNK: u64 = 64 * 1024;
        let width = self.layout.width;
        let mut used = 0u64;
        let mut start = 0u64;
        while start < self.layout.bnum {
            let count = CHUNK.min(self.layout.bnum - start);
            let bytes = self
                .storage
                .read_vec(self.layout.bucket_offset(start), count as usize * width)?;
            used += bytes
                .chunks_exact(width)
                .filter(|slot| slot.iter().any(|&b| b != 0))
                .count() as u64;
            start += count;
        }
        Ok(used)
    }

    // ---- transactions ----

    pub fn tran_begin(&mut self) -> HdbResult<()> {
        self.require_writer()?;
        self.persist_meta()?;
        let tsync = self.mode.contains(OpenMode::TSYNC);
        if tsync {
            self.storage.sync(true)?;
        }
        let journal = Journal::create(journal_path(&self.path), self.storage.fsiz(), tsync)?;
        self.storage.begin_journal(journal);
        tracing::debug!(path = %self.path.display(), "transaction started");
        Ok(())
    }

    pub fn tran_commit(&mut self) -> HdbResult<()> {
        if !self.tran_active() {
            return Err(HdbError::invalid("no active transaction"));
        }
        self.persist_meta()?;
        if self.mode.contains(OpenMode::TSYNC) {
            self.storage.sync(true)?;
        }
        if let Some(journal) = self.storage.take_journal() {
            journal.remove()?;
        }
        tracing::debug!(path = %self.path.display(), "transaction committed");
        Ok(())
    }

    pub fn tran_abort(&mut self) -> HdbResult<()> {
        let Some(journal) = self.storage.take_journal() else {
            return Err(HdbError::invalid("no active transaction"));
        };
        self.storage.discard_tail();
        let contents = read_journal(journal.path())?
            .ok_or_else(|| HdbError::bad_meta(journal.path(), "journal header unreadable"))?;
        apply_rollback(self.storage.file(), &self.path, &contents)?;
        journal.remove()?;
        self.reload()?;
        tracing::debug!(path = %self.path.display(), restored = contents.entries.len(), "transaction aborted");
        Ok(())
    }

    /// Drop the journal and keep the current file image.
    pub fn tran_void(&mut self) -> HdbResult<()> {
        let Some(journal) = self.storage.take_journal() else {
            return Err(HdbError::invalid("no active transaction"));
        };
        journal.remove()?;
        self.persist_meta()
    }

    /// Re-read header, pool and mirror after the file changed underneath.
    fn reload(&mut self) -> HdbResult<()> {
        self.storage.reload()?;
        let raw = self.storage.read_vec(0, HEADER_SIZE)?;
        let mut bytes = [0u8; HEADER_SIZE];
        bytes.copy_from_slice(&raw);
        self.header = FileHeader::from_bytes(&bytes).map_err(|reason| HdbError::bad_meta(&self.path, reason))?;
        self.layout = self.header.layout();
        self.load_pool()?;
        self.dfcur = self.layout.frec;
        self.freed_since_defrag = 0;
        self.dirty = false;
        Ok(())
    }
}

fn remove_if_exists(path: &Path) -> HdbResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(HdbError::io(ErrorCode::Unlink, path, "failed to remove stale journal", &e)),
    }
}
