//! Space maintenance: defragmentation, index rebuild, vanish, optimize
//! and copy.
//!
//! Rebuild and copy use the atomic rename pattern:
//! 1. Write the new file next to the target (`.tmp` suffix)
//! 2. durable_sync the new file
//! 3. Rename it over the target (atomic on POSIX)
//! 4. durable_sync the directory
//!
//! A crash before the rename leaves the target intact and an orphaned
//! temp file; after it, the new file is complete.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use crate::config::{OpenMode, OptimizeParams, Tuning, DEFAULT_BNUM};
use crate::engine::{Core, CoreSettings, LinkSite, PutMode};
use crate::error::{ErrorCode, HdbError, HdbResult};
use crate::format::{
    bucket_index, free_block_prefix, BlockKind, BLOCK_PREFIX_SIZE, FLAGS_OFFSET, FLAG_OPEN,
};
use crate::freepool::FreeBlock;
use crate::platform::{durable_sync, read_exact_at, sync_dir, write_all_at};
use crate::wal::{apply_rollback, read_journal};

/// Bucket slots zeroed per write
const ZERO_BATCH: u64 = 16 * 1024;

fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

impl Core {
    /// Kind of the block starting at `offset`, validated against the
    /// alignment and the end of file.
    fn read_block_kind(&self, offset: u64) -> HdbResult<BlockKind> {
        let prefix = self.storage.read_clipped(offset, BLOCK_PREFIX_SIZE)?;
        let kind = BlockKind::parse(&prefix).map_err(|reason| HdbError::bad_record(&self.path, offset, reason))?;
        if kind.size() % self.layout.align() != 0 {
            return Err(HdbError::bad_record(&self.path, offset, format!("unaligned block size {}", kind.size())));
        }
        if offset + kind.size() > self.storage.fsiz() {
            return Err(HdbError::bad_record(&self.path, offset, "block extends past end of file"));
        }
        Ok(kind)
    }

    /// Site holding the pointer to the record at `target` in `bucket`.
    fn find_site(&self, bucket: u64, target: u64) -> HdbResult<LinkSite> {
        let mut site = LinkSite::Bucket(bucket);
        let mut offset = self.read_slot(bucket)?;
        let mut visited = 0u64;
        while offset != 0 && visited <= self.header.rnum {
            if offset == target {
                return Ok(site);
            }
            visited += 1;
            let header = self.read_record(offset)?;
            site = LinkSite::Record(offset);
            offset = header.link;
        }
        Err(HdbError::bad_record(&self.path, target, "record is not reachable from its bucket"))
    }

    fn zero_buckets(&mut self) -> HdbResult<()> {
        let width = self.layout.width as u64;
        let mut start = 0u64;
        while start < self.layout.bnum {
            let count = ZERO_BATCH.min(self.layout.bnum - start);
            let zeros = vec![0u8; (count * width) as usize];
            self.storage.write(self.layout.bucket_offset(start), &zeros)?;
            start += count;
        }
        Ok(())
    }

    /// Slide the record at `from` down to `to` and repoint its chain link.
    fn move_record(&mut self, from: u64, to: u64, rsiz: u64) -> HdbResult<()> {
        let header = self.read_record(from)?;
        let key = self.read_key(from, &header)?;
        let site = self.find_site(bucket_index(&key, self.layout.bnum), from)?;
        let block = self.storage.read_vec(from, rsiz as usize)?;
        self.storage.write(to, &block)?;
        self.write_site(site, to)?;
        self.cursor.moved(from, to);
        Ok(())
    }

    /// Incremental defragmentation.
    ///
    /// Starting from the defrag cursor, finds the next free block, then
    /// slides up to `step` following records backward over it, absorbing
    /// any free blocks met on the way. What remains is one free block, or
    /// nothing when the sweep reached the end of the file. `step <= 0`
    /// sweeps the whole record region.
    pub fn defrag(&mut self, step: i64) -> HdbResult<()> {
        self.require_writer()?;
        self.storage.flush()?;
        let frec = self.layout.frec;
        let fsiz = self.storage.fsiz();
        let budget = if step <= 0 { u64::MAX } else { step as u64 };

        let mut pos = if step <= 0 { frec } else { self.dfcur.clamp(frec, fsiz) };
        loop {
            if pos >= fsiz {
                self.dfcur = frec;
                return Ok(());
            }
            match self.read_block_kind(pos)? {
                BlockKind::Free { .. } => break,
                BlockKind::Record { rsiz } => pos += rsiz as u64,
            }
        }

        self.dirty = true;
        let mut hole = pos;
        let mut moved = 0u64;
        while pos < fsiz {
            match self.read_block_kind(pos)? {
                BlockKind::Free { rsiz } => {
                    let size = rsiz as u64;
                    if pos + size - hole > u32::MAX as u64 {
                        break;
                    }
                    self.pool.remove_overlapping(pos, pos + size);
                    pos += size;
                }
                BlockKind::Record { rsiz } => {
                    if moved >= budget {
                        break;
                    }
                    let size = rsiz as u64;
                    self.move_record(pos, hole, size)?;
                    hole += size;
                    pos += size;
                    moved += 1;
                }
            }
        }

        let hole_len = pos - hole;
        if pos >= fsiz {
            self.storage.truncate(hole)?;
            self.pool.remove_overlapping(hole, u64::MAX);
            self.dfcur = frec;
        } else if hole_len > 0 {
            self.storage.write(hole, &free_block_prefix(hole_len as u32))?;
            self.pool.remove_overlapping(hole, pos);
            self.pool.insert(FreeBlock { offset: hole, size: hole_len });
            self.dfcur = hole;
        }
        tracing::debug!(moved, hole = hole_len, fsiz = self.storage.fsiz(), "defrag step");
        Ok(())
    }

    /// Rebuild bucket chains, record count and free pool by walking the
    /// record region. A block running past the end of file, or an all-zero
    /// remainder, is a torn tail and gets truncated; any other malformed
    /// block is an error. When one key occurs twice the later block wins.
    pub fn rebuild_index(&mut self) -> HdbResult<()> {
        self.zero_buckets()?;
        self.pool.clear();
        self.header.rnum = 0;
        self.cursor = Default::default();
        self.dirty = true;

        let fsiz = self.storage.fsiz();
        let mut pos = self.layout.frec;
        let mut torn = false;
        while pos < fsiz {
            let prefix = self.storage.read_clipped(pos, BLOCK_PREFIX_SIZE)?;
            let kind = match BlockKind::parse(&prefix) {
                Ok(kind) if kind.size() % self.layout.align() == 0 => kind,
                Ok(kind) => {
                    return Err(HdbError::bad_record(&self.path, pos, format!("unaligned block size {}", kind.size())))
                }
                Err(reason) => {
                    let rest = self.storage.read_vec(pos, (fsiz - pos) as usize)?;
                    if prefix.len() < BLOCK_PREFIX_SIZE || rest.iter().all(|&b| b == 0) {
                        torn = true;
                        break;
                    }
                    return Err(HdbError::bad_record(&self.path, pos, reason));
                }
            };
            let size = kind.size();
            if pos + size > fsiz {
                torn = true;
                break;
            }
            match kind {
                BlockKind::Free { .. } => {
                    self.pool.insert(FreeBlock { offset: pos, size });
                }
                BlockKind::Record { .. } => {
                    let header = self.read_record(pos)?;
                    let key = self.read_key(pos, &header)?;
                    if let Some(older) = self.locate(&key)? {
                        self.write_site(older.site, older.header.link)?;
                        self.storage.write(older.offset, &free_block_prefix(older.header.rsiz))?;
                        self.pool.insert(FreeBlock { offset: older.offset, size: older.header.rsiz as u64 });
                        self.header.rnum -= 1;
                    }
                    let bucket = bucket_index(&key, self.layout.bnum);
                    let head = self.read_slot(bucket)?;
                    self.write_site(LinkSite::Record(pos), head)?;
                    self.write_site(LinkSite::Bucket(bucket), pos)?;
                    self.header.rnum += 1;
                }
            }
            pos += size;
        }

        if torn {
            tracing::warn!(path = %self.path.display(), at = pos, "truncating torn block at end of file");
            self.storage.truncate(pos)?;
        }
        self.dfcur = self.layout.frec;
        tracing::info!(
            path = %self.path.display(),
            rnum = self.header.rnum,
            free_blocks = self.pool.len(),
            "rebuilt index"
        );
        Ok(())
    }

    /// Remove every record, keeping tuning and the opaque area.
    pub fn vanish(&mut self) -> HdbResult<()> {
        self.require_writer()?;
        self.storage.truncate(self.layout.frec)?;
        self.zero_buckets()?;
        self.pool.clear();
        self.header.rnum = 0;
        self.cursor = Default::default();
        self.dfcur = self.layout.frec;
        self.freed_since_defrag = 0;
        self.dirty = true;
        self.persist_meta()
    }

    /// Write a consistent copy to `dest`. Uncommitted changes of an active
    /// transaction are rolled back in the copy.
    pub fn copy_to(&mut self, dest: &Path) -> HdbResult<()> {
        if self.tran_active() {
            self.storage.flush()?;
        } else if self.is_writer() {
            self.persist_meta()?;
        }

        let tmp = sibling_path(dest, ".tmp");
        std::fs::copy(&self.path, &tmp)
            .map_err(|e| HdbError::io(ErrorCode::Write, &tmp, "failed to copy database file", &e))?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&tmp)
            .map_err(|e| HdbError::io(ErrorCode::Open, &tmp, "failed to open copy", &e))?;

        if let Some(journal) = self.storage.journal() {
            if let Some(contents) = read_journal(journal.path())? {
                apply_rollback(&file, &tmp, &contents)?;
            }
        }

        let mut flags = [0u8; 1];
        read_exact_at(&file, &mut flags, FLAGS_OFFSET as u64)
            .map_err(|e| HdbError::io(ErrorCode::Read, &tmp, "failed to read copied header", &e))?;
        flags[0] &= !FLAG_OPEN;
        write_all_at(&file, &flags, FLAGS_OFFSET as u64)
            .map_err(|e| HdbError::io(ErrorCode::Write, &tmp, "failed to write copied header", &e))?;
        durable_sync(&file).map_err(|e| HdbError::io(ErrorCode::Sync, &tmp, "failed to sync copy", &e))?;
        drop(file);

        std::fs::rename(&tmp, dest)
            .map_err(|e| HdbError::io(ErrorCode::Rename, dest, "failed to rename copy into place", &e))?;
        sync_dir(parent_dir(dest))
            .map_err(|e| HdbError::io(ErrorCode::Sync, dest, "failed to sync directory", &e))?;
        tracing::info!(from = %self.path.display(), to = %dest.display(), "copied database");
        Ok(())
    }

    /// Tuning for a rebuild: unset fields keep the current values, except
    /// the bucket count, which scales with the record count.
    fn rebuild_tuning(&self, params: &OptimizeParams) -> Tuning {
        Tuning {
            bnum: params.bnum.unwrap_or_else(|| (self.header.rnum * 2 + 1).max(DEFAULT_BNUM)),
            apow: params.apow.unwrap_or(self.header.apow),
            fpow: params.fpow.unwrap_or(self.header.fpow),
            opts: params.opts.unwrap_or(self.header.opts),
        }
    }

    /// Copy every live record into a fresh file at `tmp`.
    fn write_rebuilt(&self, tmp: &Path, tuning: &Tuning) -> HdbResult<()> {
        let settings = CoreSettings {
            xmsiz: 0,
            dfunit: 0,
            custom_codec: self.settings.custom_codec.clone(),
        };
        let mode = OpenMode::WRITER | OpenMode::CREAT | OpenMode::TRUNC | OpenMode::NOLCK;
        let mut target = Core::open(tmp, mode, tuning, false, settings)?;
        self.scan(|offset, header| {
            let key = self.read_key(offset, header)?;
            let value = self.read_value(offset, header)?;
            target.put(&key, &value, PutMode::Overwrite)?;
            Ok(true)
        })?;
        target.set_opaque(&self.header.opaque)?;
        target.close()?;

        let file = OpenOptions::new()
            .write(true)
            .open(tmp)
            .map_err(|e| HdbError::io(ErrorCode::Open, tmp, "failed to reopen rebuilt file", &e))?;
        durable_sync(&file).map_err(|e| HdbError::io(ErrorCode::Sync, tmp, "failed to sync rebuilt file", &e))
    }
}

/// Rebuild the open file with new tuning and swap it in place. On success
/// `slot` holds the reopened file; if the swap fails after the old file
/// was closed, `slot` is left empty.
pub(crate) fn optimize(slot: &mut Option<Core>, params: &OptimizeParams) -> HdbResult<()> {
    let core = slot.as_mut().ok_or_else(|| HdbError::invalid("database is not open"))?;
    core.require_writer()?;
    if core.tran_active() {
        return Err(HdbError::invalid("optimize is not allowed inside a transaction"));
    }
    core.storage.flush()?;

    let tuning = core.rebuild_tuning(params);
    tuning.validate().map_err(HdbError::invalid)?;
    let tmp = sibling_path(&core.path, ".tmp");
    if let Err(err) = core.write_rebuilt(&tmp, &tuning) {
        let _ = std::fs::remove_file(&tmp);
        return Err(err);
    }

    let Some(old) = slot.take() else {
        return Err(HdbError::invalid("database is not open"));
    };
    let path = old.path.clone();
    let mode = OpenMode(old.mode.bits() & !OpenMode::TRUNC.bits());
    let settings = old.settings.clone();
    let rnum = old.header.rnum;
    old.close()?;

    let swapped = std::fs::rename(&tmp, &path)
        .map_err(|e| HdbError::io(ErrorCode::Rename, &path, "failed to rename rebuilt file", &e))
        .and_then(|_| {
            sync_dir(parent_dir(&path))
                .map_err(|e| HdbError::io(ErrorCode::Sync, &path, "failed to sync directory", &e))
        });
    // Reopen whichever file is in place, so a failed swap keeps the handle.
    *slot = Some(Core::open(&path, mode, &tuning, false, settings)?);
    swapped?;

    tracing::info!(path = %path.display(), rnum, bnum = tuning.bnum, "optimized database");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_core(dir: &TempDir) -> Core {
        Core::open(
            &dir.path().join("casket.hkh"),
            OpenMode::default(),
            &Tuning::small(),
            true,
            CoreSettings::default(),
        )
        .unwrap()
    }

    fn fragment(core: &mut Core) {
        for i in 0..50u32 {
            core.put(format!("key{:03}", i).as_bytes(), &vec![i as u8; 40], PutMode::Overwrite).unwrap();
        }
        for i in (0..50u32).step_by(2) {
            core.out(format!("key{:03}", i).as_bytes()).unwrap();
        }
    }

    fn check_survivors(core: &Core) {
        assert_eq!(core.header.rnum, 25);
        for i in (1..50u32).step_by(2) {
            assert_eq!(core.get(format!("key{:03}", i).as_bytes()).unwrap(), Some(vec![i as u8; 40]));
        }
    }

    #[test]
    fn test_full_defrag_removes_all_holes() {
        let dir = TempDir::new().unwrap();
        let mut core = open_core(&dir);
        fragment(&mut core);
        let before = core.storage.fsiz();

        core.defrag(0).unwrap();
        assert!(core.storage.fsiz() < before);
        assert!(core.pool.is_empty());
        check_survivors(&core);
    }

    #[test]
    fn test_incremental_defrag_converges() {
        let dir = TempDir::new().unwrap();
        let mut core = open_core(&dir);
        fragment(&mut core);
        for _ in 0..100 {
            core.defrag(3).unwrap();
        }
        assert!(core.pool.is_empty());
        check_survivors(&core);
    }

    #[test]
    fn test_rebuild_index_restores_chains() {
        let dir = TempDir::new().unwrap();
        let mut core = open_core(&dir);
        fragment(&mut core);
        core.rebuild_index().unwrap();
        check_survivors(&core);
        assert_eq!(core.pool.len(), 25);
    }

    #[test]
    fn test_vanish() {
        let dir = TempDir::new().unwrap();
        let mut core = open_core(&dir);
        fragment(&mut core);
        core.vanish().unwrap();
        assert_eq!(core.header.rnum, 0);
        assert_eq!(core.storage.fsiz(), core.layout.frec);
        assert_eq!(core.get(b"key001").unwrap(), None);
        assert_eq!(core.bnum_used().unwrap(), 0);
    }

    #[test]
    fn test_optimize_swaps_in_rebuilt_file() {
        let dir = TempDir::new().unwrap();
        let mut slot = Some(open_core(&dir));
        if let Some(core) = slot.as_mut() {
            fragment(core);
            core.set_opaque(b"meta").unwrap();
        }

        let params = OptimizeParams { bnum: Some(101), ..OptimizeParams::default() };
        optimize(&mut slot, &params).unwrap();

        let core = slot.as_ref().unwrap();
        assert_eq!(core.header.bnum, 101);
        assert_eq!(&core.header.opaque[..4], b"meta");
        assert!(core.pool.is_empty());
        check_survivors(core);
        assert!(!dir.path().join("casket.hkh.tmp").exists());
    }

    #[test]
    fn test_defrag_cursor_survives_reuse_of_coalesced_block() {
        let dir = TempDir::new().unwrap();
        let tuning = Tuning { fpow: 1, ..Tuning::small() };
        let mut core =
            Core::open(&dir.path().join("casket.hkh"), OpenMode::default(), &tuning, true, CoreSettings::default())
                .unwrap();
        // 20-byte header + 1-byte key + 43-byte value = one 64-byte block each
        for key in [b"a", b"b", b"c", b"d", b"e", b"f"] {
            core.put(key, &[key[0]; 43], PutMode::Overwrite).unwrap();
        }
        let frec = core.layout.frec;

        core.out(b"c").unwrap();
        core.defrag(1).unwrap();
        assert_eq!(core.dfcur, frec + 3 * 64);

        // Pool holds two entries; freeing a third merges d's old block
        // with the defrag hole behind it.
        core.out(b"d").unwrap();
        core.out(b"a").unwrap();
        core.put(b"g", &[b'g'; 107], PutMode::Overwrite).unwrap();
        assert_eq!(core.dfcur, frec + 2 * 64);
        assert!(matches!(core.read_block_kind(core.dfcur).unwrap(), BlockKind::Record { rsiz: 128 }));

        core.defrag(1).unwrap();
        core.put(b"h", b"after", PutMode::Overwrite).unwrap();
        core.defrag(0).unwrap();
        assert_eq!(core.header.rnum, 5);
        for key in [b"b", b"e", b"f"] {
            assert_eq!(core.get(key).unwrap(), Some(vec![key[0]; 43]));
        }
        assert_eq!(core.get(b"g").unwrap(), Some(vec![b'g'; 107]));
        assert_eq!(core.get(b"h").unwrap(), Some(b"after".to_vec()));
        assert_eq!(core.header.flags & crate::format::FLAG_FATAL, 0);
    }
}
