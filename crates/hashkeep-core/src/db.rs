//! Database handle
//!
//! [`HashDb`] binds at most one open file. Configuration setters take
//! `&mut self` and only work while the handle is closed; everything else
//! takes `&self`, so one handle can be shared between threads.
//!
//! Without [`HashDb::set_mutex`] the handle does not wait for itself: a call
//! that finds another call in progress fails with [`ErrorCode::Thread`].
//! With it, calls queue on an internal reader/writer lock.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use hashbrown::HashSet;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::cache::{CacheStats, RecordCache};
use crate::codec::ValueCodec;
use crate::config::{HandleOptions, OpenMode, OptimizeParams, Options, Tuning};
use crate::engine::{Core, CoreSettings, PutMode};
use crate::error::{ErrorCode, HdbError, HdbResult};
use crate::format::OPAQUE_SIZE;
use crate::iter::Keys;
use crate::maintenance;
use crate::platform::write_debug_line;

/// Value callers may substitute for a failed [`HashDb::add_int`].
pub const INT_SENTINEL: i32 = i32::MIN;
/// Value callers may substitute for a failed [`HashDb::add_double`].
pub const DOUBLE_SENTINEL: f64 = f64::NAN;

/// Poll interval while waiting for another transaction to finish
const TRAN_WAIT: Duration = Duration::from_millis(1);

fn not_open() -> HdbError {
    HdbError::invalid("database is not open")
}

/// Embedded hash database handle.
pub struct HashDb {
    tuning: Tuning,
    /// `tune` was called explicitly
    tuned: bool,
    options: HandleOptions,
    mutex: bool,
    codec: Option<Arc<dyn ValueCodec>>,
    core: RwLock<Option<Core>>,
    cache: Mutex<RecordCache>,
    ecode: AtomicU8,
    /// Raw descriptor receiving error lines, -1 when unset
    dbgfd: AtomicI32,
    /// Threads currently inside `for_each`
    visitors: Mutex<HashSet<ThreadId>>,
}

/// Unregisters a `for_each` visitor thread, even on unwind.
struct VisitGuard<'a> {
    visitors: &'a Mutex<HashSet<ThreadId>>,
    id: ThreadId,
}

impl Drop for VisitGuard<'_> {
    fn drop(&mut self) {
        self.visitors.lock().remove(&self.id);
    }
}

impl Default for HashDb {
    fn default() -> Self {
        Self::new()
    }
}

impl HashDb {
    /// Unopened handle with default tuning.
    pub fn new() -> Self {
        Self {
            tuning: Tuning::default(),
            tuned: false,
            options: HandleOptions::default(),
            mutex: false,
            codec: None,
            core: RwLock::new(None),
            cache: Mutex::new(RecordCache::new(0)),
            ecode: AtomicU8::new(ErrorCode::Success as u8),
            dbgfd: AtomicI32::new(-1),
            visitors: Mutex::new(HashSet::new()),
        }
    }

    // ---- error bookkeeping ----

    fn record_error(&self, err: &HdbError) {
        self.ecode.store(err.code as u8, Ordering::Relaxed);
        let fd = self.dbgfd.load(Ordering::Relaxed);
        if fd >= 0 {
            write_debug_line(fd, &format!("hashkeep: {}", err));
        }
        tracing::trace!(code = ?err.code, error = %err, "operation failed");
    }

    fn track<T>(&self, result: HdbResult<T>) -> HdbResult<T> {
        if let Err(err) = &result {
            self.record_error(err);
        }
        result
    }

    /// Record a soft failure (miss, existing key) that is not returned as
    /// an error.
    fn note(&self, code: ErrorCode, message: &str) {
        self.record_error(&HdbError::new(code, message));
    }

    /// Code of the last failure on this handle.
    pub fn ecode(&self) -> ErrorCode {
        ErrorCode::from_u8(self.ecode.load(Ordering::Relaxed))
    }

    /// Send a line for every failure to `fd` (unix); negative disables.
    pub fn set_dbgfd(&self, fd: i32) {
        self.dbgfd.store(fd.max(-1), Ordering::Relaxed);
    }

    pub fn dbgfd(&self) -> Option<i32> {
        let fd = self.dbgfd.load(Ordering::Relaxed);
        (fd >= 0).then_some(fd)
    }

    // ---- locking ----

    fn enter(&self) -> HdbResult<()> {
        if self.visitors.lock().contains(&thread::current().id()) {
            return Err(HdbError::invalid("call into the handle from inside for_each"));
        }
        Ok(())
    }

    fn busy() -> HdbError {
        HdbError::new(ErrorCode::Thread, "handle is busy; call set_mutex before sharing it between threads")
    }

    fn read_core(&self) -> HdbResult<RwLockReadGuard<'_, Option<Core>>> {
        self.enter()?;
        if self.mutex {
            Ok(self.core.read())
        } else {
            self.core.try_read().ok_or_else(Self::busy)
        }
    }

    fn write_core(&self) -> HdbResult<RwLockWriteGuard<'_, Option<Core>>> {
        self.enter()?;
        if self.mutex {
            Ok(self.core.write())
        } else {
            self.core.try_write().ok_or_else(Self::busy)
        }
    }

    fn with_core<T>(&self, f: impl FnOnce(&Core) -> HdbResult<T>) -> HdbResult<T> {
        let result = self.read_core().and_then(|guard| match guard.as_ref() {
            Some(core) => f(core),
            None => Err(not_open()),
        });
        self.track(result)
    }

    fn with_core_mut<T>(&self, f: impl FnOnce(&mut Core) -> HdbResult<T>) -> HdbResult<T> {
        let result = self.write_core().and_then(|mut guard| match guard.as_mut() {
            Some(core) => {
                let result = f(core);
                if let Err(err) = &result {
                    if err.code.is_fatal() && core.is_writer() {
                        core.mark_fatal();
                    }
                }
                result
            }
            None => Err(not_open()),
        });
        self.track(result)
    }

    /// Read a property of the open file; `None` when closed or busy.
    fn peek<T>(&self, f: impl FnOnce(&Core) -> T) -> Option<T> {
        self.read_core().ok()?.as_ref().map(f)
    }

    // ---- configuration (closed handle only) ----

    fn require_closed(&mut self, what: &str) -> HdbResult<()> {
        let result = if self.core.get_mut().is_some() {
            Err(HdbError::invalid(format!("{} is only allowed before open", what)))
        } else {
            Ok(())
        };
        self.track(result)
    }

    /// Set the layout used when a file is created.
    pub fn tune(&mut self, tuning: Tuning) -> HdbResult<()> {
        self.require_closed("tune")?;
        self.track(tuning.validate().map_err(HdbError::invalid))?;
        self.tuning = tuning;
        self.tuned = true;
        Ok(())
    }

    /// Record cache capacity; 0 disables caching.
    pub fn set_cache(&mut self, rcnum: usize) -> HdbResult<()> {
        self.require_closed("set_cache")?;
        self.options.rcnum = rcnum;
        *self.cache.get_mut() = RecordCache::new(rcnum);
        Ok(())
    }

    /// Size of the extra mapped region; 0 disables it.
    pub fn set_xmsiz(&mut self, xmsiz: usize) -> HdbResult<()> {
        self.require_closed("set_xmsiz")?;
        self.options.xmsiz = xmsiz;
        Ok(())
    }

    /// Freed blocks between automatic defrag steps; 0 disables.
    pub fn set_dfunit(&mut self, dfunit: u32) -> HdbResult<()> {
        self.require_closed("set_dfunit")?;
        self.options.dfunit = dfunit;
        Ok(())
    }

    /// Let concurrent calls wait for each other instead of failing.
    pub fn set_mutex(&mut self) -> HdbResult<()> {
        self.require_closed("set_mutex")?;
        self.mutex = true;
        Ok(())
    }

    /// Register the codec for files created with [`Options::EXCODEC`].
    pub fn set_codec(&mut self, codec: Arc<dyn ValueCodec>) -> HdbResult<()> {
        self.require_closed("set_codec")?;
        self.codec = Some(codec);
        Ok(())
    }

    pub fn has_mutex(&self) -> bool {
        self.mutex
    }

    // ---- lifecycle ----

    /// Open `path` in `mode`.
    pub fn open<P: AsRef<Path>>(&self, path: P, mode: OpenMode) -> HdbResult<()> {
        let result = self.write_core().and_then(|mut guard| {
            if guard.is_some() {
                return Err(HdbError::invalid("handle is already open"));
            }
            let settings = CoreSettings {
                xmsiz: self.options.xmsiz,
                dfunit: self.options.dfunit,
                custom_codec: self.codec.clone(),
            };
            let core = Core::open(path.as_ref(), mode, &self.tuning, self.tuned, settings)?;
            self.cache.lock().clear();
            *guard = Some(core);
            Ok(())
        });
        self.track(result)
    }

    /// Flush and release the file. An active transaction is aborted.
    pub fn close(&self) -> HdbResult<()> {
        let result = self.write_core().and_then(|mut guard| {
            let core = guard.take().ok_or_else(not_open)?;
            self.cache.lock().clear();
            core.close()
        });
        self.track(result)
    }

    pub fn is_open(&self) -> bool {
        self.peek(|_| ()).is_some()
    }

    // ---- records ----

    /// Store a record, replacing any existing value.
    pub fn put(&self, key: &[u8], value: &[u8]) -> HdbResult<()> {
        self.with_core_mut(|core| {
            let mut cache = self.cache.lock();
            cache.invalidate(key);
            core.put(key, value, PutMode::Overwrite)?;
            cache.put(key, value);
            Ok(())
        })
    }

    /// Store a record only if the key is new. Returns `false` (and sets
    /// [`ErrorCode::Keep`]) when it already exists.
    pub fn put_keep(&self, key: &[u8], value: &[u8]) -> HdbResult<bool> {
        let stored = self.with_core_mut(|core| {
            let stored = core.put(key, value, PutMode::Keep)?;
            if stored {
                self.cache.lock().put(key, value);
            }
            Ok(stored)
        })?;
        if !stored {
            self.note(ErrorCode::Keep, "record already exists");
        }
        Ok(stored)
    }

    /// Append `value` to the existing value, creating the record if absent.
    pub fn put_cat(&self, key: &[u8], value: &[u8]) -> HdbResult<()> {
        self.with_core_mut(|core| {
            self.cache.lock().invalidate(key);
            core.put(key, value, PutMode::Concat).map(|_| ())
        })
    }

    /// Store a record through the write-behind buffer.
    pub fn put_async(&self, key: &[u8], value: &[u8]) -> HdbResult<()> {
        self.with_core_mut(|core| {
            self.cache.lock().invalidate(key);
            core.put(key, value, PutMode::Async).map(|_| ())
        })
    }

    /// Remove a record; a missing key is [`ErrorCode::NoRec`].
    pub fn out(&self, key: &[u8]) -> HdbResult<()> {
        self.with_core_mut(|core| {
            self.cache.lock().invalidate(key);
            if core.out(key)? {
                Ok(())
            } else {
                Err(HdbError::no_record())
            }
        })
    }

    /// Value of `key`; `None` (with [`ErrorCode::NoRec`]) when absent.
    pub fn get(&self, key: &[u8]) -> HdbResult<Option<Vec<u8>>> {
        let value = self.with_core(|core| {
            if let Some(value) = self.cache.lock().get(key) {
                return Ok(Some(value));
            }
            let value = core.get(key)?;
            if let Some(value) = &value {
                self.cache.lock().put(key, value);
            }
            Ok(value)
        })?;
        if value.is_none() {
            self.note(ErrorCode::NoRec, "no record found");
        }
        Ok(value)
    }

    /// Size of the value of `key`; `None` (with [`ErrorCode::NoRec`]) when
    /// absent.
    pub fn vsiz(&self, key: &[u8]) -> HdbResult<Option<usize>> {
        let size = self.with_core(|core| {
            if let Some(value) = self.cache.lock().get(key) {
                return Ok(Some(value.len()));
            }
            core.vsiz(key)
        })?;
        if size.is_none() {
            self.note(ErrorCode::NoRec, "no record found");
        }
        Ok(size)
    }

    pub fn contains(&self, key: &[u8]) -> HdbResult<bool> {
        self.with_core(|core| Ok(core.locate(key)?.is_some()))
    }

    /// Add `delta` to a 4-byte integer record, creating it if absent.
    /// A value of another size is [`ErrorCode::Keep`], overflow is
    /// [`ErrorCode::Misc`].
    pub fn add_int(&self, key: &[u8], delta: i32) -> HdbResult<i32> {
        self.with_core_mut(|core| {
            let mut cache = self.cache.lock();
            cache.invalidate(key);
            let sum = core.add_int(key, delta)?;
            cache.put(key, &sum.to_ne_bytes());
            Ok(sum)
        })
    }

    /// Add `delta` to an 8-byte double record, creating it if absent.
    pub fn add_double(&self, key: &[u8], delta: f64) -> HdbResult<f64> {
        self.with_core_mut(|core| {
            let mut cache = self.cache.lock();
            cache.invalidate(key);
            let sum = core.add_double(key, delta)?;
            cache.put(key, &sum.to_ne_bytes());
            Ok(sum)
        })
    }

    // ---- iteration ----

    /// Reset the cursor to before the first record.
    pub fn iter_init(&self) -> HdbResult<()> {
        self.with_core_mut(|core| {
            core.iter_init();
            Ok(())
        })
    }

    /// Next key, or `None` (with [`ErrorCode::NoRec`]) at the end.
    pub fn iter_next(&self) -> HdbResult<Option<Vec<u8>>> {
        let key = self.with_core_mut(|core| Ok(core.iter_next()?.map(|entry| entry.key)))?;
        if key.is_none() {
            self.note(ErrorCode::NoRec, "end of iteration");
        }
        Ok(key)
    }

    /// Next key and value.
    pub fn iter_next_pair(&self) -> HdbResult<Option<(Vec<u8>, Vec<u8>)>> {
        let pair = self.with_core_mut(|core| match core.iter_next()? {
            Some(entry) => {
                let value = core.read_value(entry.offset, &entry.header)?;
                Ok(Some((entry.key, value)))
            }
            None => Ok(None),
        })?;
        if pair.is_none() {
            self.note(ErrorCode::NoRec, "end of iteration");
        }
        Ok(pair)
    }

    /// Position the cursor so the next call yields `key`.
    pub fn iter_init_at(&self, key: &[u8]) -> HdbResult<()> {
        self.with_core_mut(|core| if core.iter_init_at(key)? { Ok(()) } else { Err(HdbError::no_record()) })
    }

    /// Position the cursor so the next call yields the key after `key`.
    pub fn iter_init_after(&self, key: &[u8]) -> HdbResult<()> {
        self.with_core_mut(|core| if core.iter_init_after(key)? { Ok(()) } else { Err(HdbError::no_record()) })
    }

    /// Reset the cursor and return a pull iterator over keys.
    pub fn keys(&self) -> HdbResult<Keys<'_>> {
        self.iter_init()?;
        Ok(Keys::new(self))
    }

    /// Call `visitor` with every key and value while holding the read
    /// lock. The visitor returns `false` to stop. Calls back into this
    /// handle from the visitor fail with [`ErrorCode::Invalid`].
    pub fn for_each<F>(&self, mut visitor: F) -> HdbResult<()>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        self.with_core(|core| {
            let id = thread::current().id();
            self.visitors.lock().insert(id);
            let _guard = VisitGuard { visitors: &self.visitors, id };
            core.scan(|offset, header| {
                let key = core.read_key(offset, header)?;
                let value = core.read_value(offset, header)?;
                Ok(visitor(&key, &value))
            })
        })
    }

    /// Keys starting with `prefix`; `max` bounds the result.
    pub fn fwm_keys(&self, prefix: &[u8], max: Option<usize>) -> HdbResult<Vec<Vec<u8>>> {
        self.with_core(|core| core.fwm_keys(prefix, max))
    }

    // ---- persistence and maintenance ----

    /// Flush everything and force it to stable storage.
    pub fn sync(&self) -> HdbResult<()> {
        self.mem_sync(true)
    }

    /// Flush buffered writes, pool and header to the file; `phys` also
    /// forces a durable sync.
    pub fn mem_sync(&self, phys: bool) -> HdbResult<()> {
        self.with_core_mut(|core| {
            core.require_writer()?;
            core.persist_meta()?;
            if phys {
                core.storage.sync(true)?;
            }
            Ok(())
        })
    }

    /// Drop every cached record.
    pub fn cache_clear(&self) -> HdbResult<()> {
        self.with_core(|_| {
            self.cache.lock().clear();
            Ok(())
        })
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.lock().stats()
    }

    /// Rebuild the file, optionally with new tuning.
    pub fn optimize(&self, params: OptimizeParams) -> HdbResult<()> {
        let result = self.write_core().and_then(|mut guard| {
            self.cache.lock().clear();
            maintenance::optimize(&mut guard, &params)
        });
        self.track(result)
    }

    /// Remove every record.
    pub fn vanish(&self) -> HdbResult<()> {
        self.with_core_mut(|core| {
            self.cache.lock().clear();
            core.vanish()
        })
    }

    /// Write a consistent copy of the last committed state to `dest`.
    pub fn copy<P: AsRef<Path>>(&self, dest: P) -> HdbResult<()> {
        self.with_core_mut(|core| core.copy_to(dest.as_ref()))
    }

    /// Run `step` defrag moves; `step <= 0` defragments the whole file.
    pub fn defrag(&self, step: i64) -> HdbResult<()> {
        self.with_core_mut(|core| core.defrag(step))
    }

    // ---- transactions ----

    /// Start a transaction. If one is already active this waits for it
    /// when the handle has a mutex and a blocking lock mode, and fails
    /// otherwise.
    pub fn tran_begin(&self) -> HdbResult<()> {
        let result = loop {
            let mut guard = match self.write_core() {
                Ok(guard) => guard,
                Err(err) => break Err(err),
            };
            let Some(core) = guard.as_mut() else {
                break Err(not_open());
            };
            if !core.tran_active() {
                break core.tran_begin();
            }
            let nonblocking = core.mode.contains(OpenMode::LCKNB);
            if self.mutex && !nonblocking {
                drop(guard);
                thread::sleep(TRAN_WAIT);
                continue;
            }
            let code = if nonblocking { ErrorCode::Lock } else { ErrorCode::Invalid };
            break Err(HdbError::new(code, "a transaction is already active"));
        };
        self.track(result)
    }

    /// Whether a transaction is open on this handle.
    pub fn tran_active(&self) -> bool {
        self.peek(|core| core.tran_active()).unwrap_or(false)
    }

    /// Make the transaction's writes permanent.
    pub fn tran_commit(&self) -> HdbResult<()> {
        self.with_core_mut(|core| core.tran_commit())
    }

    /// Restore the file to its image at `tran_begin`.
    pub fn tran_abort(&self) -> HdbResult<()> {
        self.with_core_mut(|core| {
            self.cache.lock().clear();
            core.tran_abort()
        })
    }

    /// End the transaction keeping the current state, without a restore
    /// point. Only sound when nothing was written since `tran_begin`.
    pub fn tran_void(&self) -> HdbResult<()> {
        self.with_core_mut(|core| core.tran_void())
    }

    // ---- opaque area ----

    /// The 128-byte application area of the header.
    pub fn opaque(&self) -> HdbResult<[u8; OPAQUE_SIZE]> {
        self.with_core(|core| Ok(core.header.opaque))
    }

    /// Replace the application area; shorter input is zero-padded.
    pub fn set_opaque(&self, data: &[u8]) -> HdbResult<()> {
        if data.len() > OPAQUE_SIZE {
            let err = HdbError::invalid(format!("opaque data is limited to {} bytes", OPAQUE_SIZE));
            return self.track(Err(err));
        }
        self.with_core_mut(|core| core.set_opaque(data))
    }

    // ---- introspection ----

    pub fn path(&self) -> Option<PathBuf> {
        self.peek(|core| core.path.clone())
    }

    pub fn bnum(&self) -> u64 {
        self.peek(|core| core.header.bnum).unwrap_or(0)
    }

    /// Bucket slots currently heading a chain.
    pub fn bnum_used(&self) -> HdbResult<u64> {
        self.with_core(|core| core.bnum_used())
    }

    pub fn align(&self) -> u64 {
        self.peek(|core| core.layout.align()).unwrap_or(0)
    }

    pub fn fbpmax(&self) -> usize {
        self.peek(|core| core.layout.fbpmax).unwrap_or(0)
    }

    /// Size of the extra mapped region (configured value while closed).
    pub fn xmsiz(&self) -> usize {
        self.peek(|core| core.storage.map_size()).unwrap_or(self.options.xmsiz)
    }

    pub fn dfunit(&self) -> u32 {
        self.options.dfunit
    }

    pub fn rnum(&self) -> u64 {
        self.peek(|core| core.header.rnum).unwrap_or(0)
    }

    pub fn fsiz(&self) -> u64 {
        self.peek(|core| core.storage.fsiz()).unwrap_or(0)
    }

    pub fn inode(&self) -> u64 {
        self.peek(|core| core.header.inode).unwrap_or(0)
    }

    /// Modification time recorded at the last header write.
    pub fn mtime(&self) -> u64 {
        self.peek(|core| core.header.mtime).unwrap_or(0)
    }

    pub fn omode(&self) -> Option<OpenMode> {
        self.peek(|core| core.mode)
    }

    pub fn opts(&self) -> Options {
        self.peek(|core| core.header.opts).unwrap_or(self.tuning.opts)
    }

    /// Header flag byte.
    pub fn flags(&self) -> u8 {
        self.peek(|core| core.header.flags).unwrap_or(0)
    }
}

impl Drop for HashDb {
    fn drop(&mut self) {
        if let Some(core) = self.core.get_mut().take() {
            if let Err(err) = core.close() {
                tracing::warn!(error = %err, "failed to close database on drop");
            }
        }
    }
}
