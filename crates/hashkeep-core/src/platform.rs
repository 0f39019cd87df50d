//! Platform-specific primitives: durable sync, advisory file locks,
//! file identity and debug output.
//!
//! Each platform has different guarantees for when data is actually written
//! to persistent storage. `durable_sync` maps to the strongest durability
//! guarantee available on each platform.

use std::fs::File;
use std::io;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Ensures data is durably written to persistent storage before returning.
///
/// Platform behaviors:
/// - Linux: fdatasync() - syncs data but not metadata
/// - macOS/iOS: fcntl(F_FULLFSYNC) - bypasses the disk cache
/// - Windows: FlushFileBuffers()
/// - Other: file.sync_data()
///
/// The caller must not hold locks that other threads need for progress; the
/// call may block for a long time under heavy I/O.
pub fn durable_sync(file: &File) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fdatasync operates on a valid descriptor obtained from a live File.
        let result = unsafe { libc::fdatasync(fd) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        // Plain fsync() on Apple platforms stops at the drive's volatile cache.
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fcntl(F_FULLFSYNC) operates on a valid descriptor obtained from a live File.
        let result = unsafe { libc::fcntl(fd, libc::F_FULLFSYNC) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::FlushFileBuffers;
        let handle = file.as_raw_handle();
        // SAFETY: FlushFileBuffers is called on a valid handle obtained from a live File.
        let result = unsafe { FlushFileBuffers(handle as *mut _) };
        if result != 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios", target_os = "windows")))]
    {
        file.sync_data()
    }
}

/// Read exactly `buf.len()` bytes at `offset` without moving a shared cursor.
pub fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
        file.read_exact_at(buf, offset)
    }

    #[cfg(windows)]
    {
        use std::os::windows::fs::FileExt;
        let mut done = 0usize;
        while done < buf.len() {
            match file.seek_read(&mut buf[done..], offset + done as u64) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short read")),
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Write all of `data` at `offset` without moving a shared cursor.
pub fn write_all_at(file: &File, data: &[u8], offset: u64) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
        file.write_all_at(data, offset)
    }

    #[cfg(windows)]
    {
        use std::os::windows::fs::FileExt;
        let mut done = 0usize;
        while done < data.len() {
            match file.seek_write(&data[done..], offset + done as u64) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "short write")),
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Sync a directory so a completed rename survives power loss.
pub fn sync_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        let handle = File::open(dir)?;
        durable_sync(&handle)
    }

    #[cfg(not(unix))]
    {
        // Directory handles cannot be synced on this platform.
        let _ = dir;
        Ok(())
    }
}

/// Outcome of a lock attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    /// Non-blocking attempt found the lock held elsewhere
    Contended,
}

/// Take an advisory whole-file lock: shared for readers, exclusive for
/// writers. With `nonblocking` the call reports contention instead of
/// waiting. The lock is released when the descriptor is closed.
pub fn lock_file(file: &File, exclusive: bool, nonblocking: bool) -> io::Result<LockOutcome> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let mut op = if exclusive { libc::LOCK_EX } else { libc::LOCK_SH };
        if nonblocking {
            op |= libc::LOCK_NB;
        }
        loop {
            // SAFETY: flock operates on a valid descriptor obtained from a live File.
            let result = unsafe { libc::flock(file.as_raw_fd(), op) };
            if result == 0 {
                return Ok(LockOutcome::Acquired);
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return Ok(LockOutcome::Contended),
                _ => return Err(err),
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = (file, exclusive, nonblocking);
        Ok(LockOutcome::Acquired)
    }
}

/// Release a lock taken with [`lock_file`].
pub fn unlock_file(file: &File) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: flock operates on a valid descriptor obtained from a live File.
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    {
        let _ = file;
        Ok(())
    }
}

/// Inode number and modification time (seconds since epoch) of a file.
pub fn file_identity(file: &File) -> io::Result<(u64, u64)> {
    let meta = file.metadata()?;

    #[cfg(unix)]
    let inode = {
        use std::os::unix::fs::MetadataExt;
        meta.ino()
    };
    #[cfg(not(unix))]
    let inode = 0u64;

    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs());
    Ok((inode, mtime))
}

/// Current wall clock in seconds since epoch.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// Write one line to a raw debug descriptor. Failures are ignored; debug
/// output must never change the outcome of an operation.
pub fn write_debug_line(fd: i32, line: &str) {
    #[cfg(unix)]
    {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        // SAFETY: the buffer is valid for buf.len() bytes; an invalid fd only yields EBADF.
        let _ = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    }

    #[cfg(not(unix))]
    {
        let _ = (fd, line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_durable_sync_success() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"test data for durable sync").unwrap();

        let result = durable_sync(file.as_file());
        assert!(result.is_ok(), "durable_sync failed: {:?}", result.err());
    }

    #[cfg(unix)]
    #[test]
    fn test_exclusive_lock_contention() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let first = File::open(file.path()).unwrap();
        let second = File::open(file.path()).unwrap();

        assert_eq!(lock_file(&first, true, true).unwrap(), LockOutcome::Acquired);
        assert_eq!(lock_file(&second, true, true).unwrap(), LockOutcome::Contended);
        unlock_file(&first).unwrap();
        assert_eq!(lock_file(&second, true, true).unwrap(), LockOutcome::Acquired);
    }

    #[test]
    fn test_positional_io() {
        let file = tempfile::tempfile().unwrap();
        write_all_at(&file, b"hello world", 0).unwrap();
        write_all_at(&file, b"W", 6).unwrap();

        let mut buf = [0u8; 5];
        read_exact_at(&file, &mut buf, 6).unwrap();
        assert_eq!(&buf, b"World");
        assert!(read_exact_at(&file, &mut buf, 8).is_err());
    }

    #[test]
    fn test_file_identity() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let (_inode, mtime) = file_identity(file.as_file()).unwrap();
        assert!(now_secs() + 1 >= mtime);
    }
}
