//! Error types for HashKeep operations
//!
//! Every failing call returns an [`HdbError`] carrying an [`ErrorCode`] from
//! the fixed code set, the file involved (when there is one) and a
//! human-readable message. The handle also remembers the code of the last
//! failure so callers can query it after the fact.

use std::error::Error;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

/// Classified error codes with stable numeric values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    /// No error
    Success = 0,
    /// Threading misuse (handle busy without mutual exclusion enabled)
    Thread = 1,
    /// Invalid operation for the current handle state
    Invalid = 2,
    /// File not found
    NoFile = 3,
    /// Permission denied
    NoPerm = 4,
    /// Invalid or corrupt metadata
    Meta = 5,
    /// Invalid or corrupt record header
    RHead = 6,
    /// Open failure
    Open = 7,
    /// Close failure
    Close = 8,
    /// Truncate failure
    Trunc = 9,
    /// Sync failure
    Sync = 10,
    /// Stat failure
    Stat = 11,
    /// Seek failure
    Seek = 12,
    /// Read failure
    Read = 13,
    /// Write failure
    Write = 14,
    /// Memory mapping failure
    Mmap = 15,
    /// Lock failure or contention
    Lock = 16,
    /// Unlink failure
    Unlink = 17,
    /// Rename failure
    Rename = 18,
    /// Directory creation failure
    Mkdir = 19,
    /// Directory removal failure
    Rmdir = 20,
    /// Record already exists
    Keep = 21,
    /// No record found
    NoRec = 22,
    /// Miscellaneous error
    Misc = 99,
}

impl ErrorCode {
    /// Short description of the code.
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::Success => "success",
            ErrorCode::Thread => "threading error",
            ErrorCode::Invalid => "invalid operation",
            ErrorCode::NoFile => "file not found",
            ErrorCode::NoPerm => "no permission",
            ErrorCode::Meta => "invalid meta data",
            ErrorCode::RHead => "invalid record header",
            ErrorCode::Open => "open error",
            ErrorCode::Close => "close error",
            ErrorCode::Trunc => "trunc error",
            ErrorCode::Sync => "sync error",
            ErrorCode::Stat => "stat error",
            ErrorCode::Seek => "seek error",
            ErrorCode::Read => "read error",
            ErrorCode::Write => "write error",
            ErrorCode::Mmap => "mmap error",
            ErrorCode::Lock => "lock error",
            ErrorCode::Unlink => "unlink error",
            ErrorCode::Rename => "rename error",
            ErrorCode::Mkdir => "mkdir error",
            ErrorCode::Rmdir => "rmdir error",
            ErrorCode::Keep => "existing record",
            ErrorCode::NoRec => "no record found",
            ErrorCode::Misc => "miscellaneous error",
        }
    }

    /// Failures during a write that may leave the file inconsistent.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ErrorCode::RHead | ErrorCode::Trunc | ErrorCode::Sync | ErrorCode::Write | ErrorCode::Mmap
        )
    }

    /// Inverse of `code as u8`; unknown values map to `Misc`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => ErrorCode::Success,
            1 => ErrorCode::Thread,
            2 => ErrorCode::Invalid,
            3 => ErrorCode::NoFile,
            4 => ErrorCode::NoPerm,
            5 => ErrorCode::Meta,
            6 => ErrorCode::RHead,
            7 => ErrorCode::Open,
            8 => ErrorCode::Close,
            9 => ErrorCode::Trunc,
            10 => ErrorCode::Sync,
            11 => ErrorCode::Stat,
            12 => ErrorCode::Seek,
            13 => ErrorCode::Read,
            14 => ErrorCode::Write,
            15 => ErrorCode::Mmap,
            16 => ErrorCode::Lock,
            17 => ErrorCode::Unlink,
            18 => ErrorCode::Rename,
            19 => ErrorCode::Mkdir,
            20 => ErrorCode::Rmdir,
            21 => ErrorCode::Keep,
            22 => ErrorCode::NoRec,
            _ => ErrorCode::Misc,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// HashKeep error with its classification and context.
#[derive(Debug, Clone)]
pub struct HdbError {
    /// Classified error code
    pub code: ErrorCode,
    /// The file path where the error occurred, if any
    pub path: Option<PathBuf>,
    /// Human-readable description
    pub message: String,
}

impl HdbError {
    /// Build an error without file context.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, path: None, message: message.into() }
    }

    /// Build an error attached to a file.
    pub fn with_path(code: ErrorCode, path: &Path, message: impl Into<String>) -> Self {
        Self { code, path: Some(path.to_path_buf()), message: message.into() }
    }

    /// Map an I/O failure of operation `code` on `path`.
    ///
    /// `NotFound` and `PermissionDenied` are reported as `NoFile`/`NoPerm`
    /// regardless of the operation that hit them.
    pub fn io(code: ErrorCode, path: &Path, context: &str, err: &io::Error) -> Self {
        let code = match err.kind() {
            io::ErrorKind::NotFound => ErrorCode::NoFile,
            io::ErrorKind::PermissionDenied => ErrorCode::NoPerm,
            _ => code,
        };
        Self::with_path(code, path, format!("{}: {}", context, err))
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Invalid, message)
    }

    pub fn no_record() -> Self {
        Self::new(ErrorCode::NoRec, "no record found")
    }

    /// Corrupt record block at `offset`.
    pub fn bad_record(path: &Path, offset: u64, reason: impl fmt::Display) -> Self {
        Self::with_path(ErrorCode::RHead, path, format!("record at offset {}: {}", offset, reason))
    }

    /// Corrupt or mismatched file metadata.
    pub fn bad_meta(path: &Path, reason: impl Into<String>) -> Self {
        Self::with_path(ErrorCode::Meta, path, reason)
    }
}

impl fmt::Display for HdbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(path) = &self.path {
            write!(f, "{} in {}: {}", self.code, path.display(), self.message)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

impl Error for HdbError {}

/// Convert std::io::Error to an unclassified I/O failure.
impl From<io::Error> for HdbError {
    fn from(err: io::Error) -> Self {
        let code = match err.kind() {
            io::ErrorKind::NotFound => ErrorCode::NoFile,
            io::ErrorKind::PermissionDenied => ErrorCode::NoPerm,
            io::ErrorKind::UnexpectedEof => ErrorCode::Read,
            _ => ErrorCode::Misc,
        };
        HdbError::new(code, err.to_string())
    }
}

/// Result type alias for HashKeep operations
pub type HdbResult<T> = Result<T, HdbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HdbError::bad_record(Path::new("/tmp/casket.hkh"), 4096, "bad magic 0x00");
        let display = format!("{}", err);
        assert!(display.contains("invalid record header"));
        assert!(display.contains("/tmp/casket.hkh"));
        assert!(display.contains("4096"));
    }

    #[test]
    fn test_io_error_classification() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err = HdbError::io(ErrorCode::Open, Path::new("x"), "open failed", &io_err);
        assert_eq!(err.code, ErrorCode::NoFile);

        let io_err = io::Error::new(io::ErrorKind::Other, "disk on fire");
        let err = HdbError::io(ErrorCode::Write, Path::new("x"), "write failed", &io_err);
        assert_eq!(err.code, ErrorCode::Write);
    }

    #[test]
    fn test_code_roundtrip() {
        for code in [ErrorCode::Thread, ErrorCode::Keep, ErrorCode::NoRec, ErrorCode::Misc] {
            assert_eq!(ErrorCode::from_u8(code as u8), code);
        }
        assert_eq!(ErrorCode::from_u8(200), ErrorCode::Misc);
    }
}
