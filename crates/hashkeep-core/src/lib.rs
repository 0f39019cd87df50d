//! HashKeep Core: single-file hash database engine
//!
//! An embedded key/value store that keeps everything in one file: a fixed
//! header, an array of hash buckets, and variable-length records chained
//! off those buckets. Freed space is recycled through an in-memory free
//! block pool and can be reclaimed by defragmentation or a full rebuild.
//!
//! # Architecture
//!
//! - **Lookup**: bucket hash selects a chain, a one-byte check hash skips
//!   most foreign keys without comparing them
//! - **Writes**: in place when the new record fits its block, otherwise
//!   from the free pool or appended at the end of the file
//! - **Transactions**: a side-file journal of pre-images; abort or a crash
//!   restores the file byte-for-byte
//! - **Compression**: optional per-record codec (deflate, bzip2, snappy or
//!   a registered custom codec) chosen when the file is created
//!
//! ```no_run
//! use hashkeep_core::{HashDb, OpenMode};
//!
//! let db = HashDb::new();
//! db.open("casket.hkh", OpenMode::default())?;
//! db.put(b"hop", b"step")?;
//! assert_eq!(db.get(b"hop")?, Some(b"step".to_vec()));
//! db.close()?;
//! # Ok::<(), hashkeep_core::HdbError>(())
//! ```

pub mod cache;
pub mod codec;
pub mod config;
mod db;
mod engine;
pub mod error;
pub mod format;
mod freepool;
mod iter;
mod maintenance;
mod platform;
mod storage;
pub mod wal;

// Re-export key types for convenience
pub use cache::CacheStats;
pub use codec::ValueCodec;
pub use config::{HandleOptions, OpenMode, OptimizeParams, Options, Tuning};
pub use db::{HashDb, DOUBLE_SENTINEL, INT_SENTINEL};
pub use error::{ErrorCode, HdbError, HdbResult};
pub use iter::Keys;
pub use wal::journal_path;
