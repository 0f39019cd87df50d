//! Configuration for HashKeep databases
//!
//! [`Tuning`] fixes the file layout at creation time, [`HandleOptions`]
//! holds per-handle memory settings, and [`OpenMode`] selects how a file is
//! opened and locked.

use std::ops::{BitOr, BitOrAssign};

/// Default number of bucket array elements
pub const DEFAULT_BNUM: u64 = 131_071;
/// Default record alignment power (16 bytes)
pub const DEFAULT_APOW: u8 = 4;
/// Default free block pool power (1024 entries)
pub const DEFAULT_FPOW: u8 = 10;
/// Default extra mapped memory size (64 MiB)
pub const DEFAULT_XMSIZ: usize = 64 * 1024 * 1024;

/// Largest accepted alignment power
pub const MAX_APOW: u8 = 16;
/// Largest accepted free block pool power
pub const MAX_FPOW: u8 = 20;

/// Tuning option flags stored in the header's options byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Options(pub u8);

impl Options {
    /// No options
    pub const NONE: Options = Options(0);
    /// 64-bit bucket array and chain links
    pub const LARGE: Options = Options(1 << 0);
    /// Compress each record with Deflate
    pub const DEFLATE: Options = Options(1 << 1);
    /// Compress each record with BZIP2
    pub const BZIP: Options = Options(1 << 2);
    /// Compress each record with Snappy
    pub const SNAPPY: Options = Options(1 << 3);
    /// Compress each record with a caller-supplied codec
    pub const EXCODEC: Options = Options(1 << 4);

    /// Mask of every codec bit
    pub const CODEC_MASK: Options = Options(0b1_1110);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: Options) -> bool {
        self.0 & other.0 == other.0
    }

    /// Width in bytes of bucket slots and chain links.
    pub fn offset_width(self) -> usize {
        if self.contains(Options::LARGE) { 8 } else { 4 }
    }

    /// Only the codec bits.
    pub fn codec_bits(self) -> u8 {
        self.0 & Options::CODEC_MASK.0
    }
}

impl BitOr for Options {
    type Output = Options;
    fn bitor(self, rhs: Options) -> Options {
        Options(self.0 | rhs.0)
    }
}

impl BitOrAssign for Options {
    fn bitor_assign(&mut self, rhs: Options) {
        self.0 |= rhs.0;
    }
}

/// Connection mode flags for [`crate::HashDb::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpenMode(pub u32);

impl OpenMode {
    /// Open as a reader
    pub const READER: OpenMode = OpenMode(1 << 0);
    /// Open as a writer
    pub const WRITER: OpenMode = OpenMode(1 << 1);
    /// Writer creating the file if missing
    pub const CREAT: OpenMode = OpenMode(1 << 2);
    /// Writer truncating any existing file
    pub const TRUNC: OpenMode = OpenMode(1 << 3);
    /// Skip the advisory file lock
    pub const NOLCK: OpenMode = OpenMode(1 << 4);
    /// Fail instead of blocking when the lock is contended
    pub const LCKNB: OpenMode = OpenMode(1 << 5);
    /// Synchronize the file on every transaction boundary
    pub const TSYNC: OpenMode = OpenMode(1 << 6);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: OpenMode) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_writer(self) -> bool {
        self.contains(OpenMode::WRITER)
    }
}

impl Default for OpenMode {
    fn default() -> Self {
        OpenMode::WRITER | OpenMode::CREAT
    }
}

impl BitOr for OpenMode {
    type Output = OpenMode;
    fn bitor(self, rhs: OpenMode) -> OpenMode {
        OpenMode(self.0 | rhs.0)
    }
}

/// File layout parameters, fixed when the file is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tuning {
    /// Number of bucket array elements
    pub bnum: u64,
    /// Record alignment as a power of two
    pub apow: u8,
    /// Free block pool capacity as a power of two
    pub fpow: u8,
    /// Option flags
    pub opts: Options,
}

impl Tuning {
    /// Small files: few thousand records, tight alignment.
    pub fn small() -> Self {
        Self { bnum: 4093, apow: 3, fpow: 8, opts: Options::NONE }
    }

    /// Large files: 64-bit offsets and a bigger bucket array.
    pub fn large() -> Self {
        Self { bnum: 1_048_573, apow: 6, fpow: 12, opts: Options::LARGE }
    }

    /// Record alignment in bytes.
    pub fn align(&self) -> u64 {
        1u64 << self.apow
    }

    /// Free block pool capacity.
    pub fn fbpmax(&self) -> usize {
        1usize << self.fpow
    }

    /// Validate all tuning parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.bnum == 0 {
            return Err("bnum must be > 0".into());
        }
        if self.apow > MAX_APOW {
            return Err(format!("apow must be <= {}", MAX_APOW));
        }
        if self.fpow > MAX_FPOW {
            return Err(format!("fpow must be <= {}", MAX_FPOW));
        }
        if self.opts.codec_bits().count_ones() > 1 {
            return Err("at most one compression option may be set".into());
        }
        if self.opts.0 & !(Options::LARGE.0 | Options::CODEC_MASK.0) != 0 {
            return Err(format!("unknown option bits 0x{:02x}", self.opts.0));
        }
        if !self.opts.contains(Options::LARGE) && self.bnum > u32::MAX as u64 {
            return Err("bnum above 2^32 requires the LARGE option".into());
        }
        Ok(())
    }
}

impl Default for Tuning {
    fn default() -> Self {
        Self { bnum: DEFAULT_BNUM, apow: DEFAULT_APOW, fpow: DEFAULT_FPOW, opts: Options::NONE }
    }
}

/// Per-handle memory settings; never stored in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleOptions {
    /// Maximum number of cached records (0 disables the cache)
    pub rcnum: usize,
    /// Size of the extra mapped memory region (0 disables it)
    pub xmsiz: usize,
    /// Freed blocks between automatic defragmentation steps (0 disables it)
    pub dfunit: u32,
}

impl Default for HandleOptions {
    fn default() -> Self {
        Self { rcnum: 0, xmsiz: DEFAULT_XMSIZ, dfunit: 0 }
    }
}

/// Parameters for [`crate::HashDb::optimize`]; `None` keeps the current
/// value, except `bnum`, which defaults to twice the record count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptimizeParams {
    pub bnum: Option<u64>,
    pub apow: Option<u8>,
    pub fpow: Option<u8>,
    pub opts: Option<Options>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_presets_valid() {
        assert!(Tuning::default().validate().is_ok());
        assert!(Tuning::small().validate().is_ok());
        assert!(Tuning::large().validate().is_ok());
    }

    #[test]
    fn test_defaults() {
        let t = Tuning::default();
        assert_eq!(t.bnum, 131_071);
        assert_eq!(t.align(), 16);
        assert_eq!(t.fbpmax(), 1024);
        assert_eq!(HandleOptions::default().xmsiz, 67_108_864);
        assert_eq!(OpenMode::default(), OpenMode::WRITER | OpenMode::CREAT);
    }

    #[test]
    fn test_rejects_two_codecs() {
        let t = Tuning { opts: Options::DEFLATE | Options::BZIP, ..Tuning::default() };
        assert!(t.validate().is_err());
    }

    #[test]
    fn test_offset_width() {
        assert_eq!(Options::NONE.offset_width(), 4);
        assert_eq!((Options::LARGE | Options::SNAPPY).offset_width(), 8);
    }
}
