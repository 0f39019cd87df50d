//! Binary format definitions for HashKeep files (format version 1)
//!
//! File layout:
//!
//! ```text
//! [0 .. 256)                 header (FileHeader)
//! [256 .. 256 + bnum * W)    bucket array, W = 4 or 8 (LARGE)
//! [.. + 8 + fbpmax * 16)     persisted free block pool
//! [frec .. fsiz)             record region, blocks aligned to 2^apow
//! ```
//!
//! All integers are little-endian. Offsets stored in bucket slots and chain
//! links are divided by the alignment, so 32-bit slots address
//! `2^(32 + apow)` bytes.

use crate::config::{Options, Tuning, MAX_APOW, MAX_FPOW};

/// Magic bytes at the start of every HashKeep file
pub const MAGIC: [u8; 8] = *b"HASHKEEP";

/// On-disk format version
pub const FORMAT_VERSION: u8 = 1;

/// Database type tag for hash databases
pub const DB_TYPE_HASH: u8 = 1;

/// Header size in bytes
pub const HEADER_SIZE: usize = 256;

/// Offset of the flag byte inside the header
pub const FLAGS_OFFSET: usize = 10;

/// Offset of the opaque application area inside the header
pub const OPAQUE_OFFSET: usize = 128;

/// Size of the opaque application area
pub const OPAQUE_SIZE: usize = 128;

/// Header flag: a writer currently has the file open
pub const FLAG_OPEN: u8 = 1 << 0;
/// Header flag: a fatal error was recorded
pub const FLAG_FATAL: u8 = 1 << 1;

/// Block magic for a live record
pub const RECORD_MAGIC: u8 = 0xC8;
/// Block magic for a free block
pub const FREE_MAGIC: u8 = 0xB0;

/// Bytes every block starts with: magic, check byte, reserved, rsiz
pub const BLOCK_PREFIX_SIZE: usize = 8;

/// Size of one persisted pool entry (u64 offset + u64 size)
pub const POOL_ENTRY_SIZE: usize = 16;
/// Size of the pool region prefix (u32 count + u32 reserved)
pub const POOL_PREFIX_SIZE: usize = 8;

/// Decoded file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub flags: u8,
    pub apow: u8,
    pub fpow: u8,
    pub opts: Options,
    pub bnum: u64,
    pub rnum: u64,
    pub fsiz: u64,
    pub frec: u64,
    pub mtime: u64,
    pub inode: u64,
    pub opaque: [u8; OPAQUE_SIZE],
}

impl FileHeader {
    /// Fresh header for an empty file with the given tuning.
    pub fn new(tuning: &Tuning) -> Self {
        let layout = Layout::from_tuning(tuning);
        Self {
            flags: 0,
            apow: tuning.apow,
            fpow: tuning.fpow,
            opts: tuning.opts,
            bnum: tuning.bnum,
            rnum: 0,
            fsiz: layout.frec,
            frec: layout.frec,
            mtime: 0,
            inode: 0,
            opaque: [0; OPAQUE_SIZE],
        }
    }

    pub fn tuning(&self) -> Tuning {
        Tuning { bnum: self.bnum, apow: self.apow, fpow: self.fpow, opts: self.opts }
    }

    pub fn layout(&self) -> Layout {
        Layout::from_tuning(&self.tuning())
    }

    /// Serialize header to bytes for writing
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&MAGIC);
        buf[8] = FORMAT_VERSION;
        buf[9] = DB_TYPE_HASH;
        buf[FLAGS_OFFSET] = self.flags;
        buf[11] = self.apow;
        buf[12] = self.fpow;
        buf[13] = self.opts.bits();
        buf[16..24].copy_from_slice(&self.bnum.to_le_bytes());
        buf[24..32].copy_from_slice(&self.rnum.to_le_bytes());
        buf[32..40].copy_from_slice(&self.fsiz.to_le_bytes());
        buf[40..48].copy_from_slice(&self.frec.to_le_bytes());
        buf[48..56].copy_from_slice(&self.mtime.to_le_bytes());
        buf[56..64].copy_from_slice(&self.inode.to_le_bytes());
        buf[OPAQUE_OFFSET..OPAQUE_OFFSET + OPAQUE_SIZE].copy_from_slice(&self.opaque);
        buf
    }

    /// Parse and validate header bytes. `Err` carries the reason.
    pub fn from_bytes(buf: &[u8; HEADER_SIZE]) -> Result<Self, String> {
        if buf[0..8] != MAGIC {
            return Err(format!("bad magic {:02x?}", &buf[0..8]));
        }
        if buf[8] != FORMAT_VERSION {
            return Err(format!("unsupported format version {}", buf[8]));
        }
        if buf[9] != DB_TYPE_HASH {
            return Err(format!("not a hash database (type {})", buf[9]));
        }

        let mut opaque = [0u8; OPAQUE_SIZE];
        opaque.copy_from_slice(&buf[OPAQUE_OFFSET..OPAQUE_OFFSET + OPAQUE_SIZE]);

        let header = Self {
            flags: buf[FLAGS_OFFSET],
            apow: buf[11],
            fpow: buf[12],
            opts: Options(buf[13]),
            bnum: read_u64(buf, 16),
            rnum: read_u64(buf, 24),
            fsiz: read_u64(buf, 32),
            frec: read_u64(buf, 40),
            mtime: read_u64(buf, 48),
            inode: read_u64(buf, 56),
            opaque,
        };

        if header.apow > MAX_APOW || header.fpow > MAX_FPOW {
            return Err(format!("apow {} / fpow {} out of range", header.apow, header.fpow));
        }
        header.tuning().validate()?;
        let expected_frec = header.layout().frec;
        if header.frec != expected_frec {
            return Err(format!("frec {} does not match layout ({})", header.frec, expected_frec));
        }
        if header.fsiz < header.frec {
            return Err(format!("fsiz {} below first record offset {}", header.fsiz, header.frec));
        }
        Ok(header)
    }
}

/// Derived region offsets for a tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub bnum: u64,
    pub apow: u8,
    /// Width of bucket slots and chain links in bytes
    pub width: usize,
    pub fbpmax: usize,
    /// Offset of the persisted free block pool
    pub pool_offset: u64,
    /// Offset of the first record
    pub frec: u64,
}

impl Layout {
    pub fn from_tuning(tuning: &Tuning) -> Self {
        let width = tuning.opts.offset_width();
        let fbpmax = tuning.fbpmax();
        let pool_offset = HEADER_SIZE as u64 + tuning.bnum * width as u64;
        let pool_end = pool_offset + (POOL_PREFIX_SIZE + fbpmax * POOL_ENTRY_SIZE) as u64;
        Self {
            bnum: tuning.bnum,
            apow: tuning.apow,
            width,
            fbpmax,
            pool_offset,
            frec: align_up(pool_end, tuning.align()),
        }
    }

    pub fn align(&self) -> u64 {
        1u64 << self.apow
    }

    /// File offset of bucket slot `index`.
    pub fn bucket_offset(&self, index: u64) -> u64 {
        HEADER_SIZE as u64 + index * self.width as u64
    }

    /// Bytes of a record block header.
    pub fn record_header_size(&self) -> usize {
        record_header_size(self.width)
    }

    /// Pool region size in bytes.
    pub fn pool_region_size(&self) -> usize {
        POOL_PREFIX_SIZE + self.fbpmax * POOL_ENTRY_SIZE
    }

    /// Encode an absolute offset for a slot or link.
    pub fn pack_offset(&self, offset: u64) -> Option<u64> {
        let packed = offset >> self.apow;
        if self.width == 4 && packed > u32::MAX as u64 {
            return None;
        }
        Some(packed)
    }

    pub fn unpack_offset(&self, packed: u64) -> u64 {
        packed << self.apow
    }

    /// Read a slot/link value of the layout's width.
    pub fn read_packed(&self, bytes: &[u8]) -> u64 {
        if self.width == 8 {
            read_u64(bytes, 0)
        } else {
            read_u32(bytes, 0) as u64
        }
    }

    /// Write a slot/link value of the layout's width.
    pub fn write_packed(&self, packed: u64, out: &mut Vec<u8>) {
        if self.width == 8 {
            out.extend_from_slice(&packed.to_le_bytes());
        } else {
            out.extend_from_slice(&(packed as u32).to_le_bytes());
        }
    }
}

/// Bytes of a record block header for a given link width.
pub fn record_header_size(width: usize) -> usize {
    BLOCK_PREFIX_SIZE + width + 8
}

/// Decoded record block header.
///
/// Layout:
///   [0]        magic:  u8  - RECORD_MAGIC or FREE_MAGIC
///   [1]        hcheck: u8  - secondary hash of the key
///   [2..4]     reserved
///   [4..8]     rsiz:   u32 - total block size
///   [8..8+W]   link:   next record in the chain, packed
///   [+0..+4]   ksiz:   u32
///   [+4..+8]   vsiz:   u32 - stored value size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub hcheck: u8,
    pub rsiz: u32,
    /// Absolute offset of the next record in the chain, 0 at chain end
    pub link: u64,
    pub ksiz: u32,
    pub vsiz: u32,
}

impl RecordHeader {
    /// Serialize for a layout. Returns `None` when the link does not fit
    /// the layout's slot width.
    pub fn to_bytes(&self, layout: &Layout) -> Option<Vec<u8>> {
        let mut buf = Vec::with_capacity(layout.record_header_size());
        buf.push(RECORD_MAGIC);
        buf.push(self.hcheck);
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&self.rsiz.to_le_bytes());
        layout.write_packed(layout.pack_offset(self.link)?, &mut buf);
        buf.extend_from_slice(&self.ksiz.to_le_bytes());
        buf.extend_from_slice(&self.vsiz.to_le_bytes());
        Some(buf)
    }

    /// Parse a live record header; `Err` describes what was found instead.
    pub fn from_bytes(bytes: &[u8], layout: &Layout) -> Result<Self, String> {
        let hsiz = layout.record_header_size();
        if bytes.len() < hsiz {
            return Err(format!("short header: {} of {} bytes", bytes.len(), hsiz));
        }
        if bytes[0] != RECORD_MAGIC {
            return Err(format!("bad record magic 0x{:02x}", bytes[0]));
        }
        let w = layout.width;
        let header = Self {
            hcheck: bytes[1],
            rsiz: read_u32(bytes, 4),
            link: layout.unpack_offset(layout.read_packed(&bytes[8..8 + w])),
            ksiz: read_u32(bytes, 8 + w),
            vsiz: read_u32(bytes, 12 + w),
        };
        let body = hsiz as u64 + header.ksiz as u64 + header.vsiz as u64;
        if body > header.rsiz as u64 {
            return Err(format!("body {} exceeds block size {}", body, header.rsiz));
        }
        Ok(header)
    }

    /// Offset of the key bytes relative to the block start.
    pub fn key_offset(layout: &Layout) -> u64 {
        layout.record_header_size() as u64
    }

    /// Offset of the value bytes relative to the block start.
    pub fn value_offset(&self, layout: &Layout) -> u64 {
        layout.record_header_size() as u64 + self.ksiz as u64
    }
}

/// Kind and size of a block, from its 8-byte prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Record { rsiz: u32 },
    Free { rsiz: u32 },
}

impl BlockKind {
    pub fn parse(prefix: &[u8]) -> Result<Self, String> {
        if prefix.len() < BLOCK_PREFIX_SIZE {
            return Err("short block prefix".to_string());
        }
        let rsiz = read_u32(prefix, 4);
        if rsiz < BLOCK_PREFIX_SIZE as u32 {
            return Err(format!("block size {} too small", rsiz));
        }
        match prefix[0] {
            RECORD_MAGIC => Ok(BlockKind::Record { rsiz }),
            FREE_MAGIC => Ok(BlockKind::Free { rsiz }),
            other => Err(format!("bad block magic 0x{:02x}", other)),
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            BlockKind::Record { rsiz } | BlockKind::Free { rsiz } => *rsiz as u64,
        }
    }
}

/// 8-byte prefix marking a free block of `size` bytes.
pub fn free_block_prefix(size: u32) -> [u8; BLOCK_PREFIX_SIZE] {
    let mut buf = [0u8; BLOCK_PREFIX_SIZE];
    buf[0] = FREE_MAGIC;
    buf[4..8].copy_from_slice(&size.to_le_bytes());
    buf
}

/// Primary bucket hash, part of format version 1:
/// `h = 19780211; h = h * 37 + byte` over the key, 64-bit wrapping.
pub fn bucket_hash(key: &[u8]) -> u64 {
    key.iter()
        .fold(19_780_211u64, |h, &b| h.wrapping_mul(37).wrapping_add(b as u64))
}

/// Bucket index of a key.
pub fn bucket_index(key: &[u8], bnum: u64) -> u64 {
    bucket_hash(key) % bnum
}

/// Secondary check byte: `c = 751; c = c * 31 ^ byte` over the reversed
/// key, 32-bit wrapping, low byte.
pub fn check_hash(key: &[u8]) -> u8 {
    key.iter()
        .rev()
        .fold(751u32, |c, &b| c.wrapping_mul(31) ^ b as u32) as u8
}

/// Round `value` up to a multiple of `align` (a power of two).
pub fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

pub fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

pub fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}
