//! Value compression codecs
//!
//! One codec is active per file, chosen by the codec bits of the options
//! byte when the file is created. Keys are never compressed.

use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;

use crate::config::Options;

/// Caller-supplied value codec for files created with [`Options::EXCODEC`].
pub trait ValueCodec: Send + Sync {
    /// Encode a value before it is written.
    fn encode(&self, value: &[u8]) -> Result<Vec<u8>, String>;
    /// Decode a stored value.
    fn decode(&self, stored: &[u8]) -> Result<Vec<u8>, String>;
}

/// Active codec of an open file.
#[derive(Clone)]
pub enum Codec {
    None,
    Deflate,
    Bzip2,
    Snappy,
    Custom(Arc<dyn ValueCodec>),
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Codec::None => "None",
            Codec::Deflate => "Deflate",
            Codec::Bzip2 => "Bzip2",
            Codec::Snappy => "Snappy",
            Codec::Custom(_) => "Custom",
        };
        f.write_str(name)
    }
}

impl Codec {
    /// Resolve the codec for a file's options. Fails when the file needs a
    /// custom codec and none was registered.
    pub fn from_options(opts: Options, custom: Option<&Arc<dyn ValueCodec>>) -> Result<Self, String> {
        if opts.contains(Options::DEFLATE) {
            Ok(Codec::Deflate)
        } else if opts.contains(Options::BZIP) {
            Ok(Codec::Bzip2)
        } else if opts.contains(Options::SNAPPY) {
            Ok(Codec::Snappy)
        } else if opts.contains(Options::EXCODEC) {
            custom
                .map(|c| Codec::Custom(Arc::clone(c)))
                .ok_or_else(|| "file uses a custom codec but none is registered".to_string())
        } else {
            Ok(Codec::None)
        }
    }

    /// True when stored bytes equal the caller's bytes.
    pub fn is_identity(&self) -> bool {
        matches!(self, Codec::None)
    }

    pub fn encode(&self, value: &[u8]) -> Result<Vec<u8>, String> {
        match self {
            Codec::None => Ok(value.to_vec()),
            Codec::Deflate => {
                let mut encoder = flate2::write::DeflateEncoder::new(
                    Vec::with_capacity(value.len() / 2 + 16),
                    flate2::Compression::default(),
                );
                encoder.write_all(value).map_err(|e| format!("deflate failed: {}", e))?;
                encoder.finish().map_err(|e| format!("deflate failed: {}", e))
            }
            Codec::Bzip2 => {
                let mut encoder = bzip2::write::BzEncoder::new(
                    Vec::with_capacity(value.len() / 2 + 64),
                    bzip2::Compression::default(),
                );
                encoder.write_all(value).map_err(|e| format!("bzip2 failed: {}", e))?;
                encoder.finish().map_err(|e| format!("bzip2 failed: {}", e))
            }
            Codec::Snappy => snap::raw::Encoder::new()
                .compress_vec(value)
                .map_err(|e| format!("snappy failed: {}", e)),
            Codec::Custom(codec) => codec.encode(value),
        }
    }

    pub fn decode(&self, stored: &[u8]) -> Result<Vec<u8>, String> {
        match self {
            Codec::None => Ok(stored.to_vec()),
            Codec::Deflate => {
                let mut out = Vec::with_capacity(stored.len() * 2);
                flate2::read::DeflateDecoder::new(stored)
                    .read_to_end(&mut out)
                    .map_err(|e| format!("inflate failed: {}", e))?;
                Ok(out)
            }
            Codec::Bzip2 => {
                let mut out = Vec::with_capacity(stored.len() * 2);
                bzip2::read::BzDecoder::new(stored)
                    .read_to_end(&mut out)
                    .map_err(|e| format!("bunzip2 failed: {}", e))?;
                Ok(out)
            }
            Codec::Snappy => snap::raw::Decoder::new()
                .decompress_vec(stored)
                .map_err(|e| format!("snappy decode failed: {}", e)),
            Codec::Custom(codec) => codec.decode(stored),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Reverse;

    impl ValueCodec for Reverse {
        fn encode(&self, value: &[u8]) -> Result<Vec<u8>, String> {
            Ok(value.iter().rev().copied().collect())
        }
        fn decode(&self, stored: &[u8]) -> Result<Vec<u8>, String> {
            Ok(stored.iter().rev().copied().collect())
        }
    }

    fn sample() -> Vec<u8> {
        b"the quick brown fox jumps over the lazy dog ".repeat(40)
    }

    #[test]
    fn test_compressing_codecs_shrink_repetitive_values() {
        let value = sample();
        for codec in [Codec::Deflate, Codec::Bzip2, Codec::Snappy] {
            let stored = codec.encode(&value).unwrap();
            assert!(stored.len() < value.len(), "{:?} did not compress", codec);
            assert_eq!(codec.decode(&stored).unwrap(), value);
        }
    }

    #[test]
    fn test_corrupt_input_is_an_error() {
        // Claims 10 bytes, then a 5-byte literal with only 2 bytes behind it.
        assert!(Codec::Snappy.decode(&[0x0a, 0x10, b'a', b'b']).is_err());
        assert!(Codec::Bzip2.decode(b"not bzip2 at all").is_err());
    }

    #[test]
    fn test_custom_codec_requires_registration() {
        assert!(Codec::from_options(Options::EXCODEC, None).is_err());

        let custom: Arc<dyn ValueCodec> = Arc::new(Reverse);
        let codec = Codec::from_options(Options::EXCODEC, Some(&custom)).unwrap();
        assert_eq!(codec.encode(b"abc").unwrap(), b"cba");
    }

    #[test]
    fn test_option_selection() {
        assert!(Codec::from_options(Options::NONE, None).unwrap().is_identity());
        assert!(matches!(Codec::from_options(Options::LARGE | Options::SNAPPY, None), Ok(Codec::Snappy)));
    }
}
