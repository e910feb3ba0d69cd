//! FlateDecode (zlib/deflate) decoder.

use crate::decoders::StreamDecoder;
use crate::error::{Error, Result};
use flate2::read::{DeflateDecoder, ZlibDecoder};
use std::io::Read;

/// FlateDecode filter.
///
/// Structural streams must decode completely, so there is no partial recovery: a zlib stream
/// that fails is retried once as raw deflate (some producers drop the zlib header) and otherwise
/// reported as a decode error.
pub struct FlateDecoder;

impl StreamDecoder for FlateDecoder {
    fn decode(&self, input: &[u8]) -> Result<Vec<u8>> {
        let mut output = Vec::new();
        let zlib_err = match ZlibDecoder::new(input).read_to_end(&mut output) {
            Ok(_) => return Ok(output),
            Err(e) => e,
        };

        log::debug!("zlib decode failed ({}), retrying as raw deflate", zlib_err);
        output.clear();
        match DeflateDecoder::new(input).read_to_end(&mut output) {
            Ok(_) if !output.is_empty() => Ok(output),
            _ => Err(Error::Decode(format!("FlateDecode failed: {}", zlib_err))),
        }
    }

    fn name(&self) -> &str {
        "FlateDecode"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::{DeflateEncoder, ZlibEncoder};
    use std::io::Write;

    #[test]
    fn test_flate_zlib() {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::best());
        enc.write_all(b"1 0 obj << >> endobj").unwrap();
        let data = enc.finish().unwrap();
        assert_eq!(FlateDecoder.decode(&data).unwrap(), b"1 0 obj << >> endobj");
    }

    #[test]
    fn test_flate_raw_deflate_fallback() {
        let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"headerless").unwrap();
        let data = enc.finish().unwrap();
        assert_eq!(FlateDecoder.decode(&data).unwrap(), b"headerless");
    }

    #[test]
    fn test_flate_garbage_is_error() {
        assert!(FlateDecoder.decode(b"\xFF\xFF\xFF\xFF").is_err());
        assert_eq!(FlateDecoder.name(), "FlateDecode");
    }
}
