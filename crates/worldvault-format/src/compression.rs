//! Self-describing compression wrapper
//!
//! Stream layout: `u8 algorithm tag, u32 uncompressed length (big-endian),
//! payload`. The tag selects the decoder, so a blob written with one
//! algorithm stays readable after the configured algorithm changes.

use bytes::{BufMut, BytesMut};
use worldvault_common::{CompressionAlgorithm, Error, Result};

const TAG_NONE: u8 = 0;
const TAG_ZSTD: u8 = 1;
const TAG_LZ4: u8 = 2;

/// Default zstd level
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

/// Largest uncompressed size a stream may claim
pub const MAX_DECOMPRESSED_LEN: usize = 1 << 30;

const HEADER_LEN: usize = 5;

const fn tag_of(algorithm: CompressionAlgorithm) -> u8 {
    match algorithm {
        CompressionAlgorithm::None => TAG_NONE,
        CompressionAlgorithm::Zstd => TAG_ZSTD,
        CompressionAlgorithm::Lz4 => TAG_LZ4,
    }
}

/// Compress `data` with the default level
pub fn compress(data: &[u8], algorithm: CompressionAlgorithm) -> Result<Vec<u8>> {
    compress_with_level(data, algorithm, DEFAULT_ZSTD_LEVEL)
}

/// Compress `data`; `level` only applies to zstd
pub fn compress_with_level(
    data: &[u8],
    algorithm: CompressionAlgorithm,
    level: i32,
) -> Result<Vec<u8>> {
    if data.len() > MAX_DECOMPRESSED_LEN {
        return Err(Error::serialization(format!(
            "{} bytes exceed the maximum of {MAX_DECOMPRESSED_LEN}",
            data.len()
        )));
    }
    let payload = match algorithm {
        CompressionAlgorithm::None => data.to_vec(),
        CompressionAlgorithm::Zstd => zstd::bulk::compress(data, level)
            .map_err(|e| Error::serialization(format!("zstd compression failed: {e}")))?,
        CompressionAlgorithm::Lz4 => lz4_flex::block::compress(data),
    };

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(tag_of(algorithm));
    // bounded by MAX_DECOMPRESSED_LEN above
    buf.put_u32(data.len() as u32);
    buf.put_slice(&payload);
    Ok(buf.to_vec())
}

/// Algorithm a compressed stream was written with
pub fn algorithm_of(stream: &[u8]) -> Result<CompressionAlgorithm> {
    match stream.first() {
        None => Err(Error::corrupt_stream("empty stream")),
        Some(&TAG_NONE) => Ok(CompressionAlgorithm::None),
        Some(&TAG_ZSTD) => Ok(CompressionAlgorithm::Zstd),
        Some(&TAG_LZ4) => Ok(CompressionAlgorithm::Lz4),
        Some(&other) => Err(Error::UnknownCompression(other)),
    }
}

/// Decompress a stream produced by [`compress`]
pub fn decompress(stream: &[u8]) -> Result<Vec<u8>> {
    let algorithm = algorithm_of(stream)?;
    if stream.len() < HEADER_LEN {
        return Err(Error::corrupt_stream(format!(
            "truncated header: {} bytes",
            stream.len()
        )));
    }
    let raw_len = u32::from_be_bytes([stream[1], stream[2], stream[3], stream[4]]) as usize;
    if raw_len > MAX_DECOMPRESSED_LEN {
        return Err(Error::corrupt_stream(format!(
            "declared size {raw_len} exceeds the maximum of {MAX_DECOMPRESSED_LEN}"
        )));
    }
    let payload = &stream[HEADER_LEN..];

    let out = match algorithm {
        CompressionAlgorithm::None => payload.to_vec(),
        CompressionAlgorithm::Zstd => zstd::bulk::decompress(payload, raw_len)
            .map_err(|e| Error::corrupt_stream(format!("zstd: {e}")))?,
        CompressionAlgorithm::Lz4 => lz4_flex::block::decompress(payload, raw_len)
            .map_err(|e| Error::corrupt_stream(format!("lz4: {e}")))?,
    };
    if out.len() != raw_len {
        return Err(Error::corrupt_stream(format!(
            "decompressed {} bytes, header declares {raw_len}",
            out.len()
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    const ALL: [CompressionAlgorithm; 3] = [
        CompressionAlgorithm::None,
        CompressionAlgorithm::Zstd,
        CompressionAlgorithm::Lz4,
    ];

    fn inputs() -> Vec<Vec<u8>> {
        let mut random = vec![0u8; 64 * 1024];
        rand::thread_rng().fill_bytes(&mut random);
        vec![
            Vec::new(),
            b"x".to_vec(),
            vec![7u8; 100_000],
            b"minecraft:stone".repeat(500),
            random,
        ]
    }

    #[test]
    fn test_roundtrip_every_algorithm() {
        for algorithm in ALL {
            for input in inputs() {
                let stream = compress(&input, algorithm).unwrap();
                assert_eq!(algorithm_of(&stream).unwrap(), algorithm);
                assert_eq!(decompress(&stream).unwrap(), input, "{algorithm:?}");
            }
        }
    }

    #[test]
    fn test_compressors_shrink_repetitive_data() {
        let input = vec![0u8; 1 << 20];
        for algorithm in [CompressionAlgorithm::Zstd, CompressionAlgorithm::Lz4] {
            assert!(compress(&input, algorithm).unwrap().len() < input.len() / 10);
        }
        let high = compress_with_level(&input, CompressionAlgorithm::Zstd, 19).unwrap();
        assert_eq!(decompress(&high).unwrap(), input);
    }

    #[test]
    fn test_unknown_tag() {
        let mut stream = compress(b"hello", CompressionAlgorithm::None).unwrap();
        stream[0] = 0x7F;
        assert!(matches!(
            decompress(&stream),
            Err(Error::UnknownCompression(0x7F))
        ));
    }

    #[test]
    fn test_truncated_stream() {
        let input = b"some world bytes".repeat(100);
        for algorithm in ALL {
            let stream = compress(&input, algorithm).unwrap();
            for cut in [0, 3, stream.len() - 1] {
                assert!(
                    matches!(decompress(&stream[..cut]), Err(Error::CorruptStream(_))),
                    "{algorithm:?} cut at {cut}"
                );
            }
        }
    }

    #[test]
    fn test_corrupt_payload() {
        let input = b"some world bytes".repeat(100);
        let mut stream = compress(&input, CompressionAlgorithm::Zstd).unwrap();
        let mid = HEADER_LEN + (stream.len() - HEADER_LEN) / 2;
        for b in &mut stream[mid..] {
            *b = 0xFF;
        }
        assert!(decompress(&stream).is_err());
    }

    #[test]
    fn test_declared_length_mismatch() {
        let mut stream = compress(b"abc", CompressionAlgorithm::None).unwrap();
        stream[4] = 9;
        assert!(matches!(decompress(&stream), Err(Error::CorruptStream(_))));
    }
}
