//! WorldVault Format - World serialization codec
//!
//! This crate implements the binary world format:
//! - Structured tag data for tile entities, entities and world properties
//! - Chunk model with per-section palettes and light arrays
//! - Versioned chunk codec with bit-packed palette indices
//! - World codec with an independently checksummed chunk table
//! - Self-describing compression wrapper (none / zstd / lz4)
//!
//! All multi-byte numbers are big-endian in every format version.
//! Nothing in this crate performs I/O.

pub mod chunk;
pub mod chunk_codec;
pub mod compression;
pub mod nibble;
pub mod palette;
mod reader;
pub mod tag;
pub mod version;
pub mod world;
pub mod world_codec;

// Re-exports
pub use chunk::{BlockState, Chunk, ChunkSection, SECTION_HEIGHT, SECTION_VOLUME, SECTION_WIDTH};
pub use chunk_codec::ChunkCodec;
pub use compression::{algorithm_of, compress, compress_with_level, decompress};
pub use nibble::NibbleArray;
pub use tag::{CompoundTag, Tag, TagType};
pub use version::{CURRENT_VERSION, OLDEST_VERSION};
pub use world::{DEFAULT_HEIGHT, SpawnPoint, World, WorldMetadata};
pub use world_codec::{DecodedWorld, WorldCodec};
pub use worldvault_common::CompressionAlgorithm;
