//! World codec
//!
//! World document layout (big-endian):
//!
//! ```text
//! magic "WVLT"
//! u8  format version
//! u16 world height
//! u32 len + metadata     spawn (i32 x, i32 y, i32 z, f32 angle),
//!                        u32 count + (string, string)* game rules,
//!                        compound properties
//! u32 len + maps         u32 count + compound*
//! u32 chunk count
//! per chunk: i32 x, i32 z, u32 len, u32 crc32c, chunk payload
//! u32 len + extra data
//! ```
//!
//! Each chunk payload is length-prefixed and checksummed on its own, so a
//! damaged chunk is skipped and reported while the rest of the world loads.

use crate::chunk::SECTION_HEIGHT;
use crate::chunk_codec::ChunkCodec;
use crate::reader::{Context, Reader};
use crate::tag::{CompoundTag, put_compounds, put_len, put_str, read_compounds};
use crate::version::{self, CURRENT_VERSION};
use crate::world::{SpawnPoint, World, WorldMetadata};
use bytes::{BufMut, BytesMut};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, warn};
use worldvault_common::{ChunkPos, Error, Result};

/// Leading bytes of every world document
pub const MAGIC: &[u8; 4] = b"WVLT";

/// Smallest possible chunk table entry: coordinates, length and checksum
const CHUNK_ENTRY_HEADER: usize = 16;

/// Result of decoding a world document
///
/// `errors` lists every chunk that could not be decoded; those chunks are
/// absent from `world`. An empty list means the world decoded completely.
#[derive(Debug)]
pub struct DecodedWorld {
    pub world: World,
    pub errors: Vec<Error>,
}

impl DecodedWorld {
    /// Whether every chunk decoded
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }

    /// The world, or an error if any chunk failed to decode
    pub fn into_complete(mut self) -> Result<World> {
        match self.errors.len() {
            0 => Ok(self.world),
            1 => Err(self.errors.remove(0)),
            n => Err(Error::corrupt_world(format!(
                "{n} corrupt chunks: {}",
                self.errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; ")
            ))),
        }
    }
}

/// Encoder and decoder for whole worlds
#[derive(Debug, Clone, Copy, Default)]
pub struct WorldCodec;

impl WorldCodec {
    /// Encode a world at the current format version
    ///
    /// Chunks are written in coordinate order so equal worlds encode to
    /// equal bytes.
    pub fn encode(world: &World) -> Result<Vec<u8>> {
        world.validate()?;

        let mut buf = BytesMut::new();
        buf.put_slice(MAGIC);
        buf.put_u8(CURRENT_VERSION);
        buf.put_u16(world.height);

        let mut block = BytesMut::new();
        encode_metadata(&world.metadata, &mut block)?;
        put_block(&mut buf, &block)?;

        block.clear();
        put_compounds(&mut block, &world.maps)?;
        put_block(&mut buf, &block)?;

        let mut positions: Vec<&ChunkPos> = world.chunks.keys().collect();
        positions.sort();
        put_len(&mut buf, positions.len())?;
        for pos in positions {
            block.clear();
            ChunkCodec::encode_into(&world.chunks[pos], &mut block)?;
            buf.put_i32(pos.x);
            buf.put_i32(pos.z);
            put_len(&mut buf, block.len())?;
            buf.put_u32(crc32c::crc32c(&block));
            buf.put_slice(&block);
        }

        put_block(&mut buf, &world.extra)?;
        debug!(
            chunks = world.chunks.len(),
            bytes = buf.len(),
            "Encoded world"
        );
        Ok(buf.to_vec())
    }

    /// Decode a world document
    ///
    /// Structural damage fails the whole decode with `CorruptWorld`; a bad
    /// chunk is left out of the world and reported in
    /// [`DecodedWorld::errors`].
    pub fn decode(bytes: &[u8]) -> Result<DecodedWorld> {
        let mut r = Reader::new(bytes, Context::World);

        let magic = r.bytes(MAGIC.len(), "magic")?;
        if magic != MAGIC {
            return Err(Error::corrupt_world(format!("bad magic {magic:02x?}")));
        }
        let version = r.u8("format version")?;
        version::check(version)?;
        let height = r.u16("world height")?;
        if height == 0 || usize::from(height) % SECTION_HEIGHT != 0 {
            return Err(Error::corrupt_world(format!("invalid world height {height}")));
        }

        let len = r.len(1, "metadata")?;
        let mut block = Reader::new(r.bytes(len, "metadata")?, Context::World);
        let metadata = decode_metadata(&mut block)?;
        block.finish("metadata")?;

        let len = r.len(1, "maps")?;
        let mut block = Reader::new(r.bytes(len, "maps")?, Context::World);
        let maps = read_compounds(&mut block, "maps")?;
        block.finish("maps")?;

        let count = r.len(CHUNK_ENTRY_HEADER, "chunk table")?;
        let mut chunks = HashMap::with_capacity(count);
        let mut seen = HashSet::with_capacity(count);
        let mut errors = Vec::new();
        for _ in 0..count {
            let pos = ChunkPos::new(r.i32("chunk x")?, r.i32("chunk z")?);
            let len = r.len(1, "chunk payload")?;
            let crc = r.u32("chunk checksum")?;
            let payload = r.bytes(len, "chunk payload")?;

            if !seen.insert(pos) {
                errors.push(Error::corrupt_chunk("duplicate chunk coordinates").at_chunk(pos));
                continue;
            }
            let decoded = if crc32c::crc32c(payload) == crc {
                ChunkCodec::decode(payload, version).and_then(|chunk| {
                    if chunk.pos() != pos {
                        Err(Error::corrupt_chunk(format!(
                            "payload is for chunk {}",
                            chunk.pos()
                        )))
                    } else if chunk.height() != usize::from(height) {
                        Err(Error::corrupt_chunk(format!(
                            "chunk is {} blocks high, world height is {height}",
                            chunk.height()
                        )))
                    } else {
                        Ok(chunk)
                    }
                })
            } else {
                Err(Error::corrupt_chunk("checksum mismatch"))
            };
            match decoded {
                Ok(chunk) => {
                    chunks.insert(pos, chunk);
                }
                Err(e) => {
                    let e = e.at_chunk(pos);
                    warn!(error = %e, "Skipping corrupt chunk");
                    errors.push(e);
                }
            }
        }

        let len = r.len(1, "extra data")?;
        let extra = r.bytes(len, "extra data")?.to_vec();
        r.finish("world")?;

        debug!(
            version,
            chunks = chunks.len(),
            corrupt = errors.len(),
            "Decoded world"
        );
        Ok(DecodedWorld {
            world: World {
                version,
                height,
                metadata,
                chunks,
                maps,
                extra,
            },
            errors,
        })
    }
}

fn put_block(buf: &mut BytesMut, block: &[u8]) -> Result<()> {
    put_len(buf, block.len())?;
    buf.put_slice(block);
    Ok(())
}

fn encode_metadata(metadata: &WorldMetadata, buf: &mut BytesMut) -> Result<()> {
    let spawn = &metadata.spawn;
    buf.put_i32(spawn.x);
    buf.put_i32(spawn.y);
    buf.put_i32(spawn.z);
    buf.put_f32(spawn.angle);
    put_len(buf, metadata.game_rules.len())?;
    for (rule, value) in &metadata.game_rules {
        put_str(buf, rule)?;
        put_str(buf, value)?;
    }
    metadata.properties.write_payload(buf)
}

fn decode_metadata(r: &mut Reader<'_>) -> Result<WorldMetadata> {
    let spawn = SpawnPoint {
        x: r.i32("spawn x")?,
        y: r.i32("spawn y")?,
        z: r.i32("spawn z")?,
        angle: r.f32("spawn angle")?,
    };
    let count = r.len(8, "game rules")?;
    let mut game_rules = BTreeMap::new();
    for _ in 0..count {
        let rule = r.string("game rule name")?;
        let value = r.string("game rule value")?;
        if game_rules.insert(rule, value).is_some() {
            return Err(r.error("duplicate game rule"));
        }
    }
    let properties = CompoundTag::read_payload(r)?;
    Ok(WorldMetadata {
        spawn,
        game_rules,
        properties,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{BlockState, Chunk};

    fn sample_world(chunks: &[(i32, i32)]) -> World {
        let mut world = World::new(32).unwrap();
        world.metadata.spawn = SpawnPoint {
            x: 8,
            y: 70,
            z: -8,
            angle: 90.0,
        };
        world
            .metadata
            .game_rules
            .insert("doDaylightCycle".into(), "false".into());
        world.maps.push(CompoundTag::new().with("scale", 2i8));
        world.extra = vec![0xDE, 0xAD, 0xBE, 0xEF, 0x00];
        for &(x, z) in chunks {
            let mut chunk = Chunk::new(x, z, 32).unwrap();
            chunk
                .set_block(1, 2, 3, BlockState::new(format!("block_{x}_{z}")))
                .unwrap();
            world.insert_chunk(chunk).unwrap();
        }
        world
    }

    /// (position, payload offset, payload length) of every chunk table entry
    fn chunk_entries(bytes: &[u8]) -> Vec<(ChunkPos, usize, usize)> {
        let read_u32 =
            |at: usize| u32::from_be_bytes(bytes[at..at + 4].try_into().unwrap()) as usize;
        let read_i32 = |at: usize| i32::from_be_bytes(bytes[at..at + 4].try_into().unwrap());
        let mut at = 4 + 1 + 2;
        at += 4 + read_u32(at);
        at += 4 + read_u32(at);
        let count = read_u32(at);
        at += 4;
        let mut out = Vec::new();
        for _ in 0..count {
            let pos = ChunkPos::new(read_i32(at), read_i32(at + 4));
            let len = read_u32(at + 8);
            out.push((pos, at + 16, len));
            at += 16 + len;
        }
        out
    }

    #[test]
    fn test_roundtrip() {
        let world = sample_world(&[(0, 0), (1, 0), (-3, 7)]);
        let bytes = WorldCodec::encode(&world).unwrap();
        let decoded = WorldCodec::decode(&bytes).unwrap();
        assert!(decoded.is_complete());
        assert_eq!(decoded.world, world);
        assert_eq!(decoded.world.extra, vec![0xDE, 0xAD, 0xBE, 0xEF, 0x00]);
    }

    #[test]
    fn test_empty_world_roundtrip() {
        let world = World::new(256).unwrap();
        let bytes = WorldCodec::encode(&world).unwrap();
        assert_eq!(&bytes[..4], MAGIC);
        assert_eq!(WorldCodec::decode(&bytes).unwrap().into_complete().unwrap(), world);
    }

    #[test]
    fn test_one_corrupt_chunk_among_many() {
        let positions = [(0, 0), (0, 1), (1, 0), (1, 1), (2, 2)];
        let world = sample_world(&positions);
        let mut bytes = WorldCodec::encode(&world).unwrap();

        let (victim, offset, len) = chunk_entries(&bytes)[2];
        bytes[offset + len / 2] ^= 0xFF;

        let decoded = WorldCodec::decode(&bytes).unwrap();
        assert_eq!(decoded.world.chunk_count(), positions.len() - 1);
        assert_eq!(decoded.errors.len(), 1);
        match &decoded.errors[0] {
            Error::CorruptChunk { pos, .. } => assert_eq!(*pos, Some(victim)),
            other => panic!("unexpected error: {other}"),
        }
        assert!(decoded.world.chunk(victim).is_none());
        for (x, z) in positions {
            let pos = ChunkPos::new(x, z);
            if pos != victim {
                assert_eq!(decoded.world.chunk(pos), world.chunk(pos));
            }
        }
        assert!(decoded.into_complete().is_err());
    }

    #[test]
    fn test_duplicate_coordinates_first_wins() {
        let world = sample_world(&[(0, 0), (1, 0)]);
        let mut bytes = WorldCodec::encode(&world).unwrap();
        let (_, offset, _) = chunk_entries(&bytes)[1];
        // rewrite the second entry's x from 1 to 0
        bytes[offset - 16..offset - 12].copy_from_slice(&0i32.to_be_bytes());

        let decoded = WorldCodec::decode(&bytes).unwrap();
        assert_eq!(decoded.world.chunk_count(), 1);
        assert_eq!(decoded.errors.len(), 1);
        assert_eq!(
            decoded.world.chunk(ChunkPos::new(0, 0)),
            world.chunk(ChunkPos::new(0, 0))
        );
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = WorldCodec::encode(&sample_world(&[(0, 0)])).unwrap();
        bytes[0] = b'X';
        assert!(matches!(WorldCodec::decode(&bytes), Err(Error::CorruptWorld(_))));
    }

    #[test]
    fn test_truncated_table_is_structural() {
        let bytes = WorldCodec::encode(&sample_world(&[(0, 0), (1, 1)])).unwrap();
        let (_, offset, len) = chunk_entries(&bytes)[1];
        let cut = &bytes[..offset + len / 2];
        assert!(matches!(WorldCodec::decode(cut), Err(Error::CorruptWorld(_))));
    }

    #[test]
    fn test_trailing_bytes() {
        let mut bytes = WorldCodec::encode(&sample_world(&[(0, 0)])).unwrap();
        bytes.push(1);
        assert!(matches!(WorldCodec::decode(&bytes), Err(Error::CorruptWorld(_))));
    }

    #[test]
    fn test_unsupported_version() {
        let mut bytes = WorldCodec::encode(&sample_world(&[])).unwrap();
        bytes[4] = CURRENT_VERSION + 1;
        assert!(matches!(
            WorldCodec::decode(&bytes),
            Err(Error::UnsupportedVersion { .. })
        ));
        bytes[4] = 0;
        assert!(matches!(
            WorldCodec::decode(&bytes),
            Err(Error::UnsupportedVersion { version: 0, .. })
        ));
    }

    #[test]
    fn test_older_version_is_upgraded_on_encode() {
        let mut bytes = WorldCodec::encode(&World::new(64).unwrap()).unwrap();
        bytes[4] = 1;
        let old = WorldCodec::decode(&bytes).unwrap().into_complete().unwrap();
        assert_eq!(old.version, 1);

        let again = WorldCodec::encode(&old).unwrap();
        assert_eq!(again[4], CURRENT_VERSION);
        let upgraded = WorldCodec::decode(&again).unwrap().into_complete().unwrap();
        assert_eq!(upgraded.version, CURRENT_VERSION);
        assert_ne!(upgraded, old);
        assert_eq!(upgraded, World { version: CURRENT_VERSION, ..old });
    }

    #[test]
    fn test_encode_is_deterministic() {
        let world = sample_world(&[(3, 3), (-1, 0), (0, -1), (2, 9)]);
        let a = WorldCodec::encode(&world).unwrap();
        let b = WorldCodec::encode(&world.clone()).unwrap();
        assert_eq!(a, b);
    }
}
