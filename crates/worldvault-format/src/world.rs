//! World model

use crate::chunk::{Chunk, SECTION_HEIGHT};
use crate::tag::CompoundTag;
use crate::version::CURRENT_VERSION;
use std::collections::{BTreeMap, HashMap};
use worldvault_common::{ChunkPos, Error, Result};

/// Default world height in blocks
pub const DEFAULT_HEIGHT: u16 = 256;

/// Where players appear when they join the world
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpawnPoint {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub angle: f32,
}

impl Default for SpawnPoint {
    fn default() -> Self {
        Self {
            x: 0,
            y: 64,
            z: 0,
            angle: 0.0,
        }
    }
}

/// World-level settings stored next to the chunk table
#[derive(Clone, Debug, PartialEq)]
pub struct WorldMetadata {
    pub spawn: SpawnPoint,
    pub game_rules: BTreeMap<String, String>,
    /// Property map (difficulty, environment, pvp, ...)
    pub properties: CompoundTag,
}

impl Default for WorldMetadata {
    fn default() -> Self {
        Self {
            spawn: SpawnPoint::default(),
            game_rules: BTreeMap::new(),
            properties: CompoundTag::new()
                .with("difficulty", "peaceful")
                .with("environment", "normal")
                .with("worldtype", "default")
                .with("pvp", 1i8)
                .with("allowMonsters", 1i8)
                .with("allowAnimals", 1i8),
        }
    }
}

/// An in-memory world
#[derive(Clone, Debug, PartialEq)]
pub struct World {
    /// Format version the world was decoded from
    ///
    /// Informational only: encoding always writes the current version, so a
    /// world read from an older format compares unequal after a round trip
    /// until this field is updated.
    pub version: u8,
    /// Height of every chunk in blocks
    pub height: u16,
    pub metadata: WorldMetadata,
    pub chunks: HashMap<ChunkPos, Chunk>,
    /// Serialized world maps
    pub maps: Vec<CompoundTag>,
    /// Opaque extra data, round-tripped byte-for-byte
    pub extra: Vec<u8>,
}

impl World {
    /// Empty world with the given height
    pub fn new(height: u16) -> Result<Self> {
        if height == 0 || usize::from(height) % SECTION_HEIGHT != 0 {
            return Err(Error::InvalidChunk(format!(
                "world height {height} is not a positive multiple of {SECTION_HEIGHT}"
            )));
        }
        Ok(Self {
            version: CURRENT_VERSION,
            height,
            metadata: WorldMetadata::default(),
            chunks: HashMap::new(),
            maps: Vec::new(),
            extra: Vec::new(),
        })
    }

    /// Insert a chunk, replacing any chunk at the same position
    ///
    /// The chunk must be valid and match the world height.
    pub fn insert_chunk(&mut self, chunk: Chunk) -> Result<Option<Chunk>> {
        self.check_chunk(&chunk)?;
        Ok(self.chunks.insert(chunk.pos(), chunk))
    }

    /// Chunk at `pos`
    #[must_use]
    pub fn chunk(&self, pos: ChunkPos) -> Option<&Chunk> {
        self.chunks.get(&pos)
    }

    /// Mutable chunk at `pos`
    pub fn chunk_mut(&mut self, pos: ChunkPos) -> Option<&mut Chunk> {
        self.chunks.get_mut(&pos)
    }

    /// Remove the chunk at `pos`
    pub fn remove_chunk(&mut self, pos: ChunkPos) -> Option<Chunk> {
        self.chunks.remove(&pos)
    }

    /// Number of chunks
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Check every chunk against the world invariants
    pub fn validate(&self) -> Result<()> {
        for (pos, chunk) in &self.chunks {
            if *pos != chunk.pos() {
                return Err(Error::InvalidChunk(format!(
                    "chunk at {} is keyed as {pos}",
                    chunk.pos()
                )));
            }
            self.check_chunk(chunk)?;
        }
        Ok(())
    }

    fn check_chunk(&self, chunk: &Chunk) -> Result<()> {
        chunk.validate()?;
        if chunk.height() != usize::from(self.height) {
            return Err(Error::InvalidChunk(format!(
                "chunk {} is {} blocks high, world height is {}",
                chunk.pos(),
                chunk.height(),
                self.height
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::BlockState;

    #[test]
    fn test_new_world() {
        let world = World::new(DEFAULT_HEIGHT).unwrap();
        assert_eq!(world.version, CURRENT_VERSION);
        assert_eq!(world.chunk_count(), 0);
        assert_eq!(
            world.metadata.properties.get_str("difficulty"),
            Some("peaceful")
        );
        assert!(World::new(0).is_err());
        assert!(World::new(100).is_err());
    }

    #[test]
    fn test_insert_checks_height() {
        let mut world = World::new(64).unwrap();
        assert!(world.insert_chunk(Chunk::new(0, 0, 64).unwrap()).unwrap().is_none());
        assert!(world.insert_chunk(Chunk::new(1, 0, 32).unwrap()).is_err());

        let stone = BlockState::new("minecraft:stone");
        let replaced = world
            .insert_chunk(Chunk::filled(0, 0, 64, &stone).unwrap())
            .unwrap();
        assert!(replaced.is_some());
        assert_eq!(
            world.chunk(ChunkPos::new(0, 0)).unwrap().get_block(0, 0, 0),
            Some(&stone)
        );
    }

    #[test]
    fn test_validate_detects_misplaced_chunk() {
        let mut world = World::new(16).unwrap();
        world
            .chunks
            .insert(ChunkPos::new(5, 5), Chunk::new(0, 0, 16).unwrap());
        assert!(world.validate().is_err());
    }
}
