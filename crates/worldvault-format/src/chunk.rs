//! Chunk model
//!
//! A chunk is a 16-wide, 16-deep column of blocks split into 16-high
//! sections stacked bottom-up. Each section stores its blocks as indices
//! into a section-local palette.

use crate::nibble::NibbleArray;
use crate::tag::CompoundTag;
use worldvault_common::{ChunkPos, Error, Result};

/// Width and depth of a chunk in blocks
pub const SECTION_WIDTH: usize = 16;

/// Height of one section in blocks
pub const SECTION_HEIGHT: usize = 16;

/// Blocks per section
pub const SECTION_VOLUME: usize = SECTION_WIDTH * SECTION_WIDTH * SECTION_HEIGHT;

/// Entries in the per-column biome array and height map
pub const COLUMN_COUNT: usize = SECTION_WIDTH * SECTION_WIDTH;

/// Largest palette a section can need
pub const MAX_PALETTE_LEN: usize = SECTION_VOLUME;

/// A block state: identifier plus optional properties
#[derive(Clone, Debug, PartialEq)]
pub struct BlockState {
    pub name: String,
    pub properties: Option<CompoundTag>,
}

impl BlockState {
    /// Block state without properties
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: None,
        }
    }

    /// Block state with properties
    #[must_use]
    pub fn with_properties(name: impl Into<String>, properties: CompoundTag) -> Self {
        Self {
            name: name.into(),
            properties: Some(properties),
        }
    }

    /// The empty block
    #[must_use]
    pub fn air() -> Self {
        Self::new("minecraft:air")
    }
}

/// One 16×16×16 layer of a chunk
#[derive(Clone, Debug)]
pub struct ChunkSection {
    pub palette: Vec<BlockState>,
    /// Palette indices, `y * 256 + z * 16 + x`
    pub blocks: Vec<u16>,
    pub block_light: Option<NibbleArray>,
    pub sky_light: Option<NibbleArray>,
}

impl ChunkSection {
    /// Section made entirely of `state`
    #[must_use]
    pub fn filled(state: BlockState) -> Self {
        Self {
            palette: vec![state],
            blocks: vec![0; SECTION_VOLUME],
            block_light: None,
            sky_light: None,
        }
    }

    /// Section made entirely of air
    #[must_use]
    pub fn empty() -> Self {
        Self::filled(BlockState::air())
    }

    /// Linear index of a block within a section
    #[must_use]
    pub const fn index(x: usize, y: usize, z: usize) -> usize {
        y * SECTION_WIDTH * SECTION_WIDTH + z * SECTION_WIDTH + x
    }

    /// Block state at a linear index, if the index and palette entry exist
    #[must_use]
    pub fn state_at(&self, index: usize) -> Option<&BlockState> {
        let slot = *self.blocks.get(index)?;
        self.palette.get(usize::from(slot))
    }

    /// Block state at section-local coordinates
    #[must_use]
    pub fn get(&self, x: usize, y: usize, z: usize) -> Option<&BlockState> {
        if x >= SECTION_WIDTH || y >= SECTION_HEIGHT || z >= SECTION_WIDTH {
            return None;
        }
        self.state_at(Self::index(x, y, z))
    }

    /// Set the block state at section-local coordinates
    ///
    /// The state is appended to the palette if it is not there yet.
    pub fn set(&mut self, x: usize, y: usize, z: usize, state: BlockState) -> Result<()> {
        if x >= SECTION_WIDTH || y >= SECTION_HEIGHT || z >= SECTION_WIDTH {
            return Err(Error::InvalidChunk(format!(
                "section coordinates ({x}, {y}, {z}) out of range"
            )));
        }
        let slot = match self.palette.iter().position(|s| *s == state) {
            Some(slot) => slot,
            None => {
                if self.palette.len() >= MAX_PALETTE_LEN {
                    return Err(Error::InvalidChunk("section palette is full".into()));
                }
                self.palette.push(state);
                self.palette.len() - 1
            }
        };
        // MAX_PALETTE_LEN fits in u16
        self.blocks[Self::index(x, y, z)] = u16::try_from(slot)
            .map_err(|_| Error::InvalidChunk("section palette is full".into()))?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.blocks.len() != SECTION_VOLUME {
            return Err(Error::InvalidChunk(format!(
                "section has {} blocks, expected {SECTION_VOLUME}",
                self.blocks.len()
            )));
        }
        if self.palette.is_empty() {
            return Err(Error::InvalidChunk("section palette is empty".into()));
        }
        if self.palette.len() > MAX_PALETTE_LEN {
            return Err(Error::InvalidChunk(format!(
                "section palette has {} entries",
                self.palette.len()
            )));
        }
        if let Some(bad) = self
            .blocks
            .iter()
            .find(|i| usize::from(**i) >= self.palette.len())
        {
            return Err(Error::InvalidChunk(format!(
                "palette index {bad} out of range for palette of {}",
                self.palette.len()
            )));
        }
        Ok(())
    }
}

/// Sections compare by the block state at every position, so two sections
/// with differently ordered or padded palettes are equal when they describe
/// the same blocks.
impl PartialEq for ChunkSection {
    fn eq(&self, other: &Self) -> bool {
        if self.blocks.len() != other.blocks.len()
            || self.block_light != other.block_light
            || self.sky_light != other.sky_light
        {
            return false;
        }
        (0..self.blocks.len()).all(|i| self.state_at(i) == other.state_at(i))
    }
}

/// A chunk column
#[derive(Clone, Debug, PartialEq)]
pub struct Chunk {
    pub x: i32,
    pub z: i32,
    /// Sections ordered bottom-up
    pub sections: Vec<ChunkSection>,
    /// One biome id per column, `z * 16 + x`
    pub biomes: Vec<i32>,
    /// Highest block per column, `z * 16 + x`
    pub height_map: Vec<i32>,
    pub tile_entities: Vec<CompoundTag>,
    pub entities: Vec<CompoundTag>,
}

impl Chunk {
    /// Air-filled chunk of the given height
    pub fn new(x: i32, z: i32, height: usize) -> Result<Self> {
        Self::filled(x, z, height, &BlockState::air())
    }

    /// Chunk of the given height made entirely of `state`
    pub fn filled(x: i32, z: i32, height: usize, state: &BlockState) -> Result<Self> {
        if height == 0 || height % SECTION_HEIGHT != 0 {
            return Err(Error::InvalidChunk(format!(
                "chunk height {height} is not a positive multiple of {SECTION_HEIGHT}"
            )));
        }
        let sections = (0..height / SECTION_HEIGHT)
            .map(|_| ChunkSection::filled(state.clone()))
            .collect();
        Ok(Self {
            x,
            z,
            sections,
            biomes: vec![0; COLUMN_COUNT],
            height_map: vec![0; COLUMN_COUNT],
            tile_entities: Vec::new(),
            entities: Vec::new(),
        })
    }

    /// Position of this chunk
    #[must_use]
    pub const fn pos(&self) -> ChunkPos {
        ChunkPos::new(self.x, self.z)
    }

    /// Height in blocks
    #[must_use]
    pub fn height(&self) -> usize {
        self.sections.len() * SECTION_HEIGHT
    }

    /// Total number of blocks (width × depth × height)
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.sections.len() * SECTION_VOLUME
    }

    /// Block state at chunk-local coordinates
    #[must_use]
    pub fn get_block(&self, x: usize, y: usize, z: usize) -> Option<&BlockState> {
        self.sections
            .get(y / SECTION_HEIGHT)?
            .get(x, y % SECTION_HEIGHT, z)
    }

    /// Set the block state at chunk-local coordinates
    pub fn set_block(&mut self, x: usize, y: usize, z: usize, state: BlockState) -> Result<()> {
        let height = self.height();
        let section = self.sections.get_mut(y / SECTION_HEIGHT).ok_or_else(|| {
            Error::InvalidChunk(format!("y {y} out of range for chunk height {height}"))
        })?;
        section.set(x, y % SECTION_HEIGHT, z, state)
    }

    /// Check the structural invariants of the chunk
    pub fn validate(&self) -> Result<()> {
        if self.sections.is_empty() {
            return Err(Error::InvalidChunk("chunk has no sections".into()));
        }
        if self.sections.len() > usize::from(u16::MAX) {
            return Err(Error::InvalidChunk(format!(
                "chunk has {} sections",
                self.sections.len()
            )));
        }
        for (i, section) in self.sections.iter().enumerate() {
            section
                .validate()
                .map_err(|e| Error::InvalidChunk(format!("section {i}: {e}")))?;
        }
        if self.biomes.len() != COLUMN_COUNT {
            return Err(Error::InvalidChunk(format!(
                "biome array has {} entries, expected {COLUMN_COUNT}",
                self.biomes.len()
            )));
        }
        if self.height_map.len() != COLUMN_COUNT {
            return Err(Error::InvalidChunk(format!(
                "height map has {} entries, expected {COLUMN_COUNT}",
                self.height_map.len()
            )));
        }
        Ok(())
    }
}
