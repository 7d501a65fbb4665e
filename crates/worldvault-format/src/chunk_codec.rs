//! Chunk codec
//!
//! Version 2 chunk payload layout (big-endian):
//!
//! ```text
//! i32 x, i32 z
//! u16 section count
//! per section:
//!     u32 palette length
//!     per entry: string name, u8 has_properties, [compound properties]
//!     u8 light flags (bit 0: block light, bit 1: sky light)
//!     u64 * packed_len(4096, bits_for(palette length)) packed indices
//!     [2048 bytes block light] [2048 bytes sky light]
//! u32 count + i32 * count   biomes
//! u32 count + i32 * count   height map
//! u32 count + compound *    tile entities
//! u32 count + compound *    entities
//! ```
//!
//! Version 1 is identical except that a section is only the palette followed
//! by 4096 plain `u16` indices.

use crate::chunk::{BlockState, Chunk, ChunkSection, MAX_PALETTE_LEN, SECTION_VOLUME};
use crate::nibble::NibbleArray;
use crate::palette;
use crate::reader::{Context, Reader};
use crate::tag::{CompoundTag, put_compounds, put_len, put_str, read_compounds};
use crate::version::{self, CURRENT_VERSION};
use bytes::{BufMut, BytesMut};
use worldvault_common::{Error, Result};

const BLOCK_LIGHT: u8 = 0b01;
const SKY_LIGHT: u8 = 0b10;

/// Encoder and decoder for single chunks
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkCodec;

impl ChunkCodec {
    /// Encode a chunk at the current format version
    pub fn encode(chunk: &Chunk) -> Result<Vec<u8>> {
        let mut buf = BytesMut::new();
        Self::encode_into(chunk, &mut buf)?;
        Ok(buf.to_vec())
    }

    /// Append the encoded chunk to `buf`
    pub fn encode_into(chunk: &Chunk, buf: &mut BytesMut) -> Result<()> {
        chunk.validate()?;

        buf.put_i32(chunk.x);
        buf.put_i32(chunk.z);
        // validate() bounds the section count by u16::MAX
        buf.put_u16(chunk.sections.len() as u16);
        for section in &chunk.sections {
            encode_section(section, buf)?;
        }
        put_ints(buf, &chunk.biomes)?;
        put_ints(buf, &chunk.height_map)?;
        put_compounds(buf, &chunk.tile_entities)?;
        put_compounds(buf, &chunk.entities)?;
        Ok(())
    }

    /// Decode a chunk written at `version`
    ///
    /// The whole payload must be consumed; trailing bytes are an error.
    pub fn decode(bytes: &[u8], version: u8) -> Result<Chunk> {
        version::check(version)?;
        let mut r = Reader::new(bytes, Context::Chunk);
        let chunk = match version {
            1 => decode_chunk(&mut r, decode_section_v1)?,
            _ => decode_chunk(&mut r, decode_section_v2)?,
        };
        r.finish("chunk")?;
        chunk
            .validate()
            .map_err(|e| Error::corrupt_chunk(e.to_string()))?;
        Ok(chunk)
    }

    /// Version written by [`Self::encode`]
    #[must_use]
    pub const fn version() -> u8 {
        CURRENT_VERSION
    }
}

fn encode_section(section: &ChunkSection, buf: &mut BytesMut) -> Result<()> {
    let (palette, blocks) = palette::compact(&section.palette, &section.blocks);

    put_len(buf, palette.len())?;
    for state in &palette {
        put_str(buf, &state.name)?;
        match &state.properties {
            Some(props) => {
                buf.put_u8(1);
                props.write_payload(buf)?;
            }
            None => buf.put_u8(0),
        }
    }

    let mut flags = 0;
    if section.block_light.is_some() {
        flags |= BLOCK_LIGHT;
    }
    if section.sky_light.is_some() {
        flags |= SKY_LIGHT;
    }
    buf.put_u8(flags);

    for word in palette::pack(&blocks, palette::bits_for(palette.len())) {
        buf.put_u64(word);
    }
    if let Some(light) = &section.block_light {
        buf.put_slice(light.as_bytes());
    }
    if let Some(light) = &section.sky_light {
        buf.put_slice(light.as_bytes());
    }
    Ok(())
}

fn put_ints(buf: &mut BytesMut, values: &[i32]) -> Result<()> {
    put_len(buf, values.len())?;
    for v in values {
        buf.put_i32(*v);
    }
    Ok(())
}

fn decode_chunk(
    r: &mut Reader<'_>,
    section: fn(&mut Reader<'_>) -> Result<ChunkSection>,
) -> Result<Chunk> {
    let x = r.i32("chunk x")?;
    let z = r.i32("chunk z")?;
    let count = r.u16("section count")?;
    if count == 0 {
        return Err(r.error("chunk has no sections"));
    }
    let mut sections = Vec::with_capacity(usize::from(count));
    for i in 0..count {
        sections.push(section(r).map_err(|e| match e {
            Error::CorruptChunk { reason, .. } => {
                Error::corrupt_chunk(format!("section {i}: {reason}"))
            }
            other => other,
        })?);
    }
    let biomes = read_ints(r, "biomes")?;
    let height_map = read_ints(r, "height map")?;
    let tile_entities = read_compounds(r, "tile entities")?;
    let entities = read_compounds(r, "entities")?;
    Ok(Chunk {
        x,
        z,
        sections,
        biomes,
        height_map,
        tile_entities,
        entities,
    })
}

fn read_ints(r: &mut Reader<'_>, what: &str) -> Result<Vec<i32>> {
    let len = r.len(4, what)?;
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        out.push(r.i32(what)?);
    }
    Ok(out)
}

fn read_palette(r: &mut Reader<'_>) -> Result<Vec<BlockState>> {
    // name length prefix plus the properties flag
    let len = r.len(5, "palette")?;
    if len == 0 {
        return Err(r.error("empty palette"));
    }
    if len > MAX_PALETTE_LEN {
        return Err(r.error(format!("palette of {len} entries exceeds {MAX_PALETTE_LEN}")));
    }
    let mut palette = Vec::with_capacity(len);
    for _ in 0..len {
        let name = r.string("block state name")?;
        let properties = match r.u8("block state flag")? {
            0 => None,
            1 => Some(CompoundTag::read_payload(r)?),
            other => return Err(r.error(format!("invalid block state flag {other}"))),
        };
        palette.push(BlockState { name, properties });
    }
    Ok(palette)
}

fn decode_section_v1(r: &mut Reader<'_>) -> Result<ChunkSection> {
    let palette = read_palette(r)?;
    let mut blocks = Vec::with_capacity(SECTION_VOLUME);
    for _ in 0..SECTION_VOLUME {
        let idx = r.u16("block index")?;
        if usize::from(idx) >= palette.len() {
            return Err(r.error(format!(
                "palette index {idx} out of range for palette of {}",
                palette.len()
            )));
        }
        blocks.push(idx);
    }
    Ok(ChunkSection {
        palette,
        blocks,
        block_light: None,
        sky_light: None,
    })
}

fn decode_section_v2(r: &mut Reader<'_>) -> Result<ChunkSection> {
    let palette = read_palette(r)?;
    let flags = r.u8("light flags")?;
    if flags & !(BLOCK_LIGHT | SKY_LIGHT) != 0 {
        return Err(r.error(format!("unknown light flags {flags:#04x}")));
    }

    let bits = palette::bits_for(palette.len());
    let word_count = palette::packed_len(SECTION_VOLUME, bits);
    let mut words = Vec::with_capacity(word_count);
    for _ in 0..word_count {
        words.push(r.u64("packed indices")?);
    }
    let blocks = palette::unpack(&words, bits, SECTION_VOLUME, palette.len())?;

    let block_light = read_light(r, flags & BLOCK_LIGHT != 0, "block light")?;
    let sky_light = read_light(r, flags & SKY_LIGHT != 0, "sky light")?;
    Ok(ChunkSection {
        palette,
        blocks,
        block_light,
        sky_light,
    })
}

fn read_light(r: &mut Reader<'_>, present: bool, what: &str) -> Result<Option<NibbleArray>> {
    if !present {
        return Ok(None);
    }
    let raw = r.bytes(NibbleArray::BYTES, what)?;
    NibbleArray::from_bytes(raw.to_vec())
        .map(Some)
        .map_err(|e| r.error(e.to_string()))
}
