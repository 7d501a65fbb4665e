//! Palette compaction and index bit packing
//!
//! Indices are stored at the minimal width for the palette size and packed
//! into `u64` words starting at the low bits. An index never spans two
//! words; the unused high bits of each word are zero.

use crate::chunk::{BlockState, SECTION_VOLUME};
use worldvault_common::{Error, Result};

/// Bits per index for a palette of `len` entries
///
/// A single-entry palette needs no index data at all.
#[must_use]
pub const fn bits_for(len: usize) -> u32 {
    if len <= 1 {
        0
    } else {
        usize::BITS - (len - 1).leading_zeros()
    }
}

/// Number of `u64` words needed to hold `count` indices of `bits` width
#[must_use]
pub const fn packed_len(count: usize, bits: u32) -> usize {
    if bits == 0 {
        return 0;
    }
    let per_word = (64 / bits) as usize;
    count.div_ceil(per_word)
}

/// Pack indices into words
#[must_use]
pub fn pack(indices: &[u16], bits: u32) -> Vec<u64> {
    if bits == 0 {
        return Vec::new();
    }
    let per_word = (64 / bits) as usize;
    indices
        .chunks(per_word)
        .map(|group| {
            group.iter().enumerate().fold(0u64, |word, (i, idx)| {
                word | (u64::from(*idx) << (i as u32 * bits))
            })
        })
        .collect()
}

/// Unpack `count` indices from words, checking each against `palette_len`
pub fn unpack(words: &[u64], bits: u32, count: usize, palette_len: usize) -> Result<Vec<u16>> {
    if bits == 0 {
        return Ok(vec![0; count]);
    }
    if words.len() != packed_len(count, bits) {
        return Err(Error::corrupt_chunk(format!(
            "expected {} packed words, got {}",
            packed_len(count, bits),
            words.len()
        )));
    }
    let per_word = (64 / bits) as usize;
    let mask = (1u64 << bits) - 1;
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let word = words[i / per_word];
        let shift = (i % per_word) as u32 * bits;
        let value = (word >> shift) & mask;
        if value >= palette_len as u64 {
            return Err(Error::corrupt_chunk(format!(
                "palette index {value} out of range for palette of {palette_len}"
            )));
        }
        // bits <= 12 for any valid palette
        out.push(value as u16);
    }
    Ok(out)
}

/// Drop unused and duplicate palette entries and remap the indices
///
/// Entries keep the order of their first use, so a section encoded twice
/// produces the same bytes. Every index must resolve within `palette`.
#[must_use]
pub fn compact(palette: &[BlockState], blocks: &[u16]) -> (Vec<BlockState>, Vec<u16>) {
    let mut remap: Vec<Option<u16>> = vec![None; palette.len()];
    let mut out_palette: Vec<BlockState> = Vec::new();
    let mut out_blocks = Vec::with_capacity(blocks.len().min(SECTION_VOLUME));

    for &idx in blocks {
        let slot = usize::from(idx);
        let new_idx = match remap[slot] {
            Some(new_idx) => new_idx,
            None => {
                let state = &palette[slot];
                let pos = out_palette.iter().position(|s| s == state).unwrap_or_else(|| {
                    out_palette.push(state.clone());
                    out_palette.len() - 1
                });
                // the compacted palette never outgrows the original one
                let new_idx = pos as u16;
                remap[slot] = Some(new_idx);
                new_idx
            }
        };
        out_blocks.push(new_idx);
    }
    (out_palette, out_blocks)
}
