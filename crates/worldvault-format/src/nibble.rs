//! 4-bit per block light storage

use crate::chunk::SECTION_VOLUME;
use worldvault_common::{Error, Result};

/// Packed array of 4096 nibbles, two per byte, low nibble first
#[derive(Clone, PartialEq, Eq)]
pub struct NibbleArray(Box<[u8]>);

impl NibbleArray {
    /// Size of the backing buffer in bytes
    pub const BYTES: usize = SECTION_VOLUME / 2;

    /// Array with every nibble set to zero
    #[must_use]
    pub fn new() -> Self {
        Self(vec![0; Self::BYTES].into_boxed_slice())
    }

    /// Array with every nibble set to `value` (masked to 4 bits)
    #[must_use]
    pub fn filled(value: u8) -> Self {
        let v = value & 0x0F;
        Self(vec![v | (v << 4); Self::BYTES].into_boxed_slice())
    }

    /// Wrap raw bytes, which must be exactly [`Self::BYTES`] long
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() != Self::BYTES {
            return Err(Error::InvalidChunk(format!(
                "nibble array must be {} bytes, got {}",
                Self::BYTES,
                bytes.len()
            )));
        }
        Ok(Self(bytes.into_boxed_slice()))
    }

    /// Value at `index`
    ///
    /// # Panics
    ///
    /// Panics if `index >= 4096`.
    #[must_use]
    pub fn get(&self, index: usize) -> u8 {
        let byte = self.0[index / 2];
        if index % 2 == 0 { byte & 0x0F } else { byte >> 4 }
    }

    /// Set the value at `index` (masked to 4 bits)
    ///
    /// # Panics
    ///
    /// Panics if `index >= 4096`.
    pub fn set(&mut self, index: usize, value: u8) {
        let v = value & 0x0F;
        let byte = &mut self.0[index / 2];
        *byte = if index % 2 == 0 {
            (*byte & 0xF0) | v
        } else {
            (*byte & 0x0F) | (v << 4)
        };
    }

    /// Raw backing bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Default for NibbleArray {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NibbleArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lit = self.0.iter().filter(|b| **b != 0).count();
        write!(f, "NibbleArray({lit} non-zero bytes)")
    }
}
