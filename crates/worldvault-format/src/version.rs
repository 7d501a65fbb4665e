//! Format version constants
//!
//! Version history:
//! - `1`: sections store palette indices as a plain `u16` array, no light data
//! - `2`: palette indices are bit-packed at minimal width, optional light arrays

use worldvault_common::{Error, Result};

/// Oldest format version that can still be decoded
pub const OLDEST_VERSION: u8 = 1;

/// Version written by the encoders
pub const CURRENT_VERSION: u8 = 2;

/// Fail with `UnsupportedVersion` unless `version` has a decoding path
pub fn check(version: u8) -> Result<()> {
    if (OLDEST_VERSION..=CURRENT_VERSION).contains(&version) {
        Ok(())
    } else {
        Err(Error::UnsupportedVersion {
            version,
            oldest: OLDEST_VERSION,
            newest: CURRENT_VERSION,
        })
    }
}
