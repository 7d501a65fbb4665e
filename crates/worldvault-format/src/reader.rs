//! Bounds-checked big-endian reader
//!
//! `bytes::Buf` panics on underflow; every decoder goes through this
//! wrapper instead so that truncated input turns into the right error kind.

use bytes::Buf;
use worldvault_common::{Error, Result};

/// Which error kind a decoding failure should produce
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Context {
    Chunk,
    World,
}

pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    ctx: Context,
}

impl<'a> Reader<'a> {
    pub(crate) const fn new(buf: &'a [u8], ctx: Context) -> Self {
        Self { buf, ctx }
    }

    pub(crate) fn error(&self, msg: impl Into<String>) -> Error {
        match self.ctx {
            Context::Chunk => Error::corrupt_chunk(msg),
            Context::World => Error::corrupt_world(msg),
        }
    }

    pub(crate) const fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn need(&self, n: usize, what: &str) -> Result<()> {
        if self.buf.len() < n {
            return Err(self.error(format!(
                "truncated {what}: need {n} bytes, {} left",
                self.buf.len()
            )));
        }
        Ok(())
    }

    pub(crate) fn bytes(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        self.need(n, what)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub(crate) fn u8(&mut self, what: &str) -> Result<u8> {
        self.need(1, what)?;
        Ok(self.buf.get_u8())
    }

    pub(crate) fn i8(&mut self, what: &str) -> Result<i8> {
        self.need(1, what)?;
        Ok(self.buf.get_i8())
    }

    pub(crate) fn u16(&mut self, what: &str) -> Result<u16> {
        self.need(2, what)?;
        Ok(self.buf.get_u16())
    }

    pub(crate) fn i16(&mut self, what: &str) -> Result<i16> {
        self.need(2, what)?;
        Ok(self.buf.get_i16())
    }

    pub(crate) fn u32(&mut self, what: &str) -> Result<u32> {
        self.need(4, what)?;
        Ok(self.buf.get_u32())
    }

    pub(crate) fn i32(&mut self, what: &str) -> Result<i32> {
        self.need(4, what)?;
        Ok(self.buf.get_i32())
    }

    pub(crate) fn u64(&mut self, what: &str) -> Result<u64> {
        self.need(8, what)?;
        Ok(self.buf.get_u64())
    }

    pub(crate) fn i64(&mut self, what: &str) -> Result<i64> {
        self.need(8, what)?;
        Ok(self.buf.get_i64())
    }

    pub(crate) fn f32(&mut self, what: &str) -> Result<f32> {
        self.need(4, what)?;
        Ok(self.buf.get_f32())
    }

    pub(crate) fn f64(&mut self, what: &str) -> Result<f64> {
        self.need(8, what)?;
        Ok(self.buf.get_f64())
    }

    /// Read a `u32` element count and check that `count * elem_size` bytes remain
    pub(crate) fn len(&mut self, elem_size: usize, what: &str) -> Result<usize> {
        let len = self.u32(what)? as usize;
        let bytes = len
            .checked_mul(elem_size)
            .ok_or_else(|| self.error(format!("{what} length {len} overflows")))?;
        if bytes > self.buf.len() {
            return Err(self.error(format!(
                "{what} length {len} exceeds remaining {} bytes",
                self.buf.len()
            )));
        }
        Ok(len)
    }

    pub(crate) fn string(&mut self, what: &str) -> Result<String> {
        let len = self.len(1, what)?;
        let raw = self.bytes(len, what)?;
        String::from_utf8(raw.to_vec()).map_err(|_| self.error(format!("{what} is not valid UTF-8")))
    }

    pub(crate) fn finish(&self, what: &str) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self.error(format!("{} trailing bytes after {what}", self.buf.len())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_big_endian_reads() {
        let data = [0x00, 0x01, 0xFF, 0xFF, 0xFF, 0xFE];
        let mut r = Reader::new(&data, Context::Chunk);
        assert_eq!(r.u16("a").unwrap(), 1);
        assert_eq!(r.i32("b").unwrap(), -2);
        assert!(r.is_empty());
    }

    #[test]
    fn test_truncation_maps_to_context() {
        let data = [0x00];
        let mut r = Reader::new(&data, Context::Chunk);
        assert!(matches!(r.u32("x"), Err(Error::CorruptChunk { .. })));

        let mut r = Reader::new(&data, Context::World);
        assert!(matches!(r.u32("x"), Err(Error::CorruptWorld(_))));
    }

    #[test]
    fn test_len_rejects_oversized_counts() {
        let data = [0x00, 0x00, 0x10, 0x00, 0x01];
        let mut r = Reader::new(&data, Context::World);
        assert!(r.len(4, "biomes").is_err());
    }
}
