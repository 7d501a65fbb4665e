//! Structured tag data
//!
//! A small self-describing key/value encoding used for tile entities,
//! entities, palette properties and world properties. Type codes follow the
//! familiar NBT numbering so records imported from older formats keep their
//! shape:
//!
//! ```text
//! 0 end   1 byte   2 short   3 int   4 long   5 float   6 double
//! 7 byte[]   8 string   9 list   10 compound   11 int[]   12 long[]
//! ```
//!
//! Compound payload: `(u8 type, string name, payload)*` terminated by `0`.
//! List payload: `u8 element type, u32 count, payload*`. Strings and arrays
//! carry a `u32` length prefix.

use crate::reader::Reader;
use bytes::{BufMut, BytesMut};
use std::collections::BTreeMap;
use worldvault_common::{Error, Result};

/// Maximum nesting depth of compounds and lists, counting the outermost
/// compound as the first level
pub const MAX_DEPTH: usize = 64;

/// Type code of a tag
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TagType {
    End = 0,
    Byte = 1,
    Short = 2,
    Int = 3,
    Long = 4,
    Float = 5,
    Double = 6,
    ByteArray = 7,
    String = 8,
    List = 9,
    Compound = 10,
    IntArray = 11,
    LongArray = 12,
}

impl TagType {
    /// Decode a type code
    #[must_use]
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::End),
            1 => Some(Self::Byte),
            2 => Some(Self::Short),
            3 => Some(Self::Int),
            4 => Some(Self::Long),
            5 => Some(Self::Float),
            6 => Some(Self::Double),
            7 => Some(Self::ByteArray),
            8 => Some(Self::String),
            9 => Some(Self::List),
            10 => Some(Self::Compound),
            11 => Some(Self::IntArray),
            12 => Some(Self::LongArray),
            _ => None,
        }
    }
}

/// A single tag value
#[derive(Clone, Debug, PartialEq)]
pub enum Tag {
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    ByteArray(Vec<u8>),
    String(String),
    /// Homogeneous list; every element must have the same type
    List(Vec<Tag>),
    Compound(CompoundTag),
    IntArray(Vec<i32>),
    LongArray(Vec<i64>),
}

impl Tag {
    /// Type code of this tag
    #[must_use]
    pub const fn tag_type(&self) -> TagType {
        match self {
            Self::Byte(_) => TagType::Byte,
            Self::Short(_) => TagType::Short,
            Self::Int(_) => TagType::Int,
            Self::Long(_) => TagType::Long,
            Self::Float(_) => TagType::Float,
            Self::Double(_) => TagType::Double,
            Self::ByteArray(_) => TagType::ByteArray,
            Self::String(_) => TagType::String,
            Self::List(_) => TagType::List,
            Self::Compound(_) => TagType::Compound,
            Self::IntArray(_) => TagType::IntArray,
            Self::LongArray(_) => TagType::LongArray,
        }
    }

    fn write_payload(&self, buf: &mut BytesMut, depth: usize) -> Result<()> {
        match self {
            Self::Byte(v) => buf.put_i8(*v),
            Self::Short(v) => buf.put_i16(*v),
            Self::Int(v) => buf.put_i32(*v),
            Self::Long(v) => buf.put_i64(*v),
            Self::Float(v) => buf.put_f32(*v),
            Self::Double(v) => buf.put_f64(*v),
            Self::ByteArray(v) => {
                put_len(buf, v.len())?;
                buf.put_slice(v);
            }
            Self::String(v) => put_str(buf, v)?,
            Self::List(items) => {
                if depth >= MAX_DEPTH {
                    return Err(Error::serialization("tag nesting too deep"));
                }
                let element = items.first().map_or(TagType::End, Self::tag_type);
                if items.iter().any(|t| t.tag_type() != element) {
                    return Err(Error::serialization("list elements must share one type"));
                }
                buf.put_u8(element as u8);
                put_len(buf, items.len())?;
                for item in items {
                    item.write_payload(buf, depth + 1)?;
                }
            }
            Self::Compound(c) => c.write_payload_at(buf, depth)?,
            Self::IntArray(v) => {
                put_len(buf, v.len())?;
                for x in v {
                    buf.put_i32(*x);
                }
            }
            Self::LongArray(v) => {
                put_len(buf, v.len())?;
                for x in v {
                    buf.put_i64(*x);
                }
            }
        }
        Ok(())
    }

    fn read_payload(ty: TagType, r: &mut Reader<'_>, depth: usize) -> Result<Self> {
        Ok(match ty {
            TagType::End => return Err(r.error("unexpected end tag")),
            TagType::Byte => Self::Byte(r.i8("byte tag")?),
            TagType::Short => Self::Short(r.i16("short tag")?),
            TagType::Int => Self::Int(r.i32("int tag")?),
            TagType::Long => Self::Long(r.i64("long tag")?),
            TagType::Float => Self::Float(r.f32("float tag")?),
            TagType::Double => Self::Double(r.f64("double tag")?),
            TagType::ByteArray => {
                let len = r.len(1, "byte array tag")?;
                Self::ByteArray(r.bytes(len, "byte array tag")?.to_vec())
            }
            TagType::String => Self::String(r.string("string tag")?),
            TagType::List => {
                if depth >= MAX_DEPTH {
                    return Err(r.error("tag nesting too deep"));
                }
                let code = r.u8("list element type")?;
                let element = TagType::from_u8(code)
                    .ok_or_else(|| r.error(format!("unknown tag type {code}")))?;
                // Every element takes at least one byte, except in lists of end tags.
                let len = r.len(usize::from(element != TagType::End), "list tag")?;
                if element == TagType::End && len > 0 {
                    return Err(r.error("non-empty list of end tags"));
                }
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(Self::read_payload(element, r, depth + 1)?);
                }
                Self::List(items)
            }
            TagType::Compound => Self::Compound(CompoundTag::read_payload_at(r, depth)?),
            TagType::IntArray => {
                let len = r.len(4, "int array tag")?;
                let mut v = Vec::with_capacity(len);
                for _ in 0..len {
                    v.push(r.i32("int array tag")?);
                }
                Self::IntArray(v)
            }
            TagType::LongArray => {
                let len = r.len(8, "long array tag")?;
                let mut v = Vec::with_capacity(len);
                for _ in 0..len {
                    v.push(r.i64("long array tag")?);
                }
                Self::LongArray(v)
            }
        })
    }
}

macro_rules! impl_from_tag {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Tag {
                fn from(v: $ty) -> Self {
                    Self::$variant(v.into())
                }
            }
        )*
    };
}

impl_from_tag! {
    i8 => Byte,
    i16 => Short,
    i32 => Int,
    i64 => Long,
    f32 => Float,
    f64 => Double,
    String => String,
    &str => String,
    Vec<u8> => ByteArray,
    Vec<i32> => IntArray,
    Vec<i64> => LongArray,
    Vec<Tag> => List,
    CompoundTag => Compound,
}

/// Named collection of tags
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompoundTag(BTreeMap<String, Tag>);

impl CompoundTag {
    /// Create an empty compound
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, returning the previous one
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Tag>) -> Option<Tag> {
        self.0.insert(key.into(), value.into())
    }

    /// Builder-style insert
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Tag>) -> Self {
        self.insert(key, value);
        self
    }

    /// Look up a value
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Tag> {
        self.0.get(key)
    }

    /// Remove a value
    pub fn remove(&mut self, key: &str) -> Option<Tag> {
        self.0.remove(key)
    }

    /// Look up an int value
    #[must_use]
    pub fn get_int(&self, key: &str) -> Option<i32> {
        match self.0.get(key) {
            Some(Tag::Int(v)) => Some(*v),
            _ => None,
        }
    }

    /// Look up a string value
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.0.get(key) {
            Some(Tag::String(v)) => Some(v),
            _ => None,
        }
    }

    /// Look up a nested compound
    #[must_use]
    pub fn get_compound(&self, key: &str) -> Option<&Self> {
        match self.0.get(key) {
            Some(Tag::Compound(v)) => Some(v),
            _ => None,
        }
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the compound is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over entries in key order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Tag)> {
        self.0.iter()
    }

    /// Copy every entry of `other` into this compound, overwriting on conflict
    pub fn merge(&mut self, other: &Self) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    /// Append the compound payload to `buf`
    pub fn write_payload(&self, buf: &mut BytesMut) -> Result<()> {
        self.write_payload_at(buf, 0)
    }

    fn write_payload_at(&self, buf: &mut BytesMut, depth: usize) -> Result<()> {
        if depth >= MAX_DEPTH {
            return Err(Error::serialization("tag nesting too deep"));
        }
        for (name, tag) in &self.0 {
            buf.put_u8(tag.tag_type() as u8);
            put_str(buf, name)?;
            tag.write_payload(buf, depth + 1)?;
        }
        buf.put_u8(TagType::End as u8);
        Ok(())
    }

    pub(crate) fn read_payload(r: &mut Reader<'_>) -> Result<Self> {
        Self::read_payload_at(r, 0)
    }

    fn read_payload_at(r: &mut Reader<'_>, depth: usize) -> Result<Self> {
        if depth >= MAX_DEPTH {
            return Err(r.error("tag nesting too deep"));
        }
        let mut map = BTreeMap::new();
        loop {
            let code = r.u8("compound entry type")?;
            let ty = TagType::from_u8(code)
                .ok_or_else(|| r.error(format!("unknown tag type {code}")))?;
            if ty == TagType::End {
                break;
            }
            let name = r.string("compound entry name")?;
            let tag = Tag::read_payload(ty, r, depth + 1)?;
            if map.insert(name, tag).is_some() {
                return Err(r.error("duplicate compound entry"));
            }
        }
        Ok(Self(map))
    }
}

impl FromIterator<(String, Tag)> for CompoundTag {
    fn from_iter<I: IntoIterator<Item = (String, Tag)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Write a `u32` length prefix
pub(crate) fn put_len(buf: &mut BytesMut, len: usize) -> Result<()> {
    let len = u32::try_from(len)
        .map_err(|_| Error::serialization(format!("length {len} does not fit in u32")))?;
    buf.put_u32(len);
    Ok(())
}

/// Write a length-prefixed UTF-8 string
pub(crate) fn put_str(buf: &mut BytesMut, s: &str) -> Result<()> {
    put_len(buf, s.len())?;
    buf.put_slice(s.as_bytes());
    Ok(())
}

/// Write a count-prefixed sequence of compound payloads
pub(crate) fn put_compounds(buf: &mut BytesMut, records: &[CompoundTag]) -> Result<()> {
    put_len(buf, records.len())?;
    for record in records {
        record.write_payload(buf)?;
    }
    Ok(())
}

/// Read a count-prefixed sequence of compound payloads
pub(crate) fn read_compounds(r: &mut Reader<'_>, what: &str) -> Result<Vec<CompoundTag>> {
    // An empty compound still takes its terminating byte.
    let len = r.len(1, what)?;
    let mut records = Vec::with_capacity(len);
    for _ in 0..len {
        records.push(CompoundTag::read_payload(r)?);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::Context;

    fn sample() -> CompoundTag {
        CompoundTag::new()
            .with("id", "minecraft:chest")
            .with("x", 12)
            .with("y", 64)
            .with("z", -3)
            .with("CustomName", "Loot")
            .with("Lock", 0i8)
            .with("Age", 12_000i64)
            .with("Motion", vec![Tag::Double(0.5), Tag::Double(-1.25), Tag::Double(0.0)])
            .with("Rotation", vec![Tag::Float(90.0), Tag::Float(0.0)])
            .with("Fire", -20i16)
            .with("Data", vec![1u8, 2, 3])
            .with("Palette", vec![1i32, 2, 3])
            .with("States", vec![i64::MIN, 0, i64::MAX])
            .with(
                "Items",
                vec![Tag::Compound(
                    CompoundTag::new().with("Slot", 0i8).with("id", "minecraft:diamond"),
                )],
            )
    }

    fn roundtrip(c: &CompoundTag) -> CompoundTag {
        let mut buf = BytesMut::new();
        c.write_payload(&mut buf).unwrap();
        let mut r = Reader::new(&buf, Context::Chunk);
        let back = CompoundTag::read_payload(&mut r).unwrap();
        assert!(r.is_empty());
        back
    }

    #[test]
    fn test_compound_roundtrip() {
        let c = sample();
        assert_eq!(roundtrip(&c), c);
    }

    #[test]
    fn test_empty_structures() {
        let c = CompoundTag::new()
            .with("empty_list", Vec::<Tag>::new())
            .with("empty_compound", CompoundTag::new())
            .with("empty_string", "");
        assert_eq!(roundtrip(&c), c);
    }

    #[test]
    fn test_heterogeneous_list_rejected() {
        let c = CompoundTag::new().with("mixed", vec![Tag::Int(1), Tag::Long(2)]);
        let mut buf = BytesMut::new();
        assert!(matches!(
            c.write_payload(&mut buf),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn test_unknown_type_code_rejected() {
        // type 13 does not exist
        let data = [13u8, 0, 0, 0, 1, b'a', 0];
        let mut r = Reader::new(&data, Context::Chunk);
        assert!(matches!(
            CompoundTag::read_payload(&mut r),
            Err(Error::CorruptChunk { .. })
        ));
    }

    #[test]
    fn test_truncated_compound_rejected() {
        let mut buf = BytesMut::new();
        sample().write_payload(&mut buf).unwrap();
        let cut = &buf[..buf.len() - 5];
        let mut r = Reader::new(cut, Context::Chunk);
        assert!(CompoundTag::read_payload(&mut r).is_err());
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut buf = BytesMut::new();
        for _ in 0..2 {
            buf.put_u8(TagType::Byte as u8);
            put_str(&mut buf, "k").unwrap();
            buf.put_i8(1);
        }
        buf.put_u8(0);
        let mut r = Reader::new(&buf, Context::World);
        assert!(matches!(
            CompoundTag::read_payload(&mut r),
            Err(Error::CorruptWorld(_))
        ));
    }

    #[test]
    fn test_excessive_nesting_rejected() {
        let mut tag = Tag::Compound(CompoundTag::new());
        for _ in 0..MAX_DEPTH {
            tag = Tag::List(vec![tag]);
        }
        let c = CompoundTag::new().with("deep", tag);
        let mut buf = BytesMut::new();
        assert!(c.write_payload(&mut buf).is_err());
    }

    /// `levels` compounds nested inside each other, the outermost included
    fn nested_compound_bytes(levels: usize) -> BytesMut {
        let mut buf = BytesMut::new();
        for _ in 1..levels {
            buf.put_u8(TagType::Compound as u8);
            put_str(&mut buf, "n").unwrap();
        }
        for _ in 0..levels {
            buf.put_u8(TagType::End as u8);
        }
        buf
    }

    fn nested_compound(levels: usize) -> CompoundTag {
        let mut c = CompoundTag::new();
        for _ in 1..levels {
            c = CompoundTag::new().with("n", c);
        }
        c
    }

    #[test]
    fn test_nesting_limit_on_read() {
        let at_limit = nested_compound_bytes(MAX_DEPTH);
        let mut r = Reader::new(&at_limit, Context::Chunk);
        assert_eq!(
            CompoundTag::read_payload(&mut r).unwrap(),
            nested_compound(MAX_DEPTH)
        );
        assert!(r.is_empty());

        let past_limit = nested_compound_bytes(MAX_DEPTH + 1);
        let mut r = Reader::new(&past_limit, Context::Chunk);
        assert!(matches!(
            CompoundTag::read_payload(&mut r),
            Err(Error::CorruptChunk { .. })
        ));
    }

    #[test]
    fn test_nesting_limit_on_write() {
        let mut buf = BytesMut::new();
        nested_compound(MAX_DEPTH).write_payload(&mut buf).unwrap();
        assert_eq!(buf, nested_compound_bytes(MAX_DEPTH));

        let mut buf = BytesMut::new();
        assert!(matches!(
            nested_compound(MAX_DEPTH + 1).write_payload(&mut buf),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn test_accessors_and_merge() {
        let mut c = sample();
        assert_eq!(c.get_int("x"), Some(12));
        assert_eq!(c.get_str("id"), Some("minecraft:chest"));
        assert_eq!(c.get_int("id"), None);

        let other = CompoundTag::new().with("x", 99).with("extra", 1i8);
        c.merge(&other);
        assert_eq!(c.get_int("x"), Some(99));
        assert!(c.get("extra").is_some());
    }
}
