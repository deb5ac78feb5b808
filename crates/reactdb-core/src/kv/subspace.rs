use std::ops::Bound;

use crate::error::EncodingError;

use super::KeyRange;

/// Ends every path segment. Segment names may not contain it.
const SEGMENT_END: u8 = 0x00;

/// Sorts after every byte that can appear in a UTF-8 key.
const PREFIX_END: u8 = 0xFF;

/// A directory-style key prefix isolating one logical store inside a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subspace {
    prefix: Vec<u8>,
}

impl Subspace {
    pub fn new(name: &str) -> Result<Self, EncodingError> {
        Self { prefix: Vec::new() }.at(name)
    }

    /// A child subspace nested under this one.
    pub fn at(&self, name: &str) -> Result<Self, EncodingError> {
        if name.as_bytes().contains(&SEGMENT_END) {
            return Err(EncodingError::NullCharInName);
        }
        let mut prefix = Vec::with_capacity(self.prefix.len() + name.len() + 1);
        prefix.extend_from_slice(&self.prefix);
        prefix.extend_from_slice(name.as_bytes());
        prefix.push(SEGMENT_END);
        Ok(Self { prefix })
    }

    pub fn pack(&self, key: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.prefix.len() + key.len());
        out.extend_from_slice(&self.prefix);
        out.extend_from_slice(key);
        out
    }

    pub fn unpack<'a>(&self, key: &'a [u8]) -> Option<&'a [u8]> {
        key.strip_prefix(self.prefix.as_slice())
    }

    /// Every key in this subspace.
    pub fn range(&self) -> KeyRange {
        self.range_between(Bound::Unbounded, Bound::Unbounded)
    }

    /// Keys in this subspace between two unpacked bounds.
    pub fn range_between(&self, start: Bound<&[u8]>, end: Bound<&[u8]>) -> KeyRange {
        let start = match start {
            Bound::Included(k) => Bound::Included(self.pack(k)),
            Bound::Excluded(k) => Bound::Excluded(self.pack(k)),
            Bound::Unbounded => Bound::Included(self.prefix.clone()),
        };
        let end = match end {
            Bound::Included(k) => Bound::Included(self.pack(k)),
            Bound::Excluded(k) => Bound::Excluded(self.pack(k)),
            Bound::Unbounded => Bound::Excluded(self.pack(&[PREFIX_END])),
        };
        KeyRange::new(start, end)
    }
}
