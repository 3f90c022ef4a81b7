// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Fixed-length bit sets used to mark which identities contributed to a
//! multi-signature.

use std::fmt;
use std::sync::Arc;

use fvm_ipld_bitfield::BitField;

use crate::error::{HandelError, Result};

/// Creates an empty bit set of the given length. Used to build aggregated
/// bitsets and to parse incoming packets.
pub type BitSetFactory = Arc<dyn Fn(usize) -> Box<dyn BitSet> + Send + Sync>;

/// A bit set of fixed length. Out of range indexes are ignored by
/// [`BitSet::set`] and read as `false` by [`BitSet::get`]; a bit set never
/// grows after construction.
pub trait BitSet: fmt::Debug + Send + Sync {
    /// Fixed number of bits in this set.
    fn bit_length(&self) -> usize;
    /// Number of bits set to one.
    fn cardinality(&self) -> usize;
    fn set(&mut self, idx: usize, value: bool);
    fn get(&self, idx: usize) -> bool;
    /// Returns a new bit set of length `self.bit_length() + other.bit_length()`
    /// holding the bits of `self` followed by the bits of `other`.
    fn combine(&self, other: &dyn BitSet) -> Box<dyn BitSet>;
    /// Returns the bits in `[from, to)` as a new bit set, or a copy of `self`
    /// if the range is invalid.
    fn slice(&self, from: usize, to: usize) -> Box<dyn BitSet>;
    /// Bitwise OR, keeping the length of `self`.
    fn or(&self, other: &dyn BitSet) -> Box<dyn BitSet>;
    /// Bitwise AND, keeping the length of `self`.
    fn and(&self, other: &dyn BitSet) -> Box<dyn BitSet>;
    /// Indexes of all bits set to one, in increasing order.
    fn ones(&self) -> Vec<usize>;
    fn marshal_binary(&self) -> Result<Vec<u8>>;
    /// Replaces the content of this bit set, length included, with the decoded
    /// buffer.
    fn unmarshal_binary(&mut self, buf: &[u8]) -> Result<()>;
    fn clone_box(&self) -> Box<dyn BitSet>;

    fn none(&self) -> bool {
        self.cardinality() == 0
    }

    fn all(&self) -> bool {
        self.cardinality() == self.bit_length()
    }

    /// True if both sets share at least one bit set to one.
    fn intersects(&self, other: &dyn BitSet) -> bool {
        !self.and(other).none()
    }
}

impl Clone for Box<dyn BitSet> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

impl PartialEq for dyn BitSet {
    fn eq(&self, other: &Self) -> bool {
        self.bit_length() == other.bit_length() && self.ones() == other.ones()
    }
}

impl Eq for dyn BitSet {}

/// Default [`BitSet`] backed by an RLE+ encoded [`BitField`].
///
/// The binary form is the bit length as a big-endian `u16` followed by the
/// RLE+ encoding of the set bits.
#[derive(Clone, Default, PartialEq)]
pub struct FieldBitSet {
    length: usize,
    bits: BitField,
}

impl FieldBitSet {
    pub fn new(length: usize) -> Self {
        Self {
            length,
            bits: BitField::new(),
        }
    }

    /// Returns a [`BitSetFactory`] creating [`FieldBitSet`]s.
    pub fn factory() -> BitSetFactory {
        Arc::new(|length: usize| Box::new(FieldBitSet::new(length)) as Box<dyn BitSet>)
    }

    fn with_bits(length: usize, ones: impl IntoIterator<Item = usize>) -> Self {
        let mut bs = Self::new(length);
        for idx in ones {
            bs.set(idx, true);
        }
        bs
    }
}

impl fmt::Debug for FieldBitSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bits: String = (0..self.length)
            .map(|i| if self.get(i) { '1' } else { '0' })
            .collect();
        write!(f, "BitSet({}/{}: {})", self.cardinality(), self.length, bits)
    }
}

impl BitSet for FieldBitSet {
    fn bit_length(&self) -> usize {
        self.length
    }

    fn cardinality(&self) -> usize {
        self.bits.len() as usize
    }

    fn set(&mut self, idx: usize, value: bool) {
        if idx >= self.length {
            return;
        }
        if value {
            self.bits.set(idx as u64);
        } else {
            self.bits.unset(idx as u64);
        }
    }

    fn get(&self, idx: usize) -> bool {
        idx < self.length && self.bits.get(idx as u64)
    }

    fn combine(&self, other: &dyn BitSet) -> Box<dyn BitSet> {
        let offset = self.length;
        let ones = self
            .ones()
            .into_iter()
            .chain(other.ones().into_iter().map(|i| i + offset));
        Box::new(Self::with_bits(self.length + other.bit_length(), ones))
    }

    fn slice(&self, from: usize, to: usize) -> Box<dyn BitSet> {
        if from > to || to > self.length {
            return self.clone_box();
        }
        let ones = self
            .ones()
            .into_iter()
            .filter(|&i| i >= from && i < to)
            .map(|i| i - from);
        Box::new(Self::with_bits(to - from, ones))
    }

    fn or(&self, other: &dyn BitSet) -> Box<dyn BitSet> {
        let ones = self.ones().into_iter().chain(other.ones());
        Box::new(Self::with_bits(self.length, ones))
    }

    fn and(&self, other: &dyn BitSet) -> Box<dyn BitSet> {
        let ones = self.ones().into_iter().filter(|&i| other.get(i));
        Box::new(Self::with_bits(self.length, ones))
    }

    fn ones(&self) -> Vec<usize> {
        self.bits.iter().map(|i| i as usize).collect()
    }

    fn marshal_binary(&self) -> Result<Vec<u8>> {
        let length = u16::try_from(self.length).map_err(|_| {
            HandelError::MalformedBitSet(format!("bit length {} exceeds u16", self.length).into())
        })?;
        let encoded = self.bits.to_bytes();
        let mut buf = Vec::with_capacity(2 + encoded.len());
        buf.extend_from_slice(&length.to_be_bytes());
        buf.extend_from_slice(&encoded);
        Ok(buf)
    }

    fn unmarshal_binary(&mut self, buf: &[u8]) -> Result<()> {
        if buf.len() < 2 {
            return Err(HandelError::ShortBuffer {
                need: 2,
                got: buf.len(),
            });
        }
        let length = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        let bits = BitField::from_bytes(&buf[2..])
            .map_err(|e| HandelError::MalformedBitSet(e.to_string().into()))?;
        // one step per run, a short encoding may hold a huge run
        if let Some(end) = bits.ranges().last().map(|r| r.end) {
            if end > length as u64 {
                return Err(HandelError::MalformedBitSet(
                    format!("bit {} set beyond length {length}", end - 1).into(),
                ));
            }
        }
        self.length = length;
        self.bits = bits;
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn BitSet> {
        Box::new(self.clone())
    }
}
