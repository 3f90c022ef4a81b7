// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Binomial-tree partitioning of the registry into per-level candidate sets.
//!
//! From the point of view of a node, level `0` is the node itself, level `k`
//! is the sibling subtree of size `2^(k-1)` sharing the `bitsize - k` highest
//! bits of the node's id, and level `bitsize + 1` is the whole id space.

use std::sync::Arc;

use ahash::{HashMap, HashMapExt};
use parking_lot::Mutex;
use rand::RngCore;
use rand::SeedableRng;
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha20Rng;
use tracing::{Span, debug_span, warn};

use crate::bitset::BitSetFactory;
use crate::crypto::{Constructor, MultiSignature, PublicKeyOf, SigPair, Signature, SignatureOf};
use crate::error::{HandelError, Result};
use crate::identity::{Identity, Registry};
use crate::utils::{is_set, log2, pow2};

#[cfg(test)]
mod tests;

/// Splits the registry into candidate sets and combines signatures coming
/// from different sets.
pub trait Partitioner<C: Constructor>: Send + Sync {
    /// Highest level a node goes through, `ceil(log2(n))`.
    fn max_level(&self) -> usize;

    /// Number of identities at `level`, 0 if the level is empty or invalid.
    fn size(&self, level: usize) -> usize;

    /// Non-empty levels in `1..=max_level`, in increasing order.
    fn levels(&self) -> Vec<usize>;

    /// The candidate set at `level`.
    fn identities_at(&self, level: usize) -> Result<&[Identity<PublicKeyOf<C>>]>;

    /// Maps a global id to its index inside the bitset of `level`.
    fn index_at_level(&self, global_id: i32, level: usize) -> Result<usize>;

    /// Returns up to `count` identities of `level` not returned before, or
    /// `None` once the level is exhausted.
    fn pick_next_at(&self, level: usize, count: usize) -> Option<Vec<Identity<PublicKeyOf<C>>>>;

    /// Combines signatures of levels `<= level` into one multi-signature
    /// whose bitset spans every level below `level`. This is the signature
    /// nodes of the candidate set at `level` expect to receive.
    fn combine(
        &self,
        sigs: &[SigPair<SignatureOf<C>>],
        level: usize,
        new_bitset: &BitSetFactory,
    ) -> Option<MultiSignature<SignatureOf<C>>>;

    /// Like [`Partitioner::combine`] but the bitset spans the whole registry,
    /// bit `i` standing for identity `i`.
    fn combine_full(
        &self,
        sigs: &[SigPair<SignatureOf<C>>],
        new_bitset: &BitSetFactory,
    ) -> Option<MultiSignature<SignatureOf<C>>>;
}

/// Order in which [`Partitioner::pick_next_at`] hands out the identities of
/// a level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PickOrder {
    /// Increasing ids.
    Sequential,
    /// A per-level permutation derived from the seed, so that nodes do not
    /// all contact the same first peers.
    Shuffled { seed: [u8; 32] },
}

#[derive(Debug)]
struct Cursor {
    order: Vec<usize>,
    next: usize,
}

/// [`Partitioner`] using the binomial tree of the San Fermin construction.
pub struct BinomialPartitioner<C: Constructor> {
    id: usize,
    bitsize: usize,
    size: usize,
    reg: Arc<dyn Registry<PublicKeyOf<C>>>,
    order: PickOrder,
    picked: Mutex<HashMap<usize, Cursor>>,
    span: Span,
}

impl<C: Constructor> BinomialPartitioner<C> {
    /// Partitioner picking peers in increasing id order.
    pub fn new(id: i32, reg: Arc<dyn Registry<PublicKeyOf<C>>>, parent: &Span) -> Result<Self> {
        Self::with_order(id, reg, PickOrder::Sequential, parent)
    }

    /// Partitioner picking peers in a seeded random order. Without seed, one
    /// is drawn from the OS random source.
    pub fn new_random(
        id: i32,
        reg: Arc<dyn Registry<PublicKeyOf<C>>>,
        seed: Option<[u8; 32]>,
        parent: &Span,
    ) -> Result<Self> {
        let seed = seed.unwrap_or_else(|| {
            let mut seed = [0u8; 32];
            OsRng.fill_bytes(&mut seed);
            seed
        });
        Self::with_order(id, reg, PickOrder::Shuffled { seed }, parent)
    }

    /// Fails if `id` isn't an index of the registry.
    pub fn with_order(
        id: i32,
        reg: Arc<dyn Registry<PublicKeyOf<C>>>,
        order: PickOrder,
        parent: &Span,
    ) -> Result<Self> {
        let size = reg.size();
        let idx = usize::try_from(id)
            .ok()
            .filter(|&idx| idx < size)
            .ok_or(HandelError::UnknownIdentity(id))?;
        Ok(Self {
            id: idx,
            bitsize: log2(size),
            size,
            reg,
            order,
            picked: Mutex::new(HashMap::new()),
            span: debug_span!(parent: parent, "partitioner"),
        })
    }

    fn check_level(&self, level: usize) -> Result<()> {
        if level > self.bitsize + 1 {
            return Err(HandelError::InvalidLevel {
                level,
                max: self.bitsize + 1,
            });
        }
        Ok(())
    }

    /// Range `[min, max)` of the candidate set at `level`. The walk follows
    /// the bits of the id from the highest one, staying in the node's own
    /// half, and takes the opposite half at bit `level - 1`.
    pub(crate) fn range_level(&self, level: usize) -> Result<(usize, usize)> {
        self.check_level(level)?;
        let (min, max) = self.walk(level, true);
        if min >= self.size {
            return Err(HandelError::EmptyLevel(level));
        }
        Ok((min, max.min(self.size)))
    }

    /// Range covering the node's own subtree for `level`, i.e. the union of
    /// all candidate sets of the levels below.
    pub(crate) fn range_level_inverse(&self, level: usize) -> Result<(usize, usize)> {
        self.check_level(level)?;
        let (min, max) = self.walk(level, false);
        Ok((min, max.min(self.size)))
    }

    fn walk(&self, level: usize, invert: bool) -> (usize, usize) {
        let mut min = 0;
        let mut max = pow2(self.bitsize);
        let target = level as isize - 1;
        let mut idx = self.bitsize as isize - 1;
        while idx >= target && idx >= 0 && min < max {
            let middle = (min + max) / 2;
            let own_half = is_set(self.id, idx as usize);
            let upper = if invert && idx == target {
                !own_half
            } else {
                own_half
            };
            if upper {
                min = middle;
            } else {
                max = middle;
            }
            idx -= 1;
        }
        (min, max)
    }

    fn pick_order(&self, level: usize, len: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..len).collect();
        if let PickOrder::Shuffled { seed } = self.order {
            let mut rng = ChaCha20Rng::from_seed(seed);
            rng.set_stream(level as u64);
            order.shuffle(&mut rng);
        }
        order
    }

    /// Start of the candidate set of `level`, where the bits of a signature
    /// of that level go.
    fn sig_offset(&self, level: usize) -> Option<usize> {
        match self.range_level(level) {
            Ok((min, _)) => Some(min),
            Err(err) => {
                warn!(parent: &self.span, level, error = %err, "skipping signature");
                None
            }
        }
    }

    /// Writes the bits of every signature at `offset(level)` in a fresh
    /// bitset of `length` bits and aggregates the signatures.
    fn combine_with(
        &self,
        sigs: &[SigPair<SignatureOf<C>>],
        length: usize,
        new_bitset: &BitSetFactory,
        offset: impl Fn(usize) -> Option<usize>,
    ) -> Option<MultiSignature<SignatureOf<C>>> {
        let mut bitset = new_bitset(length);
        let mut signature: Option<SignatureOf<C>> = None;
        for sp in sigs {
            let level = sp.level as usize;
            let Some(offset) = offset(level) else {
                continue;
            };
            for i in sp.ms.bitset.ones() {
                bitset.set(offset + i, true);
            }
            signature = Some(match signature {
                Some(acc) => acc.combine(&sp.ms.signature),
                None => sp.ms.signature.clone(),
            });
        }
        signature.map(|signature| MultiSignature::new(bitset, signature))
    }
}

impl<C: Constructor> Partitioner<C> for BinomialPartitioner<C> {
    fn max_level(&self) -> usize {
        self.bitsize
    }

    fn size(&self, level: usize) -> usize {
        self.range_level(level)
            .map(|(min, max)| max - min)
            .unwrap_or_default()
    }

    fn levels(&self) -> Vec<usize> {
        (1..=self.max_level())
            .filter(|&level| self.range_level(level).is_ok())
            .collect()
    }

    fn identities_at(&self, level: usize) -> Result<&[Identity<PublicKeyOf<C>>]> {
        let (min, max) = self.range_level(level)?;
        self.reg
            .identities(min, max)
            .ok_or(HandelError::RegistryRange { from: min, to: max })
    }

    fn index_at_level(&self, global_id: i32, level: usize) -> Result<usize> {
        let (min, max) = self.range_level(level)?;
        match usize::try_from(global_id) {
            Ok(id) if (min..max).contains(&id) => Ok(id - min),
            _ => {
                let err = HandelError::IdOutsideLevel {
                    id: global_id,
                    min,
                    max,
                    level,
                };
                warn!(parent: &self.span, error = %err, "id outside of level");
                Err(err)
            }
        }
    }

    fn pick_next_at(&self, level: usize, count: usize) -> Option<Vec<Identity<PublicKeyOf<C>>>> {
        let ids = self.identities_at(level).ok()?;
        let mut picked = self.picked.lock();
        let cursor = picked.entry(level).or_insert_with(|| Cursor {
            order: self.pick_order(level, ids.len()),
            next: 0,
        });
        if count == 0 || cursor.next >= cursor.order.len() {
            return None;
        }
        let end = (cursor.next + count).min(cursor.order.len());
        let out = cursor.order[cursor.next..end]
            .iter()
            .map(|&i| ids[i].clone())
            .collect();
        cursor.next = end;
        Some(out)
    }

    fn combine(
        &self,
        sigs: &[SigPair<SignatureOf<C>>],
        level: usize,
        new_bitset: &BitSetFactory,
    ) -> Option<MultiSignature<SignatureOf<C>>> {
        if sigs.is_empty() {
            return None;
        }
        if let Some(sp) = sigs.iter().find(|sp| sp.level as usize > level) {
            warn!(
                parent: &self.span,
                sig_level = sp.level,
                level,
                "invalid combination of signature and requested level"
            );
            return None;
        }
        let (global_min, global_max) = match self.range_level_inverse(level) {
            Ok(range) => range,
            Err(err) => {
                warn!(parent: &self.span, error = %err, "can't combine signatures");
                return None;
            }
        };
        self.combine_with(sigs, global_max - global_min, new_bitset, |lvl| {
            self.sig_offset(lvl).map(|min| min - global_min)
        })
    }

    fn combine_full(
        &self,
        sigs: &[SigPair<SignatureOf<C>>],
        new_bitset: &BitSetFactory,
    ) -> Option<MultiSignature<SignatureOf<C>>> {
        if sigs.is_empty() {
            return None;
        }
        self.combine_with(sigs, self.size, new_bitset, |lvl| self.sig_offset(lvl))
    }
}
