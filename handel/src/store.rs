// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{Span, debug, debug_span};

use crate::bitset::BitSetFactory;
use crate::crypto::{Constructor, MultiSignature, SigPair, Signature, SignatureOf};
use crate::partitioner::Partitioner;

/// Relevance of an unverified signature, the higher the more useful.
pub type Score = usize;

/// The signature brings nothing new and can be dropped.
pub const SCORE_DISCARD: Score = 0;
/// The signature would replace the stored one.
pub const SCORE_IMPROVE: Score = 1;
/// The signature is disjoint from the stored one and would be merged with it.
pub const SCORE_MERGE: Score = 2;

/// Keeps the best multi-signature received so far for each level.
///
/// Implementations must be thread-safe: the store is written by the engine
/// and read by the processing pipeline.
pub trait SignatureStore<C: Constructor>: Send + Sync {
    /// Stores `ms` if it improves the entry at `level`. Returns true if the
    /// entry changed.
    fn store(&self, level: u8, ms: MultiSignature<SignatureOf<C>>) -> bool;

    fn best(&self, level: u8) -> Option<MultiSignature<SignatureOf<C>>>;

    /// Aggregate of all entries of levels `<= level`, spanning the range
    /// expected by the candidate set at `level + 1`.
    fn combined(&self, level: u8) -> Option<MultiSignature<SignatureOf<C>>>;

    /// Aggregate of all entries spanning the whole registry.
    fn full_signature(&self) -> Option<MultiSignature<SignatureOf<C>>>;

    /// Scores `sp` against the current entries without storing it.
    fn evaluate(&self, sp: &SigPair<SignatureOf<C>>) -> Score;
}

/// [`SignatureStore`] replacing an entry by a signature with more
/// contributions, and merging disjoint signatures of the same level.
pub struct ReplaceStore<C: Constructor> {
    id: i32,
    m: Mutex<BTreeMap<u8, MultiSignature<SignatureOf<C>>>>,
    part: Arc<dyn Partitioner<C>>,
    new_bitset: BitSetFactory,
    span: Span,
}

impl<C: Constructor> ReplaceStore<C> {
    pub fn new(
        id: i32,
        part: Arc<dyn Partitioner<C>>,
        new_bitset: BitSetFactory,
        parent: &Span,
    ) -> Self {
        Self {
            id,
            m: Mutex::new(BTreeMap::new()),
            part,
            new_bitset,
            span: debug_span!(parent: parent, "store"),
        }
    }

    fn pairs<'a>(
        &self,
        entries: impl Iterator<Item = (&'a u8, &'a MultiSignature<SignatureOf<C>>)>,
    ) -> Vec<SigPair<SignatureOf<C>>> {
        entries
            .map(|(level, ms)| SigPair::new(self.id, *level, ms.clone()))
            .collect()
    }
}

/// What storing `new` on top of `current` would do.
fn score<S: Signature>(current: Option<&MultiSignature<S>>, new: &MultiSignature<S>) -> Score {
    if new.cardinality() == 0 {
        return SCORE_DISCARD;
    }
    let Some(current) = current else {
        return SCORE_IMPROVE;
    };
    let comparable = current.bit_length() == new.bit_length();
    if comparable && !current.bitset.intersects(new.bitset.as_ref()) {
        SCORE_MERGE
    } else if new.cardinality() > current.cardinality() {
        SCORE_IMPROVE
    } else {
        SCORE_DISCARD
    }
}

impl<C: Constructor> SignatureStore<C> for ReplaceStore<C> {
    fn store(&self, level: u8, ms: MultiSignature<SignatureOf<C>>) -> bool {
        let mut m = self.m.lock();
        let current = m.get(&level);
        match score(current, &ms) {
            SCORE_MERGE => {
                let Some(current) = current else {
                    return false;
                };
                let merged = MultiSignature::new(
                    current.bitset.or(ms.bitset.as_ref()),
                    current.signature.combine(&ms.signature),
                );
                debug!(parent: &self.span, level, %merged, "merged disjoint signatures");
                m.insert(level, merged);
                true
            }
            SCORE_IMPROVE => {
                debug!(parent: &self.span, level, %ms, "replaced signature");
                m.insert(level, ms);
                true
            }
            _ => false,
        }
    }

    fn best(&self, level: u8) -> Option<MultiSignature<SignatureOf<C>>> {
        self.m.lock().get(&level).cloned()
    }

    fn combined(&self, level: u8) -> Option<MultiSignature<SignatureOf<C>>> {
        let level = level.min(self.part.max_level() as u8);
        let sigs = self.pairs(self.m.lock().range(..=level));
        self.part.combine(&sigs, level as usize + 1, &self.new_bitset)
    }

    fn full_signature(&self) -> Option<MultiSignature<SignatureOf<C>>> {
        let sigs = self.pairs(self.m.lock().iter());
        self.part.combine_full(&sigs, &self.new_bitset)
    }

    fn evaluate(&self, sp: &SigPair<SignatureOf<C>>) -> Score {
        score(self.m.lock().get(&sp.level), &sp.ms)
    }
}
