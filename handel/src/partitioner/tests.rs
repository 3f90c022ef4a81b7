// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use tracing::Span;

use super::*;
use crate::bitset::{BitSet, FieldBitSet};
use crate::test_utils::{FakeConstructor, FakeSignature, fake_registry};

fn partitioner(id: i32, n: usize) -> BinomialPartitioner<FakeConstructor> {
    BinomialPartitioner::new(id, fake_registry(n), &Span::none()).unwrap()
}

/// One complete multi-signature per level, as a node would store them.
fn full_pairs(
    part: &BinomialPartitioner<FakeConstructor>,
    levels: &[usize],
) -> Vec<SigPair<FakeSignature>> {
    levels
        .iter()
        .map(|&level| {
            let (min, max) = part.range_level(level).unwrap();
            let mut bs = FieldBitSet::new(max - min);
            for i in 0..max - min {
                bs.set(i, true);
            }
            let sig = FakeSignature::from_signers((min..max).map(|i| i as i32));
            SigPair::new(0, level as u8, MultiSignature::new(Box::new(bs), sig))
        })
        .collect()
}

#[test]
fn test_range_level() {
    let part = partitioner(1, 16);
    let cases = [
        (0, Some((1, 2))),
        (1, Some((0, 1))),
        (2, Some((2, 4))),
        (3, Some((4, 8))),
        (4, Some((8, 16))),
        (5, Some((0, 16))),
        (6, None),
        (7, None),
    ];
    for (level, expected) in cases {
        let range = part.range_level(level).ok();
        assert_eq!(range, expected, "level {level}");
        if let Some((from, to)) = expected {
            let ids = part.identities_at(level).unwrap();
            let got: Vec<i32> = ids.iter().map(Identity::id).collect();
            let want: Vec<i32> = (from as i32..to as i32).collect();
            assert_eq!(got, want, "identities at level {level}");
        } else {
            assert!(part.identities_at(level).is_err());
        }
    }
}

#[test]
fn test_range_level_inverse() {
    let part = partitioner(1, 16);
    let cases = [
        (0, Some((1, 2))),
        (1, Some((1, 2))),
        (2, Some((0, 2))),
        (3, Some((0, 4))),
        (4, Some((0, 8))),
        (5, Some((0, 16))),
        (7, None),
    ];
    for (level, expected) in cases {
        assert_eq!(part.range_level_inverse(level).ok(), expected, "level {level}");
    }
}

#[test]
fn test_max_level() {
    for (n, expected) in [(8, 3), (16, 4), (2, 1), (5, 3), (1, 0)] {
        assert_eq!(partitioner(1.min(n as i32 - 1), n).max_level(), expected, "n = {n}");
    }
}

#[test]
fn test_levels_skip_empty() {
    assert_eq!(partitioner(1, 16).levels(), vec![1, 2, 3, 4]);
    assert_eq!(partitioner(0, 5).levels(), vec![1, 2, 3]);

    // node 4 of 5 is alone in the upper half of the tree
    let part = partitioner(4, 5);
    assert_eq!(part.levels(), vec![3]);
    assert_eq!(part.size(1), 0);
    assert_eq!(part.size(2), 0);
    assert_eq!(part.size(3), 4);
    assert!(matches!(
        part.range_level(2),
        Err(HandelError::EmptyLevel(2))
    ));
}

#[test]
fn test_levels_partition_registry() {
    for n in [2, 4, 8, 16, 32] {
        for id in 0..n {
            let part = partitioner(id as i32, n);
            let mut seen = vec![false; n];
            for level in 0..=part.max_level() {
                let (min, max) = part.range_level(level).unwrap();
                assert_eq!(max - min, pow2(level.saturating_sub(1)));
                for (idx, slot) in seen.iter_mut().enumerate().take(max).skip(min) {
                    assert!(!*slot, "id {idx} covered twice for node {id} of {n}");
                    *slot = true;
                }
                // the candidate set and the node's own subtree form the next subtree
                let (own_min, own_max) = part.range_level_inverse(level).unwrap();
                let (next_min, next_max) = part.range_level_inverse(level + 1).unwrap();
                if level > 0 {
                    assert_eq!(next_min, min.min(own_min));
                    assert_eq!(next_max, max.max(own_max));
                }
            }
            assert!(seen.iter().all(|s| *s), "node {id} of {n} misses ids");
        }
    }
}

#[test]
fn test_index_at_level() {
    let part = partitioner(1, 16);
    assert_eq!(part.index_at_level(9, 4).unwrap(), 1);
    assert_eq!(part.index_at_level(0, 1).unwrap(), 0);
    assert_eq!(part.index_at_level(7, 3).unwrap(), 3);
    assert!(matches!(
        part.index_at_level(3, 4),
        Err(HandelError::IdOutsideLevel { id: 3, min: 8, max: 16, level: 4 })
    ));
    assert!(part.index_at_level(-1, 4).is_err());
    assert!(part.index_at_level(9, 9).is_err());
}

#[test]
fn test_pick_next_at() {
    let part = partitioner(1, 16);
    // (level, count, expected lengths of successive picks)
    let cases: [(usize, usize, &[Option<usize>]); 3] = [
        (1, 1, &[Some(1), None]),
        (2, 10, &[Some(2), None]),
        (3, 2, &[Some(2), Some(2), None]),
    ];
    for (level, count, expected) in cases {
        for (i, exp) in expected.iter().enumerate() {
            let ids = part.pick_next_at(level, count);
            assert_eq!(ids.as_ref().map(Vec::len), *exp, "level {level} pick {i}");
        }
    }
    // the cursor of a level never resets
    assert!(part.pick_next_at(2, 1).is_none());
    assert_eq!(part.pick_next_at(4, 0), None);
    assert_eq!(part.pick_next_at(9, 1), None);
}

#[test]
fn test_pick_next_at_exact_count() {
    let part = partitioner(1, 16);
    let ids = part.pick_next_at(3, 4).unwrap();
    assert_eq!(ids.iter().map(Identity::id).collect::<Vec<_>>(), [4, 5, 6, 7]);
    assert!(part.pick_next_at(3, 4).is_none());
}

#[test]
fn test_random_partitioner() {
    let reg = fake_registry(16);
    let span = Span::none();
    let random = |seed: [u8; 32]| {
        BinomialPartitioner::<FakeConstructor>::new_random(1, reg.clone(), Some(seed), &span)
            .unwrap()
    };
    let r1 = random([1; 32]);
    let r2 = random([2; 32]);
    let r1bis = random([1; 32]);
    let seq = BinomialPartitioner::<FakeConstructor>::new(1, reg.clone(), &span).unwrap();

    let ids = |p: &BinomialPartitioner<FakeConstructor>| -> Vec<i32> {
        p.pick_next_at(4, 8).unwrap().iter().map(Identity::id).collect()
    };
    let ids1 = ids(&r1);
    assert_ne!(ids1, ids(&r2));
    assert_ne!(ids1, ids(&seq));
    assert_eq!(ids1, ids(&r1bis));

    // same identities, different order
    let mut sorted = ids1.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, (8..16).collect::<Vec<_>>());

    // picks continue from the permutation without repeating
    let first = r2.pick_next_at(3, 2).unwrap();
    let second = r2.pick_next_at(3, 2).unwrap();
    assert!(first.iter().all(|a| second.iter().all(|b| a.id() != b.id())));
    assert!(r2.pick_next_at(3, 2).is_none());
}

#[test]
fn test_combine() {
    let part = partitioner(1, 16);
    let nbs = FieldBitSet::factory();

    let ms = part.combine(&full_pairs(&part, &[0, 1, 2, 3]), 4, &nbs).unwrap();
    assert_eq!(ms.bit_length(), 8);
    assert!(ms.bitset.all());
    assert_eq!(ms.signature, FakeSignature::from_signers(0..8));

    let ms = part.combine(&full_pairs(&part, &[2]), 3, &nbs).unwrap();
    assert_eq!(ms.bit_length(), 4);
    assert_eq!(ms.bitset.ones(), vec![2, 3]);
    assert_eq!(ms.signature, FakeSignature::from_signers([2, 3]));

    // holes at level 1 leave the first bit unset
    let ms = part.combine(&full_pairs(&part, &[0, 2, 3]), 4, &nbs).unwrap();
    assert_eq!(ms.bit_length(), 8);
    assert_eq!(ms.bitset.ones(), vec![1, 2, 3, 4, 5, 6, 7]);

    assert!(part.combine(&[], 4, &nbs).is_none());
    assert!(part.combine(&full_pairs(&part, &[4]), 3, &nbs).is_none());
}

#[test]
fn test_combine_full() {
    let part = partitioner(1, 16);
    let nbs = FieldBitSet::factory();

    let ms = part.combine_full(&full_pairs(&part, &[0, 1, 2, 3]), &nbs).unwrap();
    assert_eq!(ms.bit_length(), 16);
    assert_eq!(ms.bitset.ones(), (0..8).collect::<Vec<_>>());

    let ms = part.combine_full(&full_pairs(&part, &[2]), &nbs).unwrap();
    assert_eq!(ms.bit_length(), 16);
    assert_eq!(ms.bitset.ones(), vec![2, 3]);

    let mut pairs = full_pairs(&part, &[0, 1, 2, 3, 4]);
    for i in 0..7 {
        pairs[4].ms.bitset.set(i, false);
    }
    pairs[3].ms.bitset.set(1, false);
    pairs[3].ms.bitset.set(2, false);
    let ms = part.combine_full(&pairs, &nbs).unwrap();
    assert_eq!(ms.bitset.ones(), vec![0, 1, 2, 3, 4, 7, 15]);

    assert!(part.combine_full(&[], &nbs).is_none());
}

#[test]
fn test_rejects_ids_outside_registry() {
    let reg = fake_registry(8);
    let span = Span::none();
    for id in [-1, 8, i32::MAX] {
        assert!(matches!(
            BinomialPartitioner::<FakeConstructor>::new(id, reg.clone(), &span),
            Err(HandelError::UnknownIdentity(got)) if got == id
        ));
        assert!(
            BinomialPartitioner::<FakeConstructor>::new_random(id, reg.clone(), None, &span)
                .is_err()
        );
    }
    assert!(BinomialPartitioner::<FakeConstructor>::new(7, reg, &span).is_ok());
}
