// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

/// Returns `ceil(log2(size))`, with `log2(0) == log2(1) == 0`.
pub(crate) fn log2(size: usize) -> usize {
    if size <= 1 {
        return 0;
    }
    (usize::BITS - (size - 1).leading_zeros()) as usize
}

pub(crate) fn pow2(exp: usize) -> usize {
    1 << exp
}

/// Returns true if the bit at `index` is set in the binary form of `nb`.
pub(crate) fn is_set(nb: usize, index: usize) -> bool {
    (nb >> index) & 1 == 1
}
