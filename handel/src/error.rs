// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::borrow::Cow;

use thiserror::Error;

/// Errors returned by signature scheme implementations.
#[derive(Error, Debug, PartialEq)]
pub enum CryptoError {
    #[error("signature verification failed")]
    InvalidSignature,

    #[error("malformed signature: {0}")]
    MalformedSignature(Cow<'static, str>),

    #[error("malformed public key: {0}")]
    MalformedPublicKey(Cow<'static, str>),
}

#[derive(Error, Debug)]
pub enum HandelError {
    /// Level outside `[0, bitsize + 1]` for the registry.
    #[error("invalid level {level} for computing candidate set (max {max})")]
    InvalidLevel { level: usize, max: usize },

    /// The candidate set at this level is empty, which happens when the
    /// registry size is not a power of two.
    #[error("empty level {0}")]
    EmptyLevel(usize),

    #[error("registry can't find ids in range [{from}, {to})")]
    RegistryRange { from: usize, to: usize },

    #[error("global id {id} outside range [{min}, {max}) of level {level}")]
    IdOutsideLevel {
        id: i32,
        min: usize,
        max: usize,
        level: usize,
    },

    #[error("packet's origin {origin} out of range for registry of size {size}")]
    OriginOutOfRange { origin: i32, size: usize },

    #[error("invalid packet's level {level} (max {max})")]
    InvalidPacketLevel { level: u8, max: usize },

    #[error("buffer too short: need {need} bytes, got {got}")]
    ShortBuffer { need: usize, got: usize },

    #[error("malformed bitset: {0}")]
    MalformedBitSet(Cow<'static, str>),

    #[error("bitset too large to encode: {0} bytes")]
    BitSetTooLarge(usize),

    #[error("inconsistent bitset with given level: expected {expected} bits, got {actual}")]
    InconsistentBitSet { expected: usize, actual: usize },

    #[error("no signature in the bitset")]
    EmptyBitSet,

    #[error("unknown identity {0}")]
    UnknownIdentity(i32),

    #[error("invalid config: {0}")]
    InvalidConfig(Cow<'static, str>),

    #[error("failed to spawn {name} thread")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

pub type Result<T, E = HandelError> = std::result::Result<T, E>;
