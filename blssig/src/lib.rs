// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! BLS signature scheme for Handel.
//!
//! It uses the BLS12_381 curve with G1 for public keys and G2 for signatures.
//! Aggregation is the plain sum of points, so every signer must sign the same
//! message and public keys must come with a proof of possession to rule out
//! rogue-key attacks.

mod scheme;

pub use scheme::{BLSError, BlsConstructor, BlsPublicKey, BlsSecretKey, BlsSignature};
