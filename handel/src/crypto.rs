// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Pluggable signature scheme used by Handel, and the multi-signature type
//! flowing through the protocol.

use std::fmt;

use crate::bitset::{BitSet, BitSetFactory};
use crate::error::{CryptoError, HandelError, Result};

/// Public key able to verify (multi-)signatures and to be aggregated with
/// other public keys.
pub trait PublicKey: Clone + fmt::Debug + Send + Sync + 'static {
    type Signature: Signature;

    /// Verifies `sig` over `msg`. Must be safe for concurrent use.
    fn verify_signature(&self, msg: &[u8], sig: &Self::Signature) -> Result<(), CryptoError>;

    /// Combines two public keys so that a multi-signature produced by both
    /// respective secret keys verifies under the result.
    fn combine(&self, other: &Self) -> Self;
}

/// A (multi-)signature that can be aggregated and encoded.
pub trait Signature: Clone + fmt::Debug + Send + Sync + 'static {
    fn marshal_binary(&self) -> Vec<u8>;

    /// Merges two signatures into one that verifies under the combination of
    /// both respective public keys.
    fn combine(&self, other: &Self) -> Self;
}

/// Secret key producing signatures verifiable under its public key.
pub trait SecretKey: Send + Sync {
    type PublicKey: PublicKey<Signature = Self::Signature>;
    type Signature: Signature;

    fn public_key(&self) -> Self::PublicKey;

    fn sign(&self, msg: &[u8]) -> Result<Self::Signature, CryptoError>;
}

/// Entry point of a signature scheme. Handel is generic over this trait and
/// never assumes a specific curve.
pub trait Constructor: Send + Sync + 'static {
    type PublicKey: PublicKey<Signature = Self::Signature>;
    type Signature: Signature;

    /// Neutral public key, the starting point when aggregating keys.
    fn public_key(&self) -> Self::PublicKey;

    /// Neutral signature.
    fn signature(&self) -> Self::Signature;

    fn unmarshal_signature(&self, buf: &[u8]) -> Result<Self::Signature, CryptoError>;
}

/// Public key type of a [`Constructor`].
pub type PublicKeyOf<C> = <C as Constructor>::PublicKey;

/// Signature type of a [`Constructor`].
pub type SignatureOf<C> = <C as Constructor>::Signature;

/// A signature together with the bitset of the identities whose contributions
/// it aggregates. Bit `i` refers to the `i`-th identity of the level the
/// multi-signature belongs to.
#[derive(Clone, Debug)]
pub struct MultiSignature<S> {
    pub bitset: Box<dyn BitSet>,
    pub signature: S,
}

impl<S: PartialEq> PartialEq for MultiSignature<S> {
    fn eq(&self, other: &Self) -> bool {
        *self.bitset == *other.bitset && self.signature == other.signature
    }
}

impl<S: Signature> MultiSignature<S> {
    pub fn new(bitset: Box<dyn BitSet>, signature: S) -> Self {
        Self { bitset, signature }
    }

    pub fn cardinality(&self) -> usize {
        self.bitset.cardinality()
    }

    pub fn bit_length(&self) -> usize {
        self.bitset.bit_length()
    }

    /// Encodes as `u16 bitset length || bitset || signature`.
    pub fn marshal_binary(&self) -> Result<Vec<u8>> {
        let bs = self.bitset.marshal_binary()?;
        let len = u16::try_from(bs.len()).map_err(|_| HandelError::BitSetTooLarge(bs.len()))?;
        let sig = self.signature.marshal_binary();

        let mut buf = Vec::with_capacity(2 + bs.len() + sig.len());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&bs);
        buf.extend_from_slice(&sig);
        Ok(buf)
    }

    /// Decodes a multi-signature produced by [`MultiSignature::marshal_binary`],
    /// using the scheme to decode the signature and `new_bitset` to create the
    /// bitset.
    pub fn unmarshal<C>(buf: &[u8], cons: &C, new_bitset: &BitSetFactory) -> Result<Self>
    where
        C: Constructor<Signature = S>,
    {
        if buf.len() < 2 {
            return Err(HandelError::ShortBuffer {
                need: 2,
                got: buf.len(),
            });
        }
        let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        let end = 2 + len;
        if buf.len() < end {
            return Err(HandelError::ShortBuffer {
                need: end,
                got: buf.len(),
            });
        }
        let mut bitset = new_bitset(0);
        bitset.unmarshal_binary(&buf[2..end])?;
        let signature = cons.unmarshal_signature(&buf[end..])?;
        Ok(Self { bitset, signature })
    }
}

impl<S> fmt::Display for MultiSignature<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ms({}/{})",
            self.bitset.cardinality(),
            self.bitset.bit_length()
        )
    }
}

/// A multi-signature tagged with the level it belongs to and the peer it was
/// received from. Unit of work flowing between the engine, the processing
/// pipeline and the store.
#[derive(Clone, Debug, PartialEq)]
pub struct SigPair<S> {
    pub origin: i32,
    pub level: u8,
    pub ms: MultiSignature<S>,
}

impl<S: Signature> SigPair<S> {
    pub fn new(origin: i32, level: u8, ms: MultiSignature<S>) -> Self {
        Self { origin, level, ms }
    }
}

impl<S> fmt::Display for SigPair<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sig(lvl {} from {}): {}", self.level, self.origin, self.ms)
    }
}
