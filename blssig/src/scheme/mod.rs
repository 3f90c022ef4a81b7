// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use bls_signatures::{PrivateKey, PublicKey, Serialize, Signature, verify_messages};
use bls12_381::{G1Projective, G2Projective};
use handel::{Constructor, CryptoError};
use hashlink::LruCache;
use parking_lot::RwLock;
use thiserror::Error;


#[derive(Error, Debug)]
pub enum BLSError {
    #[error("invalid public key length: expected {BLS_PUBLIC_KEY_LENGTH} bytes, got {0}")]
    InvalidPublicKeyLength(usize),
    #[error("failed to deserialize public key: {0}")]
    PublicKeyDeserialization(bls_signatures::Error),
    #[error("invalid signature length: expected {BLS_SIGNATURE_LENGTH} bytes, got {0}")]
    InvalidSignatureLength(usize),
    #[error("failed to deserialize signature: {0}")]
    SignatureDeserialization(bls_signatures::Error),
    #[error("BLS signature verification failed")]
    SignatureVerificationFailed,
}

impl From<BLSError> for CryptoError {
    fn from(err: BLSError) -> Self {
        match err {
            BLSError::SignatureVerificationFailed => CryptoError::InvalidSignature,
            BLSError::InvalidSignatureLength(_) | BLSError::SignatureDeserialization(_) => {
                CryptoError::MalformedSignature(err.to_string().into())
            }
            BLSError::InvalidPublicKeyLength(_) | BLSError::PublicKeyDeserialization(_) => {
                CryptoError::MalformedPublicKey(err.to_string().into())
            }
        }
    }
}

/// BLS12-381 public key length in bytes
const BLS_PUBLIC_KEY_LENGTH: usize = 48;

/// BLS12-381 signature length in bytes
const BLS_SIGNATURE_LENGTH: usize = 96;

/// Maximum number of cached public key points to prevent excessive memory usage
const MAX_POINT_CACHE_SIZE: usize = 10_000;

/// Public key on G1. Combining keys adds the points.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BlsPublicKey(PublicKey);

impl BlsPublicKey {
    pub fn marshal_binary(&self) -> Vec<u8> {
        self.0.as_bytes()
    }
}

impl From<PublicKey> for BlsPublicKey {
    fn from(pk: PublicKey) -> Self {
        Self(pk)
    }
}

impl handel::PublicKey for BlsPublicKey {
    type Signature = BlsSignature;

    fn verify_signature(&self, msg: &[u8], sig: &BlsSignature) -> Result<(), CryptoError> {
        if verify_messages(&sig.0, &[msg], &[self.0]) {
            Ok(())
        } else {
            Err(BLSError::SignatureVerificationFailed.into())
        }
    }

    fn combine(&self, other: &Self) -> Self {
        let sum = G1Projective::from(self.0) + G1Projective::from(other.0);
        Self(sum.into())
    }
}

/// Signature on G2. Combining signatures adds the points.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BlsSignature(Signature);

impl handel::Signature for BlsSignature {
    fn marshal_binary(&self) -> Vec<u8> {
        self.0.as_bytes()
    }

    fn combine(&self, other: &Self) -> Self {
        let sum = G2Projective::from(self.0) + G2Projective::from(other.0);
        Self(sum.into())
    }
}

/// Secret key signing messages hashed to G2.
#[derive(Clone)]
pub struct BlsSecretKey(PrivateKey);

impl From<PrivateKey> for BlsSecretKey {
    fn from(sk: PrivateKey) -> Self {
        Self(sk)
    }
}

impl handel::SecretKey for BlsSecretKey {
    type PublicKey = BlsPublicKey;
    type Signature = BlsSignature;

    fn public_key(&self) -> BlsPublicKey {
        BlsPublicKey(self.0.public_key())
    }

    fn sign(&self, msg: &[u8]) -> Result<BlsSignature, CryptoError> {
        Ok(BlsSignature(self.0.sign(msg)))
    }
}

/// Entry point of the BLS scheme. Also decodes public keys, e.g. when loading
/// a registry, keeping the decoded points in a cache.
pub struct BlsConstructor {
    /// Cache for deserialized public key points to avoid expensive repeated operations
    point_cache: RwLock<LruCache<Vec<u8>, PublicKey>>,
}

impl Default for BlsConstructor {
    fn default() -> Self {
        Self::new()
    }
}

impl BlsConstructor {
    pub fn new() -> Self {
        Self {
            point_cache: RwLock::new(LruCache::new(MAX_POINT_CACHE_SIZE)),
        }
    }

    /// Decodes a compressed G1 point.
    pub fn unmarshal_public_key(&self, buf: &[u8]) -> Result<BlsPublicKey, BLSError> {
        if buf.len() != BLS_PUBLIC_KEY_LENGTH {
            return Err(BLSError::InvalidPublicKeyLength(buf.len()));
        }
        if let Some(cached) = self.point_cache.write().get(buf) {
            return Ok(BlsPublicKey(*cached));
        }
        let pk = PublicKey::from_bytes(buf).map_err(BLSError::PublicKeyDeserialization)?;
        self.point_cache.write().insert(buf.to_vec(), pk);
        Ok(BlsPublicKey(pk))
    }
}

impl Constructor for BlsConstructor {
    type PublicKey = BlsPublicKey;
    type Signature = BlsSignature;

    fn public_key(&self) -> BlsPublicKey {
        BlsPublicKey(G1Projective::identity().into())
    }

    fn signature(&self) -> BlsSignature {
        BlsSignature(G2Projective::identity().into())
    }

    fn unmarshal_signature(&self, buf: &[u8]) -> Result<BlsSignature, CryptoError> {
        if buf.len() != BLS_SIGNATURE_LENGTH {
            return Err(BLSError::InvalidSignatureLength(buf.len()).into());
        }
        let sig = Signature::from_bytes(buf).map_err(BLSError::SignatureDeserialization)?;
        Ok(BlsSignature(sig))
    }
}
