// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Handel, a Byzantine-tolerant aggregation protocol for multi-signatures.
//!
//! Every node holds one signature over a common message and ends up with an
//! aggregate holding a threshold of contributions, after exchanging a
//! logarithmic number of messages. Nodes organize the registry in a binomial
//! tree: at level `L` a node exchanges its aggregate of levels `< L` with the
//! peers of the opposite subtree of size `2^(L-1)`.
//!
//! Key components:
//! - [`Handel`]: the state machine of one node
//! - [`Partitioner`]: candidate sets per level and signature combination
//! - [`SignatureStore`]: best multi-signature per level
//! - [`SignatureProcessing`]: prioritized asynchronous verification
//! - [`TimeoutStrategy`]: starts levels regardless of completion
//!
//! The signature scheme, the registry and the transport are pluggable through
//! the [`Constructor`], [`Registry`] and [`Network`] traits.

pub mod bitset;
pub mod blacklist;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod identity;
pub mod net;
pub mod partitioner;
pub mod processing;
pub mod store;
pub mod timeout;
mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

// re-exports
pub use fvm_ipld_bitfield::BitField;

pub use bitset::{BitSet, BitSetFactory, FieldBitSet};
pub use blacklist::{BlackListStrategy, NoopBlackList};
pub use config::Config;
pub use crypto::{
    Constructor, MultiSignature, PublicKey, PublicKeyOf, SecretKey, SigPair, Signature,
    SignatureOf,
};
pub use engine::Handel;
pub use error::{CryptoError, HandelError, Result};
pub use identity::{ArrayRegistry, Identity, Registry};
pub use net::{Listener, Network, Packet};
pub use partitioner::{BinomialPartitioner, Partitioner, PickOrder};
pub use processing::{SigEvaluator, SignatureProcessing};
pub use store::{ReplaceStore, SignatureStore};
pub use timeout::{InfiniteTimeout, LevelStarter, LinearTimeout, TimeoutStrategy};
