// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Fake signature scheme, in-process network and cluster helpers for tests.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Sender, unbounded};
use parking_lot::Mutex;

use crate::config::Config;
use crate::crypto::{
    Constructor, MultiSignature, PublicKey, PublicKeyOf, SecretKey, Signature, SignatureOf,
};
use crate::engine::Handel;
use crate::error::{CryptoError, HandelError, Result};
use crate::identity::{ArrayRegistry, Identity, Registry};
use crate::net::{Listener, Network, Packet};

/// Signature scheme where keys and signatures are sets of signer ids.
#[derive(Debug, Default, Clone, Copy)]
pub struct FakeConstructor;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FakePublicKey(BTreeSet<i32>);

impl FakePublicKey {
    pub fn new(id: i32) -> Self {
        Self(BTreeSet::from([id]))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeSignature {
    signers: BTreeSet<i32>,
    valid: bool,
}

impl FakeSignature {
    pub fn from_signers(signers: impl IntoIterator<Item = i32>) -> Self {
        Self {
            signers: signers.into_iter().collect(),
            valid: true,
        }
    }

    /// A signature that never verifies.
    pub fn invalid(signers: impl IntoIterator<Item = i32>) -> Self {
        Self {
            valid: false,
            ..Self::from_signers(signers)
        }
    }

    pub fn signers(&self) -> &BTreeSet<i32> {
        &self.signers
    }
}

impl Signature for FakeSignature {
    fn marshal_binary(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + 4 * self.signers.len());
        buf.push(self.valid as u8);
        for id in &self.signers {
            buf.extend_from_slice(&id.to_be_bytes());
        }
        buf
    }

    fn combine(&self, other: &Self) -> Self {
        Self {
            signers: self.signers.union(&other.signers).copied().collect(),
            valid: self.valid && other.valid,
        }
    }
}

impl PublicKey for FakePublicKey {
    type Signature = FakeSignature;

    fn verify_signature(&self, _msg: &[u8], sig: &FakeSignature) -> Result<(), CryptoError> {
        if sig.valid && sig.signers == self.0 {
            Ok(())
        } else {
            Err(CryptoError::InvalidSignature)
        }
    }

    fn combine(&self, other: &Self) -> Self {
        Self(self.0.union(&other.0).copied().collect())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FakeSecretKey {
    pub id: i32,
}

impl SecretKey for FakeSecretKey {
    type PublicKey = FakePublicKey;
    type Signature = FakeSignature;

    fn public_key(&self) -> FakePublicKey {
        FakePublicKey::new(self.id)
    }

    fn sign(&self, _msg: &[u8]) -> Result<FakeSignature, CryptoError> {
        Ok(FakeSignature::from_signers([self.id]))
    }
}

impl Constructor for FakeConstructor {
    type PublicKey = FakePublicKey;
    type Signature = FakeSignature;

    fn public_key(&self) -> FakePublicKey {
        FakePublicKey::default()
    }

    fn signature(&self) -> FakeSignature {
        FakeSignature::from_signers([])
    }

    fn unmarshal_signature(&self, buf: &[u8]) -> Result<FakeSignature, CryptoError> {
        let Some((&valid, ids)) = buf.split_first() else {
            return Err(CryptoError::MalformedSignature("empty buffer".into()));
        };
        if ids.len() % 4 != 0 {
            return Err(CryptoError::MalformedSignature(
                format!("trailing {} bytes", ids.len() % 4).into(),
            ));
        }
        Ok(FakeSignature {
            signers: ids
                .chunks_exact(4)
                .map(|c| i32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            valid: valid == 1,
        })
    }
}

/// Registry of `n` identities with fake keys.
pub fn fake_registry(n: usize) -> Arc<dyn Registry<FakePublicKey>> {
    Arc::new(ArrayRegistry::new(
        (0..n as i32)
            .map(|i| Identity::new(i, format!("fake-{i}"), FakeSecretKey { id: i }.public_key()))
            .collect(),
    ))
}

type Listeners = Arc<Mutex<Vec<Arc<dyn Listener>>>>;

/// In-process [`Network`]. Every node has a dispatcher thread delivering the
/// packets sent to it, after a round trip through the wire encoding.
pub struct TestNetwork {
    routes: Arc<Vec<Sender<Vec<u8>>>>,
    listeners: Listeners,
}

impl TestNetwork {
    /// Connected networks for nodes `0..n`.
    pub fn cluster(n: usize) -> Result<Vec<Arc<TestNetwork>>> {
        let mut senders = Vec::with_capacity(n);
        let mut nodes = Vec::with_capacity(n);
        for i in 0..n {
            let (tx, rx) = unbounded::<Vec<u8>>();
            let listeners: Listeners = Arc::default();
            let dispatch = listeners.clone();
            std::thread::Builder::new()
                .name(format!("test-network-{i}"))
                .spawn(move || {
                    for buf in rx {
                        let Ok(packet) = Packet::unmarshal_binary(&buf) else {
                            continue;
                        };
                        let listeners = dispatch.lock().clone();
                        for l in listeners {
                            l.new_packet(&packet);
                        }
                    }
                })
                .map_err(|source| HandelError::Spawn {
                    name: "network",
                    source,
                })?;
            senders.push(tx);
            nodes.push(listeners);
        }
        let routes = Arc::new(senders);
        Ok(nodes
            .into_iter()
            .map(|listeners| {
                Arc::new(TestNetwork {
                    routes: routes.clone(),
                    listeners,
                })
            })
            .collect())
    }
}

impl<P> Network<P> for TestNetwork {
    fn register_listener(&self, listener: Arc<dyn Listener>) {
        self.listeners.lock().push(listener);
    }

    fn send(&self, identities: &[Identity<P>], packet: &Packet) {
        let buf = packet.marshal_binary();
        for id in identities {
            if let Some(route) = usize::try_from(id.id()).ok().and_then(|i| self.routes.get(i)) {
                let _ = route.send(buf.clone());
            }
        }
    }
}

/// A set of Handel nodes over a [`TestNetwork`]. Offline nodes have no Handel
/// instance: packets sent to them are dropped.
pub struct TestCluster<C: Constructor> {
    reg: Arc<dyn Registry<PublicKeyOf<C>>>,
    nodes: Vec<Option<Handel<C>>>,
}

impl<C: Constructor> TestCluster<C> {
    /// Creates one node per signature, node `i` contributing `sigs[i]`.
    pub fn new(
        cons: Arc<C>,
        reg: Arc<dyn Registry<PublicKeyOf<C>>>,
        sigs: Vec<SignatureOf<C>>,
        msg: &[u8],
        config: Config<C>,
        offline: &[i32],
    ) -> Result<Self> {
        let nets = TestNetwork::cluster(sigs.len())?;
        let mut nodes = Vec::with_capacity(sigs.len());
        for ((id, sig), net) in (0..).zip(sigs).zip(nets) {
            if offline.contains(&id) {
                nodes.push(None);
                continue;
            }
            let handel = Handel::new(
                net,
                reg.clone(),
                id,
                cons.clone(),
                msg,
                sig,
                config.clone(),
            )?;
            nodes.push(Some(handel));
        }
        Ok(Self { reg, nodes })
    }

    pub fn registry(&self) -> &Arc<dyn Registry<PublicKeyOf<C>>> {
        &self.reg
    }

    pub fn node(&self, id: usize) -> Option<&Handel<C>> {
        self.nodes.get(id).and_then(Option::as_ref)
    }

    pub fn online(&self) -> impl Iterator<Item = &Handel<C>> {
        self.nodes.iter().flatten()
    }

    pub fn start(&self) -> Result<()> {
        for h in self.online() {
            h.start()?;
        }
        Ok(())
    }

    pub fn stop(&self) {
        for h in self.online() {
            h.stop();
        }
    }

    /// Waits until every online node output a signature with at least
    /// `threshold` contributions, and returns these signatures in node order.
    /// Returns `None` on timeout.
    pub fn wait_complete_success(
        &self,
        threshold: usize,
        timeout: Duration,
    ) -> Option<Vec<MultiSignature<SignatureOf<C>>>> {
        let deadline = Instant::now() + timeout;
        let mut out = Vec::new();
        for h in self.online() {
            let finals = h.final_signatures();
            loop {
                let ms = finals.recv_deadline(deadline).ok()?;
                if ms.cardinality() >= threshold {
                    out.push(ms);
                    break;
                }
            }
        }
        Some(out)
    }
}

/// A cluster of `n` nodes over the fake signature scheme.
pub fn fake_cluster(
    n: usize,
    config: Config<FakeConstructor>,
    offline: &[i32],
) -> Result<TestCluster<FakeConstructor>> {
    let sigs = (0..n as i32)
        .map(|id| FakeSecretKey { id }.sign(b"handel"))
        .collect::<Result<Vec<_>, _>>()?;
    TestCluster::new(
        Arc::new(FakeConstructor),
        fake_registry(n),
        sigs,
        b"handel",
        config,
        offline,
    )
}
