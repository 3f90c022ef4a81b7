// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The Handel state machine.
//!
//! A node starts at level 0, holding its own signature, and moves up one
//! level each time the current level is complete or the timeout strategy
//! decides so. Starting level `L` sends the aggregate of levels `< L` to
//! peers of the candidate set at `L`. Verified signatures coming back are
//! stored, then checked for level completion and for a new best final
//! signature, published on [`Handel::final_signatures`].

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use ahash::{HashMap, HashMapExt};
use crossbeam_channel::{Receiver, Sender, bounded, select, tick, unbounded};
use parking_lot::Mutex;
use strum_macros::Display;
use tracing::{Span, debug, error, info, info_span, trace, warn};

use crate::config::Config;
use crate::crypto::{Constructor, MultiSignature, PublicKeyOf, SigPair, SignatureOf};
use crate::error::{HandelError, Result};
use crate::identity::{Identity, Registry};
use crate::net::{Listener, Network, Packet};
use crate::partitioner::Partitioner;
use crate::processing::SignatureProcessing;
use crate::store::{ReplaceStore, SignatureStore};
use crate::timeout::{LevelStarter, TimeoutStrategy};

#[cfg(test)]
mod tests;

/// Handlers run on every verified signature, in this order, under the
/// engine lock.
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
#[strum(serialize_all = "snake_case")]
enum Actor {
    CheckCompletedLevel,
    CheckFinalSignature,
}

const ACTORS: [Actor; 2] = [Actor::CheckCompletedLevel, Actor::CheckFinalSignature];

/// Send state of a started level for the periodic update.
#[derive(Debug, Default)]
struct LevelSend {
    /// Next peer of the level to contact, wrapping around.
    pos: usize,
    /// Peers contacted since the aggregate last improved.
    sent: usize,
    /// Cardinality of the aggregate last sent.
    card: usize,
}

struct State<C: Constructor> {
    running: bool,
    done: bool,
    curr_level: usize,
    started: BTreeSet<usize>,
    completed: BTreeSet<usize>,
    sends: HashMap<usize, LevelSend>,
    best: Option<MultiSignature<SignatureOf<C>>>,
    out: Option<Sender<MultiSignature<SignatureOf<C>>>>,
}

struct Inner<C: Constructor> {
    id: i32,
    net: Arc<dyn Network<PublicKeyOf<C>>>,
    reg: Arc<dyn Registry<PublicKeyOf<C>>>,
    cons: Arc<C>,
    part: Arc<dyn Partitioner<C>>,
    store: Arc<dyn SignatureStore<C>>,
    proc: SignatureProcessing<C>,
    timeout: Mutex<Box<dyn TimeoutStrategy>>,
    config: Config<C>,
    threshold: usize,
    state: Mutex<State<C>>,
    finals: Receiver<MultiSignature<SignatureOf<C>>>,
    periodic_stop: Mutex<Option<Sender<()>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    span: Span,
}

/// Network listener and level starter handed out to collaborators. Holds a
/// weak reference so that dropping the [`Handel`] handle releases the node.
struct Hook<C: Constructor>(Weak<Inner<C>>);

impl<C: Constructor> Listener for Hook<C> {
    fn new_packet(&self, packet: &Packet) {
        if let Some(inner) = self.0.upgrade() {
            inner.new_packet(packet);
        }
    }
}

impl<C: Constructor> LevelStarter for Hook<C> {
    fn start_next_level(&self) -> bool {
        self.0
            .upgrade()
            .is_some_and(|inner| inner.start_next_level())
    }
}

/// A Handel node aggregating signatures over one message.
///
/// The node stops when [`Handel::stop`] is called or when it is dropped.
pub struct Handel<C: Constructor> {
    inner: Arc<Inner<C>>,
}

impl<C: Constructor> Handel<C> {
    /// Creates the node `id` of the registry, contributing `sig` over `msg`.
    /// It registers itself as a listener of `net` but does nothing before
    /// [`Handel::start`].
    pub fn new(
        net: Arc<dyn Network<PublicKeyOf<C>>>,
        reg: Arc<dyn Registry<PublicKeyOf<C>>>,
        id: i32,
        cons: Arc<C>,
        msg: &[u8],
        sig: SignatureOf<C>,
        config: Config<C>,
    ) -> Result<Self> {
        config.validate()?;
        usize::try_from(id)
            .ok()
            .and_then(|idx| reg.identity(idx))
            .ok_or(HandelError::UnknownIdentity(id))?;

        let span = info_span!(parent: &config.span, "node", id);
        let part = (config.new_partitioner)(id, reg.clone(), &span)?;
        let store: Arc<dyn SignatureStore<C>> = Arc::new(ReplaceStore::new(
            id,
            part.clone(),
            config.new_bitset.clone(),
            &span,
        ));
        let mut own = (config.new_bitset)(1);
        own.set(0, true);
        store.store(0, MultiSignature::new(own, sig));

        let evaluator = (config.new_evaluator_strategy)(store.clone());
        let proc = SignatureProcessing::new(
            part.clone(),
            cons.clone(),
            Arc::from(msg),
            evaluator,
            config.black_list.clone(),
            &span,
        );
        let threshold = config.threshold(reg.size());
        let (out, finals) = unbounded();

        let inner = Arc::new_cyclic(|weak: &Weak<Inner<C>>| {
            let starter: Arc<dyn LevelStarter> = Arc::new(Hook(weak.clone()));
            let timeout = (config.new_timeout_strategy)(starter, part.max_level());
            Inner {
                id,
                net,
                reg,
                cons,
                part,
                store,
                proc,
                timeout: Mutex::new(timeout),
                threshold,
                state: Mutex::new(State {
                    running: false,
                    done: false,
                    curr_level: 0,
                    started: BTreeSet::new(),
                    completed: BTreeSet::from([0]),
                    sends: HashMap::new(),
                    best: None,
                    out: Some(out),
                }),
                finals,
                periodic_stop: Mutex::new(None),
                threads: Mutex::new(Vec::new()),
                span,
                config,
            }
        });
        inner
            .net
            .register_listener(Arc::new(Hook(Arc::downgrade(&inner))));
        debug!(
            parent: &inner.span,
            size = inner.reg.size(),
            max_level = inner.part.max_level(),
            threshold,
            "node created"
        );
        Ok(Self { inner })
    }

    /// Starts verifying incoming signatures, the periodic update and the
    /// timeout strategy, then enters level 1. Calling it again is a no-op.
    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.running || state.done {
                return Ok(());
            }
            state.running = true;
        }
        let inner = &self.inner;
        inner.proc.start()?;

        let verified = inner.proc.verified();
        let weak = Arc::downgrade(inner);
        let drain = std::thread::Builder::new()
            .name("handel-verified".into())
            .spawn(move || {
                for sp in verified.iter() {
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    inner.on_verified(sp);
                }
            })
            .map_err(|source| HandelError::Spawn {
                name: "verified",
                source,
            })?;
        inner.threads.lock().push(drain);

        let (stop, stopped) = bounded::<()>(0);
        let ticker = tick(inner.config.update_period);
        let weak = Arc::downgrade(inner);
        let periodic = std::thread::Builder::new()
            .name("handel-periodic".into())
            .spawn(move || {
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            let Some(inner) = weak.upgrade() else {
                                return;
                            };
                            inner.periodic_update();
                        }
                        recv(stopped) -> _ => return,
                    }
                }
            })
            .map_err(|source| HandelError::Spawn {
                name: "periodic",
                source,
            })?;
        *inner.periodic_stop.lock() = Some(stop);
        inner.threads.lock().push(periodic);

        inner.timeout.lock().start()?;

        let mut state = inner.state.lock();
        inner.advance(&mut state);
        // a registry of one is complete from the start
        inner.check_final_signature(&mut state);
        info!(parent: &inner.span, "handel started");
        Ok(())
    }

    /// Stops every routine of the node and closes the channel of final
    /// signatures. Idempotent.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Channel of the successive best signatures reaching the threshold, each
    /// one with strictly more contributions than the previous one. Bit `i` of
    /// their bitset stands for identity `i` of the registry.
    pub fn final_signatures(&self) -> Receiver<MultiSignature<SignatureOf<C>>> {
        self.inner.finals.clone()
    }

    pub fn id(&self) -> i32 {
        self.inner.id
    }

    /// Minimum number of contributions of a published signature.
    pub fn threshold(&self) -> usize {
        self.inner.threshold
    }

    pub fn current_level(&self) -> usize {
        self.inner.state.lock().curr_level
    }

    pub fn partitioner(&self) -> &Arc<dyn Partitioner<C>> {
        &self.inner.part
    }

    /// Starts the level after the current one, as the timeout strategy does.
    /// Returns false if every level is already started.
    pub fn start_next_level(&self) -> bool {
        self.inner.start_next_level()
    }
}

impl<C: Constructor> Drop for Handel<C> {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

impl<C: Constructor> Inner<C> {
    fn new_packet(&self, packet: &Packet) {
        let state = self.state.lock();
        if state.done {
            return;
        }
        if self.config.black_list.is_black_listed(packet.origin) {
            debug!(parent: &self.span, origin = packet.origin, "dropping packet from black-listed peer");
            return;
        }
        match self.parse_packet(packet) {
            Ok(sp) => {
                trace!(parent: &self.span, origin = sp.origin, level = sp.level, "received signature");
                self.proc.add(sp);
            }
            Err(err) => {
                warn!(
                    parent: &self.span,
                    origin = packet.origin,
                    level = packet.level,
                    error = %err,
                    "invalid packet"
                );
                self.config.black_list.update(packet.origin, &err);
            }
        }
    }

    /// Validates the header of the packet and decodes its multi-signature.
    fn parse_packet(&self, packet: &Packet) -> Result<SigPair<SignatureOf<C>>> {
        let size = self.reg.size();
        if usize::try_from(packet.origin).map_or(true, |origin| origin >= size) {
            return Err(HandelError::OriginOutOfRange {
                origin: packet.origin,
                size,
            });
        }
        let level = packet.level as usize;
        let max = self.part.max_level();
        if level > max {
            return Err(HandelError::InvalidPacketLevel {
                level: packet.level,
                max,
            });
        }
        let expected = self.part.size(level);
        if expected == 0 {
            return Err(HandelError::EmptyLevel(level));
        }
        let ms = MultiSignature::unmarshal(
            &packet.multi_sig,
            self.cons.as_ref(),
            &self.config.new_bitset,
        )?;
        if ms.bit_length() != expected {
            return Err(HandelError::InconsistentBitSet {
                expected,
                actual: ms.bit_length(),
            });
        }
        if ms.cardinality() == 0 {
            return Err(HandelError::EmptyBitSet);
        }
        self.part.index_at_level(packet.origin, level)?;
        Ok(SigPair::new(packet.origin, packet.level, ms))
    }

    fn start_next_level(&self) -> bool {
        let mut state = self.state.lock();
        self.advance(&mut state)
    }

    /// Moves to the next non-empty level and sends it the current aggregate.
    /// Keeps going while the newly started level is already complete.
    /// Returns false if no level was started.
    fn advance(&self, state: &mut State<C>) -> bool {
        let max = self.part.max_level();
        let mut started = false;
        loop {
            if state.done {
                return started;
            }
            if state.curr_level >= max {
                debug!(parent: &self.span, level = state.curr_level, "already at max level");
                return started;
            }
            state.curr_level += 1;
            let level = state.curr_level;
            if self.part.size(level) == 0 {
                debug!(parent: &self.span, level, "skipping empty level");
                continue;
            }
            state.started.insert(level);
            started = true;
            info!(parent: &self.span, level, "starting level");
            if let Some(peers) = self.part.pick_next_at(level, self.config.candidate_count) {
                self.send_combined(level, &peers);
            }
            if !state.completed.contains(&level) {
                return true;
            }
        }
    }

    fn on_verified(&self, sp: SigPair<SignatureOf<C>>) {
        let mut state = self.state.lock();
        if state.done {
            return;
        }
        let level = sp.level;
        if !self.store.store(level, sp.ms) {
            trace!(parent: &self.span, level, origin = sp.origin, "signature didn't improve the store");
        }
        for actor in ACTORS {
            trace!(parent: &self.span, %actor, level, "running actor");
            match actor {
                Actor::CheckCompletedLevel => self.check_completed_level(&mut state, level),
                Actor::CheckFinalSignature => self.check_final_signature(&mut state),
            }
        }
    }

    fn check_completed_level(&self, state: &mut State<C>, level: u8) {
        let lvl = level as usize;
        if state.completed.contains(&lvl) {
            return;
        }
        let Some(best) = self.store.best(level) else {
            panic!("no signature stored at level {level} after storing a verified one");
        };
        if best.cardinality() < self.part.size(lvl) {
            return;
        }
        state.completed.insert(lvl);
        info!(parent: &self.span, level, "level complete");

        // started levels above now have a better aggregate to send
        let upper: Vec<usize> = state.started.range(lvl + 1..).copied().collect();
        for up in upper {
            if let Some(peers) = self.part.pick_next_at(up, self.config.candidate_count) {
                self.send_combined(up, &peers);
            }
        }
        if lvl == state.curr_level {
            self.advance(state);
        }
    }

    fn check_final_signature(&self, state: &mut State<C>) {
        if state.done {
            return;
        }
        let Some(ms) = self.store.full_signature() else {
            return;
        };
        let card = ms.cardinality();
        if card < self.threshold {
            return;
        }
        if state.best.as_ref().is_some_and(|best| card <= best.cardinality()) {
            return;
        }
        info!(
            parent: &self.span,
            cardinality = card,
            threshold = self.threshold,
            size = self.reg.size(),
            "new best signature"
        );
        if let Some(out) = &state.out {
            let _ = out.send(ms.clone());
        }
        state.best = Some(ms);
    }

    /// Sends the aggregate of the levels below `level` to the next peers of
    /// every started level, unless they all received it already.
    fn periodic_update(&self) {
        let mut state = self.state.lock();
        if state.done {
            return;
        }
        let state = &mut *state;
        for &level in &state.started {
            let Ok(ids) = self.part.identities_at(level) else {
                continue;
            };
            let Some(ms) = self.store.combined(level as u8 - 1) else {
                continue;
            };
            let send = state.sends.entry(level).or_default();
            if ms.cardinality() > send.card {
                send.card = ms.cardinality();
                send.sent = 0;
            }
            if send.sent >= ids.len() {
                continue;
            }
            let count = self.config.update_count.min(ids.len());
            let peers: Vec<Identity<PublicKeyOf<C>>> = (0..count)
                .map(|k| ids[(send.pos + k) % ids.len()].clone())
                .collect();
            send.pos = (send.pos + count) % ids.len();
            send.sent += count;
            self.send_multi_signature(level, &ms, &peers);
        }
    }

    fn send_combined(&self, level: usize, peers: &[Identity<PublicKeyOf<C>>]) {
        match self.store.combined(level as u8 - 1) {
            Some(ms) => self.send_multi_signature(level, &ms, peers),
            None => error!(parent: &self.span, level, "no signature to send"),
        }
    }

    fn send_multi_signature(
        &self,
        level: usize,
        ms: &MultiSignature<SignatureOf<C>>,
        peers: &[Identity<PublicKeyOf<C>>],
    ) {
        let multi_sig = match ms.marshal_binary() {
            Ok(buf) => buf,
            Err(err) => {
                error!(parent: &self.span, level, error = %err, "can't encode multi-signature");
                return;
            }
        };
        let packet = Packet {
            origin: self.id,
            level: level as u8,
            multi_sig,
        };
        debug!(
            parent: &self.span,
            level,
            peers = ?peers.iter().map(Identity::id).collect::<Vec<_>>(),
            %ms,
            "sending"
        );
        self.net.send(peers, &packet);
    }

    fn stop(&self) {
        {
            let mut state = self.state.lock();
            if state.done {
                return;
            }
            state.done = true;
            state.out.take();
        }
        self.proc.stop();
        self.timeout.lock().stop();
        self.periodic_stop.lock().take();
        let threads = std::mem::take(&mut *self.threads.lock());
        let current = std::thread::current().id();
        for handle in threads {
            if handle.thread().id() != current && handle.join().is_err() {
                warn!(parent: &self.span, "handel thread panicked");
            }
        }
        info!(parent: &self.span, "handel stopped");
    }
}
