// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Asynchronous verification of incoming multi-signatures.
//!
//! Packets parsed by the engine are queued here. A dedicated thread scores the
//! pending signatures, verifies the most relevant one and publishes it on the
//! verified channel. Signatures that become useless while waiting are dropped
//! without spending a verification on them.

use std::sync::Arc;
use std::thread::JoinHandle;

use ahash::{HashMap, HashMapExt};
use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use tracing::{Span, debug, debug_span, warn};

use crate::blacklist::BlackListStrategy;
use crate::crypto::{Constructor, PublicKey, SigPair, SignatureOf};
use crate::error::{HandelError, Result};
use crate::partitioner::Partitioner;
use crate::store::{SCORE_DISCARD, SCORE_IMPROVE, Score, SignatureStore};


/// Scores unverified signatures so that verification time is spent on the
/// most useful ones first. A score of 0 drops the signature.
pub trait SigEvaluator<C: Constructor>: Send + Sync {
    fn evaluate(&self, sp: &SigPair<SignatureOf<C>>) -> Score;
}

/// Delegates to [`SignatureStore::evaluate`].
pub struct StoreEvaluator<C: Constructor> {
    store: Arc<dyn SignatureStore<C>>,
}

impl<C: Constructor> StoreEvaluator<C> {
    pub fn new(store: Arc<dyn SignatureStore<C>>) -> Self {
        Self { store }
    }
}

impl<C: Constructor> SigEvaluator<C> for StoreEvaluator<C> {
    fn evaluate(&self, sp: &SigPair<SignatureOf<C>>) -> Score {
        self.store.evaluate(sp)
    }
}

/// Gives the same score to every signature, so all of them get verified.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllEvaluator;

impl<C: Constructor> SigEvaluator<C> for AcceptAllEvaluator {
    fn evaluate(&self, _sp: &SigPair<SignatureOf<C>>) -> Score {
        SCORE_IMPROVE
    }
}

enum Work<S> {
    Verify(SigPair<S>),
    /// Stops the worker and closes the verified channel.
    Stop,
}

/// Verifies `sp` against the aggregate of the public keys of the identities
/// set in its bitset.
pub fn verify_signature<C: Constructor>(
    sp: &SigPair<SignatureOf<C>>,
    msg: &[u8],
    part: &dyn Partitioner<C>,
    cons: &C,
) -> Result<()> {
    let ids = part.identities_at(sp.level as usize)?;
    if sp.ms.bit_length() != ids.len() {
        return Err(HandelError::InconsistentBitSet {
            expected: ids.len(),
            actual: sp.ms.bit_length(),
        });
    }
    let aggregate = sp
        .ms
        .bitset
        .ones()
        .into_iter()
        .fold(cons.public_key(), |acc, i| acc.combine(ids[i].public_key()));
    aggregate.verify_signature(msg, &sp.ms.signature)?;
    Ok(())
}

/// Handle on the verification thread.
pub struct SignatureProcessing<C: Constructor> {
    incoming: Sender<Work<SignatureOf<C>>>,
    verified: Receiver<SigPair<SignatureOf<C>>>,
    worker: Mutex<Option<Worker<C>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    span: Span,
}

impl<C: Constructor> SignatureProcessing<C> {
    pub fn new(
        part: Arc<dyn Partitioner<C>>,
        cons: Arc<C>,
        msg: Arc<[u8]>,
        evaluator: Box<dyn SigEvaluator<C>>,
        black_list: Arc<dyn BlackListStrategy>,
        parent: &Span,
    ) -> Self {
        let span = debug_span!(parent: parent, "processing");
        let (incoming, in_rx) = unbounded();
        let (out, verified) = unbounded();
        let worker = Worker {
            incoming: in_rx,
            out,
            part,
            cons,
            msg,
            evaluator,
            black_list,
            todos: Vec::new(),
            resolved: HashMap::new(),
            span: span.clone(),
        };
        Self {
            incoming,
            verified,
            worker: Mutex::new(Some(worker)),
            handle: Mutex::new(None),
            span,
        }
    }

    /// Spawns the verification thread. Calling it again is a no-op.
    pub fn start(&self) -> Result<()> {
        let Some(worker) = self.worker.lock().take() else {
            return Ok(());
        };
        let handle = std::thread::Builder::new()
            .name("handel-processing".into())
            .spawn(move || worker.run())
            .map_err(|source| HandelError::Spawn {
                name: "processing",
                source,
            })?;
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    /// Stops the verification thread and waits for it. Signatures still
    /// pending are dropped and the verified channel is closed.
    pub fn stop(&self) {
        let _ = self.incoming.send(Work::Stop);
        // never started: dropping the worker closes the verified channel
        self.worker.lock().take();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(parent: &self.span, "processing thread panicked");
            }
        }
    }

    /// Queues a parsed signature for verification.
    pub fn add(&self, sp: SigPair<SignatureOf<C>>) {
        if self.incoming.send(Work::Verify(sp)).is_err() {
            debug!(parent: &self.span, "processing stopped, dropping signature");
        }
    }

    /// Channel of the signatures that passed verification.
    pub fn verified(&self) -> Receiver<SigPair<SignatureOf<C>>> {
        self.verified.clone()
    }

    /// Number of queued signatures not yet picked up by the worker.
    pub fn pending(&self) -> usize {
        self.incoming.len()
    }
}

struct Worker<C: Constructor> {
    incoming: Receiver<Work<SignatureOf<C>>>,
    out: Sender<SigPair<SignatureOf<C>>>,
    part: Arc<dyn Partitioner<C>>,
    cons: Arc<C>,
    msg: Arc<[u8]>,
    evaluator: Box<dyn SigEvaluator<C>>,
    black_list: Arc<dyn BlackListStrategy>,
    /// Pending signatures in arrival order.
    todos: Vec<SigPair<SignatureOf<C>>>,
    /// Highest verified cardinality per level.
    resolved: HashMap<u8, usize>,
    span: Span,
}

impl<C: Constructor> Worker<C> {
    fn run(mut self) {
        let mut verified = 0usize;
        loop {
            if self.todos.is_empty() {
                match self.incoming.recv() {
                    Ok(work) => {
                        if !self.push(work) {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            let drained: Vec<_> = self.incoming.try_iter().collect();
            if !drained.into_iter().all(|work| self.push(work)) {
                break;
            }
            if let Some(sp) = self.select() {
                self.verify_and_publish(sp);
                verified += 1;
                if verified % 100 == 0 {
                    debug!(parent: &self.span, verified, "processed signatures");
                }
            }
        }
        debug!(parent: &self.span, pending = self.todos.len(), "processing stopped");
    }

    /// Returns false on the stop signal.
    fn push(&mut self, work: Work<SignatureOf<C>>) -> bool {
        match work {
            Work::Verify(sp) => {
                self.todos.push(sp);
                true
            }
            Work::Stop => false,
        }
    }

    fn is_resolved(&self, level: u8) -> bool {
        self.resolved
            .get(&level)
            .is_some_and(|&card| card >= self.part.size(level as usize))
    }

    /// Removes and returns the pending signature to verify next: highest
    /// score, then lowest level, then earliest arrival. Signatures scored 0
    /// or belonging to an already complete level are dropped.
    fn select(&mut self) -> Option<SigPair<SignatureOf<C>>> {
        let todos = std::mem::take(&mut self.todos);
        let before = todos.len();
        let mut best: Option<(Score, usize)> = None;
        for sp in todos {
            if self.is_resolved(sp.level) {
                continue;
            }
            let score = self.evaluator.evaluate(&sp);
            if score == SCORE_DISCARD {
                continue;
            }
            let idx = self.todos.len();
            let better = match best {
                None => true,
                Some((best_score, best_idx)) => {
                    let current = &self.todos[best_idx];
                    score > best_score || (score == best_score && sp.level < current.level)
                }
            };
            if better {
                best = Some((score, idx));
            }
            self.todos.push(sp);
        }
        let dropped = before - self.todos.len();
        if dropped > 0 {
            debug!(parent: &self.span, dropped, "dropped irrelevant signatures");
        }
        best.map(|(_, idx)| self.todos.remove(idx))
    }

    fn verify_and_publish(&mut self, sp: SigPair<SignatureOf<C>>) {
        match verify_signature(&sp, &self.msg, self.part.as_ref(), self.cons.as_ref()) {
            Ok(()) => {
                let card = self.resolved.entry(sp.level).or_default();
                *card = (*card).max(sp.ms.cardinality());
                debug!(parent: &self.span, %sp, "verified signature");
                if self.out.send(sp).is_err() {
                    debug!(parent: &self.span, "verified channel closed");
                }
            }
            Err(err) => {
                warn!(
                    parent: &self.span,
                    origin = sp.origin,
                    level = sp.level,
                    error = %err,
                    "invalid signature"
                );
                self.black_list.update(sp.origin, &err);
            }
        }
    }
}
