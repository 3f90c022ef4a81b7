// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Sender, bounded, select, tick};

use crate::error::{HandelError, Result};

/// Period of [`LinearTimeout`] when none is configured.
pub const DEFAULT_LEVEL_TIMEOUT: Duration = Duration::from_millis(100);

/// Hook used by timeout strategies to move a node to its next level.
pub trait LevelStarter: Send + Sync {
    /// Starts the level after the current one. Returns false once there is
    /// no level left to start.
    fn start_next_level(&self) -> bool;
}

/// Decides when to start levels regardless of completion signals. Started and
/// stopped by the engine.
pub trait TimeoutStrategy: Send {
    fn start(&mut self) -> Result<()>;

    fn stop(&mut self);
}

/// Starts one more level every `period` until every level is started.
pub struct LinearTimeout {
    starter: Arc<dyn LevelStarter>,
    max_level: usize,
    period: Duration,
    done: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl LinearTimeout {
    pub fn new(starter: Arc<dyn LevelStarter>, max_level: usize, period: Duration) -> Self {
        Self {
            starter,
            max_level,
            period,
            done: None,
            handle: None,
        }
    }
}

impl TimeoutStrategy for LinearTimeout {
    fn start(&mut self) -> Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }
        let (done, stopped) = bounded::<()>(0);
        let ticker = tick(self.period);
        let starter = self.starter.clone();
        let max_level = self.max_level;
        let handle = std::thread::Builder::new()
            .name("handel-timeout".into())
            .spawn(move || {
                for _ in 0..max_level {
                    select! {
                        recv(ticker) -> _ => {
                            if !starter.start_next_level() {
                                return;
                            }
                        }
                        recv(stopped) -> _ => return,
                    }
                }
            })
            .map_err(|source| HandelError::Spawn {
                name: "timeout",
                source,
            })?;
        self.done = Some(done);
        self.handle = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        // disconnecting wakes the thread up
        self.done.take();
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

/// Never starts a level: only level completion moves the node forward.
#[derive(Debug, Default, Clone, Copy)]
pub struct InfiniteTimeout;

impl TimeoutStrategy for InfiniteTimeout {
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) {}
}
