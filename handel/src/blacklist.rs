// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use tracing::{Span, warn};

use crate::error::HandelError;

/// Accountability hook fed with the misbehaviour attributed to a peer.
pub trait BlackListStrategy: Send + Sync {
    /// Records that `id` sent something that failed with `err`.
    fn update(&self, id: i32, err: &HandelError);

    /// Packets from black-listed ids are dropped before parsing.
    fn is_black_listed(&self, id: i32) -> bool;
}

/// Reports misbehaviour in the logs and never black-lists anyone.
#[derive(Debug, Clone)]
pub struct NoopBlackList {
    span: Span,
}

impl NoopBlackList {
    pub fn new(span: Span) -> Self {
        Self { span }
    }
}

impl Default for NoopBlackList {
    fn default() -> Self {
        Self::new(Span::none())
    }
}

impl BlackListStrategy for NoopBlackList {
    fn update(&self, id: i32, err: &HandelError) {
        warn!(parent: &self.span, peer = id, error = %err, "misbehaving peer");
    }

    fn is_black_listed(&self, _id: i32) -> bool {
        false
    }
}
