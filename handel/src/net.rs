// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::Arc;

use crate::error::{HandelError, Result};
use crate::identity::Identity;

const HEADER_LEN: usize = 5;

/// Message exchanged between Handel nodes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    /// Id of the sender.
    pub origin: i32,
    /// Level of the receiver's candidate set the sender belongs to.
    pub level: u8,
    /// Encoded [`MultiSignature`](crate::MultiSignature).
    pub multi_sig: Vec<u8>,
}

impl Packet {
    /// Encodes as `i32 origin || u8 level || multi-signature`, big-endian.
    pub fn marshal_binary(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.multi_sig.len());
        buf.extend_from_slice(&self.origin.to_be_bytes());
        buf.push(self.level);
        buf.extend_from_slice(&self.multi_sig);
        buf
    }

    pub fn unmarshal_binary(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(HandelError::ShortBuffer {
                need: HEADER_LEN,
                got: buf.len(),
            });
        }
        Ok(Self {
            origin: i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            level: buf[4],
            multi_sig: buf[HEADER_LEN..].to_vec(),
        })
    }
}

/// Receives packets from the [`Network`].
pub trait Listener: Send + Sync {
    fn new_packet(&self, packet: &Packet);
}

/// Transport used by Handel. No delivery nor ordering guarantee is expected.
pub trait Network<P>: Send + Sync {
    fn register_listener(&self, listener: Arc<dyn Listener>);

    fn send(&self, identities: &[Identity<P>], packet: &Packet);
}
