/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The pluggable peer-to-peer messaging provider.
//!
//! Library users provide a [Transport] implementation connecting the replicas named in the
//! [ClusterConfig](crate::types::ClusterConfig). The protocol layer is transport-agnostic: the
//! integration tests run an in-process loopback, a deployment would put an RPC stack here.

use std::time::Duration;

use thiserror::Error;

use crate::messages::Message;

/// A request/response messaging provider. Implementations must be cheap to clone: every node and
/// client holds its own handle, and broadcasts clone the handle into one sender thread per peer.
pub trait Transport: Clone + Send + Sync + 'static {
    /// Deliver `message` to the peer named `peer` and return its response, waiting at most
    /// `timeout`.
    fn send(&self, peer: &str, message: Message, timeout: Duration)
        -> Result<Message, TransportError>;
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    #[error("timed out waiting for a response from {0}")]
    Timeout(String),

    #[error("transport failure: {0}")]
    Failed(String),
}
