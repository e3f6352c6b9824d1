/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The pluggable replicated state machine.

use crate::types::CryptoHash;

/// The deterministic state machine that committed operations are applied to.
///
/// Determinism is the whole contract: given the same sequence of `transfer` calls, every
/// implementation instance must end in the same state and report the same `digest`. An empty
/// payload must be accepted and leave the state unchanged (the view-change protocol replays a
/// placeholder no-op operation when a master is replaced with nothing in flight).
pub trait Automata: Send + 'static {
    /// Apply one committed operation.
    fn transfer(&mut self, payload: &str);

    /// Answer a read-only query. Never mutates state.
    fn query(&self, command: &str) -> String;

    /// A human-readable snapshot of the current state, for status reporting.
    fn status(&self) -> String;

    /// The digest of the current state. Compared across replicas by checkpointing.
    fn digest(&self) -> CryptoHash;
}
