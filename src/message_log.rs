/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The append-only message log backing every replica.
//!
//! The log is the single source of truth for quorum counting, duplicate detection, and recovery:
//! a replica "has seen" a protocol message exactly when the message is in its log. Two secondary
//! indices (by content digest and by message kind) keep the hot operations away from linear scans
//! of the full history.

use std::collections::HashMap;

use crate::messages::{Message, MessageKind};
use crate::types::{CryptoHash, SequenceNumber};

#[derive(Debug, Default)]
pub struct MessageLog {
    entries: Vec<Message>,
    by_digest: HashMap<CryptoHash, usize>,
    by_kind: HashMap<MessageKind, Vec<usize>>,
}

impl MessageLog {
    pub fn new() -> MessageLog {
        MessageLog::default()
    }

    /// Append a message. Returns false without mutating anything if a message with the same
    /// content digest is already present.
    pub fn append(&mut self, message: Message) -> bool {
        let digest = message.digest();
        if self.by_digest.contains_key(&digest) {
            return false;
        }
        let index = self.entries.len();
        self.by_digest.insert(digest, index);
        self.by_kind.entry(message.kind()).or_default().push(index);
        self.entries.push(message);
        true
    }

    /// Whether a message with this exact content is already logged.
    pub fn exists(&self, message: &Message) -> bool {
        self.by_digest.contains_key(&message.digest())
    }

    /// Number of logged messages of `kind` satisfying `predicate`. This is what quorum counting
    /// runs on.
    pub fn count(&self, kind: MessageKind, predicate: impl Fn(&Message) -> bool) -> u64 {
        self.select(kind, predicate).len() as u64
    }

    /// All logged messages of `kind` satisfying `predicate`, in append order.
    pub fn select(
        &self,
        kind: MessageKind,
        predicate: impl Fn(&Message) -> bool,
    ) -> Vec<&Message> {
        match self.by_kind.get(&kind) {
            Some(indices) => indices
                .iter()
                .map(|i| &self.entries[*i])
                .filter(|m| predicate(m))
                .collect(),
            None => Vec::new(),
        }
    }

    /// The earliest logged message of `kind` satisfying `predicate`.
    pub fn first(&self, kind: MessageKind, predicate: impl Fn(&Message) -> bool) -> Option<&Message> {
        self.by_kind
            .get(&kind)?
            .iter()
            .map(|i| &self.entries[*i])
            .find(|m| predicate(m))
    }

    /// The latest logged message of `kind` satisfying `predicate`.
    pub fn last(&self, kind: MessageKind, predicate: impl Fn(&Message) -> bool) -> Option<&Message> {
        self.by_kind
            .get(&kind)?
            .iter()
            .rev()
            .map(|i| &self.entries[*i])
            .find(|m| predicate(m))
    }

    /// Drop every message whose sequence number is below `stable`. Messages without a sequence
    /// number (requests, replies, queries) are retained. Called when a checkpoint becomes stable.
    pub fn clear_below(&mut self, stable: SequenceNumber) {
        let retained: Vec<Message> = self
            .entries
            .drain(..)
            .filter(|m| match m.sequence() {
                Some(sequence) => sequence >= stable,
                None => true,
            })
            .collect();
        self.by_digest.clear();
        self.by_kind.clear();
        for message in retained {
            self.append(message);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
