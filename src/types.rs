/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for 'inert' types, i.e., those that are sent around and inspected, but have no active behavior,
//! plus the cluster membership configuration shared by every replica and client.

use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::Signer;
use rand_core::OsRng;

pub use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
pub use sha2::Sha256 as CryptoHasher;

pub type ViewNumber = u64;
pub type SequenceNumber = u64;
pub type Height = u64;
pub type Timestamp = u64;
pub type CryptoHash = [u8; 32];
pub type NodeName = String;
pub type VerifyingKeyBytes = [u8; 32];
pub type SignatureBytes = [u8; 64];

/// Byzantine fault-tolerance parameters of a cluster: a cluster of `3f + 1` replicas tolerates `f`
/// arbitrary faults, and takes a checkpoint every `k` committed operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct ClusterParams {
    pub f: u64,
    pub k: u64,
}

impl ClusterParams {
    /// Number of replicas the cluster must have: `3f + 1`.
    pub fn cluster_size(&self) -> u64 {
        3 * self.f + 1
    }

    /// Minimum number of matching votes that guarantees at least `f + 1` come from correct
    /// replicas: `2f + 1`.
    pub fn quorum(&self) -> u64 {
        2 * self.f + 1
    }

    /// Minimum number of matching responses that guarantees at least one comes from a correct
    /// replica: `f + 1`.
    pub fn honest_minority(&self) -> u64 {
        self.f + 1
    }
}

/// Progress of the single in-flight consensus instance a replica is locally tracking.
///
/// `Malicious` is a fault-injection marker: it does not by itself change how the replica responds
/// to protocol messages, it only tags the replica so test harnesses can intercept its traffic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Idle,
    PrePrepared,
    Prepared,
    Malicious,
}

/// Identity of one cluster member. Immutable for the lifetime of the process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeIdentity {
    pub name: NodeName,
    pub host: String,
    pub port: u16,
    pub verifying_key: VerifyingKeyBytes,
}

/// Cluster membership, fault-tolerance parameters, and the signature-enabled flag. Constructed
/// once at startup from operator configuration and owned by every node and client instance.
#[derive(Clone, Debug)]
pub struct ClusterConfig {
    /// Members in master rotation order. `master(view) = nodes[view % nodes.len()]`.
    pub nodes: Vec<NodeIdentity>,
    pub params: ClusterParams,
    pub signatures_enabled: bool,
}

impl ClusterConfig {
    /// The master of the given view, selected round-robin by view number.
    pub fn master_of(&self, view: ViewNumber) -> &NodeIdentity {
        &self.nodes[(view % self.nodes.len() as u64) as usize]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.iter().any(|n| n.name == name)
    }

    /// Resolve a member name to its Ed25519 verifying key. Returns `None` for unknown members and
    /// for key bytes that do not decode to a valid curve point.
    pub fn verifying_key(&self, name: &str) -> Option<VerifyingKey> {
        let identity = self.nodes.iter().find(|n| n.name == name)?;
        VerifyingKey::from_bytes(&identity.verifying_key).ok()
    }
}

/// The sequence-number window a replica accepts, bounded below by the last stable checkpoint and
/// above by `low + 2k`.
#[derive(Clone, Copy, Debug)]
pub struct Watermarks {
    pub low: SequenceNumber,
    span: u64,
}

impl Watermarks {
    pub fn new(k: u64) -> Watermarks {
        Watermarks { low: 0, span: 2 * k }
    }

    pub fn high(&self) -> SequenceNumber {
        self.low + self.span
    }

    pub fn accepts(&self, sequence: SequenceNumber) -> bool {
        self.low <= sequence && sequence <= self.high()
    }

    /// Advance the low watermark to a newly stable checkpoint sequence.
    pub fn advance(&mut self, stable: SequenceNumber) {
        self.low = stable;
    }
}

/// Strictly increasing sequence-number generator. Only the current master draws from it; a view
/// change resets it to the recovered low watermark.
#[derive(Clone, Copy, Debug)]
pub struct SequenceIterator {
    last: SequenceNumber,
}

impl SequenceIterator {
    pub fn starting_after(last: SequenceNumber) -> SequenceIterator {
        SequenceIterator { last }
    }

    pub fn next(&mut self) -> SequenceNumber {
        self.last += 1;
        self.last
    }

    pub fn peek(&self) -> SequenceNumber {
        self.last + 1
    }

    pub fn reset(&mut self, last: SequenceNumber) {
        self.last = last;
    }
}

/// An Ed25519 keypair identifying one replica or client.
#[derive(Clone)]
pub struct Keypair(SigningKey);

impl Keypair {
    pub fn new(signing_key: SigningKey) -> Keypair {
        Keypair(signing_key)
    }

    pub fn generate() -> Keypair {
        Keypair(SigningKey::generate(&mut OsRng))
    }

    pub fn verifying(&self) -> VerifyingKey {
        self.0.verifying_key()
    }

    pub fn public_bytes(&self) -> VerifyingKeyBytes {
        self.0.verifying_key().to_bytes()
    }

    pub fn sign(&self, bytes: &[u8]) -> SignatureBytes {
        self.0.sign(bytes).to_bytes()
    }
}
