/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for structured messages that are exchanged between clients and replicas and among
//! replicas.
//!
//! The taxonomy is a closed sum type: every message on the wire is one of the variants of
//! [Message], and replicas dispatch on it with an exhaustive match, so adding a message kind is a
//! compile-time-checked change. A message's content digest is SHA-256 over its Borsh
//! serialization, which serves as the canonical serialization everywhere a digest is specified.

use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::Verifier;
use sha2::Digest;

use crate::types::{
    ClusterParams, CryptoHash, CryptoHasher, Height, Keypair, NodeName, SequenceNumber, Signature,
    SignatureBytes, Timestamp, VerifyingKey, ViewNumber,
};

/// Compute the canonical content digest of a Borsh-serializable value.
pub fn digest_of<T: BorshSerialize>(value: &T) -> CryptoHash {
    let mut hasher = CryptoHasher::new();
    hasher.update(value.try_to_vec().unwrap());
    hasher.finalize().into()
}

/// Protocol error codes surfaced to peers and clients as [ErrorMsg]. Only `ViewChanging` is
/// retryable by default.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub enum ErrorCode {
    NotMaster,
    InvalidType,
    InvalidView,
    InvalidSequence,
    InvalidDigest,
    InvalidRequest,
    InvalidStatus,
    InvalidSignature,
    UnknownSender,
    InternalError,
    DuplicatedMsg,
    ViewChanging,
    Unknown,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCode::NotMaster => "not-master",
            ErrorCode::InvalidType => "invalid-type",
            ErrorCode::InvalidView => "invalid-view",
            ErrorCode::InvalidSequence => "invalid-sequence",
            ErrorCode::InvalidDigest => "invalid-digest",
            ErrorCode::InvalidRequest => "invalid-request",
            ErrorCode::InvalidStatus => "invalid-status",
            ErrorCode::InvalidSignature => "invalid-signature",
            ErrorCode::UnknownSender => "unknown-sender",
            ErrorCode::InternalError => "internal-error",
            ErrorCode::DuplicatedMsg => "duplicated-msg",
            ErrorCode::ViewChanging => "view-changing",
            ErrorCode::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct ErrorMsg {
    pub code: ErrorCode,
    pub message: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct OkMsg {
    pub message: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct FindMasterMsg {}

#[derive(Clone, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct MasterInfoMsg {
    pub name: NodeName,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct QueryStatusMsg {}

#[derive(Clone, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct NodeStatusMsg {
    pub view: ViewNumber,
    pub master: NodeName,
    pub automata: String,
    pub params: ClusterParams,
    pub height: Height,
    pub low_water_mark: SequenceNumber,
    pub high_water_mark: SequenceNumber,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct QueryAutomataMsg {
    pub command: String,
}

/// A client-submitted operation. The `(timestamp, payload)` pair identifies the operation; its
/// digest is what every later protocol phase refers to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct RequestMsg {
    pub timestamp: Timestamp,
    pub payload: String,
}

impl RequestMsg {
    /// The placeholder operation synthesized during a view change when no pending pre-prepares
    /// survive: replaying it advances sequence counters without touching the automata.
    pub fn noop() -> RequestMsg {
        RequestMsg {
            timestamp: 0,
            payload: String::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct ReplyMsg {
    pub view: ViewNumber,
    pub timestamp: Timestamp,
    pub node: NodeName,
    pub result: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct PrePrepareMsg {
    pub view: ViewNumber,
    pub sequence: SequenceNumber,
    pub digest: CryptoHash,
    pub request: RequestMsg,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct PrepareMsg {
    pub view: ViewNumber,
    pub sequence: SequenceNumber,
    pub digest: CryptoHash,
    pub node: NodeName,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct CommitMsg {
    pub view: ViewNumber,
    pub sequence: SequenceNumber,
    pub digest: CryptoHash,
    pub node: NodeName,
}

/// Local confirmation a replica appends to its own log once it has applied an operation. Never
/// sent over the wire.
#[derive(Clone, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct CommittedMsg {
    pub view: ViewNumber,
    pub sequence: SequenceNumber,
    pub digest: CryptoHash,
    pub node: NodeName,
}

/// Local confirmation a replica appends to its own log once it has observed a prepare quorum.
/// Never sent over the wire.
#[derive(Clone, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct PreparedMsg {
    pub view: ViewNumber,
    pub sequence: SequenceNumber,
    pub digest: CryptoHash,
    pub node: NodeName,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct CheckpointMsg {
    pub sequence: SequenceNumber,
    /// Digest of the automata state at `sequence`, not of a message.
    pub digest: CryptoHash,
    pub node: NodeName,
}

/// One not-yet-stable consensus instance carried inside a view-change message: the pre-prepare
/// and the prepares the sender has logged for it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct PendingProof {
    pub pre_prepare: PrePrepareMsg,
    pub prepares: Vec<PrepareMsg>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct ViewChangeMsg {
    /// The view the sender wants to move to.
    pub view: ViewNumber,
    pub node: NodeName,
    /// The sender's last stable checkpoint sequence.
    pub sequence: SequenceNumber,
    /// Checkpoint certificates proving the stable checkpoint at `sequence`.
    pub proof: Vec<CheckpointMsg>,
    /// Consensus instances above `sequence` the sender has evidence for.
    pub pendings: Vec<PendingProof>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct NewViewMsg {
    pub view: ViewNumber,
    /// The most advanced stable checkpoint sequence any proof contributor could prove.
    pub sequence: SequenceNumber,
    /// The `2f + 1` view-change messages the new master aggregated.
    pub proof: Vec<ViewChangeMsg>,
    /// The replay set every receiver must be able to re-derive from `proof` bit-for-bit.
    pub pendings: Vec<PrePrepareMsg>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct CorruptMsg {
    pub name: NodeName,
}

/// Discriminant of a [Message], used for dispatch, log indexing, and majority voting over
/// response types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Error,
    Ok,
    FindMaster,
    MasterInfo,
    QueryStatus,
    NodeStatus,
    QueryAutomata,
    Request,
    Reply,
    PrePrepare,
    Prepare,
    Commit,
    Committed,
    Prepared,
    Checkpoint,
    ViewChange,
    NewView,
    Corrupt,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageKind::Error => "error",
            MessageKind::Ok => "ok",
            MessageKind::FindMaster => "find-master",
            MessageKind::MasterInfo => "master-info",
            MessageKind::QueryStatus => "query-status",
            MessageKind::NodeStatus => "node-status",
            MessageKind::QueryAutomata => "query-automata",
            MessageKind::Request => "request",
            MessageKind::Reply => "reply",
            MessageKind::PrePrepare => "pre-prepare",
            MessageKind::Prepare => "prepare",
            MessageKind::Commit => "commit",
            MessageKind::Committed => "committed",
            MessageKind::Prepared => "prepared",
            MessageKind::Checkpoint => "checkpoint",
            MessageKind::ViewChange => "view-change",
            MessageKind::NewView => "new-view",
            MessageKind::Corrupt => "corrupt",
        };
        f.write_str(name)
    }
}

/// The closed set of protocol messages exchanged client-to-replica and replica-to-replica.
#[derive(Clone, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub enum Message {
    Error(ErrorMsg),
    Ok(OkMsg),
    FindMaster(FindMasterMsg),
    MasterInfo(MasterInfoMsg),
    QueryStatus(QueryStatusMsg),
    NodeStatus(NodeStatusMsg),
    QueryAutomata(QueryAutomataMsg),
    Request(RequestMsg),
    Reply(ReplyMsg),
    PrePrepare(PrePrepareMsg),
    Prepare(PrepareMsg),
    Commit(CommitMsg),
    Committed(CommittedMsg),
    Prepared(PreparedMsg),
    Checkpoint(CheckpointMsg),
    ViewChange(ViewChangeMsg),
    NewView(NewViewMsg),
    Corrupt(CorruptMsg),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Error(_) => MessageKind::Error,
            Message::Ok(_) => MessageKind::Ok,
            Message::FindMaster(_) => MessageKind::FindMaster,
            Message::MasterInfo(_) => MessageKind::MasterInfo,
            Message::QueryStatus(_) => MessageKind::QueryStatus,
            Message::NodeStatus(_) => MessageKind::NodeStatus,
            Message::QueryAutomata(_) => MessageKind::QueryAutomata,
            Message::Request(_) => MessageKind::Request,
            Message::Reply(_) => MessageKind::Reply,
            Message::PrePrepare(_) => MessageKind::PrePrepare,
            Message::Prepare(_) => MessageKind::Prepare,
            Message::Commit(_) => MessageKind::Commit,
            Message::Committed(_) => MessageKind::Committed,
            Message::Prepared(_) => MessageKind::Prepared,
            Message::Checkpoint(_) => MessageKind::Checkpoint,
            Message::ViewChange(_) => MessageKind::ViewChange,
            Message::NewView(_) => MessageKind::NewView,
            Message::Corrupt(_) => MessageKind::Corrupt,
        }
    }

    /// The content digest keying this message in the log.
    pub fn digest(&self) -> CryptoHash {
        digest_of(self)
    }

    /// The consensus sequence number this message is about, if it carries one. Used by watermark
    /// checks and checkpoint pruning.
    pub fn sequence(&self) -> Option<SequenceNumber> {
        match self {
            Message::PrePrepare(m) => Some(m.sequence),
            Message::Prepare(m) => Some(m.sequence),
            Message::Commit(m) => Some(m.sequence),
            Message::Committed(m) => Some(m.sequence),
            Message::Prepared(m) => Some(m.sequence),
            Message::Checkpoint(m) => Some(m.sequence),
            Message::ViewChange(m) => Some(m.sequence),
            Message::NewView(m) => Some(m.sequence),
            _ => None,
        }
    }

    /// The replica that originated this message, for message kinds that carry an explicit
    /// originating-node field. Signature verification checks it against the envelope signer.
    pub fn origin(&self) -> Option<&NodeName> {
        match self {
            Message::Reply(m) => Some(&m.node),
            Message::Prepare(m) => Some(&m.node),
            Message::Commit(m) => Some(&m.node),
            Message::Committed(m) => Some(&m.node),
            Message::Prepared(m) => Some(&m.node),
            Message::Checkpoint(m) => Some(&m.node),
            Message::ViewChange(m) => Some(&m.node),
            _ => None,
        }
    }

    pub fn ok(message: impl Into<String>) -> Message {
        Message::Ok(OkMsg {
            message: Some(message.into()),
        })
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Message {
        Message::Error(ErrorMsg {
            code,
            message: Some(message.into()),
        })
    }
}

/// The optional signing envelope used when signatures are enabled: `data` is the Borsh
/// serialization of a [Message], and `signature` is the sender's Ed25519 signature over it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct SignedMessage {
    pub signer: NodeName,
    pub signature: SignatureBytes,
    pub data: Vec<u8>,
}

impl SignedMessage {
    pub fn sign(keypair: &Keypair, signer: impl Into<NodeName>, message: &Message) -> SignedMessage {
        let data = message.try_to_vec().unwrap();
        let signature = keypair.sign(&data);
        SignedMessage {
            signer: signer.into(),
            signature,
            data,
        }
    }

    /// Verify the envelope and recover the inner message.
    ///
    /// `resolve` maps a signer name to its configured verifying key. Fails with `UnknownSender`
    /// for unresolvable signers, `InvalidSignature` for bad signatures or an originating-node
    /// field that does not match the signer, and `InvalidType` for undecodable payloads.
    pub fn open(
        &self,
        resolve: impl FnOnce(&str) -> Option<VerifyingKey>,
    ) -> Result<Message, ErrorCode> {
        let verifying_key = resolve(&self.signer).ok_or(ErrorCode::UnknownSender)?;
        let signature = Signature::from_bytes(&self.signature);
        verifying_key
            .verify(&self.data, &signature)
            .map_err(|_| ErrorCode::InvalidSignature)?;

        let message =
            Message::try_from_slice(&self.data).map_err(|_| ErrorCode::InvalidType)?;
        if let Some(origin) = message.origin() {
            if *origin != self.signer {
                return Err(ErrorCode::InvalidSignature);
            }
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Keypair;

    fn request() -> RequestMsg {
        RequestMsg {
            timestamp: 1_700_000_000_000,
            payload: "key1:value1".to_string(),
        }
    }

    #[test]
    fn request_digest_is_stable_and_content_sensitive() {
        let a = digest_of(&request());
        let b = digest_of(&request());
        assert_eq!(a, b);

        let other = RequestMsg {
            timestamp: 1_700_000_000_000,
            payload: "key1:value2".to_string(),
        };
        assert_ne!(a, digest_of(&other));
    }

    #[test]
    fn pre_prepare_digest_matches_request_digest() {
        let req = request();
        let pre_prepare = PrePrepareMsg {
            view: 0,
            sequence: 1,
            digest: digest_of(&req),
            request: req.clone(),
        };
        assert_eq!(pre_prepare.digest, digest_of(&pre_prepare.request));
    }

    #[test]
    fn signed_message_round_trip() {
        let keypair = Keypair::generate();
        let message = Message::Request(request());
        let envelope = SignedMessage::sign(&keypair, "client0", &message);

        let opened = envelope
            .open(|name| (name == "client0").then(|| keypair.verifying()))
            .unwrap();
        assert_eq!(opened, message);
    }

    #[test]
    fn signed_message_rejects_unknown_signer_and_wrong_key() {
        let keypair = Keypair::generate();
        let other = Keypair::generate();
        let message = Message::Request(request());
        let envelope = SignedMessage::sign(&keypair, "client0", &message);

        assert_eq!(envelope.open(|_| None), Err(ErrorCode::UnknownSender));
        assert_eq!(
            envelope.open(|_| Some(other.verifying())),
            Err(ErrorCode::InvalidSignature)
        );
    }

    #[test]
    fn signed_message_rejects_origin_mismatch() {
        let keypair = Keypair::generate();
        let message = Message::Prepare(PrepareMsg {
            view: 0,
            sequence: 1,
            digest: [7u8; 32],
            node: "node2".to_string(),
        });
        // Signed by node1 but claiming to originate from node2.
        let envelope = SignedMessage::sign(&keypair, "node1", &message);

        assert_eq!(
            envelope.open(|_| Some(keypair.verifying())),
            Err(ErrorCode::InvalidSignature)
        );
    }
}
