/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The replica-side consensus engine.
//!
//! A [Node] owns one replica's share of the protocol state: the message log, the automata, the
//! current view, the sequence window, and the progress status of the in-flight consensus
//! instance. Transport servers feed every inbound message to [Node::handle] (or
//! [Node::handle_signed] when signatures are enabled), which dispatches to one handler per
//! message kind and turns handler errors into wire-level `error` messages.
//!
//! ## Threading
//!
//! Handlers may be called concurrently. Two locks serialize them where it matters:
//! `request_lock` admits one client request into the three-phase protocol at a time, and `inner`
//! guards the protocol state proper. `inner` is never held across a broadcast: broadcasts are
//! delivered synchronously in tests and re-enter handlers on this very node, so holding the
//! state lock while broadcasting would deadlock on loopback delivery.

use std::collections::HashSet;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use typed_builder::TypedBuilder;

use crate::automata::Automata;
use crate::logging;
use crate::message_log::MessageLog;
use crate::messages::{
    digest_of, CheckpointMsg, CommitMsg, CommittedMsg, CorruptMsg, ErrorCode, ErrorMsg,
    MasterInfoMsg, Message, MessageKind, NewViewMsg, NodeStatusMsg, PendingProof, PrePrepareMsg,
    PrepareMsg, PreparedMsg, QueryAutomataMsg, ReplyMsg, RequestMsg, SignedMessage, ViewChangeMsg,
};
use crate::transport::{Transport, TransportError};
use crate::types::{
    ClusterConfig, CryptoHash, Height, Keypair, NodeName, SequenceNumber, SequenceIterator, Status,
    ViewNumber, Watermarks,
};
use crate::waitgroup::WaitGroup;

/// A protocol-level rejection. Rendered to the wire as `Message::Error`.
#[derive(Debug, Error)]
#[error("{code}: {detail}")]
pub struct NodeError {
    pub code: ErrorCode,
    pub detail: String,
}

impl NodeError {
    fn new(code: ErrorCode, detail: impl Into<String>) -> NodeError {
        NodeError {
            code,
            detail: detail.into(),
        }
    }
}

impl From<NodeError> for Message {
    fn from(error: NodeError) -> Message {
        Message::Error(ErrorMsg {
            code: error.code,
            message: Some(error.detail),
        })
    }
}

/// Configuration of a [Node]. Build with the builder, then call
/// [`start`](NodeSpec::start).
#[derive(TypedBuilder)]
pub struct NodeSpec<T: Transport, A: Automata> {
    pub name: NodeName,
    pub cluster: ClusterConfig,
    pub keypair: Keypair,
    pub transport: T,
    pub automata: A,

    /// How long the master waits for a client request to commit before giving up and starting a
    /// view change.
    #[builder(default = Duration::from_secs(30))]
    pub request_timeout: Duration,

    /// Per-peer timeout of one broadcast delivery. Expiry is treated as a liveness fault.
    #[builder(default = Duration::from_secs(10))]
    pub broadcast_timeout: Duration,
}

impl<T: Transport, A: Automata> NodeSpec<T, A> {
    pub fn start(self) -> Arc<Node<T, A>> {
        Node::new(self)
    }
}

/// Protocol state guarded by the `inner` lock.
struct Inner<A: Automata> {
    view: ViewNumber,
    /// `Some(target)` while a change to view `target` is underway.
    view_changing: Option<ViewNumber>,
    status: Status,
    log: MessageLog,
    watermarks: Watermarks,
    sequence: SequenceIterator,
    height: Height,
    automata: A,
    pending: Option<PendingRequest>,
}

/// The master's in-flight client request: its digest and the channel its commitment is signalled
/// on.
struct PendingRequest {
    digest: CryptoHash,
    completion: SyncSender<ReplyMsg>,
}

pub struct Node<T: Transport, A: Automata> {
    name: NodeName,
    cluster: ClusterConfig,
    keypair: Keypair,
    transport: T,
    request_timeout: Duration,
    broadcast_timeout: Duration,
    request_lock: Mutex<()>,
    inner: Mutex<Inner<A>>,
    broadcasts: WaitGroup,
}

impl<T: Transport, A: Automata> Node<T, A> {
    pub fn new(spec: NodeSpec<T, A>) -> Arc<Node<T, A>> {
        let k = spec.cluster.params.k;
        Arc::new(Node {
            name: spec.name,
            cluster: spec.cluster,
            keypair: spec.keypair,
            transport: spec.transport,
            request_timeout: spec.request_timeout,
            broadcast_timeout: spec.broadcast_timeout,
            request_lock: Mutex::new(()),
            inner: Mutex::new(Inner {
                view: 0,
                view_changing: None,
                status: Status::Idle,
                log: MessageLog::new(),
                watermarks: Watermarks::new(k),
                sequence: SequenceIterator::starting_after(0),
                height: 0,
                automata: spec.automata,
                pending: None,
            }),
            broadcasts: WaitGroup::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The digest of the automata's current state.
    pub fn state_digest(&self) -> CryptoHash {
        self.inner.lock().unwrap().automata.digest()
    }

    /// Mark this replica as fault-injected. The marker does not by itself change how the replica
    /// responds; test harnesses inspect it to intercept the replica's traffic.
    pub fn corrupt(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.status = Status::Malicious;
        logging::corrupted(&self.name);
    }

    pub fn is_corrupted(&self) -> bool {
        self.inner.lock().unwrap().status == Status::Malicious
    }

    /// Wait for every in-flight broadcast to drain.
    pub fn shutdown(&self) {
        self.broadcasts.wait();
    }

    /// Handle one inbound message and produce the response to send back.
    pub fn handle(&self, message: Message) -> Message {
        let kind = message.kind();
        let result = match message {
            Message::Request(m) => self.on_request(m),
            Message::PrePrepare(m) => self.on_pre_prepare(m),
            Message::Prepare(m) => self.on_prepare(m),
            Message::Commit(m) => self.on_commit(m),
            Message::Checkpoint(m) => self.on_checkpoint(m),
            Message::ViewChange(m) => self.on_view_change(m),
            Message::NewView(m) => self.on_new_view(m),
            Message::FindMaster(_) => self.on_find_master(),
            Message::QueryStatus(_) => self.on_query_status(),
            Message::QueryAutomata(m) => self.on_query_automata(m),
            Message::Corrupt(m) => self.on_corrupt(m),
            _ => Err(NodeError::new(
                ErrorCode::InvalidType,
                format!("{} is a response-only message", kind),
            )),
        };
        match result {
            Ok(response) => response,
            Err(error) => {
                logging::reject(&self.name, &kind.to_string(), &error.code.to_string());
                error.into()
            }
        }
    }

    /// Handle one signature-enveloped inbound message: verify the envelope against the cluster's
    /// configured keys, then dispatch the inner message.
    pub fn handle_signed(&self, envelope: &SignedMessage) -> Message {
        match envelope.open(|signer| self.cluster.verifying_key(signer)) {
            Ok(message) => self.handle(message),
            Err(code) => {
                logging::reject(&self.name, "signed", &code.to_string());
                Message::Error(ErrorMsg {
                    code,
                    message: Some(format!("cannot verify envelope from {}", envelope.signer)),
                })
            }
        }
    }

    /// Sign an outbound message with this replica's key.
    pub fn sign(&self, message: &Message) -> SignedMessage {
        SignedMessage::sign(&self.keypair, self.name.clone(), message)
    }

    // ------------------------------------------------------------------------------------------
    // Client-facing handlers.
    // ------------------------------------------------------------------------------------------

    fn on_request(&self, m: RequestMsg) -> Result<Message, NodeError> {
        let digest = digest_of(&m);
        logging::receive_request(&self.name, &digest);

        let (view, master) = {
            let inner = self.inner.lock().unwrap();
            if inner.view_changing.is_some() {
                return Err(NodeError::new(
                    ErrorCode::ViewChanging,
                    "a view change is underway",
                ));
            }
            (inner.view, self.cluster.master_of(inner.view).name.clone())
        };

        if master != self.name {
            return self.forward_request(m, view, master, digest);
        }

        // One client request in the three-phase protocol at a time.
        let _admitted = self.request_lock.lock().unwrap();

        let (sequence, completion) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.view_changing.is_some() {
                return Err(NodeError::new(
                    ErrorCode::ViewChanging,
                    "a view change is underway",
                ));
            }
            // Re-delivery of an operation this replica already committed gets the same reply.
            if let Some(reply) = committed_reply(&inner, &self.name, &m, digest) {
                return Ok(Message::Reply(reply));
            }
            match inner.status {
                Status::PrePrepared | Status::Prepared => {
                    return Err(NodeError::new(
                        ErrorCode::InvalidStatus,
                        "another operation is in flight",
                    ));
                }
                Status::Idle | Status::Malicious => {}
            }
            let sequence = inner.sequence.peek();
            if !inner.watermarks.accepts(sequence) {
                return Err(NodeError::new(
                    ErrorCode::InvalidSequence,
                    format!("sequence {} is outside the watermark window", sequence),
                ));
            }
            inner.sequence.next();
            let (sender, receiver) = mpsc::sync_channel(1);
            inner.pending = Some(PendingRequest {
                digest,
                completion: sender,
            });
            (sequence, receiver)
        };

        let pre_prepare = PrePrepareMsg {
            view,
            sequence,
            digest,
            request: m,
        };
        logging::phase(logging::PRE_PREPARE, &self.name, view, sequence, &digest);
        self.broadcast_or_view_change(Message::PrePrepare(pre_prepare), view)?;

        self.await_commitment(completion, view)
    }

    fn forward_request(
        &self,
        m: RequestMsg,
        view: ViewNumber,
        master: NodeName,
        digest: CryptoHash,
    ) -> Result<Message, NodeError> {
        logging::forward_request(&self.name, &master, &digest);
        match self
            .transport
            .send(&master, Message::Request(m.clone()), self.request_timeout)
        {
            Ok(response) => Ok(response),
            Err(error) => {
                // The master is unresponsive. If this replica already committed the operation,
                // answer from its own log; otherwise the master is a liveness fault.
                let committed = {
                    let inner = self.inner.lock().unwrap();
                    committed_reply(&inner, &self.name, &m, digest)
                };
                if let Some(reply) = committed {
                    return Ok(Message::Reply(reply));
                }
                logging::broadcast_failure(&self.name, &master, "request", &error.to_string());
                self.trigger_view_change(view + 1);
                Err(NodeError::new(
                    ErrorCode::ViewChanging,
                    "the master is unresponsive",
                ))
            }
        }
    }

    fn await_commitment(
        &self,
        completion: Receiver<ReplyMsg>,
        view: ViewNumber,
    ) -> Result<Message, NodeError> {
        match completion.recv_timeout(self.request_timeout) {
            Ok(reply) => Ok(Message::Reply(reply)),
            Err(_) => {
                self.inner.lock().unwrap().pending = None;
                self.trigger_view_change(view + 1);
                Err(NodeError::new(
                    ErrorCode::ViewChanging,
                    "the operation did not commit in time",
                ))
            }
        }
    }

    fn on_find_master(&self) -> Result<Message, NodeError> {
        let inner = self.inner.lock().unwrap();
        Ok(Message::MasterInfo(MasterInfoMsg {
            name: self.cluster.master_of(inner.view).name.clone(),
        }))
    }

    fn on_query_status(&self) -> Result<Message, NodeError> {
        let inner = self.inner.lock().unwrap();
        Ok(Message::NodeStatus(NodeStatusMsg {
            view: inner.view,
            master: self.cluster.master_of(inner.view).name.clone(),
            automata: inner.automata.status(),
            params: self.cluster.params,
            height: inner.height,
            low_water_mark: inner.watermarks.low,
            high_water_mark: inner.watermarks.high(),
        }))
    }

    fn on_query_automata(&self, m: QueryAutomataMsg) -> Result<Message, NodeError> {
        let inner = self.inner.lock().unwrap();
        Ok(Message::ok(inner.automata.query(&m.command)))
    }

    fn on_corrupt(&self, m: CorruptMsg) -> Result<Message, NodeError> {
        if m.name != self.name {
            return Ok(Message::ok("not addressed to this replica"));
        }
        self.corrupt();
        Ok(Message::ok("corrupted"))
    }

    // ------------------------------------------------------------------------------------------
    // Three-phase protocol handlers.
    // ------------------------------------------------------------------------------------------

    fn on_pre_prepare(&self, m: PrePrepareMsg) -> Result<Message, NodeError> {
        let prepare = {
            let mut inner = self.inner.lock().unwrap();
            if inner.view_changing.is_some() {
                return Err(NodeError::new(
                    ErrorCode::ViewChanging,
                    "a view change is underway",
                ));
            }
            if !inner.watermarks.accepts(m.sequence) {
                return Err(NodeError::new(
                    ErrorCode::InvalidSequence,
                    format!("sequence {} is outside the watermark window", m.sequence),
                ));
            }
            if m.view != inner.view {
                return Err(NodeError::new(
                    ErrorCode::InvalidView,
                    format!("message view {} does not match view {}", m.view, inner.view),
                ));
            }
            if m.digest != digest_of(&m.request) {
                return Err(NodeError::new(
                    ErrorCode::InvalidDigest,
                    "digest does not match the carried request",
                ));
            }
            // A pre-prepare for an instance that already progressed past pre-prepare here is a
            // late arrival, not a fault.
            if progressed_past_pre_prepare(&inner.log, &self.name, m.sequence, m.digest) {
                return Ok(Message::ok("already prepared"));
            }
            let message = Message::PrePrepare(m.clone());
            if inner.log.exists(&message) {
                return Err(NodeError::new(ErrorCode::DuplicatedMsg, "already logged"));
            }
            if !matches!(inner.status, Status::Idle | Status::Malicious) {
                log::warn!(
                    "{} accepted a pre-prepare while status is {:?}",
                    self.name,
                    inner.status
                );
            }
            inner.log.append(message);
            inner.status = Status::PrePrepared;
            PrepareMsg {
                view: m.view,
                sequence: m.sequence,
                digest: m.digest,
                node: self.name.clone(),
            }
        };

        logging::phase(logging::PREPARE, &self.name, m.view, m.sequence, &m.digest);
        self.broadcast_or_view_change(Message::Prepare(prepare), m.view)?;
        Ok(Message::ok("pre-prepare accepted"))
    }

    fn on_prepare(&self, m: PrepareMsg) -> Result<Message, NodeError> {
        let commit = {
            let mut inner = self.inner.lock().unwrap();
            if m.view > inner.view {
                // This replica has not entered the message's view yet; its own new-view
                // delivery may still be in flight. Keep the message, the quorum count picks
                // it up once the view is adopted.
                let message = Message::Prepare(m.clone());
                if inner.log.exists(&message) {
                    return Err(NodeError::new(ErrorCode::DuplicatedMsg, "already logged"));
                }
                inner.log.append(message);
                return Ok(Message::ok("kept for a future view"));
            }
            if inner.view_changing.is_some() {
                return Err(NodeError::new(
                    ErrorCode::ViewChanging,
                    "a view change is underway",
                ));
            }
            if !inner.watermarks.accepts(m.sequence) {
                return Err(NodeError::new(
                    ErrorCode::InvalidSequence,
                    format!("sequence {} is outside the watermark window", m.sequence),
                ));
            }
            if m.view != inner.view {
                return Err(NodeError::new(
                    ErrorCode::InvalidView,
                    format!("message view {} does not match view {}", m.view, inner.view),
                ));
            }
            if find_pre_prepare(&inner.log, m.sequence, m.digest).is_none() {
                return Err(NodeError::new(
                    ErrorCode::InvalidRequest,
                    "no matching pre-prepare is logged",
                ));
            }
            let message = Message::Prepare(m.clone());
            if inner.log.exists(&message) {
                return Err(NodeError::new(ErrorCode::DuplicatedMsg, "already logged"));
            }
            inner.log.append(message);

            let prepares = inner.log.count(MessageKind::Prepare, |logged| {
                matches!(logged, Message::Prepare(p)
                    if p.view == m.view && p.sequence == m.sequence && p.digest == m.digest)
            });
            if prepares < self.cluster.params.quorum() {
                return Ok(Message::ok("preparing"));
            }
            // The commit quorum can complete before this replica's own prepare quorum does.
            if already_committed(&inner.log, &self.name, m.sequence, m.digest) {
                return Ok(Message::ok("already committed"));
            }
            let prepared = Message::Prepared(PreparedMsg {
                view: m.view,
                sequence: m.sequence,
                digest: m.digest,
                node: self.name.clone(),
            });
            if inner.log.exists(&prepared) {
                // The quorum was already acted on when an earlier prepare arrived.
                return Ok(Message::ok("already prepared"));
            }
            inner.log.append(prepared);
            inner.status = Status::Prepared;
            CommitMsg {
                view: m.view,
                sequence: m.sequence,
                digest: m.digest,
                node: self.name.clone(),
            }
        };

        logging::phase(logging::PREPARED, &self.name, m.view, m.sequence, &m.digest);
        self.broadcast_or_view_change(Message::Commit(commit), m.view)?;
        Ok(Message::ok("prepared"))
    }

    fn on_commit(&self, m: CommitMsg) -> Result<Message, NodeError> {
        let checkpoint = {
            let mut inner = self.inner.lock().unwrap();
            if m.view > inner.view {
                let message = Message::Commit(m.clone());
                if inner.log.exists(&message) {
                    return Err(NodeError::new(ErrorCode::DuplicatedMsg, "already logged"));
                }
                inner.log.append(message);
                return Ok(Message::ok("kept for a future view"));
            }
            if inner.view_changing.is_some() {
                return Err(NodeError::new(
                    ErrorCode::ViewChanging,
                    "a view change is underway",
                ));
            }
            if !inner.watermarks.accepts(m.sequence) {
                return Err(NodeError::new(
                    ErrorCode::InvalidSequence,
                    format!("sequence {} is outside the watermark window", m.sequence),
                ));
            }
            if m.view != inner.view {
                return Err(NodeError::new(
                    ErrorCode::InvalidView,
                    format!("message view {} does not match view {}", m.view, inner.view),
                ));
            }
            let message = Message::Commit(m.clone());
            if inner.log.exists(&message) {
                return Err(NodeError::new(ErrorCode::DuplicatedMsg, "already logged"));
            }
            // Stragglers keep arriving after this replica applied the operation.
            if already_committed(&inner.log, &self.name, m.sequence, m.digest) {
                inner.log.append(message);
                return Ok(Message::ok("already committed"));
            }
            if inner.status == Status::Idle {
                return Err(NodeError::new(
                    ErrorCode::InvalidStatus,
                    "no operation is in progress",
                ));
            }
            inner.log.append(message);

            let commits = inner.log.count(MessageKind::Commit, |logged| {
                matches!(logged, Message::Commit(c)
                    if c.view == m.view && c.sequence == m.sequence && c.digest == m.digest)
            });
            if commits < self.cluster.params.quorum() {
                return Ok(Message::ok("committing"));
            }

            let request = match find_pre_prepare(&inner.log, m.sequence, m.digest) {
                Some(pre_prepare) => pre_prepare.request.clone(),
                None => {
                    log::error!(
                        "{} reached a commit quorum for sequence {} without a pre-prepare",
                        self.name,
                        m.sequence
                    );
                    return Err(NodeError::new(
                        ErrorCode::InternalError,
                        "commit quorum without a pre-prepare",
                    ));
                }
            };

            inner.automata.transfer(&request.payload);
            inner.log.append(Message::Committed(CommittedMsg {
                view: m.view,
                sequence: m.sequence,
                digest: m.digest,
                node: self.name.clone(),
            }));
            if let Some(pending) = inner.pending.take() {
                if pending.digest == m.digest {
                    let reply = ReplyMsg {
                        view: inner.view,
                        timestamp: request.timestamp,
                        node: self.name.clone(),
                        result: request.payload.clone(),
                    };
                    let _ = pending.completion.try_send(reply);
                } else {
                    inner.pending = Some(pending);
                }
            }
            inner.status = Status::Idle;
            inner.height += 1;
            logging::phase(logging::COMMITTED, &self.name, m.view, m.sequence, &m.digest);

            if inner.height % self.cluster.params.k == 0 {
                Some(CheckpointMsg {
                    sequence: m.sequence,
                    digest: inner.automata.digest(),
                    node: self.name.clone(),
                })
            } else {
                None
            }
        };

        if let Some(checkpoint) = checkpoint {
            logging::phase(
                logging::CHECKPOINT,
                &self.name,
                m.view,
                checkpoint.sequence,
                &checkpoint.digest,
            );
            self.broadcast_logging_failures(Message::Checkpoint(checkpoint));
        }
        Ok(Message::ok("committed"))
    }

    fn on_checkpoint(&self, m: CheckpointMsg) -> Result<Message, NodeError> {
        // Checkpoints are processed even during a view change: they only ever move the cluster
        // towards a more recent stable state.
        let mut inner = self.inner.lock().unwrap();
        if m.sequence < inner.watermarks.low || m.sequence > inner.watermarks.high() {
            return Err(NodeError::new(
                ErrorCode::InvalidSequence,
                format!("checkpoint sequence {} is outside the watermark window", m.sequence),
            ));
        }
        let message = Message::Checkpoint(m.clone());
        if inner.log.exists(&message) {
            return Err(NodeError::new(ErrorCode::DuplicatedMsg, "already logged"));
        }
        inner.log.append(message);

        let certificates = inner.log.count(MessageKind::Checkpoint, |logged| {
            matches!(logged, Message::Checkpoint(c)
                if c.sequence == m.sequence && c.digest == m.digest)
        });
        if certificates >= self.cluster.params.quorum() && m.sequence > inner.watermarks.low {
            inner.watermarks.advance(m.sequence);
            inner.log.clear_below(m.sequence);
            logging::stable_checkpoint(&self.name, m.sequence, &m.digest);
        }
        Ok(Message::ok("checkpoint accepted"))
    }

    // ------------------------------------------------------------------------------------------
    // View changes.
    // ------------------------------------------------------------------------------------------

    /// Start agitating for `new_view`: multicast a view-change message carrying this replica's
    /// stable-checkpoint proof and its evidence for every instance above it.
    pub fn trigger_view_change(&self, new_view: ViewNumber) {
        let message = {
            let mut inner = self.inner.lock().unwrap();
            if matches!(inner.view_changing, Some(target) if target >= new_view) {
                return;
            }
            inner.view_changing = Some(new_view);
            inner.pending = None;
            let sequence = inner.watermarks.low;
            logging::view_change(&self.name, new_view, sequence);
            ViewChangeMsg {
                view: new_view,
                node: self.name.clone(),
                sequence,
                proof: checkpoint_certificates(&inner.log, sequence),
                pendings: pending_proofs(&inner.log, sequence),
            }
        };
        self.broadcast_logging_failures(Message::ViewChange(message));
    }

    fn on_view_change(&self, m: ViewChangeMsg) -> Result<Message, NodeError> {
        if !self.cluster.contains(&m.node) {
            return Err(NodeError::new(
                ErrorCode::UnknownSender,
                format!("{} is not a cluster member", m.node),
            ));
        }
        if self.cluster.master_of(m.view).name != self.name {
            // Only the prospective master of the requested view collects these.
            return Ok(Message::ok("ignored"));
        }

        let new_view = {
            let mut inner = self.inner.lock().unwrap();
            if m.view <= inner.view {
                return Err(NodeError::new(
                    ErrorCode::InvalidView,
                    format!("view {} is not beyond view {}", m.view, inner.view),
                ));
            }
            if m.sequence != inner.watermarks.low {
                return Err(NodeError::new(
                    ErrorCode::InvalidSequence,
                    format!(
                        "checkpoint sequence {} does not match the stable sequence {}",
                        m.sequence, inner.watermarks.low
                    ),
                ));
            }
            let message = Message::ViewChange(m.clone());
            if inner.log.exists(&message) {
                return Err(NodeError::new(ErrorCode::DuplicatedMsg, "already logged"));
            }
            inner.view_changing = Some(m.view);
            inner.log.append(message);

            // One vote per replica: a faulty sender can log many distinct view-changes for
            // the same view, but only its first contributes to the quorum or the proof.
            let mut contributors: HashSet<&NodeName> = HashSet::new();
            let proof: Vec<ViewChangeMsg> = inner
                .log
                .select(MessageKind::ViewChange, |logged| {
                    matches!(logged, Message::ViewChange(vc)
                        if vc.view == m.view && vc.sequence == m.sequence)
                })
                .into_iter()
                .filter_map(|logged| match logged {
                    Message::ViewChange(vc) => {
                        contributors.insert(&vc.node).then(|| vc.clone())
                    }
                    _ => None,
                })
                .collect();
            if (proof.len() as u64) < self.cluster.params.quorum() {
                return Ok(Message::ok("collecting view changes"));
            }
            let (stable, pendings) = reconstruct_replay_set(m.view, &proof);
            logging::new_view(&self.name, m.view, stable, pendings.len());

            NewViewMsg {
                view: m.view,
                sequence: stable,
                proof,
                pendings,
            }
        };

        // Adoption and replay happen in the new-view handler; this replica receives its own copy
        // through loopback and installs the view exactly the way every follower does.
        self.broadcast_logging_failures(Message::NewView(new_view));
        Ok(Message::ok("new view proposed"))
    }

    fn on_new_view(&self, m: NewViewMsg) -> Result<Message, NodeError> {
        let prepares = {
            let mut inner = self.inner.lock().unwrap();
            if inner.view_changing.is_none() && inner.view == m.view {
                return Ok(Message::ok("already in this view"));
            }
            if m.view < inner.view {
                return Err(NodeError::new(
                    ErrorCode::InvalidView,
                    format!("view {} is not beyond view {}", m.view, inner.view),
                ));
            }
            // The proof must itself be a quorum: view-changes for this view from 2f + 1
            // distinct cluster members. Anything less is fabricated.
            let contributors: HashSet<&NodeName> = m
                .proof
                .iter()
                .filter(|vc| vc.view == m.view && self.cluster.contains(&vc.node))
                .map(|vc| &vc.node)
                .collect();
            if (contributors.len() as u64) < self.cluster.params.quorum() {
                return Err(NodeError::new(
                    ErrorCode::InvalidRequest,
                    "the new-view proof does not carry a view-change quorum",
                ));
            }
            // Never trust the claimed replay set: re-derive it from the proof and compare
            // bit for bit. A mismatch unmasks a byzantine new master.
            let (stable, pendings) = reconstruct_replay_set(m.view, &m.proof);
            if stable != m.sequence || pendings != m.pendings {
                let master = self.cluster.master_of(m.view).name.clone();
                logging::malicious_master(&self.name, &master, m.view);
                drop(inner);
                self.trigger_view_change(m.view + 1);
                return Err(NodeError::new(
                    ErrorCode::InternalError,
                    "the new-view replay set does not match its proof",
                ));
            }
            adopt_view(&mut inner, m.view, stable);
            logging::enter_view(&self.name, m.view, stable);

            // Log the replay pre-prepares in the same critical section as the adoption, so
            // there is never a moment where this replica is in the new view but would refuse
            // a prepare for an instance it is about to replay.
            let mut prepares = Vec::new();
            for pre_prepare in pendings {
                logging::replay(
                    &self.name,
                    pre_prepare.view,
                    pre_prepare.sequence,
                    &pre_prepare.digest,
                );
                let prepare = PrepareMsg {
                    view: pre_prepare.view,
                    sequence: pre_prepare.sequence,
                    digest: pre_prepare.digest,
                    node: self.name.clone(),
                };
                if inner.log.append(Message::PrePrepare(pre_prepare)) {
                    inner.status = Status::PrePrepared;
                    prepares.push(prepare);
                }
            }
            prepares
        };

        // Prepares and commits now flow through the ordinary three-phase path.
        for prepare in prepares {
            logging::phase(
                logging::PREPARE,
                &self.name,
                prepare.view,
                prepare.sequence,
                &prepare.digest,
            );
            self.broadcast_or_view_change(Message::Prepare(prepare), m.view)?;
        }
        Ok(Message::ok("new view adopted"))
    }

    // ------------------------------------------------------------------------------------------
    // Broadcasting.
    // ------------------------------------------------------------------------------------------

    /// Deliver `message` to every cluster member, one sender thread per peer, and collect the
    /// outcomes. The sender's own copy arrives through transport loopback like everyone else's.
    fn broadcast(&self, message: &Message) -> Vec<(NodeName, Result<Message, TransportError>)> {
        self.broadcasts.add(self.cluster.len() as u64);
        thread::scope(|scope| {
            let handles: Vec<_> = self
                .cluster
                .nodes
                .iter()
                .map(|peer| {
                    let message = message.clone();
                    scope.spawn(move || {
                        let outcome =
                            self.transport
                                .send(&peer.name, message, self.broadcast_timeout);
                        self.broadcasts.done();
                        (peer.name.clone(), outcome)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    /// Broadcast a three-phase protocol message. A per-peer timeout means the cluster is not
    /// making progress under the current master, so it escalates to a view change.
    fn broadcast_or_view_change(
        &self,
        message: Message,
        view: ViewNumber,
    ) -> Result<(), NodeError> {
        let kind = message.kind().to_string();
        let mut timed_out = false;
        for (peer, outcome) in self.broadcast(&message) {
            if let Err(error) = outcome {
                logging::broadcast_failure(&self.name, &peer, &kind, &error.to_string());
                timed_out |= matches!(error, TransportError::Timeout(_));
            }
        }
        if timed_out {
            self.trigger_view_change(view + 1);
            return Err(NodeError::new(
                ErrorCode::ViewChanging,
                "a peer timed out during a broadcast",
            ));
        }
        Ok(())
    }

    fn broadcast_logging_failures(&self, message: Message) {
        let kind = message.kind().to_string();
        for (peer, outcome) in self.broadcast(&message) {
            if let Err(error) = outcome {
                logging::broadcast_failure(&self.name, &peer, &kind, &error.to_string());
            }
        }
    }
}

/// Re-derive the replay set of a new view from `2f + 1` view-change messages.
///
/// This must be a pure function of `(new_view, proof)`: the new master computes it to build the
/// new-view message, every follower recomputes it to check the master. Returns the recovered
/// stable-checkpoint sequence and the pre-prepares to re-run above it, re-stamped with the new
/// view and ordered by sequence. When nothing survives, a single no-op placeholder is
/// synthesized so the new view still starts with one agreed instance.
pub fn reconstruct_replay_set(
    new_view: ViewNumber,
    proof: &[ViewChangeMsg],
) -> (SequenceNumber, Vec<PrePrepareMsg>) {
    let stable = proof
        .iter()
        .flat_map(|vc| vc.proof.iter().map(|c| c.sequence))
        .max()
        .unwrap_or(0);

    let mut by_sequence: std::collections::BTreeMap<SequenceNumber, PrePrepareMsg> =
        std::collections::BTreeMap::new();
    for vc in proof {
        for pending in &vc.pendings {
            let pre_prepare = &pending.pre_prepare;
            if pre_prepare.sequence <= stable {
                continue;
            }
            if pre_prepare.digest != digest_of(&pre_prepare.request) {
                // A corrupt contributor; the certificate is worthless for replay.
                continue;
            }
            match by_sequence.get(&pre_prepare.sequence) {
                // Of competing pre-prepares for one sequence, the most recent view wins.
                Some(existing) if existing.view >= pre_prepare.view => {}
                _ => {
                    by_sequence.insert(pre_prepare.sequence, pre_prepare.clone());
                }
            }
        }
    }

    let mut pendings: Vec<PrePrepareMsg> = by_sequence
        .into_values()
        .map(|mut pre_prepare| {
            pre_prepare.view = new_view;
            pre_prepare
        })
        .collect();
    if pendings.is_empty() {
        let request = RequestMsg::noop();
        pendings.push(PrePrepareMsg {
            view: new_view,
            sequence: stable,
            digest: digest_of(&request),
            request,
        });
    }
    (stable, pendings)
}

fn adopt_view<A: Automata>(inner: &mut Inner<A>, view: ViewNumber, stable: SequenceNumber) {
    if stable > inner.watermarks.low {
        inner.watermarks.advance(stable);
        inner.log.clear_below(stable);
    }
    inner.view = view;
    inner.view_changing = None;
    inner.sequence.reset(stable);
    inner.status = Status::Idle;
    inner.pending = None;
}

fn find_pre_prepare(
    log: &MessageLog,
    sequence: SequenceNumber,
    digest: CryptoHash,
) -> Option<&PrePrepareMsg> {
    log.first(MessageKind::PrePrepare, |logged| {
        matches!(logged, Message::PrePrepare(pp)
            if pp.sequence == sequence && pp.digest == digest)
    })
    .and_then(|logged| match logged {
        Message::PrePrepare(pp) => Some(pp),
        _ => None,
    })
}

fn progressed_past_pre_prepare(
    log: &MessageLog,
    node: &str,
    sequence: SequenceNumber,
    digest: CryptoHash,
) -> bool {
    let own = |logged: &Message| match logged {
        Message::Prepared(m) => m.sequence == sequence && m.digest == digest && m.node == node,
        Message::Committed(m) => m.sequence == sequence && m.digest == digest && m.node == node,
        _ => false,
    };
    log.first(MessageKind::Prepared, own).is_some()
        || log.first(MessageKind::Committed, own).is_some()
}

fn already_committed(log: &MessageLog, node: &str, sequence: SequenceNumber, digest: CryptoHash) -> bool {
    log.first(MessageKind::Committed, |logged| {
        matches!(logged, Message::Committed(c)
            if c.sequence == sequence && c.digest == digest && c.node == node)
    })
    .is_some()
}

/// The reply this replica would give for an operation it has already committed, if it has.
fn committed_reply<A: Automata>(
    inner: &Inner<A>,
    node: &str,
    request: &RequestMsg,
    digest: CryptoHash,
) -> Option<ReplyMsg> {
    let committed = inner.log.first(MessageKind::Committed, |logged| {
        matches!(logged, Message::Committed(c) if c.digest == digest && c.node == node)
    })?;
    let view = match committed {
        Message::Committed(c) => c.view,
        _ => return None,
    };
    Some(ReplyMsg {
        view,
        timestamp: request.timestamp,
        node: node.to_string(),
        result: request.payload.clone(),
    })
}

fn checkpoint_certificates(log: &MessageLog, sequence: SequenceNumber) -> Vec<CheckpointMsg> {
    log.select(MessageKind::Checkpoint, |logged| {
        matches!(logged, Message::Checkpoint(c) if c.sequence == sequence)
    })
    .into_iter()
    .filter_map(|logged| match logged {
        Message::Checkpoint(c) => Some(c.clone()),
        _ => None,
    })
    .collect()
}

/// Evidence for every instance above the stable checkpoint: each logged pre-prepare paired with
/// the prepares logged for it.
fn pending_proofs(log: &MessageLog, stable: SequenceNumber) -> Vec<PendingProof> {
    log.select(MessageKind::PrePrepare, |logged| {
        matches!(logged, Message::PrePrepare(pp) if pp.sequence > stable)
    })
    .into_iter()
    .filter_map(|logged| match logged {
        Message::PrePrepare(pp) => Some(pp.clone()),
        _ => None,
    })
    .map(|pre_prepare| {
        let prepares = log
            .select(MessageKind::Prepare, |logged| {
                matches!(logged, Message::Prepare(p)
                    if p.sequence == pre_prepare.sequence && p.digest == pre_prepare.digest)
            })
            .into_iter()
            .filter_map(|logged| match logged {
                Message::Prepare(p) => Some(p.clone()),
                _ => None,
            })
            .collect();
        PendingProof {
            pre_prepare,
            prepares,
        }
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view_change(view: ViewNumber, node: &str, pendings: Vec<PendingProof>) -> ViewChangeMsg {
        ViewChangeMsg {
            view,
            node: node.to_string(),
            sequence: 0,
            proof: Vec::new(),
            pendings,
        }
    }

    fn pending(view: ViewNumber, sequence: SequenceNumber, payload: &str) -> PendingProof {
        let request = RequestMsg {
            timestamp: sequence,
            payload: payload.to_string(),
        };
        PendingProof {
            pre_prepare: PrePrepareMsg {
                view,
                sequence,
                digest: digest_of(&request),
                request,
            },
            prepares: Vec::new(),
        }
    }

    #[test]
    fn replay_set_synthesizes_a_placeholder_when_nothing_survives() {
        let proof = vec![
            view_change(1, "node1", Vec::new()),
            view_change(1, "node2", Vec::new()),
            view_change(1, "node3", Vec::new()),
        ];
        let (stable, pendings) = reconstruct_replay_set(1, &proof);
        assert_eq!(stable, 0);
        assert_eq!(pendings.len(), 1);
        assert_eq!(pendings[0].view, 1);
        assert_eq!(pendings[0].request, RequestMsg::noop());
        assert_eq!(pendings[0].digest, digest_of(&RequestMsg::noop()));
    }

    #[test]
    fn replay_set_is_a_pure_function_of_the_proof() {
        let proof = vec![
            view_change(1, "node1", vec![pending(0, 1, "a:1")]),
            view_change(1, "node2", vec![pending(0, 1, "a:1"), pending(0, 2, "b:2")]),
            view_change(1, "node3", vec![pending(0, 2, "b:2")]),
        ];
        let first = reconstruct_replay_set(1, &proof);
        let second = reconstruct_replay_set(1, &proof);
        assert_eq!(first, second);

        let (stable, pendings) = first;
        assert_eq!(stable, 0);
        let sequences: Vec<_> = pendings.iter().map(|p| p.sequence).collect();
        assert_eq!(sequences, vec![1, 2]);
        assert!(pendings.iter().all(|p| p.view == 1));
    }

    #[test]
    fn replay_set_prefers_the_most_recent_view_per_sequence() {
        let newer = pending(3, 1, "a:new");
        let proof = vec![
            view_change(4, "node1", vec![pending(2, 1, "a:old")]),
            view_change(4, "node2", vec![newer.clone()]),
            view_change(4, "node3", Vec::new()),
        ];
        let (_, pendings) = reconstruct_replay_set(4, &proof);
        assert_eq!(pendings.len(), 1);
        assert_eq!(pendings[0].request, newer.pre_prepare.request);
        assert_eq!(pendings[0].view, 4);
    }

    #[test]
    fn replay_set_drops_pre_prepares_whose_digest_lies_about_the_request() {
        let mut corrupt = pending(0, 1, "a:1");
        corrupt.pre_prepare.digest = [7u8; 32];
        let proof = vec![
            view_change(1, "node1", vec![corrupt]),
            view_change(1, "node2", Vec::new()),
            view_change(1, "node3", Vec::new()),
        ];
        let (_, pendings) = reconstruct_replay_set(1, &proof);
        // The corrupt instance is dropped, leaving only the synthesized placeholder.
        assert_eq!(pendings.len(), 1);
        assert_eq!(pendings[0].request, RequestMsg::noop());
    }

    #[test]
    fn replay_set_excludes_instances_at_or_below_the_stable_checkpoint() {
        let certificate = CheckpointMsg {
            sequence: 2,
            digest: [9u8; 32],
            node: "node1".to_string(),
        };
        let mut vc = view_change(1, "node1", vec![pending(0, 2, "b:2"), pending(0, 3, "c:3")]);
        vc.sequence = 2;
        vc.proof = vec![certificate];
        let proof = vec![vc, view_change(1, "node2", Vec::new()), view_change(1, "node3", Vec::new())];

        let (stable, pendings) = reconstruct_replay_set(1, &proof);
        assert_eq!(stable, 2);
        assert_eq!(pendings.len(), 1);
        assert_eq!(pendings[0].sequence, 3);
    }
}
