/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The client side of the protocol.
//!
//! A [Client] multicasts every interaction to the whole cluster and never trusts a single
//! replica: a response only counts once more than `f` replicas gave it, so at least one correct
//! replica stands behind it. While the cluster is changing views the client backs off and
//! retries.

use std::thread;
use std::time::{Duration, SystemTime};

use thiserror::Error;
use typed_builder::TypedBuilder;

use crate::messages::{ErrorCode, Message, NodeStatusMsg, ReplyMsg, RequestMsg};
use crate::messages::{FindMasterMsg, QueryAutomataMsg, QueryStatusMsg};
use crate::quorum::majority;
use crate::retry::{retry_with_backoff, RetryOptions};
use crate::transport::{Transport, TransportError};
use crate::types::{ClusterConfig, NodeName, Timestamp};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("the cluster is changing views")]
    ViewChanging,

    #[error("the cluster rejected the operation with {code}")]
    Rejected { code: ErrorCode },

    #[error("no response cleared the byzantine-majority threshold")]
    NoMajority,

    #[error("no replica produced a usable response")]
    NoResponse,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(TypedBuilder)]
pub struct Client<T: Transport> {
    pub cluster: ClusterConfig,
    pub transport: T,

    #[builder(default)]
    pub retry: RetryOptions,

    /// Per-replica timeout of one delivery. Request deliveries block for the full three-phase
    /// protocol, so this is sized like the replicas' request timeout.
    #[builder(default = Duration::from_secs(30))]
    pub timeout: Duration,
}

impl<T: Transport> Client<T> {
    /// Submit an operation and wait for the cluster to commit it. Retries with backoff while the
    /// cluster reports a view change in progress.
    pub fn request(&self, payload: &str) -> Result<ReplyMsg, ClientError> {
        let request = RequestMsg {
            timestamp: timestamp_now(),
            payload: payload.to_string(),
        };
        retry_with_backoff(
            &self.retry,
            |error: &ClientError| matches!(error, ClientError::ViewChanging),
            || self.request_once(&request),
        )
        .map_err(|error| {
            error
                .attempts
                .into_iter()
                .last()
                .unwrap_or(ClientError::NoResponse)
        })
    }

    fn request_once(&self, request: &RequestMsg) -> Result<ReplyMsg, ClientError> {
        let responses = self.collect(Message::Request(request.clone()));
        if responses.is_empty() {
            return Err(ClientError::NoResponse);
        }

        // Replies only agree if they name the same operation committed in the same view. The
        // replica name and therefore the whole message differ, so the vote runs on the
        // distinguishing fields.
        let votes: Vec<(Timestamp, u64, String)> = responses
            .iter()
            .filter_map(|m| match m {
                Message::Reply(r) => Some((r.timestamp, r.view, r.result.clone())),
                _ => None,
            })
            .collect();
        if let Some((timestamp, view, result)) = majority(&votes, self.cluster.params.f) {
            let winner = responses.into_iter().find_map(|m| match m {
                Message::Reply(r)
                    if r.timestamp == timestamp && r.view == view && r.result == result =>
                {
                    Some(r)
                }
                _ => None,
            });
            return winner.ok_or(ClientError::NoMajority);
        }

        let codes: Vec<ErrorCode> = responses
            .iter()
            .filter_map(|m| match m {
                Message::Error(e) => Some(e.code),
                _ => None,
            })
            .collect();
        match majority(&codes, self.cluster.params.f) {
            Some(ErrorCode::ViewChanging) => Err(ClientError::ViewChanging),
            Some(code) => Err(ClientError::Rejected { code }),
            None => Err(ClientError::NoMajority),
        }
    }

    /// Multicast a message and resolve the byzantine-majority response, compared as whole
    /// messages.
    pub fn send(&self, message: Message) -> Result<Message, ClientError> {
        let responses = self.collect(message);
        if responses.is_empty() {
            return Err(ClientError::NoResponse);
        }
        majority(&responses, self.cluster.params.f).ok_or(ClientError::NoMajority)
    }

    /// The name of the current master, as agreed by a byzantine majority.
    pub fn find_master(&self) -> Result<NodeName, ClientError> {
        let responses = self.collect(Message::FindMaster(FindMasterMsg {}));
        let names: Vec<NodeName> = responses
            .into_iter()
            .filter_map(|m| match m {
                Message::MasterInfo(info) => Some(info.name),
                _ => None,
            })
            .collect();
        if names.is_empty() {
            return Err(ClientError::NoResponse);
        }
        majority(&names, self.cluster.params.f).ok_or(ClientError::NoMajority)
    }

    /// Run a read-only query against the automata, resolved by byzantine majority.
    pub fn query_automata(&self, command: &str) -> Result<String, ClientError> {
        let responses = self.collect(Message::QueryAutomata(QueryAutomataMsg {
            command: command.to_string(),
        }));
        let answers: Vec<String> = responses
            .into_iter()
            .filter_map(|m| match m {
                Message::Ok(ok) => ok.message,
                _ => None,
            })
            .collect();
        if answers.is_empty() {
            return Err(ClientError::NoResponse);
        }
        majority(&answers, self.cluster.params.f).ok_or(ClientError::NoMajority)
    }

    /// One replica's own view of its state. Unlike the majority operations, this deliberately
    /// reports a single replica, so it can be used to inspect divergence.
    pub fn node_status(&self, peer: &str) -> Result<NodeStatusMsg, ClientError> {
        match self
            .transport
            .send(peer, Message::QueryStatus(QueryStatusMsg {}), self.timeout)?
        {
            Message::NodeStatus(status) => Ok(status),
            Message::Error(e) => Err(ClientError::Rejected { code: e.code }),
            _ => Err(ClientError::NoResponse),
        }
    }

    /// Multicast `message` to every replica, one sender thread per replica, and keep whatever
    /// came back.
    fn collect(&self, message: Message) -> Vec<Message> {
        thread::scope(|scope| {
            let handles: Vec<_> = self
                .cluster
                .nodes
                .iter()
                .map(|peer| {
                    let message = message.clone();
                    scope.spawn(move || {
                        self.transport.send(&peer.name, message, self.timeout).ok()
                    })
                })
                .collect();
            handles
                .into_iter()
                .filter_map(|h| h.join().unwrap())
                .collect()
        })
    }
}

fn timestamp_now() -> Timestamp {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ErrorMsg, MasterInfoMsg};
    use crate::types::{ClusterParams, Keypair, NodeIdentity};
    use std::collections::HashMap;
    use std::sync::Arc;

    /// Answers every delivery with a canned per-peer response.
    #[derive(Clone)]
    struct CannedTransport {
        responses: Arc<HashMap<NodeName, Message>>,
    }

    impl Transport for CannedTransport {
        fn send(
            &self,
            peer: &str,
            _message: Message,
            _timeout: Duration,
        ) -> Result<Message, TransportError> {
            self.responses
                .get(peer)
                .cloned()
                .ok_or_else(|| TransportError::UnknownPeer(peer.to_string()))
        }
    }

    fn cluster_of(size: usize, f: u64) -> ClusterConfig {
        let nodes = (0..size)
            .map(|i| NodeIdentity {
                name: format!("node{}", i),
                host: "127.0.0.1".to_string(),
                port: 4000 + i as u16,
                verifying_key: Keypair::generate().public_bytes(),
            })
            .collect();
        ClusterConfig {
            nodes,
            params: ClusterParams { f, k: 2 },
            signatures_enabled: false,
        }
    }

    fn client_with(responses: Vec<(&str, Message)>, f: u64) -> Client<CannedTransport> {
        let responses: HashMap<NodeName, Message> = responses
            .into_iter()
            .map(|(name, message)| (name.to_string(), message))
            .collect();
        let size = responses.len();
        Client::builder()
            .cluster(cluster_of(size, f))
            .transport(CannedTransport {
                responses: Arc::new(responses),
            })
            .retry(RetryOptions {
                max_attempts: 2,
                initial_delay: Duration::from_millis(1),
                backoff_multiplier: 2,
                max_delay: None,
            })
            .build()
    }

    fn reply(node: &str, view: u64) -> Message {
        Message::Reply(ReplyMsg {
            view,
            timestamp: 17,
            node: node.to_string(),
            result: "a:1".to_string(),
        })
    }

    #[test]
    fn request_resolves_the_majority_reply_despite_a_divergent_replica() {
        let client = client_with(
            vec![
                ("node0", reply("node0", 0)),
                ("node1", reply("node1", 0)),
                ("node2", reply("node2", 0)),
                // One replica claims the operation committed in a different view.
                ("node3", reply("node3", 9)),
            ],
            1,
        );
        let reply = client.request("a:1").unwrap();
        assert_eq!(reply.view, 0);
        assert_eq!(reply.result, "a:1");
    }

    #[test]
    fn request_surfaces_a_majority_rejection_without_retrying() {
        let rejected = Message::Error(ErrorMsg {
            code: ErrorCode::InvalidSequence,
            message: None,
        });
        let client = client_with(
            vec![
                ("node0", rejected.clone()),
                ("node1", rejected.clone()),
                ("node2", rejected.clone()),
                ("node3", rejected),
            ],
            1,
        );
        match client.request("a:1") {
            Err(ClientError::Rejected { code }) => assert_eq!(code, ErrorCode::InvalidSequence),
            other => panic!("expected a rejection, got {:?}", other.map(|r| r.result)),
        }
    }

    #[test]
    fn request_retries_while_the_cluster_changes_views() {
        let changing = Message::Error(ErrorMsg {
            code: ErrorCode::ViewChanging,
            message: None,
        });
        let client = client_with(
            vec![
                ("node0", changing.clone()),
                ("node1", changing.clone()),
                ("node2", changing.clone()),
                ("node3", changing),
            ],
            1,
        );
        // Every attempt sees the same canned answer, so the retries exhaust.
        match client.request("a:1") {
            Err(ClientError::ViewChanging) => {}
            other => panic!("expected view-changing, got {:?}", other.map(|r| r.result)),
        }
    }

    #[test]
    fn find_master_needs_more_than_f_matching_answers() {
        let client = client_with(
            vec![
                ("node0", Message::MasterInfo(MasterInfoMsg { name: "node1".to_string() })),
                ("node1", Message::MasterInfo(MasterInfoMsg { name: "node2".to_string() })),
                ("node2", Message::MasterInfo(MasterInfoMsg { name: "node3".to_string() })),
                ("node3", Message::MasterInfo(MasterInfoMsg { name: "node0".to_string() })),
            ],
            1,
        );
        assert!(matches!(client.find_master(), Err(ClientError::NoMajority)));

        let client = client_with(
            vec![
                ("node0", Message::MasterInfo(MasterInfoMsg { name: "node1".to_string() })),
                ("node1", Message::MasterInfo(MasterInfoMsg { name: "node1".to_string() })),
                ("node2", Message::MasterInfo(MasterInfoMsg { name: "node1".to_string() })),
                ("node3", Message::MasterInfo(MasterInfoMsg { name: "node0".to_string() })),
            ],
            1,
        );
        assert_eq!(client.find_master().unwrap(), "node1");
    }
}
