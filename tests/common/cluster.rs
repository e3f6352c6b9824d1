use std::sync::Arc;
use std::time::Duration;

use pbft_rs::client::Client;
use pbft_rs::messages::Message;
use pbft_rs::node::{Node, NodeSpec};
use pbft_rs::retry::RetryOptions;
use pbft_rs::types::{ClusterConfig, ClusterParams, Keypair, NodeIdentity};

use super::kv_automata::KvAutomata;
use super::loopback::LoopbackTransport;

pub(crate) struct TestCluster {
    pub(crate) transport: LoopbackTransport,
    pub(crate) config: ClusterConfig,
    pub(crate) nodes: Vec<Arc<Node<LoopbackTransport, KvAutomata>>>,
}

/// Start `size` replicas wired together over a loopback transport.
pub(crate) fn start_cluster(size: usize, f: u64, k: u64) -> TestCluster {
    let keypairs: Vec<Keypair> = (0..size).map(|_| Keypair::generate()).collect();
    let config = ClusterConfig {
        nodes: keypairs
            .iter()
            .enumerate()
            .map(|(i, keypair)| NodeIdentity {
                name: format!("node{}", i),
                host: "127.0.0.1".to_string(),
                port: 4000 + i as u16,
                verifying_key: keypair.public_bytes(),
            })
            .collect(),
        params: ClusterParams { f, k },
        signatures_enabled: false,
    };

    let transport = LoopbackTransport::new();
    let nodes: Vec<Arc<Node<LoopbackTransport, KvAutomata>>> = keypairs
        .into_iter()
        .enumerate()
        .map(|(i, keypair)| {
            let node = NodeSpec::builder()
                .name(format!("node{}", i))
                .cluster(config.clone())
                .keypair(keypair)
                .transport(transport.clone())
                .automata(KvAutomata::new())
                .request_timeout(Duration::from_secs(10))
                .broadcast_timeout(Duration::from_secs(5))
                .build()
                .start();
            let handler = {
                let node = Arc::clone(&node);
                Arc::new(move |message: Message| node.handle(message))
            };
            transport.register(node.name().to_string(), handler);
            node
        })
        .collect();

    TestCluster {
        transport,
        config,
        nodes,
    }
}

impl TestCluster {
    pub(crate) fn client(&self) -> Client<LoopbackTransport> {
        Client::builder()
            .cluster(self.config.clone())
            .transport(self.transport.clone())
            .retry(RetryOptions {
                max_attempts: 5,
                initial_delay: Duration::from_millis(20),
                backoff_multiplier: 2,
                max_delay: Some(Duration::from_millis(200)),
            })
            .timeout(Duration::from_secs(10))
            .build()
    }
}
