//! A minimal two-replica cluster (f = 0): every operation commits in view 0 and both replicas
//! apply the same sequence.

mod common;

use common::cluster::start_cluster;
use common::logging::setup_logger;
use log::LevelFilter;

#[test]
fn two_replicas_agree_on_a_sequence_of_operations() {
    setup_logger(LevelFilter::Warn);

    let cluster = start_cluster(2, 0, 2);
    let client = cluster.client();

    let reply = client.request("key1:value1").unwrap();
    assert_eq!(reply.view, 0);
    assert_eq!(reply.result, "key1:value1");

    let reply = client.request("key2:value2").unwrap();
    assert_eq!(reply.result, "key2:value2");

    assert_eq!(client.query_automata("key1").unwrap(), "value1");
    assert_eq!(client.query_automata("key2").unwrap(), "value2");
    assert_eq!(client.find_master().unwrap(), "node0");

    let digests: Vec<_> = cluster.nodes.iter().map(|node| node.state_digest()).collect();
    assert_eq!(digests[0], digests[1]);

    for node in &cluster.nodes {
        let status = client.node_status(node.name()).unwrap();
        assert_eq!(status.view, 0);
        assert_eq!(status.master, "node0");
        assert_eq!(status.height, 2);
        // The checkpoint at the second commit became stable and advanced the window.
        assert_eq!(status.low_water_mark, 2);
        assert_eq!(status.high_water_mark, 6);
        node.shutdown();
    }
}
