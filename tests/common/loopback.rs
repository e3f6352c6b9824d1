use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use pbft_rs::messages::Message;
use pbft_rs::transport::{Transport, TransportError};
use pbft_rs::types::NodeName;

pub(crate) type Handler = Arc<dyn Fn(Message) -> Message + Send + Sync>;

/// An in-process transport: a delivery is a direct call into the receiving replica's handler on
/// the sender's thread.
#[derive(Clone, Default)]
pub(crate) struct LoopbackTransport {
    handlers: Arc<RwLock<HashMap<NodeName, Handler>>>,
}

impl LoopbackTransport {
    pub(crate) fn new() -> LoopbackTransport {
        LoopbackTransport::default()
    }

    pub(crate) fn register(&self, name: NodeName, handler: Handler) {
        self.handlers.write().unwrap().insert(name, handler);
    }
}

impl Transport for LoopbackTransport {
    fn send(
        &self,
        peer: &str,
        message: Message,
        _timeout: Duration,
    ) -> Result<Message, TransportError> {
        // The handler is cloned out so the registry lock is not held across the call: handlers
        // broadcast, and broadcasts come right back through this transport.
        let handler = self
            .handlers
            .read()
            .unwrap()
            .get(peer)
            .cloned()
            .ok_or_else(|| TransportError::UnknownPeer(peer.to_string()))?;
        Ok(handler(message))
    }
}
