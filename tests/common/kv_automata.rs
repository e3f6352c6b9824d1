use std::collections::BTreeMap;

use pbft_rs::automata::Automata;
use pbft_rs::messages::digest_of;
use pbft_rs::types::CryptoHash;

/// A deterministic key-value store. Operations are `"key:value"` writes; an empty payload or one
/// without a separator is a no-op.
#[derive(Default)]
pub(crate) struct KvAutomata {
    state: BTreeMap<String, String>,
}

impl KvAutomata {
    pub(crate) fn new() -> KvAutomata {
        KvAutomata::default()
    }
}

impl Automata for KvAutomata {
    fn transfer(&mut self, payload: &str) {
        if let Some((key, value)) = payload.split_once(':') {
            self.state.insert(key.to_string(), value.to_string());
        }
    }

    fn query(&self, command: &str) -> String {
        self.state.get(command).cloned().unwrap_or_default()
    }

    fn status(&self) -> String {
        let entries: Vec<String> = self
            .state
            .iter()
            .map(|(key, value)| format!("{}:{}", key, value))
            .collect();
        entries.join(";")
    }

    fn digest(&self) -> CryptoHash {
        let entries: Vec<(&String, &String)> = self.state.iter().collect();
        digest_of(&entries)
    }
}
