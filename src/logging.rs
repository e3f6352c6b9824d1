/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! PBFT-rs logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
//! printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values). The first two values are always:
//! 1. The name of the event in PascalCase (defined in this module as constants).
//! 2. The name of the replica emitting the event.
//!
//! The rest of the values differ depending on the kind of event. For example, the following
//! snippet is how a [COMMIT] is printed:
//!
//! ```text
//! Commit, node2, 0, 1, Id5u7f6
//! ```
//!
//! In the snippet the third value is the view, the fourth the sequence number, and the fifth the
//! first seven characters of the Base64 encoding of the operation's digest.

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use log;

use crate::types::{CryptoHash, SequenceNumber, ViewNumber};

// Names of each event in PascalCase for printing:
pub const RECEIVE_REQUEST: &str = "ReceiveRequest";
pub const FORWARD_REQUEST: &str = "ForwardRequest";
pub const PRE_PREPARE: &str = "PrePrepare";
pub const PREPARE: &str = "Prepare";
pub const PREPARED: &str = "Prepared";
pub const COMMIT: &str = "Commit";
pub const COMMITTED: &str = "Committed";
pub const CHECKPOINT: &str = "Checkpoint";
pub const STABLE_CHECKPOINT: &str = "StableCheckpoint";
pub const VIEW_CHANGE: &str = "ViewChange";
pub const ENTER_VIEW: &str = "EnterView";
pub const NEW_VIEW: &str = "NewView";
pub const REPLAY: &str = "Replay";
pub const MALICIOUS_MASTER: &str = "MaliciousMaster";
pub const CORRUPTED: &str = "Corrupted";
pub const BROADCAST_FAILURE: &str = "BroadcastFailure";
pub const REJECT: &str = "Reject";

pub(crate) fn phase(event: &str, node: &str, view: ViewNumber, sequence: SequenceNumber, digest: &CryptoHash) {
    log::info!(
        "{}, {}, {}, {}, {}",
        event,
        node,
        view,
        sequence,
        first_seven_base64_chars(digest)
    );
}

pub(crate) fn receive_request(node: &str, digest: &CryptoHash) {
    log::debug!("{}, {}, {}", RECEIVE_REQUEST, node, first_seven_base64_chars(digest));
}

pub(crate) fn forward_request(node: &str, master: &str, digest: &CryptoHash) {
    log::debug!(
        "{}, {}, {}, {}",
        FORWARD_REQUEST,
        node,
        master,
        first_seven_base64_chars(digest)
    );
}

pub(crate) fn stable_checkpoint(node: &str, sequence: SequenceNumber, digest: &CryptoHash) {
    log::info!(
        "{}, {}, {}, {}",
        STABLE_CHECKPOINT,
        node,
        sequence,
        first_seven_base64_chars(digest)
    );
}

pub(crate) fn view_change(node: &str, view: ViewNumber, sequence: SequenceNumber) {
    log::info!("{}, {}, {}, {}", VIEW_CHANGE, node, view, sequence);
}

pub(crate) fn enter_view(node: &str, view: ViewNumber, sequence: SequenceNumber) {
    log::info!("{}, {}, {}, {}", ENTER_VIEW, node, view, sequence);
}

pub(crate) fn new_view(node: &str, view: ViewNumber, sequence: SequenceNumber, replayed: usize) {
    log::info!("{}, {}, {}, {}, {}", NEW_VIEW, node, view, sequence, replayed);
}

pub(crate) fn replay(node: &str, view: ViewNumber, sequence: SequenceNumber, digest: &CryptoHash) {
    log::info!(
        "{}, {}, {}, {}, {}",
        REPLAY,
        node,
        view,
        sequence,
        first_seven_base64_chars(digest)
    );
}

pub(crate) fn malicious_master(node: &str, master: &str, view: ViewNumber) {
    log::error!("{}, {}, {}, {}", MALICIOUS_MASTER, node, master, view);
}

pub(crate) fn corrupted(node: &str) {
    log::warn!("{}, {}", CORRUPTED, node);
}

pub(crate) fn broadcast_failure(node: &str, peer: &str, kind: &str, reason: &str) {
    log::warn!("{}, {}, {}, {}, {}", BROADCAST_FAILURE, node, peer, kind, reason);
}

pub(crate) fn reject(node: &str, kind: &str, code: &str) {
    log::debug!("{}, {}, {}, {}", REJECT, node, kind, code);
}

// Get a more readable representation of a bytesequence by base64-encoding it and taking the first 7 characters.
pub(crate) fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}
