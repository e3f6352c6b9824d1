/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

pub mod automata;

pub mod client;

pub mod logging;

pub mod message_log;

pub mod messages;

pub mod node;

pub mod quorum;

pub mod retry;

pub mod transport;

pub mod types;

pub mod waitgroup;
