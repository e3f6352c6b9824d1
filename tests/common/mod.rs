pub(crate) mod cluster;

pub(crate) mod kv_automata;

pub(crate) mod logging;

pub(crate) mod loopback;
