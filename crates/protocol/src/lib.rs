//! Wire types, the JSON-RPC channel, time parsing, and bipartite matching
//! shared by the hub, exporter, and agent binaries.

pub mod jsonrpc;
pub mod matching;
pub mod models;
pub mod time;
