// Network module
//
// Peer set, the outbound peer client and the sync engine that keeps the
// local chain converged with the network

pub mod client;
pub mod peers;
pub mod sync;

pub use client::HttpPeerClient;
pub use peers::PeerSet;
pub use sync::{ReceiveOutcome, SyncEngine, SyncSettings};
