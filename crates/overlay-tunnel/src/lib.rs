//! The node's data plane (§2, §4.5-§4.6): the per-peer state machine,
//! the two-index peer table it lives in, and the glue that drives
//! both from the tun device and the controller signaling stream.

mod peer;
mod peer_table;
mod runtime;

pub use peer::{spawn_initiator, spawn_responder, PeerContext, PeerError, PeerHandle, PeerPhase};
pub use peer_table::PeerTable;
pub use runtime::{make_inbound_pool, make_outbound_pool, NodeTunnel};
