//! A thin duplex-connection wrapper around [`str0m`]'s ICE agent,
//! plus a minimal STUN client used only to discover this host's
//! server-reflexive candidate during gathering.

mod agent;
mod stun;

pub use agent::{IceAgent, IceConn, IceError, IceEvent};
pub use stun::StunError;
