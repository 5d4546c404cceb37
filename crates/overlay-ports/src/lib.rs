//! The capability traits the core depends on but does not implement:
//! persistence, identity validation, and the host tun interface. Each
//! is a small `async_trait` boundary, the same shape this codebase
//! uses elsewhere to let infrastructure concerns be swapped out from
//! under the core without it knowing or caring (e.g. how a UDP socket
//! gets bound is a trait the core core is handed, not a concrete
//! type).

mod peer_store;
mod token_validator;
mod tun;

pub use peer_store::{PeerRecord, PeerStore};
pub use token_validator::TokenValidator;
pub use tun::Tun;
