//! The request/response pair carried over the local IPC socket
//! (§4.12), the same tagged-union shape this codebase's own headless
//! client uses for its `ClientMsg`/`ServerMsg` GUI channel, scaled
//! down to a single request-then-reply exchange per connection
//! instead of a long-lived event stream.

use overlay_model::PeerId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum ControlRequest {
    /// Establishes a signaling session with the controller. `access_token`
    /// is required the first time a machine id logs in, or again after the
    /// controller reports the stored credential has expired.
    Login { access_token: Option<String> },
    /// Brings the tunnel up: opens the host interface, starts the tun
    /// reader and the signaling reconciler. No-op if already running.
    Up,
    /// Tears the tunnel down idempotently; the node remains logged in.
    Down,
    Status,
    Logout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result")]
pub enum ControlResponse {
    LoginOk,
    LoginRequiresAuthentication { oidc_endpoints: Vec<String> },
    Up,
    Down,
    Status(NodeStatus),
    LoggedOut,
    Error { kind: String, message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub session: SessionState,
    pub tunnel_running: bool,
    pub peers: Vec<PeerStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    LoggedOut,
    LoggedIn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerStatus {
    pub peer_id: PeerId,
    pub hostname: String,
    pub phase: String,
}
