use overlay_protocol::{LoginPeerRequest, LoginPeerResponse, UpdateRequest, UpdateResponse};
use serde::{Deserialize, Serialize};

/// The join/heartbeat/update envelope the node wraps its payloads in.
///
/// A single WebSocket connection carries one join (the login), then a
/// steady trickle of updates in both directions, with heartbeats
/// keeping a connection that's gone half-open from looking alive.
/// This is the concrete framing for the abstract "bidirectional
/// stream" described by the signaling client's contract; its shape —
/// join first, then a uniform small message type, with the server
/// free to reply to any message with an error — mirrors the
/// join-then-stream signaling pattern used elsewhere in the
/// corpus's own reconnecting WebSocket client, adapted to this
/// system's own login/update payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ClientFrame {
    Join { login: LoginPeerRequest },
    Heartbeat,
    Update { request: UpdateRequest },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ServerFrame {
    JoinAck { response: LoginPeerResponse },
    Update { response: UpdateResponse },
    HeartbeatAck,
    Error { reason: String },
}
