//! The message schema carried over the controller<->node signaling
//! stream (§3, §6): login, peer-list updates, and ICE exchange. The
//! join/heartbeat/reply envelope these messages travel inside lives
//! in `overlay-signaling-client`/`overlay-controller`; this crate only
//! defines the payloads both sides agree on.

use std::net::Ipv4Addr;

use overlay_model::{MachineId, OverlayConfig, PeerId, PublicKey};
use serde::{Deserialize, Serialize};

/// Sent once per connection attempt, before the signaling stream is
/// considered usable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginPeerRequest {
    pub machine_id: MachineId,
    pub public_key: PublicKey,
    pub hostname: String,
    pub endpoint: Option<String>,
    pub access_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum LoginPeerResponse {
    Ok { config: OverlayConfig },
    /// The controller needs a fresh access token before it will
    /// complete the login; the node should run its OIDC flow and
    /// retry with the token populated.
    AuthenticationRequired { oidc_endpoints: Vec<String> },
}

/// One summarized peer entry as carried by `INIT`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSummary {
    pub peer_id: PeerId,
    pub overlay_ip: Ipv4Addr,
    pub public_key: PublicKey,
    pub hostname: String,
}

/// The ICE sub-messages forwarded between peers by the controller's
/// broker, rewriting `peer_id` to identify the sender as it passes
/// through (§4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum IceUpdate {
    Offer {
        peer_id: PeerId,
        ufrag: String,
        pwd: String,
    },
    Answer {
        peer_id: PeerId,
        ufrag: String,
        pwd: String,
    },
    Candidate {
        peer_id: PeerId,
        candidate: String,
    },
}

impl IceUpdate {
    /// The peer id this message is about — either the offerer or the
    /// target, depending on direction; used by the broker to decide
    /// where to route it.
    pub fn peer_id(&self) -> PeerId {
        match self {
            IceUpdate::Offer { peer_id, .. }
            | IceUpdate::Answer { peer_id, .. }
            | IceUpdate::Candidate { peer_id, .. } => *peer_id,
        }
    }

    pub fn with_peer_id(self, peer_id: PeerId) -> Self {
        match self {
            IceUpdate::Offer { ufrag, pwd, .. } => IceUpdate::Offer { peer_id, ufrag, pwd },
            IceUpdate::Answer { ufrag, pwd, .. } => IceUpdate::Answer { peer_id, ufrag, pwd },
            IceUpdate::Candidate { candidate, .. } => IceUpdate::Candidate { peer_id, candidate },
        }
    }
}

/// Messages the node sends up the signaling stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum UpdateRequest {
    Ice(IceUpdate),
}

/// Messages the controller pushes down the signaling stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum UpdateResponse {
    Init { peers: Vec<PeerSummary> },
    Connect { peer: PeerSummary },
    Disconnect { peer_id: PeerId },
    Logout,
    Ice(IceUpdate),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ice_update_rewrites_peer_id_in_place() {
        let offer = IceUpdate::Offer {
            peer_id: PeerId::new(7),
            ufrag: "uf".into(),
            pwd: "pw".into(),
        };
        let rewritten = offer.with_peer_id(PeerId::new(3));
        assert_eq!(rewritten.peer_id(), PeerId::new(3));
    }

    #[test]
    fn update_response_round_trips_through_json() {
        let msg = UpdateResponse::Disconnect {
            peer_id: PeerId::new(9),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: UpdateResponse = serde_json::from_str(&json).unwrap();
        match back {
            UpdateResponse::Disconnect { peer_id } => assert_eq!(peer_id, PeerId::new(9)),
            _ => panic!("wrong variant"),
        }
    }
}
