use std::net::Ipv4Addr;

use async_trait::async_trait;
use overlay_model::{ErrorKind, MachineId, OverlayError, OverlayPrefix, PeerId, PublicKey};

/// The controller's durable view of one peer. Distinct from
/// [`overlay_protocol::PeerSummary`], which is the much smaller
/// subset the signaling stream actually needs to hand to other
/// peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub machine_id: MachineId,
    pub user_id: String,
    pub overlay_ip: Ipv4Addr,
    pub prefix: OverlayPrefix,
    pub public_key: PublicKey,
    pub hostname: String,
    pub last_login_unix: i64,
    pub last_auth_unix: i64,
    pub connected: bool,
    pub disabled: bool,
}

/// Persistence boundary for peer records and overlay IP allocation.
///
/// Implementations must uphold the uniqueness invariants from the
/// data model (`machine_id`, `public_key`, and `overlay_ip` are each
/// unique among non-deleted peers) and must allocate an IP inside the
/// same transaction that creates the peer record, so two concurrent
/// registrations never receive the same address.
#[async_trait]
pub trait PeerStore: Send + Sync {
    async fn get_by_machine_id(&self, id: &MachineId) -> Result<Option<PeerRecord>, OverlayError>;

    async fn get_by_id(&self, id: PeerId) -> Result<Option<PeerRecord>, OverlayError>;

    async fn get_all(&self) -> Result<Vec<PeerRecord>, OverlayError>;

    async fn get_connected(&self) -> Result<Vec<PeerRecord>, OverlayError>;

    /// Allocates a fresh overlay IP in `prefix` and creates the
    /// record in one transaction, returning the peer id assigned.
    async fn create(
        &self,
        machine_id: MachineId,
        user_id: String,
        public_key: PublicKey,
        hostname: String,
        prefix: OverlayPrefix,
    ) -> Result<PeerRecord, OverlayError>;

    async fn update(&self, peer: PeerRecord) -> Result<(), OverlayError>;

    async fn set_connected(&self, id: PeerId, connected: bool) -> Result<(), OverlayError>;

    async fn touch_auth(&self, id: PeerId, now_unix: i64) -> Result<(), OverlayError>;
}

/// Helper used by callers that need a `NotFound` classified error
/// instead of bare `None` for a lookup that must succeed.
pub async fn require_peer(
    store: &dyn PeerStore,
    id: PeerId,
) -> Result<PeerRecord, OverlayError> {
    store
        .get_by_id(id)
        .await?
        .ok_or_else(|| OverlayError::new(ErrorKind::NotFound, format!("no peer with id {id}")))
}
