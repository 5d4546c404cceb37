//! §4.6: the two parallel indices a running node keeps on its peers,
//! behind the single lock that keeps them coherent with each other.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use overlay_model::PeerId;
use parking_lot::RwLock;

use crate::peer::PeerHandle;

/// `peerId -> Peer` and `overlayIp -> Peer`, updated atomically
/// together. Reads never block on I/O — callers that need to talk to
/// a peer clone the `Arc<PeerHandle>` out and release the lock first.
#[derive(Default)]
pub struct PeerTable {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    by_id: HashMap<PeerId, Arc<PeerHandle>>,
    by_overlay_ip: HashMap<Ipv4Addr, Arc<PeerHandle>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `peer` into both indices, returning the handle it
    /// replaced (if the peer id was already present) so the caller can
    /// decide whether to shut it down.
    pub fn insert(&self, peer: Arc<PeerHandle>) -> Option<Arc<PeerHandle>> {
        let mut inner = self.inner.write();
        let previous = inner.by_id.insert(peer.peer_id(), Arc::clone(&peer));
        if let Some(prev) = &previous {
            inner.by_overlay_ip.remove(&prev.overlay_ip());
        }
        inner.by_overlay_ip.insert(peer.overlay_ip(), peer);
        previous
    }

    pub fn remove(&self, peer_id: PeerId) -> Option<Arc<PeerHandle>> {
        let mut inner = self.inner.write();
        let peer = inner.by_id.remove(&peer_id)?;
        inner.by_overlay_ip.remove(&peer.overlay_ip());
        Some(peer)
    }

    pub fn by_id(&self, peer_id: PeerId) -> Option<Arc<PeerHandle>> {
        self.inner.read().by_id.get(&peer_id).cloned()
    }

    pub fn by_overlay_ip(&self, ip: Ipv4Addr) -> Option<Arc<PeerHandle>> {
        self.inner.read().by_overlay_ip.get(&ip).cloned()
    }

    pub fn contains(&self, peer_id: PeerId) -> bool {
        self.inner.read().by_id.contains_key(&peer_id)
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.inner.read().by_id.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every stored handle, for shutdown and status reporting.
    pub fn all(&self) -> Vec<Arc<PeerHandle>> {
        self.inner.read().by_id.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{PeerContext, spawn_responder};
    use overlay_bufferpool::BufferPool;
    use overlay_ports::Tun;
    use overlay_model::{OverlayError, OverlayPrefix, PublicKey};
    use overlay_signaling_client::ControllerClient;
    use overlay_wire::PacketBuffer;
    use std::net::SocketAddr;

    struct NullTun;

    #[async_trait::async_trait]
    impl Tun for NullTun {
        async fn read(&self, _buf: &mut [u8]) -> Result<usize, OverlayError> {
            std::future::pending().await
        }
        async fn write(&self, buf: &[u8]) -> Result<usize, OverlayError> {
            Ok(buf.len())
        }
        fn mtu(&self) -> u16 {
            1400
        }
        async fn configure_ip(
            &self,
            _address: Ipv4Addr,
            _prefix: OverlayPrefix,
        ) -> Result<(), OverlayError> {
            Ok(())
        }
        async fn close(&self) -> Result<(), OverlayError> {
            Ok(())
        }
    }

    fn ctx() -> PeerContext {
        PeerContext {
            local_peer_id: PeerId::new(1),
            local_static_key: [1u8; 32],
            controller: Arc::new(ControllerClient::stub_closed()),
            tun: Arc::new(NullTun),
            inbound_pool: BufferPool::new(4, "inbound", PacketBuffer::new),
            outbound_pool: BufferPool::new(4, "outbound", PacketBuffer::new),
            stun_servers: Arc::new(Vec::<SocketAddr>::new()),
        }
    }

    #[tokio::test]
    async fn insert_then_lookup_by_both_indices() {
        let table = PeerTable::new();
        let handle = Arc::new(spawn_responder(
            ctx(),
            PeerId::new(2),
            PublicKey::from_bytes([2u8; 32]),
            Ipv4Addr::new(100, 70, 0, 2),
            "peer-b".into(),
            "ufrag".into(),
            "pwd".into(),
        ));

        table.insert(Arc::clone(&handle));

        assert!(table.by_id(PeerId::new(2)).is_some());
        assert!(table.by_overlay_ip(Ipv4Addr::new(100, 70, 0, 2)).is_some());
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn remove_clears_both_indices() {
        let table = PeerTable::new();
        let handle = Arc::new(spawn_responder(
            ctx(),
            PeerId::new(3),
            PublicKey::from_bytes([3u8; 32]),
            Ipv4Addr::new(100, 70, 0, 3),
            "peer-c".into(),
            "ufrag".into(),
            "pwd".into(),
        ));
        table.insert(handle);

        table.remove(PeerId::new(3));

        assert!(table.by_id(PeerId::new(3)).is_none());
        assert!(table.by_overlay_ip(Ipv4Addr::new(100, 70, 0, 3)).is_none());
        assert!(table.is_empty());
    }
}
