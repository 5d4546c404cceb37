//! An in-process [`PeerStore`] backed by a single lock. The
//! persistence boundary in `overlay-ports` is deliberately storage
//! agnostic; this is the default adapter the controller binary wires
//! up when no external database is configured, the way a small
//! control-plane service in this corpus ships an in-memory fallback
//! alongside its real trait boundary.
//!
//! Allocation and record creation share one lock so the "allocate
//! inside the same transaction" invariant (§4.10) holds without a
//! real database transaction.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use overlay_model::{ErrorKind, MachineId, OverlayError, OverlayPrefix, PeerId, PublicKey};
use overlay_ports::PeerStore;
use parking_lot::RwLock;

use crate::ip_allocator;

#[derive(Default)]
pub struct InMemoryPeerStore {
    peers: RwLock<Vec<overlay_ports::PeerRecord>>,
    next_id: AtomicU32,
}

impl InMemoryPeerStore {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(Vec::new()),
            next_id: AtomicU32::new(1),
        }
    }
}

#[async_trait]
impl PeerStore for InMemoryPeerStore {
    async fn get_by_machine_id(&self, id: &MachineId) -> Result<Option<overlay_ports::PeerRecord>, OverlayError> {
        Ok(self.peers.read().iter().find(|p| &p.machine_id == id).cloned())
    }

    async fn get_by_id(&self, id: PeerId) -> Result<Option<overlay_ports::PeerRecord>, OverlayError> {
        Ok(self.peers.read().iter().find(|p| p.peer_id == id).cloned())
    }

    async fn get_all(&self) -> Result<Vec<overlay_ports::PeerRecord>, OverlayError> {
        Ok(self.peers.read().clone())
    }

    async fn get_connected(&self) -> Result<Vec<overlay_ports::PeerRecord>, OverlayError> {
        Ok(self.peers.read().iter().filter(|p| p.connected).cloned().collect())
    }

    async fn create(
        &self,
        machine_id: MachineId,
        user_id: String,
        public_key: PublicKey,
        hostname: String,
        prefix: OverlayPrefix,
    ) -> Result<overlay_ports::PeerRecord, OverlayError> {
        let mut peers = self.peers.write();

        if peers.iter().any(|p| p.machine_id == machine_id) {
            return Err(OverlayError::new(
                ErrorKind::PermissionDenied,
                format!("machine id {machine_id} is already registered"),
            ));
        }
        if peers.iter().any(|p| p.public_key == public_key) {
            return Err(OverlayError::new(
                ErrorKind::PermissionDenied,
                "public key is already registered to another peer",
            ));
        }

        let assigned: BTreeSet<Ipv4Addr> = peers.iter().filter(|p| p.prefix == prefix).map(|p| p.overlay_ip).collect();
        let overlay_ip = ip_allocator::allocate(&prefix, &assigned)
            .ok_or_else(|| OverlayError::new(ErrorKind::Internal, format!("overlay prefix {prefix} is full")))?;

        let peer_id = PeerId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let now = now_unix();
        let record = overlay_ports::PeerRecord {
            peer_id,
            machine_id,
            user_id,
            overlay_ip,
            prefix,
            public_key,
            hostname,
            last_login_unix: now,
            last_auth_unix: now,
            connected: false,
            disabled: false,
        };
        peers.push(record.clone());
        Ok(record)
    }

    async fn update(&self, peer: overlay_ports::PeerRecord) -> Result<(), OverlayError> {
        let mut peers = self.peers.write();
        match peers.iter_mut().find(|p| p.peer_id == peer.peer_id) {
            Some(slot) => {
                *slot = peer;
                Ok(())
            }
            None => Err(OverlayError::not_found(format!("no peer with id {}", peer.peer_id))),
        }
    }

    async fn set_connected(&self, id: PeerId, connected: bool) -> Result<(), OverlayError> {
        let mut peers = self.peers.write();
        match peers.iter_mut().find(|p| p.peer_id == id) {
            Some(slot) => {
                slot.connected = connected;
                Ok(())
            }
            None => Err(OverlayError::not_found(format!("no peer with id {id}"))),
        }
    }

    async fn touch_auth(&self, id: PeerId, now_unix: i64) -> Result<(), OverlayError> {
        let mut peers = self.peers.write();
        match peers.iter_mut().find(|p| p.peer_id == id) {
            Some(slot) => {
                slot.last_auth_unix = now_unix;
                Ok(())
            }
            None => Err(OverlayError::not_found(format!("no peer with id {id}"))),
        }
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefix() -> OverlayPrefix {
        OverlayPrefix::new(Ipv4Addr::new(100, 70, 0, 0), 24).unwrap()
    }

    #[tokio::test]
    async fn create_then_lookup_by_machine_id() {
        let store = InMemoryPeerStore::new();
        let machine_id = MachineId::parse("node_one_two_three").unwrap();
        let created = store
            .create(machine_id.clone(), "user-1".into(), PublicKey::from_bytes([1u8; 32]), "h".into(), prefix())
            .await
            .unwrap();

        let found = store.get_by_machine_id(&machine_id).await.unwrap().unwrap();
        assert_eq!(found.peer_id, created.peer_id);
        assert_eq!(found.overlay_ip, Ipv4Addr::new(100, 70, 0, 1));
    }

    #[tokio::test]
    async fn successive_creates_allocate_distinct_ips() {
        let store = InMemoryPeerStore::new();
        let a = store
            .create(
                MachineId::parse("node_aaaaaaaaaa").unwrap(),
                "u".into(),
                PublicKey::from_bytes([1u8; 32]),
                "h".into(),
                prefix(),
            )
            .await
            .unwrap();
        let b = store
            .create(
                MachineId::parse("node_bbbbbbbbbb").unwrap(),
                "u".into(),
                PublicKey::from_bytes([2u8; 32]),
                "h".into(),
                prefix(),
            )
            .await
            .unwrap();
        assert_ne!(a.overlay_ip, b.overlay_ip);
    }

    #[tokio::test]
    async fn create_rejects_duplicate_machine_id() {
        let store = InMemoryPeerStore::new();
        let machine_id = MachineId::parse("node_duplicated").unwrap();
        store
            .create(machine_id.clone(), "u".into(), PublicKey::from_bytes([1u8; 32]), "h".into(), prefix())
            .await
            .unwrap();

        let err = store
            .create(machine_id, "u".into(), PublicKey::from_bytes([2u8; 32]), "h".into(), prefix())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn create_rejects_duplicate_public_key() {
        let store = InMemoryPeerStore::new();
        let public_key = PublicKey::from_bytes([9u8; 32]);
        store
            .create(MachineId::parse("node_first_owner").unwrap(), "u".into(), public_key, "h".into(), prefix())
            .await
            .unwrap();

        let err = store
            .create(MachineId::parse("node_second_owner").unwrap(), "u".into(), public_key, "h".into(), prefix())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn update_unknown_peer_is_not_found() {
        let store = InMemoryPeerStore::new();
        let err = store
            .update(overlay_ports::PeerRecord {
                peer_id: PeerId::new(99),
                machine_id: MachineId::parse("node_ghostghost").unwrap(),
                user_id: "u".into(),
                overlay_ip: Ipv4Addr::new(100, 70, 0, 9),
                prefix: prefix(),
                public_key: PublicKey::from_bytes([3u8; 32]),
                hostname: "h".into(),
                last_login_unix: 0,
                last_auth_unix: 0,
                connected: false,
                disabled: false,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }
}
