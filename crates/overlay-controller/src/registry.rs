//! §4.8: the controller's per-peer signaling fan-out. Each attached
//! peer gets a channel of [`UpdateResponse`]; `broadcast` and
//! `sendTo` push onto those channels, and a full/blocked receiver
//! back-pressures the sender rather than affecting anyone else's
//! delivery — the documented head-of-line-blocking tradeoff from the
//! spec's Open Questions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use overlay_model::PeerId;
use overlay_protocol::UpdateResponse;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::mpsc;

/// Forced-logout grace period: how long the broker waits after
/// pushing `LOGOUT` before tearing the channel down, so the message
/// has a chance to actually reach the stream.
const FORCED_LOGOUT_GRACE: Duration = Duration::from_secs(10);

/// The channel capacity backing each attached peer. Tokio has no true
/// zero-capacity `mpsc`; a capacity of one is the closest rendezvous
/// approximation to the spec's "unbuffered channel" and still yields
/// the documented behavior: a second send blocks until the first is
/// received.
const PER_PEER_CHANNEL_CAPACITY: usize = 1;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("peer {0} already has an attached update channel")]
    AlreadyAttached(PeerId),
}

/// `peerId -> update sink`, created when a peer attaches its
/// signaling stream and destroyed on disconnect (§2 PeerRegistry).
#[derive(Clone, Default)]
pub struct UpdateBroker {
    channels: Arc<SyncMutex<HashMap<PeerId, mpsc::Sender<UpdateResponse>>>>,
}

impl UpdateBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the channel for `peer_id`. Fails if one is already
    /// attached, mirroring the contract's "fails if one already
    /// exists" rather than silently replacing it (a silent replace
    /// would orphan whichever task was reading the old receiver).
    pub fn attach(&self, peer_id: PeerId) -> Result<mpsc::Receiver<UpdateResponse>, BrokerError> {
        let (tx, rx) = mpsc::channel(PER_PEER_CHANNEL_CAPACITY);
        let mut channels = self.channels.lock();
        if channels.contains_key(&peer_id) {
            return Err(BrokerError::AlreadyAttached(peer_id));
        }
        channels.insert(peer_id, tx);
        Ok(rx)
    }

    pub fn detach(&self, peer_id: PeerId) {
        self.channels.lock().remove(&peer_id);
    }

    /// Sends `msg` to every attached peer other than `except_id`.
    /// Sends happen sequentially and a blocked receiver delays the
    /// remaining recipients in this call, but never drops the
    /// channel: the contract is throttling, not loss.
    pub async fn broadcast(&self, except_id: PeerId, msg: UpdateResponse) {
        let targets: Vec<_> = {
            let channels = self.channels.lock();
            channels
                .iter()
                .filter(|(id, _)| **id != except_id)
                .map(|(id, tx)| (*id, tx.clone()))
                .collect()
        };

        for (peer_id, tx) in targets {
            if tx.send(msg.clone()).await.is_err() {
                tracing::debug!(%peer_id, "broadcast target's channel closed, dropping");
            }
        }
    }

    /// Targeted send; dropped (not an error) if no channel is
    /// attached for `peer_id` — the peer may simply not be connected.
    pub async fn send_to(&self, peer_id: PeerId, msg: UpdateResponse) {
        let tx = self.channels.lock().get(&peer_id).cloned();
        match tx {
            Some(tx) => {
                if tx.send(msg).await.is_err() {
                    tracing::debug!(%peer_id, "send_to target's channel closed, dropping");
                }
            }
            None => tracing::debug!(%peer_id, "send_to target has no attached channel, dropping"),
        }
    }

    /// Forced-logout policy (§4.8): push `LOGOUT`, then give it
    /// [`FORCED_LOGOUT_GRACE`] to actually reach the stream before
    /// detaching. Runs to completion independently of the caller so
    /// an admin-initiated logout doesn't block on it.
    pub fn force_logout(&self, peer_id: PeerId) {
        let broker = self.clone();
        tokio::spawn(async move {
            broker.send_to(peer_id, UpdateResponse::Logout).await;
            tokio::time::sleep(FORCED_LOGOUT_GRACE).await;
            broker.detach(peer_id);
        });
    }

    pub fn close_all(&self) {
        self.channels.lock().clear();
    }

    pub fn is_attached(&self, peer_id: PeerId) -> bool {
        self.channels.lock().contains_key(&peer_id)
    }

    pub fn attached_count(&self) -> usize {
        self.channels.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use overlay_protocol::PeerSummary;
    use std::net::Ipv4Addr;

    fn summary(id: u32) -> PeerSummary {
        PeerSummary {
            peer_id: PeerId::new(id),
            overlay_ip: Ipv4Addr::new(100, 70, 0, id as u8),
            public_key: overlay_model::PublicKey::from_bytes([id as u8; 32]),
            hostname: format!("node-{id}"),
        }
    }

    #[tokio::test]
    async fn attach_twice_for_same_peer_fails() {
        let broker = UpdateBroker::new();
        let _rx = broker.attach(PeerId::new(1)).unwrap();
        assert!(matches!(
            broker.attach(PeerId::new(1)),
            Err(BrokerError::AlreadyAttached(_))
        ));
    }

    #[tokio::test]
    async fn broadcast_skips_the_excepted_peer() {
        let broker = UpdateBroker::new();
        let mut rx1 = broker.attach(PeerId::new(1)).unwrap();
        let mut rx2 = broker.attach(PeerId::new(2)).unwrap();

        broker
            .broadcast(PeerId::new(1), UpdateResponse::Connect { peer: summary(9) })
            .await;

        assert!(rx2.recv().await.is_some());
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_to_unattached_peer_is_a_silent_drop() {
        let broker = UpdateBroker::new();
        broker.send_to(PeerId::new(42), UpdateResponse::Logout).await;
    }

    #[tokio::test]
    async fn detach_removes_the_channel() {
        let broker = UpdateBroker::new();
        let _rx = broker.attach(PeerId::new(1)).unwrap();
        assert!(broker.is_attached(PeerId::new(1)));
        broker.detach(PeerId::new(1));
        assert!(!broker.is_attached(PeerId::new(1)));
    }
}
