//! Ties the leaf pieces together into the running node half of §2:
//! the tun read loop that demultiplexes outbound packets by
//! destination overlay IP, and the signaling-stream reconciliation
//! loop that keeps the [`PeerTable`] in sync with `INIT`/`CONNECT`/
//! `DISCONNECT`/`ICE` updates from the controller.

use std::net::Ipv4Addr;
use std::sync::Arc;

use overlay_bufferpool::BufferPool;
use overlay_model::PeerId;
use overlay_ports::Tun;
use overlay_protocol::UpdateResponse;
use overlay_signaling_client::{ClientEvent, ControllerClient};
use overlay_wire::{PacketBuffer, MTU};

use crate::peer::{spawn_initiator, PeerContext};
use crate::peer_table::PeerTable;

/// Runs until the tun device or the controller stream closes, or the
/// given cancellation future resolves.
pub struct NodeTunnel {
    ctx: PeerContext,
    table: Arc<PeerTable>,
}

impl NodeTunnel {
    pub fn new(ctx: PeerContext) -> Self {
        Self {
            ctx,
            table: Arc::new(PeerTable::new()),
        }
    }

    pub fn peer_table(&self) -> Arc<PeerTable> {
        Arc::clone(&self.table)
    }

    /// Drains the tun device, routing every packet to the peer owning
    /// its destination overlay IP. A packet to an unknown destination
    /// is dropped (§2 data flow: `PeerTable(ip)` is the outbound demux
    /// and has no fallback route).
    pub async fn run_tun_reader(&self) {
        let mut buf = vec![0u8; MTU];
        loop {
            let n = match self.ctx.tun.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(error = %e, "tun read failed, stopping outbound pump");
                    return;
                }
            };
            if n == 0 {
                continue;
            }

            let Some(dest) = parse_ipv4_destination(&buf[..n]) else {
                continue;
            };

            let Some(peer) = self.table.by_overlay_ip(dest) else {
                tracing::trace!(%dest, "dropping packet with no known peer for destination");
                continue;
            };

            if peer.send_outbound(bytes::Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                tracing::debug!(%dest, "peer task gone, dropping outbound packet");
            }
        }
    }

    /// Consumes signaling-stream events until the client closes,
    /// reconciling the `PeerTable` per §4.7/§4.8 and §8 property 9:
    /// `INIT` creates missing peers and leaves existing ones in place,
    /// `CONNECT`/`DISCONNECT` add/remove single entries, `LOGOUT`
    /// tears every peer down, and `ICE` updates route to the
    /// addressed peer's task.
    pub async fn run_signaling_reconciler(&self, controller: Arc<ControllerClient>) {
        while let Some(event) = controller.recv().await {
            match event {
                ClientEvent::Update(UpdateResponse::Init { peers }) => {
                    for summary in peers {
                        if self.table.contains(summary.peer_id) {
                            continue;
                        }
                        self.spawn_and_insert_initiator(
                            summary.peer_id,
                            summary.public_key,
                            summary.overlay_ip,
                            summary.hostname,
                        );
                    }
                }
                ClientEvent::Update(UpdateResponse::Connect { peer }) => {
                    if !self.table.contains(peer.peer_id) {
                        self.spawn_and_insert_initiator(
                            peer.peer_id,
                            peer.public_key,
                            peer.overlay_ip,
                            peer.hostname,
                        );
                    }
                }
                ClientEvent::Update(UpdateResponse::Disconnect { peer_id }) => {
                    // Removing the table's own `Arc` drops the peer's
                    // command channels once every transient demux
                    // lookup elsewhere has also let go, which is what
                    // actually stops the peer task; there is nothing
                    // further to await here.
                    self.table.remove(peer_id);
                }
                ClientEvent::Update(UpdateResponse::Ice(update)) => {
                    if let Some(peer) = self.table.by_id(update.peer_id()) {
                        peer.deliver_ice_update(update);
                    } else if let IceOfferLike::Offer { peer_id, .. } = classify(&update) {
                        // An OFFER for a peer id we don't have yet is
                        // the other side of glare before our own INIT
                        // has been processed; spin up a responder once
                        // we at least know the offerer's id. We don't
                        // have its public key/hostname from an ICE
                        // message alone, so this only helps once INIT
                        // or CONNECT has already populated the entry;
                        // otherwise the offer is dropped and the
                        // remote's 10s retransmit will retry it.
                        tracing::debug!(%peer_id, "dropping ice update for unknown peer");
                    }
                }
                ClientEvent::Update(UpdateResponse::Logout) | ClientEvent::LoggedOut => {
                    tracing::info!("controller logged this node out, tearing down all peers");
                    for peer in self.table.all() {
                        self.table.remove(peer.peer_id());
                    }
                    return;
                }
                ClientEvent::Reconnecting => {
                    tracing::info!("signaling stream lost, reconnecting");
                }
                ClientEvent::Reconnected => {
                    tracing::info!("signaling stream re-established, awaiting fresh INIT");
                }
            }
        }
    }

    fn spawn_and_insert_initiator(
        &self,
        peer_id: PeerId,
        public_key: overlay_model::PublicKey,
        overlay_ip: Ipv4Addr,
        hostname: String,
    ) {
        let handle = spawn_initiator(self.ctx.clone(), peer_id, public_key, overlay_ip, hostname);
        self.table.insert(Arc::new(handle));
    }
}

enum IceOfferLike {
    Offer { peer_id: PeerId },
    Other,
}

fn classify(update: &overlay_protocol::IceUpdate) -> IceOfferLike {
    match update {
        overlay_protocol::IceUpdate::Offer { peer_id, .. } => IceOfferLike::Offer { peer_id: *peer_id },
        _ => IceOfferLike::Other,
    }
}

/// Reads the destination address out of an IPv4 header; returns
/// `None` for anything that isn't a plain IPv4 packet (IPv6 and
/// anything shorter than a minimal header are out of scope for this
/// overlay).
fn parse_ipv4_destination(packet: &[u8]) -> Option<Ipv4Addr> {
    if packet.len() < 20 {
        return None;
    }
    if packet[0] >> 4 != 4 {
        return None;
    }
    Some(Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]))
}

pub fn make_inbound_pool(pool_size: usize) -> Arc<BufferPool<PacketBuffer>> {
    BufferPool::new(pool_size, "inbound", PacketBuffer::new)
}

pub fn make_outbound_pool(pool_size: usize) -> Arc<BufferPool<PacketBuffer>> {
    BufferPool::new(pool_size, "outbound", PacketBuffer::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ipv4_destination() {
        let mut packet = vec![0u8; 20];
        packet[0] = 0x45; // version 4, IHL 5
        packet[16..20].copy_from_slice(&[100, 70, 0, 9]);
        assert_eq!(parse_ipv4_destination(&packet), Some(Ipv4Addr::new(100, 70, 0, 9)));
    }

    #[test]
    fn rejects_non_ipv4_and_short_packets() {
        assert_eq!(parse_ipv4_destination(&[0u8; 4]), None);
        let mut v6ish = vec![0u8; 20];
        v6ish[0] = 0x60;
        assert_eq!(parse_ipv4_destination(&v6ish), None);
    }
}
