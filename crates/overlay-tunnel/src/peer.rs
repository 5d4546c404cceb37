//! The peer state machine (§4.5): one instance per remote peer,
//! driven entirely inside a single spawned task so the tricky parts —
//! the glare tie-break, the offer/answer retransmit timers, the
//! handshake retry budget — never need a lock shared with the table
//! that holds the `Peer`'s identity.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use overlay_bufferpool::BufferPool;
use overlay_ice::{IceAgent, IceConn, IceError};
use overlay_model::{OverlayError, PeerId, PublicKey};
use overlay_noise::{NoiseError, NoiseSession, Role as NoiseRole};
use overlay_ports::Tun;
use overlay_protocol::{IceUpdate, UpdateRequest};
use overlay_signaling_client::ControllerClient;
use overlay_wire::{FrameHeader, FrameType, PacketBuffer, HEADER_LEN};
use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tokio::time::{interval, timeout};

const OFFER_RETRANSMIT_INTERVAL: Duration = Duration::from_secs(10);
const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);
const ICE_DIAL_TIMEOUT: Duration = Duration::from_secs(30);
const HANDSHAKE_STEP_TIMEOUT: Duration = Duration::from_secs(3);
const HANDSHAKE_STEP_RETRIES: u32 = 3;
const OUTBOUND_QUEUE_CAPACITY: usize = 256;
const ICE_UPDATE_QUEUE_CAPACITY: usize = 32;

/// The six states from the peer state machine table in §4.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPhase {
    Idle,
    Initiating,
    Responding,
    Handshaking,
    Transport,
    Paused,
}

impl std::fmt::Display for PeerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PeerPhase::Idle => "idle",
            PeerPhase::Initiating => "initiating",
            PeerPhase::Responding => "responding",
            PeerPhase::Handshaking => "handshaking",
            PeerPhase::Transport => "transport",
            PeerPhase::Paused => "paused",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error(transparent)]
    Ice(#[from] IceError),
    #[error(transparent)]
    Noise(#[from] NoiseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("negotiation timed out waiting for the remote peer")]
    NegotiationTimedOut,
    #[error("handshake retry budget exhausted")]
    HandshakeExhausted,
    #[error("peer task is no longer running")]
    Gone,
}

/// Everything a `Peer` task needs that isn't specific to the one
/// remote peer it is driving: identity, shared pools, and the ports
/// to the outside world.
#[derive(Clone)]
pub struct PeerContext {
    pub local_peer_id: PeerId,
    pub local_static_key: [u8; 32],
    pub controller: Arc<ControllerClient>,
    pub tun: Arc<dyn Tun>,
    pub inbound_pool: Arc<BufferPool<PacketBuffer>>,
    pub outbound_pool: Arc<BufferPool<PacketBuffer>>,
    pub stun_servers: Arc<Vec<SocketAddr>>,
}

enum Command {
    Outbound(Bytes),
    IceUpdate(IceUpdate),
}

/// The lightweight, synchronously-readable handle a [`crate::PeerTable`]
/// entry actually stores. The heavy state (the `NoiseSession`, the ICE
/// agent/conn) lives only inside the task this handle addresses.
pub struct PeerHandle {
    peer_id: PeerId,
    overlay_ip: Ipv4Addr,
    public_key: PublicKey,
    hostname: String,
    phase: Arc<RwLock<PeerPhase>>,
    commands: mpsc::Sender<Command>,
    ice_updates: mpsc::Sender<Command>,
    task: tokio::task::JoinHandle<()>,
}

impl PeerHandle {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn overlay_ip(&self) -> Ipv4Addr {
        self.overlay_ip
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn phase(&self) -> PeerPhase {
        *self.phase.read()
    }

    /// Enqueues a plaintext packet read from the tun device. Blocks if
    /// the bounded outbound queue is full — the intended backpressure
    /// signal back to the tunnel's read loop.
    pub async fn send_outbound(&self, packet: Bytes) -> Result<(), PeerError> {
        self.commands
            .send(Command::Outbound(packet))
            .await
            .map_err(|_| PeerError::Gone)
    }

    /// Routes a signaling-stream `Ice(..)` message addressed to this
    /// peer. Best-effort: a full queue here means the peer task is
    /// falling behind its own negotiation, which is already covered by
    /// the retransmit/timeout logic, so this drops rather than blocks
    /// the caller (the node's single signaling-stream reader).
    pub fn deliver_ice_update(&self, update: IceUpdate) {
        if self.ice_updates.try_send(Command::IceUpdate(update)).is_err() {
            tracing::debug!(peer_id = %self.peer_id, "dropping ice update, peer task queue full or gone");
        }
    }

    pub async fn shutdown(self) {
        drop(self.commands);
        let _ = self.task.await;
    }
}

/// Spawns a `Peer` task in the `Initiating` state, per the initiator
/// protocol in §4.5.
pub fn spawn_initiator(
    ctx: PeerContext,
    remote_peer_id: PeerId,
    remote_public_key: PublicKey,
    overlay_ip: Ipv4Addr,
    hostname: String,
) -> PeerHandle {
    let phase = Arc::new(RwLock::new(PeerPhase::Initiating));
    let (commands_tx, commands_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
    let (ice_tx, ice_rx) = mpsc::channel(ICE_UPDATE_QUEUE_CAPACITY);

    let task_phase = Arc::clone(&phase);
    let task = tokio::spawn(async move {
        run_initiator(
            ctx,
            remote_peer_id,
            remote_public_key,
            task_phase.clone(),
            commands_rx,
            ice_rx,
        )
        .await;
        *task_phase.write() = PeerPhase::Idle;
    });

    PeerHandle {
        peer_id: remote_peer_id,
        overlay_ip,
        public_key: remote_public_key,
        hostname,
        phase,
        commands: commands_tx,
        ice_updates: ice_tx,
        task,
    }
}

/// Spawns a `Peer` task in the `Responding` state: the remote side has
/// already sent an `OFFER`, carried in `offer_ufrag`/`offer_pwd`.
pub fn spawn_responder(
    ctx: PeerContext,
    remote_peer_id: PeerId,
    remote_public_key: PublicKey,
    overlay_ip: Ipv4Addr,
    hostname: String,
    offer_ufrag: String,
    offer_pwd: String,
) -> PeerHandle {
    let phase = Arc::new(RwLock::new(PeerPhase::Responding));
    let (commands_tx, commands_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
    let (ice_tx, ice_rx) = mpsc::channel(ICE_UPDATE_QUEUE_CAPACITY);

    let task_phase = Arc::clone(&phase);
    let task = tokio::spawn(async move {
        run_responder(
            ctx,
            remote_peer_id,
            remote_public_key,
            offer_ufrag,
            offer_pwd,
            task_phase.clone(),
            commands_rx,
            ice_rx,
        )
        .await;
        *task_phase.write() = PeerPhase::Idle;
    });

    PeerHandle {
        peer_id: remote_peer_id,
        overlay_ip,
        public_key: remote_public_key,
        hostname,
        phase,
        commands: commands_tx,
        ice_updates: ice_tx,
        task,
    }
}

async fn run_initiator(
    ctx: PeerContext,
    remote_peer_id: PeerId,
    remote_public_key: PublicKey,
    phase: Arc<RwLock<PeerPhase>>,
    mut commands_rx: mpsc::Receiver<Command>,
    mut ice_rx: mpsc::Receiver<Command>,
) {
    // Step 1-2: announce local credentials and submit the OFFER.
    let socket = match UdpSocket::bind(("0.0.0.0", 0)).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            tracing::warn!(peer_id = %remote_peer_id, error = %e, "failed to bind peer socket");
            return;
        }
    };
    let mut agent = IceAgent::new(Arc::clone(&socket), true);
    let (local_ufrag, local_pwd) = agent.local_credentials();

    let offer = IceUpdate::Offer {
        peer_id: remote_peer_id,
        ufrag: local_ufrag,
        pwd: local_pwd,
    };
    if ctx
        .controller
        .submit(UpdateRequest::Ice(offer.clone()))
        .await
        .is_err()
    {
        return;
    }

    // Step 3: retransmit every 10s until ANSWER, glare included, up to
    // the overall 30s negotiation timeout.
    let mut retransmit = interval(OFFER_RETRANSMIT_INTERVAL);
    let deadline = tokio::time::Instant::now() + NEGOTIATION_TIMEOUT;
    let (remote_ufrag, remote_pwd) = loop {
        tokio::select! {
            _ = retransmit.tick() => {
                let _ = ctx.controller.submit(UpdateRequest::Ice(offer.clone())).await;
            }
            update = ice_rx.recv() => {
                match update {
                    Some(Command::IceUpdate(IceUpdate::Answer { ufrag, pwd, .. })) => break (ufrag, pwd),
                    Some(Command::IceUpdate(IceUpdate::Offer { peer_id, ufrag, pwd })) => {
                        // Glare: the remote is also initiating toward us
                        // (§4.5 tie-break). Only the numerically greater
                        // id switches to responder; the other discards
                        // the remote OFFER and stays the initiator.
                        if ctx.local_peer_id > peer_id {
                            tracing::debug!(%remote_peer_id, "switching to responder on glare tie-break");
                            *phase.write() = PeerPhase::Responding;
                            return run_responder(
                                ctx,
                                remote_peer_id,
                                remote_public_key,
                                ufrag,
                                pwd,
                                phase,
                                commands_rx,
                                ice_rx,
                            )
                            .await;
                        }
                        continue; // not numerically greater, stay the initiator
                    }
                    Some(_) | None => continue,
                }
            }
            _ = tokio::time::sleep_until(deadline) => return,
        }
    };

    // Steps 4-5: gather and forward candidates, feed remote candidates
    // in, then dial; all handled by `drive_candidates_then_dial`.
    agent.set_remote_credentials(remote_ufrag.clone(), remote_pwd.clone());

    let conn = match drive_candidates_then_dial(
        &ctx,
        &mut agent,
        remote_peer_id,
        &mut ice_rx,
        remote_ufrag,
        remote_pwd,
    )
    .await
    {
        Ok(conn) => conn,
        Err(e) => {
            tracing::warn!(%remote_peer_id, error = %e, "ice dial failed, returning peer to idle");
            return;
        }
    };

    *phase.write() = PeerPhase::Handshaking;

    let mut noise = NoiseSession::new(ctx.local_static_key, Some(*remote_public_key.as_bytes()));
    if noise.initialize(NoiseRole::Initiator).is_err() {
        return;
    }
    if run_initiator_handshake(&mut noise, &conn, ctx.local_peer_id).await.is_err() {
        return;
    }

    *phase.write() = PeerPhase::Transport;
    run_transport(ctx, remote_peer_id, conn, noise, phase, commands_rx, ice_rx).await;
}

async fn run_responder(
    ctx: PeerContext,
    remote_peer_id: PeerId,
    remote_public_key: PublicKey,
    offer_ufrag: String,
    offer_pwd: String,
    phase: Arc<RwLock<PeerPhase>>,
    commands_rx: mpsc::Receiver<Command>,
    mut ice_rx: mpsc::Receiver<Command>,
) {
    let socket = match UdpSocket::bind(("0.0.0.0", 0)).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            tracing::warn!(peer_id = %remote_peer_id, error = %e, "failed to bind peer socket");
            return;
        }
    };
    let mut agent = IceAgent::new(Arc::clone(&socket), false);
    let (local_ufrag, local_pwd) = agent.local_credentials();

    let answer = IceUpdate::Answer {
        peer_id: remote_peer_id,
        ufrag: local_ufrag,
        pwd: local_pwd,
    };
    if ctx.controller.submit(UpdateRequest::Ice(answer)).await.is_err() {
        return;
    }

    let conn = match drive_candidates_then_dial(
        &ctx,
        &mut agent,
        remote_peer_id,
        &mut ice_rx,
        offer_ufrag,
        offer_pwd,
    )
    .await
    {
        Ok(conn) => conn,
        Err(e) => {
            tracing::warn!(%remote_peer_id, error = %e, "ice accept failed, returning peer to idle");
            return;
        }
    };

    *phase.write() = PeerPhase::Handshaking;

    let mut noise = NoiseSession::new(ctx.local_static_key, Some(*remote_public_key.as_bytes()));
    if noise.initialize(NoiseRole::Responder).is_err() {
        return;
    }
    if run_responder_handshake(&mut noise, &conn, ctx.local_peer_id).await.is_err() {
        return;
    }

    *phase.write() = PeerPhase::Transport;
    run_transport(ctx, remote_peer_id, conn, noise, phase, commands_rx, ice_rx).await;
}

async fn drive_candidates_then_dial(
    ctx: &PeerContext,
    agent: &mut IceAgent,
    remote_peer_id: PeerId,
    ice_rx: &mut mpsc::Receiver<Command>,
    remote_ufrag: String,
    remote_pwd: String,
) -> Result<IceConn, PeerError> {
    let candidates = agent.gather_candidates(&ctx.stun_servers).await?;
    for candidate in candidates {
        let msg = IceUpdate::Candidate {
            peer_id: remote_peer_id,
            candidate,
        };
        let _ = ctx.controller.submit(UpdateRequest::Ice(msg)).await;
    }

    // Drain any remote candidates that arrived while we were
    // gathering our own; a real deployment would interleave this with
    // the dial loop, but ICE tolerates candidates added up front just
    // as well for the host/reflexive-only candidate set this agent
    // gathers.
    while let Ok(Command::IceUpdate(IceUpdate::Candidate { candidate, .. })) = ice_rx.try_recv() {
        if let Err(e) = agent.add_remote_candidate(&candidate) {
            tracing::debug!(%remote_peer_id, error = %e, "discarding malformed remote candidate");
        }
    }

    Ok(agent.dial(remote_ufrag, remote_pwd, ICE_DIAL_TIMEOUT).await?)
}

async fn run_initiator_handshake(
    noise: &mut NoiseSession,
    conn: &IceConn,
    local_peer_id: PeerId,
) -> Result<(), PeerError> {
    let mut out = [0u8; overlay_wire::MAX_FRAME_LEN];
    let mut in_buf = [0u8; overlay_wire::MAX_FRAME_LEN];

    let mut attempt = 0;
    loop {
        attempt += 1;
        let n = noise.write_handshake_p1(&mut out[HEADER_LEN..])?;
        FrameHeader::new(FrameType::Handshake, local_peer_id.get(), 0).encode(&mut out);
        if conn.send(&out[..HEADER_LEN + n]).await.is_err() && attempt >= HANDSHAKE_STEP_RETRIES {
            return Err(PeerError::HandshakeExhausted);
        }

        match timeout(HANDSHAKE_STEP_TIMEOUT, conn.recv(&mut in_buf)).await {
            Ok(Ok(n)) => {
                let header = FrameHeader::decode(&in_buf[..n]).map_err(|_| PeerError::HandshakeExhausted)?;
                if header.frame_type == FrameType::Handshake && header.counter == 1 {
                    noise.read_handshake_p2(&in_buf[HEADER_LEN..n])?;
                    return Ok(());
                }
            }
            _ if attempt >= HANDSHAKE_STEP_RETRIES => return Err(PeerError::HandshakeExhausted),
            _ => continue,
        }
    }
}

async fn run_responder_handshake(
    noise: &mut NoiseSession,
    conn: &IceConn,
    local_peer_id: PeerId,
) -> Result<(), PeerError> {
    let mut in_buf = [0u8; overlay_wire::MAX_FRAME_LEN];
    let mut out = [0u8; overlay_wire::MAX_FRAME_LEN];

    let mut attempt = 0;
    let first = loop {
        attempt += 1;
        match timeout(HANDSHAKE_STEP_TIMEOUT, conn.recv(&mut in_buf)).await {
            Ok(Ok(n)) => break n,
            _ if attempt >= HANDSHAKE_STEP_RETRIES => return Err(PeerError::HandshakeExhausted),
            _ => continue,
        }
    };

    let header = FrameHeader::decode(&in_buf[..first]).map_err(|_| PeerError::HandshakeExhausted)?;
    if header.frame_type != FrameType::Handshake || header.counter != 0 {
        return Err(PeerError::HandshakeExhausted);
    }
    noise.read_handshake_p1(&in_buf[HEADER_LEN..first])?;

    let n = noise.write_handshake_p2(&mut out[HEADER_LEN..])?;
    FrameHeader::new(FrameType::Handshake, local_peer_id.get(), 1).encode(&mut out);
    conn.send(&out[..HEADER_LEN + n]).await?;

    Ok(())
}

/// Drives the `Transport`/`Paused` half of the state machine: an
/// outbound loop (this task) and a spawned inbound loop share the ICE
/// connection and a mutex-guarded Noise session.
async fn run_transport(
    ctx: PeerContext,
    remote_peer_id: PeerId,
    conn: IceConn,
    noise: NoiseSession,
    phase: Arc<RwLock<PeerPhase>>,
    mut commands_rx: mpsc::Receiver<Command>,
    mut ice_rx: mpsc::Receiver<Command>,
) {
    let conn = Arc::new(conn);
    let noise = Arc::new(tokio::sync::Mutex::new(noise));
    let ready = Arc::new(Notify::new());
    let disconnected = Arc::new(AtomicBool::new(false));

    let mut inbound = tokio::spawn(run_inbound(
        Arc::clone(&conn),
        Arc::clone(&noise),
        Arc::clone(&ctx.tun),
        Arc::clone(&ctx.inbound_pool),
        Arc::clone(&disconnected),
        remote_peer_id,
    ));

    loop {
        if disconnected.load(Ordering::Acquire) {
            *phase.write() = PeerPhase::Paused;
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(2)) => {
                    // Probe liveness by attempting a zero-length send;
                    // a real failure surfaces through the inbound task
                    // instead, since it is the one actually reading.
                    if conn.send(&[]).await.is_ok() {
                        disconnected.store(false, Ordering::Release);
                        *phase.write() = PeerPhase::Transport;
                        ready.notify_waiters();
                        // The previous inbound task exited when its read
                        // failed; respawn it so inbound packets resume
                        // flowing instead of being dropped for the rest
                        // of this peer's lifetime.
                        inbound.abort();
                        inbound = tokio::spawn(run_inbound(
                            Arc::clone(&conn),
                            Arc::clone(&noise),
                            Arc::clone(&ctx.tun),
                            Arc::clone(&ctx.inbound_pool),
                            Arc::clone(&disconnected),
                            remote_peer_id,
                        ));
                    }
                }
                _ = commands_rx.recv() => {}
            }
            continue;
        }

        tokio::select! {
            command = commands_rx.recv() => {
                match command {
                    Some(Command::Outbound(packet)) => {
                        if send_data_frame(&conn, &noise, &ctx.outbound_pool, remote_peer_id, &packet)
                            .await
                            .is_err()
                        {
                            disconnected.store(true, Ordering::Release);
                        }
                    }
                    Some(Command::IceUpdate(_)) | None => {
                        if command.is_none() {
                            break;
                        }
                    }
                }
            }
            command = ice_rx.recv() => {
                if command.is_none() {
                    break;
                }
            }
        }
    }

    inbound.abort();
}

async fn send_data_frame(
    conn: &IceConn,
    noise: &tokio::sync::Mutex<NoiseSession>,
    pool: &Arc<BufferPool<PacketBuffer>>,
    local_peer_id: PeerId,
    plaintext: &Bytes,
) -> Result<(), PeerError> {
    let mut buf = pool.acquire();
    let mut session = noise.lock().await;
    let (nonce, n) = session.encrypt(plaintext, &mut buf.raw_mut()[HEADER_LEN..])?;
    drop(session);

    FrameHeader::new(FrameType::Data, local_peer_id.get(), nonce).encode(buf.raw_mut());
    buf.set_len(HEADER_LEN + n);
    conn.send(buf.raw()).await?;
    Ok(())
}

async fn run_inbound(
    conn: Arc<IceConn>,
    noise: Arc<tokio::sync::Mutex<NoiseSession>>,
    tun: Arc<dyn Tun>,
    pool: Arc<BufferPool<PacketBuffer>>,
    disconnected: Arc<AtomicBool>,
    remote_peer_id: PeerId,
) {
    loop {
        let mut buf = pool.acquire();
        let n = match conn.recv(buf.raw_mut()).await {
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(%remote_peer_id, error = %e, "ice conn read failed, marking peer disconnected");
                disconnected.store(true, Ordering::Release);
                return;
            }
        };
        if n == 0 {
            continue; // liveness probe from the outbound loop
        }

        let header = match FrameHeader::decode(&buf.raw_mut()[..n]) {
            Ok(h) => h,
            Err(e) => {
                tracing::debug!(%remote_peer_id, error = %e, "dropping frame with unparseable header");
                continue;
            }
        };
        if header.frame_type != FrameType::Data {
            continue;
        }

        let mut session = noise.lock().await;
        let mut plaintext = [0u8; overlay_wire::MAX_FRAME_LEN];
        let plen = match session.decrypt(&buf.raw()[HEADER_LEN..n], &mut plaintext, header.counter) {
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(%remote_peer_id, error = %e, "dropping frame that failed to decrypt");
                continue;
            }
        };
        drop(session);

        if let Err(e) = tun.write(&plaintext[..plen]).await {
            tracing::warn!(%remote_peer_id, error = %e, "failed to write decrypted packet to tun");
        }
    }
}
