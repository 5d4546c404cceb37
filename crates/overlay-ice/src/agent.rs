use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use str0m::ice::{IceAgent as Str0mAgent, IceAgentEvent, IceConnectionState, IceCreds};
use str0m::net::Protocol;
use str0m::Candidate;
use tokio::net::UdpSocket;
use tokio::time::sleep;

use crate::stun::stun_binding_request;

/// The state changes a caller needs to react to; the much larger set
/// str0m itself tracks internally collapses onto these five outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceEvent {
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum IceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ice agent reported connection failure")]
    Failed,
    #[error("ice dial/accept timed out")]
    TimedOut,
    #[error("candidate string was malformed: {0}")]
    BadCandidate(String),
}

/// An established duplex UDP path produced by a successful
/// [`IceAgent::dial`]/[`IceAgent::accept`].
pub struct IceConn {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
}

impl IceConn {
    pub async fn send(&self, buf: &[u8]) -> Result<(), IceError> {
        self.socket.send_to(buf, self.remote).await?;
        Ok(())
    }

    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize, IceError> {
        loop {
            let (n, from) = self.socket.recv_from(buf).await?;
            if from == self.remote {
                return Ok(n);
            }
            tracing::trace!(%from, expected = %self.remote, "dropping packet from unexpected source on established ice path");
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }
}

/// Wraps a [`str0m`] ICE agent behind the small duplex-conn contract
/// the peer state machine needs: gather, exchange credentials and
/// candidates out of band (over the signaling channel), then dial or
/// accept to get a connected path.
pub struct IceAgent {
    inner: Str0mAgent,
    socket: Arc<UdpSocket>,
}

impl IceAgent {
    pub fn new(socket: Arc<UdpSocket>, controlling: bool) -> Self {
        let mut inner = Str0mAgent::new();
        inner.set_controlling(controlling);
        Self { inner, socket }
    }

    pub fn local_credentials(&self) -> (String, String) {
        let creds = self.inner.local_credentials();
        (creds.ufrag.clone(), creds.pass.clone())
    }

    pub fn set_remote_credentials(&mut self, ufrag: String, pass: String) {
        self.inner.set_remote_credentials(IceCreds { ufrag, pass });
    }

    pub fn add_remote_candidate(&mut self, sdp: &str) -> Result<(), IceError> {
        let candidate =
            Candidate::from_sdp_string(sdp).map_err(|e| IceError::BadCandidate(e.to_string()))?;
        self.inner.add_remote_candidate(candidate);
        Ok(())
    }

    /// Adds the socket's own local address as a host candidate and
    /// queries every configured STUN server for a reflexive one,
    /// returning the SDP-encoded candidate strings the caller must
    /// forward to the controller for relaying to the peer.
    pub async fn gather_candidates(
        &mut self,
        stun_servers: &[SocketAddr],
    ) -> Result<Vec<String>, IceError> {
        let local_addr = self.socket.local_addr()?;
        let host = Candidate::host(local_addr, Protocol::Udp)
            .map_err(|e| IceError::BadCandidate(e.to_string()))?;
        let mut discovered = vec![host.to_sdp_string()];
        self.inner.add_local_candidate(host);

        for stun_server in stun_servers {
            match stun_binding_request(&self.socket, *stun_server, Duration::from_secs(3)).await {
                Ok(mapped) => {
                    match Candidate::server_reflexive(mapped, local_addr, Protocol::Udp) {
                        Ok(candidate) => {
                            discovered.push(candidate.to_sdp_string());
                            self.inner.add_local_candidate(candidate);
                        }
                        Err(e) => tracing::debug!(error = %e, "discarding malformed reflexive candidate"),
                    }
                }
                Err(e) => tracing::debug!(
                    %stun_server,
                    error = %e,
                    "stun binding request failed, continuing with remaining servers"
                ),
            }
        }

        Ok(discovered)
    }

    async fn drive_until_connected(&mut self, dial_timeout: Duration) -> Result<SocketAddr, IceError> {
        let deadline = tokio::time::Instant::now() + dial_timeout;
        let mut recv_buf = [0u8; 1500];

        loop {
            while let Some(event) = self.inner.poll_event() {
                match event {
                    IceAgentEvent::IceConnectionStateChange(
                        IceConnectionState::Connected | IceConnectionState::Completed,
                    ) => {
                        if let Some(pair) = self.inner.selected_pair() {
                            return Ok(pair.remote_addr());
                        }
                    }
                    IceAgentEvent::IceConnectionStateChange(IceConnectionState::Failed) => {
                        return Err(IceError::Failed);
                    }
                    _ => {}
                }
            }

            if let Some(transmit) = self.inner.poll_transmit() {
                self.socket
                    .send_to(&transmit.contents, transmit.destination)
                    .await?;
                continue;
            }

            let next_timeout = self.inner.poll_timeout().unwrap_or_else(Instant::now);
            let sleep_for = next_timeout.saturating_duration_since(Instant::now());

            tokio::select! {
                _ = sleep(sleep_for) => {
                    self.inner.handle_timeout(Instant::now());
                }
                recv = self.socket.recv_from(&mut recv_buf) => {
                    let (n, from) = recv?;
                    self.inner.handle_packet(Instant::now(), from, &recv_buf[..n]);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(IceError::TimedOut);
                }
            }
        }
    }

    /// Initiator-side: drives the agent until connected, using
    /// credentials received via the ANSWER.
    pub async fn dial(
        &mut self,
        remote_ufrag: String,
        remote_pass: String,
        dial_timeout: Duration,
    ) -> Result<IceConn, IceError> {
        self.set_remote_credentials(remote_ufrag, remote_pass);
        let remote = self.drive_until_connected(dial_timeout).await?;
        Ok(IceConn {
            socket: Arc::clone(&self.socket),
            remote,
        })
    }

    /// Responder-side: identical driving loop: ICE itself doesn't
    /// distinguish "dial" from "accept" once both sides hold
    /// credentials, so this is the same state machine running with
    /// `controlling = false`.
    pub async fn accept(
        &mut self,
        remote_ufrag: String,
        remote_pass: String,
        accept_timeout: Duration,
    ) -> Result<IceConn, IceError> {
        self.dial(remote_ufrag, remote_pass, accept_timeout).await
    }

    /// Idempotent: a second call is a no-op since dropping the agent
    /// already releases everything it owns.
    pub fn close(&mut self) {}
}
