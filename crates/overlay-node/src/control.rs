//! The local RPC surface's actual state machine (§4.12): `Login`,
//! `Up`, `Down`, `Status`, `Logout`, realized over the IPC transport
//! in [`crate::ipc`] instead of the literal loopback gRPC service
//! this system's notes once called for — see the design ledger for
//! why. One [`NodeControl`] instance owns the node's entire runtime
//! state for the lifetime of the process; `ipc::IpcServer` hands each
//! accepted connection the same shared handle.

use std::sync::Arc;

use overlay_model::OverlayConfig;
use overlay_ports::Tun;
use overlay_protocol::LoginPeerRequest;
use overlay_signaling_client::{connect, ControllerClient};
use overlay_tunnel::{make_inbound_pool, make_outbound_pool, NodeTunnel, PeerContext};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::config::NodeConfig;
use crate::identity::NodeIdentity;
use crate::protocol::{ControlRequest, ControlResponse, NodeStatus, PeerStatus, SessionState};

const PACKET_POOL_SIZE: usize = 256;

enum State {
    LoggedOut,
    LoggedIn {
        controller: Arc<ControllerClient>,
        overlay_config: OverlayConfig,
    },
    Running {
        controller: Arc<ControllerClient>,
        overlay_config: OverlayConfig,
        tunnel: Arc<NodeTunnel>,
        tun: Arc<dyn Tun>,
        tasks: Vec<JoinHandle<()>>,
    },
}

pub struct NodeControl {
    config: NodeConfig,
    identity: NodeIdentity,
    make_tun: Box<dyn Fn() -> Result<Arc<dyn Tun>, overlay_model::OverlayError> + Send + Sync>,
    state: Mutex<State>,
}

impl NodeControl {
    pub fn new(
        config: NodeConfig,
        identity: NodeIdentity,
        make_tun: impl Fn() -> Result<Arc<dyn Tun>, overlay_model::OverlayError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            config,
            identity,
            make_tun: Box::new(make_tun),
            state: Mutex::new(State::LoggedOut),
        }
    }

    pub async fn dispatch(&self, request: ControlRequest) -> ControlResponse {
        let result = match request {
            ControlRequest::Login { access_token } => self.login(access_token).await,
            ControlRequest::Up => self.up().await,
            ControlRequest::Down => self.down().await,
            ControlRequest::Status => Ok(self.status()),
            ControlRequest::Logout => self.logout().await,
        };

        match result {
            Ok(response) => response,
            Err(error) => ControlResponse::Error {
                kind: error.kind.to_string(),
                message: error.message,
            },
        }
    }

    async fn login(&self, access_token: Option<String>) -> Result<ControlResponse, overlay_model::OverlayError> {
        if !matches!(*self.state.lock(), State::LoggedOut) {
            return Ok(ControlResponse::LoginOk);
        }

        let login_request = LoginPeerRequest {
            machine_id: self.identity.machine_id.clone(),
            public_key: self.identity.public_key,
            hostname: hostname(),
            endpoint: None,
            access_token,
        };

        let make_backoff = || backoff::ExponentialBackoff::default();
        match connect(self.config.controller_url.clone(), login_request, make_backoff).await {
            Ok((controller, overlay_config)) => {
                *self.state.lock() = State::LoggedIn {
                    controller: Arc::new(controller),
                    overlay_config,
                };
                Ok(ControlResponse::LoginOk)
            }
            Err(overlay_signaling_client::SignalingError::AuthenticationRequired(oidc_endpoints)) => {
                Ok(ControlResponse::LoginRequiresAuthentication { oidc_endpoints })
            }
            Err(e) => Err(overlay_model::OverlayError::new(
                overlay_model::ErrorKind::Transient,
                e.to_string(),
            )),
        }
    }

    async fn up(&self) -> Result<ControlResponse, overlay_model::OverlayError> {
        let (controller, overlay_config) = {
            let state = self.state.lock();
            match &*state {
                State::LoggedOut => {
                    return Err(overlay_model::OverlayError::unauthenticated(
                        "log in before bringing the tunnel up",
                    ));
                }
                State::Running { .. } => return Ok(ControlResponse::Up),
                State::LoggedIn { controller, overlay_config } => (Arc::clone(controller), overlay_config.clone()),
            }
        };

        let tun = (self.make_tun)()?;
        tun.configure_ip(overlay_config.tunnel_ip, overlay_config.prefix).await?;

        let ctx = PeerContext {
            local_peer_id: overlay_config.peer_id,
            local_static_key: self.identity.private_key,
            controller: Arc::clone(&controller),
            tun: Arc::clone(&tun),
            inbound_pool: make_inbound_pool(PACKET_POOL_SIZE),
            outbound_pool: make_outbound_pool(PACKET_POOL_SIZE),
            stun_servers: Arc::new(self.config.stun_servers.clone()),
        };
        let tunnel = Arc::new(NodeTunnel::new(ctx));

        let reader_tunnel = Arc::clone(&tunnel);
        let reader_task = tokio::spawn(async move {
            reader_tunnel.run_tun_reader().await;
        });

        let reconciler_tunnel = Arc::clone(&tunnel);
        let reconciler_controller = Arc::clone(&controller);
        let reconciler_task = tokio::spawn(async move {
            reconciler_tunnel.run_signaling_reconciler(reconciler_controller).await;
        });

        *self.state.lock() = State::Running {
            controller,
            overlay_config,
            tunnel,
            tun,
            tasks: vec![reader_task, reconciler_task],
        };

        Ok(ControlResponse::Up)
    }

    /// Reverses [`Self::up`], idempotently: calling it twice, or
    /// before ever calling `up`, just returns `Down` without error.
    async fn down(&self) -> Result<ControlResponse, overlay_model::OverlayError> {
        let previous = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, State::LoggedOut) {
                State::Running {
                    controller,
                    overlay_config,
                    tunnel,
                    tun,
                    tasks,
                } => {
                    *state = State::LoggedIn {
                        controller: Arc::clone(&controller),
                        overlay_config,
                    };
                    Some((tunnel, tun, tasks))
                }
                other => {
                    *state = other;
                    None
                }
            }
        };

        if let Some((tunnel, tun, tasks)) = previous {
            for task in tasks {
                task.abort();
            }
            // Dropping each peer's `Arc<PeerHandle>` out of the table
            // lets its task's command channels close once every other
            // clone (outstanding demux lookups) has let go, which is
            // what actually unwinds the ICE conn and Noise session.
            for peer_id in tunnel.peer_table().peer_ids() {
                tunnel.peer_table().remove(peer_id);
            }
            tun.close().await?;
        }

        Ok(ControlResponse::Down)
    }

    async fn logout(&self) -> Result<ControlResponse, overlay_model::OverlayError> {
        self.down().await.ok();
        let previous = std::mem::replace(&mut *self.state.lock(), State::LoggedOut);
        if let State::LoggedIn { controller, .. } = previous {
            if let Ok(controller) = Arc::try_unwrap(controller) {
                controller.close().await;
            }
        }
        Ok(ControlResponse::LoggedOut)
    }

    fn status(&self) -> ControlResponse {
        let state = self.state.lock();
        let (session, tunnel_running, peers) = match &*state {
            State::LoggedOut => (SessionState::LoggedOut, false, Vec::new()),
            State::LoggedIn { .. } => (SessionState::LoggedIn, false, Vec::new()),
            State::Running { tunnel, .. } => {
                let peers = tunnel
                    .peer_table()
                    .all()
                    .iter()
                    .map(|peer| PeerStatus {
                        peer_id: peer.peer_id(),
                        hostname: peer.hostname().to_string(),
                        phase: peer.phase().to_string(),
                    })
                    .collect();
                (SessionState::LoggedIn, true, peers)
            }
        };

        ControlResponse::Status(NodeStatus {
            session,
            tunnel_running,
            peers,
        })
    }
}

fn hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}
