use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures_util::{SinkExt, StreamExt};
use overlay_model::OverlayConfig;
use overlay_protocol::{LoginPeerRequest, LoginPeerResponse, UpdateRequest, UpdateResponse};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::frame::{ClientFrame, ServerFrame};

/// Outbound channel capacity: a full channel is the backpressure
/// signal propagated back to whichever peer is trying to submit an
/// ICE message (§4.7).
const OUTBOUND_CHANNEL_CAPACITY: usize = 5;
const EVENTS_CHANNEL_CAPACITY: usize = 64;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error("could not connect to controller: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("controller rejected login: {0}")]
    LoginRejected(String),
    #[error("controller requires a fresh access token before it will log this node in")]
    AuthenticationRequired(Vec<String>),
    #[error("controller sent a frame that did not parse as the expected protocol message")]
    Protocol(#[from] serde_json::Error),
    #[error("signaling stream closed before completing the join")]
    ClosedDuringJoin,
}

/// Events delivered to the node from the background reconnect loop.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Update(UpdateResponse),
    /// The stream dropped and a reconnect attempt is in progress.
    Reconnecting,
    /// A dropped stream has been re-established and re-joined; the
    /// controller will follow this with a fresh `Init`.
    Reconnected,
    /// The controller asked this node to log out; the caller should
    /// tear down its peers and stop driving the tunnel.
    LoggedOut,
}

pub struct ControllerClient {
    outbound_tx: mpsc::Sender<UpdateRequest>,
    // A mutex rather than `&mut self` on `recv`, so a single
    // `Arc<ControllerClient>` can be shared between the node's
    // reconciler loop (which drains events) and every `Peer` task
    // (which only ever calls `submit`).
    events_rx: tokio::sync::Mutex<mpsc::Receiver<ClientEvent>>,
    task: tokio::task::JoinHandle<()>,
}

impl ControllerClient {
    /// Enqueues an update to send to the controller. Blocks if the
    /// outbound channel is full — this is the intended backpressure
    /// path, not an error condition.
    pub async fn submit(&self, request: UpdateRequest) -> Result<(), SignalingError> {
        self.outbound_tx
            .send(request)
            .await
            .map_err(|_| SignalingError::ClosedDuringJoin)
    }

    /// Only one caller should actually drain this at a time (the
    /// node's reconciler loop); concurrent callers would each get a
    /// disjoint subset of events rather than an error, since the lock
    /// only serializes access to the same underlying channel.
    pub async fn recv(&self) -> Option<ClientEvent> {
        self.events_rx.lock().await.recv().await
    }

    /// Tears the stream down: drops the outbound sender (the
    /// background task observes this and exits without reconnecting)
    /// and aborts the task so a slow shutdown doesn't linger.
    pub async fn close(self) {
        drop(self.outbound_tx);
        let _ = self.task.await;
    }

    /// A client with no background task and an already-closed
    /// outbound channel, so every `submit` fails immediately. Used by
    /// peer-state-machine tests in other crates that need a
    /// `ControllerClient` to construct a `PeerContext` but never
    /// intend to actually reach a controller.
    pub fn stub_closed() -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(1);
        let (_events_tx, events_rx) = mpsc::channel(1);
        drop(outbound_rx);
        Self {
            outbound_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
            task: tokio::spawn(async {}),
        }
    }
}

/// Connects once (so login failures surface immediately), then
/// spawns the long-lived reconnect loop.
pub async fn connect(
    url: Url,
    login: LoginPeerRequest,
    make_backoff: impl Fn() -> ExponentialBackoff + Send + Sync + 'static,
) -> Result<(ControllerClient, OverlayConfig), SignalingError> {
    let (mut ws, config) = connect_and_join(&url, &login).await?;

    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
    let (events_tx, events_rx) = mpsc::channel(EVENTS_CHANNEL_CAPACITY);

    let task = tokio::spawn(async move {
        run(&mut ws, url, login, outbound_rx, events_tx, make_backoff).await;
    });

    Ok((
        ControllerClient {
            outbound_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
            task,
        },
        config,
    ))
}

async fn connect_and_join(
    url: &Url,
    login: &LoginPeerRequest,
) -> Result<(WsStream, OverlayConfig), SignalingError> {
    let (mut ws, _response) = tokio_tungstenite::connect_async(url.as_str()).await?;

    send_frame(&mut ws, &ClientFrame::Join {
        login: login.clone(),
    })
    .await?;

    loop {
        let Some(msg) = ws.next().await else {
            return Err(SignalingError::ClosedDuringJoin);
        };
        let Message::Text(text) = msg? else {
            continue;
        };
        match serde_json::from_str::<ServerFrame>(&text)? {
            ServerFrame::JoinAck { response } => {
                return match response {
                    LoginPeerResponse::Ok { config } => Ok((ws, config)),
                    LoginPeerResponse::AuthenticationRequired { oidc_endpoints } => {
                        Err(SignalingError::AuthenticationRequired(oidc_endpoints))
                    }
                };
            }
            ServerFrame::Error { reason } => return Err(SignalingError::LoginRejected(reason)),
            ServerFrame::HeartbeatAck | ServerFrame::Update { .. } => continue,
        }
    }
}

async fn send_frame(ws: &mut WsStream, frame: &ClientFrame) -> Result<(), SignalingError> {
    let text = serde_json::to_string(frame)?;
    ws.send(Message::Text(text.into())).await?;
    Ok(())
}

async fn run(
    ws: &mut WsStream,
    url: Url,
    login: LoginPeerRequest,
    mut outbound_rx: mpsc::Receiver<UpdateRequest>,
    events_tx: mpsc::Sender<ClientEvent>,
    make_backoff: impl Fn() -> ExponentialBackoff,
) {
    let mut backoff = make_backoff();
    let mut first_pass = true;

    'reconnect: loop {
        if !first_pass {
            let _ = events_tx.send(ClientEvent::Reconnecting).await;

            match connect_and_join(&url, &login).await {
                Ok((fresh, _config)) => {
                    *ws = fresh;
                    backoff.reset();
                    let _ = events_tx.send(ClientEvent::Reconnected).await;
                }
                Err(e) => {
                    let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(60));
                    tracing::warn!(error = %e, delay_secs = delay.as_secs(), "reconnect to controller failed, backing off");
                    tokio::time::sleep(delay).await;
                    continue 'reconnect;
                }
            }
        }
        first_pass = false;

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if send_frame(ws, &ClientFrame::Heartbeat).await.is_err() {
                        continue 'reconnect;
                    }
                }
                outbound = outbound_rx.recv() => {
                    match outbound {
                        Some(request) => {
                            if send_frame(ws, &ClientFrame::Update { request }).await.is_err() {
                                continue 'reconnect;
                            }
                        }
                        None => return, // caller closed the client; shut down cleanly
                    }
                }
                incoming = ws.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<ServerFrame>(&text) {
                                Ok(ServerFrame::Update { response }) => {
                                    let is_logout = matches!(response, UpdateResponse::Logout);
                                    let event = if is_logout {
                                        ClientEvent::LoggedOut
                                    } else {
                                        ClientEvent::Update(response)
                                    };
                                    if events_tx.send(event).await.is_err() {
                                        return; // caller dropped the receiver
                                    }
                                }
                                Ok(ServerFrame::Error { reason }) => {
                                    tracing::warn!(%reason, "controller reported an error on the signaling stream");
                                }
                                Ok(ServerFrame::HeartbeatAck | ServerFrame::JoinAck { .. }) => {}
                                Err(e) => {
                                    tracing::warn!(error = %e, "failed to parse server frame, ignoring");
                                }
                            }
                        }
                        Some(Ok(_non_text)) => {}
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "signaling stream error, reconnecting");
                            continue 'reconnect;
                        }
                        None => {
                            tracing::info!("signaling stream closed by controller, reconnecting");
                            continue 'reconnect;
                        }
                    }
                }
            }
        }
    }
}
