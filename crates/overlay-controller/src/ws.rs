//! The axum side of the signaling stream: upgrades the connection,
//! drives the join handshake through [`LoginHandler`], then pumps
//! [`UpdateResponse`]s from the [`UpdateBroker`] out to the socket
//! while forwarding `ICE` updates and heartbeats the other way.
//!
//! Mirrors the join-then-stream shape `overlay-signaling-client`
//! speaks, just from the server side of the same envelope.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use overlay_model::PeerId;
use overlay_ports::PeerStore;
use overlay_protocol::{IceUpdate, LoginPeerResponse, PeerSummary, UpdateRequest, UpdateResponse};
use overlay_signaling_client::{ClientFrame, ServerFrame};

use crate::login::{LoginHandler, LoginOutcome, LoginRequest};
use crate::registry::UpdateBroker;

#[derive(Clone)]
pub struct WsState {
    pub login: Arc<LoginHandler>,
    pub broker: UpdateBroker,
    pub store: Arc<dyn PeerStore>,
    /// Advertised to a node whose login needs a fresh token (§4.9
    /// step 5/6); this controller doesn't run the OIDC flow itself.
    pub oidc_endpoints: Vec<String>,
}

pub async fn signaling_upgrade(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: WsState) {
    let (mut sink, mut stream) = socket.split();

    let peer_id = match join(&mut sink, &mut stream, &state).await {
        Ok(Some(peer_id)) => peer_id,
        Ok(None) => return, // rejected or the socket closed mid-join; already told
        Err(e) => {
            tracing::warn!(error = %e, "signaling join failed unexpectedly");
            return;
        }
    };

    let Ok(mut updates) = state.broker.attach(peer_id) else {
        tracing::warn!(%peer_id, "peer already has an attached signaling stream, refusing second connection");
        return;
    };

    if let Err(e) = send_initial_peer_list(&mut sink, &state, peer_id).await {
        tracing::warn!(%peer_id, error = %e, "failed to send initial peer list");
    }

    state
        .broker
        .broadcast(peer_id, UpdateResponse::Connect { peer: summary_for(&state, peer_id).await })
        .await;

    loop {
        tokio::select! {
            outbound = updates.recv() => {
                match outbound {
                    Some(response) => {
                        if send_frame(&mut sink, &ServerFrame::Update { response }).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(ClientFrame::Heartbeat) => {
                                let _ = send_frame(&mut sink, &ServerFrame::HeartbeatAck).await;
                            }
                            Ok(ClientFrame::Update { request: UpdateRequest::Ice(update) }) => {
                                forward_ice(&state, peer_id, update).await;
                            }
                            Ok(ClientFrame::Join { .. }) => {
                                tracing::debug!(%peer_id, "ignoring duplicate join on an already-joined stream");
                            }
                            Err(e) => {
                                tracing::warn!(%peer_id, error = %e, "failed to parse client frame");
                            }
                        }
                    }
                    Some(Ok(_non_text)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(%peer_id, error = %e, "signaling stream error");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    let _ = state.store.set_connected(peer_id, false).await;
    state.broker.detach(peer_id);
    state
        .broker
        .broadcast(peer_id, UpdateResponse::Disconnect { peer_id })
        .await;
}

/// Runs the join handshake to completion. Returns `Ok(Some(peer_id))`
/// on success, `Ok(None)` once a rejection or early close has already
/// been communicated (or is unrecoverable), and `Err` only for a
/// transport failure while trying to reply.
async fn join(
    sink: &mut (impl futures_util::Sink<Message, Error = axum::Error> + Unpin),
    stream: &mut (impl futures_util::Stream<Item = Result<Message, axum::Error>> + Unpin),
    state: &WsState,
) -> Result<Option<PeerId>, axum::Error> {
    let Some(msg) = stream.next().await else {
        return Ok(None);
    };
    let Message::Text(text) = msg? else {
        return Ok(None);
    };
    let Ok(ClientFrame::Join { login }) = serde_json::from_str::<ClientFrame>(&text) else {
        send_frame(sink, &ServerFrame::Error {
            reason: "expected a join frame first".to_string(),
        })
        .await?;
        return Ok(None);
    };

    let req = LoginRequest {
        machine_id: login.machine_id.as_str().to_string(),
        public_key: login.public_key,
        hostname: login.hostname,
        access_token: login.access_token,
    };

    match state.login.login(req).await {
        Ok(LoginOutcome::Ok(config)) => {
            let peer_id = config.peer_id;
            send_frame(sink, &ServerFrame::JoinAck {
                response: LoginPeerResponse::Ok { config },
            })
            .await?;
            let _ = state.store.set_connected(peer_id, true).await;
            Ok(Some(peer_id))
        }
        Ok(LoginOutcome::AuthenticationRequired) => {
            send_frame(sink, &ServerFrame::JoinAck {
                response: LoginPeerResponse::AuthenticationRequired {
                    oidc_endpoints: state.oidc_endpoints.clone(),
                },
            })
            .await?;
            Ok(None)
        }
        Err(e) => {
            send_frame(sink, &ServerFrame::Error { reason: e.to_string() }).await?;
            Ok(None)
        }
    }
}

/// `INIT`: every other currently-connected peer, sent once right
/// after join so the node can start dialing them immediately (§8
/// property 9 — idempotent by construction since the node only ever
/// creates peers it doesn't already have).
async fn send_initial_peer_list(
    sink: &mut (impl futures_util::Sink<Message, Error = axum::Error> + Unpin),
    state: &WsState,
    self_id: PeerId,
) -> Result<(), axum::Error> {
    let peers = state
        .store
        .get_connected()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|p| p.peer_id != self_id)
        .map(|p| PeerSummary {
            peer_id: p.peer_id,
            overlay_ip: p.overlay_ip,
            public_key: p.public_key,
            hostname: p.hostname,
        })
        .collect();

    send_frame(sink, &ServerFrame::Update {
        response: UpdateResponse::Init { peers },
    })
    .await
}

/// ICE forwarding (§4.8): rewrite `peerId` to the submitter's id and
/// hand it to the addressed peer's channel.
async fn forward_ice(state: &WsState, submitter: PeerId, update: IceUpdate) {
    let target = update.peer_id();
    let rewritten = update.with_peer_id(submitter);
    state.broker.send_to(target, UpdateResponse::Ice(rewritten)).await;
}

async fn summary_for(state: &WsState, peer_id: PeerId) -> PeerSummary {
    match state.store.get_by_id(peer_id).await {
        Ok(Some(p)) => PeerSummary {
            peer_id: p.peer_id,
            overlay_ip: p.overlay_ip,
            public_key: p.public_key,
            hostname: p.hostname,
        },
        _ => PeerSummary {
            peer_id,
            overlay_ip: std::net::Ipv4Addr::UNSPECIFIED,
            public_key: overlay_model::PublicKey::from_bytes([0u8; 32]),
            hostname: String::new(),
        },
    }
}

async fn send_frame(
    sink: &mut (impl futures_util::Sink<Message, Error = axum::Error> + Unpin),
    frame: &ServerFrame,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).expect("ServerFrame always serializes");
    sink.send(Message::Text(text.into())).await
}
