//! §4.9: the Login/register decision tree. One handler shared by
//! every transport (the websocket join message today, conceivably a
//! plain HTTP endpoint later) so the branching logic lives in exactly
//! one place.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use overlay_model::{ErrorKind, MachineId, OverlayConfig, OverlayError, OverlayPrefix, PublicKey};
use overlay_ports::{PeerRecord, PeerStore, TokenValidator};

use crate::registry::UpdateBroker;

/// How long a login stays valid without re-presenting an access
/// token (§4.9 step 4/5).
const AUTH_VALIDITY_SECS: i64 = 30 * 24 * 60 * 60;

pub struct LoginRequest {
    pub machine_id: String,
    pub public_key: PublicKey,
    pub hostname: String,
    pub access_token: Option<String>,
}

pub enum LoginOutcome {
    Ok(OverlayConfig),
    /// Step 5/6: the controller needs a token the request didn't
    /// carry. Distinct from an `Unauthenticated` error so the caller
    /// can drive the OIDC flow instead of just failing.
    AuthenticationRequired,
}

pub struct LoginHandler {
    store: Arc<dyn PeerStore>,
    tokens: Arc<dyn TokenValidator>,
    prefix: OverlayPrefix,
    /// Used only to force-logout a peer whose stream is already
    /// attached when its presented token turns out to belong to a
    /// different user than the stored owner (§4.9, §7).
    broker: UpdateBroker,
}

impl LoginHandler {
    pub fn new(
        store: Arc<dyn PeerStore>,
        tokens: Arc<dyn TokenValidator>,
        prefix: OverlayPrefix,
        broker: UpdateBroker,
    ) -> Self {
        Self {
            store,
            tokens,
            prefix,
            broker,
        }
    }

    pub async fn login(&self, req: LoginRequest) -> Result<LoginOutcome, OverlayError> {
        let machine_id = MachineId::parse(req.machine_id)
            .map_err(|e| OverlayError::invalid_argument(e.to_string()))?;

        let now = now_unix();

        match self.store.get_by_machine_id(&machine_id).await? {
            Some(peer) if peer.disabled => Err(OverlayError::permission_denied(format!(
                "peer {} is disabled",
                peer.peer_id
            ))),
            Some(mut peer) if now - peer.last_auth_unix < AUTH_VALIDITY_SECS => {
                peer.public_key = req.public_key;
                peer.hostname = req.hostname;
                self.store.update(peer.clone()).await?;
                Ok(LoginOutcome::Ok(success_config(&peer)))
            }
            Some(mut peer) => {
                let Some(token) = req.access_token.as_deref() else {
                    return Ok(LoginOutcome::AuthenticationRequired);
                };
                let user_id = self.tokens.validate(token).await?;
                if user_id != peer.user_id {
                    if peer.connected {
                        self.broker.force_logout(peer.peer_id);
                    }
                    return Err(OverlayError::permission_denied(
                        "access token belongs to a different user than this machine id",
                    ));
                }
                peer.last_auth_unix = now;
                peer.public_key = req.public_key;
                peer.hostname = req.hostname;
                self.store.update(peer.clone()).await?;
                Ok(LoginOutcome::Ok(success_config(&peer)))
            }
            None => {
                let Some(token) = req.access_token.as_deref() else {
                    return Ok(LoginOutcome::AuthenticationRequired);
                };
                let user_id = self.tokens.validate(token).await?;
                let peer = self
                    .store
                    .create(machine_id, user_id, req.public_key, req.hostname, self.prefix)
                    .await?;
                Ok(LoginOutcome::Ok(success_config(&peer)))
            }
        }
    }
}

fn success_config(peer: &PeerRecord) -> OverlayConfig {
    OverlayConfig {
        peer_id: peer.peer_id,
        tunnel_ip: peer.overlay_ip,
        prefix: peer.prefix,
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use overlay_model::PeerId;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::net::Ipv4Addr;

    struct FakeStore {
        peers: Mutex<HashMap<MachineId, PeerRecord>>,
        next_id: Mutex<u32>,
    }

    impl FakeStore {
        fn empty() -> Self {
            Self {
                peers: Mutex::new(HashMap::new()),
                next_id: Mutex::new(1),
            }
        }

        fn seeded(record: PeerRecord) -> Self {
            let store = Self::empty();
            store.peers.lock().insert(record.machine_id.clone(), record);
            store
        }
    }

    #[async_trait]
    impl PeerStore for FakeStore {
        async fn get_by_machine_id(&self, id: &MachineId) -> Result<Option<PeerRecord>, OverlayError> {
            Ok(self.peers.lock().get(id).cloned())
        }

        async fn get_by_id(&self, id: PeerId) -> Result<Option<PeerRecord>, OverlayError> {
            Ok(self.peers.lock().values().find(|p| p.peer_id == id).cloned())
        }

        async fn get_all(&self) -> Result<Vec<PeerRecord>, OverlayError> {
            Ok(self.peers.lock().values().cloned().collect())
        }

        async fn get_connected(&self) -> Result<Vec<PeerRecord>, OverlayError> {
            Ok(self.peers.lock().values().filter(|p| p.connected).cloned().collect())
        }

        async fn create(
            &self,
            machine_id: MachineId,
            user_id: String,
            public_key: PublicKey,
            hostname: String,
            prefix: OverlayPrefix,
        ) -> Result<PeerRecord, OverlayError> {
            let mut next_id = self.next_id.lock();
            let peer_id = PeerId::new(*next_id);
            *next_id += 1;
            let record = PeerRecord {
                peer_id,
                machine_id: machine_id.clone(),
                user_id,
                overlay_ip: Ipv4Addr::new(100, 70, 0, peer_id.get() as u8),
                prefix,
                public_key,
                hostname,
                last_login_unix: now_unix(),
                last_auth_unix: now_unix(),
                connected: false,
                disabled: false,
            };
            self.peers.lock().insert(machine_id, record.clone());
            Ok(record)
        }

        async fn update(&self, peer: PeerRecord) -> Result<(), OverlayError> {
            self.peers.lock().insert(peer.machine_id.clone(), peer);
            Ok(())
        }

        async fn set_connected(&self, id: PeerId, connected: bool) -> Result<(), OverlayError> {
            let mut peers = self.peers.lock();
            if let Some(peer) = peers.values_mut().find(|p| p.peer_id == id) {
                peer.connected = connected;
            }
            Ok(())
        }

        async fn touch_auth(&self, id: PeerId, now_unix: i64) -> Result<(), OverlayError> {
            let mut peers = self.peers.lock();
            if let Some(peer) = peers.values_mut().find(|p| p.peer_id == id) {
                peer.last_auth_unix = now_unix;
            }
            Ok(())
        }
    }

    struct FakeTokens {
        user_id: &'static str,
    }

    #[async_trait]
    impl TokenValidator for FakeTokens {
        async fn validate(&self, token: &str) -> Result<String, OverlayError> {
            if token == "good" {
                Ok(self.user_id.to_string())
            } else {
                Err(OverlayError::unauthenticated("bad token"))
            }
        }
    }

    fn prefix() -> OverlayPrefix {
        OverlayPrefix::new(Ipv4Addr::new(100, 70, 0, 0), 24).unwrap()
    }

    fn req(machine_id: &str, access_token: Option<&str>) -> LoginRequest {
        LoginRequest {
            machine_id: machine_id.to_string(),
            public_key: PublicKey::from_bytes([1u8; 32]),
            hostname: "node".to_string(),
            access_token: access_token.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn rejects_malformed_machine_id() {
        let handler = LoginHandler::new(
            Arc::new(FakeStore::empty()),
            Arc::new(FakeTokens { user_id: "u1" }),
            prefix(),
            UpdateBroker::new(),
        );
        let err = handler.login(req("bad id!", None)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn unknown_machine_without_token_needs_authentication() {
        let handler = LoginHandler::new(
            Arc::new(FakeStore::empty()),
            Arc::new(FakeTokens { user_id: "u1" }),
            prefix(),
            UpdateBroker::new(),
        );
        let outcome = handler.login(req("brand_new_machine", None)).await.unwrap();
        assert!(matches!(outcome, LoginOutcome::AuthenticationRequired));
    }

    #[tokio::test]
    async fn unknown_machine_with_good_token_registers_and_allocates_ip() {
        let handler = LoginHandler::new(
            Arc::new(FakeStore::empty()),
            Arc::new(FakeTokens { user_id: "u1" }),
            prefix(),
            UpdateBroker::new(),
        );
        let outcome = handler.login(req("brand_new_machine", Some("good"))).await.unwrap();
        match outcome {
            LoginOutcome::Ok(config) => assert_eq!(config.prefix, prefix()),
            LoginOutcome::AuthenticationRequired => panic!("expected success"),
        }
    }

    #[tokio::test]
    async fn disabled_peer_is_rejected() {
        let mut record = seeded_record("machine_one_two_three", "u1");
        record.disabled = true;
        let handler = LoginHandler::new(
            Arc::new(FakeStore::seeded(record)),
            Arc::new(FakeTokens { user_id: "u1" }),
            prefix(),
            UpdateBroker::new(),
        );
        let err = handler.login(req("machine_one_two_three", None)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn fresh_auth_does_not_require_a_token() {
        let record = seeded_record("machine_one_two_three", "u1");
        let handler = LoginHandler::new(
            Arc::new(FakeStore::seeded(record)),
            Arc::new(FakeTokens { user_id: "u1" }),
            prefix(),
            UpdateBroker::new(),
        );
        let outcome = handler.login(req("machine_one_two_three", None)).await.unwrap();
        assert!(matches!(outcome, LoginOutcome::Ok(_)));
    }

    #[tokio::test]
    async fn expired_auth_with_wrong_users_token_is_permission_denied() {
        let mut record = seeded_record("machine_one_two_three", "u1");
        record.last_auth_unix = now_unix() - AUTH_VALIDITY_SECS - 1;
        let handler = LoginHandler::new(
            Arc::new(FakeStore::seeded(record)),
            Arc::new(FakeTokens { user_id: "u2" }),
            prefix(),
            UpdateBroker::new(),
        );
        let err = handler
            .login(req("machine_one_two_three", Some("good")))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn expired_auth_with_matching_users_token_refreshes() {
        let mut record = seeded_record("machine_one_two_three", "u1");
        record.last_auth_unix = now_unix() - AUTH_VALIDITY_SECS - 1;
        let handler = LoginHandler::new(
            Arc::new(FakeStore::seeded(record)),
            Arc::new(FakeTokens { user_id: "u1" }),
            prefix(),
            UpdateBroker::new(),
        );
        let outcome = handler
            .login(req("machine_one_two_three", Some("good")))
            .await
            .unwrap();
        assert!(matches!(outcome, LoginOutcome::Ok(_)));
    }

    fn seeded_record(machine_id: &str, user_id: &str) -> PeerRecord {
        PeerRecord {
            peer_id: PeerId::new(1),
            machine_id: MachineId::parse(machine_id).unwrap(),
            user_id: user_id.to_string(),
            overlay_ip: Ipv4Addr::new(100, 70, 0, 1),
            prefix: prefix(),
            public_key: PublicKey::from_bytes([9u8; 32]),
            hostname: "node".to_string(),
            last_login_unix: now_unix(),
            last_auth_unix: now_unix(),
            connected: false,
            disabled: false,
        }
    }
}
