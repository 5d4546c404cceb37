//! A per-peer Noise `IK` session: one round trip to authenticate both
//! sides against known static keys and derive a transport cipher,
//! after which `encrypt`/`decrypt` drive an explicit, externally
//! supplied nonce instead of an implicit internal counter — the frame
//! header already carries that counter, so the session must accept
//! it rather than keep its own shadow copy that could drift.

use snow::params::NoiseParams;

const NOISE_PATTERN: &str = "Noise_IK_25519_ChaChaPoly_BLAKE2s";

/// Handshake role. `IK` is asymmetric: the initiator must already
/// know the responder's static public key before the first message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Discrete handshake/session state. Matches the state machine this
/// session's caller (the peer) drives it through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    HandshakeSent,
    HandshakeReceived,
    Complete,
}

enum Inner {
    Idle,
    Handshaking {
        role: Role,
        state: Box<snow::HandshakeState>,
    },
    Complete {
        transport: Box<snow::TransportState>,
        remote_static: [u8; 32],
    },
}

pub struct NoiseSession {
    local_static: [u8; 32],
    remote_static: Option<[u8; 32]>,
    inner: Inner,
}

#[derive(Debug, thiserror::Error)]
pub enum NoiseError {
    #[error("noise protocol error: {0}")]
    Protocol(#[from] snow::Error),
    #[error("operation requires session state {expected:?}, but session is in {actual:?}")]
    WrongState {
        expected: SessionState,
        actual: SessionState,
    },
    #[error("initiator role requires the responder's static public key")]
    MissingRemoteStatic,
    #[error("output buffer too small for noise message")]
    BufferTooSmall,
}

impl NoiseSession {
    /// Constructs a session in `Idle` state. `remote_static` is
    /// mandatory for an eventual `Initiator` role and optional for a
    /// `Responder` (who learns it from the first handshake message).
    pub fn new(local_static: [u8; 32], remote_static: Option<[u8; 32]>) -> Self {
        Self {
            local_static,
            remote_static,
            inner: Inner::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        match &self.inner {
            Inner::Idle => SessionState::Idle,
            Inner::Handshaking { role, .. } => match role {
                Role::Initiator => SessionState::HandshakeSent,
                Role::Responder => SessionState::HandshakeReceived,
            },
            Inner::Complete { .. } => SessionState::Complete,
        }
    }

    /// Known only once the responder has processed the first
    /// handshake message (or, for an initiator, always — it supplied
    /// it up front).
    pub fn remote_static(&self) -> Option<[u8; 32]> {
        match &self.inner {
            Inner::Complete { remote_static, .. } => Some(*remote_static),
            _ => self.remote_static,
        }
    }

    /// Builds the underlying handshake state for `role`. Required
    /// before the first `write_handshake_p1`/`read_handshake_p1` call,
    /// and again after [`NoiseSession::reset`].
    pub fn initialize(&mut self, role: Role) -> Result<(), NoiseError> {
        let params: NoiseParams = NOISE_PATTERN.parse().expect("static pattern always parses");
        let builder = snow::Builder::new(params).local_private_key(&self.local_static);

        let handshake = match role {
            Role::Initiator => {
                let remote = self.remote_static.ok_or(NoiseError::MissingRemoteStatic)?;
                builder.remote_public_key(&remote).build_initiator()?
            }
            Role::Responder => builder.build_responder()?,
        };

        self.inner = Inner::Handshaking {
            role,
            state: Box::new(handshake),
        };
        Ok(())
    }

    /// Initiator: writes the first (and only outbound) handshake
    /// message. Moves `Idle -> HandshakeSent`.
    pub fn write_handshake_p1(&mut self, out: &mut [u8]) -> Result<usize, NoiseError> {
        self.with_handshaking(Role::Initiator, |hs| Ok(hs.write_message(&[], out)?))
    }

    /// Responder: consumes the first handshake message. Moves
    /// `Idle -> HandshakeReceived`.
    pub fn read_handshake_p1(&mut self, input: &[u8]) -> Result<(), NoiseError> {
        let mut scratch = [0u8; 1024];
        self.with_handshaking(Role::Responder, |hs| {
            hs.read_message(input, &mut scratch)?;
            Ok(())
        })
    }

    /// Responder: writes the second handshake message and completes
    /// the session. Moves `HandshakeReceived -> Complete`.
    pub fn write_handshake_p2(&mut self, out: &mut [u8]) -> Result<usize, NoiseError> {
        let (n, remote_static, transport) = self.finish_handshake(Role::Responder, |hs| {
            Ok(hs.write_message(&[], out)?)
        })?;
        self.inner = Inner::Complete {
            transport: Box::new(transport),
            remote_static,
        };
        Ok(n)
    }

    /// Initiator: consumes the second handshake message and completes
    /// the session. Moves `HandshakeSent -> Complete`.
    pub fn read_handshake_p2(&mut self, input: &[u8]) -> Result<(), NoiseError> {
        let mut scratch = [0u8; 1024];
        let (_n, remote_static, transport) = self.finish_handshake(Role::Initiator, |hs| {
            hs.read_message(input, &mut scratch)?;
            Ok(0)
        })?;
        self.inner = Inner::Complete {
            transport: Box::new(transport),
            remote_static,
        };
        Ok(())
    }

    /// Encrypts `plaintext` into `out`, returning the nonce the frame
    /// header's counter field must carry alongside the ciphertext.
    pub fn encrypt(&mut self, plaintext: &[u8], out: &mut [u8]) -> Result<(u64, usize), NoiseError> {
        let transport = self.transport_mut()?;
        let nonce = transport.sending_nonce();
        let n = transport.write_message(plaintext, out)?;
        Ok((nonce, n))
    }

    /// Decrypts `ciphertext` into `out` using `nonce` parsed from the
    /// frame header rather than an internal counter, since peers
    /// never disagree with the wire about which nonce was used.
    pub fn decrypt(
        &mut self,
        ciphertext: &[u8],
        out: &mut [u8],
        nonce: u64,
    ) -> Result<usize, NoiseError> {
        let transport = self.transport_mut()?;
        if nonce > transport.receiving_nonce() {
            transport.set_receiving_nonce(nonce);
        }
        let n = transport.read_message(ciphertext, out)?;
        Ok(n)
    }

    /// Returns the session to `Idle`, dropping all key material. The
    /// caller must `initialize` again before the next handshake.
    pub fn reset(&mut self) {
        self.inner = Inner::Idle;
    }

    fn transport_mut(&mut self) -> Result<&mut snow::TransportState, NoiseError> {
        match &mut self.inner {
            Inner::Complete { transport, .. } => Ok(transport),
            other => Err(NoiseError::WrongState {
                expected: SessionState::Complete,
                actual: state_of(other),
            }),
        }
    }

    fn with_handshaking<F>(&mut self, expected_role: Role, f: F) -> Result<usize, NoiseError>
    where
        F: FnOnce(&mut snow::HandshakeState) -> Result<usize, NoiseError>,
    {
        match &mut self.inner {
            Inner::Handshaking { role, state } if *role == expected_role => f(state),
            other => Err(NoiseError::WrongState {
                expected: role_expected_state(expected_role),
                actual: state_of(other),
            }),
        }
    }

    fn finish_handshake<F>(
        &mut self,
        expected_role: Role,
        f: F,
    ) -> Result<(usize, [u8; 32], snow::TransportState), NoiseError>
    where
        F: FnOnce(&mut snow::HandshakeState) -> Result<usize, NoiseError>,
    {
        let (n, handshake) = match &mut self.inner {
            Inner::Handshaking { role, state } if *role == expected_role => {
                let n = f(state)?;
                (n, state)
            }
            other => {
                return Err(NoiseError::WrongState {
                    expected: role_expected_state(expected_role),
                    actual: state_of(other),
                })
            }
        };

        let remote_static: [u8; 32] = handshake
            .get_remote_static()
            .ok_or(NoiseError::MissingRemoteStatic)?
            .try_into()
            .map_err(|_| NoiseError::BufferTooSmall)?;

        let owned = match std::mem::replace(&mut self.inner, Inner::Idle) {
            Inner::Handshaking { state, .. } => *state,
            _ => unreachable!("checked above"),
        };
        let transport = owned.into_transport_mode()?;

        Ok((n, remote_static, transport))
    }
}

/// Generates a fresh X25519 static keypair for this protocol's DH
/// function, for callers that need to provision a new identity (node
/// first-run) rather than construct a session.
pub fn generate_static_keypair() -> ([u8; 32], [u8; 32]) {
    let params: NoiseParams = NOISE_PATTERN.parse().expect("static pattern always parses");
    let keypair = snow::Builder::new(params)
        .generate_keypair()
        .expect("keypair generation does not fail");
    let mut private = [0u8; 32];
    let mut public = [0u8; 32];
    private.copy_from_slice(&keypair.private);
    public.copy_from_slice(&keypair.public);
    (private, public)
}

fn role_expected_state(role: Role) -> SessionState {
    match role {
        Role::Initiator => SessionState::HandshakeSent,
        Role::Responder => SessionState::HandshakeReceived,
    }
}

fn state_of(inner: &Inner) -> SessionState {
    match inner {
        Inner::Idle => SessionState::Idle,
        Inner::Handshaking { role, .. } => match role {
            Role::Initiator => SessionState::HandshakeSent,
            Role::Responder => SessionState::HandshakeReceived,
        },
        Inner::Complete { .. } => SessionState::Complete,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> ([u8; 32], [u8; 32]) {
        generate_static_keypair()
    }

    #[test]
    fn full_handshake_then_encrypt_decrypt_round_trips() {
        let (i_priv, i_pub) = keypair();
        let (r_priv, r_pub) = keypair();

        let mut initiator = NoiseSession::new(i_priv, Some(r_pub));
        let mut responder = NoiseSession::new(r_priv, None);

        initiator.initialize(Role::Initiator).unwrap();
        responder.initialize(Role::Responder).unwrap();

        let mut msg1 = [0u8; 256];
        let n1 = initiator.write_handshake_p1(&mut msg1).unwrap();
        assert_eq!(initiator.state(), SessionState::HandshakeSent);

        responder.read_handshake_p1(&msg1[..n1]).unwrap();
        assert_eq!(responder.state(), SessionState::HandshakeReceived);

        let mut msg2 = [0u8; 256];
        let n2 = responder.write_handshake_p2(&mut msg2).unwrap();
        assert_eq!(responder.state(), SessionState::Complete);

        initiator.read_handshake_p2(&msg2[..n2]).unwrap();
        assert_eq!(initiator.state(), SessionState::Complete);

        assert_eq!(initiator.remote_static(), Some(r_pub));
        assert_eq!(responder.remote_static(), Some(i_pub));

        let plaintext = b"hello overlay";
        let mut ciphertext = [0u8; 256];
        let (nonce, clen) = initiator.encrypt(plaintext, &mut ciphertext).unwrap();

        let mut decrypted = [0u8; 256];
        let dlen = responder
            .decrypt(&ciphertext[..clen], &mut decrypted, nonce)
            .unwrap();

        assert_eq!(&decrypted[..dlen], plaintext);
    }

    #[test]
    fn encrypt_before_handshake_fails() {
        let (priv_key, _pub) = keypair();
        let mut session = NoiseSession::new(priv_key, None);
        let mut out = [0u8; 64];
        assert!(matches!(
            session.encrypt(b"too early", &mut out),
            Err(NoiseError::WrongState { .. })
        ));
    }

    #[test]
    fn reset_returns_to_idle() {
        let (priv_key, pub_key) = keypair();
        let mut session = NoiseSession::new(priv_key, Some(pub_key));
        session.initialize(Role::Initiator).unwrap();
        assert_ne!(session.state(), SessionState::Idle);
        session.reset();
        assert_eq!(session.state(), SessionState::Idle);
    }
}
