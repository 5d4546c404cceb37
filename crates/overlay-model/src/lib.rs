//! Shared types and error taxonomy used by every other crate in the
//! workspace, so that the controller and the node agree on the same
//! identifiers and failure classification without depending on each
//! other.

mod error;
mod ids;
mod overlay_ip;

pub use error::{ErrorKind, OverlayError};
pub use ids::{MachineId, MachineIdError, PeerId};
pub use overlay_ip::{OverlayConfig, OverlayPrefix};

use base64::Engine as _;

/// An X25519 static public key, stored as raw bytes but serialized as
/// base64 on the wire (same representation the controller's peer
/// records use).
#[derive(Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    pub fn from_base64(s: &str) -> Result<Self, PublicKeyError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(|_| PublicKeyError::Malformed)?;
        let arr: [u8; 32] = bytes.try_into().map_err(|_| PublicKeyError::WrongLength)?;
        Ok(Self(arr))
    }
}

impl TryFrom<String> for PublicKey {
    type Error = PublicKeyError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_base64(&s)
    }
}

impl From<PublicKey> for String {
    fn from(key: PublicKey) -> Self {
        key.to_base64()
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let encoded = self.to_base64();
        write!(f, "PublicKey({}…)", &encoded[..8.min(encoded.len())])
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PublicKeyError {
    #[error("public key is not valid base64")]
    Malformed,
    #[error("public key did not decode to 32 bytes")]
    WrongLength,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_key_base64_round_trip() {
        let key = PublicKey([7u8; 32]);
        let encoded = key.to_base64();
        let decoded = PublicKey::from_base64(&encoded).unwrap();
        assert_eq!(key, decoded);
    }

    #[test]
    fn public_key_rejects_wrong_length() {
        let encoded = base64::engine::general_purpose::STANDARD.encode([1u8; 10]);
        assert!(matches!(
            PublicKey::from_base64(&encoded),
            Err(PublicKeyError::WrongLength)
        ));
    }
}
