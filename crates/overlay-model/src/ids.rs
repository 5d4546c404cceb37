/// A controller-assigned identifier for a peer.
///
/// Deliberately a plain `u32`, not a UUID: the glare tie-break rule in
/// the peer state machine compares two peer ids numerically, and a
/// type that didn't support that comparison directly would just push
/// the comparison back out into callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub u32);

impl PeerId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for PeerId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// A stable, node-generated identifier presented at every login.
///
/// Validation mirrors the login handler's requirement that a
/// `machineId` be a non-empty run of ASCII alphanumerics and
/// underscores with a minimum length, rather than accepting anything
/// the caller sends.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct MachineId(String);

const MIN_MACHINE_ID_LEN: usize = 8;

impl MachineId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, MachineIdError> {
        let raw = raw.into();
        if raw.len() < MIN_MACHINE_ID_LEN {
            return Err(MachineIdError::TooShort {
                min: MIN_MACHINE_ID_LEN,
            });
        }
        if !raw.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
            return Err(MachineIdError::InvalidCharacters);
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MachineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MachineIdError {
    #[error("machine id must be at least {min} characters")]
    TooShort { min: usize },
    #[error("machine id must contain only alphanumerics or '_'")]
    InvalidCharacters,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_orders_numerically() {
        assert!(PeerId::new(1) < PeerId::new(2));
        assert!(PeerId::new(10) > PeerId::new(9));
    }

    #[test]
    fn machine_id_rejects_short_strings() {
        assert_eq!(
            MachineId::parse("ab12"),
            Err(MachineIdError::TooShort {
                min: MIN_MACHINE_ID_LEN
            })
        );
    }

    #[test]
    fn machine_id_rejects_invalid_characters() {
        assert_eq!(
            MachineId::parse("not a valid id!!"),
            Err(MachineIdError::InvalidCharacters)
        );
    }

    #[test]
    fn machine_id_accepts_well_formed_ids() {
        assert!(MachineId::parse("node_alpha_01").is_ok());
    }

    #[test]
    fn machine_id_rejects_hyphens() {
        assert_eq!(
            MachineId::parse("node-alpha-01"),
            Err(MachineIdError::InvalidCharacters)
        );
    }
}
