//! §4.11: the node's persisted X25519 keypair and `machineId`. The
//! login request always carries these, so they must outlive any
//! single process run — generated once, then reloaded verbatim on
//! every subsequent start.

use std::path::{Path, PathBuf};

use overlay_model::{MachineId, PublicKey};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("could not determine this platform's config directory")]
    NoConfigDir,
    #[error("failed to read identity file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write identity file at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("identity file at {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Serialize, Deserialize)]
struct OnDisk {
    machine_id: String,
    private_key: [u8; 32],
    public_key: [u8; 32],
}

pub struct NodeIdentity {
    pub machine_id: MachineId,
    pub private_key: [u8; 32],
    pub public_key: PublicKey,
}

impl NodeIdentity {
    /// Loads the identity from `dir`/identity.json, generating and
    /// persisting a fresh one on first run. A corrupt or unreadable
    /// file is not retried or regenerated automatically — callers
    /// should treat [`IdentityError`] as fatal (§7), since silently
    /// minting a new identity would change this node's controller-side
    /// `Peer` record out from under it.
    pub fn load_or_create(dir: &Path) -> Result<Self, IdentityError> {
        let path = dir.join("identity.json");

        match std::fs::read_to_string(&path) {
            Ok(text) => {
                let on_disk: OnDisk =
                    serde_json::from_str(&text).map_err(|source| IdentityError::Corrupt { path, source })?;
                Ok(Self {
                    machine_id: MachineId::parse(on_disk.machine_id)
                        .expect("a previously-persisted machine id was valid when written"),
                    private_key: on_disk.private_key,
                    public_key: PublicKey::from_bytes(on_disk.public_key),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::generate_and_persist(dir, &path),
            Err(source) => Err(IdentityError::Read { path, source }),
        }
    }

    fn generate_and_persist(dir: &Path, path: &Path) -> Result<Self, IdentityError> {
        std::fs::create_dir_all(dir).map_err(|source| IdentityError::Write {
            path: path.to_path_buf(),
            source,
        })?;

        let (private_key, public_key) = overlay_noise::generate_static_keypair();
        let machine_id = MachineId::parse(random_machine_id()).expect("generated machine id meets the shape requirement");

        let on_disk = OnDisk {
            machine_id: machine_id.as_str().to_string(),
            private_key,
            public_key,
        };
        let text = serde_json::to_string_pretty(&on_disk).expect("identity always serializes");
        std::fs::write(path, text).map_err(|source| IdentityError::Write {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(Self {
            machine_id,
            private_key,
            public_key: PublicKey::from_bytes(public_key),
        })
    }
}

/// Platform standard config directory for this node's identity and
/// any other persisted state, the same `dirs` crate this corpus uses
/// elsewhere for locating per-platform paths.
pub fn default_config_dir() -> Result<PathBuf, IdentityError> {
    dirs::config_dir()
        .map(|dir| dir.join("overlay-node"))
        .ok_or(IdentityError::NoConfigDir)
}

fn random_machine_id() -> String {
    use rand::Rng;
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..32).map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_run_generates_and_persists_then_reloads_identical() {
        let tmp = tempdir();
        let first = NodeIdentity::load_or_create(&tmp).unwrap();
        let second = NodeIdentity::load_or_create(&tmp).unwrap();

        assert_eq!(first.machine_id, second.machine_id);
        assert_eq!(first.private_key, second.private_key);
        assert_eq!(first.public_key, second.public_key);

        std::fs::remove_dir_all(&tmp).ok();
    }

    #[test]
    fn corrupt_identity_file_is_reported_not_silently_replaced() {
        let tmp = tempdir();
        std::fs::create_dir_all(&tmp).unwrap();
        std::fs::write(tmp.join("identity.json"), b"not json").unwrap();

        let err = NodeIdentity::load_or_create(&tmp).unwrap_err();
        assert!(matches!(err, IdentityError::Corrupt { .. }));

        std::fs::remove_dir_all(&tmp).ok();
    }

    fn tempdir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("overlay-node-identity-test-{}", random_machine_id()));
        dir
    }
}
