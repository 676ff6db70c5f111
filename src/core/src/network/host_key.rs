use log::info;
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::Path;

use crate::error_handling::types::NetworkError;

/// Identity key the acceptor presents to operators.
///
/// Persisted hex encoded so that the fingerprint survives restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKey {
    material: Vec<u8>,
}

impl HostKey {
    pub fn generate() -> Self {
        Self {
            material: rand::random::<[u8; 32]>().to_vec(),
        }
    }

    /// Loads the key at `path`, creating it (and its directory) when missing.
    pub fn load_or_generate(path: &Path) -> Result<Self, NetworkError> {
        if path.exists() {
            let content = fs::read_to_string(path).map_err(NetworkError::HostKeyError)?;
            let material = hex::decode(content.trim()).map_err(|e| {
                NetworkError::HostKeyError(io::Error::new(io::ErrorKind::InvalidData, e))
            })?;
            if material.is_empty() {
                return Err(NetworkError::HostKeyError(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "empty host key",
                )));
            }
            return Ok(Self { material });
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(NetworkError::HostKeyError)?;
        }
        let key = Self::generate();
        fs::write(path, hex::encode(&key.material)).map_err(NetworkError::HostKeyError)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))
                .map_err(NetworkError::HostKeyError)?;
        }

        info!("Generated host key at {}", path.display());
        Ok(key)
    }

    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(&self.material))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generate_then_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys").join("host_key");

        let first = HostKey::load_or_generate(&path).unwrap();
        assert!(path.exists());
        let second = HostKey::load_or_generate(&path).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.fingerprint().len(), 64);
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("host_key");
        HostKey::load_or_generate(&path).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_corrupt_key() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("host_key");
        fs::write(&path, "not hex").unwrap();

        assert!(matches!(
            HostKey::load_or_generate(&path),
            Err(NetworkError::HostKeyError(_))
        ));
    }
}
