//! Long-lived key pair for the encryption envelope
//!
//! The pair is generated on the first encrypted run and written to two files
//! in the key directory. Later runs load the files verbatim. Losing them makes
//! every sealed record permanently unrecoverable, so they must be backed up
//! together with the database.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::rngs::OsRng;
use std::path::{Path, PathBuf};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{Result, VaultError};

pub const PUBLIC_KEY_FILE: &str = "public.key";
pub const PRIVATE_KEY_FILE: &str = "private.key";

/// X25519 key pair used to wrap per-record data keys
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Load the pair from `dir`, generating and persisting it if neither file exists
    pub fn load_or_generate(dir: &Path) -> Result<Self> {
        let (public_path, private_path) = key_paths(dir);
        match (public_path.exists(), private_path.exists()) {
            (true, true) => Self::load(dir),
            (false, false) => {
                let pair = Self::generate();
                pair.persist(dir)?;
                tracing::info!(
                    "Generated new encryption key pair in {} - back these files up, sealed content cannot be recovered without them",
                    dir.display()
                );
                Ok(pair)
            }
            (has_public, _) => {
                // Regenerating here would orphan everything sealed with the old pair
                let missing = if has_public { &private_path } else { &public_path };
                Err(VaultError::Config(format!(
                    "encryption key file {} is missing while its partner exists; restore it from backup",
                    missing.display()
                )))
            }
        }
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let (public_path, private_path) = key_paths(dir);
        let secret = StaticSecret::from(read_key(&private_path)?);
        let public = PublicKey::from(read_key(&public_path)?);

        if PublicKey::from(&secret).as_bytes() != public.as_bytes() {
            return Err(VaultError::Encryption(format!(
                "{} does not match {}",
                public_path.display(),
                private_path.display()
            )));
        }

        tracing::debug!("Loaded encryption key pair from {}", dir.display());
        Ok(Self { secret, public })
    }

    fn persist(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let (public_path, private_path) = key_paths(dir);
        std::fs::write(&public_path, STANDARD.encode(self.public.as_bytes()))?;
        write_private(&private_path, STANDARD.encode(self.secret.to_bytes()).as_bytes())
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.secret
    }
}

fn key_paths(dir: &Path) -> (PathBuf, PathBuf) {
    (dir.join(PUBLIC_KEY_FILE), dir.join(PRIVATE_KEY_FILE))
}

/// The secret is never on disk with wider permissions than owner-only
fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    use std::io::Write;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    Ok(())
}

fn read_key(path: &Path) -> Result<[u8; 32]> {
    let encoded = std::fs::read_to_string(path)?;
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| VaultError::Encryption(format!("{}: {}", path.display(), e)))?;
    bytes.try_into().map_err(|_| {
        VaultError::Encryption(format!("{}: expected a 32-byte key", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_generate_then_reload_same_pair() {
        let dir = tempdir().unwrap();
        let first = KeyPair::load_or_generate(dir.path()).unwrap();
        let second = KeyPair::load_or_generate(dir.path()).unwrap();
        assert_eq!(first.public().as_bytes(), second.public().as_bytes());
    }

    #[test]
    fn test_half_missing_pair_is_an_error() {
        let dir = tempdir().unwrap();
        KeyPair::load_or_generate(dir.path()).unwrap();
        std::fs::remove_file(dir.path().join(PRIVATE_KEY_FILE)).unwrap();

        let err = KeyPair::load_or_generate(dir.path()).err().unwrap();
        assert!(matches!(err, VaultError::Config(_)));
        // The surviving public key was not overwritten
        assert!(dir.path().join(PUBLIC_KEY_FILE).exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_private_key_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        KeyPair::load_or_generate(dir.path()).unwrap();
        let mode = std::fs::metadata(dir.path().join(PRIVATE_KEY_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_existing_private_key_is_never_overwritten() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(PRIVATE_KEY_FILE);
        std::fs::write(&path, "original").unwrap();

        let err = write_private(&path, b"replacement").unwrap_err();
        assert!(matches!(err, VaultError::Io(_)));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "original");
    }
}
