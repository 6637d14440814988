//! Ed25519 seed file management
//!
//! The receipt signing key is a 32-byte Ed25519 seed persisted as a raw file
//! next to the process. A missing or wrong-sized file is replaced with a
//! fresh seed from the OS RNG, written with owner-only permissions.

use std::fs;
use std::path::Path;

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use tracing::{info, warn};

use crate::constants::ED25519_SEED_SIZE;

/// Keyfile failures are fatal at startup.
#[derive(Debug, Error)]
pub enum KeyfileError {
    #[error("write keyfile {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
}

/// Load the signing key from `path`, or generate and persist a fresh seed if
/// the file is missing or not exactly 32 bytes.
pub fn load_or_create(path: &Path) -> Result<SigningKey, KeyfileError> {
    if let Ok(bytes) = fs::read(path) {
        if bytes.len() == ED25519_SEED_SIZE {
            let mut seed = [0u8; ED25519_SEED_SIZE];
            seed.copy_from_slice(&bytes);
            info!(keyfile = %path.display(), "loaded ed25519 keyfile");
            return Ok(SigningKey::from_bytes(&seed));
        }
        warn!(
            keyfile = %path.display(),
            size = bytes.len(),
            "keyfile has wrong size, regenerating"
        );
    }

    let mut seed = [0u8; ED25519_SEED_SIZE];
    OsRng.fill_bytes(&mut seed);
    write_seed(path, &seed)?;
    info!(keyfile = %path.display(), "generated new ed25519 keyfile");
    Ok(SigningKey::from_bytes(&seed))
}

fn write_seed(path: &Path, seed: &[u8; ED25519_SEED_SIZE]) -> Result<(), KeyfileError> {
    let err = |source| KeyfileError::Write {
        path: path.display().to_string(),
        source,
    };

    #[cfg(unix)]
    {
        use std::fs::OpenOptions;
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .map_err(err)?;
        file.write_all(seed).map_err(err)
    }
    #[cfg(not(unix))]
    {
        fs::write(path, seed).map_err(err)
    }
}
