//! Keyring files on disk.
//!
//! Unlocking runs PBKDF2, so the async variants move it onto the blocking
//! pool.

use std::path::{Path, PathBuf};

use fieldsec_core::Environment;
use fieldsec_crypto::{Keyring, KeyringBuilder, SALT_SIZE};
use zeroize::Zeroizing;

use crate::error::ChannelError;

/// Read and unlock the keyring at `path`.
///
/// # Errors
///
/// - `ChannelError::KeyringFile` if the file cannot be read
/// - `ChannelError::Credential` for a wrong password or a corrupt file
pub fn load_keyring(path: impl AsRef<Path>, password: &str) -> Result<Keyring, ChannelError> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).map_err(|e| file_error(path, &e))?;

    let keyring = Keyring::unlock(&bytes, password)?;
    tracing::debug!(path = %path.display(), entries = keyring.len(), "keyring unlocked");
    Ok(keyring)
}

/// [`load_keyring`] on the blocking pool.
pub async fn load_keyring_async(
    path: impl Into<PathBuf>,
    password: &str,
) -> Result<Keyring, ChannelError> {
    let path = path.into();
    let password = Zeroizing::new(password.to_owned());

    tokio::task::spawn_blocking(move || load_keyring(&path, &password))
        .await
        .map_err(|e| ChannelError::Internal(format!("keyring task failed: {e}")))?
}

/// Seal `builder` under `password` with salts from `env` and write it to
/// `path`, replacing any existing file.
///
/// # Errors
///
/// - `ChannelError::Credential` if sealing fails
/// - `ChannelError::KeyringFile` if the file cannot be written
pub fn save_keyring<E: Environment>(
    path: impl AsRef<Path>,
    builder: &KeyringBuilder,
    password: &str,
    env: &E,
) -> Result<(), ChannelError> {
    let path = path.as_ref();

    let mut kdf_salt = [0u8; SALT_SIZE];
    env.random_bytes(&mut kdf_salt);
    let entry_salts: Vec<[u8; SALT_SIZE]> = (0..builder.len())
        .map(|_| {
            let mut salt = [0u8; SALT_SIZE];
            env.random_bytes(&mut salt);
            salt
        })
        .collect();

    let sealed = builder.seal(password, kdf_salt, &entry_salts)?;
    std::fs::write(path, sealed).map_err(|e| file_error(path, &e))?;

    tracing::info!(path = %path.display(), entries = builder.len(), "keyring written");
    Ok(())
}

fn file_error(path: &Path, err: &std::io::Error) -> ChannelError {
    ChannelError::KeyringFile { path: path.to_path_buf(), reason: err.to_string() }
}
