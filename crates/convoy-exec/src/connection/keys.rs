//! SSH key management and resolution

use std::path::{Path, PathBuf};

use convoy_api::{PrivateKey, TransportOptions};
use russh::keys::{self, PrivateKey as SshPrivateKey};
use tracing::{debug, warn};

const DEFAULT_KEY_NAMES: [&str; 3] = ["id_ed25519", "id_ecdsa", "id_rsa"];

/// SSH key resolution strategy
#[derive(Debug, Clone)]
pub enum KeySource {
    /// Explicit path to key file
    Path(PathBuf),
    /// Key material given inline in the target config
    Data(String),
    /// Whatever usable keys sit in `~/.ssh`
    Default,
}

impl KeySource {
    #[must_use]
    pub fn from_options(options: &TransportOptions) -> Self {
        match &options.private_key {
            Some(PrivateKey::Path(path)) => KeySource::Path(expand_home(path)),
            Some(PrivateKey::Data { key_data }) => KeySource::Data(key_data.clone()),
            None => KeySource::Default,
        }
    }

    /// Load the keys to offer, in order
    ///
    /// Default keys that fail to load (encrypted, unsupported) are skipped.
    ///
    /// # Errors
    /// Returns `KeyError` if an explicitly configured key cannot be used.
    pub fn resolve(&self) -> Result<Vec<SshPrivateKey>, KeyError> {
        match self {
            KeySource::Path(path) => {
                if !path.exists() {
                    return Err(KeyError::NotFound(path.display().to_string()));
                }
                validate_key_permissions(path)?;
                let key = keys::load_secret_key(path, None)
                    .map_err(|e| KeyError::Invalid(e.to_string()))?;
                Ok(vec![key])
            }
            KeySource::Data(data) => {
                let key = keys::decode_secret_key(data, None)
                    .map_err(|e| KeyError::Invalid(e.to_string()))?;
                Ok(vec![key])
            }
            KeySource::Default => {
                let Some(ssh_dir) = dirs::home_dir().map(|home| home.join(".ssh")) else {
                    return Ok(Vec::new());
                };
                let found = DEFAULT_KEY_NAMES
                    .iter()
                    .map(|name| ssh_dir.join(name))
                    .filter(|path| path.exists())
                    .filter_map(|path| match keys::load_secret_key(&path, None) {
                        Ok(key) => Some(key),
                        Err(e) => {
                            debug!(path = %path.display(), error = %e, "skipping default key");
                            None
                        }
                    })
                    .collect();
                Ok(found)
            }
        }
    }
}

/// Key resolution errors
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("key file permissions too open: {0} (should be 600)")]
    BadPermissions(String),

    #[error("key file not found: {0}")]
    NotFound(String),

    #[error("invalid private key: {0}")]
    Invalid(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

#[cfg(unix)]
fn validate_key_permissions(path: &Path) -> Result<(), KeyError> {
    use std::os::unix::fs::PermissionsExt;

    let mode = std::fs::metadata(path)?.permissions().mode();

    // group and other bits must be clear
    if mode & 0o77 != 0 {
        warn!(path = %path.display(), mode = format!("{mode:o}"), "private key readable by others");
        return Err(KeyError::BadPermissions(path.display().to_string()));
    }

    Ok(())
}

#[cfg(not(unix))]
fn validate_key_permissions(_path: &Path) -> Result<(), KeyError> {
    Ok(())
}
