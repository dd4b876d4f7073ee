//! SSH key management and resolution

use std::env;
use std::path::{Path, PathBuf};

use russh::keys::{PrivateKey, decode_secret_key, load_secret_key};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Where the SSH private key comes from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySource {
    /// Explicit path to key file
    Path(PathBuf),
    /// Base64-encoded key from environment
    Env(String),
    /// OpenSSH private key text embedded in the configuration
    Inline(String),
}

impl KeySource {
    /// Load the private key
    ///
    /// # Errors
    /// Returns `KeyError` if key resolution fails (env not set, invalid base64, bad permissions, etc.)
    pub fn load(&self) -> Result<PrivateKey, KeyError> {
        match self {
            KeySource::Path(path) => {
                validate_key_permissions(path)?;
                debug!(path = %path.display(), "loading SSH key from file");
                load_secret_key(path, None).map_err(|e| KeyError::Invalid(e.to_string()))
            }
            KeySource::Env(var_name) => {
                let encoded =
                    env::var(var_name).map_err(|_| KeyError::EnvNotSet(var_name.clone()))?;
                debug!(var = %var_name, "loading SSH key from environment");
                decode_secret_key(&key_text_from_base64(&encoded)?, None)
                    .map_err(|e| KeyError::Invalid(e.to_string()))
            }
            KeySource::Inline(key_text) => {
                decode_secret_key(key_text, None).map_err(|e| KeyError::Invalid(e.to_string()))
            }
        }
    }
}

/// Key resolution errors
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("environment variable {0} not set")]
    EnvNotSet(String),

    #[error("invalid base64 encoding")]
    InvalidBase64,

    #[error("private key {0} is readable by group or others (chmod 600)")]
    BadPermissions(String),

    #[error("invalid private key: {0}")]
    Invalid(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Decode a base64-wrapped OpenSSH key back to its PEM text
fn key_text_from_base64(encoded: &str) -> Result<String, KeyError> {
    use base64::Engine;

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|_| KeyError::InvalidBase64)?;
    String::from_utf8(bytes).map_err(|_| KeyError::InvalidBase64)
}

fn validate_key_permissions(path: &Path) -> Result<(), KeyError> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::metadata(path).map_err(KeyError::Io)?;
    let mode = metadata.permissions().mode();

    // group and other bits must be clear
    if mode & 0o77 != 0 {
        return Err(KeyError::BadPermissions(path.display().to_string()));
    }

    Ok(())
}
