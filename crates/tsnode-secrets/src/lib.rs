//! Credential storage for tsnode.
//!
//! One document (`credentials.json`) holds the long-lived compute-provider
//! access key pair and the overlay-VPN join token. It is read and written
//! under its own lock and stays owner-read/write only.
//!
//! # Security notes
//! - [`Credentials`] implements a custom `Debug` that never prints a secret.
//! - Every field is zeroed in place on drop (`zeroize`).

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tsnode_persist::{JsonDocument, PersistError};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const ENV_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
pub const ENV_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
pub const ENV_AUTH_KEY: &str = "TS_AUTH_KEY";

// ─────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error("failed to read {field} from input: {source}")]
    Prompt {
        field: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} must not be empty")]
    Empty(&'static str),
}

// ─────────────────────────────────────────────────────────────
// Credentials
// ─────────────────────────────────────────────────────────────

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
    /// Pre-authorised overlay-VPN key used to join new nodes.
    pub tailscale_auth_key: String,
}

/// Custom `Debug` that redacts the secrets.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("aws_access_key_id", &self.aws_access_key_id)
            .field("aws_secret_access_key", &"[REDACTED]")
            .field("tailscale_auth_key", &"[REDACTED]")
            .finish()
    }
}

impl Credentials {
    /// Credentials from environment variables, only when all three are set.
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        Some(Self {
            aws_access_key_id: non_empty(ENV_ACCESS_KEY_ID)?,
            aws_secret_access_key: non_empty(ENV_SECRET_ACCESS_KEY)?,
            tailscale_auth_key: non_empty(ENV_AUTH_KEY)?,
        })
    }

    /// Ask for each field on `output`, one line of `input` per field.
    pub fn prompt<R: BufRead, W: Write>(
        mut input: R,
        mut output: W,
    ) -> Result<Self, CredentialError> {
        let mut ask = |field: &'static str| -> Result<String, CredentialError> {
            let io = |source| CredentialError::Prompt { field, source };
            write!(output, "{field}: ").and_then(|()| output.flush()).map_err(io)?;
            let mut line = String::new();
            input.read_line(&mut line).map_err(io)?;
            let value = line.trim().to_string();
            if value.is_empty() {
                return Err(CredentialError::Empty(field));
            }
            Ok(value)
        };

        Ok(Self {
            aws_access_key_id: ask("aws_access_key_id")?,
            aws_secret_access_key: ask("aws_secret_access_key")?,
            tailscale_auth_key: ask("tailscale_auth_key")?,
        })
    }
}

// ─────────────────────────────────────────────────────────────
// CredentialStore
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CredentialStore {
    doc: JsonDocument<Credentials>,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            doc: JsonDocument::new(path),
        }
    }

    pub fn path(&self) -> &Path {
        self.doc.path()
    }

    pub fn load(&self) -> Result<Option<Credentials>, CredentialError> {
        Ok(self.doc.load()?)
    }

    pub fn save(&self, creds: &Credentials) -> Result<(), CredentialError> {
        self.doc.save(creds)?;
        info!(path = %self.path().display(), "credentials saved");
        Ok(())
    }

    /// Stored credentials, or the result of `init` persisted for next time.
    ///
    /// The document lock is held while `init` runs so two processes asking
    /// at the same time do not both prompt and race on the write.
    pub fn get_or_init(
        &self,
        init: impl FnOnce() -> Result<Credentials, CredentialError>,
    ) -> Result<Credentials, CredentialError> {
        let _guard = self.doc.lock()?;
        if let Some(creds) = self.doc.read()? {
            debug!(path = %self.path().display(), "credentials loaded");
            return Ok(creds);
        }

        let creds = init()?;
        self.doc.write(&creds)?;
        info!(path = %self.path().display(), "credentials saved");
        Ok(creds)
    }

    /// Remove the document. Returns whether one existed.
    pub fn delete(&self) -> Result<bool, CredentialError> {
        let removed = self.doc.remove()?;
        if removed {
            info!(path = %self.path().display(), "credentials deleted");
        }
        Ok(removed)
    }
}

// ─────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────
