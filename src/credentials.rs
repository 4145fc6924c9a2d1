//! Broker credentials and the stores they persist in
//!
//! The relay core only ever reads credentials, and it re-reads them on every
//! start so that a reconfiguration takes effect on the next session. Keeping
//! the file safe at rest (encryption, key management) is left to the
//! deployment.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Endpoint URI, principal name and secret for the broker
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    pub endpoint: String,
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(
        endpoint: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            username: username.into(),
            password: password.into(),
        }
    }

    /// Name of the first blank field, if any
    pub fn missing_field(&self) -> Option<&'static str> {
        if self.endpoint.trim().is_empty() {
            Some("endpoint")
        } else if self.username.trim().is_empty() {
            Some("username")
        } else if self.password.is_empty() {
            Some("password")
        } else {
            None
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

pub trait CredentialStore: Send + Sync {
    fn load(&self) -> Result<Credentials>;

    fn save(&self, credentials: &Credentials) -> Result<()>;

    /// Like [`load`](Self::load), but a read failure yields empty credentials
    fn load_or_empty(&self) -> Credentials {
        match self.load() {
            Ok(credentials) => credentials,
            Err(e) => {
                warn!("Credential store unavailable, using empty credentials: {:#}", e);
                Credentials::default()
            }
        }
    }
}

/// TOML file holding `endpoint`, `username` and `password`
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Result<Credentials> {
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read credentials from {:?}", self.path))?;
        let credentials: Credentials =
            toml::from_str(&content).context("failed to parse credentials file")?;
        debug!("Loaded credentials for {} from {:?}", credentials.username, self.path);
        Ok(credentials)
    }

    fn save(&self, credentials: &Credentials) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {:?}", parent))?;
            }
        }

        let content = toml::to_string(credentials).context("failed to encode credentials")?;
        std::fs::write(&self.path, content)
            .with_context(|| format!("failed to write credentials to {:?}", self.path))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
                .with_context(|| format!("failed to restrict permissions on {:?}", self.path))?;
        }

        debug!("Saved credentials for {} to {:?}", credentials.username, self.path);
        Ok(())
    }
}

/// In-process store, for embedding and tests
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    inner: Mutex<Credentials>,
}

impl MemoryCredentialStore {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            inner: Mutex::new(credentials),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> Result<Credentials> {
        let guard = self
            .inner
            .lock()
            .map_err(|_| anyhow::anyhow!("credential store lock poisoned"))?;
        Ok(guard.clone())
    }

    fn save(&self, credentials: &Credentials) -> Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| anyhow::anyhow!("credential store lock poisoned"))?;
        *guard = credentials.clone();
        Ok(())
    }
}
