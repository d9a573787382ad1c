// ABOUTME: Credentials offered during user authentication.
// ABOUTME: Local private keys, an optional password, and an optional agent endpoint.

use crate::error::{Error, Result};
use russh::keys::{PrivateKey, load_secret_key};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Where to find an authentication agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEndpoint {
    /// The socket named by `$SSH_AUTH_SOCK`.
    Env,
    /// An explicit agent socket.
    Socket(PathBuf),
}

/// Everything that may be offered to a server during authentication.
///
/// Offered in order: agent keys, then `keys` front to back, then `password`.
#[derive(Clone, Default)]
pub struct Credentials {
    pub keys: Vec<Arc<PrivateKey>>,
    pub password: Option<String>,
    pub agent: Option<AgentEndpoint>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("keys", &self.keys.len())
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("agent", &self.agent)
            .finish()
    }
}

impl Credentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(mut self, key: PrivateKey) -> Self {
        self.keys.push(Arc::new(key));
        self
    }

    /// Load a private key from disk and append it to the key list.
    pub fn key_file(mut self, path: impl AsRef<Path>, passphrase: Option<&str>) -> Result<Self> {
        let path = path.as_ref();
        let key = load_secret_key(path, passphrase).map_err(|e| Error::KeyLoadFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        self.keys.push(Arc::new(key));
        Ok(self)
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn agent(mut self, endpoint: AgentEndpoint) -> Self {
        self.agent = Some(endpoint);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.password.is_none() && self.agent.is_none()
    }
}
