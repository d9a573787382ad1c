// ABOUTME: Host key verification against a known_hosts trust store.
// ABOUTME: Default store is ~/.ssh/known_hosts; unknown hosts are referred to a prompt.

use crate::error::{Error, Result};
use async_trait::async_trait;
use russh::keys::known_hosts::{check_known_hosts_path, learn_known_hosts_path};
use russh::keys::{HashAlg, PublicKey};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// Asks a human whether to trust a host key nobody has seen before.
#[async_trait]
pub trait HostKeyPrompt: Send + Sync {
    /// Returns `true` to accept.
    async fn prompt(&self, message: &str) -> bool;
}

/// Accepts every unknown host, logging a warning.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrustOnFirstUse;

#[async_trait]
impl HostKeyPrompt for TrustOnFirstUse {
    async fn prompt(&self, message: &str) -> bool {
        tracing::warn!("Trust-On-First-Use: accepting unknown host key. {}", message);
        true
    }
}

/// Declines every unknown host.
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectUnknown;

#[async_trait]
impl HostKeyPrompt for RejectUnknown {
    async fn prompt(&self, _message: &str) -> bool {
        false
    }
}

/// Policy deciding whether a server's host key is trusted.
#[async_trait]
pub trait KnownHosts: Send + Sync {
    /// `Ok(true)` accepts the key. Rejections are errors describing why,
    /// normally [`Error::HostKeyRejected`].
    async fn verify_host_key(
        &self,
        ui: Option<&dyn HostKeyPrompt>,
        hostname: &str,
        port: u16,
        ip: IpAddr,
        key: &PublicKey,
    ) -> Result<bool>;
}

/// OpenSSH `known_hosts` file.
#[derive(Debug, Clone)]
pub struct KnownHostsFile {
    path: PathBuf,
}

impl KnownHostsFile {
    const USER_KNOWN_HOSTS: &'static str = ".ssh/known_hosts";

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The current user's `~/.ssh/known_hosts`.
    pub fn user_default() -> Result<Self> {
        let home = std::env::var("HOME").map_err(|_| {
            Error::InvalidConfig("HOME not set; cannot locate known_hosts".to_string())
        })?;
        Ok(Self::new(Path::new(&home).join(Self::USER_KNOWN_HOSTS)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look `host` up on the blocking pool; the file is read synchronously.
    async fn lookup(&self, host: &str, port: u16, key: &PublicKey) -> Result<bool> {
        let path = self.path.clone();
        let (owned_host, owned_key) = (host.to_string(), key.clone());
        let checked = tokio::task::spawn_blocking(move || {
            check_known_hosts_path(&owned_host, port, &owned_key, &path)
        })
        .await
        .map_err(|e| Error::KnownHosts(format!("known_hosts lookup did not finish: {e}")))?;

        match checked {
            Ok(known) => Ok(known),
            Err(russh::keys::Error::KeyChanged { .. }) => Err(Error::host_key_rejected(
                host,
                format!(
                    "host key differs from the one recorded in {}",
                    self.path.display()
                ),
            )),
            Err(e) => Err(Error::KnownHosts(e.to_string())),
        }
    }

    async fn learn(&self, host: &str, port: u16, key: &PublicKey) {
        let path = self.path.clone();
        let (owned_host, owned_key) = (host.to_string(), key.clone());
        let learned = tokio::task::spawn_blocking(move || {
            learn_known_hosts_path(&owned_host, port, &owned_key, &path)
        })
        .await;

        match learned {
            Ok(Ok(())) => tracing::debug!(%host, "recorded host key in known_hosts"),
            Ok(Err(e)) => tracing::warn!("Failed to save host key to known_hosts: {}", e),
            Err(e) => tracing::warn!("Failed to save host key to known_hosts: {}", e),
        }
    }
}

#[async_trait]
impl KnownHosts for KnownHostsFile {
    async fn verify_host_key(
        &self,
        ui: Option<&dyn HostKeyPrompt>,
        hostname: &str,
        port: u16,
        ip: IpAddr,
        key: &PublicKey,
    ) -> Result<bool> {
        if self.lookup(hostname, port, key).await? {
            return Ok(true);
        }

        let ip_text = ip.to_string();
        if ip_text != hostname && self.lookup(&ip_text, port, key).await? {
            tracing::debug!(host = %hostname, %ip, "host key known by address only");
            return Ok(true);
        }

        let Some(ui) = ui else {
            return Err(Error::host_key_rejected(hostname, "host is not in known_hosts"));
        };

        let message = format!(
            "The authenticity of host '{hostname} ({ip})' can't be established.\n\
             {} key fingerprint is {}.\n\
             Are you sure you want to continue connecting (yes/no)? ",
            key.algorithm().as_str(),
            key.fingerprint(HashAlg::Sha256),
        );
        if !ui.prompt(&message).await {
            return Err(Error::host_key_rejected(hostname, "user declined unknown host key"));
        }

        self.learn(hostname, port, key).await;
        Ok(true)
    }
}
