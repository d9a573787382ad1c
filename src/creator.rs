// ABOUTME: Strategies for obtaining the SSH connection a command runs on.
// ABOUTME: NewConnectionHelper dials and owns one; ExistingConnectionHelper borrows the caller's.

use crate::address::{DEFAULT_PORT, Target};
use crate::completion::Completion;
use crate::credentials::Credentials;
use crate::error::Result;
use crate::known_hosts::{HostKeyPrompt, KnownHosts, KnownHostsFile, TrustOnFirstUse};
use crate::ssh::{Dialer, MultiplexedConnection, SecureSession};
use crate::transport::{CommandTransport, Handshake};
use async_trait::async_trait;
use std::sync::Arc;

/// Produces a ready connection and knows how to release it.
#[async_trait]
pub trait ConnectionCreator: Send + Sync + 'static {
    type Connection: MultiplexedConnection;

    /// Resolve to an authenticated connection ready for channels.
    async fn secure_connection(&self) -> Result<Arc<Self::Connection>>;

    /// Release `connection` after the command channel is done with it.
    async fn cleanup_connection(&self, connection: &Arc<Self::Connection>);
}

/// Runs commands over a connection the caller already owns.
///
/// Cleanup leaves the connection open; its lifetime belongs to the caller.
pub struct ExistingConnectionHelper<C> {
    connection: Arc<C>,
}

impl<C> ExistingConnectionHelper<C> {
    pub fn new(connection: Arc<C>) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl<C: MultiplexedConnection> ConnectionCreator for ExistingConnectionHelper<C> {
    type Connection = C;

    async fn secure_connection(&self) -> Result<Arc<C>> {
        Ok(Arc::clone(&self.connection))
    }

    async fn cleanup_connection(&self, _connection: &Arc<C>) {
        tracing::trace!("leaving caller-owned connection open");
    }
}

/// How to reach and authenticate to a server.
///
/// # Example
///
/// ```no_run
/// use sshcmd::{ConnectionParams, Credentials};
///
/// let params = ConnectionParams::new("example.com", "deploy")
///     .port(2222)
///     .credentials(Credentials::new().password("secret"));
/// ```
#[derive(Clone)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub credentials: Credentials,
    /// Defaults to `~/.ssh/known_hosts`.
    pub known_hosts: Option<Arc<dyn KnownHosts>>,
    /// Consulted for hosts the store does not know. Without one, unknown
    /// hosts are rejected.
    pub ui: Option<Arc<dyn HostKeyPrompt>>,
}

impl std::fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("credentials", &self.credentials)
            .field("known_hosts", &self.known_hosts.is_some())
            .field("ui", &self.ui.is_some())
            .finish()
    }
}

impl ConnectionParams {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            user: user.into(),
            credentials: Credentials::default(),
            known_hosts: None,
            ui: None,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn known_hosts(mut self, known_hosts: impl KnownHosts + 'static) -> Self {
        self.known_hosts = Some(Arc::new(known_hosts));
        self
    }

    pub fn ui(mut self, ui: impl HostKeyPrompt + 'static) -> Self {
        self.ui = Some(Arc::new(ui));
        self
    }

    /// Accept and record the key of any host not seen before.
    pub fn trust_on_first_use(self) -> Self {
        self.ui(TrustOnFirstUse)
    }

    pub fn target(&self) -> Target {
        Target::new(self.host.clone(), self.port)
    }
}

/// Dials a fresh connection per command and closes it afterwards.
pub struct NewConnectionHelper<D> {
    dialer: Arc<D>,
    handshake: Handshake,
}

impl<D: Dialer> NewConnectionHelper<D> {
    /// Fails only if no known hosts store was given and the default one
    /// cannot be located.
    pub fn new(dialer: D, params: ConnectionParams) -> Result<Self> {
        let known_hosts = match params.known_hosts {
            Some(known_hosts) => known_hosts,
            None => Arc::new(KnownHostsFile::user_default()?),
        };
        Ok(Self {
            dialer: Arc::new(dialer),
            handshake: Handshake {
                target: Target::new(params.host, params.port),
                username: params.user,
                credentials: params.credentials,
                known_hosts,
                ui: params.ui,
            },
        })
    }

    pub fn target(&self) -> &Target {
        &self.handshake.target
    }

    pub fn username(&self) -> &str {
        &self.handshake.username
    }
}

#[async_trait]
impl<D: Dialer> ConnectionCreator for NewConnectionHelper<D> {
    type Connection = <D::Session as SecureSession>::Connection;

    async fn secure_connection(&self) -> Result<Arc<Self::Connection>> {
        tracing::debug!(server = %self.handshake.target, user = %self.handshake.username, "dialing");
        let stream = self.dialer.dial(&self.handshake.target).await?;

        let (ready, pending) = Completion::new();
        let transport = CommandTransport::new(ready);
        tokio::spawn(transport.run(Arc::clone(&self.dialer), stream, self.handshake.clone()));

        pending.await
    }

    async fn cleanup_connection(&self, connection: &Arc<Self::Connection>) {
        tracing::debug!(server = %self.handshake.target, "closing connection");
        connection.close().await;
    }
}
