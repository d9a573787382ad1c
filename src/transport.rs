// ABOUTME: Per-connection setup state machine for new SSH connections.
// ABOUTME: Sequences host key checks, authentication and readiness; classifies setup failures.

use crate::address::Target;
use crate::auth::Authenticator;
use crate::completion::Completion;
use crate::credentials::Credentials;
use crate::error::{Error, Result};
use crate::known_hosts::{HostKeyPrompt, KnownHosts};
use crate::ssh::{Agent, Dialer, MultiplexedConnection, SecureSession};
use crate::state::{ConnectionState, StateCell};
use parking_lot::Mutex;
use russh::keys::PublicKey;
use std::net::IpAddr;
use std::sync::Arc;

/// Everything the handshake needs besides the dialer.
#[derive(Clone)]
pub(crate) struct Handshake {
    pub target: Target,
    pub username: String,
    pub credentials: Credentials,
    pub known_hosts: Arc<dyn KnownHosts>,
    pub ui: Option<Arc<dyn HostKeyPrompt>>,
}

/// Host key verification hook handed to [`Dialer::secure`].
///
/// Moves the connection into [`ConnectionState::Securing`], asks the known
/// hosts policy, and remembers a rejection so that the disconnect which
/// follows can be reported as the rejection itself.
#[derive(Clone)]
pub struct HostKeyCheck {
    state: StateCell,
    failure: Arc<Mutex<Option<Error>>>,
    known_hosts: Arc<dyn KnownHosts>,
    ui: Option<Arc<dyn HostKeyPrompt>>,
    hostname: String,
    port: u16,
}

impl std::fmt::Debug for HostKeyCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostKeyCheck")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("state", &self.state.get())
            .finish()
    }
}

impl HostKeyCheck {
    /// Verify `key`, presented by the server at `ip`.
    ///
    /// Returns `Ok(true)` when trusted. Any rejection is recorded and then
    /// returned as the error, for the SSH layer to abort key exchange with.
    pub async fn verify(&self, ip: IpAddr, key: &PublicKey) -> Result<bool> {
        self.state.advance(ConnectionState::Securing);

        let verdict = self
            .known_hosts
            .verify_host_key(self.ui.as_deref(), &self.hostname, self.port, ip, key)
            .await;

        let failure = match verdict {
            Ok(true) => {
                tracing::debug!(host = %self.hostname, %ip, "host key accepted");
                return Ok(true);
            }
            Ok(false) => Error::host_key_rejected(&self.hostname, "known hosts policy declined the key"),
            Err(e) => e,
        };

        tracing::debug!(host = %self.hostname, %ip, error = %failure, "host key rejected");
        *self.failure.lock() = Some(failure.clone());
        Err(failure)
    }
}

/// Connection service that publishes readiness.
///
/// Its only job is to resolve the connection-ready completion once the
/// authenticated connection can carry channels.
pub struct ConnectionReady<C> {
    state: StateCell,
    ready: Completion<Arc<C>>,
}

impl<C> ConnectionReady<C> {
    /// The connection service has started: mark the connection running and
    /// publish it. If nobody is waiting any more the connection is returned
    /// so the caller can close it.
    ///
    /// # Panics
    ///
    /// Panics if readiness was already settled.
    pub fn service_started(&self, connection: C) -> Option<Arc<C>> {
        self.state.advance(ConnectionState::Running);
        self.ready.succeed(Arc::new(connection)).err()
    }
}

/// Setup state machine for one new connection.
pub struct CommandTransport<C> {
    state: StateCell,
    host_key_failure: Arc<Mutex<Option<Error>>>,
    ready: Completion<Arc<C>>,
}

impl<C> CommandTransport<C> {
    /// Start tracking a raw connection. `ready` is settled exactly once:
    /// with the connection, or with the reason setup failed.
    pub fn new(ready: Completion<Arc<C>>) -> Self {
        Self {
            state: StateCell::new(),
            host_key_failure: Arc::new(Mutex::new(None)),
            ready,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn host_key_failure(&self) -> Option<Error> {
        self.host_key_failure.lock().clone()
    }

    pub fn host_key_check(
        &self,
        known_hosts: Arc<dyn KnownHosts>,
        ui: Option<Arc<dyn HostKeyPrompt>>,
        hostname: &str,
        port: u16,
    ) -> HostKeyCheck {
        HostKeyCheck {
            state: self.state.clone(),
            failure: Arc::clone(&self.host_key_failure),
            known_hosts,
            ui,
            hostname: hostname.to_string(),
            port,
        }
    }

    /// Key exchange finished; authentication starts.
    pub fn connection_secure(&self) {
        self.state.advance(ConnectionState::Authenticating);
    }

    pub fn connection_ready(&self) -> ConnectionReady<C> {
        ConnectionReady {
            state: self.state.clone(),
            ready: self.ready.clone(),
        }
    }

    /// The underlying connection went away.
    ///
    /// Ignored once running or once readiness has been settled. Otherwise
    /// the readiness completion fails with the classified reason.
    pub fn connection_lost(&self, reason: Error) {
        let state = self.state.get();
        if state == ConnectionState::Running || self.ready.is_settled() {
            tracing::debug!(%state, reason = %reason, "connection lost after setup finished");
            return;
        }

        let reason = classify_disconnect(state, self.host_key_failure(), reason);
        tracing::debug!(%state, error = %reason, "connection setup failed");
        if let Err(reason) = self.ready.fail(reason) {
            tracing::warn!(error = %reason, "connection setup failed with nobody waiting");
        }
    }
}

/// Attribute a disconnect during setup to the step that caused it.
fn classify_disconnect(
    state: ConnectionState,
    host_key_failure: Option<Error>,
    reason: Error,
) -> Error {
    match (state, host_key_failure) {
        (ConnectionState::Securing, Some(failure)) => failure,
        (ConnectionState::Authenticating, _) => Error::AuthenticationFailed,
        _ => reason,
    }
}

impl<C: MultiplexedConnection> CommandTransport<C> {
    /// Drive a freshly dialed connection through setup, settling readiness.
    pub(crate) async fn run<D>(self, dialer: Arc<D>, stream: D::Stream, handshake: Handshake)
    where
        D: Dialer,
        D::Session: SecureSession<Connection = C>,
    {
        let check = self.host_key_check(
            Arc::clone(&handshake.known_hosts),
            handshake.ui.clone(),
            &handshake.target.host,
            handshake.target.port,
        );

        let mut session = match dialer.secure(stream, check).await {
            Ok(session) => session,
            Err(reason) => return self.connection_lost(reason),
        };
        self.connection_secure();

        if let Err(reason) = self.authenticate(dialer.as_ref(), &mut session, &handshake).await {
            session.close().await;
            return self.connection_lost(reason);
        }

        let connection = session.into_connection(&handshake.username);
        if let Some(unclaimed) = self.connection_ready().service_started(connection) {
            tracing::debug!(server = %handshake.target, "connection ready but nobody is waiting; closing");
            unclaimed.close().await;
        }
    }

    async fn authenticate<D>(
        &self,
        dialer: &D,
        session: &mut D::Session,
        handshake: &Handshake,
    ) -> Result<()>
    where
        D: Dialer,
    {
        let mut authenticator = Authenticator::new(
            handshake.username.clone(),
            handshake.credentials.keys.clone(),
            handshake.credentials.password.clone(),
            self.state.clone(),
        );

        if let Some(endpoint) = &handshake.credentials.agent {
            match dialer.connect_agent(endpoint).await {
                Ok(mut agent) => match agent.request_identities().await {
                    Ok(identities) => {
                        tracing::debug!(count = identities.len(), "using agent identities");
                        authenticator.attach_agent(agent, identities);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to list agent keys; continuing without agent");
                    }
                },
                Err(e) => {
                    tracing::warn!(error = %e, "SSH agent unavailable; continuing without agent");
                }
            }
        }

        authenticator.authenticate(session).await
    }
}
