// ABOUTME: Client endpoint that runs one command per connect over SSH.
// ABOUTME: Combines a connection creator with a command line; yields the connected protocol.

use crate::channel::{CommandChannel, SharedProtocol};
use crate::completion::Completion;
use crate::creator::{
    ConnectionCreator, ConnectionParams, ExistingConnectionHelper, NewConnectionHelper,
};
use crate::error::{Error, Result};
use crate::output::{CommandOutput, OutputCollector};
use crate::protocol::ProtocolFactory;
use crate::ssh::{Dialer, MultiplexedConnection};
use crate::address::SessionAddress;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Runs `command` on a server each time [`CommandEndpoint::connect`] is called.
pub struct CommandEndpoint<C> {
    creator: Arc<C>,
    command: Bytes,
}

impl<C> Clone for CommandEndpoint<C> {
    fn clone(&self) -> Self {
        Self {
            creator: Arc::clone(&self.creator),
            command: self.command.clone(),
        }
    }
}

impl<C> std::fmt::Debug for CommandEndpoint<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandEndpoint")
            .field("command", &String::from_utf8_lossy(&self.command))
            .finish_non_exhaustive()
    }
}

impl<D: Dialer> CommandEndpoint<NewConnectionHelper<D>> {
    /// Each connect dials and authenticates a new connection, closed again
    /// when the command's channel closes.
    pub fn new_connection(
        dialer: D,
        params: ConnectionParams,
        command: impl Into<Bytes>,
    ) -> Result<Self> {
        Ok(Self::new(NewConnectionHelper::new(dialer, params)?, command))
    }
}

impl<C: MultiplexedConnection> CommandEndpoint<ExistingConnectionHelper<C>> {
    /// Each connect opens a channel on `connection`, which stays open
    /// afterwards.
    pub fn existing_connection(connection: Arc<C>, command: impl Into<Bytes>) -> Self {
        Self::new(ExistingConnectionHelper::new(connection), command)
    }
}

impl<C: ConnectionCreator> CommandEndpoint<C> {
    pub fn new(creator: C, command: impl Into<Bytes>) -> Self {
        Self {
            creator: Arc::new(creator),
            command: command.into(),
        }
    }

    pub fn command(&self) -> &[u8] {
        &self.command
    }

    pub fn creator(&self) -> &C {
        &self.creator
    }

    /// Run the command and attach a protocol built by `factory`.
    ///
    /// Resolves once the server has accepted the exec request. The protocol
    /// then keeps receiving output until the channel closes. On failure the
    /// channel task has already cleaned up the connection by the time the
    /// error is returned.
    pub async fn connect<F: ProtocolFactory>(&self, factory: F) -> Result<SharedProtocol<F::Protocol>> {
        let connection = self.creator.secure_connection().await?;

        let (connected, pending) = Completion::new();
        let channel = CommandChannel::new(
            Arc::clone(&self.creator),
            connection,
            self.command.clone(),
            factory,
            connected,
        );
        tokio::spawn(channel.run());

        pending.await.inspect_err(|reason| {
            tracing::debug!(error = %reason, "command could not be started");
        })
    }

    /// Run the command to completion with stdin closed and collect its
    /// stdout and exit status.
    pub async fn output(&self) -> Result<CommandOutput> {
        let (done, finished) = oneshot::channel();
        let done = Mutex::new(Some(done));
        self.connect(move |_address: SessionAddress| OutputCollector::new(done.lock().take()))
            .await?;

        finished
            .await
            .map_err(|_| Error::ConnectionLost("command output was never delivered".to_string()))
    }
}
