// ABOUTME: Seams between the command endpoint and the SSH protocol implementation.
// ABOUTME: Traits for dialing, authenticating, multiplexing and channel I/O, plus the russh backend.

mod client;

pub use client::{RusshAgent, RusshChannel, RusshConnection, RusshDialer, RusshSession};

use crate::address::Target;
use crate::credentials::AgentEndpoint;
use crate::error::Result;
use crate::transport::HostKeyCheck;
use async_trait::async_trait;
use bytes::Bytes;
use russh::keys::{PrivateKey, PublicKey};
use std::net::SocketAddr;
use std::sync::Arc;

/// Opens connections to SSH servers and to authentication agents.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Raw byte stream to a server, before any SSH negotiation.
    type Stream: Send + 'static;
    /// Connection whose key exchange has completed.
    type Session: SecureSession;

    /// Open the raw connection. Failures here are dial failures.
    async fn dial(&self, target: &Target) -> Result<Self::Stream>;

    /// Run key exchange over `stream`. Implementations must call
    /// [`HostKeyCheck::verify`] with the key the server presents and abort
    /// with its error if verification fails.
    async fn secure(&self, stream: Self::Stream, host_key: HostKeyCheck) -> Result<Self::Session>;

    /// Connect to an authentication agent.
    async fn connect_agent(
        &self,
        endpoint: &AgentEndpoint,
    ) -> Result<<Self::Session as SecureSession>::Agent>;
}

/// A secured connection on which user authentication has not finished yet.
///
/// Each method performs one complete credential exchange and reports
/// whether the server accepted it.
#[async_trait]
pub trait SecureSession: Send + 'static {
    type Agent: Agent;
    type Connection: MultiplexedConnection;

    /// Offer a locally held key; signatures are made locally.
    async fn authenticate_publickey(&mut self, user: &str, key: Arc<PrivateKey>) -> Result<bool>;

    /// Offer an agent-held key; signatures are delegated to `agent`.
    async fn authenticate_agent(
        &mut self,
        user: &str,
        key: &PublicKey,
        agent: &mut Self::Agent,
    ) -> Result<bool>;

    async fn authenticate_password(&mut self, user: &str, password: &str) -> Result<bool>;

    /// Start the connection service on an authenticated session.
    fn into_connection(self, username: &str) -> Self::Connection;

    /// Drop the connection without starting the connection service.
    async fn close(self);
}

/// An authentication agent holding private keys on our behalf.
#[async_trait]
pub trait Agent: Send + 'static {
    async fn request_identities(&mut self) -> Result<Vec<PublicKey>>;
}

/// An authenticated connection that can carry many channels at once.
#[async_trait]
pub trait MultiplexedConnection: Send + Sync + 'static {
    type Channel: SessionChannel;

    /// Address of the server at the other end.
    fn peer(&self) -> SocketAddr;

    /// User the connection authenticated as.
    fn username(&self) -> &str;

    /// Open a new `session` channel.
    async fn open_session(&self) -> Result<Self::Channel>;

    /// Close the whole connection, including every channel on it.
    async fn close(&self);
}

/// Something that arrived on a session channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Command stdout.
    Data(Bytes),
    /// Extended data; `ext == 1` is stderr.
    ExtendedData { ext: u32, data: Bytes },
    /// The command will send no more data.
    Eof,
    /// The command exited.
    ExitStatus(u32),
}

/// One open session channel.
#[async_trait]
pub trait SessionChannel: Send + 'static {
    /// Ask the server to run `command` and wait for its answer.
    /// A refusal is reported as [`crate::Error::ExecRejected`].
    async fn exec(&mut self, command: &[u8]) -> Result<()>;

    /// Next event, in arrival order. `None` once the channel is closed.
    async fn next_event(&mut self) -> Option<ChannelEvent>;

    async fn send_data(&mut self, data: Bytes) -> Result<()>;

    async fn send_eof(&mut self) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}
