// ABOUTME: russh-backed implementation of the dialer, session, agent and channel traits.
// ABOUTME: Translates russh handles and channel messages into the endpoint's vocabulary.

use super::{Agent, ChannelEvent, Dialer, MultiplexedConnection, SecureSession, SessionChannel};
use crate::address::Target;
use crate::credentials::AgentEndpoint;
use crate::error::{Error, Result};
use crate::transport::HostKeyCheck;
use async_trait::async_trait;
use bytes::Bytes;
use russh::client::{self, AuthResult, Config, Handle, Msg};
use russh::keys::agent::client::AgentClient;
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg, PublicKey, ssh_key};
use russh::{AgentAuthError, Channel, ChannelMsg, Disconnect};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpStream, UnixStream};

const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Connects to servers over TCP and runs the SSH handshake with russh.
#[derive(Debug, Clone)]
pub struct RusshDialer {
    inactivity_timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
}

impl Default for RusshDialer {
    fn default() -> Self {
        Self {
            inactivity_timeout: Some(DEFAULT_INACTIVITY_TIMEOUT),
            connect_timeout: None,
        }
    }
}

impl RusshDialer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Give up on the TCP connect after `timeout`.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Drop connections idle for longer than `timeout`.
    pub fn inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = Some(timeout);
        self
    }

    fn client_config(&self) -> Arc<Config> {
        Arc::new(Config {
            inactivity_timeout: self.inactivity_timeout,
            ..Default::default()
        })
    }
}

/// russh client handler; defers host key decisions to the endpoint.
pub struct ClientHandler {
    peer: SocketAddr,
    host_key: HostKeyCheck,
}

impl client::Handler for ClientHandler {
    type Error = Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        self.host_key.verify(self.peer.ip(), server_public_key).await
    }
}

#[async_trait]
impl Dialer for RusshDialer {
    type Stream = TcpStream;
    type Session = RusshSession;

    async fn dial(&self, target: &Target) -> Result<TcpStream> {
        let connect = TcpStream::connect((target.host.as_str(), target.port));
        let stream = match self.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, connect).await.map_err(|_| {
                Error::Connection(format!("timed out connecting to {target} after {timeout:?}"))
            })?,
            None => connect.await,
        };

        stream.map_err(|e| {
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                Error::Connection(format!("connection refused to {target}"))
            } else {
                Error::Connection(format!("{target}: {e}"))
            }
        })
    }

    async fn secure(&self, stream: TcpStream, host_key: HostKeyCheck) -> Result<RusshSession> {
        let peer = stream.peer_addr()?;
        let handler = ClientHandler { peer, host_key };
        let handle = client::connect_stream(self.client_config(), stream, handler).await?;
        Ok(RusshSession { handle, peer })
    }

    async fn connect_agent(&self, endpoint: &AgentEndpoint) -> Result<RusshAgent> {
        let client = match endpoint {
            AgentEndpoint::Env => AgentClient::connect_env().await,
            AgentEndpoint::Socket(path) => AgentClient::connect_uds(path).await,
        }
        .map_err(|e| Error::AgentUnavailable(e.to_string()))?;
        Ok(RusshAgent { client })
    }
}

/// Connection to a local SSH agent over its Unix socket.
pub struct RusshAgent {
    client: AgentClient<UnixStream>,
}

#[async_trait]
impl Agent for RusshAgent {
    async fn request_identities(&mut self) -> Result<Vec<PublicKey>> {
        self.client
            .request_identities()
            .await
            .map_err(|e| Error::AgentUnavailable(format!("failed to list agent keys: {}", e)))
    }
}

/// A russh connection between key exchange and the connection service.
pub struct RusshSession {
    handle: Handle<ClientHandler>,
    peer: SocketAddr,
}

#[async_trait]
impl SecureSession for RusshSession {
    type Agent = RusshAgent;
    type Connection = RusshConnection;

    async fn authenticate_publickey(&mut self, user: &str, key: Arc<PrivateKey>) -> Result<bool> {
        let hash_alg = self.handle.best_supported_rsa_hash().await?.flatten();
        let result = self
            .handle
            .authenticate_publickey(user, PrivateKeyWithHashAlg::new(key, hash_alg))
            .await?;
        Ok(result.success())
    }

    async fn authenticate_agent(
        &mut self,
        user: &str,
        key: &PublicKey,
        agent: &mut RusshAgent,
    ) -> Result<bool> {
        let hash_alg = self.handle.best_supported_rsa_hash().await?.flatten();
        let result = self
            .handle
            .authenticate_publickey_with(user, key.clone(), hash_alg, &mut agent.client)
            .await;
        agent_auth_outcome(result)
    }

    async fn authenticate_password(&mut self, user: &str, password: &str) -> Result<bool> {
        let result = self.handle.authenticate_password(user, password).await?;
        Ok(result.success())
    }

    fn into_connection(self, username: &str) -> RusshConnection {
        RusshConnection {
            handle: self.handle,
            peer: self.peer,
            username: username.to_string(),
        }
    }

    async fn close(self) {
        disconnect(&self.handle).await;
    }
}

/// A key the agent could not sign with is just a refused offer; losing the
/// connection's event loop is not.
fn agent_auth_outcome(result: std::result::Result<AuthResult, AgentAuthError>) -> Result<bool> {
    match result {
        Ok(result) => Ok(result.success()),
        Err(AgentAuthError::Key(e)) => {
            tracing::warn!(error = %e, "agent could not sign the authentication request");
            Ok(false)
        }
        Err(AgentAuthError::Send(e)) => Err(Error::ConnectionLost(e.to_string())),
    }
}

async fn disconnect(handle: &Handle<ClientHandler>) {
    if let Err(e) = handle.disconnect(Disconnect::ByApplication, "", "en").await {
        tracing::debug!(error = %e, "disconnect failed; connection already gone");
    }
}

/// An authenticated russh connection.
pub struct RusshConnection {
    handle: Handle<ClientHandler>,
    peer: SocketAddr,
    username: String,
}

impl std::fmt::Debug for RusshConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RusshConnection")
            .field("peer", &self.peer)
            .field("username", &self.username)
            .field("handle", &"<russh::Handle>")
            .finish()
    }
}

#[async_trait]
impl MultiplexedConnection for RusshConnection {
    type Channel = RusshChannel;

    fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn username(&self) -> &str {
        &self.username
    }

    async fn open_session(&self) -> Result<RusshChannel> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| Error::ChannelOpenFailed(e.to_string()))?;
        Ok(RusshChannel {
            channel,
            early: VecDeque::new(),
        })
    }

    async fn close(&self) {
        disconnect(&self.handle).await;
    }
}

/// A russh session channel.
pub struct RusshChannel {
    channel: Channel<Msg>,
    /// Events that arrived while waiting for the exec reply.
    early: VecDeque<ChannelEvent>,
}

fn translate(msg: ChannelMsg) -> Option<ChannelEvent> {
    match msg {
        ChannelMsg::Data { data } => Some(ChannelEvent::Data(Bytes::copy_from_slice(&data))),
        ChannelMsg::ExtendedData { data, ext } => Some(ChannelEvent::ExtendedData {
            ext,
            data: Bytes::copy_from_slice(&data),
        }),
        ChannelMsg::Eof => Some(ChannelEvent::Eof),
        ChannelMsg::ExitStatus { exit_status } => Some(ChannelEvent::ExitStatus(exit_status)),
        _ => None,
    }
}

#[async_trait]
impl SessionChannel for RusshChannel {
    async fn exec(&mut self, command: &[u8]) -> Result<()> {
        self.channel.exec(true, command).await?;
        loop {
            match self.channel.wait().await {
                Some(ChannelMsg::Success) => return Ok(()),
                Some(ChannelMsg::Failure) => {
                    return Err(Error::ExecRejected("exec request denied".to_string()));
                }
                Some(ChannelMsg::Close) | None => {
                    return Err(Error::ExecRejected(
                        "channel closed before the exec request was answered".to_string(),
                    ));
                }
                Some(msg) => {
                    if let Some(event) = translate(msg) {
                        self.early.push_back(event);
                    }
                }
            }
        }
    }

    async fn next_event(&mut self) -> Option<ChannelEvent> {
        if let Some(event) = self.early.pop_front() {
            return Some(event);
        }
        loop {
            match self.channel.wait().await {
                Some(ChannelMsg::Close) | None => return None,
                Some(msg) => {
                    if let Some(event) = translate(msg) {
                        return Some(event);
                    }
                }
            }
        }
    }

    async fn send_data(&mut self, data: Bytes) -> Result<()> {
        self.channel.data(&data[..]).await?;
        Ok(())
    }

    async fn send_eof(&mut self) -> Result<()> {
        self.channel.eof().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.channel.close().await?;
        Ok(())
    }
}
