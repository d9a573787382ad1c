// ABOUTME: In-memory SSH server implementing the dialer, session and channel traits.
// ABOUTME: Tests script accepted credentials and command output, then inspect what happened.

use super::keys;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use russh::keys::{PrivateKey, PublicKey};
use sshcmd::ssh::{
    Agent, ChannelEvent, Dialer, MultiplexedConnection, SecureSession, SessionChannel,
};
use sshcmd::transport::HostKeyCheck;
use sshcmd::{AgentEndpoint, Error, HostKeyPrompt, KnownHosts, Result, Target};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Notify, mpsc};

pub const PEER: &str = "192.0.2.10:22";

pub fn peer() -> SocketAddr {
    PEER.parse().unwrap()
}

/// A credential the server was offered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt {
    Agent(PublicKey),
    PublicKey(PublicKey),
    Password(String),
}

/// Something the client sent on a command channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Data(Bytes),
    Eof,
    Close,
}

#[derive(Default)]
struct State {
    refuse_dial: bool,
    drop_after_kex: bool,
    accepted_keys: Vec<PublicKey>,
    password: Option<String>,
    agent: Option<Vec<PublicKey>>,
    channel_open_fails: bool,
    exec_rejected: bool,
    exec_gate: Option<Arc<Notify>>,
    exec_requests: usize,
    attempts: Vec<Attempt>,
    dials: usize,
    transports_dropped: usize,
    sessions_closed: usize,
    connections_closed: usize,
    channels_opened: usize,
}

#[derive(Clone)]
pub struct FakeServer {
    state: Arc<Mutex<State>>,
    launched_tx: mpsc::UnboundedSender<RemoteCommand>,
    launched_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<RemoteCommand>>>,
}

impl FakeServer {
    pub fn new() -> Self {
        let (launched_tx, launched_rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(Mutex::new(State::default())),
            launched_tx,
            launched_rx: Arc::new(tokio::sync::Mutex::new(launched_rx)),
        }
    }

    pub fn accept_key(self, pem: &str) -> Self {
        self.state.lock().accepted_keys.push(keys::public(pem));
        self
    }

    pub fn accept_password(self, password: &str) -> Self {
        self.state.lock().password = Some(password.to_string());
        self
    }

    /// Run an agent holding `identities`.
    pub fn with_agent(self, identities: &[&str]) -> Self {
        self.state.lock().agent = Some(identities.iter().map(|pem| keys::public(pem)).collect());
        self
    }

    pub fn refuse_dial(self) -> Self {
        self.state.lock().refuse_dial = true;
        self
    }

    /// Reset the connection right after key exchange.
    pub fn drop_after_kex(self) -> Self {
        self.state.lock().drop_after_kex = true;
        self
    }

    pub fn fail_channel_open(self) -> Self {
        self.state.lock().channel_open_fails = true;
        self
    }

    pub fn reject_exec(self) -> Self {
        self.state.lock().exec_rejected = true;
        self
    }

    /// Hold every exec request until [`FakeServer::release_exec`].
    pub fn gate_exec(self) -> Self {
        self.state.lock().exec_gate = Some(Arc::new(Notify::new()));
        self
    }

    pub fn release_exec(&self) {
        if let Some(gate) = &self.state.lock().exec_gate {
            gate.notify_one();
        }
    }

    pub fn dialer(&self) -> FakeDialer {
        FakeDialer {
            server: self.clone(),
        }
    }

    /// A secured session on which nobody has authenticated yet.
    pub fn session(&self) -> FakeSession {
        FakeSession {
            server: self.clone(),
            stream: FakeStream {
                server: self.clone(),
            },
        }
    }

    /// An already authenticated connection, as a caller would own it.
    pub fn connection(&self, username: &str) -> FakeConnection {
        self.session().into_connection(username)
    }

    pub fn attempts(&self) -> Vec<Attempt> {
        self.state.lock().attempts.clone()
    }

    pub fn dials(&self) -> usize {
        self.state.lock().dials
    }

    pub fn transports_dropped(&self) -> usize {
        self.state.lock().transports_dropped
    }

    pub fn sessions_closed(&self) -> usize {
        self.state.lock().sessions_closed
    }

    pub fn connections_closed(&self) -> usize {
        self.state.lock().connections_closed
    }

    pub fn channels_opened(&self) -> usize {
        self.state.lock().channels_opened
    }

    pub fn exec_requests(&self) -> usize {
        self.state.lock().exec_requests
    }

    /// The next command a client started.
    pub async fn next_command(&self) -> RemoteCommand {
        let mut launched = self.launched_rx.lock().await;
        super::within("a command to be started", launched.recv())
            .await
            .expect("launch queue closed")
    }

    fn offer(&self, attempt: Attempt) -> bool {
        let mut state = self.state.lock();
        let accepted = match &attempt {
            Attempt::Agent(key) | Attempt::PublicKey(key) => state.accepted_keys.contains(key),
            Attempt::Password(password) => state.password.as_ref() == Some(password),
        };
        state.attempts.push(attempt);
        accepted
    }
}

/// Raw connection; counts itself closed when dropped.
pub struct FakeStream {
    server: FakeServer,
}

impl Drop for FakeStream {
    fn drop(&mut self) {
        self.server.state.lock().transports_dropped += 1;
    }
}

pub struct FakeDialer {
    server: FakeServer,
}

#[async_trait]
impl Dialer for FakeDialer {
    type Stream = FakeStream;
    type Session = FakeSession;

    async fn dial(&self, target: &Target) -> Result<FakeStream> {
        let refuse = {
            let mut state = self.server.state.lock();
            state.dials += 1;
            state.refuse_dial
        };
        if refuse {
            return Err(Error::Connection(format!("connection refused to {target}")));
        }
        Ok(FakeStream {
            server: self.server.clone(),
        })
    }

    async fn secure(&self, stream: FakeStream, host_key: HostKeyCheck) -> Result<FakeSession> {
        if let Err(e) = host_key.verify(peer().ip(), &keys::public(keys::HOST)).await {
            drop(stream);
            return Err(Error::ConnectionLost(format!("key exchange aborted: {e}")));
        }
        let reset = self.server.state.lock().drop_after_kex;
        if reset {
            drop(stream);
            return Err(Error::ConnectionLost("connection reset by peer".to_string()));
        }
        Ok(FakeSession {
            server: self.server.clone(),
            stream,
        })
    }

    async fn connect_agent(&self, endpoint: &AgentEndpoint) -> Result<FakeAgent> {
        let identities = self.server.state.lock().agent.clone();
        match identities {
            Some(identities) => Ok(FakeAgent::new(identities)),
            None => Err(Error::AgentUnavailable(format!("no agent at {endpoint:?}"))),
        }
    }
}

pub struct FakeAgent {
    identities: Vec<PublicKey>,
}

impl FakeAgent {
    pub fn new(identities: Vec<PublicKey>) -> Self {
        Self { identities }
    }
}

#[async_trait]
impl Agent for FakeAgent {
    async fn request_identities(&mut self) -> Result<Vec<PublicKey>> {
        Ok(self.identities.clone())
    }
}

pub struct FakeSession {
    server: FakeServer,
    stream: FakeStream,
}

#[async_trait]
impl SecureSession for FakeSession {
    type Agent = FakeAgent;
    type Connection = FakeConnection;

    async fn authenticate_publickey(&mut self, _user: &str, key: Arc<PrivateKey>) -> Result<bool> {
        Ok(self.server.offer(Attempt::PublicKey(key.public_key().clone())))
    }

    async fn authenticate_agent(
        &mut self,
        _user: &str,
        key: &PublicKey,
        agent: &mut FakeAgent,
    ) -> Result<bool> {
        let held = agent.identities.contains(key);
        Ok(self.server.offer(Attempt::Agent(key.clone())) && held)
    }

    async fn authenticate_password(&mut self, _user: &str, password: &str) -> Result<bool> {
        Ok(self.server.offer(Attempt::Password(password.to_string())))
    }

    fn into_connection(self, username: &str) -> FakeConnection {
        FakeConnection {
            server: self.server,
            username: username.to_string(),
            _stream: self.stream,
        }
    }

    async fn close(self) {
        self.server.state.lock().sessions_closed += 1;
    }
}

pub struct FakeConnection {
    server: FakeServer,
    username: String,
    _stream: FakeStream,
}

impl std::fmt::Debug for FakeConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeConnection")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl MultiplexedConnection for FakeConnection {
    type Channel = FakeChannel;

    fn peer(&self) -> SocketAddr {
        peer()
    }

    fn username(&self) -> &str {
        &self.username
    }

    async fn open_session(&self) -> Result<FakeChannel> {
        let fails = {
            let mut state = self.server.state.lock();
            if !state.channel_open_fails {
                state.channels_opened += 1;
            }
            state.channel_open_fails
        };
        if fails {
            return Err(Error::ChannelOpenFailed(
                "administratively prohibited".to_string(),
            ));
        }
        Ok(FakeChannel {
            server: self.server.clone(),
            events: None,
            received: Arc::new(Mutex::new(Vec::new())),
        })
    }

    async fn close(&self) {
        self.server.state.lock().connections_closed += 1;
    }
}

pub struct FakeChannel {
    server: FakeServer,
    events: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
    received: Arc<Mutex<Vec<Received>>>,
}

#[async_trait]
impl SessionChannel for FakeChannel {
    async fn exec(&mut self, command: &[u8]) -> Result<()> {
        let (gate, rejected) = {
            let mut state = self.server.state.lock();
            state.exec_requests += 1;
            (state.exec_gate.clone(), state.exec_rejected)
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if rejected {
            return Err(Error::ExecRejected("exec request denied".to_string()));
        }

        let (events, receiver) = mpsc::unbounded_channel();
        self.events = Some(receiver);
        let remote = RemoteCommand {
            command: Bytes::copy_from_slice(command),
            events,
            received: Arc::clone(&self.received),
        };
        self.server
            .launched_tx
            .send(remote)
            .expect("launch queue closed");
        Ok(())
    }

    async fn next_event(&mut self) -> Option<ChannelEvent> {
        match self.events.as_mut() {
            Some(events) => events.recv().await,
            None => None,
        }
    }

    async fn send_data(&mut self, data: Bytes) -> Result<()> {
        self.received.lock().push(Received::Data(data));
        Ok(())
    }

    async fn send_eof(&mut self) -> Result<()> {
        self.received.lock().push(Received::Eof);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.received.lock().push(Received::Close);
        self.events = None;
        Ok(())
    }
}

/// Server side of one running command. Dropping it closes the channel.
pub struct RemoteCommand {
    pub command: Bytes,
    events: mpsc::UnboundedSender<ChannelEvent>,
    received: Arc<Mutex<Vec<Received>>>,
}

impl RemoteCommand {
    pub fn command_line(&self) -> String {
        String::from_utf8_lossy(&self.command).into_owned()
    }

    pub fn stdout(&self, data: &[u8]) {
        self.send(ChannelEvent::Data(Bytes::copy_from_slice(data)));
    }

    pub fn stderr(&self, data: &[u8]) {
        self.send(ChannelEvent::ExtendedData {
            ext: 1,
            data: Bytes::copy_from_slice(data),
        });
    }

    pub fn exit(&self, status: u32) {
        self.send(ChannelEvent::ExitStatus(status));
    }

    pub fn eof(&self) {
        self.send(ChannelEvent::Eof);
    }

    pub fn close(self) {}

    /// What the client has sent so far.
    pub fn received(&self) -> Vec<Received> {
        self.received.lock().clone()
    }

    fn send(&self, event: ChannelEvent) {
        // The client may already have closed its end.
        let _ = self.events.send(event);
    }
}

/// Trusts every host key.
pub struct TrustAll;

#[async_trait]
impl KnownHosts for TrustAll {
    async fn verify_host_key(
        &self,
        _ui: Option<&dyn HostKeyPrompt>,
        _hostname: &str,
        _port: u16,
        _ip: IpAddr,
        _key: &PublicKey,
    ) -> Result<bool> {
        Ok(true)
    }
}

/// Rejects every host key as changed.
pub struct RejectAll;

#[async_trait]
impl KnownHosts for RejectAll {
    async fn verify_host_key(
        &self,
        _ui: Option<&dyn HostKeyPrompt>,
        hostname: &str,
        _port: u16,
        _ip: IpAddr,
        _key: &PublicKey,
    ) -> Result<bool> {
        Err(Error::HostKeyRejected {
            host: hostname.to_string(),
            reason: "host key changed".to_string(),
        })
    }
}

/// Trusts every host key once released; until then each check waits.
#[derive(Clone, Default)]
pub struct GatedTrust {
    gate: Arc<Notify>,
    waiting: Arc<AtomicUsize>,
}

impl GatedTrust {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks that have started.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn release(&self) {
        self.gate.notify_one();
    }
}

#[async_trait]
impl KnownHosts for GatedTrust {
    async fn verify_host_key(
        &self,
        _ui: Option<&dyn HostKeyPrompt>,
        _hostname: &str,
        _port: u16,
        _ip: IpAddr,
        _key: &PublicKey,
    ) -> Result<bool> {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        self.gate.notified().await;
        Ok(true)
    }
}
