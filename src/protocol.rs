// ABOUTME: The caller's side of a running command: protocol trait, factory and channel transport.
// ABOUTME: Protocols receive stdout and exit status; they write stdin through ChannelTransport.

use crate::address::SessionAddress;
use crate::error::{Error, Result};
use bytes::Bytes;
use std::net::SocketAddr;
use tokio::sync::mpsc;

/// Consumer of a remote command's output.
///
/// Calls arrive in order: `make_connection` once, then any number of
/// `data_received`/`exit_status_received`, then `connection_lost` once.
pub trait Protocol: Send + 'static {
    fn make_connection(&mut self, transport: ChannelTransport);

    /// Bytes the command wrote to stdout.
    fn data_received(&mut self, data: Bytes);

    fn exit_status_received(&mut self, _status: u32) {}

    /// The channel is gone. A normal end of command is
    /// [`Error::ConnectionDone`].
    fn connection_lost(&mut self, reason: Error);
}

/// Builds the protocol for one command channel.
pub trait ProtocolFactory: Send + 'static {
    type Protocol: Protocol;

    fn build_protocol(&self, address: SessionAddress) -> Self::Protocol;
}

impl<F, P> ProtocolFactory for F
where
    F: Fn(SessionAddress) -> P + Send + 'static,
    P: Protocol,
{
    type Protocol = P;

    fn build_protocol(&self, address: SessionAddress) -> P {
        self(address)
    }
}

#[derive(Debug)]
pub(crate) enum Outgoing {
    Data(Bytes),
    Eof,
    Close,
}

/// Write side of a command channel, handed to the protocol.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    address: SessionAddress,
    outgoing: mpsc::UnboundedSender<Outgoing>,
}

impl ChannelTransport {
    pub(crate) fn new(address: SessionAddress) -> (Self, mpsc::UnboundedReceiver<Outgoing>) {
        let (outgoing, receiver) = mpsc::unbounded_channel();
        (Self { address, outgoing }, receiver)
    }

    pub fn address(&self) -> &SessionAddress {
        &self.address
    }

    pub fn peer(&self) -> SocketAddr {
        self.address.server()
    }

    /// Send bytes to the command's stdin.
    pub fn write(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send(Outgoing::Data(data.into()))
    }

    /// Close the command's stdin.
    pub fn write_eof(&self) -> Result<()> {
        self.send(Outgoing::Eof)
    }

    /// Close the channel. The protocol still gets `connection_lost` once the
    /// server confirms.
    pub fn lose_connection(&self) {
        if self.send(Outgoing::Close).is_err() {
            tracing::trace!("lose_connection on a channel that already ended");
        }
    }

    fn send(&self, item: Outgoing) -> Result<()> {
        self.outgoing
            .send(item)
            .map_err(|_| Error::ConnectionDone("ssh channel closed".to_string()))
    }
}
