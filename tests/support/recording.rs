// ABOUTME: Protocol that records every callback it receives.
// ABOUTME: Lets tests assert on ordering and content of delivered events.

use bytes::Bytes;
use sshcmd::{ChannelTransport, Error, ErrorKind, Protocol, SessionAddress};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connected(SessionAddress),
    Data(Bytes),
    ExitStatus(u32),
    Lost(ErrorKind),
}

#[derive(Debug, Default)]
pub struct RecordingProtocol {
    pub transport: Option<ChannelTransport>,
    pub events: Vec<Event>,
}

impl RecordingProtocol {
    pub fn factory() -> impl Fn(SessionAddress) -> RecordingProtocol + Send + 'static {
        |_address: SessionAddress| RecordingProtocol::default()
    }

    /// All stdout received, concatenated.
    pub fn stdout(&self) -> Vec<u8> {
        self.events
            .iter()
            .filter_map(|event| match event {
                Event::Data(data) => Some(data.as_ref()),
                _ => None,
            })
            .flatten()
            .copied()
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.events.last(), Some(Event::Lost(_)))
    }

    pub fn transport(&self) -> ChannelTransport {
        self.transport.clone().expect("protocol was never connected")
    }
}

impl Protocol for RecordingProtocol {
    fn make_connection(&mut self, transport: ChannelTransport) {
        self.events.push(Event::Connected(transport.address().clone()));
        self.transport = Some(transport);
    }

    fn data_received(&mut self, data: Bytes) {
        self.events.push(Event::Data(data));
    }

    fn exit_status_received(&mut self, status: u32) {
        self.events.push(Event::ExitStatus(status));
    }

    fn connection_lost(&mut self, reason: Error) {
        self.events.push(Event::Lost(reason.kind()));
    }
}
