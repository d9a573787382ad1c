// ABOUTME: Collects a command's stdout and exit status into a CommandOutput.
// ABOUTME: Backs CommandEndpoint::output for run-to-completion callers.

use crate::error::Error;
use crate::protocol::{ChannelTransport, Protocol};
use bytes::{Bytes, BytesMut};
use tokio::sync::oneshot;

/// Result of running a command to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` if the server closed the channel without reporting one.
    pub exit_status: Option<u32>,
    pub stdout: Bytes,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Protocol that closes stdin straight away and buffers everything else.
#[derive(Debug)]
pub struct OutputCollector {
    stdout: BytesMut,
    exit_status: Option<u32>,
    done: Option<oneshot::Sender<CommandOutput>>,
}

impl OutputCollector {
    /// `done` receives the output once the channel closes.
    pub fn new(done: Option<oneshot::Sender<CommandOutput>>) -> Self {
        Self {
            stdout: BytesMut::new(),
            exit_status: None,
            done,
        }
    }
}

impl Protocol for OutputCollector {
    fn make_connection(&mut self, transport: ChannelTransport) {
        if let Err(e) = transport.write_eof() {
            tracing::debug!(error = %e, "channel ended before stdin could be closed");
        }
    }

    fn data_received(&mut self, data: Bytes) {
        self.stdout.extend_from_slice(&data);
    }

    fn exit_status_received(&mut self, status: u32) {
        self.exit_status = Some(status);
    }

    fn connection_lost(&mut self, reason: Error) {
        tracing::trace!(reason = %reason, "command channel closed");
        let output = CommandOutput {
            exit_status: self.exit_status,
            stdout: std::mem::take(&mut self.stdout).freeze(),
        };
        if let Some(done) = self.done.take() {
            let _ = done.send(output);
        }
    }
}
