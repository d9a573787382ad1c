// ABOUTME: Session channel that runs one command and pumps its I/O to a protocol.
// ABOUTME: Reports the connected protocol or the setup failure through a completion.

use crate::address::SessionAddress;
use crate::completion::Completion;
use crate::creator::ConnectionCreator;
use crate::error::Error;
use crate::protocol::{ChannelTransport, Outgoing, Protocol, ProtocolFactory};
use crate::ssh::{ChannelEvent, MultiplexedConnection, SessionChannel};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Protocol instance shared between the caller and the channel task.
///
/// The channel task locks it to deliver each event, so callers must not
/// hold the guard across an `.await`: doing so parks a runtime worker
/// until the guard is dropped.
pub type SharedProtocol<P> = Arc<Mutex<P>>;

pub(crate) struct CommandChannel<C: ConnectionCreator, F: ProtocolFactory> {
    creator: Arc<C>,
    connection: Arc<C::Connection>,
    command: Bytes,
    factory: F,
    connected: Completion<SharedProtocol<F::Protocol>>,
}

impl<C: ConnectionCreator, F: ProtocolFactory> CommandChannel<C, F> {
    pub(crate) fn new(
        creator: Arc<C>,
        connection: Arc<C::Connection>,
        command: Bytes,
        factory: F,
        connected: Completion<SharedProtocol<F::Protocol>>,
    ) -> Self {
        Self {
            creator,
            connection,
            command,
            factory,
            connected,
        }
    }

    /// Open the channel, start the command, then deliver its events until
    /// the channel closes.
    pub(crate) async fn run(self) {
        let Self {
            creator,
            connection,
            command,
            factory,
            connected,
        } = self;

        let mut channel = match connection.open_session().await {
            Ok(channel) => channel,
            Err(reason) => return setup_failed(&*creator, &connection, &connected, reason).await,
        };
        tracing::debug!(command = %String::from_utf8_lossy(&command), "channel open; requesting exec");

        if let Err(reason) = channel.exec(&command).await {
            if let Err(e) = channel.close().await {
                tracing::trace!(error = %e, "closing rejected channel failed");
            }
            return setup_failed(&*creator, &connection, &connected, reason).await;
        }

        let address = SessionAddress::new(connection.peer(), connection.username(), command);
        tracing::debug!(%address, "command started");

        let (transport, outgoing) = ChannelTransport::new(address.clone());
        let protocol = Arc::new(Mutex::new(factory.build_protocol(address)));
        protocol.lock().make_connection(transport);

        if connected.succeed(Arc::clone(&protocol)).is_err() {
            tracing::debug!("caller stopped waiting; command keeps running");
        }

        pump(&mut channel, &protocol, outgoing).await;

        creator.cleanup_connection(&connection).await;
        protocol
            .lock()
            .connection_lost(Error::ConnectionDone("ssh channel closed".to_string()));
    }
}

/// Release the connection, then report the failed setup. Cleanup runs here
/// so it completes even when the caller has stopped waiting.
async fn setup_failed<C: ConnectionCreator, P>(
    creator: &C,
    connection: &Arc<C::Connection>,
    connected: &Completion<SharedProtocol<P>>,
    reason: Error,
) {
    tracing::debug!(error = %reason, "command channel setup failed; cleaning up");
    creator.cleanup_connection(connection).await;
    if let Err(reason) = connected.fail(reason) {
        tracing::debug!(error = %reason, "nobody waiting for the channel");
    }
}

async fn pump<S, P>(
    channel: &mut S,
    protocol: &Mutex<P>,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
) where
    S: SessionChannel,
    P: Protocol,
{
    let mut writer_open = true;
    loop {
        tokio::select! {
            event = channel.next_event() => match event {
                Some(ChannelEvent::Data(data)) => protocol.lock().data_received(data),
                Some(ChannelEvent::ExtendedData { ext, data }) => {
                    tracing::trace!(ext, len = data.len(), "discarding extended data");
                }
                Some(ChannelEvent::Eof) => tracing::trace!("remote end sent eof"),
                Some(ChannelEvent::ExitStatus(status)) => {
                    tracing::debug!(status, "command exited");
                    protocol.lock().exit_status_received(status);
                }
                None => break,
            },
            item = outgoing.recv(), if writer_open => {
                let sent = match item {
                    Some(Outgoing::Data(data)) => channel.send_data(data).await,
                    Some(Outgoing::Eof) => channel.send_eof().await,
                    Some(Outgoing::Close) => channel.close().await,
                    None => {
                        writer_open = false;
                        Ok(())
                    }
                };
                if let Err(e) = sent {
                    tracing::debug!(error = %e, "write to command channel failed");
                }
            }
        }
    }
}
