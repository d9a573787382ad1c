// ABOUTME: Library root for sshcmd - run a command on an SSH server and talk to it.
// ABOUTME: Re-exports the endpoint, connection strategies, protocol traits and russh backend.

pub mod address;
pub mod auth;
pub mod channel;
pub mod completion;
pub mod config;
pub mod creator;
pub mod credentials;
pub mod endpoint;
pub mod error;
pub mod known_hosts;
pub mod output;
pub mod protocol;
pub mod ssh;
pub mod state;
pub mod transport;

pub use address::{SessionAddress, Target};
pub use channel::SharedProtocol;
pub use creator::{ConnectionCreator, ConnectionParams, ExistingConnectionHelper, NewConnectionHelper};
pub use credentials::{AgentEndpoint, Credentials};
pub use endpoint::CommandEndpoint;
pub use error::{Error, ErrorKind, Result};
pub use known_hosts::{HostKeyPrompt, KnownHosts, KnownHostsFile, RejectUnknown, TrustOnFirstUse};
pub use output::{CommandOutput, OutputCollector};
pub use protocol::{ChannelTransport, Protocol, ProtocolFactory};
pub use state::ConnectionState;
