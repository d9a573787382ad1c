// ABOUTME: Addresses used when dialing a server and when describing a running command.
// ABOUTME: Target is where to connect; SessionAddress is what a protocol is attached to.

use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;

pub const DEFAULT_PORT: u16 = 22;

/// Network location of an SSH server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Identity of a session whose command is running: the server it runs on,
/// the user that authenticated, and the command line itself.
///
/// Built once, when the exec request has been accepted, and handed to the
/// protocol factory. Never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionAddress {
    server: SocketAddr,
    username: String,
    command: Bytes,
}

impl SessionAddress {
    pub fn new(server: SocketAddr, username: impl Into<String>, command: Bytes) -> Self {
        Self {
            server,
            username: username.into(),
            command,
        }
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn command(&self) -> &[u8] {
        &self.command
    }
}

impl fmt::Display for SessionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} `{}`",
            self.username,
            self.server,
            String::from_utf8_lossy(&self.command)
        )
    }
}
