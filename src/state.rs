// ABOUTME: Connection setup states and the shared cell that tracks them.
// ABOUTME: States only move forward; the cell refuses regressions.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Progress of a single connection through setup.
///
/// Ordering follows the handshake, so `a < b` means `a` happens before `b`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionState {
    /// TCP connection open, nothing negotiated yet.
    Starting,
    /// Host key presented, verification in progress.
    Securing,
    /// Key exchange done, credentials being offered.
    Authenticating,
    /// Authenticated, connection service not started yet.
    Channelling,
    /// Ready for channels. Disconnects from here on are not setup errors.
    Running,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Starting => "starting",
            ConnectionState::Securing => "securing",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Channelling => "channelling",
            ConnectionState::Running => "running",
        };
        f.write_str(name)
    }
}

/// Shared handle on one connection's state.
///
/// The transport, its host key check and the authenticator all hold clones;
/// every transition goes through [`StateCell::advance`].
#[derive(Debug, Clone)]
pub struct StateCell {
    inner: Arc<Mutex<ConnectionState>>,
}

impl Default for StateCell {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ConnectionState::Starting)),
        }
    }
}

impl StateCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> ConnectionState {
        *self.inner.lock()
    }

    /// Move to `next`. Returns `false` and leaves the state alone if `next`
    /// is earlier than the current state. Re-entering the current state is
    /// allowed (host key checks may run more than once on re-keying).
    pub fn advance(&self, next: ConnectionState) -> bool {
        let mut current = self.inner.lock();
        if next < *current {
            tracing::warn!(from = %*current, to = %next, "refusing to move connection state backwards");
            return false;
        }
        if next != *current {
            tracing::debug!(from = %*current, to = %next, "connection state changed");
        }
        *current = next;
        true
    }
}
