// ABOUTME: Client-side user authentication for new connections.
// ABOUTME: Offers agent keys, then local keys, then a password; each at most once.

use crate::error::{Error, Result};
use crate::ssh::SecureSession;
use crate::state::{ConnectionState, StateCell};
use russh::keys::{PrivateKey, PublicKey};
use std::collections::VecDeque;
use std::sync::Arc;

/// A single credential about to be offered to the server.
#[derive(Debug, Clone)]
pub enum Offer {
    /// A key held by the agent; the agent signs.
    Agent(PublicKey),
    /// A locally held private key.
    Key(Arc<PrivateKey>),
    Password(String),
}

impl Offer {
    pub fn method(&self) -> &'static str {
        match self {
            Offer::Agent(_) => "agent",
            Offer::Key(_) => "publickey",
            Offer::Password(_) => "password",
        }
    }
}

/// Authenticates one connection.
///
/// Works on its own copy of the key list: every offered key is consumed,
/// and the caller's list is never touched. Once all credentials have been
/// offered and rejected, authentication fails.
pub struct Authenticator<A> {
    username: String,
    keys: VecDeque<Arc<PrivateKey>>,
    password: Option<String>,
    agent: Option<A>,
    agent_keys: VecDeque<PublicKey>,
    state: StateCell,
}

impl<A> std::fmt::Debug for Authenticator<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("username", &self.username)
            .field("keys", &self.keys.len())
            .field("password", &self.password.is_some())
            .field("agent_keys", &self.agent_keys.len())
            .finish()
    }
}

impl<A> Authenticator<A> {
    pub fn new(
        username: impl Into<String>,
        keys: Vec<Arc<PrivateKey>>,
        password: Option<String>,
        state: StateCell,
    ) -> Self {
        Self {
            username: username.into(),
            keys: keys.into(),
            password,
            agent: None,
            agent_keys: VecDeque::new(),
            state,
        }
    }

    /// Use `agent` for the keys in `identities`. Agent keys go first.
    pub fn attach_agent(&mut self, agent: A, identities: Vec<PublicKey>) {
        self.agent = Some(agent);
        self.agent_keys = identities.into();
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Local keys not offered yet.
    pub fn remaining_keys(&self) -> usize {
        self.keys.len()
    }

    /// Take the next credential to offer, or `None` once exhausted.
    pub fn next_offer(&mut self) -> Option<Offer> {
        if self.agent.is_some() {
            if let Some(key) = self.agent_keys.pop_front() {
                return Some(Offer::Agent(key));
            }
        }
        if let Some(key) = self.keys.pop_front() {
            return Some(Offer::Key(key));
        }
        self.password.take().map(Offer::Password)
    }

    /// Offer credentials until the server accepts one.
    ///
    /// Success moves the connection to [`ConnectionState::Channelling`].
    pub async fn authenticate<S>(&mut self, session: &mut S) -> Result<()>
    where
        S: SecureSession<Agent = A>,
    {
        while let Some(offer) = self.next_offer() {
            let method = offer.method();
            let accepted = match offer {
                Offer::Agent(key) => match self.agent.as_mut() {
                    Some(agent) => session.authenticate_agent(&self.username, &key, agent).await?,
                    None => false,
                },
                Offer::Key(key) => session.authenticate_publickey(&self.username, key).await?,
                Offer::Password(password) => {
                    session.authenticate_password(&self.username, &password).await?
                }
            };

            if accepted {
                tracing::debug!(user = %self.username, method, "authenticated");
                self.state.advance(ConnectionState::Channelling);
                return Ok(());
            }
            tracing::debug!(user = %self.username, method, "credential rejected");
        }

        tracing::debug!(user = %self.username, "no credentials left to offer");
        Err(Error::AuthenticationFailed)
    }
}
