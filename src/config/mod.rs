// ABOUTME: YAML configuration for a command endpoint.
// ABOUTME: Handles parsing, env var interpolation, and building the endpoint it describes.

mod deserialize;
mod env_value;
mod server;

pub use env_value::EnvValue;
pub use server::ServerConfig;

use crate::creator::{ConnectionParams, NewConnectionHelper};
use crate::credentials::{AgentEndpoint, Credentials};
use crate::endpoint::CommandEndpoint;
use crate::error::{Error, Result};
use crate::known_hosts::KnownHostsFile;
use crate::ssh::RusshDialer;
use deserialize::deserialize_server;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    #[serde(deserialize_with = "deserialize_server")]
    pub server: ServerConfig,

    pub command: String,

    #[serde(default)]
    pub identity_files: Vec<PathBuf>,

    #[serde(default)]
    pub password: Option<EnvValue>,

    #[serde(default)]
    pub agent: AgentSetting,

    /// Defaults to `~/.ssh/known_hosts`.
    #[serde(default)]
    pub known_hosts: Option<PathBuf>,

    #[serde(default)]
    pub trust_on_first_use: bool,

    #[serde(default, with = "humantime_serde")]
    pub connect_timeout: Option<Duration>,

    #[serde(default = "default_inactivity_timeout", with = "humantime_serde")]
    pub inactivity_timeout: Duration,
}

/// `agent: true` uses `$SSH_AUTH_SOCK`; a path names the socket directly.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum AgentSetting {
    Enabled(bool),
    Socket(PathBuf),
}

impl Default for AgentSetting {
    fn default() -> Self {
        AgentSetting::Enabled(false)
    }
}

impl AgentSetting {
    pub fn endpoint(&self) -> Option<AgentEndpoint> {
        match self {
            AgentSetting::Enabled(false) => None,
            AgentSetting::Enabled(true) => Some(AgentEndpoint::Env),
            AgentSetting::Socket(path) => Some(AgentEndpoint::Socket(path.clone())),
        }
    }
}

fn default_inactivity_timeout() -> Duration {
    Duration::from_secs(30)
}

impl EndpointConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    fn validate(&self) -> Result<()> {
        if self.command.trim().is_empty() {
            return Err(Error::InvalidConfig("command cannot be empty".to_string()));
        }
        if self.identity_files.is_empty()
            && self.password.is_none()
            && self.agent.endpoint().is_none()
        {
            return Err(Error::InvalidConfig(
                "no credentials configured: set identity_files, password or agent".to_string(),
            ));
        }
        Ok(())
    }

    /// Load identity files and resolve the password.
    pub fn credentials(&self) -> Result<Credentials> {
        let mut credentials = Credentials::new();
        for path in &self.identity_files {
            credentials = credentials.key_file(expand_home(path)?, None)?;
        }
        if let Some(password) = &self.password {
            credentials = credentials.password(password.resolve()?);
        }
        if let Some(endpoint) = self.agent.endpoint() {
            credentials = credentials.agent(endpoint);
        }
        Ok(credentials)
    }

    pub fn connection_params(&self) -> Result<ConnectionParams> {
        let mut params = ConnectionParams::new(self.server.host.clone(), self.server.username())
            .port(self.server.port)
            .credentials(self.credentials()?);

        if let Some(path) = &self.known_hosts {
            params = params.known_hosts(KnownHostsFile::new(expand_home(path)?));
        }
        if self.trust_on_first_use {
            params = params.trust_on_first_use();
        }
        Ok(params)
    }

    pub fn dialer(&self) -> RusshDialer {
        let dialer = RusshDialer::new().inactivity_timeout(self.inactivity_timeout);
        match self.connect_timeout {
            Some(timeout) => dialer.connect_timeout(timeout),
            None => dialer,
        }
    }

    pub fn into_endpoint(self) -> Result<CommandEndpoint<NewConnectionHelper<RusshDialer>>> {
        let params = self.connection_params()?;
        CommandEndpoint::new_connection(self.dialer(), params, self.command)
    }
}

fn expand_home(path: &Path) -> Result<PathBuf> {
    let Ok(rest) = path.strip_prefix("~") else {
        return Ok(path.to_path_buf());
    };
    let home = std::env::var("HOME")
        .map_err(|_| Error::InvalidConfig(format!("HOME not set; cannot expand {}", path.display())))?;
    Ok(Path::new(&home).join(rest))
}
