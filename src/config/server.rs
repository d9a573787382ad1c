// ABOUTME: Server address for the endpoint configuration.
// ABOUTME: Parses formats like "host", "user@host", "host:port", "user@host:port".

use crate::address::{DEFAULT_PORT, Target};
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl ServerConfig {
    pub fn parse(s: &str) -> Result<Self, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("server address cannot be empty".to_string());
        }

        // Parse format: [user@]host[:port]
        let (user_part, rest) = match s.rsplit_once('@') {
            Some((user, rest)) => (Some(user), rest),
            None => (None, s),
        };

        if user_part == Some("") {
            return Err("username cannot be empty".to_string());
        }

        let (host, port) = if let Some(colon_pos) = rest.rfind(':') {
            let port_str = &rest[colon_pos + 1..];
            let port = port_str
                .parse::<u16>()
                .map_err(|_| format!("invalid port: {}", port_str))?;
            (&rest[..colon_pos], port)
        } else {
            (rest, DEFAULT_PORT)
        };

        if host.is_empty() {
            return Err("hostname cannot be empty".to_string());
        }

        Ok(ServerConfig {
            host: host.to_string(),
            port,
            user: user_part.map(|s| s.to_string()),
        })
    }

    /// Configured user, else `$USER`, else `root`.
    pub fn username(&self) -> String {
        self.user
            .clone()
            .unwrap_or_else(|| std::env::var("USER").unwrap_or_else(|_| "root".to_string()))
    }

    pub fn target(&self) -> Target {
        Target::new(self.host.clone(), self.port)
    }
}
