//! Server configuration
//!
//! Loaded from a TOML file:
//!
//! ```toml
//! [signaling]
//! addr = "0.0.0.0:8080"
//! ws_path = "/ws"
//! mailbox_capacity = 64
//! tls = true
//! tls_crt = "/etc/devnet/signald.crt"
//! tls_key = "/etc/devnet/signald.key"
//!
//! [[ice_servers]]
//! urls = ["stun:stun.devnet.test:3478"]
//!
//! [[ice_servers]]
//! urls = ["turn:turn.devnet.test:3478"]
//! username = "devnet"
//! credential = "secret"
//!
//! [[users]]
//! name = "alice"
//! hash = "<output of `devnet-signald hash alice <secret>`>"
//! ```

use crate::auth::User;
use crate::error::ConfigError;
use devnet_protocol::IceServer;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Pending envelopes per client before it is considered stuck
pub const DEFAULT_MAILBOX_CAPACITY: usize = 64;

/// Complete server configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub signaling: SignalingConfig,
    pub ice_servers: Vec<IceServer>,
    pub users: Vec<User>,
}

/// Listener settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Address to listen on
    pub addr: String,
    /// Path of the WebSocket endpoint
    pub ws_path: String,
    /// Mailbox capacity per client
    pub mailbox_capacity: usize,
    /// Serve `wss` using `tls_crt` and `tls_key`
    pub tls: bool,
    /// PEM certificate chain
    pub tls_crt: Option<PathBuf>,
    /// PEM private key
    pub tls_key: Option<PathBuf>,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8080".to_string(),
            ws_path: "/ws".to_string(),
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            tls: false,
            tls_crt: None,
            tls_key: None,
        }
    }
}

impl ServerConfig {
    /// Read and parse a TOML config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        contents.parse()
    }

    /// The parsed listen address
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.signaling
            .addr
            .parse()
            .map_err(|_| ConfigError::Address(self.signaling.addr.clone()))
    }

    /// Certificate and key paths, or `None` when TLS is off
    pub fn tls_files(&self) -> Result<Option<(&Path, &Path)>, ConfigError> {
        let signaling = &self.signaling;
        if !signaling.tls {
            return Ok(None);
        }
        match (&signaling.tls_crt, &signaling.tls_key) {
            (Some(crt), Some(key)) => Ok(Some((crt.as_path(), key.as_path()))),
            _ => Err(ConfigError::MissingTlsFiles),
        }
    }
}

impl std::str::FromStr for ServerConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut config: ServerConfig = toml::from_str(s)?;
        if !config.signaling.ws_path.starts_with('/') {
            config.signaling.ws_path.insert(0, '/');
        }
        config.signaling.mailbox_capacity = config.signaling.mailbox_capacity.max(1);
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: ServerConfig = "".parse().unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.listen_addr().unwrap(), "127.0.0.1:8080".parse().unwrap());
    }

    #[test]
    fn parses_full_config() {
        let config: ServerConfig = r#"
            [signaling]
            addr = "0.0.0.0:9000"
            ws_path = "signal"
            mailbox_capacity = 16

            [[ice_servers]]
            urls = ["stun:stun.devnet.test:3478"]

            [[ice_servers]]
            urls = ["turn:turn.devnet.test:3478"]
            username = "devnet"
            credential = "secret"

            [[users]]
            name = "alice"
            hash = "abc123"
        "#
        .parse()
        .unwrap();

        assert_eq!(config.signaling.ws_path, "/signal");
        assert_eq!(config.signaling.mailbox_capacity, 16);
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.ice_servers[1].username.as_deref(), Some("devnet"));
        assert_eq!(config.users[0].name, "alice");
    }

    #[test]
    fn rejects_bad_address() {
        let config: ServerConfig = "[signaling]\naddr = \"nowhere\"".parse().unwrap();
        assert!(matches!(config.listen_addr(), Err(ConfigError::Address(_))));
    }

    #[test]
    fn tls_needs_both_files() {
        let plain = ServerConfig::default();
        assert!(plain.tls_files().unwrap().is_none());

        let config: ServerConfig = "[signaling]\ntls = true\ntls_crt = \"signald.crt\"".parse().unwrap();
        assert!(matches!(config.tls_files(), Err(ConfigError::MissingTlsFiles)));

        let config: ServerConfig = "[signaling]\ntls = true\ntls_crt = \"signald.crt\"\ntls_key = \"signald.key\""
            .parse()
            .unwrap();
        let (crt, key) = config.tls_files().unwrap().unwrap();
        assert_eq!((crt, key), (Path::new("signald.crt"), Path::new("signald.key")));
    }

    #[test]
    fn reports_missing_file() {
        let err = ServerConfig::from_file("/nonexistent/devnet/signald.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
