//! Error types for the signaling server

use thiserror::Error;

/// Errors that can occur while routing or serving connections
#[derive(Error, Debug)]
pub enum SignalingError {
    /// The switch loop is no longer running
    #[error("switch is not running")]
    SwitchClosed,

    /// Listener or socket error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Server configuration is unusable
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors from authenticating an upgrade request
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AuthError {
    /// No authorization header
    #[error("missing credentials")]
    MissingCredentials,

    /// Authorization header present but unreadable
    #[error("malformed credentials")]
    MalformedCredentials,

    /// Credentials did not verify
    #[error("authentication failed for '{0}'")]
    Rejected(String),
}

/// Errors from loading the server configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    /// Config file is not valid TOML or has the wrong shape
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Listen address does not parse
    #[error("invalid listen address '{0}'")]
    Address(String),

    /// TLS is enabled without a certificate or key path
    #[error("tls is enabled but tls_crt or tls_key is not set")]
    MissingTlsFiles,

    /// Certificate or key file could not be loaded
    #[error("failed to load {path}: {source}")]
    Pem {
        path: String,
        source: rustls::pki_types::pem::Error,
    },

    /// Certificate and key do not make a usable server identity
    #[error("invalid TLS identity: {0}")]
    Tls(#[from] rustls::Error),
}
