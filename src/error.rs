//! Error types for wg-forwarder
//!
//! Errors are grouped by the stage that produces them. Startup stages
//! (configuration, tunnel creation) are fatal; accept errors carry a
//! recoverability hint; dial and relay errors only affect one connection.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Top-level error type for wg-forwarder
#[derive(Debug, Error)]
pub enum ForwarderError {
    /// Configuration errors (file reading, line parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Tunnel endpoint construction errors
    #[error("Tunnel initialization error: {0}")]
    TunnelInit(#[from] TunnelInitError),

    /// Listener accept errors
    #[error("Accept error: {0}")]
    Accept(#[from] AcceptError),

    /// Upstream connection errors
    #[error("Upstream dial error: {0}")]
    UpstreamDial(#[from] UpstreamDialError),

    /// Relay I/O errors
    #[error("Relay error: {0}")]
    Relay(#[from] RelayIoError),
}

impl ForwarderError {
    /// Check if this error is recoverable (the process can keep serving)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) | Self::TunnelInit(_) => false,
            Self::Accept(e) => e.is_recoverable(),
            Self::UpstreamDial(_) | Self::Relay(_) => true,
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// A non-comment line that is not `key=value`
    #[error("Malformed line {line}: {content:?} (expected key=value)")]
    MalformedLine { line: usize, content: String },

    /// A required key is absent or has an empty value
    #[error("Missing required key: {0}")]
    MissingKey(&'static str),

    /// A key has a value that does not parse
    #[error("Invalid value for {key}: {value:?}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    /// Key material that is not a 32-byte Base64 or hex string
    #[error("Invalid key material for {key}: {reason}")]
    InvalidKey { key: String, reason: String },

    /// Validation error (out-of-range or inconsistent values)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// The upstream `host:port` argument is unusable
    #[error("Invalid upstream address {addr:?}: {reason}")]
    InvalidUpstream { addr: String, reason: String },

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Create an invalid value error
    pub fn invalid_value(
        key: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            key: key.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid key material error
    pub fn invalid_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Config errors are not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Errors raised while building the tunnel endpoint
#[derive(Debug, Error)]
pub enum TunnelInitError {
    /// Engine settings text could not be applied
    #[error("Invalid engine settings: {0}")]
    InvalidSettings(String),

    /// The WireGuard engine rejected its keys
    #[error("Failed to create WireGuard engine: {0}")]
    Engine(String),

    /// The UDP listen port could not be bound
    #[error("Failed to bind UDP port {port}: {reason}")]
    Bind { port: u16, reason: String },

    /// The virtual interface could not be configured
    #[error("Virtual interface error: {0}")]
    NetStack(String),

    /// A TCP listener could not be opened on the virtual interface
    #[error("Failed to listen on port {port}: {reason}")]
    Listen { port: u16, reason: String },
}

impl TunnelInitError {
    /// Create a bind error from an I/O error
    pub fn bind(port: u16, err: &io::Error) -> Self {
        Self::Bind {
            port,
            reason: err.to_string(),
        }
    }

    /// Create a listen error
    pub fn listen(port: u16, reason: impl Into<String>) -> Self {
        Self::Listen {
            port,
            reason: reason.into(),
        }
    }
}

/// Errors returned by `TunnelTcpListener::accept`
#[derive(Debug, Error)]
pub enum AcceptError {
    /// The virtual interface ran out of socket slots
    #[error("Socket limit reached ({limit} sockets)")]
    SocketLimit { limit: usize },

    /// The listener or the virtual interface has been shut down
    #[error("Listener closed")]
    Closed,

    /// Accept failed at the OS level
    #[error("Accept I/O error: {0}")]
    Io(#[from] io::Error),
}

impl AcceptError {
    /// Transient errors are retried with backoff; terminal ones stop the loop
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::SocketLimit { .. } | Self::Io(_) => true,
            Self::Closed => false,
        }
    }
}

/// Errors raised while connecting to the upstream
#[derive(Debug, Error)]
pub enum UpstreamDialError {
    /// Connect failed (refused, unreachable, resolution failure)
    #[error("Failed to connect to {addr}: {reason}")]
    ConnectFailed { addr: String, reason: String },

    /// Connect did not complete in time
    #[error("Connection to {addr} timed out after {timeout_secs}s")]
    Timeout { addr: String, timeout_secs: u64 },
}

impl UpstreamDialError {
    /// Create a connect failure from an I/O error
    pub fn connect_failed(addr: impl Into<String>, err: &io::Error) -> Self {
        Self::ConnectFailed {
            addr: addr.into(),
            reason: err.to_string(),
        }
    }

    /// Create a timeout error
    pub fn timeout(addr: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            addr: addr.into(),
            timeout_secs: timeout.as_secs(),
        }
    }
}

/// Direction of a relay copy task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Tunnel client to upstream
    ClientToUpstream,
    /// Upstream to tunnel client
    UpstreamToClient,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ClientToUpstream => write!(f, "client->upstream"),
            Self::UpstreamToClient => write!(f, "upstream->client"),
        }
    }
}

/// Errors that end a relay pair
#[derive(Debug, Error)]
pub enum RelayIoError {
    /// Read failed in one direction
    #[error("Read error ({direction}): {source}")]
    Read {
        direction: Direction,
        #[source]
        source: io::Error,
    },

    /// Write failed in one direction
    #[error("Write error ({direction}): {source}")]
    Write {
        direction: Direction,
        #[source]
        source: io::Error,
    },

    /// No bytes moved for the configured idle period
    #[error("Idle timeout after {0:?}")]
    IdleTimeout(Duration),

    /// The connection outlived the configured maximum duration
    #[error("Maximum connection duration of {0:?} exceeded")]
    MaxDuration(Duration),

    /// A copy task panicked or was cancelled
    #[error("Copy task ({direction}) failed: {reason}")]
    TaskFailed { direction: Direction, reason: String },
}

impl RelayIoError {
    /// Whether the error is an ordinary peer disconnect
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Read { source, .. } | Self::Write { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            Self::IdleTimeout(_) | Self::MaxDuration(_) | Self::TaskFailed { .. } => false,
        }
    }
}
