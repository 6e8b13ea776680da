//! Configuration types for wg-forwarder

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use ipnet::IpNet;
use serde::Serialize;

use crate::error::ConfigError;
use crate::tunnel::keys::WgKey;

/// Default MTU for the virtual interface (standard WireGuard MTU)
pub const DEFAULT_MTU: usize = 1420;

/// Smallest MTU accepted for an IPv4 intercept address
pub const MIN_MTU_V4: usize = 576;

/// Smallest MTU accepted for an IPv6 intercept address
pub const MIN_MTU_V6: usize = 1280;

/// Largest accepted MTU
pub const MAX_MTU: usize = 65535;

/// Upper bound on the relay copy buffer
pub const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Lower bound on the relay copy buffer
pub const MIN_BUFFER_SIZE: usize = 1024;

/// Complete configuration
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Tunnel endpoint settings (all required keys)
    pub tunnel: TunnelConfig,

    /// Per-connection relay settings
    pub relay: RelayConfig,

    /// Virtual interface options
    pub options: TunnelOptions,

    /// Logging settings
    pub log: LogConfig,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if any section is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tunnel.validate()?;
        self.relay.validate()?;
        self.options.validate()?;
        self.log.validate()?;

        if self.tunnel.intercept_ip.is_ipv6() && self.options.mtu < MIN_MTU_V6 {
            return Err(ConfigError::ValidationError(format!(
                "mtu {} is below the IPv6 minimum of {MIN_MTU_V6}",
                self.options.mtu
            )));
        }

        Ok(())
    }
}

/// Tunnel endpoint configuration
///
/// Immutable once loaded; passed by value into endpoint construction.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelConfig {
    /// Address the virtual interface owns inside the tunnel
    pub intercept_ip: IpAddr,

    /// TCP port accepted on the virtual interface
    pub intercept_port: u16,

    /// UDP port the WireGuard endpoint listens on
    pub listen_port: u16,

    /// Local private key
    #[serde(skip_serializing)]
    pub private_key: WgKey,

    /// The single peer's public key
    #[serde(serialize_with = "serialize_public_key")]
    pub peer_public_key: WgKey,

    /// Source addresses the peer may use inside the tunnel
    pub allowed_ip: IpNet,
}

fn serialize_public_key<S: serde::Serializer>(key: &WgKey, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&key.to_base64())
}

impl TunnelConfig {
    /// Validate the tunnel configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a port is zero or the intercept address is
    /// not a usable unicast address.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.intercept_port == 0 {
            return Err(ConfigError::ValidationError(
                "portToIntercept must be greater than 0".into(),
            ));
        }
        if self.listen_port == 0 {
            return Err(ConfigError::ValidationError(
                "wgListenPort must be greater than 0".into(),
            ));
        }
        if self.intercept_ip.is_unspecified() || self.intercept_ip.is_multicast() {
            return Err(ConfigError::ValidationError(format!(
                "ipToIntercept must be a unicast address, got {}",
                self.intercept_ip
            )));
        }
        if self.private_key.public_key() == self.peer_public_key {
            return Err(ConfigError::ValidationError(
                "wgPublicKey is the public key of wgPrivateKey; it must name the peer".into(),
            ));
        }
        Ok(())
    }
}

/// Relay behavior for each intercepted connection
#[derive(Debug, Clone, Serialize)]
pub struct RelayConfig {
    /// Upstream connect timeout in seconds
    pub connect_timeout_secs: u64,

    /// Idle timeout in seconds (0 disables)
    pub idle_timeout_secs: u64,

    /// Maximum lifetime of one relayed connection in seconds
    pub max_connection_secs: Option<u64>,

    /// Copy buffer size per direction
    pub buffer_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            idle_timeout_secs: 300,
            max_connection_secs: None,
            buffer_size: 32 * 1024,
        }
    }
}

impl RelayConfig {
    /// Validate relay settings
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for a zero connect timeout or an out-of-range
    /// buffer size.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "connectTimeoutSecs must be greater than 0".into(),
            ));
        }
        if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&self.buffer_size) {
            return Err(ConfigError::ValidationError(format!(
                "bufferSize must be between {MIN_BUFFER_SIZE} and {MAX_BUFFER_SIZE}, got {}",
                self.buffer_size
            )));
        }
        if self.max_connection_secs == Some(0) {
            return Err(ConfigError::ValidationError(
                "maxConnectionSecs must be greater than 0 when set".into(),
            ));
        }
        Ok(())
    }

    /// Upstream connect timeout
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Idle timeout, `None` when disabled
    #[must_use]
    pub const fn idle_timeout(&self) -> Option<Duration> {
        if self.idle_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.idle_timeout_secs))
        }
    }

    /// Maximum connection lifetime, `None` when unlimited
    #[must_use]
    pub fn max_duration(&self) -> Option<Duration> {
        self.max_connection_secs.map(Duration::from_secs)
    }
}

/// Virtual interface options
#[derive(Debug, Clone, Serialize)]
pub struct TunnelOptions {
    /// Interface MTU
    pub mtu: usize,

    /// Persistent keepalive interval in seconds
    pub persistent_keepalive: Option<u16>,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            persistent_keepalive: None,
        }
    }
}

impl TunnelOptions {
    /// Validate interface options
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the MTU is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_MTU_V4..=MAX_MTU).contains(&self.mtu) {
            return Err(ConfigError::ValidationError(format!(
                "mtu must be between {MIN_MTU_V4} and {MAX_MTU}, got {}",
                self.mtu
            )));
        }
        if self.persistent_keepalive == Some(0) {
            return Err(ConfigError::ValidationError(
                "persistentKeepalive must be greater than 0 when set".into(),
            ));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Output format: "text" or "json"
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl LogConfig {
    /// Validate logging settings
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for an unknown level or format.
    pub fn validate(&self) -> Result<(), ConfigError> {
        const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
        if !LEVELS.contains(&self.level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "logLevel must be one of {LEVELS:?}, got {:?}",
                self.level
            )));
        }
        if self.format != "text" && self.format != "json" {
            return Err(ConfigError::ValidationError(format!(
                "logFormat must be \"text\" or \"json\", got {:?}",
                self.format
            )));
        }
        Ok(())
    }
}

/// Upstream `host:port` every intercepted connection is relayed to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpstreamTarget {
    host: String,
    port: u16,
}

impl UpstreamTarget {
    /// Host name or address literal (without IPv6 brackets)
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port number
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }
}

impl FromStr for UpstreamTarget {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidUpstream {
            addr: s.to_string(),
            reason: reason.to_string(),
        };

        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| invalid("expected host:port"))?;

        let host = match host.strip_prefix('[') {
            Some(rest) => rest
                .strip_suffix(']')
                .ok_or_else(|| invalid("unterminated IPv6 bracket"))?,
            None if host.contains(':') => {
                return Err(invalid("IPv6 addresses must be written as [addr]:port"));
            }
            None => host,
        };
        if host.is_empty() {
            return Err(invalid("empty host"));
        }

        let port: u16 = port.parse().map_err(|_| invalid("port is not a number"))?;
        if port == 0 {
            return Err(invalid("port must be greater than 0"));
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for UpstreamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
