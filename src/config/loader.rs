//! Configuration loading
//!
//! The configuration file is line oriented:
//!
//! ```text
//! // comment
//! ipToIntercept=10.0.0.2
//! portToIntercept=8080
//! wgListenPort=51820
//! wgPrivateKey=<base64 or hex>
//! wgPublicKey=<base64 or hex>
//! wgAllowedIp=10.0.0.1/32
//! ```
//!
//! Each line is trimmed. Empty lines and lines starting with `//` or `#` are
//! skipped. Every other line must contain `=`; it is split on the first one,
//! so values may themselves contain `=` (Base64 padding). Unknown keys are
//! ignored and a repeated key keeps its last value.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;

use ipnet::IpNet;
use tracing::{debug, info};

use super::types::{Config, LogConfig, RelayConfig, TunnelConfig, TunnelOptions};
use crate::error::ConfigError;
use crate::tunnel::keys::WgKey;

pub const KEY_INTERCEPT_IP: &str = "ipToIntercept";
pub const KEY_INTERCEPT_PORT: &str = "portToIntercept";
pub const KEY_LISTEN_PORT: &str = "wgListenPort";
pub const KEY_PRIVATE_KEY: &str = "wgPrivateKey";
pub const KEY_PUBLIC_KEY: &str = "wgPublicKey";
pub const KEY_ALLOWED_IP: &str = "wgAllowedIp";

const KEY_MTU: &str = "mtu";
const KEY_KEEPALIVE: &str = "persistentKeepalive";
const KEY_CONNECT_TIMEOUT: &str = "connectTimeoutSecs";
const KEY_IDLE_TIMEOUT: &str = "idleTimeoutSecs";
const KEY_MAX_CONNECTION: &str = "maxConnectionSecs";
const KEY_BUFFER_SIZE: &str = "bufferSize";
const KEY_LOG_LEVEL: &str = "logLevel";
const KEY_LOG_FORMAT: &str = "logFormat";

const KNOWN_KEYS: [&str; 14] = [
    KEY_INTERCEPT_IP,
    KEY_INTERCEPT_PORT,
    KEY_LISTEN_PORT,
    KEY_PRIVATE_KEY,
    KEY_PUBLIC_KEY,
    KEY_ALLOWED_IP,
    KEY_MTU,
    KEY_KEEPALIVE,
    KEY_CONNECT_TIMEOUT,
    KEY_IDLE_TIMEOUT,
    KEY_MAX_CONNECTION,
    KEY_BUFFER_SIZE,
    KEY_LOG_LEVEL,
    KEY_LOG_FORMAT,
];

/// Split configuration text into `key -> value` pairs
///
/// # Errors
///
/// Returns `ConfigError::MalformedLine` for a line without `=` or with an
/// empty key.
pub fn parse_lines(contents: &str) -> Result<HashMap<String, String>, ConfigError> {
    let mut entries = HashMap::new();

    for (index, raw) in contents.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with("//") || line.starts_with('#') {
            continue;
        }

        let malformed = || ConfigError::MalformedLine {
            line: index + 1,
            content: line.to_string(),
        };

        let (key, value) = line.split_once('=').ok_or_else(malformed)?;
        let key = key.trim();
        if key.is_empty() {
            return Err(malformed());
        }

        if !KNOWN_KEYS.contains(&key) {
            debug!("Ignoring unknown configuration key {:?} on line {}", key, index + 1);
            continue;
        }

        if entries
            .insert(key.to_string(), value.trim().to_string())
            .is_some()
        {
            debug!("Configuration key {} repeated on line {}, last value wins", key, index + 1);
        }
    }

    Ok(entries)
}

/// Fetch a required, non-empty value
fn required<'a>(
    entries: &'a HashMap<String, String>,
    key: &'static str,
) -> Result<&'a str, ConfigError> {
    entries
        .get(key)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::MissingKey(key))
}

/// Fetch and parse an optional value
fn optional<T: FromStr>(
    entries: &HashMap<String, String>,
    key: &str,
) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match entries.get(key).filter(|v| !v.is_empty()) {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::invalid_value(key, value, e.to_string())),
        None => Ok(None),
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e: T::Err| ConfigError::invalid_value(key, value, e.to_string()))
}

fn parse_key(key: &str, value: &str) -> Result<WgKey, ConfigError> {
    WgKey::parse(value).map_err(|reason| ConfigError::invalid_key(key, reason))
}

/// Parse an allowed source range; a bare address becomes a host prefix
pub fn parse_allowed_ip(value: &str) -> Result<IpNet, ConfigError> {
    if let Ok(net) = value.parse::<IpNet>() {
        return Ok(net);
    }
    value
        .parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|_| ConfigError::invalid_value(KEY_ALLOWED_IP, value, "expected a CIDR range or address"))
}

/// Build a `Config` from parsed entries
fn build_config(entries: &HashMap<String, String>) -> Result<Config, ConfigError> {
    // All six required keys are checked for presence before any is parsed
    let intercept_ip = required(entries, KEY_INTERCEPT_IP)?;
    let intercept_port = required(entries, KEY_INTERCEPT_PORT)?;
    let listen_port = required(entries, KEY_LISTEN_PORT)?;
    let private_key = required(entries, KEY_PRIVATE_KEY)?;
    let public_key = required(entries, KEY_PUBLIC_KEY)?;
    let allowed_ip = required(entries, KEY_ALLOWED_IP)?;

    let tunnel = TunnelConfig {
        intercept_ip: parse_value(KEY_INTERCEPT_IP, intercept_ip)?,
        intercept_port: parse_value(KEY_INTERCEPT_PORT, intercept_port)?,
        listen_port: parse_value(KEY_LISTEN_PORT, listen_port)?,
        private_key: parse_key(KEY_PRIVATE_KEY, private_key)?,
        peer_public_key: parse_key(KEY_PUBLIC_KEY, public_key)?,
        allowed_ip: parse_allowed_ip(allowed_ip)?,
    };

    let relay_defaults = RelayConfig::default();
    let relay = RelayConfig {
        connect_timeout_secs: optional(entries, KEY_CONNECT_TIMEOUT)?
            .unwrap_or(relay_defaults.connect_timeout_secs),
        idle_timeout_secs: optional(entries, KEY_IDLE_TIMEOUT)?
            .unwrap_or(relay_defaults.idle_timeout_secs),
        max_connection_secs: optional(entries, KEY_MAX_CONNECTION)?,
        buffer_size: optional(entries, KEY_BUFFER_SIZE)?.unwrap_or(relay_defaults.buffer_size),
    };

    let options = TunnelOptions {
        mtu: optional(entries, KEY_MTU)?.unwrap_or(TunnelOptions::default().mtu),
        persistent_keepalive: optional(entries, KEY_KEEPALIVE)?,
    };

    let log_defaults = LogConfig::default();
    let log = LogConfig {
        level: entries
            .get(KEY_LOG_LEVEL)
            .cloned()
            .unwrap_or(log_defaults.level),
        format: entries
            .get(KEY_LOG_FORMAT)
            .cloned()
            .unwrap_or(log_defaults.format),
    };

    Ok(Config {
        tunnel,
        relay,
        options,
        log,
    })
}

/// Load configuration from a file
///
/// # Arguments
///
/// * `path` - Path to the configuration file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read or parsed.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;
    let config = load_config_str(&contents)?;

    info!(
        "Configuration loaded: intercept {}:{}, wireguard port {}, allowed {}",
        config.tunnel.intercept_ip,
        config.tunnel.intercept_port,
        config.tunnel.listen_port,
        config.tunnel.allowed_ip
    );

    Ok(config)
}

/// Load configuration from a string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(contents: &str) -> Result<Config, ConfigError> {
    let entries = parse_lines(contents)?;
    let config = build_config(&entries)?;
    config.validate()?;
    Ok(config)
}

/// Load configuration with environment variable overrides
///
/// Environment variables:
/// - `WG_FORWARDER_LOG_LEVEL`: Override log level
/// - `WG_FORWARDER_LOG_FORMAT`: Override log format
/// - `WG_FORWARDER_MTU`: Override interface MTU
///
/// # Errors
///
/// Returns `ConfigError` if loading or parsing fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let config = load_config(path)?;
    apply_env_overrides(config, |name| std::env::var(name).ok())
}

/// Apply overrides from an environment lookup and re-validate
fn apply_env_overrides(
    mut config: Config,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Config, ConfigError> {
    if let Some(level) = lookup("WG_FORWARDER_LOG_LEVEL") {
        config.log.level = level;
        debug!("Log level overridden to {}", config.log.level);
    }

    if let Some(format) = lookup("WG_FORWARDER_LOG_FORMAT") {
        config.log.format = format;
        debug!("Log format overridden to {}", config.log.format);
    }

    if let Some(mtu) = lookup("WG_FORWARDER_MTU") {
        config.options.mtu = mtu.parse().map_err(|_| ConfigError::EnvError {
            name: "WG_FORWARDER_MTU".into(),
            reason: format!("Invalid number: {mtu}"),
        })?;
        debug!("MTU overridden to {}", config.options.mtu);
    }

    // Re-validate after overrides
    config.validate()?;

    Ok(config)
}
