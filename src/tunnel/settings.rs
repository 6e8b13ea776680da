//! Engine settings in the WireGuard configuration-protocol text form
//!
//! The tunnel engine is configured with newline-separated `key=value` lines,
//! keys in hex:
//!
//! ```text
//! private_key=<64 hex chars>
//! listen_port=51820
//! public_key=<64 hex chars>
//! allowed_ip=10.0.0.1/32
//! ```
//!
//! `public_key` opens the peer section, so `allowed_ip` must follow it.
//! Rendering settings and parsing them back yields the same value.

use std::fmt;
use std::str::FromStr;

use ipnet::IpNet;

use crate::config::TunnelConfig;
use crate::error::TunnelInitError;
use crate::tunnel::keys::WgKey;

/// Settings applied to the WireGuard engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Local private key
    pub private_key: WgKey,
    /// UDP listen port
    pub listen_port: u16,
    /// The single peer's public key
    pub peer_public_key: WgKey,
    /// Source ranges the peer may use inside the tunnel
    pub allowed_ips: Vec<IpNet>,
    /// Persistent keepalive interval in seconds
    pub persistent_keepalive: Option<u16>,
}

impl EngineSettings {
    /// Build settings from a tunnel configuration
    #[must_use]
    pub fn from_config(config: &TunnelConfig, persistent_keepalive: Option<u16>) -> Self {
        Self {
            private_key: config.private_key.clone(),
            listen_port: config.listen_port,
            peer_public_key: config.peer_public_key.clone(),
            allowed_ips: vec![config.allowed_ip],
            persistent_keepalive,
        }
    }

    /// Whether a decrypted packet's source address is permitted
    #[must_use]
    pub fn is_source_allowed(&self, ip: std::net::IpAddr) -> bool {
        self.allowed_ips.iter().any(|net| net.contains(&ip))
    }
}

impl fmt::Display for EngineSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "private_key={}", self.private_key.to_hex())?;
        writeln!(f, "listen_port={}", self.listen_port)?;
        writeln!(f, "public_key={}", self.peer_public_key.to_hex())?;
        if let Some(keepalive) = self.persistent_keepalive {
            writeln!(f, "persistent_keepalive_interval={keepalive}")?;
        }
        for net in &self.allowed_ips {
            writeln!(f, "allowed_ip={net}")?;
        }
        Ok(())
    }
}

impl FromStr for EngineSettings {
    type Err = TunnelInitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |msg: String| TunnelInitError::InvalidSettings(msg);

        let mut private_key = None;
        let mut listen_port = None;
        let mut peer_public_key: Option<WgKey> = None;
        let mut allowed_ips = Vec::new();
        let mut persistent_keepalive = None;

        for line in s.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| invalid(format!("expected key=value, got {line:?}")))?;

            match key {
                "private_key" => {
                    private_key = Some(WgKey::parse(value).map_err(|e| invalid(format!("private_key: {e}")))?);
                }
                "listen_port" => {
                    // 0 binds an ephemeral port
                    let port: u16 = value
                        .parse()
                        .map_err(|_| invalid(format!("listen_port: not a port number: {value:?}")))?;
                    listen_port = Some(port);
                }
                "public_key" => {
                    if peer_public_key.is_some() {
                        return Err(invalid("only one peer is supported".into()));
                    }
                    peer_public_key =
                        Some(WgKey::parse(value).map_err(|e| invalid(format!("public_key: {e}")))?);
                }
                "allowed_ip" => {
                    if peer_public_key.is_none() {
                        return Err(invalid("allowed_ip before public_key".into()));
                    }
                    allowed_ips.push(
                        value
                            .parse::<IpNet>()
                            .map_err(|e| invalid(format!("allowed_ip: {e}")))?,
                    );
                }
                "persistent_keepalive_interval" => {
                    let secs: u16 = value.parse().map_err(|_| {
                        invalid(format!("persistent_keepalive_interval: {value:?}"))
                    })?;
                    persistent_keepalive = (secs > 0).then_some(secs);
                }
                other => return Err(invalid(format!("unknown setting {other:?}"))),
            }
        }

        Ok(Self {
            private_key: private_key.ok_or_else(|| invalid("missing private_key".into()))?,
            listen_port: listen_port.ok_or_else(|| invalid("missing listen_port".into()))?,
            peer_public_key: peer_public_key.ok_or_else(|| invalid("missing public_key".into()))?,
            allowed_ips,
            persistent_keepalive,
        })
    }
}
