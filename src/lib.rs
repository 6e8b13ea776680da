//! wg-forwarder: userspace WireGuard traffic interceptor
//!
//! This crate terminates a WireGuard tunnel on a virtual network interface
//! that lives entirely in user space, accepts TCP connections arriving on
//! one port of that interface, and relays each of them to a fixed upstream
//! address. To tunnel clients the upstream appears to live inside the
//! tunnel.
//!
//! # Features
//!
//! - **Userspace WireGuard**: `boringtun` engine on a plain UDP socket
//! - **Virtual Interface**: `smoltcp` TCP/IP stack owning the intercept address
//! - **Roaming Peer**: the peer endpoint is learned and followed, never dialed
//! - **Relay**: byte-exact bidirectional copy with idle and lifetime limits
//!
//! # Architecture
//!
//! ```text
//! tunnel client ==UDP==> WgEngine -> NetStack -> Interceptor -> Relay -> upstream
//!                       (boringtun)  (smoltcp)    accept loop    TCP
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use wg_forwarder::config::load_config;
//! use wg_forwarder::interceptor::{run_accept_loop, Interceptor};
//! use wg_forwarder::tunnel::TunnelHandle;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("/etc/wg-forwarder.conf")?;
//! let port = config.tunnel.intercept_port;
//!
//! let tunnel = TunnelHandle::establish(config.tunnel, &config.options).await?;
//! let listener = tunnel.listen_tcp(port).await?;
//!
//! let interceptor = Arc::new(Interceptor::new("127.0.0.1:9000".parse()?, config.relay));
//! run_accept_loop(listener, interceptor).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration file parsing and typed settings
//! - [`error`]: Error types
//! - [`interceptor`]: Accept loop with backoff
//! - [`relay`]: Per-connection relay to the upstream
//! - [`tunnel`]: WireGuard endpoint and virtual interface

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod error;
pub mod interceptor;
pub mod relay;
pub mod tunnel;

// Re-export commonly used types at the crate root
pub use config::{load_config, load_config_with_env, Config, RelayConfig, UpstreamTarget};
pub use error::{
    AcceptError, ConfigError, ForwarderError, RelayIoError, TunnelInitError, UpstreamDialError,
};
pub use interceptor::{run_accept_loop, Acceptor, Interceptor};
pub use relay::CopyResult;
pub use tunnel::{TunnelHandle, TunnelTcpListener, TunnelTcpStream, WgKey};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
