//! WireGuard tunnel endpoint on a userspace virtual interface
//!
//! The endpoint is two background tasks joined by packet channels:
//!
//! ```text
//!            UDP                 decrypted IP            TCP streams
//!  peer <==========> WgEngine <===============> NetStack <==========> listeners
//!                  (boringtun)                  (smoltcp)
//! ```
//!
//! `TunnelHandle::establish` renders the configuration as engine settings
//! text, applies it, binds the UDP port, brings the virtual interface up on
//! the intercept address and returns a handle that can open TCP listeners on
//! that interface.
//!
//! # Key Generation
//!
//! ```
//! use wg_forwarder::tunnel::{generate_private_key, validate_key};
//!
//! let private_key = generate_private_key();
//! let public_key = private_key.public_key();
//! assert!(validate_key(&public_key.to_base64()));
//! ```

pub mod device;
pub mod engine;
pub mod keys;
pub mod netstack;
pub mod settings;
pub mod stream;

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{TunnelConfig, TunnelOptions};
use crate::error::TunnelInitError;

pub use engine::WgEngine;
pub use keys::{generate_private_key, validate_key, WgKey};
pub use netstack::{NetStack, NetStackConfig};
pub use settings::EngineSettings;
pub use stream::{TunnelTcpListener, TunnelTcpStream};

/// Packets buffered between the engine and the netstack, per direction
const PACKET_CHANNEL_CAPACITY: usize = 1024;

/// How long shutdown waits for each background task
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// A live tunnel endpoint
///
/// Dropping the handle stops both background tasks; `shutdown` does the same
/// and waits for them.
pub struct TunnelHandle {
    config: TunnelConfig,
    netstack: NetStack,
    local_port: u16,
    peer_endpoint: engine::SharedEndpoint,
    engine_shutdown: Option<oneshot::Sender<()>>,
    netstack_shutdown: Option<oneshot::Sender<()>>,
    engine_task: Option<JoinHandle<()>>,
    netstack_task: Option<JoinHandle<()>>,
}

impl TunnelHandle {
    /// Build the endpoint from configuration
    ///
    /// # Errors
    ///
    /// Returns `TunnelInitError` if the settings are rejected, the UDP port
    /// cannot be bound, or the virtual interface cannot be configured.
    pub async fn establish(
        config: TunnelConfig,
        options: &TunnelOptions,
    ) -> Result<Self, TunnelInitError> {
        let settings = EngineSettings::from_config(&config, options.persistent_keepalive);
        Self::with_settings(config, options.mtu, Vec::new(), &settings.to_string()).await
    }

    /// Build the endpoint from an address, MTU, resolvers and engine settings text
    ///
    /// # Errors
    ///
    /// Returns `TunnelInitError` if the settings text does not parse, the UDP
    /// port cannot be bound, or the virtual interface cannot be configured.
    pub async fn with_settings(
        config: TunnelConfig,
        mtu: usize,
        dns_servers: Vec<IpAddr>,
        settings: &str,
    ) -> Result<Self, TunnelInitError> {
        let settings: EngineSettings = settings.parse()?;

        let (inbound_tx, inbound_rx) = mpsc::channel(PACKET_CHANNEL_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(PACKET_CHANNEL_CAPACITY);

        let engine = WgEngine::bind(settings, inbound_tx, outbound_rx).await?;
        let local_port = engine
            .local_port()
            .map_err(|e| TunnelInitError::bind(config.listen_port, &e))?;
        let peer_endpoint = engine.peer_endpoint();

        let (netstack_shutdown, netstack_shutdown_rx) = oneshot::channel();
        let (netstack, netstack_task) = NetStack::spawn(
            &NetStackConfig {
                address: config.intercept_ip,
                mtu,
                dns_servers,
            },
            inbound_rx,
            outbound_tx,
            netstack_shutdown_rx,
        )?;

        let (engine_shutdown, engine_shutdown_rx) = oneshot::channel();
        let engine_task = tokio::spawn(engine.run(engine_shutdown_rx));

        info!(
            "Tunnel endpoint up: wireguard udp/{}, interface {}",
            local_port, config.intercept_ip
        );

        Ok(Self {
            config,
            netstack,
            local_port,
            peer_endpoint,
            engine_shutdown: Some(engine_shutdown),
            netstack_shutdown: Some(netstack_shutdown),
            engine_task: Some(engine_task),
            netstack_task: Some(netstack_task),
        })
    }

    /// Open a TCP listener on the virtual interface
    ///
    /// # Errors
    ///
    /// Returns `TunnelInitError::Listen` if the port is taken or the
    /// interface has stopped.
    pub async fn listen_tcp(&self, port: u16) -> Result<TunnelTcpListener, TunnelInitError> {
        self.netstack.listen_tcp(port).await
    }

    /// Configuration the endpoint was built from
    #[must_use]
    pub const fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Bound WireGuard UDP port
    #[must_use]
    pub const fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Address of the virtual interface
    #[must_use]
    pub const fn interface_address(&self) -> IpAddr {
        self.netstack.address()
    }

    /// Peer UDP endpoint, once the peer has completed a handshake
    #[must_use]
    pub fn peer_endpoint(&self) -> Option<SocketAddr> {
        *self.peer_endpoint.lock()
    }

    /// Stop the virtual interface and the engine, waiting for both
    pub async fn shutdown(mut self) {
        // Interface first so its resets still reach the engine
        if let Some(tx) = self.netstack_shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.netstack_task.take() {
            if tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, task).await.is_err() {
                warn!("Virtual interface did not stop in time");
            }
        }

        if let Some(tx) = self.engine_shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.engine_task.take() {
            if tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, task).await.is_err() {
                warn!("WireGuard engine did not stop in time");
            }
        }

        info!("Tunnel endpoint shut down");
    }
}

impl Drop for TunnelHandle {
    fn drop(&mut self) {
        // Dropped senders wake the tasks' shutdown branches
        self.netstack_shutdown.take();
        self.engine_shutdown.take();
    }
}

impl std::fmt::Debug for TunnelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelHandle")
            .field("interface", &self.config.intercept_ip)
            .field("local_port", &self.local_port)
            .field("peer_endpoint", &self.peer_endpoint())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tunnel_config() -> TunnelConfig {
        TunnelConfig {
            intercept_ip: "10.0.0.2".parse().unwrap(),
            intercept_port: 8080,
            listen_port: 0,
            private_key: generate_private_key(),
            peer_public_key: generate_private_key().public_key(),
            allowed_ip: "10.0.0.1/32".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_establish_and_listen() {
        let tunnel = TunnelHandle::establish(tunnel_config(), &TunnelOptions::default())
            .await
            .unwrap();
        assert_ne!(tunnel.local_port(), 0);
        assert_eq!(tunnel.interface_address().to_string(), "10.0.0.2");
        assert!(tunnel.peer_endpoint().is_none());

        let listener = tunnel.listen_tcp(8080).await.unwrap();
        assert_eq!(listener.local_addr().to_string(), "10.0.0.2:8080");

        // Same port twice is refused
        assert!(matches!(
            tunnel.listen_tcp(8080).await,
            Err(TunnelInitError::Listen { port: 8080, .. })
        ));

        tunnel.shutdown().await;
    }

    #[tokio::test]
    async fn test_listener_closed_after_shutdown() {
        let tunnel = TunnelHandle::establish(tunnel_config(), &TunnelOptions::default())
            .await
            .unwrap();
        let mut listener = tunnel.listen_tcp(8080).await.unwrap();

        tunnel.shutdown().await;
        let result = tokio::time::timeout(Duration::from_secs(2), listener.accept())
            .await
            .unwrap();
        assert!(matches!(result, Err(crate::error::AcceptError::Closed)));
    }

    #[tokio::test]
    async fn test_bad_settings_text_rejected() {
        let result =
            TunnelHandle::with_settings(tunnel_config(), 1420, Vec::new(), "listen_port=0\n").await;
        assert!(matches!(result, Err(TunnelInitError::InvalidSettings(_))));
    }

    #[tokio::test]
    async fn test_ipv6_interface() {
        let mut config = tunnel_config();
        config.intercept_ip = "fd00::2".parse().unwrap();
        config.allowed_ip = "fd00::1/128".parse().unwrap();
        let tunnel = TunnelHandle::establish(config, &TunnelOptions::default())
            .await
            .unwrap();
        let listener = tunnel.listen_tcp(443).await.unwrap();
        assert_eq!(listener.local_addr().to_string(), "[fd00::2]:443");
        tunnel.shutdown().await;
    }
}
