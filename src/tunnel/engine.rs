//! WireGuard engine task
//!
//! Owns the boringtun `Tunn` and the UDP sockets (IPv4, plus IPv6 where the
//! host supports it, on the same port). The endpoint is passive: it
//! never dials the peer. The peer's UDP address is learned from the first
//! authenticated datagram and follows the peer when it roams.
//!
//! One task selects over four sources:
//! - UDP datagrams from the peer, decapsulated and handed to the netstack
//! - plaintext packets from the netstack, encapsulated and sent to the peer
//!   when their destination lies in the allowed range
//! - a 250 ms timer driving handshake, keepalive and rekey timers
//! - the shutdown signal

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use boringtun::noise::{Tunn, TunnResult};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::error::TunnelInitError;
use crate::tunnel::settings::EngineSettings;

/// WireGuard transport overhead (header + Poly1305 tag)
pub const WG_TRANSPORT_OVERHEAD: usize = 32;

/// Size of a handshake initiation message, the largest control message
pub const WG_HANDSHAKE_INIT_SIZE: usize = 148;

/// Timer tick interval for boringtun's `update_timers`
const TIMER_TICK_MS: u64 = 250;

/// UDP receive buffer size
const UDP_RECV_BUFFER_SIZE: usize = 65536;

/// Peer endpoint shared between the engine task and the tunnel handle
pub type SharedEndpoint = Arc<Mutex<Option<SocketAddr>>>;

/// The WireGuard engine for a single peer
pub struct WgEngine {
    tunn: Tunn,
    socket: UdpSocket,
    socket_v6: Option<UdpSocket>,
    settings: EngineSettings,
    peer_endpoint: SharedEndpoint,
    inbound_tx: mpsc::Sender<Vec<u8>>,
    outbound_rx: mpsc::Receiver<Vec<u8>>,
}

impl WgEngine {
    /// Create the engine and bind its UDP socket
    ///
    /// # Errors
    ///
    /// - `TunnelInitError::Engine` if boringtun rejects the keys
    /// - `TunnelInitError::Bind` if the IPv4 listen port cannot be bound
    ///
    /// A failed IPv6 bind is logged and the engine runs IPv4 only.
    pub async fn bind(
        settings: EngineSettings,
        inbound_tx: mpsc::Sender<Vec<u8>>,
        outbound_rx: mpsc::Receiver<Vec<u8>>,
    ) -> Result<Self, TunnelInitError> {
        // boringtun shifts the index left by 8 bits
        let index = rand::random::<u32>() >> 8;
        let tunn = Tunn::new(
            settings.private_key.to_static_secret(),
            settings.peer_public_key.to_public_key(),
            None, // No pre-shared key
            settings.persistent_keepalive,
            index,
            None, // No rate limiter
        )
        .map_err(|e| TunnelInitError::Engine(e.to_string()))?;

        let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), settings.listen_port);
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| TunnelInitError::bind(settings.listen_port, &e))?;

        let port = socket
            .local_addr()
            .map_err(|e| TunnelInitError::bind(settings.listen_port, &e))?
            .port();
        let socket_v6 = match bind_v6(port) {
            Ok(socket) => Some(socket),
            Err(e) => {
                warn!("IPv6 UDP unavailable on port {}: {}", port, e);
                None
            }
        };

        debug!(
            "WireGuard engine bound to udp/{} (ipv6: {}), allowed sources {:?}",
            port,
            socket_v6.is_some(),
            settings.allowed_ips
        );

        Ok(Self {
            tunn,
            socket,
            socket_v6,
            settings,
            peer_endpoint: Arc::new(Mutex::new(None)),
            inbound_tx,
            outbound_rx,
        })
    }

    /// Local UDP port (useful when bound to port 0)
    ///
    /// # Errors
    ///
    /// Returns an error if the socket address cannot be read.
    pub fn local_port(&self) -> std::io::Result<u16> {
        self.socket.local_addr().map(|a| a.port())
    }

    /// Shared view of the learned peer endpoint
    #[must_use]
    pub fn peer_endpoint(&self) -> SharedEndpoint {
        Arc::clone(&self.peer_endpoint)
    }

    /// Run until shutdown or until the netstack goes away
    pub async fn run(mut self, mut shutdown_rx: oneshot::Receiver<()>) {
        let mut timer = interval(Duration::from_millis(TIMER_TICK_MS));
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut recv_buf = vec![0u8; UDP_RECV_BUFFER_SIZE];
        let mut recv_buf_v6 = vec![0u8; UDP_RECV_BUFFER_SIZE];
        let mut dst_buf = vec![0u8; UDP_RECV_BUFFER_SIZE];

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    debug!("WireGuard engine received shutdown signal");
                    break;
                }

                _ = timer.tick() => {
                    self.update_timers(&mut dst_buf).await;
                }

                result = self.socket.recv_from(&mut recv_buf) => match result {
                    Ok((len, src)) => {
                        self.handle_datagram(&recv_buf[..len], src, &mut dst_buf).await;
                    }
                    Err(e) => warn!("UDP receive error: {}", e),
                },

                result = recv_optional(self.socket_v6.as_ref(), &mut recv_buf_v6) => match result {
                    Ok((len, src)) => {
                        self.handle_datagram(&recv_buf_v6[..len], src, &mut dst_buf).await;
                    }
                    Err(e) => warn!("UDP receive error (ipv6): {}", e),
                },

                packet = self.outbound_rx.recv() => match packet {
                    Some(packet) => self.send_packet(&packet, &mut dst_buf).await,
                    None => {
                        debug!("Outbound packet channel closed");
                        break;
                    }
                },
            }
        }

        debug!("WireGuard engine exiting");
    }

    async fn handle_datagram(&mut self, datagram: &[u8], src: SocketAddr, dst: &mut [u8]) {
        match self.tunn.decapsulate(Some(src.ip()), datagram, dst) {
            TunnResult::Done => {}
            TunnResult::Err(e) => {
                debug!("Dropped {} byte datagram from {}: {:?}", datagram.len(), src, e);
            }
            TunnResult::WriteToNetwork(packet) => {
                self.learn_endpoint(src);
                self.send_to(packet, src).await;

                // Flush packets queued while the handshake was in progress
                loop {
                    match self.tunn.decapsulate(None, &[], dst) {
                        TunnResult::WriteToNetwork(packet) => self.send_to(packet, src).await,
                        _ => break,
                    }
                }
            }
            TunnResult::WriteToTunnelV4(packet, source) => {
                self.learn_endpoint(src);
                self.deliver(packet, IpAddr::V4(source));
            }
            TunnResult::WriteToTunnelV6(packet, source) => {
                self.learn_endpoint(src);
                self.deliver(packet, IpAddr::V6(source));
            }
        }
    }

    /// Pass a decrypted packet to the netstack if its source is allowed
    fn deliver(&self, packet: &[u8], source: IpAddr) {
        if packet.is_empty() {
            trace!("Keepalive from peer");
            return;
        }

        if !self.settings.is_source_allowed(source) {
            warn!("Dropped packet from {} - not in allowed source range", source);
            return;
        }

        if self.inbound_tx.try_send(packet.to_vec()).is_err() {
            // TCP retransmits; never block the engine on the netstack
            trace!("Inbound queue full, dropped {} byte packet", packet.len());
        }
    }

    async fn send_packet(&mut self, packet: &[u8], dst: &mut [u8]) {
        // Cryptokey routing: only destinations the peer owns go out
        match Tunn::dst_address(packet) {
            Some(destination) if self.settings.is_source_allowed(destination) => {}
            Some(destination) => {
                debug!("Dropped outbound packet to {} - not routed to the peer", destination);
                return;
            }
            None => {
                trace!("Dropped {} byte outbound packet without a destination", packet.len());
                return;
            }
        }

        let Some(endpoint) = *self.peer_endpoint.lock() else {
            trace!("No peer endpoint learned yet, dropping {} byte packet", packet.len());
            return;
        };

        match self.tunn.encapsulate(packet, dst) {
            TunnResult::WriteToNetwork(data) => self.send_to(data, endpoint).await,
            TunnResult::Err(e) => warn!("Encapsulate failed: {:?}", e),
            _ => {}
        }
    }

    async fn update_timers(&mut self, dst: &mut [u8]) {
        match self.tunn.update_timers(dst) {
            TunnResult::WriteToNetwork(data) => {
                let endpoint = *self.peer_endpoint.lock();
                if let Some(endpoint) = endpoint {
                    self.send_to(data, endpoint).await;
                }
            }
            TunnResult::Err(e) => trace!("Timer update: {:?}", e),
            _ => {}
        }
    }

    async fn send_to(&self, data: &[u8], endpoint: SocketAddr) {
        let socket = match (endpoint, &self.socket_v6) {
            (SocketAddr::V6(_), Some(v6)) => v6,
            _ => &self.socket,
        };
        if let Err(e) = socket.send_to(data, endpoint).await {
            warn!("Failed to send {} bytes to {}: {}", data.len(), endpoint, e);
        }
    }

    fn learn_endpoint(&self, src: SocketAddr) {
        let mut endpoint = self.peer_endpoint.lock();
        if *endpoint != Some(src) {
            match *endpoint {
                Some(old) => info!("Peer roamed from {} to {}", old, src),
                None => info!("Peer endpoint learned: {}", src),
            }
            *endpoint = Some(src);
        }
    }
}

/// IPv6-only UDP socket on `port`, next to the IPv4 one
fn bind_v6(port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_only_v6(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port).into())?;
    UdpSocket::from_std(socket.into())
}

async fn recv_optional(
    socket: Option<&UdpSocket>,
    buf: &mut [u8],
) -> std::io::Result<(usize, SocketAddr)> {
    match socket {
        Some(socket) => socket.recv_from(buf).await,
        None => std::future::pending().await,
    }
}
