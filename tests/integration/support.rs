//! Test-side WireGuard peer
//!
//! `TestPeer` is a tunnel client: a boringtun `Tunn` on a loopback UDP
//! socket plus a client-side smoltcp interface. It is driven by hand through
//! `step`, which polls the interface, encrypts whatever it emitted, and
//! decrypts whatever the endpoint sent.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use boringtun::noise::{Tunn, TunnResult};
use smoltcp::iface::{Config as IfaceConfig, Interface, SocketHandle, SocketSet};
use smoltcp::socket::tcp::{Socket as TcpSocket, SocketBuffer, State as TcpState};
use smoltcp::time::Instant as SmoltcpInstant;
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr};
use tokio::net::{TcpListener, UdpSocket};

use wg_forwarder::config::{TunnelConfig, UpstreamTarget};
use wg_forwarder::tunnel::device::TunnelDevice;
use wg_forwarder::tunnel::{generate_private_key, WgKey};

const TIMER_TICK: Duration = Duration::from_millis(250);
const SOCKET_BUFFER_SIZE: usize = 64 * 1024;

/// Keys for both ends of a test tunnel
pub struct TestKeys {
    pub server_private: WgKey,
    pub client_private: WgKey,
}

impl TestKeys {
    pub fn generate() -> Self {
        Self {
            server_private: generate_private_key(),
            client_private: generate_private_key(),
        }
    }

    /// Endpoint configuration intercepting `intercept:port`
    pub fn tunnel_config(&self, intercept: Ipv4Addr, port: u16, allowed: &str) -> TunnelConfig {
        TunnelConfig {
            intercept_ip: intercept.into(),
            intercept_port: port,
            listen_port: 0,
            private_key: self.server_private.clone(),
            peer_public_key: self.client_private.public_key(),
            allowed_ip: allowed.parse().unwrap(),
        }
    }
}

/// Upstream that writes `reply` to every connection and closes it
pub async fn reply_upstream(reply: &'static [u8]) -> UpstreamTarget {
    use tokio::io::AsyncWriteExt;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = listener.local_addr().unwrap().to_string().parse().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = socket.write_all(reply).await;
            });
        }
    });
    target
}

/// Upstream that echoes every connection back
pub async fn echo_upstream() -> UpstreamTarget {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = listener.local_addr().unwrap().to_string().parse().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = socket.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    target
}

/// Upstream address nothing listens on
pub async fn unreachable_upstream() -> UpstreamTarget {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = listener.local_addr().unwrap().to_string().parse().unwrap();
    drop(listener);
    target
}

/// A tunnel client talking to the endpoint over loopback UDP
pub struct TestPeer {
    tunn: Tunn,
    udp: UdpSocket,
    server: SocketAddr,
    iface: Interface,
    device: TunnelDevice,
    sockets: SocketSet<'static>,
    next_port: u16,
    last_timer: Instant,
    buf: Vec<u8>,
    recv_buf: Vec<u8>,
}

impl TestPeer {
    /// Client at `address` for the endpoint listening on `server`
    pub async fn new(keys: &TestKeys, address: Ipv4Addr, server: SocketAddr) -> Self {
        let tunn = Tunn::new(
            keys.client_private.to_static_secret(),
            keys.server_private.public_key().to_public_key(),
            None,
            None,
            rand::random::<u32>() >> 8,
            None,
        )
        .unwrap();

        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let mut device = TunnelDevice::new(1420);
        let mut iface = Interface::new(
            IfaceConfig::new(HardwareAddress::Ip),
            &mut device,
            SmoltcpInstant::now(),
        );
        let [a, b, c, d] = address.octets();
        iface.update_ip_addrs(|addrs| {
            addrs.push(IpCidr::new(IpAddress::v4(a, b, c, d), 24)).unwrap();
        });

        Self {
            tunn,
            udp,
            server,
            iface,
            device,
            sockets: SocketSet::new(Vec::new()),
            next_port: 49152,
            last_timer: Instant::now(),
            buf: vec![0u8; 65536],
            recv_buf: vec![0u8; 65536],
        }
    }

    /// Local UDP address the endpoint sees as the peer endpoint
    pub fn udp_addr(&self) -> SocketAddr {
        self.udp.local_addr().unwrap()
    }

    /// Start a TCP connect to `remote:port` inside the tunnel
    pub fn tcp_connect(&mut self, remote: Ipv4Addr, port: u16) -> SocketHandle {
        let socket = TcpSocket::new(
            SocketBuffer::new(vec![0u8; SOCKET_BUFFER_SIZE]),
            SocketBuffer::new(vec![0u8; SOCKET_BUFFER_SIZE]),
        );
        let handle = self.sockets.add(socket);

        let local_port = self.next_port;
        self.next_port += 1;

        let [a, b, c, d] = remote.octets();
        self.sockets
            .get_mut::<TcpSocket>(handle)
            .connect(self.iface.context(), (IpAddress::v4(a, b, c, d), port), local_port)
            .unwrap();
        handle
    }

    pub fn state(&self, handle: SocketHandle) -> TcpState {
        self.sockets.get::<TcpSocket>(handle).state()
    }

    /// Send FIN on a connection
    pub fn close(&mut self, handle: SocketHandle) {
        self.sockets.get_mut::<TcpSocket>(handle).close();
    }

    /// One round of interface poll, encryption and decryption
    pub async fn step(&mut self) {
        self.poll_and_send().await;

        if let Ok(Ok((len, _))) = tokio::time::timeout(
            Duration::from_millis(5),
            self.udp.recv_from(&mut self.recv_buf),
        )
        .await
        {
            let datagram = self.recv_buf[..len].to_vec();
            self.handle_datagram(&datagram).await;

            while let Ok((len, _)) = self.udp.try_recv_from(&mut self.recv_buf) {
                let datagram = self.recv_buf[..len].to_vec();
                self.handle_datagram(&datagram).await;
            }
        }

        if self.last_timer.elapsed() >= TIMER_TICK {
            self.last_timer = Instant::now();
            if let TunnResult::WriteToNetwork(data) = self.tunn.update_timers(&mut self.buf) {
                let _ = self.udp.send_to(data, self.server).await;
            }
        }

        self.poll_and_send().await;
    }

    async fn poll_and_send(&mut self) {
        self.iface
            .poll(SmoltcpInstant::now(), &mut self.device, &mut self.sockets);

        while let Some(packet) = self.device.pop_tx() {
            if let TunnResult::WriteToNetwork(data) = self.tunn.encapsulate(&packet, &mut self.buf) {
                self.udp.send_to(data, self.server).await.unwrap();
            }
        }
    }

    async fn handle_datagram(&mut self, datagram: &[u8]) {
        match self.tunn.decapsulate(None, datagram, &mut self.buf) {
            TunnResult::WriteToNetwork(data) => {
                self.udp.send_to(data, self.server).await.unwrap();
                while let TunnResult::WriteToNetwork(data) =
                    self.tunn.decapsulate(None, &[], &mut self.buf)
                {
                    self.udp.send_to(data, self.server).await.unwrap();
                }
            }
            TunnResult::WriteToTunnelV4(packet, _) => {
                if !packet.is_empty() {
                    self.device.push_rx(packet.to_vec());
                }
            }
            _ => {}
        }
    }

    /// Drive the peer until the connection is established or fails
    pub async fn wait_established(&mut self, handle: SocketHandle, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            self.step().await;
            match self.state(handle) {
                TcpState::Established => return true,
                TcpState::Closed | TcpState::TimeWait => return false,
                _ => {}
            }
        }
        false
    }

    /// Queue all of `data` on the connection
    pub async fn send_all(&mut self, handle: SocketHandle, data: &[u8]) {
        let mut sent = 0;
        let deadline = Instant::now() + Duration::from_secs(10);
        while sent < data.len() {
            assert!(Instant::now() < deadline, "send timed out");
            let socket = self.sockets.get_mut::<TcpSocket>(handle);
            if socket.can_send() {
                sent += socket.send_slice(&data[sent..]).unwrap();
            }
            self.step().await;
        }
    }

    /// Read exactly `len` bytes from the connection
    pub async fn read_exact(&mut self, handle: SocketHandle, len: usize) -> Vec<u8> {
        let mut received = Vec::with_capacity(len);
        let mut chunk = vec![0u8; 16 * 1024];
        let deadline = Instant::now() + Duration::from_secs(10);
        while received.len() < len {
            assert!(Instant::now() < deadline, "read timed out after {} bytes", received.len());
            self.step().await;
            let socket = self.sockets.get_mut::<TcpSocket>(handle);
            while socket.can_recv() && received.len() < len {
                let want = (len - received.len()).min(chunk.len());
                let n = socket.recv_slice(&mut chunk[..want]).unwrap();
                received.extend_from_slice(&chunk[..n]);
            }
        }
        received
    }

    /// Read until the endpoint closes its side; `None` on timeout
    pub async fn read_to_close(&mut self, handle: SocketHandle, timeout: Duration) -> Option<Vec<u8>> {
        let mut received = Vec::new();
        let mut chunk = vec![0u8; 16 * 1024];
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            self.step().await;
            let socket = self.sockets.get_mut::<TcpSocket>(handle);
            while socket.can_recv() {
                let n = socket.recv_slice(&mut chunk).unwrap();
                received.extend_from_slice(&chunk[..n]);
            }
            if !socket.may_recv() && !socket.can_recv() {
                return Some(received);
            }
        }
        None
    }
}
