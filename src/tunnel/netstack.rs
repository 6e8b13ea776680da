//! Userspace TCP/IP stack for the virtual interface
//!
//! One driver task owns the smoltcp `Interface`, its sockets and the
//! `TunnelDevice`. Everything else talks to it through channels:
//!
//! ```text
//!  WireGuard engine --inbound (decrypted)--> driver --accept--> TunnelTcpListener
//!  WireGuard engine <--outbound (plain)----- driver <--bytes--> TunnelTcpStream
//! ```
//!
//! Each loop iteration polls the interface, promotes listening sockets that
//! completed a handshake to accepted streams, moves bytes between sockets and
//! stream channels, and hands emitted packets to the engine. The loop sleeps
//! until a packet arrives, a stream signals activity, or smoltcp's next
//! timer is due.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes};
use smoltcp::iface::{Config as IfaceConfig, Interface, SocketHandle, SocketSet};
use smoltcp::socket::tcp::{Socket as TcpSocket, SocketBuffer, State as TcpState};
use smoltcp::time::Instant as SmoltcpInstant;
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, IpEndpoint, Ipv4Address, Ipv6Address};
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::error::{AcceptError, TunnelInitError};
use crate::tunnel::device::{TunnelDevice, MAX_QUEUE_DEPTH};
use crate::tunnel::stream::{AcceptItem, TunnelTcpListener, TunnelTcpStream};

/// Maximum sockets (listening and connected) on the interface
pub const MAX_SOCKETS: usize = 1024;

/// Listening sockets kept ready per port
pub const LISTEN_BACKLOG: usize = 4;

/// TCP receive/transmit buffer per socket
pub const TCP_BUFFER_SIZE: usize = 64 * 1024;

/// Chunks buffered between a socket and its stream, per direction
const STREAM_CHANNEL_CAPACITY: usize = 16;

/// Largest chunk read from a socket at once
const READ_CHUNK: usize = 16 * 1024;

/// How long a closing socket may wait for the peer before it is reset
const LINGER_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll delay bounds
const MIN_POLL_DELAY: Duration = Duration::from_millis(1);
const MAX_POLL_DELAY: Duration = Duration::from_millis(50);

/// Virtual interface settings
#[derive(Debug, Clone)]
pub struct NetStackConfig {
    /// Address owned by the interface
    pub address: IpAddr,
    /// Interface MTU
    pub mtu: usize,
    /// Resolvers handed to the interface; nothing on it resolves names
    pub dns_servers: Vec<IpAddr>,
}

enum Control {
    Listen {
        port: u16,
        reply: oneshot::Sender<Result<TunnelTcpListener, TunnelInitError>>,
    },
}

/// Handle to the netstack driver task
#[derive(Debug, Clone)]
pub struct NetStack {
    control_tx: mpsc::Sender<Control>,
    address: IpAddr,
}

impl std::fmt::Debug for Control {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Listen { port, .. } => write!(f, "Listen({port})"),
        }
    }
}

impl NetStack {
    /// Start the driver task
    ///
    /// `inbound_rx` carries decrypted IP packets from the tunnel engine and
    /// `outbound_tx` receives packets to encrypt. The driver stops when
    /// `shutdown_rx` fires or the engine drops `inbound_rx`'s sender.
    pub fn spawn(
        config: &NetStackConfig,
        inbound_rx: mpsc::Receiver<Vec<u8>>,
        outbound_tx: mpsc::Sender<Vec<u8>>,
        shutdown_rx: oneshot::Receiver<()>,
    ) -> Result<(Self, JoinHandle<()>), TunnelInitError> {
        let (control_tx, control_rx) = mpsc::channel(8);
        let driver = Driver::new(config, inbound_rx, outbound_tx, control_rx)?;

        info!(
            "Virtual interface up: address={}, mtu={}",
            config.address, config.mtu
        );
        if !config.dns_servers.is_empty() {
            debug!("Ignoring DNS servers {:?}", config.dns_servers);
        }

        let task = tokio::spawn(driver.run(shutdown_rx));
        Ok((
            Self {
                control_tx,
                address: config.address,
            },
            task,
        ))
    }

    /// Open a TCP listener on `port` of the virtual interface
    ///
    /// # Errors
    ///
    /// Returns `TunnelInitError::Listen` if the port is already in use, the
    /// socket limit is reached, or the driver has stopped.
    pub async fn listen_tcp(&self, port: u16) -> Result<TunnelTcpListener, TunnelInitError> {
        let (reply, reply_rx) = oneshot::channel();
        self.control_tx
            .send(Control::Listen { port, reply })
            .await
            .map_err(|_| TunnelInitError::listen(port, "virtual interface stopped"))?;
        reply_rx
            .await
            .map_err(|_| TunnelInitError::listen(port, "virtual interface stopped"))?
    }

    /// Address owned by the interface
    #[must_use]
    pub const fn address(&self) -> IpAddr {
        self.address
    }
}

/// Listening state for one port
struct ListenerSlot {
    backlog: Vec<SocketHandle>,
    accept_tx: mpsc::Sender<AcceptItem>,
    local_addr: SocketAddr,
    limit_reported: bool,
}

/// Bridge state for one accepted connection
struct ConnectionSlot {
    peer: SocketAddr,
    /// Chunks read from the socket; `None` once EOF or reset was delivered
    /// or the stream stopped reading
    to_app: Option<mpsc::Sender<io::Result<Bytes>>>,
    /// Chunks to write; `None` once the stream half-closed or writes became
    /// impossible
    from_app: Option<mpsc::Receiver<Bytes>>,
    pending: Bytes,
    write_closed: bool,
    closing_since: Option<Instant>,
    aborted: bool,
}

impl ConnectionSlot {
    /// A connection nobody accepted; the caller has already reset it
    fn aborted(peer: SocketAddr, now: Instant) -> Self {
        Self {
            peer,
            to_app: None,
            from_app: None,
            pending: Bytes::new(),
            write_closed: true,
            closing_since: Some(now),
            aborted: true,
        }
    }

    /// Move data from the socket to the stream. Returns `true` if any moved.
    fn deliver_inbound(&mut self, socket: &mut TcpSocket<'static>) -> bool {
        let mut progressed = false;
        let mut reader_gone = false;

        while socket.can_recv() {
            match &self.to_app {
                Some(tx) => match tx.try_reserve() {
                    Ok(permit) => match socket.recv(|buf| {
                        let n = buf.len().min(READ_CHUNK);
                        (n, Bytes::copy_from_slice(&buf[..n]))
                    }) {
                        Ok(chunk) => {
                            permit.send(Ok(chunk));
                            progressed = true;
                        }
                        Err(_) => break,
                    },
                    Err(TrySendError::Full(())) => break,
                    Err(TrySendError::Closed(())) => {
                        reader_gone = true;
                        break;
                    }
                },
                None => {
                    // Nobody reads any more: keep the window open by discarding
                    let discarded = socket.recv(|buf| (buf.len(), buf.len())).unwrap_or(0);
                    trace!("Discarded {} bytes from {}", discarded, self.peer);
                    if discarded == 0 {
                        break;
                    }
                    progressed = true;
                }
            }
        }

        if reader_gone {
            self.to_app = None;
            progressed = true;
        }

        if let Some(tx) = &self.to_app {
            if socket.state() == TcpState::Closed {
                let _ = tx.try_send(Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "connection reset by tunnel peer",
                )));
                self.to_app = None;
                progressed = true;
            } else if !socket.may_recv() {
                // FIN received and every byte delivered
                trace!("EOF from {}", self.peer);
                self.to_app = None;
                progressed = true;
            }
        }

        progressed
    }

    /// Move data from the stream to the socket. Returns `true` if any moved.
    fn flush_outbound(&mut self, socket: &mut TcpSocket<'static>) -> bool {
        let mut progressed = false;

        if !socket.may_send() && !self.write_closed {
            // Peer reset or the socket closed underneath the stream
            self.from_app = None;
            self.pending.clear();
            self.write_closed = true;
            return true;
        }

        let mut writer_done = false;
        if let Some(rx) = self.from_app.as_mut() {
            loop {
                if !self.pending.is_empty() {
                    if !socket.can_send() {
                        break;
                    }
                    match socket.send_slice(&self.pending) {
                        Ok(0) => break,
                        Ok(n) => {
                            self.pending.advance(n);
                            progressed = true;
                        }
                        Err(_) => break,
                    }
                    continue;
                }

                match rx.try_recv() {
                    Ok(chunk) => self.pending = chunk,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        writer_done = true;
                        break;
                    }
                }
            }
        }

        if writer_done {
            self.from_app = None;
            self.write_closed = true;
            progressed = true;
        }

        progressed
    }

    /// Send FIN once the stream half-closed and everything is written; reset
    /// sockets that linger. Returns `true` when the slot can be removed.
    fn advance_close(&mut self, socket: &mut TcpSocket<'static>, now: Instant) -> bool {
        if self.write_closed && self.pending.is_empty() && self.closing_since.is_none() {
            socket.close();
            self.closing_since = Some(now);
        }

        if let Some(since) = self.closing_since {
            if !self.aborted && now.duration_since(since) >= LINGER_TIMEOUT {
                debug!("Connection from {} lingered, resetting", self.peer);
                socket.abort();
                self.aborted = true;
            }
        }

        match socket.state() {
            TcpState::Closed => true,
            TcpState::TimeWait => !socket.can_recv(),
            _ => false,
        }
    }
}

struct Driver {
    iface: Interface,
    device: TunnelDevice,
    sockets: SocketSet<'static>,
    address: IpAddr,
    listeners: HashMap<u16, ListenerSlot>,
    connections: HashMap<SocketHandle, ConnectionSlot>,
    inbound_rx: mpsc::Receiver<Vec<u8>>,
    outbound_tx: mpsc::Sender<Vec<u8>>,
    control_rx: mpsc::Receiver<Control>,
    notify: Arc<Notify>,
    started: Instant,
}

impl Driver {
    fn new(
        config: &NetStackConfig,
        inbound_rx: mpsc::Receiver<Vec<u8>>,
        outbound_tx: mpsc::Sender<Vec<u8>>,
        control_rx: mpsc::Receiver<Control>,
    ) -> Result<Self, TunnelInitError> {
        let mut device = TunnelDevice::new(config.mtu);

        let mut iface_config = IfaceConfig::new(HardwareAddress::Ip);
        iface_config.random_seed = rand::random();
        let mut iface = Interface::new(iface_config, &mut device, SmoltcpInstant::from_millis(0));

        let (cidr, route_result) = match config.address {
            IpAddr::V4(v4) => {
                let addr = Ipv4Address::from_bytes(&v4.octets());
                // Default route via ourselves so replies reach any tunnel client
                let route = iface.routes_mut().add_default_ipv4_route(addr).map(|_| ());
                (IpCidr::new(IpAddress::Ipv4(addr), 32), route)
            }
            IpAddr::V6(v6) => {
                let addr = Ipv6Address::from_bytes(&v6.octets());
                let route = iface.routes_mut().add_default_ipv6_route(addr).map(|_| ());
                (IpCidr::new(IpAddress::Ipv6(addr), 128), route)
            }
        };
        route_result.map_err(|e| TunnelInitError::NetStack(format!("default route: {e:?}")))?;

        let mut pushed = Ok(());
        iface.update_ip_addrs(|addrs| {
            pushed = addrs.push(cidr).map_err(|_| ());
        });
        pushed.map_err(|()| TunnelInitError::NetStack("address table full".into()))?;

        Ok(Self {
            iface,
            device,
            sockets: SocketSet::new(Vec::new()),
            address: config.address,
            listeners: HashMap::new(),
            connections: HashMap::new(),
            inbound_rx,
            outbound_tx,
            control_rx,
            notify: Arc::new(Notify::new()),
            started: Instant::now(),
        })
    }

    fn timestamp(&self) -> SmoltcpInstant {
        let millis = i64::try_from(self.started.elapsed().as_millis()).unwrap_or(i64::MAX);
        SmoltcpInstant::from_millis(millis)
    }

    async fn run(mut self, mut shutdown_rx: oneshot::Receiver<()>) {
        loop {
            let now = self.timestamp();
            self.iface.poll(now, &mut self.device, &mut self.sockets);

            let mut progressed = self.service_listeners();
            progressed |= self.service_connections();
            if progressed {
                // Socket buffers changed; let smoltcp emit ACKs and data now
                self.iface.poll(self.timestamp(), &mut self.device, &mut self.sockets);
            }

            if !self.flush_to_engine() {
                debug!("Tunnel engine gone, stopping virtual interface");
                break;
            }

            let delay = if self.device.has_rx_packets() {
                Duration::ZERO
            } else {
                self.iface
                    .poll_delay(self.timestamp(), &self.sockets)
                    .map_or(MAX_POLL_DELAY, |d| Duration::from_micros(d.total_micros()))
                    .clamp(MIN_POLL_DELAY, MAX_POLL_DELAY)
            };

            tokio::select! {
                _ = &mut shutdown_rx => {
                    debug!("Virtual interface received shutdown signal");
                    break;
                }
                packet = self.inbound_rx.recv() => match packet {
                    Some(packet) => self.enqueue_inbound(packet),
                    None => {
                        debug!("Inbound packet channel closed");
                        break;
                    }
                },
                Some(control) = self.control_rx.recv() => self.handle_control(control),
                () = self.notify.notified() => {}
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.shutdown();
    }

    fn enqueue_inbound(&mut self, packet: Vec<u8>) {
        self.device.push_rx(packet);
        while self.device.rx_queue_len() < MAX_QUEUE_DEPTH {
            match self.inbound_rx.try_recv() {
                Ok(packet) => {
                    self.device.push_rx(packet);
                }
                Err(_) => break,
            }
        }
    }

    /// Hand emitted packets to the engine. Returns `false` if it is gone.
    fn flush_to_engine(&mut self) -> bool {
        while self.device.tx_queue_len() > 0 {
            match self.outbound_tx.try_reserve() {
                Ok(permit) => {
                    if let Some(packet) = self.device.pop_tx() {
                        permit.send(packet);
                    }
                }
                // Left queued; the device refuses new transmits until drained
                Err(TrySendError::Full(())) => break,
                Err(TrySendError::Closed(())) => return false,
            }
        }
        true
    }

    fn handle_control(&mut self, control: Control) {
        match control {
            Control::Listen { port, reply } => {
                let _ = reply.send(self.open_listener(port));
            }
        }
    }

    fn open_listener(&mut self, port: u16) -> Result<TunnelTcpListener, TunnelInitError> {
        if port == 0 {
            return Err(TunnelInitError::listen(port, "port must be greater than 0"));
        }
        if self.listeners.contains_key(&port) {
            return Err(TunnelInitError::listen(port, "already listening"));
        }

        let mut backlog = Vec::with_capacity(LISTEN_BACKLOG);
        for _ in 0..LISTEN_BACKLOG {
            match self.create_listen_socket(port) {
                Ok(handle) => backlog.push(handle),
                Err(reason) if backlog.is_empty() => {
                    return Err(TunnelInitError::listen(port, reason));
                }
                Err(_) => break,
            }
        }

        let local_addr = SocketAddr::new(self.address, port);
        let (accept_tx, accept_rx) = mpsc::channel(LISTEN_BACKLOG * 4);
        self.listeners.insert(
            port,
            ListenerSlot {
                backlog,
                accept_tx,
                local_addr,
                limit_reported: false,
            },
        );

        info!("Listening on {} (virtual interface)", local_addr);
        Ok(TunnelTcpListener::new(accept_rx, local_addr))
    }

    fn create_listen_socket(&mut self, port: u16) -> Result<SocketHandle, String> {
        if self.sockets.iter().count() >= MAX_SOCKETS {
            return Err(format!("socket limit of {MAX_SOCKETS} reached"));
        }

        let rx_buffer = SocketBuffer::new(vec![0u8; TCP_BUFFER_SIZE]);
        let tx_buffer = SocketBuffer::new(vec![0u8; TCP_BUFFER_SIZE]);
        let mut socket = TcpSocket::new(rx_buffer, tx_buffer);
        socket.set_nagle_enabled(false);
        socket
            .listen(port)
            .map_err(|e| format!("listen failed: {e:?}"))?;

        Ok(self.sockets.add(socket))
    }

    /// Promote handshaken sockets, drop dead listeners, refill backlogs
    fn service_listeners(&mut self) -> bool {
        let mut progressed = false;
        let mut promoted = Vec::new();
        let mut closed_ports = Vec::new();

        for (&port, slot) in &mut self.listeners {
            if slot.accept_tx.is_closed() {
                closed_ports.push(port);
                continue;
            }

            let mut i = 0;
            while i < slot.backlog.len() {
                let handle = slot.backlog[i];
                match self.sockets.get::<TcpSocket>(handle).state() {
                    TcpState::Listen | TcpState::SynReceived => i += 1,
                    TcpState::Established | TcpState::CloseWait => {
                        slot.backlog.swap_remove(i);
                        promoted.push((port, handle));
                    }
                    _ => {
                        // Handshake failed
                        slot.backlog.swap_remove(i);
                        self.sockets.remove(handle);
                    }
                }
            }
        }

        for port in closed_ports {
            if let Some(slot) = self.listeners.remove(&port) {
                debug!("Listener on {} dropped", slot.local_addr);
                for handle in slot.backlog {
                    self.sockets.remove(handle);
                }
            }
        }

        for (port, handle) in promoted {
            self.promote(port, handle);
            progressed = true;
        }

        let ports: Vec<u16> = self.listeners.keys().copied().collect();
        for port in ports {
            self.refill_backlog(port);
        }

        progressed
    }

    fn refill_backlog(&mut self, port: u16) {
        loop {
            let Some(slot) = self.listeners.get(&port) else {
                return;
            };
            if slot.backlog.len() >= LISTEN_BACKLOG {
                break;
            }
            match self.create_listen_socket(port) {
                Ok(handle) => {
                    if let Some(slot) = self.listeners.get_mut(&port) {
                        slot.backlog.push(handle);
                    }
                }
                Err(reason) => {
                    if let Some(slot) = self.listeners.get_mut(&port) {
                        if !slot.limit_reported {
                            warn!("Cannot refill backlog on port {}: {}", port, reason);
                            let _ = slot
                                .accept_tx
                                .try_send(Err(AcceptError::SocketLimit { limit: MAX_SOCKETS }));
                            slot.limit_reported = true;
                        }
                    }
                    return;
                }
            }
        }

        if let Some(slot) = self.listeners.get_mut(&port) {
            slot.limit_reported = false;
        }
    }

    fn promote(&mut self, port: u16, handle: SocketHandle) {
        let socket = self.sockets.get::<TcpSocket>(handle);
        let (Some(remote), Some(local)) = (socket.remote_endpoint(), socket.local_endpoint()) else {
            self.sockets.remove(handle);
            return;
        };
        let peer = endpoint_to_socket_addr(remote);
        let local = endpoint_to_socket_addr(local);

        let Some(listener) = self.listeners.get(&port) else {
            self.sockets.get_mut::<TcpSocket>(handle).abort();
            self.connections.insert(handle, ConnectionSlot::aborted(peer, Instant::now()));
            return;
        };

        let (to_app_tx, to_app_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let (from_app_tx, from_app_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let stream = TunnelTcpStream::new(
            to_app_rx,
            from_app_tx,
            Arc::clone(&self.notify),
            local,
            peer,
        );

        match listener.accept_tx.try_send(Ok((stream, peer))) {
            Ok(()) => {
                debug!("Accepted {} -> {}", peer, local);
                self.connections.insert(
                    handle,
                    ConnectionSlot {
                        peer,
                        to_app: Some(to_app_tx),
                        from_app: Some(from_app_rx),
                        pending: Bytes::new(),
                        write_closed: false,
                        closing_since: None,
                        aborted: false,
                    },
                );
            }
            Err(_) => {
                warn!("Accept queue for {} full or closed, resetting {}", local, peer);
                self.sockets.get_mut::<TcpSocket>(handle).abort();
                self.connections.insert(handle, ConnectionSlot::aborted(peer, Instant::now()));
            }
        }
    }

    fn service_connections(&mut self) -> bool {
        let now = Instant::now();
        let mut progressed = false;
        let mut finished = Vec::new();

        for (&handle, slot) in &mut self.connections {
            let socket = self.sockets.get_mut::<TcpSocket>(handle);
            progressed |= slot.deliver_inbound(socket);
            progressed |= slot.flush_outbound(socket);
            if slot.advance_close(socket, now) {
                finished.push(handle);
            }
        }

        for handle in finished {
            if let Some(slot) = self.connections.remove(&handle) {
                trace!("Connection from {} released", slot.peer);
            }
            self.sockets.remove(handle);
        }

        progressed
    }

    fn shutdown(&mut self) {
        info!(
            "Virtual interface shutting down ({} connections, {} listeners)",
            self.connections.len(),
            self.listeners.len()
        );

        for &handle in self.connections.keys() {
            self.sockets.get_mut::<TcpSocket>(handle).abort();
        }
        for slot in self.listeners.values() {
            for &handle in &slot.backlog {
                self.sockets.get_mut::<TcpSocket>(handle).abort();
            }
        }

        // Emit the resets, then hand them to the engine if it is still there
        self.iface.poll(self.timestamp(), &mut self.device, &mut self.sockets);
        self.flush_to_engine();

        self.connections.clear();
        self.listeners.clear();
    }
}

fn endpoint_to_socket_addr(endpoint: IpEndpoint) -> SocketAddr {
    let ip = match endpoint.addr {
        IpAddress::Ipv4(v4) => IpAddr::V4(Ipv4Addr::from(v4.0)),
        IpAddress::Ipv6(v6) => IpAddr::V6(Ipv6Addr::from(v6.0)),
    };
    SocketAddr::new(ip, endpoint.port)
}
