//! smoltcp device over in-memory packet queues
//!
//! The netstack driver owns the device exclusively. Decrypted packets from the
//! WireGuard engine are pushed into the RX queue before each poll; packets
//! smoltcp emits are drained from the TX queue afterwards and handed back to
//! the engine for encryption.
//!
//! ```text
//! +----------------+     +---------------+     +-----------------+
//! | smoltcp stack  | <-> | TunnelDevice  | <-> | WireGuard engine|
//! | (TCP/IP)       |     | (rx/tx queue) |     | (boringtun)     |
//! +----------------+     +---------------+     +-----------------+
//! ```

use std::collections::VecDeque;

use smoltcp::phy::{Checksum, ChecksumCapabilities, Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::time::Instant as SmoltcpInstant;
use tracing::trace;

/// Maximum packets held in either direction
pub const MAX_QUEUE_DEPTH: usize = 256;

/// Virtual IP-layer device backed by two packet queues
#[derive(Debug)]
pub struct TunnelDevice {
    rx_queue: VecDeque<Vec<u8>>,
    tx_queue: VecDeque<Vec<u8>>,
    mtu: usize,
}

impl TunnelDevice {
    /// Create a device with the given MTU
    #[must_use]
    pub fn new(mtu: usize) -> Self {
        Self {
            rx_queue: VecDeque::new(),
            tx_queue: VecDeque::new(),
            mtu,
        }
    }

    /// Queue a packet received from the tunnel
    ///
    /// Returns `false` and drops the packet when the queue is full; TCP
    /// retransmission recovers from the loss.
    pub fn push_rx(&mut self, packet: Vec<u8>) -> bool {
        if self.rx_queue.len() >= MAX_QUEUE_DEPTH {
            trace!("RX queue full, dropping packet ({} bytes)", packet.len());
            return false;
        }
        self.rx_queue.push_back(packet);
        true
    }

    /// Take the next packet smoltcp produced
    pub fn pop_tx(&mut self) -> Option<Vec<u8>> {
        self.tx_queue.pop_front()
    }

    /// Whether packets are waiting for smoltcp
    #[must_use]
    pub fn has_rx_packets(&self) -> bool {
        !self.rx_queue.is_empty()
    }

    /// Current RX queue depth
    #[must_use]
    pub fn rx_queue_len(&self) -> usize {
        self.rx_queue.len()
    }

    /// Current TX queue depth
    #[must_use]
    pub fn tx_queue_len(&self) -> usize {
        self.tx_queue.len()
    }

    /// Interface MTU
    #[must_use]
    pub const fn mtu(&self) -> usize {
        self.mtu
    }
}

impl Device for TunnelDevice {
    type RxToken<'a> = TunnelRxToken where Self: 'a;
    type TxToken<'a> = TunnelTxToken<'a> where Self: 'a;

    fn receive(&mut self, _timestamp: SmoltcpInstant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let packet = self.rx_queue.pop_front()?;
        Some((
            TunnelRxToken { packet },
            TunnelTxToken {
                queue: &mut self.tx_queue,
            },
        ))
    }

    fn transmit(&mut self, _timestamp: SmoltcpInstant) -> Option<Self::TxToken<'_>> {
        if self.tx_queue.len() >= MAX_QUEUE_DEPTH {
            // smoltcp retries on the next poll once the driver drained the queue
            return None;
        }
        Some(TunnelTxToken {
            queue: &mut self.tx_queue,
        })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();

        // WireGuard carries bare IP packets
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = self.mtu;

        // The engine authenticates packets, so only compute checksums on TX
        caps.checksum = ChecksumCapabilities::default();
        caps.checksum.ipv4 = Checksum::Tx;
        caps.checksum.tcp = Checksum::Tx;
        caps.checksum.icmpv4 = Checksum::Tx;
        caps.checksum.icmpv6 = Checksum::Tx;

        caps
    }
}

/// Receive token holding one decrypted packet
pub struct TunnelRxToken {
    packet: Vec<u8>,
}

impl RxToken for TunnelRxToken {
    fn consume<R, F>(mut self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        trace!("RxToken consume: {} bytes", self.packet.len());
        f(&mut self.packet)
    }
}

/// Transmit token appending to the TX queue
pub struct TunnelTxToken<'a> {
    queue: &'a mut VecDeque<Vec<u8>>,
}

impl<'a> TxToken for TunnelTxToken<'a> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buffer = vec![0u8; len];
        let result = f(&mut buffer);
        trace!("TxToken consume: {} bytes", len);
        self.queue.push_back(buffer);
        result
    }
}
