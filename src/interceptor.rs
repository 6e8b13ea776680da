//! Interceptor: accept loop for the intercepted port
//!
//! The interceptor owns one listener and hands every accepted connection to
//! a freshly spawned relay task. It never waits on a connection's lifetime.
//!
//! Accept failures are classified through `AcceptError::is_recoverable`:
//! transient ones are retried after an exponential backoff (5 ms doubling to
//! 1 s, reset by the next successful accept), terminal ones end the loop and
//! are returned to the caller.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::{RelayConfig, UpstreamTarget};
use crate::error::AcceptError;
use crate::relay;
use crate::tunnel::{TunnelTcpListener, TunnelTcpStream};

/// Boxed future used by the `Acceptor` trait
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// First delay after a transient accept failure
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(5);

/// Upper bound on the accept backoff
pub const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// How long `Interceptor::shutdown` waits for relays to finish
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A source of accepted connections
///
/// Implemented for the virtual-interface listener and for plain
/// `tokio::net::TcpListener`.
pub trait Acceptor: Send {
    /// Stream type produced by `accept`
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Wait for the next connection
    fn accept(&mut self) -> BoxFuture<'_, Result<(Self::Stream, SocketAddr), AcceptError>>;

    /// Address the acceptor listens on
    fn local_addr(&self) -> SocketAddr;
}

impl Acceptor for TunnelTcpListener {
    type Stream = TunnelTcpStream;

    fn accept(&mut self) -> BoxFuture<'_, Result<(Self::Stream, SocketAddr), AcceptError>> {
        Box::pin(TunnelTcpListener::accept(self))
    }

    fn local_addr(&self) -> SocketAddr {
        TunnelTcpListener::local_addr(self)
    }
}

impl Acceptor for TcpListener {
    type Stream = tokio::net::TcpStream;

    fn accept(&mut self) -> BoxFuture<'_, Result<(Self::Stream, SocketAddr), AcceptError>> {
        Box::pin(async move { Ok(TcpListener::accept(self).await?) })
    }

    fn local_addr(&self) -> SocketAddr {
        TcpListener::local_addr(self)
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)))
    }
}

/// Exponential backoff for transient accept failures
#[derive(Debug, Clone)]
pub struct AcceptBackoff {
    current: Duration,
}

impl Default for AcceptBackoff {
    fn default() -> Self {
        Self::new()
    }
}

impl AcceptBackoff {
    /// Start at `INITIAL_BACKOFF`
    #[must_use]
    pub const fn new() -> Self {
        Self {
            current: INITIAL_BACKOFF,
        }
    }

    /// Delay to wait now; doubles the next one up to `MAX_BACKOFF`
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(MAX_BACKOFF);
        delay
    }

    /// Back to `INITIAL_BACKOFF` after a successful accept
    pub fn reset(&mut self) {
        self.current = INITIAL_BACKOFF;
    }
}

/// Counters for intercepted connections
#[derive(Debug, Default)]
pub struct InterceptStats {
    accepted: AtomicU64,
    active: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    bytes_to_upstream: AtomicU64,
    bytes_from_upstream: AtomicU64,
}

impl InterceptStats {
    fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    // Counters move before `active` drops so a drained interceptor reports
    // final totals
    fn record_completed(&self, to_upstream: u64, from_upstream: u64) {
        self.bytes_to_upstream.fetch_add(to_upstream, Ordering::SeqCst);
        self.bytes_from_upstream
            .fetch_add(from_upstream, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    /// Connections accepted so far
    #[must_use]
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Relays currently running
    #[must_use]
    pub fn active(&self) -> u64 {
        self.active.load(Ordering::SeqCst)
    }

    /// Relays that ended without error
    #[must_use]
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    /// Relays that ended with a dial or I/O error
    #[must_use]
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }

    /// Bytes relayed from tunnel clients to the upstream
    #[must_use]
    pub fn bytes_to_upstream(&self) -> u64 {
        self.bytes_to_upstream.load(Ordering::SeqCst)
    }

    /// Bytes relayed from the upstream to tunnel clients
    #[must_use]
    pub fn bytes_from_upstream(&self) -> u64 {
        self.bytes_from_upstream.load(Ordering::SeqCst)
    }
}

/// Dispatches accepted connections to relays
pub struct Interceptor {
    upstream: Arc<UpstreamTarget>,
    relay: Arc<RelayConfig>,
    stats: Arc<InterceptStats>,
    shutdown_tx: broadcast::Sender<()>,
    shutting_down: AtomicBool,
}

impl Interceptor {
    /// Create an interceptor relaying to `upstream`
    #[must_use]
    pub fn new(upstream: UpstreamTarget, relay: RelayConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            upstream: Arc::new(upstream),
            relay: Arc::new(relay),
            stats: Arc::new(InterceptStats::default()),
            shutdown_tx,
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Upstream every connection is relayed to
    #[must_use]
    pub fn upstream(&self) -> &UpstreamTarget {
        &self.upstream
    }

    /// Connection counters
    #[must_use]
    pub fn stats(&self) -> &InterceptStats {
        &self.stats
    }

    /// Whether `shutdown` has been called
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Spawn a relay for one accepted connection
    ///
    /// Once `shutdown` has started the stream is dropped instead, which
    /// closes the client's connection.
    pub fn dispatch<S>(&self, stream: S, client: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        // Subscribe before checking the flag so a concurrent shutdown is
        // either seen here or delivered to the relay
        let shutdown_rx = self.shutdown_tx.subscribe();
        if self.is_shutting_down() {
            debug!("Shutting down, refusing connection from {}", client);
            drop(stream);
            return;
        }

        self.stats.record_accepted();
        debug!(
            "Accepted connection from {} (active: {})",
            client,
            self.stats.active()
        );

        let upstream = Arc::clone(&self.upstream);
        let config = Arc::clone(&self.relay);
        let stats = Arc::clone(&self.stats);

        tokio::spawn(async move {
            match relay::handle_connection(stream, client, &upstream, &config, shutdown_rx).await {
                Ok(result) => {
                    stats.record_completed(result.client_to_upstream, result.upstream_to_client);
                }
                Err(_) => stats.record_failed(),
            }
        });
    }

    /// Stop the accept loop and tear down running relays
    ///
    /// Waits up to a few seconds for relays to finish.
    pub async fn shutdown(&self) {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        info!("Interceptor shutting down");
        let _ = self.shutdown_tx.send(());

        let started = tokio::time::Instant::now();
        while started.elapsed() < DRAIN_TIMEOUT {
            if self.stats.active() == 0 {
                info!("All relays finished");
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        warn!(
            "Drain timeout reached with {} relays still active",
            self.stats.active()
        );
    }
}

impl std::fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interceptor")
            .field("upstream", &self.upstream.to_string())
            .field("active", &self.stats.active())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

/// Run the accept loop until shutdown or a terminal accept error
///
/// # Errors
///
/// Returns the terminal `AcceptError` (for the virtual interface, the
/// listener or the netstack has closed). Returns `Ok(())` after
/// `Interceptor::shutdown`.
pub async fn run_accept_loop<A: Acceptor>(
    mut listener: A,
    interceptor: Arc<Interceptor>,
) -> Result<(), AcceptError> {
    info!(
        "Intercepting {} -> {}",
        listener.local_addr(),
        interceptor.upstream()
    );

    let mut shutdown_rx = interceptor.shutdown_tx.subscribe();
    let mut backoff = AcceptBackoff::new();

    loop {
        if interceptor.is_shutting_down() {
            break;
        }

        let result = tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break,
            result = listener.accept() => result,
        };

        match result {
            Ok((stream, client)) => {
                backoff.reset();
                interceptor.dispatch(stream, client);
            }
            Err(e) if e.is_recoverable() => {
                let delay = backoff.next_delay();
                warn!("Accept failed: {} (retrying in {:?})", e, delay);
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => break,
                    () = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => {
                if interceptor.is_shutting_down() {
                    break;
                }
                warn!("Accept loop stopped: {}", e);
                return Err(e);
            }
        }
    }

    info!("Accept loop stopped");
    Ok(())
}
