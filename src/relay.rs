//! Per-connection relay to the upstream
//!
//! `handle_connection` dials the upstream, then runs two copy tasks (one per
//! direction) that share a `watch` done signal. A direction that reaches
//! end-of-stream half-closes its writer and fires the signal; a direction
//! that fails fires it without the half-close. The other task stops as soon
//! as the signal fires and both connections are dropped.
//!
//! A watchdog on the relay task enforces the idle timeout and the optional
//! maximum duration, and the process shutdown broadcast ends every relay.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

use crate::config::{RelayConfig, UpstreamTarget};
use crate::error::{Direction, ForwarderError, RelayIoError, UpstreamDialError};

/// Longest interval between watchdog checks
const MAX_WATCHDOG_TICK: Duration = Duration::from_secs(1);

/// Result of a finished relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyResult {
    /// Bytes transferred from the tunnel client to the upstream
    pub client_to_upstream: u64,
    /// Bytes transferred from the upstream to the tunnel client
    pub upstream_to_client: u64,
}

impl CopyResult {
    /// Total bytes transferred in both directions
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.client_to_upstream + self.upstream_to_client
    }
}

/// Dial the upstream with a connect timeout
///
/// # Errors
///
/// Returns `UpstreamDialError::ConnectFailed` if resolution or the connect
/// fails and `UpstreamDialError::Timeout` if it does not finish in time.
pub async fn dial_upstream(
    target: &UpstreamTarget,
    timeout: Duration,
) -> Result<TcpStream, UpstreamDialError> {
    let addr = target.to_string();
    let stream = tokio::time::timeout(timeout, TcpStream::connect((target.host(), target.port())))
        .await
        .map_err(|_| UpstreamDialError::timeout(&addr, timeout))?
        .map_err(|e| UpstreamDialError::connect_failed(&addr, &e))?;

    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY on upstream socket: {}", e);
    }
    Ok(stream)
}

/// Relay one accepted connection to the upstream
///
/// Runs inside a `relay` span carrying the client and upstream addresses.
/// The local stream is dropped (closing the client's connection) on every
/// exit path, including a failed dial.
///
/// # Errors
///
/// Returns `ForwarderError::UpstreamDial` when the upstream cannot be
/// reached and `ForwarderError::Relay` when the pair ends on an I/O error or
/// a timeout. Both are logged here.
pub async fn handle_connection<S>(
    local: S,
    client: SocketAddr,
    upstream: &UpstreamTarget,
    config: &RelayConfig,
    shutdown_rx: broadcast::Receiver<()>,
) -> Result<CopyResult, ForwarderError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let span = info_span!("relay", %client, %upstream);
    async move {
        let remote = match dial_upstream(upstream, config.connect_timeout()).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("{}", e);
                drop(local);
                return Err(ForwarderError::from(e));
            }
        };
        debug!("Upstream connected");

        match relay(local, remote, config, shutdown_rx).await {
            Ok(result) => {
                debug!(
                    "Relay finished: sent={}, recv={}",
                    result.client_to_upstream, result.upstream_to_client
                );
                Ok(result)
            }
            Err(e) => {
                if e.is_disconnect() {
                    debug!("Relay ended: {}", e);
                } else {
                    warn!("Relay ended: {}", e);
                }
                Err(ForwarderError::from(e))
            }
        }
    }
    .instrument(span)
    .await
}

/// Pump bytes both ways between an accepted stream and a connected upstream
///
/// # Errors
///
/// Returns the first `RelayIoError` from either direction, or an idle /
/// max-duration timeout from the watchdog. Shutdown is not an error.
pub async fn relay<S>(
    local: S,
    upstream: TcpStream,
    config: &RelayConfig,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<CopyResult, RelayIoError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (local_reader, local_writer) = tokio::io::split(local);
    let (upstream_reader, upstream_writer) = upstream.into_split();

    let (done_tx, mut done_rx) = watch::channel(false);
    let done_tx = Arc::new(done_tx);
    let activity = Arc::new(Activity::new());

    let to_upstream = tokio::spawn(pump(
        local_reader,
        upstream_writer,
        Direction::ClientToUpstream,
        config.buffer_size,
        Arc::clone(&done_tx),
        Arc::clone(&activity),
    )
    .in_current_span());
    let to_client = tokio::spawn(pump(
        upstream_reader,
        local_writer,
        Direction::UpstreamToClient,
        config.buffer_size,
        Arc::clone(&done_tx),
        Arc::clone(&activity),
    )
    .in_current_span());

    let timed_out = tokio::select! {
        _ = done_rx.changed() => None,
        reason = watchdog(&activity, config.idle_timeout(), config.max_duration()) => Some(reason),
        _ = shutdown_rx.recv() => {
            debug!("Relay received shutdown signal");
            None
        }
    };
    done_tx.send_replace(true);

    let sent = join_pump(to_upstream, Direction::ClientToUpstream).await;
    let received = join_pump(to_client, Direction::UpstreamToClient).await;

    if let Some(reason) = timed_out {
        return Err(reason);
    }

    Ok(CopyResult {
        client_to_upstream: sent?,
        upstream_to_client: received?,
    })
}

async fn join_pump(
    task: tokio::task::JoinHandle<Result<u64, RelayIoError>>,
    direction: Direction,
) -> Result<u64, RelayIoError> {
    task.await.unwrap_or_else(|e| {
        warn!("{} copy task failed: {}", direction, e);
        Err(RelayIoError::TaskFailed {
            direction,
            reason: e.to_string(),
        })
    })
}

/// Copy one direction until end-of-stream, an error or the done signal
async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    direction: Direction,
    buffer_size: usize,
    done: Arc<watch::Sender<bool>>,
    activity: Arc<Activity>,
) -> Result<u64, RelayIoError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut done_rx = done.subscribe();
    let _done = FireOnDrop(done);
    let mut buf = vec![0u8; buffer_size];
    let mut total: u64 = 0;

    let result = loop {
        let step = async {
            let n = reader
                .read(&mut buf)
                .await
                .map_err(|source| RelayIoError::Read { direction, source })?;
            if n > 0 {
                writer
                    .write_all(&buf[..n])
                    .await
                    .map_err(|source| RelayIoError::Write { direction, source })?;
            }
            Ok::<_, RelayIoError>(n)
        };

        // The `watch::Ref` from `wait_for` must not outlive this select
        let step = tokio::select! {
            biased;
            _ = async { let _ = done_rx.wait_for(|done| *done).await; } => None,
            step = step => Some(step),
        };

        match step {
            None => break Ok(total),
            Some(Ok(0)) => {
                // Half-close: pass the end-of-stream on
                let _ = writer.shutdown().await;
                break Ok(total);
            }
            Some(Ok(n)) => {
                total += n as u64;
                activity.touch();
            }
            Some(Err(e)) => break Err(e),
        }
    };

    debug!("{} finished after {} bytes", direction, total);
    result
}

/// Fires the done signal however the copy task ends, panics included
struct FireOnDrop(Arc<watch::Sender<bool>>);

impl Drop for FireOnDrop {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

/// Resolves when the pair has been idle or alive for too long
async fn watchdog(
    activity: &Activity,
    idle_timeout: Option<Duration>,
    max_duration: Option<Duration>,
) -> RelayIoError {
    let tick = idle_timeout
        .map_or(MAX_WATCHDOG_TICK, |idle| idle / 4)
        .clamp(Duration::from_millis(10), MAX_WATCHDOG_TICK);

    loop {
        tokio::time::sleep(tick).await;

        if let Some(max) = max_duration {
            if activity.age() >= max {
                return RelayIoError::MaxDuration(max);
            }
        }
        if let Some(idle) = idle_timeout {
            if activity.idle() >= idle {
                return RelayIoError::IdleTimeout(idle);
            }
        }
    }
}

/// Time of the last transferred chunk, shared by both copy tasks
struct Activity {
    started: Instant,
    last_millis: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_millis: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let millis = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_millis.store(millis, Ordering::Relaxed);
    }

    fn age(&self) -> Duration {
        self.started.elapsed()
    }

    fn idle(&self) -> Duration {
        let last = Duration::from_millis(self.last_millis.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }
}
