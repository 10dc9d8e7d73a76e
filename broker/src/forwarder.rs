//! The Forwarder: one listening socket per session, relaying every
//! accepted client connection to a fixed upstream address.
//!
//! SPICE opens several TCP channels per session in quick succession (main,
//! display, input, cursor, audio); each is relayed independently and must
//! survive until its own peer closes, so the accept loop never stops
//! listening just because connections are already open.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::shutdown::ShutdownChannel;
use common::task::BrokerTask;
use tokio::io::{self, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// How long the accept loop waits on a single `accept()` call before
/// looping back around to re-check the TTL deadline and stop flag.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Minimum relay buffer size, per the byte-transparency contract.
const RELAY_BUFFER_SIZE: usize = 8 * 1024;

pub struct Forwarder {
    port: u16,
    active_connections: Arc<AtomicU32>,
    stopped: Arc<AtomicBool>,
    task: BrokerTask<()>,
}

impl Forwarder {
    /// Bind `listener` (already bound to the session's ephemeral port) and
    /// spawn the accept loop, relaying every accepted connection to
    /// `upstream_addr`. The loop self-terminates once `ttl` elapses from
    /// `started_at`, or immediately if `stop()` is called, or if the
    /// process-wide `shutdown` fires.
    pub fn spawn(
        listener: TcpListener,
        port: u16,
        upstream_addr: SocketAddr,
        ttl: Duration,
        shutdown: ShutdownChannel,
    ) -> Self {
        let active_connections = Arc::new(AtomicU32::new(0));
        let stopped = Arc::new(AtomicBool::new(false));

        let task = BrokerTask::spawn(
            format!("forwarder-{port}"),
            accept_loop(
                listener,
                port,
                upstream_addr,
                ttl,
                shutdown,
                active_connections.clone(),
                stopped.clone(),
            ),
        );

        Self {
            port,
            active_connections,
            stopped,
            task,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn active_connections(&self) -> u32 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Idempotent, non-blocking: sets the stop flag. The accept loop
    /// observes it within one [`ACCEPT_POLL_INTERVAL`] and exits.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

async fn accept_loop(
    listener: TcpListener,
    port: u16,
    upstream_addr: SocketAddr,
    ttl: Duration,
    shutdown: ShutdownChannel,
    active_connections: Arc<AtomicU32>,
    stopped: Arc<AtomicBool>,
) {
    let deadline = Instant::now() + ttl;
    let mut connections = tokio::task::JoinSet::new();

    loop {
        if stopped.load(Ordering::Relaxed) || Instant::now() >= deadline {
            debug!(port, "forwarder accept loop exiting (stop or TTL)");
            break;
        }

        tokio::select! {
            biased;
            () = shutdown.recv() => {
                debug!(port, "forwarder accept loop exiting (shutdown)");
                break;
            }
            accepted = tokio::time::timeout(ACCEPT_POLL_INTERVAL, listener.accept()) => {
                match accepted {
                    Ok(Ok((client, peer))) => {
                        active_connections.fetch_add(1, Ordering::Relaxed);
                        let active_connections = active_connections.clone();
                        debug!(port, %peer, "accepted connection");
                        connections.spawn(async move {
                            if let Err(e) = relay_connection(client, upstream_addr).await {
                                info!(port, %peer, "forwarder relay error: {e:#}");
                            }
                            active_connections.fetch_sub(1, Ordering::Relaxed);
                        });
                    }
                    Ok(Err(e)) => {
                        warn!(port, "accept() error: {e:#}");
                    }
                    Err(_timeout_elapsed) => {
                        // Just a poll tick; loop back to re-check TTL/stop.
                    }
                }
            }
            Some(result) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = result {
                    warn!(port, "connection handler panicked: {e:#}");
                }
            }
        }
    }

    drain(&mut connections).await;
}

async fn drain(connections: &mut tokio::task::JoinSet<()>) {
    while let Some(result) = connections.join_next().await {
        if let Err(e) = result {
            warn!("connection handler panicked during drain: {e:#}");
        }
    }
}

/// Open a fresh upstream connection and relay bytes in both directions
/// until either side reaches EOF or errors. Byte-transparent: no framing,
/// no reordering beyond what TCP itself guarantees within one direction.
async fn relay_connection(client: TcpStream, upstream_addr: SocketAddr) -> io::Result<()> {
    let upstream = TcpStream::connect(upstream_addr).await?;

    let (mut client_read, mut client_write) = client.into_split();
    let (mut upstream_read, mut upstream_write) = upstream.into_split();

    let client_to_upstream = copy_loop(&mut client_read, &mut upstream_write);
    let upstream_to_client = copy_loop(&mut upstream_read, &mut client_write);

    // Each direction survives independently until its own peer closes;
    // joining both (rather than racing them) ensures a half-close on one
    // side doesn't tear down the still-open other direction.
    let (a, b) = tokio::join!(client_to_upstream, upstream_to_client);
    a.and(b)
}

async fn copy_loop(
    reader: &mut (impl tokio::io::AsyncRead + Unpin),
    writer: &mut (impl tokio::io::AsyncWrite + Unpin),
) -> io::Result<()> {
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
    }
    let _ = writer.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::net::TcpListener as TokioListener;

    #[tokio::test]
    async fn relays_bytes_transparently() {
        // Upstream echo server.
        let upstream_listener = TokioListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream_listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = upstream_listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            loop {
                let n = sock.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                sock.write_all(&buf[..n]).await.unwrap();
            }
        });

        let listener = TokioListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let shutdown = ShutdownChannel::new();
        let forwarder = Forwarder::spawn(
            listener,
            port,
            upstream_addr,
            Duration::from_secs(10),
            shutdown.clone(),
        );

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(b"hello spice").await.unwrap();
        client.shutdown().await.unwrap();

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hello spice");

        forwarder.stop();
        shutdown.send();
    }

    /// A SPICE session opens several channels (main, display, input, cursor,
    /// audio) against the same forwarded port; the active-connection counter
    /// must track all of them concurrently, not just the most recent one.
    #[tokio::test]
    async fn tracks_multiple_concurrent_connections() {
        let upstream_listener = TokioListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream_listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = upstream_listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 1024];
                    while let Ok(n) = sock.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                    }
                });
            }
        });

        let listener = TokioListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let shutdown = ShutdownChannel::new();
        let forwarder = Forwarder::spawn(
            listener,
            port,
            upstream_addr,
            Duration::from_secs(10),
            shutdown.clone(),
        );

        const CHANNELS: usize = 5;
        let mut clients = Vec::with_capacity(CHANNELS);
        for _ in 0..CHANNELS {
            clients.push(TcpStream::connect(("127.0.0.1", port)).await.unwrap());
        }

        // Give the accept loop a moment to register each connection.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(forwarder.active_connections(), CHANNELS as u32);

        drop(clients);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(forwarder.active_connections(), 0);

        forwarder.stop();
        shutdown.send();
    }
}
