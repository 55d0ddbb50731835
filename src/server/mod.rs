//! TCP Server
//!
//! [`run`] binds a listener, builds the store, starts the sweeper, and spawns
//! three background tasks: the accept loop, a signal watcher that turns
//! SIGINT/SIGTERM into a stop, and a drain supervisor that waits for open
//! connections to finish before declaring the server done.
//!
//! ## Graceful shutdown
//!
//! Stopping closes the listener (pending connects fail at the OS level) and
//! broadcasts a one-shot closing signal. Workers poll the signal between
//! requests, so in-flight requests complete. The drain supervisor waits on an
//! outstanding-connection barrier with a 10 second ceiling, stops the
//! sweeper, and only then resolves [`ServerHandle::done`].

use crate::connection::handle_connection;
use crate::storage::{self, Store, StoreError, StoreKind, SweepConfig, Sweeper};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

/// Ceiling on how long shutdown waits for open connections.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from server construction.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Handle to a running server.
///
/// Dropping the handle initiates shutdown without waiting for the drain;
/// use [`ServerHandle::stop`] to wait for it.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    closing: watch::Sender<bool>,
    done: watch::Receiver<bool>,
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.closing.send_replace(true);
    }
}

impl ServerHandle {
    /// The address the server actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Initiates shutdown and waits for the drain to complete.
    pub async fn stop(&self) {
        self.closing.send_replace(true);
        self.done().await;
    }

    /// Completes once the server has fully stopped.
    pub async fn done(&self) {
        let mut done = self.done.clone();
        while !*done.borrow() {
            if done.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Binds `addr`, constructs the store, and starts serving.
pub async fn run(
    kind: StoreKind,
    shard_count: usize,
    addr: &str,
) -> Result<ServerHandle, ServerError> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;

    let store = Arc::new(storage::open(kind, shard_count)?);
    let sweeper = Sweeper::start(Arc::clone(&store), SweepConfig::default());

    let (closing_tx, closing_rx) = watch::channel(false);
    let (done_tx, done_rx) = watch::channel(false);
    let tracker = Arc::new(ConnTracker::default());

    info!(addr = %local_addr, shards = store.shard_count(), "server listening");

    let accept_task = tokio::spawn(accept_loop(
        listener,
        store,
        Arc::clone(&tracker),
        closing_rx.clone(),
    ));
    tokio::spawn(signal_watcher(closing_tx.clone()));
    tokio::spawn(drain(closing_rx, accept_task, tracker, sweeper, done_tx));

    Ok(ServerHandle {
        local_addr,
        closing: closing_tx,
        done: done_rx,
    })
}

async fn accept_loop(
    listener: TcpListener,
    store: Arc<Store>,
    tracker: Arc<ConnTracker>,
    mut closing: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        let guard = tracker.guard();
                        let store = Arc::clone(&store);
                        let closing = closing.clone();
                        tokio::spawn(async move {
                            let _guard = guard;
                            handle_connection(stream, addr, store, closing).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                    }
                }
            }
            result = closing.changed() => {
                let _ = result;
                debug!("accept loop closing");
                // The listener drops here; no further connections are taken.
                return;
            }
        }
    }
}

/// Turns an interrupt or terminate signal into the closing broadcast.
async fn signal_watcher(closing: watch::Sender<bool>) {
    shutdown_signal().await;
    info!("shutdown signal received, stopping server");
    let _ = closing.send(true);
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler");
            wait_for_ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    wait_for_ctrl_c().await;
}

async fn wait_for_ctrl_c() {
    if tokio::signal::ctrl_c().await.is_err() {
        // No signal delivery; never resolve rather than shut down spuriously.
        std::future::pending::<()>().await;
    }
}

/// Waits out the shutdown sequence and resolves the done signal.
async fn drain(
    mut closing: watch::Receiver<bool>,
    accept_task: tokio::task::JoinHandle<()>,
    tracker: Arc<ConnTracker>,
    sweeper: Sweeper,
    done: watch::Sender<bool>,
) {
    while !*closing.borrow() {
        if closing.changed().await.is_err() {
            break;
        }
    }

    // The listener must be gone before the server can claim to be stopped.
    let _ = accept_task.await;

    if tokio::time::timeout(DRAIN_TIMEOUT, tracker.wait_idle())
        .await
        .is_err()
    {
        warn!(
            open = tracker.active(),
            "timed out waiting for open connections"
        );
    }

    sweeper.stop();
    info!("server stopped");
    let _ = done.send(true);
}

/// Counts outstanding connections and wakes the drain when the count
/// reaches zero.
#[derive(Debug, Default)]
struct ConnTracker {
    active: AtomicUsize,
    idle: Notify,
}

impl ConnTracker {
    fn guard(self: &Arc<Self>) -> ConnGuard {
        self.active.fetch_add(1, Ordering::AcqRel);
        ConnGuard {
            tracker: Arc::clone(self),
        }
    }

    fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct ConnGuard {
    tracker: Arc<ConnTracker>,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        if self.tracker.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.tracker.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn read_reply(client: &mut TcpStream) -> Vec<u8> {
        let mut reply = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = client.read(&mut byte).await.unwrap();
            assert!(n > 0, "connection closed before frame terminator");
            reply.push(byte[0]);
            if byte[0] == b'\r' {
                return reply;
            }
        }
    }

    #[tokio::test]
    async fn serves_requests_end_to_end() {
        let handle = run(StoreKind::Memory, 4, "127.0.0.1:0").await.unwrap();
        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();

        client.write_all(b"+\nk\n$\"v\"\n0\r").await.unwrap();
        assert_eq!(read_reply(&mut client).await, b"*\r");

        client.write_all(b"#\nk\r").await.unwrap();
        assert_eq!(read_reply(&mut client).await, b"$\"v\"\r");

        handle.stop().await;
    }

    #[tokio::test]
    async fn stop_closes_idle_connections_and_listener() {
        let handle = run(StoreKind::Memory, 4, "127.0.0.1:0").await.unwrap();
        let addr = handle.local_addr();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"#\nk\r").await.unwrap();
        assert_eq!(read_reply(&mut client).await, b"*\r");

        // An idle worker polls the closing signal, so stop returns promptly.
        tokio::time::timeout(Duration::from_secs(5), handle.stop())
            .await
            .expect("stop should not hit the drain timeout");

        let mut buf = [0u8; 1];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "worker should close the socket");

        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn done_resolves_after_stop() {
        let handle = run(StoreKind::Memory, 4, "127.0.0.1:0").await.unwrap();
        handle.stop().await;
        // Resolves immediately once stopped.
        tokio::time::timeout(Duration::from_millis(100), handle.done())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn persistent_store_kind_is_rejected() {
        let err = run(StoreKind::Persistent, 4, "127.0.0.1:0")
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Store(StoreError::InvalidKind)));
    }
}
