//! Background Sweep
//!
//! Lazy expiry alone leaks memory: an expired entry that is never read again
//! would sit in its shard forever. The sweeper is a single background task
//! that wakes on a fixed interval and walks every shard, deleting entries
//! past their deadline. It also drains the store's lazy-remove queue, so a
//! `get` that observed an expired entry does not pay for the delete itself.

use crate::storage::engine::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

/// Interval between full sweeps when none is configured.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Sweeping more often than this buys nothing and churns the write locks.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Configuration for the background sweep.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Time between full sweeps; floored at [`MIN_SWEEP_INTERVAL`].
    pub interval: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl SweepConfig {
    fn effective_interval(&self) -> Duration {
        self.interval.max(MIN_SWEEP_INTERVAL)
    }
}

/// Handle to the running sweeper task. Dropping it stops the task.
#[derive(Debug)]
pub struct Sweeper {
    shutdown_tx: watch::Sender<bool>,
}

impl Sweeper {
    /// Spawns the sweeper for `store`.
    ///
    /// The first sweeper started on a store also takes ownership of its
    /// lazy-remove queue.
    pub fn start(store: Arc<Store>, config: SweepConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let purge_rx = store.take_purge_queue();

        tokio::spawn(sweep_loop(store, config, purge_rx, shutdown_rx));

        Self { shutdown_tx }
    }

    /// Signals the sweeper task to exit. Called automatically on drop.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn sweep_loop(
    store: Arc<Store>,
    config: SweepConfig,
    mut purge_rx: Option<mpsc::Receiver<String>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(config.effective_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let removed = store.sweep();
                if removed > 0 {
                    debug!(removed, remaining = store.len(), "swept expired entries");
                }
            }
            key = recv_purge(&mut purge_rx) => {
                if let Some(key) = key {
                    if store.remove_if_expired(&key) {
                        trace!(key = %key, "removed lazily expired entry");
                    }
                }
            }
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("sweeper received shutdown signal");
                    return;
                }
            }
        }
    }
}

async fn recv_purge(rx: &mut Option<mpsc::Receiver<String>>) -> Option<String> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
