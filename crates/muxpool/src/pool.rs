//! Fixed-size pool of multiplexed connections to a single endpoint.
//!
//! This module defines [`ConnectionPool`], which spreads calls over `N`
//! long-lived connections instead of sharing one or dialing per call.
//!
//! ## Acquisition
//!
//! - A relaxed atomic counter picks the slot (round-robin).
//! - The slot is an [`ArcSwapOption`]. Loading it takes no lock, so a healthy
//!   slot is returned without contention or I/O.
//! - An unhealthy connection is closed as soon as it is seen. The empty or
//!   unhealthy slot is then repaired under a pool-wide async lock. The
//!   slot is re-read once the lock is held; if another caller already repaired
//!   it, that connection is returned and no second dial happens.
//! - A failed dial leaves the slot empty. The error is returned to the caller
//!   and the next acquire landing on that slot dials again.
//!
//! The pool owns every connection it dials and is the only party that closes
//! them, either while replacing an unhealthy one or in [`close_all`].
//!
//! [`close_all`]: ConnectionPool::close_all

use crate::{
    Error, Result,
    config::PoolConfig,
    grpc::GrpcDialer,
    metrics,
    transport::{Connection, ConnectivityState, Dialer},
};
use arc_swap::ArcSwapOption;
use core::{
    fmt,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};
use std::sync::Arc;
use tokio::sync::Mutex;


/// A fixed set of connection slots to one endpoint, rotated across callers.
pub struct ConnectionPool<D: Dialer = GrpcDialer> {
    endpoint: String,
    config: PoolConfig,
    dialer: D,
    slots: Box<[ArcSwapOption<D::Connection>]>,
    next_slot: AtomicUsize,
    repair: Mutex<()>,
    counters: Counters,
}

#[derive(Default)]
struct Counters {
    dials: AtomicU64,
    dial_failures: AtomicU64,
    replacements: AtomicU64,
}

impl ConnectionPool<GrpcDialer> {
    /// Creates a pool of tonic channels to `endpoint`.
    pub fn grpc(endpoint: impl Into<String>, config: PoolConfig) -> Self {
        Self::new(endpoint, config, GrpcDialer)
    }
}

impl<D: Dialer> ConnectionPool<D> {
    /// Creates a pool with `config.pool_size` empty slots. Nothing is dialed
    /// until the first acquire lands on a slot.
    pub fn new(endpoint: impl Into<String>, config: PoolConfig, dialer: D) -> Self {
        let config = config.normalized();
        let slots = (0..config.pool_size)
            .map(|_| ArcSwapOption::empty())
            .collect();

        Self {
            endpoint: endpoint.into(),
            config,
            dialer,
            slots,
            next_slot: AtomicUsize::new(0),
            repair: Mutex::new(()),
            counters: Counters::default(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Number of slots. Fixed for the lifetime of the pool.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Returns the index of the slot the next acquire will use (round-robin).
    ///
    /// Uses a relaxed atomic increment; only the distribution matters, not the
    /// order between threads.
    fn next_slot_index(&self) -> usize {
        self.next_slot.fetch_add(1, Ordering::Relaxed) % self.slots.len()
    }

    /// Hands out a usable connection, dialing one if the chosen slot is empty
    /// or holds a connection in `TransientFailure`/`Shutdown`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DialFailed`] if a replacement could not be dialed.
    pub async fn acquire(&self) -> Result<Arc<D::Connection>> {
        let index = self.next_slot_index();
        metrics::record_acquire(&self.endpoint);

        if let Some(conn) = self.slots[index].load_full() {
            if conn.state().is_usable() {
                return Ok(conn);
            }
            // Close is idempotent, so racing observers may all do this.
            conn.close();
        }

        self.repair_slot(index).await
    }

    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(level = "debug", skip(self), fields(endpoint = %self.endpoint))
    )]
    async fn repair_slot(&self, index: usize) -> Result<Arc<D::Connection>> {
        let _guard = self.repair.lock().await;
        let slot = &self.slots[index];

        // Another caller may have repaired the slot while we waited.
        let replacing = match slot.load_full() {
            Some(conn) if conn.state().is_usable() => return Ok(conn),
            Some(stale) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(state = ?stale.state(), "Replacing unhealthy connection");
                slot.store(None);
                stale.close();
                true
            }
            None => false,
        };

        self.counters.dials.fetch_add(1, Ordering::Relaxed);
        metrics::record_dial(&self.endpoint);

        match self.dialer.dial(&self.endpoint, &self.config).await {
            Ok(conn) => {
                let conn = Arc::new(conn);
                slot.store(Some(Arc::clone(&conn)));
                if replacing {
                    self.counters.replacements.fetch_add(1, Ordering::Relaxed);
                    metrics::record_replacement(&self.endpoint);
                }
                #[cfg(feature = "tracing")]
                tracing::debug!("Dialed connection into slot");
                Ok(conn)
            }
            Err(source) => {
                self.counters.dial_failures.fetch_add(1, Ordering::Relaxed);
                metrics::record_dial_failure(&self.endpoint);
                #[cfg(feature = "tracing")]
                tracing::warn!("Dial failed: {}", source);
                Err(Error::DialFailed {
                    endpoint: self.endpoint.clone(),
                    source,
                })
            }
        }
    }

    /// Closes every connection and empties every slot.
    ///
    /// Idempotent. Acquires racing with this call may still receive a
    /// connection that is being closed; acquires after it dial afresh.
    pub async fn close_all(&self) {
        let _guard = self.repair.lock().await;
        let mut _closed = 0usize;
        for slot in self.slots.iter() {
            if let Some(conn) = slot.swap(None) {
                conn.close();
                _closed += 1;
            }
        }

        #[cfg(feature = "tracing")]
        tracing::info!(endpoint = %self.endpoint, closed = _closed, "Closed connection pool");
    }

    /// State of each slot's connection, `None` for an empty slot.
    pub fn slot_states(&self) -> Vec<Option<ConnectivityState>> {
        self.slots
            .iter()
            .map(|slot| slot.load_full().map(|conn| conn.state()))
            .collect()
    }

    /// Point-in-time counters for this pool.
    pub fn stats(&self) -> PoolStats {
        let connected = self
            .slot_states()
            .into_iter()
            .flatten()
            .filter(|state| state.is_usable())
            .count();

        PoolStats {
            capacity: self.capacity(),
            connected,
            dials: self.counters.dials.load(Ordering::Relaxed),
            dial_failures: self.counters.dial_failures.load(Ordering::Relaxed),
            replacements: self.counters.replacements.load(Ordering::Relaxed),
        }
    }
}

impl<D: Dialer> fmt::Debug for ConnectionPool<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("endpoint", &self.endpoint)
            .field("config", &self.config)
            .field("capacity", &self.slots.len())
            .finish_non_exhaustive()
    }
}

/// Snapshot of a pool's slot occupancy and dial history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    /// Slots holding a connection in a usable state.
    pub connected: usize,
    pub dials: u64,
    pub dial_failures: u64,
    pub replacements: u64,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} connected, {} dials ({} failed), {} replaced",
            self.connected, self.capacity, self.dials, self.dial_failures, self.replacements
        )
    }
}
