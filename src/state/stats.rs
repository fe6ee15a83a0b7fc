//! Process-wide traffic and event counters.
//!
//! One instance per daemon, atomics with relaxed ordering; exact
//! consistency is not required for accounting. Everything here is
//! write-by-core, read-by-observability-surface.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ServerStats {
    /// Accepted connections.
    pub accepts: AtomicU64,
    /// Connections refused before registration.
    pub refused: AtomicU64,
    /// Commands with no handler.
    pub unknown_commands: AtomicU64,
    /// Empty lines received.
    pub empty_messages: AtomicU64,
    /// Nick collisions resolved.
    pub collisions: AtomicU64,
    /// KILLs issued locally.
    pub kills: AtomicU64,
    /// Byte and message totals, split client vs server link.
    pub bytes_sent_client: AtomicU64,
    pub bytes_recv_client: AtomicU64,
    pub bytes_sent_server: AtomicU64,
    pub bytes_recv_server: AtomicU64,
    pub messages_sent_client: AtomicU64,
    pub messages_recv_client: AtomicU64,
    pub messages_sent_server: AtomicU64,
    pub messages_recv_server: AtomicU64,
    /// Cumulative connected seconds, split client vs server link.
    pub conn_seconds_client: AtomicU64,
    pub conn_seconds_server: AtomicU64,
    /// Registration outcomes.
    pub auth_successes: AtomicU64,
    pub auth_failures: AtomicU64,
    pub sasl_successes: AtomicU64,
    pub sasl_failures: AtomicU64,
    /// Messages blocked by the target-change throttle.
    pub target_change_blocks: AtomicU64,
}

impl ServerStats {
    pub fn new() -> ServerStats {
        ServerStats::default()
    }

    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Charge an exited connection's traffic to the right bucket.
    pub fn record_exit(&self, is_server: bool, sent: u64, recv: u64, connected_secs: u64) {
        if is_server {
            Self::add(&self.bytes_sent_server, sent);
            Self::add(&self.bytes_recv_server, recv);
            Self::add(&self.conn_seconds_server, connected_secs);
        } else {
            Self::add(&self.bytes_sent_client, sent);
            Self::add(&self.bytes_recv_client, recv);
            Self::add(&self.conn_seconds_client, connected_secs);
        }
    }
}
