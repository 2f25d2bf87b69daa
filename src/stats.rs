use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::context::{Outcome, RequestContext};

/// Process-wide connection counters.
#[derive(Debug, Default)]
pub struct ProxyStats {
    accepted: AtomicU64,
    active: AtomicU64,
    forwarded: AtomicU64,
    truncated: AtomicU64,
    denied: AtomicU64,
    failed: AtomicU64,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
}

impl ProxyStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts an accepted connection until the returned guard is dropped.
    pub fn connection_opened(self: &Arc<Self>) -> ActiveConnection {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
        ActiveConnection {
            stats: Arc::clone(self),
        }
    }

    /// Folds a finalized context into the totals.
    pub fn record(&self, ctx: &RequestContext) {
        match ctx.outcome() {
            Outcome::Forwarded { truncated } => {
                self.forwarded.fetch_add(1, Ordering::Relaxed);
                if *truncated {
                    self.truncated.fetch_add(1, Ordering::Relaxed);
                }
            }
            Outcome::Denied(_) => {
                self.denied.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Failed(_) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Pending => {}
        }
        let traffic = ctx.traffic();
        self.bytes_up.fetch_add(traffic.bytes_up, Ordering::Relaxed);
        self.bytes_down.fetch_add(traffic.bytes_down, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            truncated: self.truncated.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
        }
    }
}

/// Decrements the active connection count on drop.
#[derive(Debug)]
pub struct ActiveConnection {
    stats: Arc<ProxyStats>,
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        let _ = self
            .stats
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub active: u64,
    pub forwarded: u64,
    pub truncated: u64,
    pub denied: u64,
    pub failed: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "accepted={} active={} forwarded={} (truncated={}) denied={} failed={} up={}B down={}B",
            self.accepted,
            self.active,
            self.forwarded,
            self.truncated,
            self.denied,
            self.failed,
            self.bytes_up,
            self.bytes_down
        )
    }
}
