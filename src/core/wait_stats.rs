use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatKind {
    HostLock,
    ReleaseGate,
    CheckpointGate,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct WaitCounterSnapshot {
    pub waits: u64,
    pub wait_ns: u64,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct WaitStatsSnapshot {
    pub host_lock: WaitCounterSnapshot,
    pub release_gate: WaitCounterSnapshot,
    pub checkpoint_gate: WaitCounterSnapshot,
}

#[derive(Debug, Default)]
struct WaitCounter {
    waits: AtomicU64,
    wait_ns: AtomicU64,
}

impl WaitCounter {
    fn record(&self, wait: Duration) {
        self.waits.fetch_add(1, Ordering::Relaxed);
        self.wait_ns
            .fetch_add(duration_as_u64_ns(wait), Ordering::Relaxed);
    }

    fn snapshot(&self) -> WaitCounterSnapshot {
        WaitCounterSnapshot {
            waits: self.waits.load(Ordering::Relaxed),
            wait_ns: self.wait_ns.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.waits.store(0, Ordering::Relaxed);
        self.wait_ns.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
struct WaitStats {
    enabled: AtomicBool,
    host_lock: WaitCounter,
    release_gate: WaitCounter,
    checkpoint_gate: WaitCounter,
}

impl WaitStats {
    fn counter(&self, kind: WaitStatKind) -> &WaitCounter {
        match kind {
            WaitStatKind::HostLock => &self.host_lock,
            WaitStatKind::ReleaseGate => &self.release_gate,
            WaitStatKind::CheckpointGate => &self.checkpoint_gate,
        }
    }
}

static GLOBAL_WAIT_STATS: OnceLock<WaitStats> = OnceLock::new();

fn global_wait_stats() -> &'static WaitStats {
    GLOBAL_WAIT_STATS.get_or_init(WaitStats::default)
}

pub fn set_wait_stats_enabled(enabled: bool) {
    global_wait_stats()
        .enabled
        .store(enabled, Ordering::Relaxed);
}

pub fn wait_stats_enabled() -> bool {
    global_wait_stats().enabled.load(Ordering::Relaxed)
}

pub fn reset_wait_stats() {
    let stats = global_wait_stats();
    stats.host_lock.reset();
    stats.release_gate.reset();
    stats.checkpoint_gate.reset();
}

pub fn snapshot_wait_stats() -> WaitStatsSnapshot {
    let stats = global_wait_stats();
    WaitStatsSnapshot {
        host_lock: stats.host_lock.snapshot(),
        release_gate: stats.release_gate.snapshot(),
        checkpoint_gate: stats.checkpoint_gate.snapshot(),
    }
}

/// Records one blocking wait. Waits that did not block are not worth
/// counting, so callers only report the slow path.
pub fn record_wait(kind: WaitStatKind, wait: Duration) {
    if !wait_stats_enabled() {
        return;
    }
    global_wait_stats().counter(kind).record(wait);
}

fn duration_as_u64_ns(duration: Duration) -> u64 {
    duration.as_nanos().min(u64::MAX as u128) as u64
}
