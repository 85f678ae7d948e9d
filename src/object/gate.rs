use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::core::wait_stats::{record_wait, WaitStatKind};

/// A monotonic counting gate. Each `open` adds one unit; waiters block until
/// the count reaches their own threshold, so several waiters with different
/// thresholds can be parked at once.
#[derive(Debug)]
pub struct VersionGate {
    count: Mutex<u64>,
    opened: Condvar,
    kind: WaitStatKind,
}

impl VersionGate {
    pub fn new(kind: WaitStatKind) -> Self {
        Self {
            count: Mutex::new(0),
            opened: Condvar::new(),
            kind,
        }
    }

    pub fn count(&self) -> u64 {
        *self.count.lock()
    }

    /// Non-blocking check: has the gate been opened at least `n` times?
    pub fn is_open(&self, n: u64) -> bool {
        *self.count.lock() >= n
    }

    pub fn open(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.opened.notify_all();
    }

    pub fn wait(&self, n: u64) {
        let mut count = self.count.lock();
        if *count >= n {
            return;
        }
        let start = Instant::now();
        while *count < n {
            self.opened.wait(&mut count);
        }
        record_wait(self.kind, start.elapsed());
    }

    /// Waits for at most `timeout`; returns whether the threshold was reached.
    pub fn wait_timeout(&self, n: u64, timeout: Duration) -> bool {
        let mut count = self.count.lock();
        if *count >= n {
            return true;
        }
        let start = Instant::now();
        let deadline = start + timeout;
        while *count < n {
            if self.opened.wait_until(&mut count, deadline).timed_out() {
                break;
            }
        }
        let reached = *count >= n;
        if reached {
            record_wait(self.kind, start.elapsed());
        }
        reached
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn waiters_with_different_thresholds_wake_in_turn() {
        let gate = Arc::new(VersionGate::new(WaitStatKind::ReleaseGate));
        let handles: Vec<_> = (1..=3)
            .map(|n| {
                let gate = Arc::clone(&gate);
                thread::spawn(move || {
                    gate.wait(n);
                    n
                })
            })
            .collect();

        for _ in 0..3 {
            gate.open();
        }
        let mut woken: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        woken.sort_unstable();
        assert_eq!(woken, vec![1, 2, 3]);
        assert_eq!(gate.count(), 3);
    }

    #[test]
    fn zero_threshold_is_always_open() {
        let gate = VersionGate::new(WaitStatKind::CheckpointGate);
        assert!(gate.is_open(0));
        assert!(!gate.is_open(1));
        gate.wait(0);
    }

    #[test]
    fn wait_timeout_reports_unreached_threshold() {
        let gate = VersionGate::new(WaitStatKind::CheckpointGate);
        assert!(!gate.wait_timeout(1, Duration::from_millis(20)));
        gate.open();
        assert!(gate.wait_timeout(1, Duration::from_millis(20)));
    }
}
