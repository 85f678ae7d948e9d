use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, trace, warn};

use super::MonitorEndpoint;
use crate::object::ObjectKey;
use crate::txn::{Participant, TxnId};
use crate::OptsvaError;

struct Record {
    participants: BTreeMap<ObjectKey, Arc<dyn Participant>>,
    /// Set by a sweep, cleared by a heartbeat. Still set at the next sweep
    /// means the transaction is gone.
    suspected: bool,
}

struct Shared {
    records: Mutex<HashMap<TxnId, Record>>,
    heartbeats: AtomicU64,
    recovered: AtomicU64,
    stopping: Mutex<bool>,
    stop_signal: Condvar,
    recoveries: Mutex<Vec<JoinHandle<()>>>,
}

/// Per-process liveness tracker for transactions holding tickets on local
/// objects.
pub struct FailureMonitor {
    shared: Arc<Shared>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for FailureMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailureMonitor")
            .field("tracked", &self.tracked())
            .field("heartbeats", &self.heartbeats_received())
            .finish()
    }
}

impl FailureMonitor {
    /// Starts a monitor that sweeps every `sweep_interval`.
    pub fn start(sweep_interval: Duration) -> Arc<Self> {
        let monitor = Self::detached();
        let shared = Arc::clone(&monitor.shared);
        let sweeper = thread::Builder::new()
            .name("optsva-monitor".into())
            .spawn(move || run_sweeper(&shared, sweep_interval));
        match sweeper {
            Ok(handle) => *monitor.sweeper.lock() = Some(handle),
            Err(err) => error!(error = %err, "cannot spawn monitor thread; sweeps are manual"),
        }
        Arc::new(monitor)
    }

    /// A monitor without a sweeper thread; sweeps only happen through
    /// [`FailureMonitor::sweep`].
    pub fn manual() -> Arc<Self> {
        Arc::new(Self::detached())
    }

    fn detached() -> Self {
        Self {
            shared: Arc::new(Shared {
                records: Mutex::new(HashMap::new()),
                heartbeats: AtomicU64::new(0),
                recovered: AtomicU64::new(0),
                stopping: Mutex::new(false),
                stop_signal: Condvar::new(),
                recoveries: Mutex::new(Vec::new()),
            }),
            sweeper: Mutex::new(None),
        }
    }

    pub fn register(&self, txn: TxnId, participant: Arc<dyn Participant>) {
        let key = participant.key().clone();
        let mut records = self.shared.records.lock();
        let record = records.entry(txn).or_insert_with(|| Record {
            participants: BTreeMap::new(),
            suspected: false,
        });
        record.participants.insert(key, participant);
    }

    pub fn unregister(&self, txn: TxnId, key: &ObjectKey) {
        let mut records = self.shared.records.lock();
        if let Some(record) = records.get_mut(&txn) {
            record.participants.remove(key);
            if record.participants.is_empty() {
                records.remove(&txn);
            }
        }
    }

    /// Marks `txn` alive until the next sweep. Unknown ids are ignored: the
    /// transaction has not touched a local object yet or already finished.
    pub fn heartbeat(&self, txn: TxnId) {
        self.shared.heartbeats.fetch_add(1, Ordering::Relaxed);
        if let Some(record) = self.shared.records.lock().get_mut(&txn) {
            record.suspected = false;
        }
        trace!(txn = %txn, "heartbeat");
    }

    /// Runs one sweep and returns the transactions declared failed. Their
    /// participants are rolled back on a recovery thread per transaction.
    pub fn sweep(&self) -> Vec<TxnId> {
        sweep(&self.shared)
    }

    pub fn tracked(&self) -> usize {
        self.shared.records.lock().len()
    }

    pub fn is_tracked(&self, txn: TxnId) -> bool {
        self.shared.records.lock().contains_key(&txn)
    }

    pub fn heartbeats_received(&self) -> u64 {
        self.shared.heartbeats.load(Ordering::Relaxed)
    }

    /// Number of participants forcibly rolled back so far.
    pub fn recovered(&self) -> u64 {
        self.shared.recovered.load(Ordering::Relaxed)
    }

    /// Waits for every recovery started so far.
    pub fn join_recoveries(&self) {
        let handles: Vec<_> = self.shared.recoveries.lock().drain(..).collect();
        let current = thread::current().id();
        for handle in handles {
            // The last reference may be dropped on a recovery thread itself.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("recovery thread panicked");
            }
        }
    }

    pub fn shutdown(&self) {
        *self.shared.stopping.lock() = true;
        self.shared.stop_signal.notify_all();
        if let Some(handle) = self.sweeper.lock().take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                error!("monitor thread panicked");
            }
        }
        self.join_recoveries();
    }
}

impl Drop for FailureMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl MonitorEndpoint for FailureMonitor {
    fn ping(&self, txn: TxnId) -> Result<(), OptsvaError> {
        self.heartbeat(txn);
        Ok(())
    }

    fn describe(&self) -> String {
        "local".into()
    }
}

fn run_sweeper(shared: &Arc<Shared>, interval: Duration) {
    debug!(interval_ms = interval.as_millis() as u64, "failure monitor started");
    loop {
        {
            let mut stopping = shared.stopping.lock();
            if !*stopping {
                shared.stop_signal.wait_for(&mut stopping, interval);
            }
            if *stopping {
                break;
            }
        }
        sweep(shared);
    }
    debug!("failure monitor stopped");
}

fn sweep(shared: &Arc<Shared>) -> Vec<TxnId> {
    let failed: Vec<(TxnId, Vec<Arc<dyn Participant>>)> = {
        let mut records = shared.records.lock();
        let dead: Vec<TxnId> = records
            .iter_mut()
            .filter_map(|(txn, record)| {
                if record.suspected {
                    Some(*txn)
                } else {
                    record.suspected = true;
                    None
                }
            })
            .collect();
        dead.into_iter()
            .filter_map(|txn| {
                records
                    .remove(&txn)
                    .map(|record| (txn, record.participants.into_values().collect()))
            })
            .collect()
    };

    let mut ids = Vec::with_capacity(failed.len());
    for (txn, participants) in failed {
        warn!(txn = %txn, participants = participants.len(), "transaction missed its heartbeat; rolling back");
        ids.push(txn);
        let shared_for_thread = Arc::clone(shared);
        let spawned = thread::Builder::new()
            .name("optsva-recovery".into())
            .spawn(move || recover(&shared_for_thread, txn, participants));
        match spawned {
            Ok(handle) => shared.recoveries.lock().push(handle),
            Err(err) => error!(txn = %txn, error = %err, "cannot spawn recovery thread"),
        }
    }
    ids
}

/// Participants come out of a `BTreeMap`, so they are already in key order.
fn recover(shared: &Shared, txn: TxnId, participants: Vec<Arc<dyn Participant>>) {
    // Live predecessors may be queued on a lock the dead transaction holds;
    // waiting for our turn before dropping it would never end.
    for participant in &participants {
        participant.abandon();
    }
    for participant in participants {
        let key = participant.key().clone();
        if let Err(err) = participant.wait_for_snapshot() {
            warn!(txn = %txn, object = %key, error = %err, "recovery could not settle snapshot");
        }
        match participant.finish_transaction(true) {
            Ok(()) => {
                shared.recovered.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => warn!(txn = %txn, object = %key, error = %err, "recovery rollback failed"),
        }
    }
    info!(txn = %txn, "failed transaction rolled back");
}
