use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use super::gate::VersionGate;
use super::proxy::ObjectProxy;
use super::snapshot::SnapshotImage;
use super::{AccessMode, Bounds, ObjectKey, SharedObject, Ticket, Version};
use crate::core::wait_stats::{record_wait, WaitStatKind};
use crate::failure::FailureMonitor;
use crate::scheduler::TaskScheduler;
use crate::txn::{TransactionRef, TxnId};
use crate::OptsvaError;

/// Process services a host hands to the proxies it creates: background work
/// runs on the scheduler of the process where the object lives, and
/// liveness is tracked by that process's failure monitor.
#[derive(Clone)]
pub struct HostContext {
    pub(crate) scheduler: Arc<TaskScheduler>,
    pub(crate) monitor: Option<Arc<FailureMonitor>>,
    pub(crate) wait_poll: Duration,
}

impl HostContext {
    pub fn new(
        scheduler: Arc<TaskScheduler>,
        monitor: Option<Arc<FailureMonitor>>,
        wait_poll: Duration,
    ) -> Self {
        Self {
            scheduler,
            monitor,
            wait_poll,
        }
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub fn monitor(&self) -> Option<&Arc<FailureMonitor>> {
        self.monitor.as_ref()
    }
}

impl fmt::Debug for HostContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostContext")
            .field("monitored", &self.monitor.is_some())
            .field("wait_poll", &self.wait_poll)
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
struct Holder {
    owner: TxnId,
    depth: usize,
}

/// Reentrant mutual exclusion keyed by transaction rather than by thread:
/// the same transaction may re-enter from any thread, including the
/// scheduler acting on its behalf.
#[derive(Debug, Default)]
struct OwnerLock {
    holder: Mutex<Option<Holder>>,
    released: Condvar,
}

impl OwnerLock {
    fn acquire(&self, owner: TxnId) {
        let mut holder = self.holder.lock();
        let mut start = None;
        loop {
            match holder.as_mut() {
                None => {
                    *holder = Some(Holder { owner, depth: 1 });
                    break;
                }
                Some(h) if h.owner == owner => {
                    h.depth += 1;
                    break;
                }
                Some(_) => {
                    start.get_or_insert_with(Instant::now);
                    self.released.wait(&mut holder);
                }
            }
        }
        if let Some(start) = start {
            record_wait(WaitStatKind::HostLock, start.elapsed());
        }
    }

    fn release(&self, owner: TxnId) -> bool {
        let mut holder = self.holder.lock();
        match holder.as_mut() {
            Some(h) if h.owner == owner => {
                h.depth -= 1;
                if h.depth == 0 {
                    *holder = None;
                    self.released.notify_all();
                }
                true
            }
            _ => false,
        }
    }

    /// Drops every reentrant level held by `owner`.
    fn force_release(&self, owner: TxnId) -> bool {
        let mut holder = self.holder.lock();
        match holder.as_ref() {
            Some(h) if h.owner == owner => {
                *holder = None;
                self.released.notify_all();
                true
            }
            _ => false,
        }
    }

    fn holder(&self) -> Option<TxnId> {
        self.holder.lock().map(|h| h.owner)
    }
}

#[derive(Debug)]
struct HostState<T> {
    object: T,
    version: Version,
    /// Number of rollback restorations so far. A proxy whose access predates
    /// a restoration has observed discarded state.
    restorations: u64,
    /// Most recent image; valid only while the object is unchanged.
    last_snapshot: Option<SnapshotImage>,
}

/// One shared object and the counters that serialize transactions on it.
pub struct SharedObjectHost<T: SharedObject> {
    key: ObjectKey,
    global_ticket: Mutex<Ticket>,
    state: Mutex<HostState<T>>,
    lock: OwnerLock,
    release_gate: VersionGate,
    checkpoint_gate: VersionGate,
    context: HostContext,
}

impl<T: SharedObject> fmt::Debug for SharedObjectHost<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedObjectHost")
            .field("key", &self.key)
            .field("global_ticket", &*self.global_ticket.lock())
            .field("current_version", &self.current_version())
            .field("released", &self.release_gate.count())
            .field("checkpointed", &self.checkpoint_gate.count())
            .finish()
    }
}

impl<T: SharedObject> SharedObjectHost<T> {
    pub fn new(name: impl Into<String>, object: T, context: HostContext) -> Arc<Self> {
        Arc::new(Self {
            key: ObjectKey::new(name),
            global_ticket: Mutex::new(0),
            state: Mutex::new(HostState {
                object,
                version: 0,
                restorations: 0,
                last_snapshot: None,
            }),
            lock: OwnerLock::default(),
            release_gate: VersionGate::new(WaitStatKind::ReleaseGate),
            checkpoint_gate: VersionGate::new(WaitStatKind::CheckpointGate),
            context,
        })
    }

    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    pub fn context(&self) -> &HostContext {
        &self.context
    }

    /// Creates one transaction's view of this object.
    pub fn create_proxy(
        self: &Arc<Self>,
        tx_ref: Weak<dyn TransactionRef>,
        txn_id: TxnId,
        bounds: Bounds,
        mode: AccessMode,
    ) -> Result<ObjectProxy<T>, OptsvaError> {
        bounds.validate()?;
        Ok(ObjectProxy::new(Arc::clone(self), tx_ref, txn_id, bounds, mode, false))
    }

    /// Creates a proxy for a write-only transaction: every access is a
    /// logged write and tickets are only assigned at commit.
    pub fn create_write_only_proxy(
        self: &Arc<Self>,
        tx_ref: Weak<dyn TransactionRef>,
        txn_id: TxnId,
        writes: u64,
    ) -> Result<ObjectProxy<T>, OptsvaError> {
        let bounds = Bounds::writes(writes);
        bounds.validate()?;
        Ok(ObjectProxy::new(
            Arc::clone(self),
            tx_ref,
            txn_id,
            bounds,
            AccessMode::WriteOnly,
            true,
        ))
    }

    /// Hands out the next position in this object's serialization order.
    pub fn start_transaction(&self) -> Ticket {
        let mut ticket = self.global_ticket.lock();
        *ticket += 1;
        *ticket
    }

    pub fn issued_tickets(&self) -> Ticket {
        *self.global_ticket.lock()
    }

    pub fn acquire(&self, owner: TxnId) {
        self.lock.acquire(owner);
    }

    pub fn release(&self, owner: TxnId) {
        if !self.lock.release(owner) {
            warn!(object = %self.key, txn = %owner, "release of a host lock the transaction does not hold");
        }
    }

    pub fn force_release(&self, owner: TxnId) -> bool {
        self.lock.force_release(owner)
    }

    pub fn lock_holder(&self) -> Option<TxnId> {
        self.lock.holder()
    }

    pub fn take_snapshot(&self) -> Result<SnapshotImage, OptsvaError> {
        let mut state = self.state.lock();
        if let Some(image) = &state.last_snapshot {
            if image.version() == state.version {
                return Ok(image.clone());
            }
        }
        let image = SnapshotImage::capture(&state.object, state.version)?;
        state.last_snapshot = Some(image.clone());
        Ok(image)
    }

    /// Replaces the object's state with the image's. Callers hold the host lock.
    pub fn restore(&self, image: &SnapshotImage) -> Result<(), OptsvaError> {
        let object: T = image.materialize()?;
        let mut state = self.state.lock();
        state.object = object;
        state.restorations += 1;
        state.last_snapshot = Some(image.clone());
        Ok(())
    }

    pub fn advance_version(&self, version: Version) {
        self.state.lock().version = version;
    }

    pub fn current_version(&self) -> Version {
        self.state.lock().version
    }

    pub fn restorations(&self) -> u64 {
        self.state.lock().restorations
    }

    pub fn read_with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.state.lock().object)
    }

    pub fn write_with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut state = self.state.lock();
        state.last_snapshot = None;
        f(&mut state.object)
    }

    pub fn apply_log(&self, log: &[T::Write]) {
        if log.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        state.last_snapshot = None;
        for write in log {
            state.object.apply(write);
        }
    }

    pub fn clone_object(&self) -> T {
        self.state.lock().object.clone()
    }

    /// Blocks until the release gate opened at least `n` times, i.e. until
    /// it is ticket `n + 1`'s turn.
    pub fn await_ticket_ready(&self, n: u64) {
        self.release_gate.wait(n);
    }

    pub fn try_ticket_ready(&self, n: u64) -> bool {
        self.release_gate.is_open(n)
    }

    pub(crate) fn await_ticket_ready_timeout(&self, n: u64, timeout: Duration) -> bool {
        self.release_gate.wait_timeout(n, timeout)
    }

    pub fn signal_released(&self) {
        self.release_gate.open();
        self.context.scheduler.ping();
    }

    pub fn released_count(&self) -> u64 {
        self.release_gate.count()
    }

    pub fn await_checkpoint(&self, n: u64) {
        self.checkpoint_gate.wait(n);
    }

    pub fn try_checkpoint(&self, n: u64) -> bool {
        self.checkpoint_gate.is_open(n)
    }

    pub(crate) fn await_checkpoint_timeout(&self, n: u64, timeout: Duration) -> bool {
        self.checkpoint_gate.wait_timeout(n, timeout)
    }

    pub fn signal_checkpoint(&self) {
        self.checkpoint_gate.open();
        self.context.scheduler.ping();
    }

    pub fn checkpoint_count(&self) -> u64 {
        self.checkpoint_gate.count()
    }

    /// Finalizes one transaction on this object. With `restore`, an image
    /// older than the current version is written back and the version
    /// rewound, which invalidates every later ticket that already read the
    /// discarded state. The checkpoint gate always opens exactly once.
    pub fn finish_transaction(
        &self,
        owner: TxnId,
        snapshot: Option<&SnapshotImage>,
        restore: bool,
    ) -> Result<(), OptsvaError> {
        let result = match snapshot {
            Some(image) if restore => self.restore_if_stale(owner, image),
            _ => Ok(()),
        };
        self.signal_checkpoint();
        result
    }

    fn restore_if_stale(&self, owner: TxnId, image: &SnapshotImage) -> Result<(), OptsvaError> {
        if image.version() >= self.current_version() {
            return Ok(());
        }
        self.acquire(owner);
        let result = if image.version() < self.current_version() {
            self.restore(image).map(|()| {
                self.advance_version(image.version());
                debug!(object = %self.key, txn = %owner, version = image.version(), "restored snapshot");
            })
        } else {
            Ok(())
        };
        // A failing transaction may abandon a call sequence midway, so drop
        // every level it holds rather than just ours.
        self.force_release(owner);
        result
    }
}
