use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{Participant, TransactionRef, TxnId, TxnState};
use crate::failure::{Heartbeat, MonitorEndpoint};
use crate::object::{AccessMode, Bound, Bounds, ObjectProxy, SharedObject, SharedObjectHost};
use crate::OptsvaError;

/// State shared between a transaction handle and the proxies that call
/// back into it.
pub(crate) struct TxnCore {
    id: TxnId,
    /// Write-only transactions take their tickets at commit.
    deferred: bool,
    state: Mutex<TxnState>,
    participants: Mutex<Vec<Arc<dyn Participant>>>,
    extra_monitors: Mutex<Vec<Arc<dyn MonitorEndpoint>>>,
    heartbeat: Option<Arc<Heartbeat>>,
    /// Serializes commit and rollback.
    finishing: Mutex<()>,
}

impl TxnCore {
    pub(crate) fn new(heartbeat: Option<Arc<Heartbeat>>, deferred: bool) -> Arc<Self> {
        Arc::new(Self {
            id: TxnId::new(),
            deferred,
            state: Mutex::new(TxnState::Preparing),
            participants: Mutex::new(Vec::new()),
            extra_monitors: Mutex::new(Vec::new()),
            heartbeat,
            finishing: Mutex::new(()),
        })
    }

    pub(crate) fn id(&self) -> TxnId {
        self.id
    }

    pub(crate) fn state(&self) -> TxnState {
        *self.state.lock()
    }

    fn expect_state(&self, expected: TxnState, action: &str) -> Result<(), OptsvaError> {
        let state = self.state();
        if state != expected {
            return Err(OptsvaError::InvalidTransactionState(format!(
                "cannot {action} transaction {} while {state}",
                self.id
            )));
        }
        Ok(())
    }

    pub(crate) fn register<T: SharedObject>(
        self: &Arc<Self>,
        host: &Arc<SharedObjectHost<T>>,
        bounds: Bounds,
        mode: AccessMode,
    ) -> Result<ObjectProxy<T>, OptsvaError> {
        self.expect_state(TxnState::Preparing, "register objects with")?;
        let mut participants = self.participants.lock();
        if participants.iter().any(|p| p.key() == host.key()) {
            return Err(OptsvaError::InvalidTransactionState(format!(
                "{} registered twice in transaction {}",
                host.key(),
                self.id
            )));
        }
        let tx_ref: Weak<dyn TransactionRef> = Arc::downgrade(self) as Weak<dyn TransactionRef>;
        let proxy = if self.deferred {
            let writes = match bounds.writes {
                Bound::Finite(n) => n,
                Bound::Unbounded => {
                    return Err(OptsvaError::InvalidBounds(
                        "write-only registrations need a finite write bound".into(),
                    ))
                }
            };
            host.create_write_only_proxy(tx_ref, self.id, writes)?
        } else {
            host.create_proxy(tx_ref, self.id, bounds, mode)?
        };
        participants.push(Arc::new(proxy.clone()));
        Ok(proxy)
    }

    pub(crate) fn add_monitor(&self, endpoint: Arc<dyn MonitorEndpoint>) {
        self.extra_monitors.lock().push(endpoint);
    }

    /// Sorted snapshot of the participant list.
    fn participants(&self) -> Vec<Arc<dyn Participant>> {
        let mut participants = self.participants.lock().clone();
        participants.sort_by(|a, b| a.key().cmp(b.key()));
        participants
    }

    /// The three-phase ticket handshake: lock every object in key order,
    /// take a ticket on each, unlock. Concurrent transactions therefore get
    /// their tickets in the same relative order on every shared object.
    fn assign_tickets(&self) -> Result<(), OptsvaError> {
        let participants = self.participants();
        for participant in &participants {
            participant.lock();
        }
        for participant in &participants {
            let ticket = participant.start_transaction();
            debug!(txn = %self.id, object = %participant.key(), ticket, "ticket assigned");
        }
        let mut first_error = None;
        for participant in &participants {
            if let Err(err) = participant.unlock() {
                first_error.get_or_insert(err);
            }
        }
        self.watch(&participants);
        first_error.map_or(Ok(()), Err)
    }

    fn watch(&self, participants: &[Arc<dyn Participant>]) {
        let Some(heartbeat) = &self.heartbeat else {
            return;
        };
        let mut endpoints: Vec<Arc<dyn MonitorEndpoint>> = self.extra_monitors.lock().clone();
        for endpoint in participants.iter().filter_map(|p| p.monitor_endpoint()) {
            if !endpoints.iter().any(|known| same_endpoint(known, &endpoint)) {
                endpoints.push(endpoint);
            }
        }
        heartbeat.watch(self.id, endpoints);
    }

    pub(crate) fn start(&self) -> Result<(), OptsvaError> {
        self.expect_state(TxnState::Preparing, "start")?;
        if self.deferred {
            *self.state.lock() = TxnState::Running;
            return Ok(());
        }
        let handshake = self.assign_tickets();
        *self.state.lock() = TxnState::Running;
        if let Err(err) = handshake {
            let _finishing = self.finishing.lock();
            self.terminate(true);
            return Err(err);
        }
        debug!(txn = %self.id, "transaction started");
        Ok(())
    }

    pub(crate) fn commit(&self) -> Result<(), OptsvaError> {
        let _finishing = self.finishing.lock();
        self.expect_state(TxnState::Running, "commit")?;

        if self.deferred {
            let flushed = self.assign_tickets().and_then(|()| {
                self.participants()
                    .iter()
                    .try_for_each(|participant| participant.update())
            });
            if let Err(err) = flushed {
                self.terminate(true);
                return Err(err);
            }
        }

        match self.terminate(false) {
            (_, Some(err)) => Err(err),
            (TxnState::Committed, None) => Ok(()),
            (_, None) => Err(OptsvaError::ForcedRollback(format!(
                "transaction {} read state discarded by an earlier transaction",
                self.id
            ))),
        }
    }

    /// `strict` rejects a transaction that already ended; the lenient form
    /// is what proxies and the driving loop use.
    pub(crate) fn rollback(&self, strict: bool) -> Result<(), OptsvaError> {
        let _finishing = self.finishing.lock();
        match self.state() {
            TxnState::Running => {}
            TxnState::Aborted if !strict => return Ok(()),
            state => {
                return Err(OptsvaError::InvalidTransactionState(format!(
                    "cannot roll back transaction {} while {state}",
                    self.id
                )))
            }
        }
        match self.terminate(true) {
            (_, Some(err)) => Err(err),
            _ => Ok(()),
        }
    }

    /// Waits on every participant, then finalizes all of them with one
    /// verdict. Per-object failures only force the verdict to rollback so
    /// that every host still sees its checkpoint. Callers hold `finishing`.
    fn terminate(&self, rollback: bool) -> (TxnState, Option<OptsvaError>) {
        let participants = self.participants();
        let mut must_rollback = rollback;
        let mut first_error = None;

        for participant in &participants {
            match participant.wait_for_snapshot() {
                Ok(valid) => {
                    if !valid {
                        debug!(txn = %self.id, object = %participant.key(), "snapshot invalidated");
                    }
                    must_rollback |= !valid;
                }
                Err(err) => {
                    warn!(txn = %self.id, object = %participant.key(), error = %err, "snapshot wait failed");
                    must_rollback = true;
                    first_error.get_or_insert(err);
                }
            }
        }
        for participant in &participants {
            if let Err(err) = participant.finish_transaction(must_rollback) {
                warn!(txn = %self.id, object = %participant.key(), error = %err, "finalize failed");
                first_error.get_or_insert(err);
            }
        }

        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.forget(self.id);
        }
        let outcome = if must_rollback {
            TxnState::Aborted
        } else {
            TxnState::Committed
        };
        *self.state.lock() = outcome;
        info!(txn = %self.id, outcome = %outcome, objects = participants.len(), "transaction finished");
        (outcome, first_error)
    }
}

fn same_endpoint(a: &Arc<dyn MonitorEndpoint>, b: &Arc<dyn MonitorEndpoint>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

impl TransactionRef for TxnCore {
    fn id(&self) -> TxnId {
        self.id
    }

    fn commit(&self) -> Result<(), OptsvaError> {
        TxnCore::commit(self)
    }

    fn rollback(&self) -> Result<(), OptsvaError> {
        TxnCore::rollback(self, false)
    }
}

/// A transaction over shared objects. Dropping a running transaction rolls
/// it back.
pub struct Transaction {
    core: Arc<TxnCore>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.core.id)
            .field("state", &self.core.state())
            .finish()
    }
}

impl Transaction {
    pub fn new(heartbeat: Option<Arc<Heartbeat>>) -> Self {
        Self {
            core: TxnCore::new(heartbeat, false),
        }
    }

    pub fn id(&self) -> TxnId {
        self.core.id()
    }

    pub fn state(&self) -> TxnState {
        self.core.state()
    }

    /// Registers `host` with a call budget and access mode.
    pub fn register<T: SharedObject>(
        &self,
        host: &Arc<SharedObjectHost<T>>,
        bounds: Bounds,
        mode: AccessMode,
    ) -> Result<ObjectProxy<T>, OptsvaError> {
        self.core.register(host, bounds, mode)
    }

    /// Registers `host` for at most `n` read-only calls.
    pub fn reads<T: SharedObject>(
        &self,
        host: &Arc<SharedObjectHost<T>>,
        n: u64,
    ) -> Result<ObjectProxy<T>, OptsvaError> {
        self.core.register(host, Bounds::reads(n), AccessMode::ReadOnly)
    }

    /// Registers `host` for at most `n` write-only calls.
    pub fn writes<T: SharedObject>(
        &self,
        host: &Arc<SharedObjectHost<T>>,
        n: u64,
    ) -> Result<ObjectProxy<T>, OptsvaError> {
        self.core.register(host, Bounds::writes(n), AccessMode::WriteOnly)
    }

    /// Registers `host` for mixed access with separate read and write
    /// budgets; the operation budget is their sum.
    pub fn accesses<T: SharedObject>(
        &self,
        host: &Arc<SharedObjectHost<T>>,
        reads: u64,
        writes: u64,
    ) -> Result<ObjectProxy<T>, OptsvaError> {
        let bounds = Bounds::finite(reads + writes, reads, writes)?;
        self.core.register(host, bounds, AccessMode::Any)
    }

    /// Adds a monitor in another process to this transaction's heartbeats.
    pub fn depends_on(&self, endpoint: Arc<dyn MonitorEndpoint>) {
        self.core.add_monitor(endpoint);
    }

    pub fn start(&self) -> Result<(), OptsvaError> {
        self.core.start()
    }

    pub fn commit(&self) -> Result<(), OptsvaError> {
        self.core.commit()
    }

    pub fn rollback(&self) -> Result<(), OptsvaError> {
        self.core.rollback(true)
    }

    /// Rolls back and asks the driving loop to run the body again.
    pub fn retry<R>(&self) -> Result<R, OptsvaError> {
        if self.core.state() == TxnState::Running {
            self.core.rollback(false)?;
        }
        Err(OptsvaError::Retry)
    }

    /// Callback handle for remote proxies.
    pub fn handle(&self) -> Arc<dyn TransactionRef> {
        Arc::clone(&self.core) as Arc<dyn TransactionRef>
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.core.state() == TxnState::Running {
            warn!(txn = %self.core.id, "running transaction dropped; rolling back");
            if let Err(err) = self.core.rollback(false) {
                warn!(txn = %self.core.id, error = %err, "rollback on drop failed");
            }
        }
    }
}
