use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use super::host::SharedObjectHost;
use super::snapshot::SnapshotImage;
use super::{AccessMode, Bounds, Buffer, ObjectKey, SharedObject, Ticket, NO_TICKET};
use crate::failure::MonitorEndpoint;
use crate::scheduler::Task;
use crate::txn::{Participant, TransactionRef, TxnId};
use crate::OptsvaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Background {
    ApplyLog,
    BufferReadOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

struct ProxyState<T: SharedObject> {
    ticket: Ticket,
    op_count: u64,
    read_count: u64,
    write_count: u64,
    log: Option<Vec<T::Write>>,
    copy: Option<T>,
    /// Present once the proxy was granted access to the live object.
    snapshot: Option<SnapshotImage>,
    /// Host restoration count observed when access was granted.
    epoch: u64,
    released: bool,
    /// Set when a predecessor's rollback overwrote the state this proxy read.
    invalidated: bool,
    locked: bool,
    wrote: bool,
    pending: Option<Background>,
    fault: Option<String>,
    freed: bool,
    finished: bool,
    verdict: Option<bool>,
}

impl<T: SharedObject> ProxyState<T> {
    fn new(ticket: Ticket) -> Self {
        Self {
            ticket,
            op_count: 0,
            read_count: 0,
            write_count: 0,
            log: None,
            copy: None,
            snapshot: None,
            epoch: 0,
            released: false,
            invalidated: false,
            locked: false,
            wrote: false,
            pending: None,
            fault: None,
            freed: false,
            finished: false,
            verdict: None,
        }
    }
}

struct ProxyInner<T: SharedObject> {
    host: Arc<SharedObjectHost<T>>,
    tx_ref: Weak<dyn TransactionRef>,
    txn_id: TxnId,
    bounds: Bounds,
    mode: AccessMode,
    /// Tickets are assigned at commit; logged writes wait for `update`.
    deferred_start: bool,
    state: Mutex<ProxyState<T>>,
    /// Notified whenever a background task finishes or the proxy finalizes.
    changed: Condvar,
}

/// One transaction's view of a shared object.
///
/// Every application call is bracketed by a `pre_*` call, which answers
/// where the call must run, and the matching `post_*` call, which does the
/// bookkeeping and may release the object early. [`ObjectProxy::read`],
/// [`ObjectProxy::write`] and [`ObjectProxy::modify`] do the bracketing and
/// the dispatch in one step.
pub struct ObjectProxy<T: SharedObject> {
    inner: Arc<ProxyInner<T>>,
}

impl<T: SharedObject> Clone for ObjectProxy<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: SharedObject> fmt::Debug for ObjectProxy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.lock();
        f.debug_struct("ObjectProxy")
            .field("object", self.inner.host.key())
            .field("txn", &self.inner.txn_id)
            .field("mode", &self.inner.mode)
            .field("ticket", &st.ticket)
            .field("ops", &st.op_count)
            .field("released", &st.released)
            .field("finished", &st.finished)
            .finish()
    }
}

impl<T: SharedObject> ObjectProxy<T> {
    pub(crate) fn new(
        host: Arc<SharedObjectHost<T>>,
        tx_ref: Weak<dyn TransactionRef>,
        txn_id: TxnId,
        bounds: Bounds,
        mode: AccessMode,
        deferred_start: bool,
    ) -> Self {
        Self {
            inner: Arc::new(ProxyInner {
                host,
                tx_ref,
                txn_id,
                bounds,
                mode,
                deferred_start,
                state: Mutex::new(ProxyState::new(NO_TICKET)),
                changed: Condvar::new(),
            }),
        }
    }

    pub fn key(&self) -> &ObjectKey {
        self.inner.host.key()
    }

    pub fn host(&self) -> &Arc<SharedObjectHost<T>> {
        &self.inner.host
    }

    pub fn txn_id(&self) -> TxnId {
        self.inner.txn_id
    }

    pub fn mode(&self) -> AccessMode {
        self.inner.mode
    }

    pub fn bounds(&self) -> Bounds {
        self.inner.bounds
    }

    pub fn ticket(&self) -> Ticket {
        self.inner.state.lock().ticket
    }

    pub fn is_released(&self) -> bool {
        self.inner.state.lock().released
    }

    pub fn is_finished(&self) -> bool {
        self.inner.state.lock().finished
    }

    pub fn lock(&self) {
        self.inner.host.acquire(self.inner.txn_id);
    }

    /// Releases the host lock taken by [`ObjectProxy::lock`]. A read-only
    /// proxy that holds a ticket starts buffering its copy in the background.
    pub fn unlock(&self) -> Result<(), OptsvaError> {
        self.inner.host.release(self.inner.txn_id);
        if self.inner.mode != AccessMode::ReadOnly {
            return Ok(());
        }
        let ticket = {
            let mut st = self.inner.state.lock();
            if st.ticket == NO_TICKET || st.released || st.finished || st.pending.is_some() {
                return Ok(());
            }
            st.pending = Some(Background::BufferReadOnly);
            st.ticket
        };
        let host = Arc::clone(&self.inner.host);
        let proxy = self.clone();
        self.submit(Task::new(
            "buffer-read-only",
            move || host.try_ticket_ready(ticket.saturating_sub(1)),
            move || proxy.buffer_read_only(),
        ))
    }

    /// Takes this object's next ticket and resets the call counters.
    pub fn start_transaction(&self) -> Ticket {
        let ticket = self.inner.host.start_transaction();
        let mut st = self.inner.state.lock();
        if self.inner.deferred_start {
            // Writes were logged before the ticket existed; keep them.
            st.ticket = ticket;
        } else {
            *st = ProxyState::new(ticket);
        }
        drop(st);
        // Tracked from the moment a ticket exists: a holder that dies before
        // touching the object would otherwise stall every later ticket.
        if let Some(monitor) = self.inner.host.context().monitor() {
            monitor.register(self.inner.txn_id, Arc::new(self.clone()));
        }
        trace!(object = %self.key(), txn = %self.inner.txn_id, ticket, "ticket issued");
        ticket
    }

    pub fn pre_read(&self) -> Result<Buffer, OptsvaError> {
        self.check_mode(AccessMode::ReadOnly)?;
        let mut st = self.inner.state.lock();
        self.wait_idle(&mut st)?;
        self.check_budget(&st, Access::Read)?;
        self.check_started(&st)?;

        if self.inner.mode == AccessMode::ReadOnly || st.released {
            return match st.copy {
                Some(_) => Ok(Buffer::Copy),
                None => Err(OptsvaError::Protocol(format!(
                    "no private copy of {} for ticket {}",
                    self.key(),
                    st.ticket
                ))),
            };
        }

        if st.snapshot.is_none() {
            self.await_turn(st.ticket)?;
            self.inner.host.acquire(self.inner.txn_id);
            st.locked = true;
            if let Err(err) = self.ensure_snapshot(&mut st) {
                self.unlock_host(&mut st);
                return Err(err);
            }
            self.drain_log(&mut st);
        } else {
            self.inner.host.acquire(self.inner.txn_id);
            st.locked = true;
            if let Err(err) = self.check_isolation(&st) {
                self.inner.host.force_release(self.inner.txn_id);
                st.locked = false;
                return Err(err);
            }
        }
        Ok(Buffer::Live)
    }

    pub fn post_read(&self) -> Result<(), OptsvaError> {
        let mut st = self.inner.state.lock();
        st.read_count += 1;
        st.op_count += 1;
        if self.inner.mode != AccessMode::ReadOnly
            && self.inner.bounds.ops.reached(st.op_count)
            && !st.released
            && st.snapshot.is_some()
        {
            self.release_host(&mut st);
        }
        self.unlock_host(&mut st);
        Ok(())
    }

    pub fn pre_write(&self) -> Result<Buffer, OptsvaError> {
        self.check_mode(AccessMode::WriteOnly)?;
        let mut st = self.inner.state.lock();
        self.wait_idle(&mut st)?;
        self.check_budget(&st, Access::Write)?;
        if !self.inner.deferred_start {
            self.check_started(&st)?;
        }

        if st.released {
            return Ok(Buffer::Copy);
        }
        self.inner.host.acquire(self.inner.txn_id);
        st.locked = true;

        if st.op_count == 0 || st.read_count == 0 {
            st.log.get_or_insert_with(Vec::new);
            return Ok(Buffer::Log);
        }
        if let Err(err) = self.check_isolation(&st) {
            self.inner.host.force_release(self.inner.txn_id);
            st.locked = false;
            return Err(err);
        }
        st.wrote = true;
        Ok(Buffer::Live)
    }

    pub fn post_write(&self) -> Result<(), OptsvaError> {
        let mut st = self.inner.state.lock();
        st.write_count += 1;
        st.op_count += 1;

        let bounds = self.inner.bounds;
        let exhausted = bounds.writes.reached(st.write_count) || bounds.ops.reached(st.op_count);
        let mut hand_off = false;
        if exhausted && !st.released && st.pending.is_none() {
            if st.snapshot.is_some() {
                if bounds.reads_remain(st.op_count, st.read_count) {
                    st.copy = Some(self.inner.host.clone_object());
                }
                self.release_host(&mut st);
            } else if !self.inner.deferred_start {
                st.pending = Some(Background::ApplyLog);
                hand_off = true;
            }
        }
        self.unlock_host(&mut st);
        let ticket = st.ticket;
        drop(st);

        // Scheduled only after the host lock is gone so the background
        // action never overlaps with this thread's reentrant hold.
        if hand_off {
            self.schedule_apply_log(ticket)?;
        }
        Ok(())
    }

    /// Records a write for later replay. Only valid after `pre_write`
    /// answered [`Buffer::Log`].
    pub fn log(&self, write: T::Write) -> Result<(), OptsvaError> {
        let mut st = self.inner.state.lock();
        match st.log.as_mut() {
            Some(log) => {
                log.push(write);
                Ok(())
            }
            None => Err(OptsvaError::Protocol(format!(
                "no write log open on {}",
                self.key()
            ))),
        }
    }

    /// Runs a read-only call through the proxy.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> Result<R, OptsvaError> {
        let out = match self.guard(self.pre_read())? {
            Buffer::Live => self.inner.host.read_with(f),
            Buffer::Copy => {
                let st = self.inner.state.lock();
                let Some(copy) = st.copy.as_ref() else {
                    return Err(OptsvaError::Protocol(format!(
                        "private copy of {} vanished",
                        self.key()
                    )));
                };
                f(copy)
            }
            Buffer::Log => {
                return Err(OptsvaError::Protocol("reads cannot be logged".into()));
            }
        };
        self.guard(self.post_read())?;
        Ok(out)
    }

    /// Runs a write-only call through the proxy.
    pub fn write(&self, write: T::Write) -> Result<(), OptsvaError> {
        match self.guard(self.pre_write())? {
            Buffer::Log => self.log(write)?,
            Buffer::Live => self.inner.host.write_with(|object| object.apply(&write)),
            Buffer::Copy => {
                let mut st = self.inner.state.lock();
                let Some(copy) = st.copy.as_mut() else {
                    return Err(OptsvaError::Protocol(format!(
                        "no private copy of {} to write to",
                        self.key()
                    )));
                };
                copy.apply(&write);
            }
        }
        self.guard(self.post_write())
    }

    /// Runs a read-write call through the proxy. It counts as one read and
    /// one write, and always runs against the live object.
    pub fn modify<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R, OptsvaError> {
        self.check_mode(AccessMode::Any)?;
        self.check_budget(&self.inner.state.lock(), Access::Write)?;
        let out = match self.guard(self.pre_read())? {
            Buffer::Live => self.inner.host.write_with(f),
            _ => {
                return Err(OptsvaError::Protocol(format!(
                    "read-write call on released object {}",
                    self.key()
                )));
            }
        };

        let mut st = self.inner.state.lock();
        st.read_count += 1;
        st.write_count += 1;
        st.op_count += 1;
        st.wrote = true;
        let bounds = self.inner.bounds;
        if (bounds.writes.reached(st.write_count) || bounds.ops.reached(st.op_count))
            && !st.released
        {
            if bounds.reads_remain(st.op_count, st.read_count) {
                st.copy = Some(self.inner.host.clone_object());
            }
            self.release_host(&mut st);
        }
        self.unlock_host(&mut st);
        Ok(out)
    }

    /// Declares the object no longer needed: pending writes are applied and
    /// the object is released for later tickets.
    pub fn free(&self) -> Result<(), OptsvaError> {
        let mut st = self.inner.state.lock();
        self.wait_idle(&mut st)?;
        if st.freed || st.finished {
            return Ok(());
        }
        self.check_started(&st)?;
        if !st.released {
            if st.snapshot.is_none() {
                self.await_turn(st.ticket)?;
            }
            self.take_turn_and_release(&mut st, false)?;
        }
        self.unlock_host(&mut st);
        st.copy = None;
        st.freed = true;
        debug!(object = %self.key(), txn = %self.inner.txn_id, ticket = st.ticket, "freed object");
        Ok(())
    }

    /// Commit-time hook of write-only transactions: replays the log in the
    /// background once the ticket comes up.
    pub fn update(&self) -> Result<(), OptsvaError> {
        let ticket = {
            let mut st = self.inner.state.lock();
            self.check_started(&st)?;
            if st.released || st.finished || st.pending.is_some() {
                return Ok(());
            }
            st.log.get_or_insert_with(Vec::new);
            st.pending = Some(Background::ApplyLog);
            st.ticket
        };
        self.schedule_apply_log(ticket)
    }

    /// Makes sure the object is released, waits for every earlier ticket to
    /// finish and reports whether the state this proxy read survived.
    pub fn wait_for_snapshot(&self) -> Result<bool, OptsvaError> {
        let mut st = self.inner.state.lock();
        self.wait_idle(&mut st)?;
        if st.finished {
            return Ok(st.verdict.unwrap_or(false));
        }
        if st.ticket == NO_TICKET {
            return Ok(true);
        }
        if !st.released {
            if st.snapshot.is_none() {
                self.await_turn(st.ticket)?;
            }
            self.take_turn_and_release(&mut st, false)?;
        }
        let ticket = st.ticket;
        drop(st);

        self.await_predecessor_checkpoint(ticket)?;

        // Re-checked under the state lock: an early commit may have raced us,
        // and later tickets cannot restore until this one finalizes.
        let st = self.inner.state.lock();
        if st.finished {
            return Ok(st.verdict.unwrap_or(false));
        }
        Ok(self.still_valid(&st))
    }

    /// Finalizes this transaction on the object. Idempotent: the checkpoint
    /// gate opens once no matter how many times this runs.
    pub fn finish_transaction(&self, restore: bool) -> Result<(), OptsvaError> {
        {
            let mut st = self.inner.state.lock();
            if let Err(err) = self.wait_idle(&mut st) {
                warn!(object = %self.key(), txn = %self.inner.txn_id, error = %err, "finishing with background work outstanding");
            }
        }
        self.finalize(restore)
    }

    /// Releases the host lock a failed transaction may have died holding,
    /// e.g. between `pre_write` and `post_write`. The proxy state is left
    /// alone: its owner is gone, and the lock must not wait on it.
    pub fn abandon(&self) {
        if self.inner.host.force_release(self.inner.txn_id) {
            warn!(object = %self.key(), txn = %self.inner.txn_id, "dropped host lock of failed transaction");
        }
    }

    fn finalize(&self, restore: bool) -> Result<(), OptsvaError> {
        let host = &self.inner.host;
        let txn = self.inner.txn_id;
        let (ticket, snapshot, wrote, unreleased) = {
            let mut st = self.inner.state.lock();
            if st.finished {
                return Ok(());
            }
            st.finished = true;
            st.verdict = Some(!restore);
            if st.locked {
                host.force_release(txn);
                st.locked = false;
            }
            let unreleased = !st.released && st.ticket != NO_TICKET;
            st.released = true;
            (st.ticket, st.snapshot.take(), st.wrote, unreleased)
        };
        self.inner.changed.notify_all();

        if ticket == NO_TICKET {
            return Ok(());
        }
        if unreleased {
            // Never got its turn to completion, e.g. the snapshot failed.
            // Later tickets still need the gate; the version stays put.
            warn!(object = %host.key(), txn = %txn, ticket, "finishing without a release");
            host.signal_released();
        }
        if let Some(monitor) = host.context().monitor() {
            monitor.unregister(txn, host.key());
        }
        debug!(object = %host.key(), txn = %txn, ticket, restore, "finishing transaction");
        // A proxy that never touched the object has nothing to undo, and
        // restoring its image would wipe out later tickets' work.
        host.finish_transaction(txn, snapshot.as_ref(), restore && wrote)
    }

    fn buffer_read_only(&self) -> Result<(), OptsvaError> {
        let host = &self.inner.host;
        let mut st = self.inner.state.lock();
        host.acquire(self.inner.txn_id);
        let result = self.ensure_snapshot(&mut st);
        if result.is_ok() {
            st.copy = Some(host.clone_object());
            self.release_host(&mut st);
        }
        host.release(self.inner.txn_id);
        self.settle(&mut st, &result);
        let ticket = st.ticket;
        drop(st);
        result?;

        let host = Arc::clone(&self.inner.host);
        let proxy = self.clone();
        let task = Task::new(
            "commit-read-only-early",
            move || host.try_checkpoint(ticket.saturating_sub(1)),
            move || proxy.commit_read_only_early(),
        );
        if let Err(err) = self.inner.host.context().scheduler.submit(task) {
            warn!(object = %self.key(), txn = %self.inner.txn_id, error = %err, "early commit not scheduled");
        }
        Ok(())
    }

    fn commit_read_only_early(&self) -> Result<(), OptsvaError> {
        let valid = {
            let st = self.inner.state.lock();
            if st.finished {
                return Ok(());
            }
            self.still_valid(&st)
        };
        if !valid {
            warn!(object = %self.key(), txn = %self.inner.txn_id, "read-only copy invalidated before early commit");
        }
        self.finalize(!valid)
    }

    fn apply_log_in_background(&self) -> Result<(), OptsvaError> {
        let mut st = self.inner.state.lock();
        let result = self.take_turn_and_release(&mut st, true);
        self.settle(&mut st, &result);
        result
    }

    fn schedule_apply_log(&self, ticket: Ticket) -> Result<(), OptsvaError> {
        let host = Arc::clone(&self.inner.host);
        let proxy = self.clone();
        self.submit(Task::new(
            "apply-log-buffer",
            move || host.try_ticket_ready(ticket.saturating_sub(1)),
            move || proxy.apply_log_in_background(),
        ))
    }

    fn submit(&self, task: Task) -> Result<(), OptsvaError> {
        if let Err(err) = self.inner.host.context().scheduler.submit(task) {
            let mut st = self.inner.state.lock();
            st.pending = None;
            st.fault = Some(err.to_string());
            self.inner.changed.notify_all();
            return Err(err);
        }
        Ok(())
    }

    /// Clears the pending marker after a background action and wakes waiters.
    fn settle(&self, st: &mut ProxyState<T>, result: &Result<(), OptsvaError>) {
        st.pending = None;
        if let Err(err) = result {
            st.fault = Some(err.to_string());
        }
        self.inner.changed.notify_all();
    }

    /// Takes the object at this proxy's turn, replays the log and releases.
    /// The caller made sure every earlier ticket released already.
    fn take_turn_and_release(
        &self,
        st: &mut ProxyState<T>,
        keep_copy: bool,
    ) -> Result<(), OptsvaError> {
        let host = &self.inner.host;
        host.acquire(self.inner.txn_id);
        let result = self.ensure_snapshot(st);
        if result.is_ok() {
            self.drain_log(st);
            if keep_copy && self.inner.bounds.reads_remain(st.op_count, st.read_count) {
                st.copy = Some(host.clone_object());
            }
            self.release_host(st);
        }
        host.release(self.inner.txn_id);
        result
    }

    fn ensure_snapshot(&self, st: &mut ProxyState<T>) -> Result<(), OptsvaError> {
        if st.snapshot.is_some() {
            return Ok(());
        }
        let host = &self.inner.host;
        let image = host.take_snapshot()?;
        trace!(object = %host.key(), txn = %self.inner.txn_id, ticket = st.ticket, version = image.version(), "access granted");
        st.epoch = host.restorations();
        st.snapshot = Some(image);
        Ok(())
    }

    fn drain_log(&self, st: &mut ProxyState<T>) {
        if let Some(log) = st.log.take() {
            if !log.is_empty() {
                self.inner.host.apply_log(&log);
                st.wrote = true;
            }
        }
    }

    /// Lets the next ticket in. Must hold the host lock.
    fn release_host(&self, st: &mut ProxyState<T>) {
        let host = &self.inner.host;
        if self.isolation_intact(st) {
            host.advance_version(st.ticket);
        } else {
            st.invalidated = true;
        }
        st.released = true;
        host.signal_released();
        debug!(object = %host.key(), txn = %self.inner.txn_id, ticket = st.ticket, "released object");
    }

    fn unlock_host(&self, st: &mut ProxyState<T>) {
        if st.locked {
            self.inner.host.release(self.inner.txn_id);
            st.locked = false;
        }
    }

    fn isolation_intact(&self, st: &ProxyState<T>) -> bool {
        let host = &self.inner.host;
        match &st.snapshot {
            Some(image) => {
                image.version() == host.current_version() && st.epoch == host.restorations()
            }
            None => true,
        }
    }

    fn check_isolation(&self, st: &ProxyState<T>) -> Result<(), OptsvaError> {
        if self.isolation_intact(st) {
            return Ok(());
        }
        Err(OptsvaError::ForcedRollback(format!(
            "{} was restored under ticket {} by an aborted predecessor",
            self.key(),
            st.ticket
        )))
    }

    fn still_valid(&self, st: &ProxyState<T>) -> bool {
        if st.invalidated {
            return false;
        }
        let host = &self.inner.host;
        match &st.snapshot {
            Some(image) => {
                image.version() <= host.current_version() && st.epoch == host.restorations()
            }
            None => true,
        }
    }

    fn check_mode(&self, method: AccessMode) -> Result<(), OptsvaError> {
        if self.inner.mode.permits(method) {
            Ok(())
        } else {
            Err(OptsvaError::AccessModeViolation {
                declared: self.inner.mode,
                method,
            })
        }
    }

    fn check_started(&self, st: &ProxyState<T>) -> Result<(), OptsvaError> {
        if st.ticket == NO_TICKET {
            return Err(OptsvaError::InvalidTransactionState(format!(
                "{} accessed before its transaction started",
                self.key()
            )));
        }
        Ok(())
    }

    fn check_budget(&self, st: &ProxyState<T>, access: Access) -> Result<(), OptsvaError> {
        let key = self.key();
        if st.freed {
            return Err(OptsvaError::UpperBoundExceeded(format!("{key} was freed")));
        }
        // Read-only proxies keep serving their copy after an early commit.
        if st.finished && self.inner.mode != AccessMode::ReadOnly {
            return Err(if st.verdict == Some(false) {
                OptsvaError::ForcedRollback(format!("{key} was rolled back"))
            } else {
                OptsvaError::InvalidTransactionState(format!("{key} already finished"))
            });
        }
        let bounds = self.inner.bounds;
        if bounds.ops.reached(st.op_count) {
            return Err(OptsvaError::UpperBoundExceeded(format!(
                "operation bound {} of {key} reached",
                bounds.ops
            )));
        }
        let (bound, count, what) = match access {
            Access::Read => (bounds.reads, st.read_count, "read"),
            Access::Write => (bounds.writes, st.write_count, "write"),
        };
        if bound.reached(count) {
            return Err(OptsvaError::UpperBoundExceeded(format!(
                "{what} bound {bound} of {key} reached"
            )));
        }
        Ok(())
    }

    /// Blocks until no background task is pending for this proxy.
    fn wait_idle(&self, st: &mut MutexGuard<'_, ProxyState<T>>) -> Result<(), OptsvaError> {
        let context = self.inner.host.context();
        loop {
            if let Some(fault) = &st.fault {
                return Err(OptsvaError::SchedulerFailed(fault.clone()));
            }
            if st.pending.is_none() {
                return Ok(());
            }
            context.scheduler.health()?;
            self.inner.changed.wait_for(st, context.wait_poll);
        }
    }

    fn await_turn(&self, ticket: Ticket) -> Result<(), OptsvaError> {
        let host = &self.inner.host;
        let ready = ticket.saturating_sub(1);
        while !host.await_ticket_ready_timeout(ready, host.context().wait_poll) {
            host.context().scheduler.health()?;
        }
        Ok(())
    }

    fn await_predecessor_checkpoint(&self, ticket: Ticket) -> Result<(), OptsvaError> {
        let host = &self.inner.host;
        let ready = ticket.saturating_sub(1);
        while !host.await_checkpoint_timeout(ready, host.context().wait_poll) {
            host.context().scheduler.health()?;
        }
        Ok(())
    }

    /// Rolls the owning transaction back when a call fails because of a
    /// predecessor's rollback.
    fn guard<V>(&self, result: Result<V, OptsvaError>) -> Result<V, OptsvaError> {
        if let Err(err) = &result {
            if err.is_forced_rollback() {
                if let Some(tx) = self.inner.tx_ref.upgrade() {
                    if let Err(rollback_err) = tx.rollback() {
                        warn!(txn = %self.inner.txn_id, error = %rollback_err, "forced rollback failed");
                    }
                }
            }
        }
        result
    }
}

impl<T: SharedObject> Participant for ObjectProxy<T> {
    fn key(&self) -> &ObjectKey {
        ObjectProxy::key(self)
    }

    fn mode(&self) -> AccessMode {
        self.inner.mode
    }

    fn ticket(&self) -> Ticket {
        ObjectProxy::ticket(self)
    }

    fn lock(&self) {
        ObjectProxy::lock(self)
    }

    fn unlock(&self) -> Result<(), OptsvaError> {
        ObjectProxy::unlock(self)
    }

    fn start_transaction(&self) -> Ticket {
        ObjectProxy::start_transaction(self)
    }

    fn update(&self) -> Result<(), OptsvaError> {
        ObjectProxy::update(self)
    }

    fn wait_for_snapshot(&self) -> Result<bool, OptsvaError> {
        ObjectProxy::wait_for_snapshot(self)
    }

    fn finish_transaction(&self, restore: bool) -> Result<(), OptsvaError> {
        ObjectProxy::finish_transaction(self, restore)
    }

    fn abandon(&self) {
        ObjectProxy::abandon(self)
    }

    fn monitor_endpoint(&self) -> Option<Arc<dyn MonitorEndpoint>> {
        self.inner
            .host
            .context()
            .monitor()
            .map(|monitor| Arc::clone(monitor) as Arc<dyn MonitorEndpoint>)
    }
}
