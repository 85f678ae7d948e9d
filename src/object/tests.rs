use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::*;
use crate::scheduler::TaskScheduler;
use crate::txn::{TransactionRef, TxnId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Register {
    value: i64,
    writes: u32,
}

#[derive(Debug, Clone)]
struct Put(i64);

impl SharedObject for Register {
    type Write = Put;

    fn apply(&mut self, write: &Put) {
        self.value = write.0;
        self.writes += 1;
    }
}

struct Detached;

impl TransactionRef for Detached {
    fn id(&self) -> TxnId {
        TxnId::default()
    }

    fn commit(&self) -> Result<(), OptsvaError> {
        Ok(())
    }

    fn rollback(&self) -> Result<(), OptsvaError> {
        Ok(())
    }
}

fn detached() -> Weak<dyn TransactionRef> {
    Weak::<Detached>::new()
}

fn register(value: i64) -> Arc<SharedObjectHost<Register>> {
    let context = HostContext::new(TaskScheduler::start(), None, Duration::from_millis(10));
    SharedObjectHost::new("register", Register { value, writes: 0 }, context)
}

/// Holds values BSON cannot encode once they pass `i64::MAX`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Wide(u64);

impl SharedObject for Wide {
    type Write = u64;

    fn apply(&mut self, write: &u64) {
        self.0 = *write;
    }
}

fn wide(value: u64) -> Arc<SharedObjectHost<Wide>> {
    let context = HostContext::new(TaskScheduler::start(), None, Duration::from_millis(10));
    SharedObjectHost::new("wide", Wide(value), context)
}

fn proxy<T: SharedObject>(
    host: &Arc<SharedObjectHost<T>>,
    bounds: Bounds,
    mode: AccessMode,
) -> ObjectProxy<T> {
    let proxy = host
        .create_proxy(detached(), TxnId::new(), bounds, mode)
        .unwrap();
    proxy.lock();
    proxy.start_transaction();
    proxy.unlock().unwrap();
    proxy
}

fn eventually(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn bounds_reject_inconsistent_budgets() {
    assert!(Bounds::finite(0, 0, 0).is_err());
    assert!(Bounds::finite(2, 1, 3).is_err());
    assert!(Bounds::new(Bound::Finite(2), Bound::Finite(0), Bound::Unbounded).is_err());
    assert!(Bounds::finite(3, 2, 1).is_ok());
    assert!(Bounds::new(Bound::Unbounded, Bound::Unbounded, Bound::Finite(4)).is_ok());
    // Reads are capped by the operation bound, whatever their own bound says.
    assert!(Bounds::new(Bound::Finite(3), Bound::Unbounded, Bound::Finite(1)).is_ok());
    assert!(Bounds::finite(2, 3, 0).is_ok());
    assert_eq!(Bound::from_raw(-1).unwrap(), Bound::Unbounded);
    assert_eq!(Bound::from_raw(7).unwrap(), Bound::Finite(7));
}

#[test]
fn access_modes_permit_matching_methods() {
    assert!(AccessMode::Any.permits(AccessMode::ReadOnly));
    assert!(AccessMode::Any.permits(AccessMode::WriteOnly));
    assert!(AccessMode::ReadOnly.permits(AccessMode::ReadOnly));
    assert!(!AccessMode::ReadOnly.permits(AccessMode::WriteOnly));
    assert!(!AccessMode::WriteOnly.permits(AccessMode::ReadOnly));
}

#[test]
fn writes_before_reads_are_logged_then_drained() {
    let host = register(1);
    let p = proxy(&host, Bounds::finite(3, 1, 2).unwrap(), AccessMode::Any);

    assert_eq!(p.pre_write().unwrap(), Buffer::Log);
    p.log(Put(5)).unwrap();
    p.post_write().unwrap();
    assert_eq!(host.clone_object().value, 1);

    // The first read replays the log against the live object.
    assert_eq!(p.pre_read().unwrap(), Buffer::Live);
    assert_eq!(host.read_with(|r| r.value), 5);
    p.post_read().unwrap();

    // A write after a read goes to the live object.
    assert_eq!(p.pre_write().unwrap(), Buffer::Live);
    host.write_with(|r| r.apply(&Put(6)));
    p.post_write().unwrap();

    assert!(p.is_released());
    assert_eq!(host.current_version(), 1);
    assert_eq!(host.released_count(), 1);
}

#[test]
fn exhausted_log_is_applied_in_the_background() {
    let host = register(0);
    let first = proxy(&host, Bounds::writes(1), AccessMode::WriteOnly);
    let second = proxy(&host, Bounds::writes(1), AccessMode::WriteOnly);

    // The later ticket exhausts its budget first; its log must wait.
    second.write(Put(2)).unwrap();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(host.clone_object().value, 0);
    assert!(!second.is_released());

    first.write(Put(1)).unwrap();
    eventually(|| second.is_released());
    assert_eq!(host.clone_object(), Register { value: 2, writes: 2 });
    assert_eq!(host.current_version(), 2);
}

#[test]
fn read_only_proxy_serves_a_buffered_copy() {
    let host = register(7);
    let reader = proxy(&host, Bounds::reads(3), AccessMode::ReadOnly);

    assert_eq!(reader.pre_read().unwrap(), Buffer::Copy);
    reader.post_read().unwrap();
    assert!(reader.is_released());
    assert_eq!(reader.read(|r| r.value).unwrap(), 7);

    // The copy is private: later writers do not show through it.
    let writer = proxy(&host, Bounds::writes(1), AccessMode::WriteOnly);
    writer.write(Put(8)).unwrap();
    eventually(|| host.clone_object().value == 8);
    assert_eq!(reader.read(|r| r.value).unwrap(), 7);
    assert!(matches!(
        reader.read(|r| r.value),
        Err(OptsvaError::UpperBoundExceeded(_))
    ));
}

#[test]
fn mode_violations_are_rejected_before_buffering() {
    let host = register(3);
    let reader = proxy(&host, Bounds::reads(1), AccessMode::ReadOnly);
    let err = reader.pre_write().unwrap_err();
    assert!(matches!(
        err,
        OptsvaError::AccessModeViolation {
            declared: AccessMode::ReadOnly,
            method: AccessMode::WriteOnly
        }
    ));
    assert!(reader.write(Put(9)).is_err());

    let writer = proxy(&host, Bounds::writes(1), AccessMode::WriteOnly);
    assert!(matches!(
        writer.read(|r| r.value),
        Err(OptsvaError::AccessModeViolation { .. })
    ));
    assert!(matches!(
        writer.modify(|r| r.value = 0),
        Err(OptsvaError::AccessModeViolation { .. })
    ));
    assert_eq!(host.clone_object().value, 3);
}

#[test]
fn calls_beyond_the_budget_fail() {
    let host = register(0);
    let p = proxy(&host, Bounds::finite(2, 2, 0).unwrap(), AccessMode::Any);
    p.read(|r| r.value).unwrap();
    p.read(|r| r.value).unwrap();
    assert!(matches!(
        p.read(|r| r.value),
        Err(OptsvaError::UpperBoundExceeded(_))
    ));
    assert!(matches!(
        p.write(Put(1)),
        Err(OptsvaError::UpperBoundExceeded(_))
    ));
}

#[test]
fn calls_before_start_are_rejected() {
    let host = register(0);
    let p = host
        .create_proxy(detached(), TxnId::new(), Bounds::unbounded(), AccessMode::Any)
        .unwrap();
    assert!(matches!(
        p.pre_read(),
        Err(OptsvaError::InvalidTransactionState(_))
    ));
    assert!(p.wait_for_snapshot().unwrap());
}

#[test]
fn free_lets_the_next_ticket_in() {
    let host = register(0);
    let first = proxy(&host, Bounds::unbounded(), AccessMode::Any);
    let second = proxy(&host, Bounds::reads(1), AccessMode::ReadOnly);

    first.modify(|r| r.value = 4).unwrap();
    thread::sleep(Duration::from_millis(30));
    assert!(!second.is_released());

    first.free().unwrap();
    eventually(|| second.is_released());
    assert_eq!(second.read(|r| r.value).unwrap(), 4);
    assert!(matches!(
        first.read(|r| r.value),
        Err(OptsvaError::UpperBoundExceeded(_))
    ));
}

#[test]
fn finishing_twice_opens_the_checkpoint_once() {
    let host = register(0);
    let p = proxy(&host, Bounds::writes(1), AccessMode::WriteOnly);
    p.write(Put(1)).unwrap();
    assert!(p.wait_for_snapshot().unwrap());
    p.finish_transaction(false).unwrap();
    p.finish_transaction(false).unwrap();
    p.finish_transaction(true).unwrap();
    assert_eq!(host.checkpoint_count(), 1);
    assert_eq!(host.clone_object().value, 1);
    assert!(p.is_finished());
}

#[test]
fn successor_that_read_discarded_state_is_invalidated() {
    let host = register(0);
    let first = proxy(&host, Bounds::finite(2, 1, 1).unwrap(), AccessMode::Any);
    let second = proxy(&host, Bounds::finite(2, 2, 0).unwrap(), AccessMode::Any);

    first.read(|r| r.value).unwrap();
    first.write(Put(10)).unwrap();
    assert!(first.is_released());

    assert_eq!(second.read(|r| r.value).unwrap(), 10);

    assert!(first.wait_for_snapshot().unwrap());
    first.finish_transaction(true).unwrap();
    assert_eq!(host.clone_object().value, 0);

    // The live isolation check catches the restore on the next call.
    assert!(matches!(
        second.read(|r| r.value),
        Err(OptsvaError::ForcedRollback(_))
    ));
    assert!(!second.wait_for_snapshot().unwrap());
    second.finish_transaction(true).unwrap();
    assert_eq!(host.checkpoint_count(), 2);
    assert_eq!(host.clone_object().value, 0);
}

#[test]
fn reader_that_never_wrote_does_not_restore() {
    let host = register(0);
    let reader = proxy(&host, Bounds::finite(1, 1, 0).unwrap(), AccessMode::Any);
    let writer = proxy(&host, Bounds::writes(1), AccessMode::WriteOnly);

    reader.read(|r| r.value).unwrap();
    writer.write(Put(3)).unwrap();
    eventually(|| writer.is_released());

    assert!(reader.wait_for_snapshot().unwrap());
    reader.finish_transaction(true).unwrap();
    assert_eq!(host.clone_object().value, 3);
}

#[test]
fn unbounded_reads_are_capped_by_the_operation_bound() {
    let host = register(2);
    let bounds = Bounds::new(Bound::Finite(2), Bound::Unbounded, Bound::Finite(1)).unwrap();
    let p = proxy(&host, bounds, AccessMode::Any);
    assert_eq!(p.read(|r| r.value).unwrap(), 2);
    assert_eq!(p.read(|r| r.value).unwrap(), 2);
    assert!(p.is_released());
    assert!(matches!(
        p.read(|r| r.value),
        Err(OptsvaError::UpperBoundExceeded(_))
    ));
}

#[test]
fn failed_snapshot_still_opens_the_release_gate() {
    let host = wide(u64::MAX);
    let first = proxy(&host, Bounds::finite(2, 1, 1).unwrap(), AccessMode::Any);
    let second = proxy(&host, Bounds::finite(1, 1, 0).unwrap(), AccessMode::Any);

    assert!(matches!(first.read(|w| w.0), Err(OptsvaError::Bson(_))));
    assert!(first.wait_for_snapshot().is_err());
    first.finish_transaction(true).unwrap();
    assert_eq!(host.released_count(), 1);
    assert_eq!(host.checkpoint_count(), 1);
    assert_eq!(host.current_version(), 0);
    assert_eq!(host.lock_holder(), None);

    // Ticket 2 gets its turn instead of waiting on ticket 1 forever.
    host.write_with(|w| w.0 = 5);
    assert_eq!(second.read(|w| w.0).unwrap(), 5);
    assert!(second.wait_for_snapshot().unwrap());
}

#[test]
fn failed_background_replay_reaches_the_caller() {
    let host = wide(u64::MAX);
    let writer = proxy(&host, Bounds::writes(1), AccessMode::WriteOnly);

    writer.write(1).unwrap();
    assert!(matches!(
        writer.wait_for_snapshot(),
        Err(OptsvaError::SchedulerFailed(_))
    ));
    assert!(host.context().scheduler().failure().is_some());

    writer.finish_transaction(true).unwrap();
    assert_eq!(host.released_count(), 1);
    assert_eq!(host.checkpoint_count(), 1);
    assert_eq!(host.clone_object(), Wide(u64::MAX));
}

#[test]
fn write_after_release_without_a_copy_is_rejected() {
    let host = register(0);
    let p = proxy(&host, Bounds::finite(3, 0, 3).unwrap(), AccessMode::WriteOnly);

    p.write(Put(1)).unwrap();
    assert!(!p.is_released());
    assert!(p.wait_for_snapshot().unwrap());
    assert!(p.is_released());

    assert!(matches!(p.write(Put(2)), Err(OptsvaError::Protocol(_))));
    assert_eq!(host.clone_object().value, 1);
}
