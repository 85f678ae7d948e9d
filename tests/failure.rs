mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{account, eventually, runtime, Account, AccountOp};
use optsva::{
    AccessMode, Bounds, Buffer, FailureMonitor, HostContext, SharedObjectHost, TaskScheduler,
    Transaction, TxnState,
};

fn monitored(monitor: &Arc<FailureMonitor>, balance: i64) -> Arc<SharedObjectHost<Account>> {
    let context = HostContext::new(
        TaskScheduler::start(),
        Some(Arc::clone(monitor)),
        Duration::from_millis(10),
    );
    SharedObjectHost::new("x", account(balance), context)
}

#[test]
fn crashed_holder_is_rolled_back_and_successor_proceeds() {
    let rt = runtime();
    let x = rt.host("x", account(100));

    let crashed = rt.transaction();
    let cx = crashed
        .register(&x, Bounds::unbounded(), AccessMode::Any)
        .unwrap();
    crashed.start().unwrap();
    cx.modify(|acc| acc.balance = -1).unwrap();
    assert!(!cx.is_released());

    // Simulate a client that vanished: no heartbeats, no rollback on drop.
    let crashed_id = crashed.id();
    rt.heartbeat().forget(crashed_id);
    std::mem::forget(crashed);
    drop(cx);

    // The recovery releases the object before restoring it, so a successor
    // that slips in between reads the dirty value and is aborted in turn.
    let mut seen = None;
    for _ in 0..5 {
        let next = rt.transaction();
        let nx = next.accesses(&x, 1, 1).unwrap();
        next.start().unwrap();
        let attempt = nx
            .read(|acc| acc.balance)
            .and_then(|balance| nx.write(AccountOp::Deposit(5)).map(|()| balance))
            .and_then(|balance| next.commit().map(|()| balance));
        match attempt {
            Ok(balance) => {
                seen = Some(balance);
                break;
            }
            Err(err) => assert!(err.is_forced_rollback(), "unexpected error: {err}"),
        }
    }

    assert_eq!(seen, Some(100));
    assert_eq!(x.clone_object().balance, 105);
    assert!(!rt.monitor().is_tracked(crashed_id));
    rt.monitor().join_recoveries();
    assert!(rt.monitor().recovered() >= 1);
}

#[test]
fn crash_before_first_call_does_not_stall_successors() {
    let rt = runtime();
    let x = rt.host("x", account(1));

    let crashed = rt.transaction();
    crashed.writes(&x, 1).unwrap();
    crashed.start().unwrap();
    rt.heartbeat().forget(crashed.id());
    std::mem::forget(crashed);

    let next = rt.transaction();
    let nx = next.reads(&x, 1).unwrap();
    next.start().unwrap();
    assert_eq!(nx.read(|acc| acc.balance).unwrap(), 1);
    next.commit().unwrap();
    assert_eq!(next.state(), TxnState::Committed);
}

#[test]
fn live_transactions_survive_many_sweeps() {
    let rt = runtime();
    let x = rt.host("x", account(0));

    let tx = rt.transaction();
    let px = tx.accesses(&x, 1, 1).unwrap();
    tx.start().unwrap();
    px.read(|acc| acc.balance).unwrap();

    std::thread::sleep(Duration::from_millis(450));
    assert!(rt.monitor().is_tracked(tx.id()));
    assert!(rt.monitor().heartbeats_received() > 0);

    px.write(AccountOp::Set(3)).unwrap();
    tx.commit().unwrap();
    assert_eq!(x.clone_object().balance, 3);
    eventually("monitor to forget the transaction", || !rt.monitor().is_tracked(tx.id()));
}

#[test]
fn manual_sweeps_need_two_silent_rounds() {
    let monitor = FailureMonitor::manual();
    let x = monitored(&monitor, 7);

    let tx = Transaction::new(None);
    let px = tx.accesses(&x, 1, 1).unwrap();
    tx.start().unwrap();
    px.read(|acc| acc.balance).unwrap();
    assert_eq!(monitor.tracked(), 1);

    assert!(monitor.sweep().is_empty());
    monitor.heartbeat(tx.id());
    assert!(monitor.sweep().is_empty());
    assert_eq!(monitor.sweep(), vec![tx.id()]);
    monitor.join_recoveries();
    assert_eq!(monitor.recovered(), 1);
    assert_eq!(x.checkpoint_count(), 1);

    let err = tx.commit().unwrap_err();
    assert!(err.is_forced_rollback());
    assert_eq!(tx.state(), TxnState::Aborted);
    assert_eq!(x.clone_object().balance, 7);
}

#[test]
fn crash_inside_a_write_call_does_not_block_the_predecessor() {
    let monitor = FailureMonitor::manual();
    let x = monitored(&monitor, 3);

    let first = Transaction::new(None);
    let fx = first
        .register(&x, Bounds::unbounded(), AccessMode::Any)
        .unwrap();
    first.start().unwrap();
    fx.modify(|acc| acc.balance += 1).unwrap();

    // The log path takes the host lock without waiting for ticket 1, and
    // this transaction dies before `post_write` gives it back.
    let dead = Transaction::new(None);
    let dx = dead.accesses(&x, 1, 1).unwrap();
    dead.start().unwrap();
    assert_eq!(dx.pre_write().unwrap(), Buffer::Log);
    let dead_id = dead.id();
    std::mem::forget(dead);
    assert_eq!(x.lock_holder(), Some(dead_id));

    let committed = AtomicBool::new(false);
    thread::scope(|s| {
        let commit = s.spawn(|| {
            let result = first.commit();
            committed.store(true, Ordering::SeqCst);
            result
        });
        thread::sleep(Duration::from_millis(50));
        assert!(!committed.load(Ordering::SeqCst));

        assert!(monitor.sweep().is_empty());
        monitor.heartbeat(first.id());
        assert_eq!(monitor.sweep(), vec![dead_id]);
        commit.join().unwrap().unwrap();
    });

    monitor.join_recoveries();
    assert_eq!(monitor.recovered(), 1);
    assert_eq!(x.lock_holder(), None);
    assert_eq!(x.checkpoint_count(), 2);
    assert_eq!(x.clone_object().balance, 4);
}
