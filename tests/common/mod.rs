#![allow(dead_code)]

use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use optsva::{OptsvaConfig, Runtime, SharedObject};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub balance: i64,
}

#[derive(Debug, Clone)]
pub enum AccountOp {
    Deposit(i64),
    Withdraw(i64),
    Set(i64),
}

impl SharedObject for Account {
    type Write = AccountOp;

    fn apply(&mut self, write: &AccountOp) {
        match write {
            AccountOp::Deposit(n) => self.balance += n,
            AccountOp::Withdraw(n) => self.balance -= n,
            AccountOp::Set(n) => self.balance = *n,
        }
    }
}

pub fn account(balance: i64) -> Account {
    Account { balance }
}

/// Fast sweeps so failure detection fits in a test.
pub fn runtime() -> Runtime {
    Runtime::new(
        OptsvaConfig::new()
            .sweep_interval_ms(100)
            .heartbeat_interval_ms(20)
            .max_retries(8)
            .wait_poll_ms(10),
    )
    .unwrap()
}

pub fn eventually(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}
