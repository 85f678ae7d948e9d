//! Transactions over shared objects.
//!
//! A [`Transaction`] registers the objects it will touch together with call
//! budgets, takes one ticket per object in a globally consistent order on
//! `start`, and at `commit` waits for every predecessor on every object to
//! finish before validating what it read. [`Update`] is the write-only
//! variant that takes its tickets at commit.

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::failure::MonitorEndpoint;
use crate::object::{AccessMode, ObjectKey, Ticket};
use crate::OptsvaError;

pub mod transaction;
pub mod update;

pub use transaction::Transaction;
pub use update::Update;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxnId(Uuid);

impl TxnId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for TxnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Preparing,
    Running,
    Committed,
    Aborted,
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxnState::Preparing => "preparing",
            TxnState::Running => "running",
            TxnState::Committed => "committed",
            TxnState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// The side of a transaction its proxies can call back into, e.g. to roll
/// the whole transaction back after an isolation conflict.
pub trait TransactionRef: Send + Sync {
    fn id(&self) -> TxnId;

    fn commit(&self) -> Result<(), OptsvaError>;

    /// Idempotent: rolling back an aborted transaction is a no-op.
    fn rollback(&self) -> Result<(), OptsvaError>;
}

/// One object's proxy as seen by the transaction that owns it, independent
/// of the object's type.
pub trait Participant: Send + Sync {
    fn key(&self) -> &ObjectKey;

    fn mode(&self) -> AccessMode;

    fn ticket(&self) -> Ticket;

    fn lock(&self);

    fn unlock(&self) -> Result<(), OptsvaError>;

    fn start_transaction(&self) -> Ticket;

    fn update(&self) -> Result<(), OptsvaError>;

    fn wait_for_snapshot(&self) -> Result<bool, OptsvaError>;

    fn finish_transaction(&self, restore: bool) -> Result<(), OptsvaError>;

    /// Drops any host lock the transaction still holds. Only for
    /// transactions declared failed.
    fn abandon(&self);

    /// Monitor tracking the object's process, if failure detection is on.
    fn monitor_endpoint(&self) -> Option<Arc<dyn MonitorEndpoint>>;
}
