mod core;
pub mod failure;
pub mod object;
mod runtime;
pub mod scheduler;
mod server;
pub mod txn;

pub use crate::core::config::{
    OptsvaConfig, ENV_HEARTBEAT_MS, ENV_MAX_RETRIES, ENV_SWEEP_MS, ENV_WAIT_POLL_MS, ENV_WAIT_STATS,
};
pub use crate::core::errors::{OptsvaError, SnapshotError};
pub use crate::core::wait_stats::{
    reset_wait_stats, set_wait_stats_enabled, snapshot_wait_stats, wait_stats_enabled,
    WaitCounterSnapshot, WaitStatKind, WaitStatsSnapshot,
};
pub use crate::failure::{FailureMonitor, Heartbeat, MonitorEndpoint};
pub use crate::object::{
    AccessMode, Bound, Bounds, Buffer, HostContext, ObjectKey, ObjectProxy, SharedObject,
    SharedObjectHost, SnapshotImage, Ticket, Version, VersionGate, NO_TICKET,
};
pub use crate::runtime::Runtime;
pub use crate::scheduler::{Task, TaskScheduler};
pub use crate::server::{serve_monitor, serve_monitor_on, RemoteMonitor, OP_ACK, OP_ERROR, OP_HEARTBEAT};
pub use crate::txn::{Participant, Transaction, TransactionRef, TxnId, TxnState, Update};
