//! Failure detection. A [`FailureMonitor`] lives next to the objects of one
//! process and rolls back transactions that stopped sending heartbeats; a
//! [`Heartbeat`] sender lives next to the transactions and keeps every
//! monitor they depend on informed.

mod heartbeat;
mod monitor;

pub use heartbeat::Heartbeat;
pub use monitor::FailureMonitor;

use crate::txn::TxnId;
use crate::OptsvaError;

/// Something that accepts liveness pings for transactions: a monitor in
/// this process or a client for one in another process.
pub trait MonitorEndpoint: Send + Sync {
    fn ping(&self, txn: TxnId) -> Result<(), OptsvaError>;

    fn describe(&self) -> String;
}
