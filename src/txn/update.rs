use std::sync::Arc;

use super::transaction::TxnCore;
use super::{TransactionRef, TxnId, TxnState};
use crate::failure::{Heartbeat, MonitorEndpoint};
use crate::object::{AccessMode, Bounds, ObjectProxy, SharedObject, SharedObjectHost};
use crate::OptsvaError;

/// A write-only transaction. Writes are only logged while it runs; tickets
/// are taken at commit and each log is replayed in the background once its
/// ticket comes up, so no read is ever validated.
pub struct Update {
    core: Arc<TxnCore>,
}

impl std::fmt::Debug for Update {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Update")
            .field("id", &self.core.id())
            .field("state", &self.core.state())
            .finish()
    }
}

impl Update {
    pub fn new(heartbeat: Option<Arc<Heartbeat>>) -> Self {
        Self {
            core: TxnCore::new(heartbeat, true),
        }
    }

    pub fn id(&self) -> TxnId {
        self.core.id()
    }

    pub fn state(&self) -> TxnState {
        self.core.state()
    }

    /// Registers `host` for at most `n` logged writes.
    pub fn writes<T: SharedObject>(
        &self,
        host: &Arc<SharedObjectHost<T>>,
        n: u64,
    ) -> Result<ObjectProxy<T>, OptsvaError> {
        self.core
            .register(host, Bounds::writes(n), AccessMode::WriteOnly)
    }

    pub fn depends_on(&self, endpoint: Arc<dyn MonitorEndpoint>) {
        self.core.add_monitor(endpoint);
    }

    /// Only moves to running; nothing is ordered yet.
    pub fn start(&self) -> Result<(), OptsvaError> {
        self.core.start()
    }

    pub fn commit(&self) -> Result<(), OptsvaError> {
        self.core.commit()
    }

    pub fn rollback(&self) -> Result<(), OptsvaError> {
        self.core.rollback(true)
    }

    pub fn handle(&self) -> Arc<dyn TransactionRef> {
        Arc::clone(&self.core) as Arc<dyn TransactionRef>
    }
}

impl Drop for Update {
    fn drop(&mut self) {
        if self.core.state() == TxnState::Running {
            if let Err(err) = self.core.rollback(false) {
                tracing::warn!(txn = %self.core.id(), error = %err, "rollback on drop failed");
            }
        }
    }
}
