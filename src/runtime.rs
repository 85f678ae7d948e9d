use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::core::config::OptsvaConfig;
use crate::core::wait_stats::set_wait_stats_enabled;
use crate::failure::{FailureMonitor, Heartbeat};
use crate::object::{HostContext, SharedObject, SharedObjectHost};
use crate::scheduler::TaskScheduler;
use crate::txn::{Transaction, TxnState, Update};
use crate::OptsvaError;

/// The process-wide services: task scheduler, failure monitor and heartbeat
/// sender, started together and shut down together.
pub struct Runtime {
    config: OptsvaConfig,
    scheduler: Arc<TaskScheduler>,
    monitor: Arc<FailureMonitor>,
    heartbeat: Arc<Heartbeat>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish()
    }
}

impl Runtime {
    pub fn new(config: OptsvaConfig) -> Result<Self, OptsvaError> {
        config.validate()?;
        set_wait_stats_enabled(config.wait_stats_enabled);
        let runtime = Self {
            scheduler: TaskScheduler::start(),
            monitor: FailureMonitor::start(config.sweep_interval()),
            heartbeat: Heartbeat::start(config.heartbeat_interval()),
            config,
            stopped: AtomicBool::new(false),
        };
        info!(
            sweep_ms = runtime.config.sweep_interval_ms,
            heartbeat_ms = runtime.config.heartbeat_interval_ms,
            "runtime started"
        );
        Ok(runtime)
    }

    pub fn config(&self) -> &OptsvaConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub fn monitor(&self) -> &Arc<FailureMonitor> {
        &self.monitor
    }

    pub fn heartbeat(&self) -> &Arc<Heartbeat> {
        &self.heartbeat
    }

    pub fn context(&self) -> HostContext {
        HostContext::new(
            Arc::clone(&self.scheduler),
            Some(Arc::clone(&self.monitor)),
            self.config.wait_poll(),
        )
    }

    /// Hosts `object` in this process.
    pub fn host<T: SharedObject>(
        &self,
        name: impl Into<String>,
        object: T,
    ) -> Arc<SharedObjectHost<T>> {
        SharedObjectHost::new(name, object, self.context())
    }

    pub fn transaction(&self) -> Transaction {
        Transaction::new(Some(Arc::clone(&self.heartbeat)))
    }

    pub fn update(&self) -> Update {
        Update::new(Some(Arc::clone(&self.heartbeat)))
    }

    /// Runs `body` in a fresh transaction until it commits. The body
    /// registers its objects and starts the transaction; a still-running
    /// transaction is committed when the body returns. `Retry` and transport
    /// faults re-run the body up to `max_retries` times.
    pub fn atomic<R>(
        &self,
        mut body: impl FnMut(&Transaction) -> Result<R, OptsvaError>,
    ) -> Result<R, OptsvaError> {
        let attempts = self.config.max_retries;
        for attempt in 1..=attempts {
            let tx = self.transaction();
            let outcome = body(&tx).and_then(|value| {
                if tx.state() == TxnState::Running {
                    tx.commit()?;
                }
                Ok(value)
            });
            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() => {
                    debug!(txn = %tx.id(), attempt, error = %err, "re-running transaction body");
                    if tx.state() == TxnState::Running {
                        if let Err(rollback_err) = tx.handle().rollback() {
                            warn!(txn = %tx.id(), error = %rollback_err, "rollback before retry failed");
                        }
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Err(OptsvaError::RetryLimitExceeded(attempts))
    }

    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.heartbeat.shutdown();
        self.monitor.shutdown();
        self.scheduler.shutdown();
        info!("runtime stopped");
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
