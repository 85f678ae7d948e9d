use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use super::MonitorEndpoint;
use crate::txn::TxnId;

struct Shared {
    watched: Mutex<HashMap<TxnId, Vec<Arc<dyn MonitorEndpoint>>>>,
    stopping: Mutex<bool>,
    stop_signal: Condvar,
}

/// Periodically pings every monitor each running transaction depends on.
pub struct Heartbeat {
    shared: Arc<Shared>,
    sender: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Heartbeat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heartbeat")
            .field("watched", &self.watched())
            .finish()
    }
}

impl Heartbeat {
    pub fn start(interval: Duration) -> Arc<Self> {
        let heartbeat = Arc::new(Self {
            shared: Arc::new(Shared {
                watched: Mutex::new(HashMap::new()),
                stopping: Mutex::new(false),
                stop_signal: Condvar::new(),
            }),
            sender: Mutex::new(None),
        });
        let shared = Arc::clone(&heartbeat.shared);
        let spawned = thread::Builder::new()
            .name("optsva-heartbeat".into())
            .spawn(move || run_sender(&shared, interval));
        match spawned {
            Ok(handle) => *heartbeat.sender.lock() = Some(handle),
            Err(err) => error!(error = %err, "cannot spawn heartbeat thread"),
        }
        heartbeat
    }

    pub fn watch(&self, txn: TxnId, endpoints: Vec<Arc<dyn MonitorEndpoint>>) {
        if endpoints.is_empty() {
            return;
        }
        debug!(txn = %txn, monitors = endpoints.len(), "heartbeat watching transaction");
        self.shared.watched.lock().insert(txn, endpoints);
    }

    pub fn forget(&self, txn: TxnId) {
        self.shared.watched.lock().remove(&txn);
    }

    pub fn watched(&self) -> usize {
        self.shared.watched.lock().len()
    }

    /// Sends one round of pings right away.
    pub fn beat(&self) {
        beat(&self.shared);
    }

    pub fn shutdown(&self) {
        *self.shared.stopping.lock() = true;
        self.shared.stop_signal.notify_all();
        if let Some(handle) = self.sender.lock().take() {
            if handle.join().is_err() {
                error!("heartbeat thread panicked");
            }
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_sender(shared: &Shared, interval: Duration) {
    loop {
        {
            let mut stopping = shared.stopping.lock();
            if !*stopping {
                shared.stop_signal.wait_for(&mut stopping, interval);
            }
            if *stopping {
                break;
            }
        }
        beat(shared);
    }
}

fn beat(shared: &Shared) {
    // Pings may block on the network; never hold the table while sending.
    let round: Vec<(TxnId, Vec<Arc<dyn MonitorEndpoint>>)> = shared
        .watched
        .lock()
        .iter()
        .map(|(txn, endpoints)| (*txn, endpoints.clone()))
        .collect();
    for (txn, endpoints) in round {
        for endpoint in endpoints {
            if let Err(err) = endpoint.ping(txn) {
                warn!(txn = %txn, monitor = %endpoint.describe(), error = %err, "heartbeat not delivered");
            }
        }
    }
}
