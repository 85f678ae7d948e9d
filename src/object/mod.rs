//! Shared objects and the per-transaction proxies that mediate access to them.
//!
//! A [`SharedObjectHost`] owns one application object together with the
//! counters that order transactions on it: a ticket counter handing out each
//! transaction's position, a release gate opened once per transaction that is
//! done touching the object, and a checkpoint gate opened once per transaction
//! that has fully committed or rolled back. An [`ObjectProxy`] is one
//! transaction's view of the object and decides, per call, whether the call
//! runs against the live object, is recorded in a log for later replay, or
//! runs against a private copy.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::OptsvaError;

pub mod gate;
pub mod host;
pub mod proxy;
pub mod snapshot;

pub use gate::VersionGate;
pub use host::{HostContext, SharedObjectHost};
pub use proxy::ObjectProxy;
pub use snapshot::SnapshotImage;

/// Position of a transaction in one object's serialization order. Tickets
/// start at 1; 0 means "not started".
pub type Ticket = u64;
pub type Version = u64;

pub const NO_TICKET: Ticket = 0;

/// An application object that can be shared between transactions.
///
/// State must be serializable for rollback snapshots and cloneable for the
/// private copy served after early release. Writes are recorded as values of
/// [`SharedObject::Write`] so they can be logged and replayed.
pub trait SharedObject: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// A recorded write invocation.
    type Write: Clone + fmt::Debug + Send + Sync + 'static;

    fn apply(&mut self, write: &Self::Write);
}

/// Access classification of a proxy registration or of a single method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    Any,
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessMode::ReadOnly => write!(f, "read-only"),
            AccessMode::WriteOnly => write!(f, "write-only"),
            AccessMode::Any => write!(f, "read-write"),
        }
    }
}

impl AccessMode {
    /// Whether a method tagged `method` may be called through a proxy
    /// registered with this mode.
    pub fn permits(self, method: AccessMode) -> bool {
        match self {
            AccessMode::Any => true,
            declared => declared == method,
        }
    }
}

/// Where the caller must execute the call the proxy was asked about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Buffer {
    /// No buffer: operate on the live shared object.
    Live,
    /// Record the invocation; do not execute it yet.
    Log,
    /// Operate on the proxy's private copy.
    Copy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    Finite(u64),
    Unbounded,
}

impl Bound {
    /// Decodes the wire representation where `-1` stands for "no bound".
    pub fn from_raw(raw: i64) -> Result<Self, OptsvaError> {
        match raw {
            -1 => Ok(Bound::Unbounded),
            n if n >= 0 => Ok(Bound::Finite(n as u64)),
            n => Err(OptsvaError::InvalidBounds(format!("negative bound {n}"))),
        }
    }

    pub fn reached(&self, count: u64) -> bool {
        match self {
            Bound::Finite(bound) => count >= *bound,
            Bound::Unbounded => false,
        }
    }

    pub fn is_finite(&self) -> bool {
        matches!(self, Bound::Finite(_))
    }

    fn exceeds(&self, other: &Bound) -> bool {
        match (self, other) {
            (Bound::Finite(a), Bound::Finite(b)) => a > b,
            (Bound::Unbounded, Bound::Finite(_)) => true,
            (_, Bound::Unbounded) => false,
        }
    }
}

impl fmt::Display for Bound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bound::Finite(n) => write!(f, "{n}"),
            Bound::Unbounded => write!(f, "unbounded"),
        }
    }
}

/// Call budget declared when a transaction registers an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    pub ops: Bound,
    pub reads: Bound,
    pub writes: Bound,
}

impl Bounds {
    pub fn new(ops: Bound, reads: Bound, writes: Bound) -> Result<Self, OptsvaError> {
        let bounds = Self { ops, reads, writes };
        bounds.validate()?;
        Ok(bounds)
    }

    pub fn finite(ops: u64, reads: u64, writes: u64) -> Result<Self, OptsvaError> {
        Self::new(Bound::Finite(ops), Bound::Finite(reads), Bound::Finite(writes))
    }

    pub fn unbounded() -> Self {
        Self {
            ops: Bound::Unbounded,
            reads: Bound::Unbounded,
            writes: Bound::Unbounded,
        }
    }

    pub fn reads(n: u64) -> Self {
        Self {
            ops: Bound::Finite(n),
            reads: Bound::Finite(n),
            writes: Bound::Finite(0),
        }
    }

    pub fn writes(n: u64) -> Self {
        Self {
            ops: Bound::Finite(n),
            reads: Bound::Finite(0),
            writes: Bound::Finite(n),
        }
    }

    pub fn validate(&self) -> Result<(), OptsvaError> {
        if self.ops == Bound::Finite(0) {
            return Err(OptsvaError::InvalidBounds(
                "operation bound must be positive".into(),
            ));
        }
        if self.writes.exceeds(&self.ops) {
            return Err(OptsvaError::InvalidBounds(format!(
                "write bound {} exceeds operation bound {}",
                self.writes, self.ops
            )));
        }
        // The operation bound caps reads already, so any read bound goes.
        Ok(())
    }

    /// Whether reads can still happen once `op_count` operations ran.
    pub(crate) fn reads_remain(&self, op_count: u64, read_count: u64) -> bool {
        !self.ops.reached(op_count) && !self.reads.reached(read_count)
    }
}

static NEXT_OBJECT_UID: AtomicU64 = AtomicU64::new(1);

/// Stable identity of a shared object. Transactions lock objects in key
/// order so concurrently starting transactions never deadlock and receive
/// tickets in a globally consistent order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    name: String,
    uid: u64,
}

impl ObjectKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uid: NEXT_OBJECT_UID.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.uid)
    }
}

#[cfg(test)]
mod tests;
