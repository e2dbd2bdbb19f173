//! Lifecycle trace hooks.
//!
//! Pools and the cluster router report coarse lifecycle events through
//! optional callbacks. Hooks run synchronously on the reporting task and
//! must return quickly; anything heavier belongs behind a channel on the
//! subscriber's side.

use redshard_core::Topology;
use std::sync::Arc;
use std::time::Duration;

/// Shared callback type for a single event kind.
pub type Hook<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Why a pooled connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnClosedReason {
    /// Checked in while the pool's main buffer was full.
    PoolFull,
    /// The pool itself was closed.
    PoolClosed,
    /// The connection had latched a transport error.
    ConnError,
    /// Evicted from the overflow buffer by the drainer.
    Stale,
}

/// A connection was created on behalf of a pool.
#[derive(Debug, Clone)]
pub struct PoolConnCreated {
    /// Address the connection was dialed to.
    pub addr: String,
}

/// A pooled connection was closed.
#[derive(Debug, Clone)]
pub struct PoolConnClosed {
    /// Address the connection belonged to.
    pub addr: String,
    /// Why it was closed.
    pub reason: ConnClosedReason,
}

/// The pool finished its initial fill.
#[derive(Debug, Clone)]
pub struct PoolInitCompleted {
    /// Connections available when the fill finished.
    pub avail_count: usize,
}

/// A command issued through the pool completed.
#[derive(Debug, Clone)]
pub struct PoolDoCompleted {
    /// Wall time of checkout, round trip and check-in.
    pub elapsed: Duration,
}

/// Trace hooks for a [`Pool`](crate::pool::Pool).
#[derive(Clone, Default)]
pub struct PoolTrace {
    /// Fired after each successful connect.
    pub conn_created: Option<Hook<PoolConnCreated>>,
    /// Fired whenever a pooled connection is closed.
    pub conn_closed: Option<Hook<PoolConnClosed>>,
    /// Fired once, after the initial fill.
    pub init_completed: Option<Hook<PoolInitCompleted>>,
    /// Fired after each command round trip through the pool.
    pub do_completed: Option<Hook<PoolDoCompleted>>,
}

/// Which redirect kind a command followed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectKind {
    /// Permanent slot reassignment.
    Moved,
    /// Transient per-key redirection during migration.
    Ask,
}

/// A command was redirected to another node.
#[derive(Debug, Clone)]
pub struct Redirected {
    /// MOVED or ASK.
    pub kind: RedirectKind,
    /// Address the command was redirected to.
    pub addr: String,
}

/// The topology cache was replaced with a different snapshot.
#[derive(Debug, Clone)]
pub struct TopoChanged {
    /// The new topology.
    pub topo: Topology,
}

/// Trace hooks for a [`Cluster`](crate::cluster::Cluster).
#[derive(Clone, Default)]
pub struct ClusterTrace {
    /// Fired when a sync installs a topology that differs from the cached
    /// one.
    pub topo_changed: Option<Hook<TopoChanged>>,
    /// Fired on every MOVED/ASK redirect followed.
    pub redirected: Option<Hook<Redirected>>,
}

/// Invoke a hook if it is installed.
pub(crate) fn fire<E>(hook: &Option<Hook<E>>, event: &E) {
    if let Some(hook) = hook {
        hook(event);
    }
}
