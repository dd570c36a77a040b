//! Reactor runtime: readiness layer, slot table, acceptor and
//! sub-reactor loops, and the signal funnel.
//!
//! Ownership model: a connection fd belongs to exactly one sub-reactor
//! poller for its whole life. Connection fds are registered one-shot, so a
//! delivered event parks the fd until somebody re-arms it; that is the
//! hand-off token between a reactor and a pool worker. The only state
//! shared across threads is the slot table (per-slot mutexes, uncontended
//! by the one-shot discipline), the active-connection counter, the work
//! queue, and the kernel-serialized epoll instances.

pub mod acceptor;
pub mod poller;
pub mod signal;
pub mod slots;
pub mod sub_reactor;

use slots::SlotTable;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

/// State shared by the acceptor, the sub-reactors and the pool workers.
pub struct Shared {
    pub slots: SlotTable,
    /// One poller per sub-reactor, indexed by reactor id.
    pub pollers: Vec<poller::Poller>,
    /// Canonicalized document root.
    pub doc_root: PathBuf,
    pub use_sendfile: bool,
    /// Cleared once at shutdown; reactors check it when woken.
    pub running: AtomicBool,
}
