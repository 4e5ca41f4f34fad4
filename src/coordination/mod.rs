//! Coordination between requests and between worker processes.
//!
//! Several worker processes may share one cache root.  Mutation of a mirror is
//! serialized by an advisory file lock per repository, and concurrent
//! refreshes within a process are collapsed into a single sync.

pub mod coalescer;
pub mod locks;
pub mod node;

pub use coalescer::{EnsureOutcome, Freshness, RequestCoalescer};
pub use locks::{LockError, LockTimeouts, RepoLock, RepoLockGuard};
