//! Leader election over a TTL lock.
//!
//! Exactly one process in the fleet runs the view refreshers. It proves this by
//! holding a single lock row that it must renew well inside the row's TTL.
//!
//! # Components
//!
//! - [`LockStore`]: set-if-absent / renew-if-held / delete-if-held storage
//! - [`LeaderLock`]: timeout-bounded operations that never surface errors
//! - [`LeaderElector`]: the acquire/renew loop publishing a [`Leadership`] handle
//!
//! Losing the lock, or failing to reach the lock store, always resolves to
//! "not leader".

pub mod elector;
pub mod lock;
pub mod timer;

pub use elector::{LeaderElector, LeaderState, Leadership};
pub use lock::{LeaderLock, LeaderToken, LockStore, MemoryLockStore};
