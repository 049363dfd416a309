//! Periodic recomputation of the materialized views.
//!
//! One [`ViewRefresher`] per work kind performs a single bounded cycle;
//! the [`RefreshScheduler`] ticks each of them on its own interval, but only
//! while this process holds leadership and never while the previous cycle of
//! the same kind is still in flight.

pub mod refresher;
pub mod scheduler;

pub use refresher::{Eligibility, RefreshReport, ViewRefresher};
pub use scheduler::{RefreshJob, RefreshScheduler, TickOutcome};
