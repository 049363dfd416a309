//! Storage seams.
//!
//! The queue never owns its data. Work items live in a source-of-truth store
//! maintained by ingestion flows, and the ranked projections live in a view
//! store written only by the elected refresher.
//!
//! # Components
//!
//! - [`SourceStore`]: bounded scans plus per-item conditional lease updates.
//!   The conditional updates are the only place assignment correctness is
//!   enforced.
//! - [`ViewStore`]: partial-failure-tolerant batch upserts and ordered
//!   "best available" reads.
//! - [`memory`]: in-process implementations used by the server binary and tests.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::item::{ReleaseOutcome, WorkItem, WorkKind};
use crate::view::{Availability, BatchOutcome, ClaimFilter, QueueDepth, SweepOutcome, ViewEntry};

pub use memory::{MemorySourceStore, MemoryViewStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadConsistency {
    /// Read from the primary; used for lease decisions.
    Primary,
    /// Any replica will do; used by refresh scans.
    ReplicaPreferred,
}

/// Scan for items whose effective status is pending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingScan {
    pub created_since: DateTime<Utc>,
    /// Hard cap on returned rows.
    pub limit: usize,
    pub consistency: ReadConsistency,
}

/// Scan for items that left the pending state recently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionScan {
    pub active_since: DateTime<Utc>,
    pub limit: usize,
    pub consistency: ReadConsistency,
}

#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Up to `scan.limit` items created at or after `scan.created_since` with
    /// effective status pending, oldest first.
    /// Expired leases count as pending.
    async fn scan_pending(
        &self,
        kind: WorkKind,
        scan: &PendingScan,
        now: DateTime<Utc>,
    ) -> Result<Vec<WorkItem>>;

    /// Items with activity since `scan.active_since` whose effective status is
    /// leased, resolved or stale.
    async fn scan_transitioned(
        &self,
        kind: WorkKind,
        scan: &TransitionScan,
        now: DateTime<Utc>,
    ) -> Result<Vec<WorkItem>>;

    async fn get(&self, kind: WorkKind, id: &str) -> Result<Option<WorkItem>>;

    /// Atomically lease the item if it is pending or its lease has lapsed.
    /// Returns the updated item, or `None` when the condition did not hold.
    async fn try_lease(
        &self,
        kind: WorkKind,
        id: &str,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<WorkItem>>;

    /// Push back the expiry of an unexpired lease held by `holder`.
    async fn extend_lease(
        &self,
        kind: WorkKind,
        id: &str,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Atomically clear a lease held by `holder` and apply `outcome`.
    /// Returns `false` when the item is not leased by `holder`.
    async fn release_lease(
        &self,
        kind: WorkKind,
        id: &str,
        holder: &str,
        outcome: ReleaseOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Reset an item whose lease has lapsed back to pending.
    async fn clear_expired_lease(&self, kind: WorkKind, id: &str, now: DateTime<Utc>)
        -> Result<bool>;
}

#[async_trait]
pub trait ViewStore: Send + Sync {
    /// Insert or replace entries keyed by `source_id`. Rejected rows are
    /// reported in the outcome and do not prevent the others from landing.
    async fn upsert_batch(&self, kind: WorkKind, entries: Vec<ViewEntry>) -> Result<BatchOutcome>;

    /// Set availability on existing entries; returns how many changed.
    async fn mark(
        &self,
        kind: WorkKind,
        ids: &[String],
        availability: Availability,
        now: DateTime<Utc>,
    ) -> Result<usize>;

    async fn remove(&self, kind: WorkKind, ids: &[String]) -> Result<usize>;

    /// Delete every entry last updated before `older_than`.
    async fn sweep(&self, kind: WorkKind, older_than: DateTime<Utc>) -> Result<SweepOutcome>;

    /// Available entries matching `filter`, best first.
    async fn best_available(
        &self,
        kind: WorkKind,
        filter: &ClaimFilter,
        limit: usize,
    ) -> Result<Vec<ViewEntry>>;

    async fn get(&self, kind: WorkKind, id: &str) -> Result<Option<ViewEntry>>;

    async fn depth(&self, kind: WorkKind) -> Result<QueueDepth>;
}
