use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::config::RefreshConfig;
use crate::error::{QueueError, Result};
use crate::item::{ItemStatus, Payload, WorkItem, WorkKind};
use crate::priority::PriorityResolver;
use crate::store::{PendingScan, ReadConsistency, SourceStore, TransitionScan, ViewStore};
use crate::view::{Availability, ViewEntry};

/// Pluggable business predicate deciding whether a pending item belongs in
/// the view at all.
#[derive(Clone)]
pub struct Eligibility(Arc<dyn Fn(&WorkItem) -> bool + Send + Sync>);

impl Eligibility {
    pub fn new(predicate: impl Fn(&WorkItem) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(predicate))
    }

    pub fn any() -> Self {
        Self::new(|_| true)
    }

    /// Reviews are only offered when they carry a playable recording.
    pub fn requires_audio() -> Self {
        Self::new(|item| match &item.payload {
            Payload::Review(review) => review.has_audio,
            Payload::Dial(_) => true,
        })
    }

    /// Contacts already handed to a dialer batch are not offered again.
    pub fn excludes_batched() -> Self {
        Self::new(|item| match &item.payload {
            Payload::Dial(dial) => dial.batch_id.is_none(),
            Payload::Review(_) => true,
        })
    }

    pub fn is_eligible(&self, item: &WorkItem) -> bool {
        (self.0)(item)
    }
}

impl fmt::Debug for Eligibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Eligibility(..)")
    }
}

/// What one refresh cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub scanned: usize,
    pub upserted: usize,
    pub failed: usize,
    pub ineligible_removed: usize,
    pub marked_leased: usize,
    pub marked_expired: usize,
    pub resolved_removed: usize,
    pub swept: usize,
    pub swept_available: usize,
}

/// Keeps one kind's view in step with its pending work items.
///
/// A cycle reads a bounded, recent slice of pending items, projects and ranks
/// them, writes them in fixed-size batches, reconciles entries whose items
/// moved on, and finally sweeps anything older than the staleness bound.
pub struct ViewRefresher {
    kind: WorkKind,
    source: Arc<dyn SourceStore>,
    views: Arc<dyn ViewStore>,
    priorities: Arc<PriorityResolver>,
    eligibility: Eligibility,
    config: RefreshConfig,
    staleness_bound: chrono::Duration,
    /// Where the next reconcile scan starts.
    reconcile_from: Mutex<Option<DateTime<Utc>>>,
}

fn to_chrono(d: std::time::Duration, what: &str) -> Result<chrono::Duration> {
    chrono::Duration::from_std(d)
        .map_err(|e| QueueError::InvalidConfig(format!("{what} out of range: {e}")))
}

impl ViewRefresher {
    pub fn new(
        kind: WorkKind,
        source: Arc<dyn SourceStore>,
        views: Arc<dyn ViewStore>,
        priorities: Arc<PriorityResolver>,
        config: RefreshConfig,
        staleness_bound: std::time::Duration,
    ) -> Result<Self> {
        if config.batch_size == 0 || config.row_cap == 0 {
            return Err(QueueError::InvalidConfig(format!(
                "{kind} row cap and batch size must be positive"
            )));
        }
        // Reject durations chrono cannot represent up front, not mid-cycle.
        to_chrono(config.recent_window, "recent window")?;
        to_chrono(config.interval, "refresh interval")?;
        Ok(Self {
            kind,
            source,
            views,
            priorities,
            eligibility: Eligibility::any(),
            config,
            staleness_bound: to_chrono(staleness_bound, "staleness bound")?,
            reconcile_from: Mutex::new(None),
        })
    }

    pub fn with_eligibility(mut self, eligibility: Eligibility) -> Self {
        self.eligibility = eligibility;
        self
    }

    pub fn kind(&self) -> WorkKind {
        self.kind
    }

    pub fn config(&self) -> &RefreshConfig {
        &self.config
    }

    pub async fn run_cycle(&self) -> Result<RefreshReport> {
        let now = Utc::now();
        let window = to_chrono(self.config.recent_window, "recent window")?;
        let mut report = RefreshReport::default();

        // 1. Bounded scan of pending work.
        let pending = self
            .source
            .scan_pending(
                self.kind,
                &PendingScan {
                    created_since: now - window,
                    limit: self.config.row_cap,
                    consistency: ReadConsistency::ReplicaPreferred,
                },
                now,
            )
            .await?;
        report.scanned = pending.len();

        // 2. Rank.
        let mut entries = Vec::with_capacity(pending.len());
        let mut ineligible = Vec::new();
        for item in &pending {
            if self.eligibility.is_eligible(item) {
                let priority = self.priorities.resolve(&item.region);
                entries.push(ViewEntry::from_item(item, priority, now));
            } else {
                ineligible.push(item.id.clone());
            }
        }

        // 3. Batched upsert; a failed batch does not stop the next one.
        for batch in entries.chunks(self.config.batch_size) {
            match self.views.upsert_batch(self.kind, batch.to_vec()).await {
                Ok(outcome) => {
                    report.upserted += outcome.succeeded;
                    report.failed += outcome.failed.len();
                    for (source_id, reason) in &outcome.failed {
                        tracing::warn!(kind = %self.kind, source_id = %source_id, reason = %reason, "View row rejected");
                    }
                }
                Err(e) => {
                    report.failed += batch.len();
                    tracing::warn!(
                        kind = %self.kind,
                        batch_len = batch.len(),
                        error = %e,
                        "View batch upsert failed"
                    );
                }
            }
        }

        if !ineligible.is_empty() {
            report.ineligible_removed = self.views.remove(self.kind, &ineligible).await?;
        }

        // 4. Reconcile items that left the pending state.
        self.reconcile(now, window, &mut report).await?;

        // 5. Sweep.
        let swept = self.views.sweep(self.kind, now - self.staleness_bound).await?;
        report.swept = swept.removed;
        report.swept_available = swept.removed_available;
        if swept.removed_available > 0 {
            tracing::warn!(
                kind = %self.kind,
                count = swept.removed_available,
                "Swept available view entries older than the staleness bound"
            );
        }

        Ok(report)
    }

    async fn reconcile(
        &self,
        now: DateTime<Utc>,
        window: chrono::Duration,
        report: &mut RefreshReport,
    ) -> Result<()> {
        let overlap = to_chrono(self.config.interval, "refresh interval")?;
        let since = self.reconcile_from().unwrap_or(now - window);

        let moved = self
            .source
            .scan_transitioned(
                self.kind,
                &TransitionScan {
                    active_since: since,
                    limit: self.config.row_cap,
                    consistency: ReadConsistency::ReplicaPreferred,
                },
                now,
            )
            .await?;

        // A full page means more changes may follow; resume from the last one
        // read. Otherwise start one interval back to catch late replica writes.
        let next_from = match moved.last() {
            Some(last) if moved.len() >= self.config.row_cap => last.last_activity_at,
            _ => now - overlap,
        };

        let mut leased = Vec::new();
        let mut stale = Vec::new();
        let mut resolved = Vec::new();
        for item in moved {
            match item.effective_status(now) {
                ItemStatus::Leased => leased.push(item.id),
                ItemStatus::Stale => stale.push(item.id),
                ItemStatus::Resolved => resolved.push(item.id),
                ItemStatus::Pending => {}
            }
        }

        if !leased.is_empty() {
            report.marked_leased = self
                .views
                .mark(self.kind, &leased, Availability::Leased, now)
                .await?;
        }
        if !stale.is_empty() {
            report.marked_expired = self
                .views
                .mark(self.kind, &stale, Availability::Expired, now)
                .await?;
        }
        if !resolved.is_empty() {
            report.resolved_removed = self.views.remove(self.kind, &resolved).await?;
        }

        self.set_reconcile_from(next_from);
        Ok(())
    }

    fn reconcile_from(&self) -> Option<DateTime<Utc>> {
        match self.reconcile_from.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_reconcile_from(&self, at: DateTime<Utc>) {
        match self.reconcile_from.lock() {
            Ok(mut guard) => *guard = Some(at),
            Err(poisoned) => *poisoned.into_inner() = Some(at),
        }
    }
}
