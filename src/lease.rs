use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::QueueConfig;
use crate::error::{QueueError, Result};
use crate::item::{ItemStatus, ReleaseOutcome, WorkItem, WorkKind};
use crate::store::{SourceStore, ViewStore};
use crate::view::{Availability, ClaimFilter, QueueDepth, ViewEntry};

/// Hands work items to agents one at a time.
///
/// The view store only proposes candidates. Ownership is decided by the
/// source store's conditional lease update, so any number of instances may
/// call into their own `LeaseManager` against the same stores concurrently.
#[derive(Clone)]
pub struct LeaseManager {
    source: Arc<dyn SourceStore>,
    views: Arc<dyn ViewStore>,
    lease_duration: chrono::Duration,
    max_attempts: usize,
}

impl LeaseManager {
    pub fn new(
        source: Arc<dyn SourceStore>,
        views: Arc<dyn ViewStore>,
        config: &QueueConfig,
    ) -> Result<Self> {
        Self::with_settings(
            source,
            views,
            config.lease_duration,
            config.max_claim_attempts,
        )
    }

    pub fn with_settings(
        source: Arc<dyn SourceStore>,
        views: Arc<dyn ViewStore>,
        lease_duration: Duration,
        max_attempts: usize,
    ) -> Result<Self> {
        let lease_duration = chrono::Duration::from_std(lease_duration)
            .map_err(|e| QueueError::InvalidConfig(format!("lease duration out of range: {e}")))?;
        Ok(Self {
            source,
            views,
            lease_duration,
            max_attempts: max_attempts.max(1),
        })
    }

    /// Lease the best available item matching `filter` to `holder`.
    ///
    /// Candidates are tried best first, up to the attempt budget. A winning
    /// candidate leaves the available index at once so the next claim reads
    /// past it. A candidate whose conditional update matches nothing was taken
    /// or finished since the last refresh; its entry is corrected the same way
    /// and the next candidate is tried. `None` means nothing could be leased.
    pub async fn claim_next(
        &self,
        kind: WorkKind,
        filter: &ClaimFilter,
        holder: &str,
    ) -> Result<Option<WorkItem>> {
        let mut attempts = 0;

        while attempts < self.max_attempts {
            let candidates = self
                .views
                .best_available(kind, filter, self.max_attempts - attempts)
                .await?;
            if candidates.is_empty() {
                break;
            }

            for candidate in &candidates {
                attempts += 1;
                let now = Utc::now();
                let leased = self
                    .source
                    .try_lease(
                        kind,
                        &candidate.source_id,
                        holder,
                        now,
                        now + self.lease_duration,
                    )
                    .await?;

                match leased {
                    Some(item) => {
                        self.mark_hint(kind, &item.id, Availability::Leased).await;
                        tracing::info!(
                            kind = %kind,
                            source_id = %item.id,
                            holder,
                            priority = candidate.priority,
                            "Work item leased"
                        );
                        return Ok(Some(item));
                    }
                    None => {
                        tracing::debug!(
                            kind = %kind,
                            source_id = %candidate.source_id,
                            holder,
                            "Candidate already taken, trying next"
                        );
                        self.correct_hint(kind, &candidate.source_id).await;
                    }
                }
            }
        }

        tracing::debug!(kind = %kind, holder, tried = attempts, "No claimable work item");
        Ok(None)
    }

    /// Finish with a leased item.
    ///
    /// Returns `false`, and changes nothing, when `holder` no longer holds the
    /// item: already released, or re-leased to someone else after expiry.
    /// The view entry follows the outcome right away. A skipped item goes to
    /// the back of its priority tier; an abandoned one keeps its place.
    pub async fn release(
        &self,
        kind: WorkKind,
        source_id: &str,
        holder: &str,
        outcome: ReleaseOutcome,
    ) -> Result<bool> {
        let now = Utc::now();
        let released = self
            .source
            .release_lease(kind, source_id, holder, outcome, now)
            .await?;

        if !released {
            tracing::debug!(kind = %kind, source_id, holder, outcome = %outcome, "Release ignored, lease not held");
            return Ok(false);
        }

        tracing::info!(kind = %kind, source_id, holder, outcome = %outcome, "Lease released");
        match outcome {
            ReleaseOutcome::Completed => self.remove_hint(kind, source_id).await,
            ReleaseOutcome::Abandoned => {
                self.mark_hint(kind, source_id, Availability::Available).await
            }
            ReleaseOutcome::Skipped => self.requeue_hint(kind, source_id, now).await,
        }
        Ok(true)
    }

    /// Extend a lease still held by `holder` by a full lease duration.
    pub async fn renew(&self, kind: WorkKind, source_id: &str, holder: &str) -> Result<bool> {
        let now = Utc::now();
        self.source
            .extend_lease(kind, source_id, holder, now, now + self.lease_duration)
            .await
    }

    /// Read an item, clearing a lapsed lease on the way.
    pub async fn inspect(&self, kind: WorkKind, source_id: &str) -> Result<Option<WorkItem>> {
        let now = Utc::now();
        let Some(item) = self.source.get(kind, source_id).await? else {
            return Ok(None);
        };

        if item.status == ItemStatus::Leased && item.effective_status(now) == ItemStatus::Pending {
            if self.source.clear_expired_lease(kind, source_id, now).await? {
                tracing::info!(kind = %kind, source_id, "Expired lease cleared");
            }
            return self.source.get(kind, source_id).await;
        }
        Ok(Some(item))
    }

    /// Available and leased counts from the view store.
    pub async fn queue_depth(&self, kind: WorkKind) -> Result<QueueDepth> {
        self.views.depth(kind).await
    }

    // View writes below are best effort. The source store already holds the
    // outcome and the next refresh rewrites the entry if one of these fails.

    async fn mark_hint(&self, kind: WorkKind, source_id: &str, availability: Availability) {
        let ids = [source_id.to_string()];
        if let Err(e) = self.views.mark(kind, &ids, availability, Utc::now()).await {
            tracing::warn!(kind = %kind, source_id, availability = %availability, error = %e, "View entry update failed");
        }
    }

    async fn remove_hint(&self, kind: WorkKind, source_id: &str) {
        let ids = [source_id.to_string()];
        if let Err(e) = self.views.remove(kind, &ids).await {
            tracing::warn!(kind = %kind, source_id, error = %e, "View entry removal failed");
        }
    }

    async fn requeue_hint(&self, kind: WorkKind, source_id: &str, queued_at: DateTime<Utc>) {
        let entry = match self.views.get(kind, source_id).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(kind = %kind, source_id, error = %e, "View entry read failed");
                return;
            }
        };
        let requeued = ViewEntry {
            availability: Availability::Available,
            queued_at,
            updated_at: queued_at,
            ..entry
        };
        if let Err(e) = self.views.upsert_batch(kind, vec![requeued]).await {
            tracing::warn!(kind = %kind, source_id, error = %e, "View entry requeue failed");
        }
    }

    /// Bring a lost candidate's entry in line with its item.
    async fn correct_hint(&self, kind: WorkKind, source_id: &str) {
        let item = match self.source.get(kind, source_id).await {
            Ok(item) => item,
            Err(e) => {
                tracing::warn!(kind = %kind, source_id, error = %e, "Candidate lookup failed");
                return;
            }
        };
        match item.map(|i| i.effective_status(Utc::now())) {
            None | Some(ItemStatus::Resolved) => self.remove_hint(kind, source_id).await,
            Some(ItemStatus::Leased) => self.mark_hint(kind, source_id, Availability::Leased).await,
            Some(ItemStatus::Stale) => self.mark_hint(kind, source_id, Availability::Expired).await,
            // Released again in between; leave it on offer.
            Some(ItemStatus::Pending) => {}
        }
    }
}
