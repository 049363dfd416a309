use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::Result;
use crate::item::{ItemStatus, Lease, ReleaseOutcome, WorkItem, WorkKind};
use crate::store::{PendingScan, SourceStore, TransitionScan, ViewStore};
use crate::view::{
    Availability, BatchOutcome, ClaimFilter, QueueDepth, RankOrder, SweepOutcome, ViewEntry,
};

#[derive(Debug, Default)]
struct ItemCollection {
    items: HashMap<String, WorkItem>,
    by_created: BTreeSet<(DateTime<Utc>, String)>,
    by_activity: BTreeSet<(DateTime<Utc>, String)>,
}

impl ItemCollection {
    fn put(&mut self, item: WorkItem) {
        if let Some(old) = self.items.remove(&item.id) {
            self.by_created.remove(&(old.created_at, old.id.clone()));
            self.by_activity.remove(&(old.last_activity_at, old.id));
        }
        self.by_created.insert((item.created_at, item.id.clone()));
        self.by_activity.insert((item.last_activity_at, item.id.clone()));
        self.items.insert(item.id.clone(), item);
    }

    /// Apply `f` to one item, keeping the activity index in step.
    fn modify<R>(&mut self, id: &str, f: impl FnOnce(&mut WorkItem) -> R) -> Option<R> {
        let item = self.items.get_mut(id)?;
        let before = item.last_activity_at;
        let out = f(item);
        let after = item.last_activity_at;
        if after != before {
            self.by_activity.remove(&(before, id.to_string()));
            self.by_activity.insert((after, id.to_string()));
        }
        Some(out)
    }
}

fn touch(item: &mut WorkItem, now: DateTime<Utc>) {
    if now > item.last_activity_at {
        item.last_activity_at = now;
    }
}

/// Source-of-truth store held in process memory.
///
/// Every conditional update runs under one write lock, which gives the same
/// per-item atomicity a document database gives a filtered update.
#[derive(Debug, Default)]
pub struct MemorySourceStore {
    collections: RwLock<HashMap<WorkKind, ItemCollection>>,
}

impl MemorySourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an item (ingestion side).
    pub async fn insert(&self, item: WorkItem) {
        let mut collections = self.collections.write().await;
        collections.entry(item.kind()).or_default().put(item);
    }

    pub async fn insert_many(&self, items: impl IntoIterator<Item = WorkItem>) {
        let mut collections = self.collections.write().await;
        for item in items {
            collections.entry(item.kind()).or_default().put(item);
        }
    }

    /// Force a status from outside the lease protocol, e.g. a collaborator
    /// retiring an item as stale. Clears any lease.
    pub async fn set_status(
        &self,
        kind: WorkKind,
        id: &str,
        status: ItemStatus,
        now: DateTime<Utc>,
    ) -> bool {
        let mut collections = self.collections.write().await;
        collections
            .get_mut(&kind)
            .and_then(|c| {
                c.modify(id, |item| {
                    item.status = status;
                    item.lease = None;
                    touch(item, now);
                })
            })
            .is_some()
    }

    pub async fn len(&self, kind: WorkKind) -> usize {
        self.collections
            .read()
            .await
            .get(&kind)
            .map(|c| c.items.len())
            .unwrap_or(0)
    }

    pub async fn is_empty(&self, kind: WorkKind) -> bool {
        self.len(kind).await == 0
    }
}

#[async_trait]
impl SourceStore for MemorySourceStore {
    async fn scan_pending(
        &self,
        kind: WorkKind,
        scan: &PendingScan,
        now: DateTime<Utc>,
    ) -> Result<Vec<WorkItem>> {
        let collections = self.collections.read().await;
        let Some(collection) = collections.get(&kind) else {
            return Ok(Vec::new());
        };

        Ok(collection
            .by_created
            .range((scan.created_since, String::new())..)
            .filter_map(|(_, id)| collection.items.get(id))
            .filter(|item| item.is_claimable(now))
            .take(scan.limit)
            .cloned()
            .collect())
    }

    async fn scan_transitioned(
        &self,
        kind: WorkKind,
        scan: &TransitionScan,
        now: DateTime<Utc>,
    ) -> Result<Vec<WorkItem>> {
        let collections = self.collections.read().await;
        let Some(collection) = collections.get(&kind) else {
            return Ok(Vec::new());
        };

        Ok(collection
            .by_activity
            .range((scan.active_since, String::new())..)
            .filter_map(|(_, id)| collection.items.get(id))
            .filter(|item| item.effective_status(now) != ItemStatus::Pending)
            .take(scan.limit)
            .cloned()
            .collect())
    }

    async fn get(&self, kind: WorkKind, id: &str) -> Result<Option<WorkItem>> {
        Ok(self
            .collections
            .read()
            .await
            .get(&kind)
            .and_then(|c| c.items.get(id))
            .cloned())
    }

    async fn try_lease(
        &self,
        kind: WorkKind,
        id: &str,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<WorkItem>> {
        let mut collections = self.collections.write().await;
        let Some(collection) = collections.get_mut(&kind) else {
            return Ok(None);
        };
        Ok(collection
            .modify(id, |item| {
                if !item.is_claimable(now) {
                    return None;
                }
                item.status = ItemStatus::Leased;
                item.lease = Some(Lease {
                    holder: holder.to_string(),
                    granted_at: now,
                    expires_at,
                });
                touch(item, now);
                Some(item.clone())
            })
            .flatten())
    }

    async fn extend_lease(
        &self,
        kind: WorkKind,
        id: &str,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut collections = self.collections.write().await;
        let Some(collection) = collections.get_mut(&kind) else {
            return Ok(false);
        };
        Ok(collection
            .modify(id, |item| {
                if item.active_lease(now).map(|l| l.holder.as_str()) != Some(holder) {
                    return false;
                }
                if let Some(lease) = item.lease.as_mut() {
                    lease.expires_at = expires_at;
                }
                touch(item, now);
                true
            })
            .unwrap_or(false))
    }

    async fn release_lease(
        &self,
        kind: WorkKind,
        id: &str,
        holder: &str,
        outcome: ReleaseOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut collections = self.collections.write().await;
        let Some(collection) = collections.get_mut(&kind) else {
            return Ok(false);
        };
        Ok(collection
            .modify(id, |item| {
                let held = item.status == ItemStatus::Leased
                    && item.lease.as_ref().map(|l| l.holder.as_str()) == Some(holder);
                if !held {
                    return false;
                }

                item.lease = None;
                match outcome {
                    ReleaseOutcome::Completed => item.status = ItemStatus::Resolved,
                    ReleaseOutcome::Abandoned => item.status = ItemStatus::Pending,
                    ReleaseOutcome::Skipped => {
                        item.status = ItemStatus::Pending;
                        item.last_skipped_at = Some(now);
                    }
                }
                touch(item, now);
                true
            })
            .unwrap_or(false))
    }

    async fn clear_expired_lease(
        &self,
        kind: WorkKind,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut collections = self.collections.write().await;
        let Some(collection) = collections.get_mut(&kind) else {
            return Ok(false);
        };
        Ok(collection
            .modify(id, |item| {
                if item.status != ItemStatus::Leased
                    || item.effective_status(now) != ItemStatus::Pending
                {
                    return false;
                }
                item.status = ItemStatus::Pending;
                item.lease = None;
                touch(item, now);
                true
            })
            .unwrap_or(false))
    }
}

#[derive(Debug, Default)]
struct ViewCollection {
    entries: HashMap<String, ViewEntry>,
    /// Ordered index over available entries only.
    available: BTreeSet<RankOrder>,
}

impl ViewCollection {
    fn take(&mut self, id: &str) -> Option<ViewEntry> {
        let old = self.entries.remove(id)?;
        if old.availability == Availability::Available {
            self.available.remove(&old.rank_order());
        }
        Some(old)
    }

    fn put(&mut self, entry: ViewEntry) {
        self.take(&entry.source_id);
        if entry.availability == Availability::Available {
            self.available.insert(entry.rank_order());
        }
        self.entries.insert(entry.source_id.clone(), entry);
    }
}

/// View store held in process memory, indexed by rank order.
#[derive(Debug, Default)]
pub struct MemoryViewStore {
    collections: RwLock<HashMap<WorkKind, ViewCollection>>,
}

impl MemoryViewStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self, kind: WorkKind) -> usize {
        self.collections
            .read()
            .await
            .get(&kind)
            .map(|c| c.entries.len())
            .unwrap_or(0)
    }

    pub async fn is_empty(&self, kind: WorkKind) -> bool {
        self.len(kind).await == 0
    }
}

#[async_trait]
impl ViewStore for MemoryViewStore {
    async fn upsert_batch(&self, kind: WorkKind, entries: Vec<ViewEntry>) -> Result<BatchOutcome> {
        let mut collections = self.collections.write().await;
        let collection = collections.entry(kind).or_default();
        let mut outcome = BatchOutcome::default();

        for entry in entries {
            if entry.source_id.is_empty() {
                outcome
                    .failed
                    .push((entry.source_id, "empty source id".to_string()));
                continue;
            }
            if entry.kind != kind {
                outcome.failed.push((
                    entry.source_id,
                    format!("entry kind {} written to {} view", entry.kind, kind),
                ));
                continue;
            }
            collection.put(entry);
            outcome.succeeded += 1;
        }

        Ok(outcome)
    }

    async fn mark(
        &self,
        kind: WorkKind,
        ids: &[String],
        availability: Availability,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut collections = self.collections.write().await;
        let Some(collection) = collections.get_mut(&kind) else {
            return Ok(0);
        };

        let mut changed = 0;
        for id in ids {
            if let Some(mut entry) = collection.take(id) {
                if entry.availability != availability {
                    changed += 1;
                }
                entry.availability = availability;
                entry.updated_at = now;
                collection.put(entry);
            }
        }
        Ok(changed)
    }

    async fn remove(&self, kind: WorkKind, ids: &[String]) -> Result<usize> {
        let mut collections = self.collections.write().await;
        let Some(collection) = collections.get_mut(&kind) else {
            return Ok(0);
        };
        Ok(ids.iter().filter_map(|id| collection.take(id)).count())
    }

    async fn sweep(&self, kind: WorkKind, older_than: DateTime<Utc>) -> Result<SweepOutcome> {
        let mut collections = self.collections.write().await;
        let Some(collection) = collections.get_mut(&kind) else {
            return Ok(SweepOutcome::default());
        };

        let aged: Vec<String> = collection
            .entries
            .values()
            .filter(|e| e.updated_at < older_than)
            .map(|e| e.source_id.clone())
            .collect();

        let mut outcome = SweepOutcome::default();
        for id in aged {
            if let Some(entry) = collection.take(&id) {
                outcome.removed += 1;
                if entry.availability == Availability::Available {
                    outcome.removed_available += 1;
                }
            }
        }
        Ok(outcome)
    }

    async fn best_available(
        &self,
        kind: WorkKind,
        filter: &ClaimFilter,
        limit: usize,
    ) -> Result<Vec<ViewEntry>> {
        let collections = self.collections.read().await;
        let Some(collection) = collections.get(&kind) else {
            return Ok(Vec::new());
        };

        Ok(collection
            .available
            .iter()
            .filter_map(|(_, _, _, id)| collection.entries.get(id))
            .filter(|entry| filter.matches(entry))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get(&self, kind: WorkKind, id: &str) -> Result<Option<ViewEntry>> {
        Ok(self
            .collections
            .read()
            .await
            .get(&kind)
            .and_then(|c| c.entries.get(id))
            .cloned())
    }

    async fn depth(&self, kind: WorkKind) -> Result<QueueDepth> {
        let collections = self.collections.read().await;
        let mut depth = QueueDepth::empty(kind);
        let Some(collection) = collections.get(&kind) else {
            return Ok(depth);
        };

        for entry in collection.entries.values() {
            match entry.availability {
                Availability::Available => {
                    depth.available += 1;
                    *depth.by_rank_key.entry(entry.rank_key.clone()).or_insert(0) += 1;
                }
                Availability::Leased => depth.leased += 1,
                Availability::Expired => {}
            }
        }
        Ok(depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{DialPayload, Payload, ReviewPayload};
    use crate::store::ReadConsistency;
    use chrono::Duration;

    fn review_at(id: &str, created_at: DateTime<Utc>) -> WorkItem {
        WorkItem::with_created_at(
            id,
            "north",
            Payload::Review(ReviewPayload {
                survey_id: "s1".to_string(),
                language: None,
                has_audio: true,
            }),
            created_at,
        )
    }

    fn scan(since: DateTime<Utc>, limit: usize) -> PendingScan {
        PendingScan {
            created_since: since,
            limit,
            consistency: ReadConsistency::ReplicaPreferred,
        }
    }

    #[tokio::test]
    async fn scan_pending_is_windowed_ordered_and_capped() {
        let store = MemorySourceStore::new();
        let now = Utc::now();
        store.insert(review_at("old", now - Duration::days(3))).await;
        for i in 0..5 {
            store
                .insert(review_at(&format!("r{i}"), now - Duration::minutes(10 - i)))
                .await;
        }

        let items = store
            .scan_pending(WorkKind::Review, &scan(now - Duration::days(1), 3), now)
            .await
            .unwrap();
        let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["r0", "r1", "r2"]);
    }

    #[tokio::test]
    async fn try_lease_is_exclusive_until_expiry() {
        let store = MemorySourceStore::new();
        let now = Utc::now();
        store.insert(review_at("r1", now)).await;

        let first = store
            .try_lease(WorkKind::Review, "r1", "a", now, now + Duration::seconds(5))
            .await
            .unwrap();
        assert!(first.is_some());

        let second = store
            .try_lease(WorkKind::Review, "r1", "b", now, now + Duration::seconds(5))
            .await
            .unwrap();
        assert!(second.is_none());

        let later = now + Duration::seconds(6);
        let third = store
            .try_lease(WorkKind::Review, "r1", "b", later, later + Duration::seconds(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(third.lease.unwrap().holder, "b");
    }

    #[tokio::test]
    async fn release_requires_matching_holder() {
        let store = MemorySourceStore::new();
        let now = Utc::now();
        store.insert(review_at("r1", now)).await;
        store
            .try_lease(WorkKind::Review, "r1", "a", now, now + Duration::minutes(1))
            .await
            .unwrap();

        assert!(!store
            .release_lease(WorkKind::Review, "r1", "b", ReleaseOutcome::Completed, now)
            .await
            .unwrap());
        assert!(store
            .release_lease(WorkKind::Review, "r1", "a", ReleaseOutcome::Skipped, now)
            .await
            .unwrap());

        let item = store.get(WorkKind::Review, "r1").await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Pending);
        assert!(item.lease.is_none());
        assert_eq!(item.last_skipped_at, Some(now));
    }

    #[tokio::test]
    async fn scan_transitioned_reads_by_activity_from_the_checkpoint() {
        let store = MemorySourceStore::new();
        let created = Utc::now() - Duration::hours(1);
        let start = Utc::now() - Duration::minutes(10);
        let until = Utc::now() + Duration::minutes(30);
        for i in 0..4 {
            let id = format!("r{i}");
            store.insert(review_at(&id, created)).await;
            store
                .try_lease(WorkKind::Review, &id, "a", start + Duration::seconds(i), until)
                .await
                .unwrap();
        }
        store.insert(review_at("idle", created)).await;

        let transitions = |since, limit| TransitionScan {
            active_since: since,
            limit,
            consistency: ReadConsistency::ReplicaPreferred,
        };
        let now = Utc::now();
        let first = store
            .scan_transitioned(WorkKind::Review, &transitions(start, 2), now)
            .await
            .unwrap();
        let ids: Vec<&str> = first.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["r0", "r1"]);

        let resume = first[1].last_activity_at;
        let rest = store
            .scan_transitioned(WorkKind::Review, &transitions(resume, 10), now)
            .await
            .unwrap();
        let ids: Vec<&str> = rest.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r2", "r3"]);
    }

    #[tokio::test]
    async fn kinds_are_separate_collections() {
        let store = MemorySourceStore::new();
        store.insert(review_at("x", Utc::now())).await;
        store
            .insert(WorkItem::new(
                "x",
                "north",
                Payload::Dial(DialPayload {
                    campaign_id: "c1".to_string(),
                    phone: "+15550100".to_string(),
                    language: None,
                    batch_id: None,
                }),
            ))
            .await;
        assert_eq!(store.len(WorkKind::Review).await, 1);
        assert_eq!(store.len(WorkKind::Dial).await, 1);
    }

    #[tokio::test]
    async fn view_index_tracks_availability() {
        let views = MemoryViewStore::new();
        let now = Utc::now();
        let a = ViewEntry::from_item(&review_at("a", now), 2, now);
        let b = ViewEntry::from_item(&review_at("b", now + Duration::seconds(1)), 1, now);

        let outcome = views
            .upsert_batch(WorkKind::Review, vec![a, b])
            .await
            .unwrap();
        assert_eq!(outcome.succeeded, 2);

        let best = views
            .best_available(WorkKind::Review, &ClaimFilter::any(), 10)
            .await
            .unwrap();
        assert_eq!(best[0].source_id, "b");

        views
            .mark(WorkKind::Review, &["b".to_string()], Availability::Leased, now)
            .await
            .unwrap();
        let best = views
            .best_available(WorkKind::Review, &ClaimFilter::any(), 10)
            .await
            .unwrap();
        assert_eq!(best.len(), 1);
        assert_eq!(best[0].source_id, "a");

        let depth = views.depth(WorkKind::Review).await.unwrap();
        assert_eq!(depth.available, 1);
        assert_eq!(depth.leased, 1);
        assert_eq!(depth.by_rank_key.get("north"), Some(&1));
    }

    #[tokio::test]
    async fn upsert_rejects_rows_for_the_wrong_kind() {
        let views = MemoryViewStore::new();
        let now = Utc::now();
        let good = ViewEntry::from_item(&review_at("a", now), 1, now);
        let mut bad = good.clone();
        bad.source_id = "b".to_string();
        bad.kind = WorkKind::Dial;

        let outcome = views
            .upsert_batch(WorkKind::Review, vec![good, bad])
            .await
            .unwrap();
        assert_eq!(outcome.succeeded, 1);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].0, "b");
        assert_eq!(views.len(WorkKind::Review).await, 1);
    }

    #[tokio::test]
    async fn sweep_removes_aged_entries() {
        let views = MemoryViewStore::new();
        let now = Utc::now();
        let old = ViewEntry::from_item(&review_at("old", now), 1, now - Duration::hours(2));
        let fresh = ViewEntry::from_item(&review_at("fresh", now), 1, now);
        views
            .upsert_batch(WorkKind::Review, vec![old, fresh])
            .await
            .unwrap();

        let outcome = views
            .sweep(WorkKind::Review, now - Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(outcome.removed, 1);
        assert_eq!(outcome.removed_available, 1);
        assert!(views.get(WorkKind::Review, "old").await.unwrap().is_none());
        assert!(views.get(WorkKind::Review, "fresh").await.unwrap().is_some());
    }
}
