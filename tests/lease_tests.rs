//! Lease protocol tests: exclusive claims, ordering, release semantics and
//! lazy reclaim of expired leases.


use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use assign_lite::item::{ItemStatus, ReleaseOutcome, WorkKind};
use assign_lite::store::SourceStore;
use assign_lite::view::{Availability, ClaimFilter};
use test_harness::{drain, review_item, spaced, TestQueue};

const LONG_LEASE: Duration = Duration::from_secs(30 * 60);

#[tokio::test]
async fn test_claims_follow_priority_then_fifo() {
    let queue = TestQueue::new();
    let base = Utc::now() - chrono::Duration::minutes(10);
    queue
        .seed([
            review_item("a", "p2", spaced(base, 0)),
            review_item("b", "p1", spaced(base, 1)),
            review_item("c", "p1", spaced(base, 2)),
            review_item("d", "p2", spaced(base, 3)),
        ])
        .await;
    queue.refresh(WorkKind::Review).await;

    let manager = queue.lease_manager(LONG_LEASE);
    let order = drain(&manager, WorkKind::Review, "agent-1").await;
    assert_eq!(order, vec!["b", "c", "a", "d"]);
}

#[tokio::test]
async fn test_empty_queue_returns_none() {
    let queue = TestQueue::new();
    let manager = queue.lease_manager(LONG_LEASE);

    let claimed = manager
        .claim_next(WorkKind::Review, &ClaimFilter::any(), "agent-1")
        .await
        .unwrap();
    assert!(claimed.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_item_goes_to_exactly_one_claimant() {
    let queue = Arc::new(TestQueue::new());
    queue
        .seed([review_item("only", "p1", Utc::now() - chrono::Duration::minutes(1))])
        .await;
    queue.refresh(WorkKind::Review).await;

    let mut handles = Vec::new();
    for i in 0..16 {
        let manager = queue.lease_manager(LONG_LEASE);
        handles.push(tokio::spawn(async move {
            manager
                .claim_next(WorkKind::Review, &ClaimFilter::any(), &format!("agent-{i}"))
                .await
                .unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_instances_never_share_an_item() {
    let queue = Arc::new(TestQueue::new());
    let base = Utc::now() - chrono::Duration::minutes(30);
    queue
        .seed((0..60).map(|i| {
            let region = ["p1", "p2", "p3"][i % 3];
            review_item(&format!("r{i}"), region, spaced(base, i as i64))
        }))
        .await;
    queue.refresh(WorkKind::Review).await;

    // 3 simulated instances, each with 4 agents claiming until empty.
    let mut handles = Vec::new();
    for instance in 0..3 {
        let manager = queue.lease_manager(LONG_LEASE);
        for agent in 0..4 {
            let manager = manager.clone();
            let holder = format!("instance-{instance}/agent-{agent}");
            handles.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                while let Some(item) = manager
                    .claim_next(WorkKind::Review, &ClaimFilter::any(), &holder)
                    .await
                    .unwrap()
                {
                    mine.push((item.id, holder.clone()));
                }
                mine
            }));
        }
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for (id, holder) in handle.await.unwrap() {
            assert!(seen.insert(id.clone()), "item {id} leased twice");
            let item = queue.item(WorkKind::Review, &id).await;
            assert_eq!(item.status, ItemStatus::Leased);
            assert_eq!(item.lease.unwrap().holder, holder);
        }
    }
    assert!(!seen.is_empty());
}

#[tokio::test]
async fn test_expired_lease_is_reclaimable_without_cleanup() {
    let queue = TestQueue::new();
    queue
        .seed([review_item("r1", "p1", Utc::now() - chrono::Duration::minutes(1))])
        .await;
    queue.refresh(WorkKind::Review).await;

    let manager = queue.lease_manager(Duration::from_secs(1));
    let first = manager
        .claim_next(WorkKind::Review, &ClaimFilter::any(), "agent-a")
        .await
        .unwrap();
    assert_eq!(first.map(|i| i.id), Some("r1".to_string()));

    let blocked = manager
        .claim_next(WorkKind::Review, &ClaimFilter::any(), "agent-b")
        .await
        .unwrap();
    assert!(blocked.is_none());

    tokio::time::sleep(Duration::from_millis(1100)).await;
    // The leader's next cycle offers the lapsed item again.
    queue.refresh(WorkKind::Review).await;

    let reclaimed = manager
        .claim_next(WorkKind::Review, &ClaimFilter::any(), "agent-b")
        .await
        .unwrap()
        .expect("expired lease should be reclaimable");
    assert_eq!(reclaimed.id, "r1");
    assert_eq!(reclaimed.lease.unwrap().holder, "agent-b");

    // The original holder can no longer release it.
    let stale_release = manager
        .release(WorkKind::Review, "r1", "agent-a", ReleaseOutcome::Completed)
        .await
        .unwrap();
    assert!(!stale_release);
    assert_eq!(queue.item(WorkKind::Review, "r1").await.status, ItemStatus::Leased);
}

#[tokio::test]
async fn test_release_is_idempotent() {
    let queue = TestQueue::new();
    queue
        .seed([review_item("r1", "p1", Utc::now() - chrono::Duration::minutes(1))])
        .await;
    queue.refresh(WorkKind::Review).await;

    let manager = queue.lease_manager(LONG_LEASE);
    manager
        .claim_next(WorkKind::Review, &ClaimFilter::any(), "agent-1")
        .await
        .unwrap()
        .unwrap();

    assert!(manager
        .release(WorkKind::Review, "r1", "agent-1", ReleaseOutcome::Completed)
        .await
        .unwrap());
    let after_first = queue.item(WorkKind::Review, "r1").await;

    assert!(!manager
        .release(WorkKind::Review, "r1", "agent-1", ReleaseOutcome::Completed)
        .await
        .unwrap());
    let after_second = queue.item(WorkKind::Review, "r1").await;

    assert_eq!(after_first, after_second);
    assert_eq!(after_second.status, ItemStatus::Resolved);
    assert!(after_second.lease.is_none());
}

#[tokio::test]
async fn test_release_of_unknown_item_is_a_noop() {
    let queue = TestQueue::new();
    let manager = queue.lease_manager(LONG_LEASE);
    assert!(!manager
        .release(WorkKind::Dial, "missing", "agent-1", ReleaseOutcome::Abandoned)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_skipped_item_sinks_behind_its_tier() {
    let queue = TestQueue::new();
    let base = Utc::now() - chrono::Duration::minutes(10);
    queue
        .seed([
            review_item("first", "p1", spaced(base, 0)),
            review_item("second", "p1", spaced(base, 1)),
        ])
        .await;
    queue.refresh(WorkKind::Review).await;

    let manager = queue.lease_manager(LONG_LEASE);
    let claimed = manager
        .claim_next(WorkKind::Review, &ClaimFilter::any(), "agent-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, "first");
    assert!(manager
        .release(WorkKind::Review, "first", "agent-1", ReleaseOutcome::Skipped)
        .await
        .unwrap());

    let skipped = queue.item(WorkKind::Review, "first").await;
    assert_eq!(skipped.status, ItemStatus::Pending);
    assert!(skipped.last_skipped_at.is_some());
    assert_eq!(
        queue.view_entry(WorkKind::Review, "first").await.unwrap().queued_at,
        skipped.last_skipped_at.unwrap()
    );

    let next = manager
        .claim_next(WorkKind::Review, &ClaimFilter::any(), "agent-2")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next.id, "second");

    let after = manager
        .claim_next(WorkKind::Review, &ClaimFilter::any(), "agent-3")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.id, "first");
}

#[tokio::test]
async fn test_abandoned_item_keeps_its_place() {
    let queue = TestQueue::new();
    let base = Utc::now() - chrono::Duration::minutes(10);
    queue
        .seed([
            review_item("first", "p1", spaced(base, 0)),
            review_item("second", "p1", spaced(base, 1)),
        ])
        .await;
    queue.refresh(WorkKind::Review).await;

    let manager = queue.lease_manager(LONG_LEASE);
    manager
        .claim_next(WorkKind::Review, &ClaimFilter::any(), "agent-1")
        .await
        .unwrap()
        .unwrap();
    assert!(manager
        .release(WorkKind::Review, "first", "agent-1", ReleaseOutcome::Abandoned)
        .await
        .unwrap());

    let next = manager
        .claim_next(WorkKind::Review, &ClaimFilter::any(), "agent-2")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next.id, "first");
    assert!(queue.item(WorkKind::Review, "first").await.last_skipped_at.is_none());
}

#[tokio::test]
async fn test_skip_never_hands_the_item_straight_back() {
    let queue = TestQueue::new();
    let base = Utc::now() - chrono::Duration::minutes(10);
    queue
        .seed([
            review_item("tricky", "p1", spaced(base, 0)),
            review_item("plain-1", "p1", spaced(base, 1)),
            review_item("plain-2", "p2", spaced(base, 2)),
        ])
        .await;
    queue.refresh(WorkKind::Review).await;

    let manager = queue.lease_manager(LONG_LEASE);
    let item = manager
        .claim_next(WorkKind::Review, &ClaimFilter::any(), "agent-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(item.id, "tricky");
    assert!(manager
        .release(WorkKind::Review, "tricky", "agent-1", ReleaseOutcome::Skipped)
        .await
        .unwrap());

    // No refresh in between: the very next claim already passes it over.
    let next = manager
        .claim_next(WorkKind::Review, &ClaimFilter::any(), "agent-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next.id, "plain-1");

    // The skip only reorders within its tier.
    let after = manager
        .claim_next(WorkKind::Review, &ClaimFilter::any(), "agent-3")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.id, "tricky");
}

#[tokio::test]
async fn test_claims_within_one_refresh_interval_reach_every_item() {
    let queue = TestQueue::new();
    let base = Utc::now() - chrono::Duration::minutes(30);
    queue
        .seed((0..20).map(|i| review_item(&format!("r{i}"), "p1", spaced(base, i))))
        .await;
    queue.refresh(WorkKind::Review).await;

    let manager = queue.lease_manager(LONG_LEASE);
    let mut claimed = Vec::new();
    for agent in 0..20 {
        let item = manager
            .claim_next(WorkKind::Review, &ClaimFilter::any(), &format!("agent-{agent}"))
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("agent-{agent} found the queue empty"));
        claimed.push(item.id);
    }

    let expected: Vec<String> = (0..20).map(|i| format!("r{i}")).collect();
    assert_eq!(claimed, expected);
    assert!(manager
        .claim_next(WorkKind::Review, &ClaimFilter::any(), "agent-20")
        .await
        .unwrap()
        .is_none());

    let depth = manager.queue_depth(WorkKind::Review).await.unwrap();
    assert_eq!(depth.available, 0);
    assert_eq!(depth.leased, 20);
}

#[tokio::test]
async fn test_lost_candidates_leave_the_available_index() {
    let queue = TestQueue::new();
    let base = Utc::now() - chrono::Duration::minutes(10);
    queue
        .seed([
            review_item("taken", "p1", spaced(base, 0)),
            review_item("finished", "p1", spaced(base, 1)),
            review_item("free", "p1", spaced(base, 2)),
        ])
        .await;
    queue.refresh(WorkKind::Review).await;

    // Another instance works from the same view before the next refresh.
    let other = queue.lease_manager(LONG_LEASE);
    let now = Utc::now();
    let until = now + chrono::Duration::minutes(30);
    queue
        .source
        .try_lease(WorkKind::Review, "taken", "elsewhere", now, until)
        .await
        .unwrap()
        .unwrap();
    queue
        .source
        .try_lease(WorkKind::Review, "finished", "elsewhere", now, until)
        .await
        .unwrap()
        .unwrap();
    queue
        .source
        .release_lease(WorkKind::Review, "finished", "elsewhere", ReleaseOutcome::Completed, now)
        .await
        .unwrap();

    let item = other
        .claim_next(WorkKind::Review, &ClaimFilter::any(), "agent-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(item.id, "free");
    assert_eq!(
        queue.view_entry(WorkKind::Review, "taken").await.unwrap().availability,
        Availability::Leased
    );
    assert!(queue.view_entry(WorkKind::Review, "finished").await.is_none());
}

#[tokio::test]
async fn test_filter_narrows_candidates() {
    let queue = TestQueue::new();
    let base = Utc::now() - chrono::Duration::minutes(10);
    queue
        .seed([
            review_item("urgent", "p1", spaced(base, 0)),
            review_item("later", "p3", spaced(base, 1)),
        ])
        .await;
    queue.refresh(WorkKind::Review).await;

    let manager = queue.lease_manager(LONG_LEASE);
    let item = manager
        .claim_next(
            WorkKind::Review,
            &ClaimFilter::any().with_rank_key("P3"),
            "agent-1",
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(item.id, "later");

    let none = manager
        .claim_next(
            WorkKind::Review,
            &ClaimFilter::any().with_locale("fr"),
            "agent-1",
        )
        .await
        .unwrap();
    assert!(none.is_none());
}

#[tokio::test]
async fn test_renew_only_by_holder() {
    let queue = TestQueue::new();
    queue
        .seed([review_item("r1", "p1", Utc::now() - chrono::Duration::minutes(1))])
        .await;
    queue.refresh(WorkKind::Review).await;

    let manager = queue.lease_manager(Duration::from_secs(60));
    let item = manager
        .claim_next(WorkKind::Review, &ClaimFilter::any(), "agent-1")
        .await
        .unwrap()
        .unwrap();
    let first_expiry = item.lease.unwrap().expires_at;

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(manager.renew(WorkKind::Review, "r1", "agent-1").await.unwrap());
    assert!(!manager.renew(WorkKind::Review, "r1", "agent-2").await.unwrap());

    let renewed = queue.item(WorkKind::Review, "r1").await;
    assert!(renewed.lease.unwrap().expires_at > first_expiry);
}

#[tokio::test]
async fn test_inspect_clears_lapsed_lease() {
    let queue = TestQueue::new();
    queue
        .seed([review_item("r1", "p1", Utc::now() - chrono::Duration::minutes(1))])
        .await;
    queue.refresh(WorkKind::Review).await;

    let manager = queue.lease_manager(Duration::from_millis(200));
    manager
        .claim_next(WorkKind::Review, &ClaimFilter::any(), "agent-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(queue.item(WorkKind::Review, "r1").await.status, ItemStatus::Leased);

    tokio::time::sleep(Duration::from_millis(300)).await;

    let inspected = manager.inspect(WorkKind::Review, "r1").await.unwrap().unwrap();
    assert_eq!(inspected.status, ItemStatus::Pending);
    assert!(inspected.lease.is_none());
    assert!(!manager.renew(WorkKind::Review, "r1", "agent-1").await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_callers_take_the_two_most_urgent() {
    let queue = Arc::new(TestQueue::new());
    let base = Utc::now() - chrono::Duration::minutes(10);
    queue
        .seed([
            review_item("prio-3", "p3", spaced(base, 0)),
            review_item("prio-1", "p1", spaced(base, 1)),
            review_item("prio-2", "p2", spaced(base, 2)),
        ])
        .await;
    queue.refresh(WorkKind::Review).await;

    let a = queue.lease_manager(LONG_LEASE);
    let b = queue.lease_manager(LONG_LEASE);
    let (first, second) = tokio::join!(
        async move {
            a.claim_next(WorkKind::Review, &ClaimFilter::any(), "caller-a")
                .await
                .unwrap()
        },
        async move {
            b.claim_next(WorkKind::Review, &ClaimFilter::any(), "caller-b")
                .await
                .unwrap()
        },
    );

    let got: HashSet<String> = [first.unwrap().id, second.unwrap().id].into_iter().collect();
    let expected: HashSet<String> = ["prio-1".to_string(), "prio-2".to_string()]
        .into_iter()
        .collect();
    assert_eq!(got, expected);

    queue.refresh(WorkKind::Review).await;
    let untouched = queue.view_entry(WorkKind::Review, "prio-3").await.unwrap();
    assert_eq!(untouched.availability, Availability::Available);
    assert_eq!(
        queue.view_entry(WorkKind::Review, "prio-1").await.unwrap().availability,
        Availability::Leased
    );
}
