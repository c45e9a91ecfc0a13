//! Contract Test: Reconciliation Convergence
//!
//! One reconciliation run makes the boundary's managed rules for a scope
//! equal the stored desired set, whatever the starting state.
//!
//! Constraints verified:
//! - Missing rules are added and dropped ranges removed
//! - Unmanaged rules and rules of other scopes are never touched
//! - Stale records are pruned once their rule is gone
//! - A failed rule listing aborts the run without side effects
//! - A scope the store knows nothing about is never emptied
//! - A dry run keeps every record it only planned to change

mod common;

use common::*;
use rangesync_core::config::ReconcileConfig;
use rangesync_core::model::{Cidr, SyncToken};
use rangesync_core::traits::{ChangeNotification, RangeStore, managed_tag};
use rangesync_core::{Error, Ingestor, MemoryRangeStore, RangeRecord, Reconciler};
use std::collections::BTreeSet;
use std::sync::Arc;

fn reconciler(store: &MemoryRangeStore, boundary: &Arc<MemoryBoundary>) -> Reconciler {
    Reconciler::new(
        Arc::new(store.clone()),
        boundary.clone(),
        reconcile_config(),
    )
    .expect("reconciler construction succeeds")
}

fn tag_ec2() -> String {
    managed_tag(TAG_PREFIX, &ec2())
}

fn set(cidrs: &[&str]) -> BTreeSet<Cidr> {
    cidrs.iter().map(|c| cidr(c)).collect()
}

async fn ingest(feed: &Arc<StaticFeed>, store: &MemoryRangeStore) {
    Ingestor::new(
        feed.clone(),
        Arc::new(store.clone()),
        [ec2(), s3()],
        &ingest_config(),
    )
    .unwrap()
    .ingest(&ChangeNotification::empty())
    .await
    .unwrap();
}

#[tokio::test]
async fn stored_range_is_added_to_the_boundary() {
    // Store has {A: [10.0.0.0/24]}, boundary has nothing tracked
    let feed = StaticFeed::new(document(Some(100), &[(ec2(), "10.0.0.0/24")]));
    let store = MemoryRangeStore::new();
    let boundary = MemoryBoundary::new();
    ingest(&feed, &store).await;

    let result = reconciler(&store, &boundary).reconcile(&ec2()).await.unwrap();

    assert_eq!(result.added, 1);
    assert_eq!(result.removed, 0);
    assert!(result.is_converged());
    assert_eq!(boundary.cidrs(&tag_ec2()), set(&["10.0.0.0/24"]));
}

#[tokio::test]
async fn replaced_range_swaps_the_rule() {
    let feed = StaticFeed::new(document(Some(100), &[(ec2(), "10.0.0.0/24")]));
    let store = MemoryRangeStore::new();
    let boundary = MemoryBoundary::new();
    let reconciler = reconciler(&store, &boundary);

    ingest(&feed, &store).await;
    reconciler.reconcile(&ec2()).await.unwrap();

    // Feed updates to {A: [10.0.1.0/24]}
    feed.publish(document(Some(200), &[(ec2(), "10.0.1.0/24")]));
    ingest(&feed, &store).await;
    let result = reconciler.reconcile(&ec2()).await.unwrap();

    assert_eq!(result.added, 1);
    assert_eq!(result.removed, 1);
    assert_eq!(result.pruned, 1);
    assert_eq!(boundary.cidrs(&tag_ec2()), set(&["10.0.1.0/24"]));

    // The store now mirrors the boundary
    let records = store.query_scope(&ec2()).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].sync_token, SyncToken(200));
}

#[tokio::test]
async fn converges_from_an_arbitrary_start() {
    let feed = StaticFeed::new(document(
        Some(100),
        &[(ec2(), "10.0.1.0/24"), (ec2(), "10.0.2.0/24")],
    ));
    let store = MemoryRangeStore::new();
    let boundary = MemoryBoundary::new();
    boundary.seed(cidr("10.0.0.0/24"), &tag_ec2());
    boundary.seed(cidr("10.0.1.0/24"), &tag_ec2());
    ingest(&feed, &store).await;

    let reconciler = reconciler(&store, &boundary);
    let result = reconciler.reconcile(&ec2()).await.unwrap();

    assert_eq!(result.added, 1);
    assert_eq!(result.removed, 1);
    assert_eq!(result.unchanged, 1);
    assert_eq!(
        boundary.cidrs(&tag_ec2()),
        set(&["10.0.1.0/24", "10.0.2.0/24"])
    );

    // A second run finds nothing to do
    let again = reconciler.reconcile(&ec2()).await.unwrap();
    assert_eq!((again.added, again.removed, again.unchanged), (0, 0, 2));
}

#[tokio::test]
async fn unmanaged_and_foreign_rules_are_untouched() {
    let feed = StaticFeed::new(document(Some(100), &[(s3(), "52.95.0.0/16")]));
    let store = MemoryRangeStore::new();
    let boundary = MemoryBoundary::new();
    boundary.seed(cidr("10.0.0.0/24"), "office vpn");
    boundary.seed(cidr("52.95.0.0/16"), &managed_tag(TAG_PREFIX, &s3()));
    boundary.seed(cidr("192.0.2.0/24"), "other-tool:us-west-2#EC2");
    ingest(&feed, &store).await;

    // EC2 has no stored ranges at all
    let result = reconciler(&store, &boundary).reconcile(&ec2()).await.unwrap();

    assert_eq!((result.added, result.removed), (0, 0));
    assert_eq!(boundary.remove_count(), 0);
    assert_eq!(boundary.rule_count(), 3);
}

#[tokio::test]
async fn scope_dropped_from_feed_is_emptied() {
    let feed = StaticFeed::new(document(
        Some(100),
        &[(ec2(), "10.0.0.0/24"), (s3(), "52.95.0.0/16")],
    ));
    let store = MemoryRangeStore::new();
    let boundary = MemoryBoundary::new();
    boundary.seed(cidr("10.9.0.0/16"), "office vpn");
    let reconciler = reconciler(&store, &boundary);

    ingest(&feed, &store).await;
    reconciler.reconcile(&ec2()).await.unwrap();

    // The feed stops publishing EC2 ranges
    feed.publish(document(Some(200), &[(s3(), "52.95.0.0/16")]));
    ingest(&feed, &store).await;
    let result = reconciler.reconcile(&ec2()).await.unwrap();

    assert_eq!(result.removed, 1);
    assert_eq!(result.pruned, 1);
    assert!(boundary.cidrs(&tag_ec2()).is_empty());
    assert!(store.query_scope(&ec2()).await.unwrap().is_empty());
    assert_eq!(boundary.cidrs("office vpn"), set(&["10.9.0.0/16"]));
}

#[tokio::test]
async fn removal_grace_keeps_dropped_ranges() {
    let feed = StaticFeed::new(document(Some(100), &[(ec2(), "10.0.0.0/24")]));
    let store = MemoryRangeStore::new();
    let boundary = MemoryBoundary::new();
    let reconciler = Reconciler::new(
        Arc::new(store.clone()),
        boundary.clone(),
        ReconcileConfig {
            removal_grace_secs: 3600,
            ..reconcile_config()
        },
    )
    .unwrap();

    ingest(&feed, &store).await;
    reconciler.reconcile(&ec2()).await.unwrap();

    feed.publish(document(Some(200), &[(ec2(), "10.0.1.0/24")]));
    ingest(&feed, &store).await;
    let result = reconciler.reconcile(&ec2()).await.unwrap();

    assert_eq!(result.added, 1);
    assert_eq!(result.removed, 0, "dropped range is within the grace period");
    assert_eq!(result.pruned, 0);
    assert_eq!(
        boundary.cidrs(&tag_ec2()),
        set(&["10.0.0.0/24", "10.0.1.0/24"])
    );
}

#[tokio::test]
async fn records_without_completed_batch_are_still_desired() {
    // Ingestion crashed before marking the batch complete
    let store = MemoryRangeStore::new();
    store
        .put_record(&RangeRecord::new(ec2(), cidr("10.0.0.0/24"), SyncToken(100)))
        .await
        .unwrap();
    let boundary = MemoryBoundary::new();

    let result = reconciler(&store, &boundary).reconcile(&ec2()).await.unwrap();

    assert_eq!(result.added, 1);
    assert_eq!(result.pruned, 0);
}

#[tokio::test]
async fn empty_store_never_strips_managed_rules() {
    // Fresh or lost store: no records and no completed batch for EC2
    let store = MemoryRangeStore::new();
    let boundary = MemoryBoundary::new();
    boundary.seed(cidr("10.0.0.0/24"), &tag_ec2());

    let err = reconciler(&store, &boundary)
        .reconcile(&ec2())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Store(_)));
    assert_eq!(boundary.remove_count(), 0);
    assert_eq!(boundary.cidrs(&tag_ec2()), set(&["10.0.0.0/24"]));
}

#[tokio::test]
async fn dry_run_keeps_records_it_did_not_apply() {
    let feed = StaticFeed::new(document(Some(100), &[(ec2(), "10.0.0.0/24")]));
    let store = MemoryRangeStore::new();
    let boundary = MemoryBoundary::new();
    let reconciler = reconciler(&store, &boundary);

    ingest(&feed, &store).await;
    reconciler.reconcile(&ec2()).await.unwrap();

    feed.publish(document(Some(200), &[(ec2(), "10.0.1.0/24")]));
    ingest(&feed, &store).await;

    boundary.set_dry_run(true);
    let planned = reconciler.reconcile(&ec2()).await.unwrap();

    assert_eq!(planned.planned, 2);
    assert_eq!((planned.added, planned.removed, planned.pruned), (0, 0, 0));
    assert!(!planned.is_converged());
    assert_eq!(store.query_scope(&ec2()).await.unwrap().len(), 2);
    assert_eq!(boundary.cidrs(&tag_ec2()), set(&["10.0.0.0/24"]));

    // Leaving dry-run applies what was planned
    boundary.set_dry_run(false);
    let applied = reconciler.reconcile(&ec2()).await.unwrap();

    assert_eq!((applied.added, applied.removed, applied.pruned), (1, 1, 1));
    assert!(applied.is_converged());
    assert_eq!(boundary.cidrs(&tag_ec2()), set(&["10.0.1.0/24"]));
}

#[tokio::test]
async fn failed_listing_aborts_without_side_effects() {
    let feed = StaticFeed::new(document(Some(100), &[(ec2(), "10.0.0.0/24")]));
    let store = MemoryRangeStore::new();
    let boundary = MemoryBoundary::new();
    boundary.fail_listing();
    ingest(&feed, &store).await;

    let err = reconciler(&store, &boundary)
        .reconcile(&ec2())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Provider { .. }));
    assert_eq!(boundary.add_count(), 0);
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn hanging_boundary_is_bounded_by_the_apply_timeout() {
    let store = MemoryRangeStore::new();
    let reconciler = Reconciler::new(
        Arc::new(store.clone()),
        Arc::new(HangingBoundary),
        reconcile_config(),
    )
    .unwrap();

    let err = reconciler.reconcile(&ec2()).await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));

    // The lease was released despite the failure
    assert!(
        store
            .acquire_lease(&ec2(), "next", std::time::Duration::from_secs(5))
            .await
            .unwrap()
    );
}
