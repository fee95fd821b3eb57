//! Integration tests for similarity index maintenance
//!
//! These exercise the IVF index through the pipeline:
//! - Full-probe search agrees with the exact scan
//! - Narrow probes trade recall for speed
//! - Builds replay writes that land while training runs
//! - Cancelled builds keep the previous structure

mod common;

use common::{StaticEmbedder, open_pipeline};
use domain_retrieval::*;
use test_utils::{TestDataBuilder, assertions::*};
use tokio::sync::watch;
use uuid::Uuid;

type Pipeline = RetrievalPipeline<InMemoryVectorRepository>;

async fn l2_collection(pipeline: &Pipeline, name: &str, dimension: usize) {
    pipeline
        .create_collection(CreateCollection::new(name, dimension).with_distance(DistanceMetric::L2))
        .await
        .unwrap();
}

async fn seed_random(
    pipeline: &Pipeline,
    builder: &TestDataBuilder,
    name: &str,
    dimension: usize,
    count: usize,
) -> Vec<Uuid> {
    let mut rng = builder.rng();
    let records: Vec<NewRecord> = (0..count)
        .map(|n| NewRecord::new(format!("doc {}", n), builder.vector(&mut rng, dimension)))
        .collect();
    let ids = pipeline.insert_batch(name, records).await.unwrap();
    pipeline.refresh(name).await.unwrap();
    ids
}

#[tokio::test]
async fn test_full_probe_matches_exact_search() {
    let pipeline = open_pipeline(StaticEmbedder::new(8)).await;
    let builder = TestDataBuilder::from_test_name("full_probe");
    l2_collection(&pipeline, "docs", 8).await;
    seed_random(&pipeline, &builder, "docs", 8, 300).await;

    let report = pipeline.build_index("docs", 6).await.unwrap();
    assert_eq!(report.lists, 6);
    assert_eq!(report.entries, 300);

    let mut rng = builder.rng();
    for _ in 0..10 {
        let query = builder.vector(&mut rng, 8);
        let approximate = pipeline.search("docs", &query, 10, 6).await.unwrap();
        let exact = pipeline.exact_search("docs", &query, 10).await.unwrap();
        assert_eq!(approximate, exact);
        let distances: Vec<f32> = exact.iter().map(|h| h.distance).collect();
        assert_ascending(&distances, "exact distances");
    }
}

#[tokio::test]
async fn test_single_probe_can_miss_vector_in_other_list() {
    let pipeline = open_pipeline(StaticEmbedder::new(2)).await;
    let builder = TestDataBuilder::from_test_name("single_probe_miss");
    let mut rng = builder.rng();
    l2_collection(&pipeline, "docs", 2).await;

    let mut records = Vec::new();
    for center in [[10.0, 0.0], [-10.0, 0.0]] {
        for (n, v) in builder.cluster(&mut rng, &center, 1.0, 20).into_iter().enumerate() {
            records.push(NewRecord::new(format!("{:?} {}", center, n), v));
        }
    }
    pipeline.insert_batch("docs", records).await.unwrap();
    pipeline.refresh("docs").await.unwrap();
    pipeline.build_index("docs", 2).await.unwrap();

    let late = pipeline
        .insert("docs", NewRecord::new("late", vec![-10.0, 0.5]))
        .await
        .unwrap();
    pipeline.refresh("docs").await.unwrap();

    let query = [10.0, 0.0];
    let narrow = pipeline.search("docs", &query, 50, 1).await.unwrap();
    assert_eq!(narrow.len(), 20);
    assert!(!narrow.iter().any(|h| h.id == late));

    let exact = pipeline.exact_search("docs", &query, 50).await.unwrap();
    assert_eq!(exact.len(), 41);
    assert!(exact.iter().any(|h| h.id == late));

    let wide = pipeline.search("docs", &query, 50, 2).await.unwrap();
    assert_eq!(wide, exact);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_writes_during_build_are_replayed() {
    let pipeline = open_pipeline(StaticEmbedder::new(16)).await;
    let builder = TestDataBuilder::from_test_name("build_replay");
    l2_collection(&pipeline, "docs", 16).await;
    let seeded = seed_random(&pipeline, &builder, "docs", 16, 2000).await;

    let writer = async {
        let mut rng = TestDataBuilder::new(builder.seed() + 1).rng();
        let mut ids = Vec::new();
        for n in 0..100 {
            let id = pipeline
                .insert(
                    "docs",
                    NewRecord::new(format!("late {}", n), builder.vector(&mut rng, 16)),
                )
                .await
                .unwrap();
            ids.push(id);
            // searches keep working while training runs
            pipeline
                .search("docs", &builder.vector(&mut rng, 16), 5, 1)
                .await
                .unwrap();
            tokio::task::yield_now().await;
        }
        for id in &seeded[..50] {
            pipeline.delete(*id).await.unwrap();
        }
        ids
    };

    let (report, added) = tokio::join!(pipeline.build_index("docs", 16), writer);
    let report = report.unwrap();
    assert_eq!(report.lists, 16);
    pipeline.refresh("docs").await.unwrap();

    let stats = pipeline.stats("docs").await.unwrap();
    assert_eq!(stats.records, 2050);
    assert_eq!(stats.indexed, 2050);
    assert_eq!(stats.lists, 16);

    let everything = pipeline.exact_search("docs", &[0.0; 16], 5000).await.unwrap();
    assert_eq!(everything.len(), 2050);
    for id in &added {
        assert!(everything.iter().any(|h| h.id == *id), "missing {}", id);
    }
    for id in &seeded[..50] {
        assert!(!everything.iter().any(|h| h.id == *id), "resurrected {}", id);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_builds_both_complete() {
    let pipeline = open_pipeline(StaticEmbedder::new(4)).await;
    let builder = TestDataBuilder::from_test_name("concurrent_builds");
    l2_collection(&pipeline, "docs", 4).await;
    seed_random(&pipeline, &builder, "docs", 4, 500).await;

    let (small, large) = tokio::join!(
        pipeline.build_index("docs", 4),
        pipeline.build_index("docs", 8)
    );
    assert_eq!(small.unwrap().entries, 500);
    assert_eq!(large.unwrap().entries, 500);

    let stats = pipeline.stats("docs").await.unwrap();
    assert!(stats.lists == 4 || stats.lists == 8);
    assert_eq!(stats.indexed, 500);
    assert!(stats.last_built_at.is_some());
}

#[tokio::test]
async fn test_cancelled_build_keeps_previous_index() {
    let pipeline = open_pipeline(StaticEmbedder::new(4)).await;
    let builder = TestDataBuilder::from_test_name("cancelled_build");
    l2_collection(&pipeline, "docs", 4).await;
    seed_random(&pipeline, &builder, "docs", 4, 200).await;
    pipeline.build_index("docs", 3).await.unwrap();
    let before = pipeline.stats("docs").await.unwrap();

    let (cancel, cancelled) = watch::channel(false);
    cancel.send(true).unwrap();
    assert!(matches!(
        pipeline.build_index_with_cancel("docs", 10, cancelled).await,
        Err(RetrievalError::Cancelled(_))
    ));

    let after = pipeline.stats("docs").await.unwrap();
    assert_eq!(after.lists, 3);
    assert_eq!(after.indexed, 200);
    assert_eq!(after.last_built_at, before.last_built_at);

    // writes after the cancelled build are not lost to its replay log
    let id = pipeline
        .insert("docs", NewRecord::new("after", vec![5.0, 5.0, 5.0, 5.0]))
        .await
        .unwrap();
    pipeline.refresh("docs").await.unwrap();
    let hits = pipeline.search("docs", &[5.0, 5.0, 5.0, 5.0], 1, 3).await.unwrap();
    assert_uuid_eq(hits[0].id, id, "nearest after cancel");
}

#[tokio::test]
async fn test_build_rejects_zero_lists_and_unknown_collection() {
    let pipeline = open_pipeline(StaticEmbedder::new(2)).await;
    l2_collection(&pipeline, "docs", 2).await;

    assert!(matches!(
        pipeline.build_index("docs", 0).await,
        Err(RetrievalError::InvalidArgument(_))
    ));
    assert!(matches!(
        pipeline.build_index("missing", 2).await,
        Err(RetrievalError::CollectionNotFound(_))
    ));
}

#[tokio::test]
async fn test_default_build_uses_configured_list_count() {
    let pipeline = open_pipeline(StaticEmbedder::new(3)).await;
    let builder = TestDataBuilder::from_test_name("default_build");
    l2_collection(&pipeline, "docs", 3).await;
    seed_random(&pipeline, &builder, "docs", 3, 50).await;

    let report = pipeline.build_index_default("docs").await.unwrap();
    assert_eq!(report.lists, pipeline.config().index.list_count);
    assert_eq!(report.replayed, 0);
}
