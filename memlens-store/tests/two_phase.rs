//! Two-phase protocol equivalence tests
//!
//! The core guarantee: for identical (memories, query, response) inputs the
//! single-shot and two-phase paths produce byte-identical score vectors,
//! even when memories are soft-deleted between initiate and complete.

use std::sync::Arc;

use uuid::Uuid;

use memlens_core::{AttributionConfig, Embedder, FixedEmbedder, HashEmbedder};
use memlens_store::{
    InitiateRequest, MemLensStore, MemoryCreate, SingleShotRequest, StoreError,
    TransactionProtocol,
};

async fn seeded_protocol(
    embedder: Arc<dyn Embedder>,
    contents: &[&str],
    owner: &str,
) -> (TransactionProtocol, Vec<Uuid>) {
    let store = Arc::new(MemLensStore::open_in_memory(AttributionConfig::default()).unwrap());
    let mut ids = Vec::new();
    for content in contents {
        let memory = store
            .create_memory(embedder.as_ref(), MemoryCreate::new(*content, owner))
            .await
            .unwrap();
        ids.push(memory.id);
    }
    (TransactionProtocol::new(store, embedder), ids)
}

#[tokio::test]
async fn two_phase_equals_single_shot_under_deletion() {
    let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(384));
    let (protocol, ids) = seeded_protocol(
        embedder,
        &["alpha memory", "beta memory", "gamma memory"],
        "user-e",
    )
    .await;
    let query = "which memory matters";
    let response = "beta matters most";

    // Single-shot while every memory is still alive.
    let single = protocol
        .single_shot(SingleShotRequest::new(query, response, ids.clone(), "agent"))
        .await
        .unwrap();

    // Initiate, soft-delete the middle memory between phases, then complete.
    let txn_id = protocol
        .initiate(InitiateRequest::new(query, ids.clone(), "agent"))
        .await
        .unwrap();
    protocol.store().soft_delete_memory(ids[1]).unwrap();
    let two_phase = protocol.complete(txn_id, response, None).await.unwrap();

    assert_eq!(single.scores.len(), 3);
    assert_eq!(two_phase.scores.len(), 3);
    for (a, b) in single.scores.iter().zip(two_phase.scores.iter()) {
        assert_eq!(a.memory_id, b.memory_id);
        assert_eq!(
            a.score.to_bits(),
            b.score.to_bits(),
            "snapshot isolation must keep scores byte-identical"
        );
        assert_eq!(a.raw_score.to_bits(), b.raw_score.to_bits());
    }
}

#[tokio::test]
async fn scores_follow_request_order() {
    let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(128));
    let (protocol, ids) = seeded_protocol(embedder, &["one", "two", "three"], "user-o").await;

    let forward = protocol
        .single_shot(SingleShotRequest::new("q", "r", ids.clone(), "agent"))
        .await
        .unwrap();
    let reversed_ids: Vec<Uuid> = ids.iter().rev().copied().collect();
    let reversed = protocol
        .single_shot(SingleShotRequest::new("q", "r", reversed_ids.clone(), "agent"))
        .await
        .unwrap();

    let forward_order: Vec<Uuid> = forward.scores.iter().map(|s| s.memory_id).collect();
    let reversed_order: Vec<Uuid> = reversed.scores.iter().map(|s| s.memory_id).collect();
    assert_eq!(forward_order, ids);
    assert_eq!(reversed_order, reversed_ids);

    // Per-memory values are independent of the request ordering.
    for score in &forward.scores {
        let twin = reversed
            .scores
            .iter()
            .find(|s| s.memory_id == score.memory_id)
            .unwrap();
        assert_eq!(score.score.to_bits(), twin.score.to_bits());
    }
}

#[tokio::test]
async fn eas_ranks_toy_vectors_as_expected() {
    // Basis-vector memories; the query and response both lean on the second
    // axis hardest, then the first, and barely touch the third.
    let embedder: Arc<dyn Embedder> = Arc::new(
        FixedEmbedder::new(4)
            .insert("m1", &[1.0, 0.0, 0.0, 0.0])
            .insert("m2", &[0.0, 1.0, 0.0, 0.0])
            .insert("m3", &[0.0, 0.0, 1.0, 0.0])
            .insert("the query", &[0.6, 0.8, 0.0, 0.0])
            .insert("the response", &[0.5, 0.9, 0.1, 0.0]),
    );
    let (protocol, ids) = seeded_protocol(embedder, &["m1", "m2", "m3"], "user-a").await;

    let result = protocol
        .single_shot(SingleShotRequest::new(
            "the query",
            "the response",
            ids.clone(),
            "agent",
        ))
        .await
        .unwrap();

    let scores: Vec<f64> = result.scores.iter().map(|s| s.score).collect();
    assert!(scores.iter().all(|s| *s >= 0.0));
    assert!((scores.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    assert!(scores[1] > scores[0], "m2 should outrank m1: {scores:?}");
    assert!(scores[0] > scores[2], "m1 should outrank m3: {scores:?}");
}

#[tokio::test]
async fn complete_is_idempotent_and_unknown_fails() {
    let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(64));
    let (protocol, ids) = seeded_protocol(embedder, &["only"], "user-i").await;

    let txn_id = protocol
        .initiate(InitiateRequest::new("q", ids, "agent"))
        .await
        .unwrap();
    let first = protocol.complete(txn_id, "resp", None).await.unwrap();
    let second = protocol.complete(txn_id, "resp", None).await.unwrap();
    assert_eq!(first.scores[0].id, second.scores[0].id);

    assert!(matches!(
        protocol.complete(Uuid::now_v7(), "resp", None).await,
        Err(StoreError::UnknownTransaction(_))
    ));
}

#[tokio::test]
async fn welford_profiles_match_score_history() {
    let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(64));
    let (protocol, ids) = seeded_protocol(embedder, &["tracked", "other"], "user-w").await;

    let queries = ["first question", "second question", "third question"];
    for query in queries {
        protocol
            .single_shot(SingleShotRequest::new(query, "an answer", ids.clone(), "agent"))
            .await
            .unwrap();
    }

    let store = protocol.store();
    let (history, profile) = store.attribution_by_memory(ids[0]).unwrap();
    let profile = profile.unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(profile.retrieval_count, 3);

    let mean = history.iter().map(|s| s.score).sum::<f64>() / 3.0;
    assert!((profile.mean_attribution - mean).abs() < 1e-9);
    let variance = history
        .iter()
        .map(|s| (s.score - mean).powi(2))
        .sum::<f64>()
        / 2.0;
    assert!((profile.variance() - variance).abs() < 1e-9);
}
