//! Dashboard overview against a populated store

use std::sync::Arc;

use memlens_core::{AttributionConfig, Embedder, HashEmbedder};
use memlens_observe::overview;
use memlens_store::{MemLensStore, MemoryCreate, SingleShotRequest, TransactionProtocol};

#[tokio::test]
async fn overview_aggregates_per_agent_and_globally() {
    let store = Arc::new(MemLensStore::open_in_memory(AttributionConfig::default()).unwrap());
    let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(64));
    let protocol = TransactionProtocol::new(store.clone(), embedder.clone());

    // Two agents with their own memories and transactions.
    for (agent, notes) in [
        ("agent-a", vec!["first note", "second note"]),
        ("agent-b", vec!["solo note"]),
    ] {
        let mut ids = Vec::new();
        for note in notes {
            let memory = store
                .create_memory(
                    embedder.as_ref(),
                    MemoryCreate::new(note, "owner").with_agent(agent),
                )
                .await
                .unwrap();
            ids.push(memory.id);
        }
        protocol
            .single_shot(SingleShotRequest::new(
                "a question",
                "an answer",
                ids,
                agent,
            ))
            .await
            .unwrap();
    }
    store
        .record_contradiction(
            store
                .list_memories(&Default::default())
                .unwrap()
                .0[0]
                .id,
            uuid::Uuid::now_v7(),
            "logical",
            0.7,
        )
        .unwrap();

    let dashboard = overview(&store).unwrap();
    assert_eq!(dashboard.agents.len(), 2);
    assert_eq!(dashboard.total_memories, 3);
    assert_eq!(dashboard.total_transactions, 2);
    assert_eq!(dashboard.total_attributions, 3);
    assert!((0.0..=1.0).contains(&dashboard.overall_gini));
    assert!(dashboard.overall_snr_db.is_finite());

    let agent_a = dashboard
        .agents
        .iter()
        .find(|a| a.agent_id == "agent-a")
        .unwrap();
    assert_eq!(agent_a.total_memories, 2);
    assert_eq!(agent_a.total_transactions, 1);
    assert!(agent_a.avg_attribution > 0.0);
    assert_eq!(agent_a.tier_distribution["warm"], 2);
    assert!(agent_a.token_usage.input > 0);
    assert!(agent_a.last_active.is_some());

    // EAS scores sum to 1 per transaction, so nothing is wasted only if all
    // scores clear the threshold; either way the rate is a valid percentage.
    assert!((0.0..=100.0).contains(&agent_a.waste_rate));
}

#[tokio::test]
async fn overview_of_empty_store_is_zeroed() {
    let store = MemLensStore::open_in_memory(AttributionConfig::default()).unwrap();
    let dashboard = overview(&store).unwrap();
    assert!(dashboard.agents.is_empty());
    assert_eq!(dashboard.total_memories, 0);
    assert_eq!(dashboard.overall_gini, 0.0);
}
