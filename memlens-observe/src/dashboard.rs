//! Dashboard aggregates: per-agent summaries and the global overview

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

use memlens_store::{MemLensStore, MemoryFilter, Result};

use crate::metrics::{gini, snr_db, token_waste_rate};

/// Token totals for one agent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
}

/// Aggregates for one agent's memory portfolio
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSummary {
    pub agent_id: String,
    pub total_memories: u64,
    pub total_transactions: u64,
    pub avg_attribution: f64,
    pub tier_distribution: HashMap<String, u64>,
    pub token_usage: TokenUsage,
    pub gini_coefficient: f64,
    pub snr_db: f64,
    pub waste_rate: f64,
    pub contradiction_count: u64,
    pub last_active: Option<chrono::DateTime<chrono::Utc>>,
}

/// Global dashboard payload
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DashboardOverview {
    pub agents: Vec<AgentSummary>,
    pub total_memories: u64,
    pub total_transactions: u64,
    pub total_attributions: u64,
    pub overall_gini: f64,
    pub overall_snr_db: f64,
    pub overall_waste_rate: f64,
}

/// Assemble the dashboard overview from the stored record
#[instrument(skip(store))]
pub fn overview(store: &MemLensStore) -> Result<DashboardOverview> {
    let waste_threshold = store.config().portfolio.waste_threshold;
    let mut agents = Vec::new();
    let mut all_scores: Vec<f64> = Vec::new();
    let mut all_tokens: Vec<u64> = Vec::new();
    let mut total_attributions = 0u64;

    for agent_id in store.list_agent_ids()? {
        let (memories, total_memories) = store.list_memories(&MemoryFilter {
            agent_id: Some(agent_id.clone()),
            limit: u32::MAX,
            ..MemoryFilter::default()
        })?;

        let mut tier_distribution: HashMap<String, u64> =
            [("hot", 0u64), ("warm", 0), ("cold", 0)]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect();
        for memory in &memories {
            *tier_distribution
                .entry(memory.tier.as_str().to_string())
                .or_insert(0) += 1;
        }

        let memory_ids: Vec<Uuid> = memories.iter().map(|m| m.id).collect();
        let tokens_by_id: HashMap<Uuid, u64> =
            memories.iter().map(|m| (m.id, u64::from(m.tokens))).collect();

        let mut agent_scores = Vec::new();
        let mut agent_tokens = Vec::new();
        for (memory_id, score) in store.scores_for_memories(&memory_ids)? {
            agent_scores.push(score);
            agent_tokens.push(tokens_by_id.get(&memory_id).copied().unwrap_or(0));
        }
        total_attributions += agent_scores.len() as u64;

        let (txn_count, input_tokens, output_tokens, last_active) =
            store.transaction_stats(&agent_id)?;
        let contradiction_count = store.unresolved_contradiction_count(&memory_ids)?;

        let avg_attribution = if agent_scores.is_empty() {
            0.0
        } else {
            agent_scores.iter().sum::<f64>() / agent_scores.len() as f64
        };

        agents.push(AgentSummary {
            gini_coefficient: if agent_scores.is_empty() { 0.0 } else { gini(&agent_scores) },
            snr_db: if agent_scores.is_empty() { 0.0 } else { snr_db(&agent_scores) },
            waste_rate: token_waste_rate(&agent_scores, &agent_tokens, waste_threshold),
            agent_id,
            total_memories,
            total_transactions: txn_count,
            avg_attribution,
            tier_distribution,
            token_usage: TokenUsage {
                input: input_tokens,
                output: output_tokens,
            },
            contradiction_count,
            last_active,
        });

        all_scores.extend(agent_scores);
        all_tokens.extend(agent_tokens);
    }

    Ok(DashboardOverview {
        total_memories: agents.iter().map(|a| a.total_memories).sum(),
        total_transactions: agents.iter().map(|a| a.total_transactions).sum(),
        total_attributions,
        overall_gini: if all_scores.is_empty() { 0.0 } else { gini(&all_scores) },
        overall_snr_db: if all_scores.is_empty() { 0.0 } else { snr_db(&all_scores) },
        overall_waste_rate: token_waste_rate(&all_scores, &all_tokens, waste_threshold),
        agents,
    })
}
