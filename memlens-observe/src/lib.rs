//! memlens-observe - Portfolio metrics over the attribution record
//!
//! Pure metric functions (token economics, Gini concentration, SNR, waste,
//! redundancy, contradiction risk, staleness) plus the dashboard aggregator
//! that assembles per-agent and global summaries from the store.

pub mod dashboard;
pub mod metrics;

pub use dashboard::{overview, AgentSummary, DashboardOverview, TokenUsage};
pub use metrics::{
    accuracy_delta, contradiction_risk, gini, memory_pnl, memory_roi, memory_token_cost,
    redundancy_tax, snr_db, staleness_index, token_waste_rate, transaction_cost, MemoryPnl,
    MemoryRoi, RedundancyTax, RoiInput, StalenessInput, TransactionCost,
};
