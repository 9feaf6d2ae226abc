//! Outbound telemetry ports.
//!
//! The engine records what happened (history) and how many tokens it spent
//! (usage) through these traits. Persistence lives with the host; failures
//! here must never fail a request, so callers log and move on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// One completed generation, as shown in the user's history view.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub action_name: String,
    /// Which provider handled it (`"Cloud"` or `"Local"`).
    pub provider_label: String,
    pub model_label: String,
    pub input: String,
    pub output: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub latency_ms: u64,
    pub tokens_per_second: f64,
}

#[async_trait]
pub trait HistorySink: Send + Sync {
    async fn add_entry(&self, entry: HistoryEntry) -> anyhow::Result<()>;
}

/// Aggregate token accounting, incremented once per successful generation.
#[async_trait]
pub trait UsageTracker: Send + Sync {
    async fn add_usage(&self, prompt_tokens: u64, completion_tokens: u64) -> anyhow::Result<()>;
}

/// Discards everything. For hosts that do not track history or usage.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

#[async_trait]
impl HistorySink for NoopTelemetry {
    async fn add_entry(&self, _entry: HistoryEntry) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl UsageTracker for NoopTelemetry {
    async fn add_usage(&self, _prompt_tokens: u64, _completion_tokens: u64) -> anyhow::Result<()> {
        Ok(())
    }
}
