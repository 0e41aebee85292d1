//! Pending mutations awaiting server application.

use serde::Deserialize;
use serde::Serialize;

use crate::Timestamp;

/// Default per-item retry budget.
pub const DEFAULT_ITEM_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncKind {
    StepUpdate,
    Completion,
    PreferenceUpdate,
}

impl SyncKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StepUpdate => "step-update",
            Self::Completion => "completion",
            Self::PreferenceUpdate => "preference-update",
        }
    }
}

impl std::fmt::Display for SyncKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One queued mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueItem {
    pub id: String,
    pub kind: SyncKind,
    pub payload: serde_json::Value,
    pub enqueued_at: Timestamp,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    DEFAULT_ITEM_MAX_RETRIES
}

impl SyncQueueItem {
    pub fn new(
        id: impl Into<String>,
        kind: SyncKind,
        payload: serde_json::Value,
        enqueued_at: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            payload,
            enqueued_at,
            retry_count: 0,
            max_retries: DEFAULT_ITEM_MAX_RETRIES,
        }
    }

    /// Id for a step mutation, derived from the step and enqueue time.
    pub fn step_item_id(step: u32, enqueued_at: Timestamp) -> String {
        format!("step_{step}_{enqueued_at}")
    }

    /// Whether the retry budget is spent.
    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}
