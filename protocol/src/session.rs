//! Session identity, per-step progress and recovery bookkeeping.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;

use crate::Timestamp;
use crate::preferences::ContentPreferences;
use crate::preferences::SportPreference;
use crate::preferences::TeamPreference;

/// One onboarding attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    /// `None` until the user authenticates.
    #[serde(default)]
    pub user_id: Option<String>,
    pub current_step: u32,
    #[serde(default)]
    pub completed_steps: BTreeSet<u32>,
    pub last_active_time: Timestamp,
    pub session_id: String,
    pub schema_version: String,
}

impl SessionState {
    /// Generate a fresh opaque session id.
    pub fn generate_session_id() -> String {
        format!("session_{}", uuid::Uuid::new_v4().simple())
    }

    /// Highest completed step, or 0 if nothing is complete yet.
    pub fn highest_completed(&self) -> u32 {
        self.completed_steps.last().copied().unwrap_or(0)
    }

    /// Whether the session has been idle longer than `timeout_ms`.
    pub fn is_expired(&self, now: Timestamp, timeout_ms: i64) -> bool {
        now.saturating_sub(self.last_active_time) > timeout_ms
    }

    /// The step the wizard should show when resuming: the current step,
    /// but never behind the first step after the highest completed one.
    /// Clamped to the wizard length once everything is done.
    pub fn resume_step(&self, total_steps: u32) -> u32 {
        let next_open = self.highest_completed().saturating_add(1).min(total_steps);
        self.current_step.max(next_open).max(1)
    }
}

/// Completion record for one wizard step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepProgress {
    pub completed: bool,
    #[serde(default)]
    pub timestamp: Option<Timestamp>,
    #[serde(default)]
    pub payload: Option<StepPayload>,
}

/// Step number to progress record.
pub type StepProgressMap = BTreeMap<u32, StepProgress>;

/// Data captured when a step is completed.
///
/// The variant is fixed per step index; `Other` keeps payloads written by
/// newer builds readable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum StepPayload {
    Welcome,
    #[serde(rename_all = "camelCase")]
    Sports {
        selected_sports: Vec<SportPreference>,
    },
    #[serde(rename_all = "camelCase")]
    Teams {
        selected_teams: Vec<TeamPreference>,
    },
    Preferences {
        preferences: ContentPreferences,
    },
    Complete,
    Other {
        data: serde_json::Value,
    },
}

impl StepPayload {
    /// The step index this payload belongs to, if it is a fixed one.
    pub fn step(&self) -> Option<u32> {
        match self {
            Self::Welcome => Some(1),
            Self::Sports { .. } => Some(2),
            Self::Teams { .. } => Some(3),
            Self::Preferences { .. } => Some(4),
            Self::Complete => Some(5),
            Self::Other { .. } => None,
        }
    }
}

/// Connectivity as last observed by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkStatus {
    Online,
    Offline,
    #[default]
    Unknown,
}

/// Bookkeeping for sync health.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryMetadata {
    #[serde(default)]
    pub last_sync_time: Option<Timestamp>,
    #[serde(default)]
    pub recovery_count: u32,
    #[serde(default)]
    pub network_status: NetworkStatus,
}
