//! Conflict detection and resolution between the local and server profile.

use std::collections::HashSet;
use std::sync::Arc;

use huddle_protocol::NewsTypePreference;
use huddle_protocol::UserPreferences;
use huddle_retry::ResilientRequestExecutor;
use huddle_retry::RetryOptions;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::info;

use crate::api::ProfileApi;
use crate::error::ReconcileError;
use crate::error::Result;

pub const SPORTS_CONFLICT: &str = "Sports selection differs between local and remote";
pub const TEAMS_CONFLICT: &str = "Team selection differs between local and remote";
pub const FREQUENCY_CONFLICT: &str = "Content frequency differs between local and remote";
pub const NEWS_TYPES_CONFLICT: &str = "News type preferences differ between local and remote";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    LocalWins,
    RemoteWins,
    #[default]
    Merge,
    Manual,
}

impl ConflictStrategy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LocalWins => "local-wins",
            Self::RemoteWins => "remote-wins",
            Self::Merge => "merge",
            Self::Manual => "manual",
        }
    }
}

impl std::fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown conflict strategy `{0}` (expected local-wins, remote-wins, merge or manual)")]
pub struct UnknownStrategy(pub String);

impl std::str::FromStr for ConflictStrategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "local-wins" => Ok(Self::LocalWins),
            "remote-wins" => Ok(Self::RemoteWins),
            "merge" => Ok(Self::Merge),
            "manual" => Ok(Self::Manual),
            other => Err(UnknownStrategy(other.to_string())),
        }
    }
}

/// Result of comparing the local profile against the server.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConflictReport {
    pub has_conflicts: bool,
    pub conflicts: Vec<String>,
    /// The server profile, when one exists.
    pub remote: Option<UserPreferences>,
}

/// Dimensions on which two profiles disagree. Order-independent.
pub fn detect_conflicts(local: &UserPreferences, remote: &UserPreferences) -> Vec<String> {
    let mut conflicts = Vec::new();
    if local.sport_ids() != remote.sport_ids() {
        conflicts.push(SPORTS_CONFLICT.to_string());
    }
    if local.team_ids() != remote.team_ids() {
        conflicts.push(TEAMS_CONFLICT.to_string());
    }
    if local.preferences.content_frequency != remote.preferences.content_frequency {
        conflicts.push(FREQUENCY_CONFLICT.to_string());
    }
    if local.enabled_news_types() != remote.enabled_news_types() {
        conflicts.push(NEWS_TYPES_CONFLICT.to_string());
    }
    conflicts
}

/// Produce the resolved profile. The caller persists it.
pub fn resolve_conflicts(
    strategy: ConflictStrategy,
    local: &UserPreferences,
    remote: &UserPreferences,
    manual_override: Option<&serde_json::Value>,
) -> Result<UserPreferences> {
    match strategy {
        ConflictStrategy::LocalWins => Ok(local.clone()),
        ConflictStrategy::RemoteWins => Ok(remote.clone()),
        ConflictStrategy::Merge => Ok(merge(local, remote)),
        ConflictStrategy::Manual => {
            let overrides = manual_override.ok_or(ReconcileError::MissingOverride)?;
            apply_override(local, overrides)
        }
    }
}

fn merge(local: &UserPreferences, remote: &UserPreferences) -> UserPreferences {
    // Ties (including two unstamped profiles) favour the local copy.
    let base = if remote.updated_at > local.updated_at {
        remote
    } else {
        local
    };

    let sports = union_by_key(&remote.sports, &local.sports, |s| s.sport_id.as_str());
    let teams = union_by_key(&remote.teams, &local.teams, |t| t.team_id.as_str());

    let mut news_types: Vec<NewsTypePreference> = Vec::new();
    for entry in remote
        .preferences
        .news_types
        .iter()
        .chain(&local.preferences.news_types)
    {
        match news_types
            .iter_mut()
            .find(|merged| merged.news_type == entry.news_type)
        {
            Some(merged) => {
                merged.enabled |= entry.enabled;
                merged.priority = merged.priority.min(entry.priority);
            }
            None => news_types.push(entry.clone()),
        }
    }

    let mut merged = base.clone();
    merged.id = base
        .id
        .clone()
        .or_else(|| local.id.clone())
        .or_else(|| remote.id.clone());
    merged.sports = sports;
    merged.teams = teams;
    merged.preferences.news_types = news_types;
    merged.updated_at = local.updated_at.max(remote.updated_at);
    merged
}

/// Remote order first, each entry replaced by the local one with the same
/// key, then local-only entries. First occurrence of a key wins.
fn union_by_key<T, K>(remote: &[T], local: &[T], key: K) -> Vec<T>
where
    T: Clone,
    K: Fn(&T) -> &str,
{
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(remote.len() + local.len());
    for item in remote {
        let id = key(item);
        if !seen.insert(id.to_string()) {
            continue;
        }
        let chosen = local
            .iter()
            .find(|candidate| key(*candidate) == id)
            .unwrap_or(item);
        out.push(chosen.clone());
    }
    for item in local {
        if seen.insert(key(item).to_string()) {
            out.push(item.clone());
        }
    }
    out
}

/// Shallow merge of a JSON object onto the local profile.
fn apply_override(
    local: &UserPreferences,
    overrides: &serde_json::Value,
) -> Result<UserPreferences> {
    let fields = overrides.as_object().ok_or_else(|| {
        ReconcileError::InvalidOverride("override must be a JSON object".to_string())
    })?;
    let mut value = serde_json::to_value(local)
        .map_err(|e| ReconcileError::InvalidOverride(e.to_string()))?;
    if let Some(target) = value.as_object_mut() {
        for (field, replacement) in fields {
            target.insert(field.clone(), replacement.clone());
        }
    }
    serde_json::from_value(value).map_err(|e| ReconcileError::InvalidOverride(e.to_string()))
}

/// Compares the cached profile with the server's copy.
#[derive(Clone)]
pub struct ConflictResolver {
    api: Arc<dyn ProfileApi>,
    executor: ResilientRequestExecutor,
    options: Arc<RetryOptions>,
}

impl std::fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictResolver")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl ConflictResolver {
    pub fn new(
        api: Arc<dyn ProfileApi>,
        executor: ResilientRequestExecutor,
        options: Arc<RetryOptions>,
    ) -> Self {
        Self {
            api,
            executor,
            options,
        }
    }

    /// Fetch the server profile and report differing dimensions.
    ///
    /// No server profile means nothing to conflict with.
    pub async fn check_for_conflicts(
        &self,
        user_id: &str,
        local: &UserPreferences,
    ) -> Result<ConflictReport> {
        let api = &self.api;
        let remote = self
            .executor
            .execute_with_retry(|| api.fetch_profile(user_id), &self.options)
            .await?;

        let Some(remote) = remote else {
            debug!(user_id, "no server profile, nothing to reconcile");
            return Ok(ConflictReport::default());
        };

        let conflicts = detect_conflicts(local, &remote);
        if !conflicts.is_empty() {
            info!(user_id, ?conflicts, "local profile diverges from server");
        }
        Ok(ConflictReport {
            has_conflicts: !conflicts.is_empty(),
            conflicts,
            remote: Some(remote),
        })
    }

    pub fn resolve_conflicts(
        &self,
        strategy: ConflictStrategy,
        local: &UserPreferences,
        remote: &UserPreferences,
        manual_override: Option<&serde_json::Value>,
    ) -> Result<UserPreferences> {
        resolve_conflicts(strategy, local, remote, manual_override)
    }
}
