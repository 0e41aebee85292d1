//! One-shot push of the locally collected profile to the server.

use std::sync::Arc;
use std::time::Duration;

use huddle_protocol::UserPreferences;
use huddle_retry::RequestError;
use huddle_retry::ResilientRequestExecutor;
use huddle_retry::RetryConfig;
use huddle_retry::RetryOptions;
use huddle_store::PreferenceStore;
use serde::Deserialize;
use serde::Serialize;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::api::CreateProfileRequest;
use crate::api::ProfileApi;
use crate::conflict::ConflictResolver;
use crate::error::ReconcileError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationOptions {
    /// Reject structurally incomplete profiles before sending.
    #[serde(default = "default_true")]
    pub validate_data: bool,

    /// Keep a copy of the local profile for `rollback_migration`.
    #[serde(default = "default_true")]
    pub create_backup: bool,

    /// Refuse to migrate over a divergent server profile.
    #[serde(default)]
    pub check_conflicts: bool,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Wait `retry_delay_ms * attempt` between create attempts.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_true() -> bool {
    true
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1000
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            validate_data: true,
            create_backup: true,
            check_conflicts: false,
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MigrationResult {
    pub success: bool,
    /// Sports, teams and news-type entries sent to the server.
    pub migrated_records: usize,
    pub conflicts: Vec<String>,
    /// Local profile as it was before the migration.
    pub rollback_data: Option<UserPreferences>,
    pub error: Option<ReconcileError>,
}

impl MigrationResult {
    fn failed(error: ReconcileError, rollback_data: Option<UserPreferences>) -> Self {
        let conflicts = match &error {
            ReconcileError::Conflict(conflicts) => conflicts.clone(),
            _ => Vec::new(),
        };
        Self {
            success: false,
            migrated_records: 0,
            conflicts,
            rollback_data,
            error: Some(error),
        }
    }
}

pub struct MigrationManager {
    api: Arc<dyn ProfileApi>,
    executor: ResilientRequestExecutor,
    preferences: PreferenceStore,
    resolver: ConflictResolver,
    options: MigrationOptions,
}

impl std::fmt::Debug for MigrationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationManager")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl MigrationManager {
    pub fn new(
        api: Arc<dyn ProfileApi>,
        executor: ResilientRequestExecutor,
        preferences: PreferenceStore,
        resolver: ConflictResolver,
        options: MigrationOptions,
    ) -> Self {
        Self {
            api,
            executor,
            preferences,
            resolver,
            options,
        }
    }

    pub fn options(&self) -> &MigrationOptions {
        &self.options
    }

    /// Push the cached profile to the server.
    ///
    /// Local state only changes on success (migration marker plus rollback
    /// copy). Failures carry the pre-migration snapshot.
    pub async fn migrate_user_preferences(&self, user_id: &str) -> MigrationResult {
        self.migrate_with(user_id, &self.options).await
    }

    pub async fn migrate_with(&self, user_id: &str, options: &MigrationOptions) -> MigrationResult {
        let Some(local) = self.preferences.load() else {
            return MigrationResult::failed(
                ReconcileError::Validation(vec!["no local preferences to migrate".to_string()]),
                None,
            );
        };
        let rollback_data = options.create_backup.then(|| local.clone());

        if options.validate_data {
            let problems = validate(&local);
            if !problems.is_empty() {
                warn!(user_id, ?problems, "local preferences failed validation");
                return MigrationResult::failed(ReconcileError::Validation(problems), rollback_data);
            }
        }

        if options.check_conflicts {
            match self.resolver.check_for_conflicts(user_id, &local).await {
                Ok(report) if report.has_conflicts => {
                    return MigrationResult::failed(
                        ReconcileError::Conflict(report.conflicts),
                        rollback_data,
                    );
                }
                Ok(_) => {}
                Err(err) => return MigrationResult::failed(err, rollback_data),
            }
        }

        let request = CreateProfileRequest::from_preferences(user_id, &local);
        if let Err(err) = self.create_with_retry(&request, options).await {
            error!(user_id, error = %err, "preference migration failed");
            return MigrationResult::failed(err.into(), rollback_data);
        }

        if let Some(snapshot) = &rollback_data {
            self.preferences.save_rollback(snapshot);
        }
        self.preferences.mark_migration_complete();
        let migrated_records =
            request.sports.len() + request.teams.len() + request.preferences.news_types.len();
        info!(user_id, migrated_records, "preferences migrated");
        MigrationResult {
            success: true,
            migrated_records,
            conflicts: Vec::new(),
            rollback_data,
            error: None,
        }
    }

    /// Put the pre-migration profile back and clear the marker.
    pub fn rollback_migration(&self, rollback_data: &UserPreferences) {
        self.preferences.restore(rollback_data);
        info!("preference migration rolled back");
    }

    async fn create_with_retry(
        &self,
        request: &CreateProfileRequest,
        options: &MigrationOptions,
    ) -> Result<UserPreferences, RequestError> {
        // The executor supplies timeout and breaker; this loop owns the retries.
        let single_shot = RetryOptions::new(RetryConfig {
            max_retries: 0,
            ..RetryConfig::default()
        });
        let max_attempts = options.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let api = &self.api;
            match self
                .executor
                .execute_with_retry(|| api.create_profile(request), &single_shot)
                .await
            {
                Ok(profile) => return Ok(profile),
                Err(err) if !err.is_retryable() || attempt >= max_attempts => return Err(err),
                Err(err) => {
                    let delay = Duration::from_millis(options.retry_delay_ms * u64::from(attempt));
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "profile create failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

fn validate(prefs: &UserPreferences) -> Vec<String> {
    let mut problems = Vec::new();
    if prefs.sports.is_empty() {
        problems.push("at least one sport must be selected".to_string());
    }
    if prefs.preferences.news_types.is_empty() {
        problems.push("content preferences are missing".to_string());
    }
    if prefs.id.as_deref().is_none_or(str::is_empty) {
        problems.push("preferences have no id".to_string());
    }
    problems
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::SPORTS_CONFLICT;
    use crate::test_support::FakeProfileApi;
    use crate::test_support::executor;
    use huddle_protocol::ContentPreferences;
    use huddle_protocol::ManualClock;
    use huddle_protocol::NewsTypePreference;
    use huddle_protocol::SportPreference;
    use huddle_store::MemoryStore;
    use huddle_store::StorageHandle;
    use huddle_store::StorageKeys;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::Ordering;

    fn valid_prefs() -> UserPreferences {
        UserPreferences {
            id: Some("user-1".into()),
            sports: vec![SportPreference::new("nfl", "NFL", 1)],
            teams: Vec::new(),
            preferences: ContentPreferences {
                news_types: vec![NewsTypePreference::new("breaking", true, 1)],
                ..Default::default()
            },
            updated_at: Some(10),
        }
    }

    fn manager(api: Arc<FakeProfileApi>) -> (MigrationManager, PreferenceStore) {
        let clock = Arc::new(ManualClock::new(500));
        let storage = Arc::new(StorageHandle::new(Arc::new(MemoryStore::new())));
        let prefs = PreferenceStore::new(storage, clock, StorageKeys::default());
        let executor = executor();
        let resolver = ConflictResolver::new(
            api.clone(),
            executor.clone(),
            Arc::new(RetryOptions::default()),
        );
        let manager = MigrationManager::new(
            api,
            executor,
            prefs.clone(),
            resolver,
            MigrationOptions::default(),
        );
        (manager, prefs)
    }

    #[tokio::test(start_paused = true)]
    async fn successful_migration_marks_complete() {
        let api = Arc::new(FakeProfileApi::default());
        let (manager, prefs) = manager(api.clone());
        prefs.replace(&valid_prefs());

        let result = manager.migrate_user_preferences("user-1").await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.migrated_records, 2);
        assert_eq!(result.rollback_data, Some(valid_prefs()));
        assert!(prefs.is_migration_complete());
        assert_eq!(prefs.load_rollback(), Some(valid_prefs()));

        let sent = api.created.lock().expect("lock");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].user_id, "user-1");
    }

    #[tokio::test(start_paused = true)]
    async fn validation_failure_is_terminal_and_carries_snapshot() {
        let api = Arc::new(FakeProfileApi::default());
        let (manager, prefs) = manager(api.clone());
        let mut invalid = valid_prefs();
        invalid.sports.clear();
        invalid.id = None;
        prefs.replace(&invalid);

        let result = manager.migrate_user_preferences("user-1").await;
        assert!(!result.success);
        assert_eq!(result.rollback_data, Some(invalid.clone()));
        match result.error {
            Some(ReconcileError::Validation(problems)) => assert_eq!(problems.len(), 2),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(api.create_calls.load(Ordering::SeqCst), 0);
        assert!(!prefs.is_migration_complete());
        assert_eq!(prefs.load(), Some(invalid));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_local_profile_fails_validation() {
        let (manager, _prefs) = manager(Arc::new(FakeProfileApi::default()));
        let result = manager.migrate_user_preferences("user-1").await;
        assert!(!result.success);
        assert!(matches!(result.error, Some(ReconcileError::Validation(_))));
        assert_eq!(result.rollback_data, None);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_create_failures_retry_with_linear_backoff() {
        let api = Arc::new(FakeProfileApi::default());
        api.fail_create(RequestError::http(503, "unavailable"));
        api.fail_create(RequestError::network("connection reset"));
        let (manager, prefs) = manager(api.clone());
        prefs.replace(&valid_prefs());

        let started = tokio::time::Instant::now();
        let result = manager.migrate_user_preferences("user-1").await;
        assert!(result.success);
        assert_eq!(api.create_calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_millis(1000 + 2000));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_attempts_leave_local_state_untouched() {
        let api = Arc::new(FakeProfileApi::default());
        for _ in 0..3 {
            api.fail_create(RequestError::http(500, "boom"));
        }
        let (manager, prefs) = manager(api.clone());
        prefs.replace(&valid_prefs());

        let result = manager.migrate_user_preferences("user-1").await;
        assert!(!result.success);
        assert_eq!(api.create_calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.rollback_data, Some(valid_prefs()));
        assert!(matches!(
            result.error,
            Some(ReconcileError::Request(ref e)) if e.status_code == Some(500)
        ));
        assert!(!prefs.is_migration_complete());
        assert_eq!(prefs.load_rollback(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_stop_the_create_loop() {
        let api = Arc::new(FakeProfileApi::default());
        api.fail_create(RequestError::http(422, "unprocessable"));
        let (manager, prefs) = manager(api.clone());
        prefs.replace(&valid_prefs());

        let result = manager.migrate_user_preferences("user-1").await;
        assert!(!result.success);
        assert_eq!(api.create_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn conflict_check_blocks_divergent_profiles() {
        let mut remote = valid_prefs();
        remote.sports.push(SportPreference::new("nba", "NBA", 2));
        let api = Arc::new(FakeProfileApi::with_profile(remote));
        let (manager, prefs) = manager(api.clone());
        prefs.replace(&valid_prefs());

        let options = MigrationOptions {
            check_conflicts: true,
            ..MigrationOptions::default()
        };
        let result = manager.migrate_with("user-1", &options).await;
        assert!(!result.success);
        assert_eq!(result.conflicts, vec![SPORTS_CONFLICT.to_string()]);
        assert_eq!(api.create_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rollback_restores_snapshot_and_clears_marker() {
        let api = Arc::new(FakeProfileApi::default());
        let (manager, prefs) = manager(api);
        prefs.replace(&valid_prefs());
        let result = manager.migrate_user_preferences("user-1").await;
        let snapshot = result.rollback_data.expect("backup taken");

        prefs.replace(&UserPreferences::default());
        manager.rollback_migration(&snapshot);

        assert_eq!(prefs.load(), Some(valid_prefs()));
        assert!(!prefs.is_migration_complete());
    }
}
