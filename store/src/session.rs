//! Durable session snapshot and per-step progress.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use huddle_protocol::Clock;
use huddle_protocol::DEFAULT_TOTAL_STEPS;
use huddle_protocol::RecoveryMetadata;
use huddle_protocol::SCHEMA_VERSION;
use huddle_protocol::SessionState;
use huddle_protocol::StepPayload;
use huddle_protocol::StepProgress;
use huddle_protocol::StepProgressMap;
use huddle_protocol::SyncKind;
use huddle_protocol::SyncQueueItem;
use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::keys::StorageKeys;
use crate::queue::SyncQueue;
use crate::storage::StorageHandle;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Idle time after which a session is discarded.
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: i64,

    #[serde(default = "default_total_steps")]
    pub total_steps: u32,

    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_session_timeout_ms() -> i64 {
    24 * 60 * 60 * 1000
}
fn default_total_steps() -> u32 {
    DEFAULT_TOTAL_STEPS
}
fn default_key_prefix() -> String {
    "huddle".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_timeout_ms: default_session_timeout_ms(),
            total_steps: default_total_steps(),
            key_prefix: default_key_prefix(),
        }
    }
}

/// Rewrites a raw session record from one schema version to the next.
pub type SchemaRule = fn(&mut serde_json::Value);

/// Ordered schema upgrade rules keyed by the version they upgrade from.
#[derive(Debug, Clone)]
pub struct SchemaMigrations {
    rules: BTreeMap<String, (String, SchemaRule)>,
}

impl Default for SchemaMigrations {
    fn default() -> Self {
        let mut migrations = Self::empty();
        migrations.register("1", "2", upgrade_v1_session);
        migrations
    }
}

impl SchemaMigrations {
    pub fn empty() -> Self {
        Self {
            rules: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, from: &str, to: &str, rule: SchemaRule) {
        self.rules.insert(from.to_string(), (to.to_string(), rule));
    }

    /// Upgrade `record` towards `target`. Versions without a rule pass
    /// through untouched. Returns whether anything changed.
    pub fn apply(&self, record: &mut serde_json::Value, target: &str) -> bool {
        let mut changed = false;
        // Each rule runs at most once, so a cyclic registry still terminates.
        for _ in 0..self.rules.len() {
            let version = schema_version(record);
            if version == target {
                break;
            }
            let Some((to, rule)) = self.rules.get(&version) else {
                debug!(
                    version = %version,
                    wanted = %target,
                    "no schema rule, passing record through"
                );
                break;
            };
            rule(record);
            if let Some(obj) = record.as_object_mut() {
                obj.insert("schemaVersion".to_string(), json!(to));
            }
            debug!(from = %version, to = %to, "upgraded session record");
            changed = true;
        }
        changed
    }
}

fn schema_version(record: &serde_json::Value) -> String {
    match record.get("schemaVersion") {
        Some(serde_json::Value::String(v)) => v.clone(),
        Some(serde_json::Value::Number(n)) => n.to_string(),
        _ => "1".to_string(),
    }
}

/// v1 records predate session ids and allowed a missing current step.
fn upgrade_v1_session(record: &mut serde_json::Value) {
    let Some(obj) = record.as_object_mut() else {
        return;
    };
    if !obj.get("sessionId").is_some_and(serde_json::Value::is_string) {
        obj.insert(
            "sessionId".to_string(),
            json!(SessionState::generate_session_id()),
        );
    }
    let step = obj
        .get("currentStep")
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(1)
        .max(1);
    obj.insert("currentStep".to_string(), json!(step));
}

/// Persists the session snapshot and step progress.
///
/// Never fails: storage problems are logged and reads degrade to "no data".
#[derive(Clone)]
pub struct LocalSessionStore {
    storage: Arc<StorageHandle>,
    clock: Arc<dyn Clock>,
    keys: StorageKeys,
    config: SessionConfig,
    queue: SyncQueue,
    migrations: SchemaMigrations,
}

impl std::fmt::Debug for LocalSessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSessionStore")
            .field("keys", &self.keys)
            .field("config", &self.config)
            .field("degraded", &self.storage.is_degraded())
            .finish_non_exhaustive()
    }
}

impl LocalSessionStore {
    pub fn new(
        storage: Arc<StorageHandle>,
        clock: Arc<dyn Clock>,
        config: SessionConfig,
        queue: SyncQueue,
    ) -> Self {
        Self {
            storage,
            clock,
            keys: StorageKeys::new(&config.key_prefix),
            config,
            queue,
            migrations: SchemaMigrations::default(),
        }
    }

    pub fn with_migrations(mut self, migrations: SchemaMigrations) -> Self {
        self.migrations = migrations;
        self
    }

    pub fn keys(&self) -> &StorageKeys {
        &self.keys
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    pub fn is_degraded(&self) -> bool {
        self.storage.is_degraded()
    }

    /// Write the session snapshot stamped with the current time.
    ///
    /// The existing session id is kept; a new one is generated on first save.
    /// Steps outside the wizard are dropped, and `current_step` is raised to
    /// the highest completed step so resuming never skips past open work.
    pub fn save_session(
        &self,
        user_id: Option<&str>,
        current_step: u32,
        completed_steps: impl IntoIterator<Item = u32>,
    ) -> SessionState {
        let now = self.clock.now_ms();
        let completed_steps: BTreeSet<u32> = completed_steps
            .into_iter()
            .filter(|step| self.is_wizard_step(*step))
            .collect();
        let highest = completed_steps.last().copied().unwrap_or(0);
        if current_step < highest {
            debug!(
                current_step,
                highest_completed = highest,
                "current step behind completed steps, raising it"
            );
        }
        let current_step = current_step.max(highest).max(1);
        self.storage
            .update::<SessionState, _>(&self.keys.session, |slot| {
                let session_id = slot
                    .as_ref()
                    .map(|s| s.session_id.clone())
                    .unwrap_or_else(SessionState::generate_session_id);
                let state = SessionState {
                    user_id: user_id.map(str::to_string),
                    current_step,
                    completed_steps,
                    last_active_time: now,
                    session_id,
                    schema_version: SCHEMA_VERSION.to_string(),
                };
                *slot = Some(state.clone());
                state
            })
    }

    /// Load the session, discarding it when idle too long.
    pub fn restore_session(&self) -> Option<SessionState> {
        let (state, upgraded) = self.load_session()?;
        let now = self.clock.now_ms();
        if state.is_expired(now, self.config.session_timeout_ms) {
            info!(
                session_id = %state.session_id,
                idle_ms = now.saturating_sub(state.last_active_time),
                "session expired, clearing"
            );
            self.clear_session();
            return None;
        }
        if upgraded {
            self.storage.write(&self.keys.session, &state);
        }
        Some(state)
    }

    /// Like [`Self::restore_session`] but read-only: an expired session
    /// reads as `None` without being cleared and upgrades are not written.
    pub fn peek_session(&self) -> Option<SessionState> {
        let (state, _) = self.load_session()?;
        (!state.is_expired(self.clock.now_ms(), self.config.session_timeout_ms)).then_some(state)
    }

    fn load_session(&self) -> Option<(SessionState, bool)> {
        let mut raw = self.storage.read_value(&self.keys.session)?;
        let upgraded = self.migrations.apply(&mut raw, SCHEMA_VERSION);
        match serde_json::from_value(raw) {
            Ok(state) => Some((state, upgraded)),
            Err(e) => {
                warn!(error = %e, "session record unreadable, ignoring it");
                None
            }
        }
    }

    /// Refresh `last_active_time` on an existing session.
    pub fn touch(&self) -> Option<SessionState> {
        let now = self.clock.now_ms();
        self.storage
            .update::<SessionState, _>(&self.keys.session, |slot| {
                let state = slot.as_mut()?;
                state.last_active_time = now;
                Some(state.clone())
            })
    }

    pub fn total_steps(&self) -> u32 {
        self.config.total_steps
    }

    fn is_wizard_step(&self, step: u32) -> bool {
        (1..=self.config.total_steps).contains(&step)
    }

    /// Record a completed step and queue it for the server.
    ///
    /// Steps outside `1..=total_steps` are logged and ignored.
    pub fn save_step_progress(&self, step: u32, payload: StepPayload) -> Option<StepProgress> {
        if !self.is_wizard_step(step) {
            warn!(
                step,
                total_steps = self.config.total_steps,
                "ignoring progress for a step outside the wizard"
            );
            return None;
        }
        let now = self.clock.now_ms();
        let progress = StepProgress {
            completed: true,
            timestamp: Some(now),
            payload: Some(payload.clone()),
        };
        self.storage
            .update::<StepProgressMap, _>(&self.keys.step_progress, |slot| {
                slot.get_or_insert_with(StepProgressMap::new)
                    .insert(step, progress.clone());
            });

        let mut item = SyncQueueItem::new(
            SyncQueueItem::step_item_id(step, now),
            SyncKind::StepUpdate,
            json!({ "step": step, "data": payload, "timestamp": now }),
            now,
        );
        item.max_retries = self.queue.item_max_retries();
        self.queue.enqueue_item(item);
        debug!(step, "step progress saved");
        Some(progress)
    }

    /// Progress for every wizard step; unseen steps read as not completed.
    pub fn get_step_progress(&self) -> StepProgressMap {
        let mut progress = self
            .storage
            .read::<StepProgressMap>(&self.keys.step_progress)
            .unwrap_or_default();
        for step in 1..=self.config.total_steps {
            progress.entry(step).or_default();
        }
        progress
    }

    /// Payload captured for `step`, if that step was completed.
    pub fn recover_step_data(&self, step: u32) -> Option<StepPayload> {
        self.storage
            .read::<StepProgressMap>(&self.keys.step_progress)?
            .remove(&step)
            .filter(|p| p.completed)
            .and_then(|p| p.payload)
    }

    /// Step the wizard should reopen, 1 when there is no session.
    pub fn resume_step(&self) -> u32 {
        self.restore_session()
            .map_or(1, |s| s.resume_step(self.config.total_steps))
    }

    pub fn recovery_metadata(&self) -> RecoveryMetadata {
        self.storage
            .read(&self.keys.recovery_metadata)
            .unwrap_or_default()
    }

    pub fn update_recovery_metadata(
        &self,
        f: impl FnOnce(&mut RecoveryMetadata),
    ) -> RecoveryMetadata {
        self.storage
            .update::<RecoveryMetadata, _>(&self.keys.recovery_metadata, |slot| {
                let metadata = slot.get_or_insert_with(RecoveryMetadata::default);
                f(metadata);
                metadata.clone()
            })
    }

    /// Drop the session and step progress, keeping queued mutations.
    pub fn clear_session(&self) {
        self.storage
            .remove_all(&[self.keys.session.as_str(), self.keys.step_progress.as_str()]);
    }

    /// Purge every key this store and its queue own.
    pub fn clear_all(&self) {
        self.storage.remove_all(&self.keys.session_owned());
        info!("local session cleared");
    }
}
