//! Cached preference profile plus the migration marker and rollback copy.

use std::sync::Arc;

use huddle_protocol::Clock;
use huddle_protocol::Timestamp;
use huddle_protocol::UserPreferences;
use serde::Deserialize;
use serde::Serialize;
use tracing::info;

use crate::keys::StorageKeys;
use crate::storage::StorageHandle;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MigrationMarker {
    completed_at: Timestamp,
}

#[derive(Clone)]
pub struct PreferenceStore {
    storage: Arc<StorageHandle>,
    clock: Arc<dyn Clock>,
    keys: StorageKeys,
}

impl std::fmt::Debug for PreferenceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreferenceStore")
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

impl PreferenceStore {
    pub fn new(storage: Arc<StorageHandle>, clock: Arc<dyn Clock>, keys: StorageKeys) -> Self {
        Self {
            storage,
            clock,
            keys,
        }
    }

    pub fn load(&self) -> Option<UserPreferences> {
        self.storage.read(&self.keys.preferences)
    }

    /// Persist `prefs`, stamping `updated_at` with the current time.
    pub fn save(&self, prefs: &UserPreferences) -> UserPreferences {
        let mut stamped = prefs.clone();
        stamped.updated_at = Some(self.clock.now_ms());
        self.storage.write(&self.keys.preferences, &stamped);
        stamped
    }

    /// Persist `prefs` exactly as given, e.g. a merged server profile.
    pub fn replace(&self, prefs: &UserPreferences) {
        self.storage.write(&self.keys.preferences, prefs);
    }

    /// When the local profile was last pushed to the server.
    pub fn migration_completed_at(&self) -> Option<Timestamp> {
        self.storage
            .read::<MigrationMarker>(&self.keys.migration_complete)
            .map(|m| m.completed_at)
    }

    pub fn is_migration_complete(&self) -> bool {
        self.migration_completed_at().is_some()
    }

    pub fn mark_migration_complete(&self) {
        let marker = MigrationMarker {
            completed_at: self.clock.now_ms(),
        };
        self.storage.write(&self.keys.migration_complete, &marker);
        info!(completed_at = marker.completed_at, "preference migration marked complete");
    }

    pub fn clear_migration_marker(&self) {
        self.storage.remove(&self.keys.migration_complete);
    }

    pub fn save_rollback(&self, snapshot: &UserPreferences) {
        self.storage.write(&self.keys.migration_rollback, snapshot);
    }

    pub fn load_rollback(&self) -> Option<UserPreferences> {
        self.storage.read(&self.keys.migration_rollback)
    }

    /// Restore `snapshot` as the local profile and forget the migration.
    pub fn restore(&self, snapshot: &UserPreferences) {
        self.storage.write(&self.keys.preferences, snapshot);
        self.storage.remove_all(&[
            self.keys.migration_complete.as_str(),
            self.keys.migration_rollback.as_str(),
        ]);
    }

    pub fn clear(&self) {
        self.storage.remove_all(&[
            self.keys.preferences.as_str(),
            self.keys.migration_complete.as_str(),
            self.keys.migration_rollback.as_str(),
        ]);
    }
}
