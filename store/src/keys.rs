/// Storage key names, all sharing one configurable prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageKeys {
    pub session: String,
    pub step_progress: String,
    pub sync_queue: String,
    pub recovery_metadata: String,
    pub preferences: String,
    pub migration_complete: String,
    pub migration_rollback: String,
}

impl StorageKeys {
    pub fn new(prefix: &str) -> Self {
        let key = |name: &str| format!("{prefix}_{name}");
        Self {
            session: key("session"),
            step_progress: key("step_progress"),
            sync_queue: key("sync_queue"),
            recovery_metadata: key("recovery_metadata"),
            preferences: key("preferences"),
            migration_complete: key("migration_complete"),
            migration_rollback: key("migration_rollback"),
        }
    }

    /// Keys owned by the session store and its queue.
    pub(crate) fn session_owned(&self) -> [&str; 4] {
        [
            self.session.as_str(),
            self.step_progress.as_str(),
            self.sync_queue.as_str(),
            self.recovery_metadata.as_str(),
        ]
    }
}

impl Default for StorageKeys {
    fn default() -> Self {
        Self::new("huddle")
    }
}
