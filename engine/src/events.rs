use huddle_protocol::NetworkStatus;
use huddle_protocol::SyncQueueItem;

/// Notifications published to subscribers of [`crate::SyncEngine::subscribe`].
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    StepSaved {
        step: u32,
    },
    SyncStarted {
        pending: usize,
    },
    SyncCompleted {
        success: usize,
        failed: usize,
    },
    /// An item used up its own retry budget and was dropped from the queue.
    SyncFailedPermanently {
        item: SyncQueueItem,
    },
    ConflictDetected {
        conflicts: Vec<String>,
    },
    MigrationResult {
        success: bool,
        migrated_records: usize,
        error: Option<String>,
    },
    NetworkChanged {
        status: NetworkStatus,
    },
}
