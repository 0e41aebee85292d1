//! Shared records for the onboarding session and sync engine.
//!
//! Everything in this crate is plain data: the session snapshot, per-step
//! progress, sync queue items, recovery bookkeeping and the user
//! preference profile that is reconciled against the server. The JSON
//! shape is an internal persistence detail, not a public wire contract.

pub mod clock;
pub mod preferences;
pub mod session;
pub mod sync;

pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use preferences::{
    ContentFrequency, ContentPreferences, NewsTypePreference, NotificationSettings,
    SportPreference, TeamPreference, UserPreferences,
};
pub use session::{
    NetworkStatus, RecoveryMetadata, SessionState, StepPayload, StepProgress, StepProgressMap,
};
pub use sync::{SyncKind, SyncQueueItem};

/// Schema version written into every persisted [`SessionState`].
pub const SCHEMA_VERSION: &str = "2";

/// Number of steps in the onboarding wizard.
pub const DEFAULT_TOTAL_STEPS: u32 = 5;
