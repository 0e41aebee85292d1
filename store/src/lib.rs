//! Local-first persistence for the onboarding session.
//!
//! Everything here sits on top of a tiny string key/value capability
//! ([`KeyValueStore`]). Storage failures never reach callers: they are logged
//! and the [`StorageHandle`] falls back to an in-memory overlay for the rest
//! of the process.

mod keys;
pub mod preferences;
pub mod queue;
pub mod session;
pub mod storage;

pub use keys::StorageKeys;
pub use preferences::PreferenceStore;
pub use queue::{DrainReport, QueueConfig, SendFailure, SyncQueue};
pub use session::{LocalSessionStore, SchemaMigrations, SessionConfig};
pub use storage::{FileStore, KeyValueStore, MemoryStore, StorageError, StorageHandle};
