//! Composition root for the onboarding sync stack.
//!
//! A [`SyncEngine`] is built from an [`EngineConfig`] and the host's
//! [`Capabilities`]. It persists every step locally first, queues the
//! mutation, and drains the queue when the device is online and the user
//! is signed in.

mod capabilities;
pub mod config;
mod engine;
mod error;
mod events;

pub use capabilities::{AuthProvider, Capabilities, StaticAuth, SyncTransport};
pub use config::{ConfigError, ConfigLoader, EngineConfig, SyncConfig};
pub use engine::{EngineStatus, ReconcileOutcome, SkipReason, SyncEngine, SyncOutcome};
pub use error::{EngineError, Result};
pub use events::EngineEvent;
