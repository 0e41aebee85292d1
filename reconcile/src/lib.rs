//! Reconciliation of the locally cached preference profile with the server.
//!
//! [`ConflictResolver`] detects divergence and merges by strategy;
//! [`MigrationManager`] pushes a locally collected profile to the server
//! once the user authenticates.

mod api;
mod conflict;
mod error;
mod migration;

pub use api::{
    CreateProfileRequest, DEFAULT_TEAM_AFFINITY, ProfileApi, SportSelection, TeamSelection,
};
pub use conflict::{
    ConflictReport, ConflictResolver, ConflictStrategy, FREQUENCY_CONFLICT, NEWS_TYPES_CONFLICT,
    SPORTS_CONFLICT, TEAMS_CONFLICT, UnknownStrategy, detect_conflicts, resolve_conflicts,
};
pub use error::{ReconcileError, Result};
pub use migration::{MigrationManager, MigrationOptions, MigrationResult};
