//! Collaborators the engine reaches only through traits.

use std::sync::Arc;

use async_trait::async_trait;
use huddle_protocol::Clock;
use huddle_protocol::NetworkStatus;
use huddle_protocol::SyncQueueItem;
use huddle_reconcile::ProfileApi;
use huddle_retry::RequestError;
use huddle_store::KeyValueStore;
use tokio::sync::watch;

/// Source of the bearer token and user identity.
pub trait AuthProvider: Send + Sync {
    fn token(&self) -> Option<String>;

    fn user_id(&self) -> Option<String>;

    fn is_authenticated(&self) -> bool {
        self.token().is_some() && self.user_id().is_some()
    }
}

/// Delivers one queued mutation to the server.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn send(&self, item: &SyncQueueItem, token: &str) -> Result<(), RequestError>;
}

/// Fixed credentials, e.g. read from the environment at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticAuth {
    token: Option<String>,
    user_id: Option<String>,
}

impl StaticAuth {
    pub fn new(token: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            user_id: Some(user_id.into()),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }
}

impl AuthProvider for StaticAuth {
    fn token(&self) -> Option<String> {
        self.token.clone()
    }

    fn user_id(&self) -> Option<String> {
        self.user_id.clone()
    }
}

/// Everything the host injects into [`crate::SyncEngine::new`].
pub struct Capabilities {
    pub store: Arc<dyn KeyValueStore>,
    pub auth: Arc<dyn AuthProvider>,
    pub clock: Arc<dyn Clock>,
    pub transport: Arc<dyn SyncTransport>,
    pub profile_api: Arc<dyn ProfileApi>,
    /// Online/offline transitions. The current value is the engine's view
    /// of connectivity.
    pub network: watch::Receiver<NetworkStatus>,
}
