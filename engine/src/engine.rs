//! The sync engine: owns the stores, the request executor and the
//! background triggers that drain the queue.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use huddle_protocol::Clock;
use huddle_protocol::NetworkStatus;
use huddle_protocol::RecoveryMetadata;
use huddle_protocol::SessionState;
use huddle_protocol::StepPayload;
use huddle_protocol::StepProgress;
use huddle_protocol::StepProgressMap;
use huddle_protocol::SyncKind;
use huddle_protocol::SyncQueueItem;
use huddle_protocol::UserPreferences;
use huddle_reconcile::ConflictResolver;
use huddle_reconcile::ConflictStrategy;
use huddle_reconcile::MigrationManager;
use huddle_reconcile::MigrationOptions;
use huddle_reconcile::MigrationResult;
use huddle_reconcile::ProfileApi;
use huddle_retry::BreakerSnapshot;
use huddle_retry::CircuitBreaker;
use huddle_retry::ErrorKind;
use huddle_retry::ResilientRequestExecutor;
use huddle_retry::RequestError;
use huddle_retry::RetryOptions;
use huddle_store::DrainReport;
use huddle_store::LocalSessionStore;
use huddle_store::PreferenceStore;
use huddle_store::SendFailure;
use huddle_store::StorageHandle;
use huddle_store::StorageKeys;
use huddle_store::SyncQueue;
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::capabilities::AuthProvider;
use crate::capabilities::Capabilities;
use crate::capabilities::SyncTransport;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::error::Result;
use crate::events::EngineEvent;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Why [`SyncEngine::sync_now`] did not drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadySyncing,
    Offline,
    NotAuthenticated,
    EmptyQueue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Completed(DrainReport),
    Skipped(SkipReason),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// Neither side has a profile.
    NoLocalData,
    /// Nothing cached locally; the server profile was stored as is.
    AdoptedRemote(UserPreferences),
    /// The server had no profile, so the local one was pushed.
    Migrated(MigrationResult),
    InSync,
    Resolved {
        strategy: ConflictStrategy,
        conflicts: Vec<String>,
        merged: UserPreferences,
    },
    /// Manual strategy without an override; nothing was changed.
    NeedsManualResolution {
        conflicts: Vec<String>,
        remote: UserPreferences,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub started: bool,
    pub network: NetworkStatus,
    pub authenticated: bool,
    pub pending: usize,
    pub breaker: BreakerSnapshot,
    pub recovery: RecoveryMetadata,
    pub session: Option<SessionState>,
    pub resume_step: u32,
    pub storage_degraded: bool,
    pub migration_complete: bool,
}

#[derive(Default)]
struct Lifecycle {
    shutdown: Option<CancellationToken>,
    watcher: Option<JoinHandle<()>>,
    debounce: Option<CancellationToken>,
}

struct EngineInner {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    auth: Arc<dyn AuthProvider>,
    transport: Arc<dyn SyncTransport>,
    profile_api: Arc<dyn ProfileApi>,
    session: LocalSessionStore,
    queue: SyncQueue,
    preferences: PreferenceStore,
    executor: ResilientRequestExecutor,
    send_options: RetryOptions,
    fetch_options: Arc<RetryOptions>,
    resolver: ConflictResolver,
    migrations: MigrationManager,
    network: watch::Receiver<NetworkStatus>,
    events: broadcast::Sender<EngineEvent>,
    syncing: AtomicBool,
    /// Set when a trigger found a drain running; checked once it ends.
    rerun_requested: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
}

/// Handle to the engine. Clones share state.
///
/// While started, the background watcher holds a clone; call
/// [`SyncEngine::stop`] or [`SyncEngine::dispose`] to release it.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("config", &self.inner.config)
            .field("network", &self.network_status())
            .field("started", &self.is_started())
            .finish_non_exhaustive()
    }
}

struct SyncingGuard<'a>(&'a AtomicBool);

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SyncEngine {
    pub fn new(config: EngineConfig, capabilities: Capabilities) -> Self {
        let Capabilities {
            store,
            auth,
            clock,
            transport,
            profile_api,
            network,
        } = capabilities;

        let storage = Arc::new(StorageHandle::new(store));
        let keys = StorageKeys::new(&config.session.key_prefix);
        let queue = SyncQueue::new(
            storage.clone(),
            clock.clone(),
            keys.sync_queue.clone(),
            config.queue.clone(),
        );
        let session = LocalSessionStore::new(
            storage.clone(),
            clock.clone(),
            config.session.clone(),
            queue.clone(),
        );
        let preferences = PreferenceStore::new(storage, clock.clone(), keys);

        let breaker = Arc::new(CircuitBreaker::new(
            config.circuit_breaker.clone(),
            clock.clone(),
        ));
        let executor = ResilientRequestExecutor::new(breaker);
        let timeout = Duration::from_millis(config.sync.request_timeout_ms);
        let send_options = RetryOptions::new(config.retry.clone()).with_timeout(timeout);
        let fetch_options =
            Arc::new(RetryOptions::new(config.retry.clone()).with_timeout(timeout));
        let resolver =
            ConflictResolver::new(profile_api.clone(), executor.clone(), fetch_options.clone());
        let migrations = MigrationManager::new(
            profile_api.clone(),
            executor.clone(),
            preferences.clone(),
            resolver.clone(),
            config.migration.clone(),
        );
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(EngineInner {
                config,
                clock,
                auth,
                transport,
                profile_api,
                session,
                queue,
                preferences,
                executor,
                send_options,
                fetch_options,
                resolver,
                migrations,
                network,
                events,
                syncing: AtomicBool::new(false),
                rerun_requested: AtomicBool::new(false),
                lifecycle: Mutex::new(Lifecycle::default()),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    /// Spawn the network watcher, restore the session and schedule the
    /// first drain. Must be called inside a tokio runtime.
    pub fn start(&self) {
        let mut network = self.inner.network.clone();
        let initial = *network.borrow_and_update();
        {
            let mut lifecycle = self.lifecycle();
            if lifecycle.shutdown.is_some() {
                debug!("sync engine already started");
                return;
            }
            let shutdown = CancellationToken::new();
            lifecycle.watcher = Some(tokio::spawn(watch_network(
                self.clone(),
                network,
                initial,
                shutdown.clone(),
            )));
            lifecycle.shutdown = Some(shutdown);
        }

        self.inner
            .session
            .update_recovery_metadata(|metadata| metadata.network_status = initial);
        let session = self.inner.session.restore_session();
        info!(
            network = ?initial,
            resumed = session.is_some(),
            pending = self.inner.queue.len(),
            "sync engine started"
        );
        if initial == NetworkStatus::Online {
            self.schedule_sync(self.debounce());
        }
    }

    /// Cancel the watcher, any pending debounce and any drain in flight.
    pub async fn stop(&self) {
        let (shutdown, watcher, debounce) = {
            let mut lifecycle = self.lifecycle();
            (
                lifecycle.shutdown.take(),
                lifecycle.watcher.take(),
                lifecycle.debounce.take(),
            )
        };
        if let Some(debounce) = debounce {
            debounce.cancel();
        }
        let Some(shutdown) = shutdown else {
            return;
        };
        shutdown.cancel();
        if let Some(watcher) = watcher {
            if let Err(e) = watcher.await {
                warn!(error = %e, "network watcher ended abnormally");
            }
        }
        info!("sync engine stopped");
    }

    pub async fn dispose(self) {
        self.stop().await;
    }

    pub fn is_started(&self) -> bool {
        self.lifecycle().shutdown.is_some()
    }

    pub fn network_status(&self) -> NetworkStatus {
        *self.inner.network.borrow()
    }

    /// Persist a completed wizard step and queue it for the server.
    ///
    /// Returns `None`, changing nothing, for a step outside the wizard.
    pub fn save_step(&self, step: u32, payload: StepPayload) -> Option<StepProgress> {
        let inner = &self.inner;
        // Restore first: an expired session is cleared along with its progress.
        let existing = inner.session.restore_session();
        let progress = inner.session.save_step_progress(step, payload)?;

        let (current, mut completed) = existing
            .map(|s| (s.current_step, s.completed_steps))
            .unwrap_or_default();
        completed.insert(step);
        let highest = completed.last().copied().unwrap_or(step);
        let next = highest
            .saturating_add(1)
            .min(inner.config.session.total_steps)
            .max(highest);
        inner
            .session
            .save_session(inner.auth.user_id().as_deref(), current.max(next), completed);

        self.emit(EngineEvent::StepSaved { step });
        self.schedule_if_online();
        Some(progress)
    }

    /// Queue the completion record for the finished wizard.
    pub fn complete_onboarding(&self) -> SyncQueueItem {
        let now = self.inner.clock.now_ms();
        let item = self.inner.queue.enqueue(
            SyncKind::Completion,
            json!({ "userId": self.inner.auth.user_id(), "completedAt": now }),
        );
        info!(id = %item.id, "onboarding completed");
        self.schedule_if_online();
        item
    }

    /// Persist the profile locally and queue it for the server.
    pub fn update_preferences(&self, prefs: &UserPreferences) -> UserPreferences {
        let saved = self.inner.preferences.save(prefs);
        self.inner
            .queue
            .enqueue(SyncKind::PreferenceUpdate, json!(saved));
        self.schedule_if_online();
        saved
    }

    pub fn preferences(&self) -> Option<UserPreferences> {
        self.inner.preferences.load()
    }

    pub fn restore_session(&self) -> Option<SessionState> {
        self.inner.session.restore_session()
    }

    pub fn resume_step(&self) -> u32 {
        self.inner.session.resume_step()
    }

    pub fn step_progress(&self) -> StepProgressMap {
        self.inner.session.get_step_progress()
    }

    pub fn recover_step_data(&self, step: u32) -> Option<StepPayload> {
        self.inner.session.recover_step_data(step)
    }

    /// The app became visible again: keep the session alive and sync soon.
    pub fn on_visibility_regained(&self) -> Option<SessionState> {
        let session = self.inner.session.touch();
        self.schedule_if_online();
        session
    }

    /// Send everything queued right now, unless a drain is already running.
    ///
    /// A call that finds a drain running is not lost: another debounced
    /// drain is scheduled once the running one ends, if items remain.
    pub async fn sync_now(&self) -> SyncOutcome {
        let inner = &self.inner;
        while inner.syncing.swap(true, Ordering::AcqRel) {
            inner.rerun_requested.store(true, Ordering::Release);
            if inner.syncing.load(Ordering::Acquire) {
                debug!("drain already in progress, another pass will follow");
                return SyncOutcome::Skipped(SkipReason::AlreadySyncing);
            }
            // The running drain ended before it saw the request; take over.
        }
        let outcome = {
            let _guard = SyncingGuard(&inner.syncing);
            self.drain_queue().await
        };
        self.after_drain(&outcome);
        outcome
    }

    async fn drain_queue(&self) -> SyncOutcome {
        let inner = &self.inner;
        if self.network_status() == NetworkStatus::Offline {
            return SyncOutcome::Skipped(SkipReason::Offline);
        }
        let Some(token) = inner.auth.token().filter(|_| inner.auth.is_authenticated()) else {
            debug!("not authenticated, leaving sync queue untouched");
            return SyncOutcome::Skipped(SkipReason::NotAuthenticated);
        };
        let pending = inner.queue.len();
        if pending == 0 {
            return SyncOutcome::Skipped(SkipReason::EmptyQueue);
        }

        self.emit(EngineEvent::SyncStarted { pending });
        let executor = &inner.executor;
        let transport = &inner.transport;
        let options = &inner.send_options;
        let token = token.as_str();
        let report = inner
            .queue
            .drain(move |item| async move {
                executor
                    .execute_with_retry(|| transport.send(&item, token), options)
                    .await
                    .map_err(send_failure)
            })
            .await;

        let now = inner.clock.now_ms();
        inner
            .session
            .update_recovery_metadata(|metadata| metadata.last_sync_time = Some(now));
        for item in &report.dropped {
            self.emit(EngineEvent::SyncFailedPermanently { item: item.clone() });
        }
        self.emit(EngineEvent::SyncCompleted {
            success: report.success,
            failed: report.failed,
        });
        SyncOutcome::Completed(report)
    }

    /// Follow-up scheduling once a drain released the single-flight guard.
    fn after_drain(&self, outcome: &SyncOutcome) {
        let rerun = self.inner.rerun_requested.swap(false, Ordering::AcqRel);
        match outcome {
            SyncOutcome::Completed(report) if report.deferred > 0 => {
                let cool_down =
                    Duration::from_millis(self.inner.config.circuit_breaker.timeout_ms);
                if self.network_status() == NetworkStatus::Online {
                    debug!(
                        deferred = report.deferred,
                        ?cool_down,
                        "drain deferred by open circuit"
                    );
                    self.schedule_sync(cool_down);
                }
            }
            _ if rerun && !self.inner.queue.is_empty() => self.schedule_if_online(),
            _ => {}
        }
    }

    /// Reconcile with the configured strategy.
    pub async fn reconcile(&self) -> Result<ReconcileOutcome> {
        self.reconcile_with(self.inner.config.conflict_strategy, None)
            .await
    }

    /// Compare the cached profile with the server and settle differences.
    ///
    /// The resolved profile is stored locally and, when it differs from the
    /// server copy, queued as a preference update.
    pub async fn reconcile_with(
        &self,
        strategy: ConflictStrategy,
        manual_override: Option<&serde_json::Value>,
    ) -> Result<ReconcileOutcome> {
        let inner = &self.inner;
        let user_id = self.authenticated_user()?;

        let Some(local) = inner.preferences.load() else {
            return match self.fetch_remote(&user_id).await? {
                Some(remote) => {
                    inner.preferences.replace(&remote);
                    info!(user_id = %user_id, "adopted server profile");
                    Ok(ReconcileOutcome::AdoptedRemote(remote))
                }
                None => Ok(ReconcileOutcome::NoLocalData),
            };
        };

        let report = inner.resolver.check_for_conflicts(&user_id, &local).await?;
        let Some(remote) = report.remote else {
            let result = self.run_migration(&user_id, inner.migrations.options()).await;
            return Ok(ReconcileOutcome::Migrated(result));
        };
        if !report.has_conflicts {
            return Ok(ReconcileOutcome::InSync);
        }

        let conflicts = report.conflicts;
        self.emit(EngineEvent::ConflictDetected {
            conflicts: conflicts.clone(),
        });
        if strategy == ConflictStrategy::Manual && manual_override.is_none() {
            return Ok(ReconcileOutcome::NeedsManualResolution { conflicts, remote });
        }

        let merged = inner
            .resolver
            .resolve_conflicts(strategy, &local, &remote, manual_override)?;
        inner.preferences.replace(&merged);
        if merged != remote {
            inner
                .queue
                .enqueue(SyncKind::PreferenceUpdate, json!(merged));
            self.schedule_if_online();
        }
        info!(user_id = %user_id, %strategy, ?conflicts, "profile conflicts resolved");
        Ok(ReconcileOutcome::Resolved {
            strategy,
            conflicts,
            merged,
        })
    }

    /// Push the cached profile to the server with the configured options.
    pub async fn migrate(&self) -> Result<MigrationResult> {
        let options = self.inner.migrations.options().clone();
        self.migrate_with(&options).await
    }

    pub async fn migrate_with(&self, options: &MigrationOptions) -> Result<MigrationResult> {
        let user_id = self.authenticated_user()?;
        Ok(self.run_migration(&user_id, options).await)
    }

    pub fn rollback_migration(&self, rollback_data: &UserPreferences) {
        self.inner.migrations.rollback_migration(rollback_data);
    }

    /// Forget all local state and close the breaker.
    pub fn reset(&self) {
        self.cancel_debounce();
        self.inner.session.clear_all();
        self.inner.preferences.clear();
        self.inner.executor.breaker().reset();
        info!("sync engine reset");
    }

    /// Snapshot of the engine. Reads only: an expired session is reported
    /// as absent but left for the next restore to clear.
    pub fn status(&self) -> EngineStatus {
        let inner = &self.inner;
        let session = inner.session.peek_session();
        let resume_step = session
            .as_ref()
            .map_or(1, |s| s.resume_step(inner.session.total_steps()));
        EngineStatus {
            started: self.is_started(),
            network: self.network_status(),
            authenticated: inner.auth.is_authenticated(),
            pending: inner.queue.len(),
            breaker: inner.executor.breaker().snapshot(),
            recovery: inner.session.recovery_metadata(),
            session,
            resume_step,
            storage_degraded: inner.session.is_degraded(),
            migration_complete: inner.preferences.is_migration_complete(),
        }
    }

    async fn run_migration(&self, user_id: &str, options: &MigrationOptions) -> MigrationResult {
        let result = self.inner.migrations.migrate_with(user_id, options).await;
        self.emit(EngineEvent::MigrationResult {
            success: result.success,
            migrated_records: result.migrated_records,
            error: result.error.as_ref().map(ToString::to_string),
        });
        result
    }

    async fn fetch_remote(&self, user_id: &str) -> Result<Option<UserPreferences>> {
        let api = &self.inner.profile_api;
        let remote = self
            .inner
            .executor
            .execute_with_retry(|| api.fetch_profile(user_id), &self.inner.fetch_options)
            .await?;
        Ok(remote)
    }

    fn authenticated_user(&self) -> Result<String> {
        let auth = &self.inner.auth;
        auth.user_id()
            .filter(|_| auth.is_authenticated())
            .ok_or(EngineError::NotAuthenticated)
    }

    fn debounce(&self) -> Duration {
        Duration::from_millis(self.inner.config.sync.debounce_ms)
    }

    fn schedule_if_online(&self) {
        if self.network_status() == NetworkStatus::Online {
            self.schedule_sync(self.debounce());
        }
    }

    /// Run `sync_now` after `delay`, replacing any pending schedule.
    ///
    /// Only the wait is debounced; a drain that already began runs to
    /// completion unless the engine stops. No-op before `start`.
    fn schedule_sync(&self, delay: Duration) {
        let (shutdown, token) = {
            let mut lifecycle = self.lifecycle();
            let Some(shutdown) = lifecycle.shutdown.clone() else {
                return;
            };
            if let Some(previous) = lifecycle.debounce.take() {
                previous.cancel();
            }
            let token = shutdown.child_token();
            lifecycle.debounce = Some(token.clone());
            (shutdown, token)
        };

        let engine = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            tokio::select! {
                _ = shutdown.cancelled() => debug!("drain interrupted by shutdown"),
                outcome = engine.sync_now() => debug!(?outcome, "scheduled drain finished"),
            }
        });
    }

    fn cancel_debounce(&self) {
        if let Some(token) = self.lifecycle().debounce.take() {
            token.cancel();
        }
    }

    fn on_network_change(&self, previous: NetworkStatus, status: NetworkStatus) {
        let reconnected = previous == NetworkStatus::Offline && status == NetworkStatus::Online;
        let metadata = self.inner.session.update_recovery_metadata(|metadata| {
            metadata.network_status = status;
            if reconnected {
                metadata.recovery_count = metadata.recovery_count.saturating_add(1);
            }
        });
        info!(
            ?previous,
            ?status,
            recovery_count = metadata.recovery_count,
            "network status changed"
        );
        self.emit(EngineEvent::NetworkChanged { status });

        match status {
            NetworkStatus::Online if reconnected && !self.inner.queue.is_empty() => {
                self.schedule_sync(Duration::ZERO);
            }
            NetworkStatus::Online => self.schedule_sync(self.debounce()),
            NetworkStatus::Offline => self.cancel_debounce(),
            NetworkStatus::Unknown => {}
        }
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.inner.events.send(event);
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.inner
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// An open circuit means nothing was attempted, so the item keeps its budget.
fn send_failure(err: RequestError) -> SendFailure<RequestError> {
    if err.kind == ErrorKind::CircuitOpen {
        SendFailure::Deferred(err)
    } else {
        SendFailure::Rejected(err)
    }
}

async fn watch_network(
    engine: SyncEngine,
    mut network: watch::Receiver<NetworkStatus>,
    mut previous: NetworkStatus,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            changed = network.changed() => {
                if changed.is_err() {
                    debug!("network status source closed");
                    break;
                }
                let status = *network.borrow_and_update();
                if status != previous {
                    engine.on_network_change(previous, status);
                    previous = status;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::StaticAuth;
    use async_trait::async_trait;
    use huddle_protocol::ContentPreferences;
    use huddle_protocol::ManualClock;
    use huddle_protocol::NewsTypePreference;
    use huddle_protocol::SportPreference;
    use huddle_protocol::TeamPreference;
    use huddle_reconcile::CreateProfileRequest;
    use huddle_reconcile::SPORTS_CONFLICT;
    use huddle_retry::CircuitState;
    use huddle_store::KeyValueStore;
    use huddle_store::MemoryStore;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::sleep;

    #[derive(Default)]
    struct FakeTransport {
        sent: Mutex<Vec<SyncQueueItem>>,
        failure: Mutex<Option<RequestError>>,
        latency: Mutex<Option<Duration>>,
        calls: AtomicUsize,
    }

    impl FakeTransport {
        fn sent_ids(&self) -> Vec<String> {
            self.sent
                .lock()
                .expect("lock")
                .iter()
                .map(|item| item.id.clone())
                .collect()
        }

        fn sent_count(&self) -> usize {
            self.sent.lock().expect("lock").len()
        }
    }

    #[async_trait]
    impl SyncTransport for FakeTransport {
        async fn send(
            &self,
            item: &SyncQueueItem,
            _token: &str,
        ) -> std::result::Result<(), RequestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let latency = *self.latency.lock().expect("lock");
            if let Some(latency) = latency {
                sleep(latency).await;
            }
            if let Some(err) = self.failure.lock().expect("lock").clone() {
                return Err(err);
            }
            self.sent.lock().expect("lock").push(item.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeProfileApi {
        profile: Mutex<Option<UserPreferences>>,
        created: Mutex<Vec<CreateProfileRequest>>,
    }

    #[async_trait]
    impl ProfileApi for FakeProfileApi {
        async fn fetch_profile(
            &self,
            _user_id: &str,
        ) -> std::result::Result<Option<UserPreferences>, RequestError> {
            Ok(self.profile.lock().expect("lock").clone())
        }

        async fn create_profile(
            &self,
            request: &CreateProfileRequest,
        ) -> std::result::Result<UserPreferences, RequestError> {
            self.created.lock().expect("lock").push(request.clone());
            Ok(UserPreferences::default())
        }
    }

    struct Harness {
        engine: SyncEngine,
        network: watch::Sender<NetworkStatus>,
        transport: Arc<FakeTransport>,
        api: Arc<FakeProfileApi>,
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
    }

    fn harness(status: NetworkStatus, auth: StaticAuth) -> Harness {
        let (network, network_rx) = watch::channel(status);
        let transport = Arc::new(FakeTransport::default());
        let api = Arc::new(FakeProfileApi::default());
        let clock = Arc::new(ManualClock::new(1_000));
        let store = Arc::new(MemoryStore::new());
        let engine = SyncEngine::new(
            EngineConfig::default(),
            Capabilities {
                store: store.clone(),
                auth: Arc::new(auth),
                clock: clock.clone(),
                transport: transport.clone(),
                profile_api: api.clone(),
                network: network_rx,
            },
        );
        Harness {
            engine,
            network,
            transport,
            api,
            clock,
            store,
        }
    }

    fn signed_in() -> StaticAuth {
        StaticAuth::new("token", "user-1")
    }

    fn sports_step() -> StepPayload {
        StepPayload::Sports {
            selected_sports: vec![SportPreference::new("nfl", "NFL", 1)],
        }
    }

    fn profile(sport_ids: &[&str]) -> UserPreferences {
        UserPreferences {
            id: Some("user-1".into()),
            sports: sport_ids
                .iter()
                .enumerate()
                .map(|(i, id)| SportPreference::new(*id, id.to_uppercase(), i as u32 + 1))
                .collect(),
            teams: Vec::new(),
            preferences: ContentPreferences {
                news_types: vec![NewsTypePreference::new("breaking", true, 1)],
                ..Default::default()
            },
            updated_at: None,
        }
    }

    fn events(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    /// Let spawned tasks run without advancing past any debounce.
    async fn settle() {
        sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn offline_step_is_kept_and_drained_on_reconnect() {
        let h = harness(NetworkStatus::Offline, signed_in());
        let mut rx = h.engine.subscribe();
        h.engine.start();

        h.engine.save_step(2, sports_step());
        sleep(Duration::from_secs(30)).await;
        assert_eq!(h.transport.sent_count(), 0);
        assert_eq!(h.engine.status().pending, 1);

        h.network.send(NetworkStatus::Online).expect("watcher alive");
        settle().await;

        assert_eq!(h.transport.sent_count(), 1);
        let status = h.engine.status();
        assert_eq!(status.pending, 0);
        assert_eq!(status.recovery.recovery_count, 1);
        assert_eq!(status.recovery.network_status, NetworkStatus::Online);
        assert_eq!(status.recovery.last_sync_time, Some(1_000));

        let seen = events(&mut rx);
        assert!(seen.contains(&EngineEvent::StepSaved { step: 2 }));
        assert!(seen.contains(&EngineEvent::NetworkChanged {
            status: NetworkStatus::Online
        }));
        assert!(seen.contains(&EngineEvent::SyncCompleted {
            success: 1,
            failed: 0
        }));
        h.engine.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_saves_share_one_debounced_drain() {
        let h = harness(NetworkStatus::Online, signed_in());
        let mut rx = h.engine.subscribe();
        h.engine.start();

        h.engine.save_step(1, StepPayload::Welcome);
        sleep(Duration::from_secs(2)).await;
        h.clock.advance(2_000);
        h.engine.save_step(2, sports_step());

        sleep(Duration::from_secs(4)).await;
        assert_eq!(h.transport.sent_count(), 0);

        sleep(Duration::from_secs(2)).await;
        assert_eq!(
            h.transport.sent_ids(),
            vec!["step_1_1000".to_string(), "step_2_3000".to_string()]
        );
        let started: Vec<_> = events(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, EngineEvent::SyncStarted { .. }))
            .collect();
        assert_eq!(started, vec![EngineEvent::SyncStarted { pending: 2 }]);
        h.engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn step_saved_during_a_slow_drain_is_sent_by_a_follow_up() {
        let h = harness(NetworkStatus::Online, signed_in());
        *h.transport.latency.lock().expect("lock") = Some(Duration::from_secs(8));
        h.engine.start();

        // Drain of step 1 runs from t=5s to t=13s.
        h.engine.save_step(1, StepPayload::Welcome);
        sleep(Duration::from_secs(6)).await;
        h.clock.advance(6_000);
        // Its debounce fires at t=11s, while the first drain is still sending.
        h.engine.save_step(2, sports_step());

        sleep(Duration::from_secs(60)).await;
        assert_eq!(
            h.transport.sent_ids(),
            vec!["step_1_1000".to_string(), "step_2_7000".to_string()]
        );
        assert_eq!(h.engine.status().pending, 0);
        h.engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_defers_the_queue_without_spending_retries() {
        let h = harness(NetworkStatus::Online, signed_in());
        *h.transport.failure.lock().expect("lock") =
            Some(RequestError::http(503, "unavailable"));
        for step in 1..=5 {
            h.engine.save_step(step, StepPayload::Welcome);
        }

        let SyncOutcome::Completed(first) = h.engine.sync_now().await else {
            panic!("drain should run");
        };
        assert_eq!(first.retained, 5);
        assert_eq!(h.engine.status().breaker.state, CircuitState::Open);
        let calls = h.transport.calls.load(Ordering::SeqCst);

        for _ in 0..2 {
            let SyncOutcome::Completed(report) = h.engine.sync_now().await else {
                panic!("drain should run");
            };
            assert_eq!(report.deferred, 5);
            assert_eq!(report.attempted(), 0);
            assert!(report.dropped.is_empty());
        }
        assert_eq!(h.transport.calls.load(Ordering::SeqCst), calls);
        assert_eq!(h.engine.status().pending, 5);

        // Once the cool-down passes the same items go through.
        h.clock.advance(60_001);
        *h.transport.failure.lock().expect("lock") = None;
        let SyncOutcome::Completed(report) = h.engine.sync_now().await else {
            panic!("drain should run");
        };
        assert_eq!(report.success, 5);
        assert_eq!(report.failed, 0);
        assert_eq!(h.engine.status().pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn flapping_connection_sends_each_item_once() {
        let h = harness(NetworkStatus::Online, signed_in());
        h.engine.start();
        h.engine.save_step(1, StepPayload::Welcome);

        for status in [
            NetworkStatus::Offline,
            NetworkStatus::Online,
            NetworkStatus::Offline,
            NetworkStatus::Online,
        ] {
            h.network.send(status).expect("watcher alive");
            settle().await;
        }
        sleep(Duration::from_secs(10)).await;

        assert_eq!(h.transport.sent_count(), 1);
        assert_eq!(h.engine.status().recovery.recovery_count, 2);
        h.engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn going_offline_cancels_the_pending_drain() {
        let h = harness(NetworkStatus::Online, signed_in());
        h.engine.start();
        h.engine.save_step(1, StepPayload::Welcome);

        h.network.send(NetworkStatus::Offline).expect("watcher alive");
        sleep(Duration::from_secs(10)).await;
        assert_eq!(h.transport.sent_count(), 0);
        assert_eq!(h.engine.status().pending, 1);
        h.engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_scheduled_drains() {
        let h = harness(NetworkStatus::Online, signed_in());
        h.engine.start();
        h.engine.save_step(1, StepPayload::Welcome);
        h.engine.stop().await;
        assert!(!h.engine.is_started());

        sleep(Duration::from_secs(10)).await;
        assert_eq!(h.transport.sent_count(), 0);

        h.engine.save_step(2, sports_step());
        sleep(Duration::from_secs(10)).await;
        assert_eq!(h.transport.sent_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sync_is_skipped_without_auth_or_network() {
        let h = harness(NetworkStatus::Online, StaticAuth::anonymous());
        assert_eq!(
            h.engine.sync_now().await,
            SyncOutcome::Skipped(SkipReason::NotAuthenticated)
        );

        h.engine.save_step(1, StepPayload::Welcome);
        assert_eq!(
            h.engine.sync_now().await,
            SyncOutcome::Skipped(SkipReason::NotAuthenticated)
        );
        assert_eq!(h.engine.status().pending, 1);

        let h = harness(NetworkStatus::Offline, signed_in());
        h.engine.save_step(1, StepPayload::Welcome);
        assert_eq!(
            h.engine.sync_now().await,
            SyncOutcome::Skipped(SkipReason::Offline)
        );

        let h = harness(NetworkStatus::Online, signed_in());
        assert_eq!(
            h.engine.sync_now().await,
            SyncOutcome::Skipped(SkipReason::EmptyQueue)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_item_is_reported_and_dropped() {
        let h = harness(NetworkStatus::Online, signed_in());
        *h.transport.failure.lock().expect("lock") =
            Some(RequestError::http(422, "rejected"));
        let mut rx = h.engine.subscribe();
        h.engine.save_step(1, StepPayload::Welcome);

        for _ in 0..2 {
            match h.engine.sync_now().await {
                SyncOutcome::Completed(report) => assert_eq!(report.retained, 1),
                other => panic!("unexpected: {other:?}"),
            }
        }
        let SyncOutcome::Completed(report) = h.engine.sync_now().await else {
            panic!("drain should run");
        };
        assert_eq!(report.failed, 1);
        assert_eq!(h.engine.status().pending, 0);

        let dropped: Vec<_> = events(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::SyncFailedPermanently { item } => Some(item.id),
                _ => None,
            })
            .collect();
        assert_eq!(dropped, vec!["step_1_1000".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn save_step_keeps_current_step_ahead_of_completed() {
        let h = harness(NetworkStatus::Offline, signed_in());
        h.engine.save_step(1, StepPayload::Welcome);
        h.engine.save_step(2, sports_step());

        let session = h.engine.restore_session().expect("session saved");
        assert_eq!(session.completed_steps, BTreeSet::from([1, 2]));
        assert_eq!(session.current_step, 3);
        assert_eq!(session.user_id.as_deref(), Some("user-1"));
        assert_eq!(h.engine.resume_step(), 3);
        assert_eq!(h.engine.recover_step_data(2), Some(sports_step()));

        h.engine.save_step(1, StepPayload::Welcome);
        assert_eq!(h.engine.restore_session().expect("session").current_step, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn steps_outside_the_wizard_change_nothing() {
        let h = harness(NetworkStatus::Offline, signed_in());
        let mut rx = h.engine.subscribe();
        assert_eq!(h.engine.save_step(0, StepPayload::Welcome), None);
        assert_eq!(h.engine.save_step(9, StepPayload::Complete), None);

        assert_eq!(h.engine.restore_session(), None);
        assert_eq!(h.engine.status().pending, 0);
        assert_eq!(h.engine.step_progress().len(), 5);
        assert!(events(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn status_reads_without_clearing_an_expired_session() {
        let h = harness(NetworkStatus::Offline, signed_in());
        h.engine.save_step(1, StepPayload::Welcome);
        assert_eq!(h.engine.status().resume_step, 2);

        h.clock.advance(25 * 60 * 60 * 1000);
        let status = h.engine.status();
        assert_eq!(status.session, None);
        assert_eq!(status.resume_step, 1);
        assert!(h.store.get("huddle_session").expect("get").is_some());

        assert_eq!(h.engine.restore_session(), None);
        assert_eq!(h.store.get("huddle_session").expect("get"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn visibility_regained_refreshes_the_session() {
        let h = harness(NetworkStatus::Offline, signed_in());
        h.engine.save_step(1, StepPayload::Welcome);
        h.clock.advance(60_000);

        let session = h.engine.on_visibility_regained().expect("session exists");
        assert_eq!(session.last_active_time, 61_000);
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_merges_and_queues_the_result() {
        let h = harness(NetworkStatus::Offline, signed_in());
        let mut remote = profile(&["nfl", "nba"]);
        remote.updated_at = Some(5);
        *h.api.profile.lock().expect("lock") = Some(remote);

        let mut local = profile(&["nfl"]);
        local.teams.push(TeamPreference::new("kc", "Chiefs", "nfl"));
        h.engine.update_preferences(&local);
        let mut rx = h.engine.subscribe();

        let outcome = h.engine.reconcile().await.expect("reconcile");
        let ReconcileOutcome::Resolved {
            strategy,
            conflicts,
            merged,
        } = outcome
        else {
            panic!("expected a resolution, got {outcome:?}");
        };
        assert_eq!(strategy, ConflictStrategy::Merge);
        assert_eq!(conflicts.len(), 2);
        assert!(conflicts.contains(&SPORTS_CONFLICT.to_string()));
        assert_eq!(merged.sport_ids(), vec!["nba", "nfl"]);
        assert_eq!(merged.team_ids(), vec!["kc"]);
        assert_eq!(h.engine.preferences(), Some(merged));
        assert_eq!(h.engine.status().pending, 2);
        assert!(matches!(
            events(&mut rx).as_slice(),
            [EngineEvent::ConflictDetected { .. }]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn manual_strategy_without_override_changes_nothing() {
        let h = harness(NetworkStatus::Offline, signed_in());
        *h.api.profile.lock().expect("lock") = Some(profile(&["nba"]));
        let local = h.engine.update_preferences(&profile(&["nfl"]));

        let outcome = h
            .engine
            .reconcile_with(ConflictStrategy::Manual, None)
            .await
            .expect("reconcile");
        assert!(matches!(
            outcome,
            ReconcileOutcome::NeedsManualResolution { .. }
        ));
        assert_eq!(h.engine.preferences(), Some(local));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_server_profile_triggers_migration() {
        let h = harness(NetworkStatus::Offline, signed_in());
        h.engine.update_preferences(&profile(&["nfl"]));
        let mut rx = h.engine.subscribe();

        let outcome = h.engine.reconcile().await.expect("reconcile");
        let ReconcileOutcome::Migrated(result) = outcome else {
            panic!("expected migration, got {outcome:?}");
        };
        assert!(result.success);
        assert_eq!(h.api.created.lock().expect("lock").len(), 1);
        assert!(h.engine.status().migration_complete);
        assert_eq!(
            events(&mut rx),
            vec![EngineEvent::MigrationResult {
                success: true,
                migrated_records: 2,
                error: None,
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn remote_profile_is_adopted_when_nothing_is_cached() {
        let h = harness(NetworkStatus::Offline, signed_in());
        *h.api.profile.lock().expect("lock") = Some(profile(&["nhl"]));

        let outcome = h.engine.reconcile().await.expect("reconcile");
        assert_eq!(outcome, ReconcileOutcome::AdoptedRemote(profile(&["nhl"])));
        assert_eq!(h.engine.preferences(), Some(profile(&["nhl"])));
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_requires_authentication() {
        let h = harness(NetworkStatus::Online, StaticAuth::anonymous());
        assert!(matches!(
            h.engine.reconcile().await,
            Err(EngineError::NotAuthenticated)
        ));
        assert!(matches!(
            h.engine.migrate().await,
            Err(EngineError::NotAuthenticated)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_forgets_everything() {
        let h = harness(NetworkStatus::Offline, signed_in());
        h.engine.save_step(1, StepPayload::Welcome);
        h.engine.update_preferences(&profile(&["nfl"]));
        h.engine.complete_onboarding();
        assert_eq!(h.engine.status().pending, 3);

        h.engine.reset();
        let status = h.engine.status();
        assert_eq!(status.pending, 0);
        assert_eq!(status.session, None);
        assert_eq!(status.resume_step, 1);
        assert_eq!(h.engine.preferences(), None);
        assert_eq!(h.engine.step_progress().values().filter(|p| p.completed).count(), 0);
    }
}
