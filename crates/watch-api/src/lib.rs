//! In-process sync facade with background message pumping, auto-flush, the
//! debounced patrol settle loop, and an HTTP/WebSocket server surface.

mod persistence;
mod server;

use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Instant;

use contracts::{
    ChangeNotice, ConflictRecord, Organization, OrganizationPatch, Patrol, PatrolPatch,
    PatrolSeed, StatBreakdownEntry, StatModifier, SyncConfig,
};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;
use watch_core::aggregate;
use watch_core::authority::{AuthorityProvider, FixedAuthority};
use watch_core::channel::{BroadcastChannel, LocalBus};
use watch_core::coordinator::SyncCoordinator;
use watch_core::store::{FallbackStore, StoreLocator};
use watch_core::{StoreError, SyncError};

pub use persistence::SqliteStores;
pub use server::{serve, ServerError};

/// Cadence of the patrol settle check; well under the debounce window so a
/// due write lands close to its deadline.
const SETTLE_TICK_MS: u64 = 50;

pub struct WatchApi {
    coordinator: Arc<Mutex<SyncCoordinator>>,
    channel: Arc<dyn BroadcastChannel>,
    workers: StdMutex<Vec<JoinHandle<()>>>,
}

impl WatchApi {
    /// Builds the coordinator, runs its startup load/handshake, and spawns
    /// the background workers.
    pub async fn start(
        config: SyncConfig,
        authority: Arc<dyn AuthorityProvider>,
        channel: Arc<dyn BroadcastChannel>,
        locator: Arc<dyn StoreLocator>,
        fallback: Arc<dyn FallbackStore>,
    ) -> Arc<Self> {
        let mut coordinator =
            SyncCoordinator::new(config, authority, Arc::clone(&channel), locator, fallback);
        coordinator.initialize().await;

        let api = Arc::new(Self {
            coordinator: Arc::new(Mutex::new(coordinator)),
            channel,
            workers: StdMutex::new(Vec::new()),
        });
        api.spawn_workers().await;
        api
    }

    /// Privileged host wired to a SQLite-backed dual store and an in-process
    /// bus; the arrangement the CLI `serve` command runs.
    pub async fn start_host(
        config: SyncConfig,
        sqlite_path: impl AsRef<Path>,
    ) -> Result<Arc<Self>, StoreError> {
        let stores = SqliteStores::open(sqlite_path)?;
        let api = Self::start(
            config,
            Arc::new(FixedAuthority::privileged()),
            Arc::new(LocalBus::new()),
            stores.locator(),
            stores.fallback(),
        )
        .await;
        Ok(api)
    }

    async fn spawn_workers(self: &Arc<Self>) {
        let mut workers = Vec::with_capacity(3);

        let pump = Arc::clone(&self.coordinator);
        let mut rx = self.channel.subscribe();
        workers.push(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => pump.lock().await.handle_incoming(message).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "incoming pump lagged behind the channel");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        let flush_interval = self.coordinator.lock().await.flush_interval();
        let flusher = Arc::clone(&self.coordinator);
        workers.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let mut coordinator = flusher.lock().await;
                if coordinator.auto_flush() && coordinator.pending_changes() > 0 {
                    coordinator.flush().await;
                }
            }
        }));

        let settler = Arc::clone(&self.coordinator);
        workers.push(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_millis(SETTLE_TICK_MS));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                settler.lock().await.settle_patrols(Instant::now()).await;
            }
        }));

        if let Ok(mut slot) = self.workers.lock() {
            *slot = workers;
        }
    }

    /// Stops the background workers and drops queued changes. The facade is
    /// inert afterwards.
    pub async fn dispose(&self) {
        self.abort_workers();
        self.coordinator.lock().await.dispose();
    }

    pub async fn subscribe_changes(&self) -> broadcast::Receiver<ChangeNotice> {
        self.coordinator.lock().await.subscribe_notices()
    }

    pub async fn config(&self) -> SyncConfig {
        self.coordinator.lock().await.config().clone()
    }

    pub async fn organization(&self) -> Option<Organization> {
        self.coordinator.lock().await.organization().cloned()
    }

    pub async fn create_organization(
        &self,
        fields: OrganizationPatch,
    ) -> Result<Organization, SyncError> {
        self.coordinator.lock().await.create_organization(fields).await
    }

    pub async fn update_organization(
        &self,
        patch: OrganizationPatch,
    ) -> Result<Option<Organization>, SyncError> {
        self.coordinator.lock().await.update_organization(patch).await
    }

    pub async fn delete_organization(&self) -> Organization {
        self.coordinator.lock().await.delete_organization().await
    }

    pub async fn organization_breakdown(
        &self,
        modifiers: &[StatModifier],
    ) -> Option<Vec<StatBreakdownEntry>> {
        let coordinator = self.coordinator.lock().await;
        coordinator
            .organization()
            .map(|organization| aggregate::organization_breakdown(organization, modifiers))
    }

    pub async fn patrols(&self) -> Vec<Patrol> {
        self.coordinator.lock().await.patrols()
    }

    pub async fn patrol(&self, id: &str) -> Option<Patrol> {
        self.coordinator.lock().await.patrol(id).cloned()
    }

    pub async fn create_patrol(
        &self,
        seed: PatrolSeed,
        modifiers: &[StatModifier],
    ) -> Result<Option<Patrol>, SyncError> {
        self.coordinator
            .lock()
            .await
            .create_patrol(seed, modifiers)
            .await
    }

    pub async fn update_patrol(
        &self,
        id: &str,
        patch: &PatrolPatch,
    ) -> Result<Option<Patrol>, SyncError> {
        self.coordinator.lock().await.update_patrol(id, patch).await
    }

    pub async fn delete_patrol(&self, id: &str) -> Option<Patrol> {
        self.coordinator.lock().await.delete_patrol(id).await
    }

    pub async fn recalc_all_patrols(&self, modifiers: &[StatModifier]) -> usize {
        self.coordinator
            .lock()
            .await
            .recalc_all_patrols(modifiers)
            .await
    }

    pub async fn conflicts(&self) -> Vec<ConflictRecord> {
        self.coordinator.lock().await.conflicts().to_vec()
    }

    pub async fn resolve_conflict(
        &self,
        index: usize,
        choose_remote: bool,
    ) -> Result<Organization, SyncError> {
        self.coordinator
            .lock()
            .await
            .resolve_conflict(index, choose_remote)
            .await
    }

    pub async fn request_sync(&self) {
        self.coordinator.lock().await.request_sync().await;
    }

    /// Store-became-available hook: re-runs discovery and re-persists the
    /// current state. Returns whether the shared write landed.
    pub async fn refresh_stores(&self) -> bool {
        self.coordinator.lock().await.refresh_stores().await
    }

    pub async fn flush_now(&self) -> usize {
        self.coordinator.lock().await.flush().await
    }

    pub async fn pending_changes(&self) -> usize {
        self.coordinator.lock().await.pending_changes()
    }

    fn abort_workers(&self) {
        if let Ok(mut workers) = self.workers.lock() {
            for worker in workers.drain(..) {
                worker.abort();
            }
        }
    }
}

impl Drop for WatchApi {
    fn drop(&mut self) {
        self.abort_workers();
    }
}
