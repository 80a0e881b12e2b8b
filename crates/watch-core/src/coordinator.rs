//! Sync coordinator: owns the organization aggregate and its patrol manager,
//! queues outgoing changes, dispatches incoming messages through conflict
//! detection, and drives the dual-store persistence. Constructed explicitly
//! and injected into collaborators; there is no module-level state.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use contracts::{
    ChangeKind, ChangeNotice, ConflictRecord, Organization, OrganizationPatch, Patrol,
    PatrolPatch, PatrolSeed, StatModifier, SyncConfig, SyncMessage, SyncPayload,
    SCHEMA_VERSION_V1,
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::aggregate::{self, AdoptOutcome};
use crate::authority::AuthorityProvider;
use crate::channel::BroadcastChannel;
use crate::conflict::{self, Winner};
use crate::patrol::PatrolManager;
use crate::store::{DualStoreAdapter, FallbackStore, SharedState, StoreLocator};
use crate::{now_ms, SyncError};

const NOTICE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    Queued,
    Sending,
    FailedRetry,
}

#[derive(Debug, Clone)]
struct PendingChange {
    sequence: u64,
    message: SyncMessage,
    queued_at_ms: u64,
    actor_id: String,
    high_priority: bool,
    state: PendingState,
    attempts: u32,
}

pub struct SyncCoordinator {
    config: SyncConfig,
    authority: Arc<dyn AuthorityProvider>,
    channel: Arc<dyn BroadcastChannel>,
    stores: DualStoreAdapter,
    organization: Option<Organization>,
    patrols: PatrolManager,
    queue: VecDeque<PendingChange>,
    next_sequence: u64,
    conflicts: Vec<ConflictRecord>,
    notices: broadcast::Sender<ChangeNotice>,
    auto_flush: bool,
    initialized: bool,
}

impl SyncCoordinator {
    pub fn new(
        config: SyncConfig,
        authority: Arc<dyn AuthorityProvider>,
        channel: Arc<dyn BroadcastChannel>,
        locator: Arc<dyn StoreLocator>,
        fallback: Arc<dyn FallbackStore>,
    ) -> Self {
        let stores = DualStoreAdapter::new(locator, fallback, Arc::clone(&authority), config.retry);
        let patrols = PatrolManager::new(Duration::from_millis(config.debounce_ms));
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let auto_flush = config.auto_flush;
        Self {
            config,
            authority,
            channel,
            stores,
            organization: None,
            patrols,
            queue: VecDeque::new(),
            next_sequence: 0,
            conflicts: Vec::new(),
            notices,
            auto_flush,
            initialized: false,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn organization(&self) -> Option<&Organization> {
        self.organization.as_ref()
    }

    pub fn patrol(&self, id: &str) -> Option<&Patrol> {
        self.patrols.get(id)
    }

    pub fn patrols(&self) -> Vec<Patrol> {
        self.patrols.list()
    }

    pub fn conflicts(&self) -> &[ConflictRecord] {
        &self.conflicts
    }

    pub fn pending_changes(&self) -> usize {
        self.queue.len()
    }

    pub fn auto_flush(&self) -> bool {
        self.auto_flush
    }

    pub fn set_auto_flush(&mut self, enabled: bool) {
        self.auto_flush = enabled;
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.config.flush_interval_ms)
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<ChangeNotice> {
        self.notices.subscribe()
    }

    /// Loads the best available copy of the aggregate: shared store first,
    /// then the world-scoped fallback. With neither available a privileged
    /// client creates and persists a default; an unprivileged client asks
    /// the peers and waits a bounded interval before defaulting locally.
    /// Also runs the one-shot legacy migration and orphan pruning.
    pub async fn initialize(&mut self) {
        if self.initialized {
            return;
        }

        if let Some(state) = self.stores.load_shared().await {
            self.organization = Some(state.organization);
            self.patrols.load(state.patrols);
        } else if let Some(organization) = self.stores.load_fallback().await {
            self.organization = Some(organization);
        } else if self.authority.is_privileged() {
            let organization = Organization::new_default(now_ms());
            self.organization = Some(organization.clone());
            self.persist_current().await;
            self.notify(ChangeNotice::AggregateChanged {
                organization,
                kind: ChangeKind::Create,
            });
        } else {
            self.request_and_wait().await;
            if self.organization.is_none() {
                debug!("no privileged peer answered; defaulting locally");
                let organization = Organization::new_default(now_ms());
                self.organization = Some(organization.clone());
                self.notify(ChangeNotice::AggregateChanged {
                    organization,
                    kind: ChangeKind::Create,
                });
            }
        }

        if let Some(mut organization) = self.organization.take() {
            let stamp = now_ms();
            let migrated = self.patrols.migrate_embedded(&mut organization, stamp);
            let pruned =
                aggregate::prune_orphans(&mut organization, |id| self.patrols.contains(id), stamp);
            self.organization = Some(organization.clone());
            if migrated > 0 || pruned > 0 {
                self.persist_current().await;
                self.notify(ChangeNotice::AggregateChanged {
                    organization,
                    kind: ChangeKind::Update,
                });
            }
        }

        self.initialized = true;
    }

    /// Drops queued changes and pending conflicts; the instance can be
    /// re-initialized afterwards.
    pub fn dispose(&mut self) {
        self.queue.clear();
        self.conflicts.clear();
        self.initialized = false;
    }

    /// Signals that the shared store's backing object may have (re)appeared:
    /// discovery is re-run from scratch and the current state re-persisted.
    /// Returns whether the shared write landed.
    pub async fn refresh_stores(&mut self) -> bool {
        self.stores.invalidate_handle().await;
        self.persist_current().await
    }

    /// Publishes a `request-aggregate` so a privileged peer re-sends its
    /// current state.
    pub async fn request_sync(&mut self) {
        let message = self.envelope(SyncPayload::RequestAggregate);
        if let Err(err) = self.channel.publish(message).await {
            warn!(error = %err, "failed to publish aggregate request");
        }
    }

    pub async fn create_organization(
        &mut self,
        fields: OrganizationPatch,
    ) -> Result<Organization, SyncError> {
        if self.organization.is_some() {
            if let Some(organization) = self.update_organization(fields.clone()).await? {
                return Ok(organization);
            }
        }

        let stamp = now_ms();
        let mut organization = Organization::new_default(stamp);
        aggregate::apply_patch(&mut organization, &fields, stamp)?;
        // Creation is one logical mutation; the seeded fields do not count as
        // a second one.
        organization.version = 1;
        self.organization = Some(organization.clone());
        self.persist_current().await;
        self.notify(ChangeNotice::AggregateChanged {
            organization: organization.clone(),
            kind: ChangeKind::Create,
        });
        self.queue_change(false).await;
        Ok(organization)
    }

    pub async fn update_organization(
        &mut self,
        patch: OrganizationPatch,
    ) -> Result<Option<Organization>, SyncError> {
        let Some(mut organization) = self.organization.clone() else {
            return Ok(None);
        };
        let changed = aggregate::apply_patch(&mut organization, &patch, now_ms())?;
        if !changed {
            return Ok(Some(organization));
        }
        self.organization = Some(organization.clone());
        self.persist_current().await;
        self.notify(ChangeNotice::AggregateChanged {
            organization: organization.clone(),
            kind: ChangeKind::Update,
        });
        self.queue_change(false).await;
        Ok(Some(organization))
    }

    /// "Delete" preserves the singleton: the aggregate is replaced by a fresh
    /// default whose version continues the local counter, so peers adopt the
    /// reset as a clean forward update. All patrols are dropped with it.
    pub async fn delete_organization(&mut self) -> Organization {
        let stamp = now_ms();
        let next_version = self
            .organization
            .as_ref()
            .map(|organization| organization.version + 1)
            .unwrap_or(1);
        let mut fresh = Organization::new_default(stamp);
        fresh.version = next_version;
        self.organization = Some(fresh.clone());
        self.patrols.load(Vec::new());
        self.persist_current().await;
        self.notify(ChangeNotice::AggregateChanged {
            organization: fresh.clone(),
            kind: ChangeKind::Delete,
        });
        self.queue_change(false).await;
        fresh
    }

    /// Creates a patrol and registers it in the parent aggregate; both
    /// changes persist immediately (not debounced, so fast navigation away
    /// cannot lose the patrol), followed by the usual debounced settle-write.
    pub async fn create_patrol(
        &mut self,
        seed: PatrolSeed,
        org_modifiers: &[StatModifier],
    ) -> Result<Option<Patrol>, SyncError> {
        let Some(mut organization) = self.organization.clone() else {
            return Ok(None);
        };
        let stamp = now_ms();
        let patrol = self
            .patrols
            .create(&organization.id, seed, org_modifiers, stamp)?;
        organization.patrol_ids.push(patrol.id.clone());
        organization.version += 1;
        organization.updated_at_ms = stamp;
        self.organization = Some(organization.clone());

        self.persist_current().await;
        self.patrols.mark_dirty(Instant::now());
        self.notify(ChangeNotice::PatrolChanged {
            patrol: patrol.clone(),
            kind: ChangeKind::Create,
        });
        self.notify(ChangeNotice::AggregateChanged {
            organization,
            kind: ChangeKind::Update,
        });
        self.queue_change(false).await;
        Ok(Some(patrol))
    }

    /// Debounced: rapid successive edits coalesce into a single settle-write
    /// driven by [`settle_patrols`](Self::settle_patrols).
    pub async fn update_patrol(
        &mut self,
        id: &str,
        patch: &PatrolPatch,
    ) -> Result<Option<Patrol>, SyncError> {
        let Some(patrol) = self.patrols.update(id, patch, now_ms())? else {
            return Ok(None);
        };
        self.patrols.mark_dirty(Instant::now());
        self.notify(ChangeNotice::PatrolChanged {
            patrol: patrol.clone(),
            kind: ChangeKind::Update,
        });
        self.queue_change(false).await;
        Ok(Some(patrol))
    }

    /// Removes the patrol and its parent reference in one logical operation,
    /// persisted immediately.
    pub async fn delete_patrol(&mut self, id: &str) -> Option<Patrol> {
        let removed = self.patrols.delete(id)?;
        if let Some(mut organization) = self.organization.clone() {
            let before = organization.patrol_ids.len();
            organization.patrol_ids.retain(|patrol_id| patrol_id != id);
            if organization.patrol_ids.len() != before {
                organization.version += 1;
                organization.updated_at_ms = now_ms();
            }
            self.organization = Some(organization);
        }
        self.persist_current().await;
        self.notify(ChangeNotice::PatrolChanged {
            patrol: removed.clone(),
            kind: ChangeKind::Delete,
        });
        self.queue_change(false).await;
        Some(removed)
    }

    /// Recalculates derived stats for every patrol against the resolved
    /// organization modifiers; unchanged patrols keep their version.
    pub async fn recalc_all_patrols(&mut self, org_modifiers: &[StatModifier]) -> usize {
        let changed = self.patrols.recalc_all(org_modifiers, now_ms());
        if changed.is_empty() {
            return 0;
        }
        let mut updated = Vec::with_capacity(changed.len());
        for id in &changed {
            if let Some(patrol) = self.patrols.get(id) {
                updated.push(patrol.clone());
            }
        }
        for patrol in updated {
            self.notify(ChangeNotice::PatrolChanged {
                patrol,
                kind: ChangeKind::Update,
            });
        }
        self.patrols.mark_dirty(Instant::now());
        self.queue_change(false).await;
        changed.len()
    }

    /// Fires the coalesced settle-write when its deadline has passed.
    pub async fn settle_patrols(&mut self, now: Instant) -> bool {
        if !self.patrols.settle_due(now) {
            return false;
        }
        self.persist_current().await;
        true
    }

    /// Appends the current aggregate state to the outgoing queue. A
    /// high-priority change flushes immediately when auto-flush is off.
    pub async fn queue_change(&mut self, high_priority: bool) {
        let Some(message) = self.current_update_message() else {
            return;
        };
        self.next_sequence += 1;
        self.queue.push_back(PendingChange {
            sequence: self.next_sequence,
            message,
            queued_at_ms: now_ms(),
            actor_id: self.config.client_id.clone(),
            high_priority,
            state: PendingState::Queued,
            attempts: 0,
        });
        if high_priority && !self.auto_flush {
            self.flush().await;
        }
    }

    /// Attempts to send every queued item. Items that fail stay queued for
    /// the next flush; the channel itself stays at-most-once past the local
    /// send. Returns the number sent.
    pub async fn flush(&mut self) -> usize {
        let mut sent = 0;
        let mut retained = VecDeque::new();
        while let Some(mut item) = self.queue.pop_front() {
            item.state = PendingState::Sending;
            match self.channel.publish(item.message.clone()).await {
                Ok(()) => {
                    sent += 1;
                }
                Err(err) => {
                    item.state = PendingState::FailedRetry;
                    item.attempts += 1;
                    warn!(
                        error = %err,
                        sequence = item.sequence,
                        actor = %item.actor_id,
                        queued_at_ms = item.queued_at_ms,
                        high_priority = item.high_priority,
                        "broadcast send failed; change stays queued"
                    );
                    retained.push_back(item);
                }
            }
        }
        self.queue = retained;
        sent
    }

    /// Routes one incoming wire message. Own echoes are dropped here when the
    /// transport did not already filter them.
    pub async fn handle_incoming(&mut self, message: SyncMessage) {
        let SyncMessage {
            origin_client_id,
            origin_privileged,
            payload,
            ..
        } = message;
        if origin_client_id == self.config.client_id {
            return;
        }

        match payload {
            SyncPayload::RequestAggregate => {
                if self.authority.is_privileged() && self.organization.is_some() {
                    if let Some(reply) = self.current_update_message() {
                        if let Err(err) = self.channel.publish(reply).await {
                            warn!(error = %err, "failed to answer aggregate request");
                        }
                    }
                }
            }
            SyncPayload::UpdateAggregate {
                organization,
                patrols,
            } => {
                self.apply_remote(organization, patrols, origin_client_id, origin_privileged)
                    .await;
            }
        }
    }

    pub async fn resolve_conflict(
        &mut self,
        index: usize,
        choose_remote: bool,
    ) -> Result<Organization, SyncError> {
        if index >= self.conflicts.len() {
            return Err(SyncError::ConflictOutOfRange(index));
        }
        let record = self.conflicts.remove(index);
        let mut winner = if choose_remote {
            record.remote
        } else {
            record.local
        };
        // The resolution is itself an accepted mutation; moving past both
        // sides lets it propagate everywhere as a clean forward update.
        let top = self
            .organization
            .as_ref()
            .map(|organization| organization.version)
            .unwrap_or(0)
            .max(winner.version);
        winner.version = top + 1;
        winner.updated_at_ms = now_ms();
        info!(
            chose_remote = choose_remote,
            version = winner.version,
            "conflict resolved manually"
        );
        self.organization = Some(winner.clone());
        self.persist_current().await;
        self.notify(ChangeNotice::AggregateChanged {
            organization: winner.clone(),
            kind: ChangeKind::Update,
        });
        self.queue_change(true).await;
        Ok(winner)
    }

    async fn apply_remote(
        &mut self,
        remote: Organization,
        remote_patrols: Vec<Patrol>,
        origin_id: String,
        origin_privileged: bool,
    ) {
        let Some(local) = self.organization.clone() else {
            self.adopt(remote, remote_patrols).await;
            return;
        };

        match conflict::classify(&local, &remote) {
            contracts::ConflictClassification::CleanForward => {
                self.adopt(remote, remote_patrols).await;
            }
            contracts::ConflictClassification::StaleEcho => {
                debug!(version = remote.version, "ignoring stale aggregate echo");
            }
            contracts::ConflictClassification::Concurrent => {
                let outcome = conflict::resolve(
                    self.config.strategy,
                    &local,
                    &remote,
                    self.authority.is_privileged(),
                    origin_privileged,
                );
                match outcome {
                    None => {
                        self.conflicts.push(ConflictRecord {
                            local,
                            remote,
                            remote_origin_id: origin_id,
                            remote_privileged: origin_privileged,
                            detected_at_ms: now_ms(),
                        });
                        warn!(
                            pending = self.conflicts.len(),
                            "concurrent edit needs manual resolution"
                        );
                        self.notify(ChangeNotice::ConflictPending {
                            pending_count: self.conflicts.len(),
                        });
                    }
                    Some(Winner::Remote) => {
                        info!(origin = %origin_id, "conflict arbitration chose the remote snapshot");
                        self.adopt_forced(remote, remote_patrols).await;
                    }
                    Some(Winner::Local) => {
                        info!(origin = %origin_id, "conflict arbitration kept the local snapshot");
                    }
                }
            }
        }
    }

    async fn adopt(&mut self, remote: Organization, remote_patrols: Vec<Patrol>) {
        if aggregate::adopt_remote(&mut self.organization, remote) == AdoptOutcome::StaleIgnored {
            return;
        }
        self.finish_adoption(remote_patrols).await;
    }

    /// Wholesale replacement by a conflict winner, which may share the local
    /// version number.
    async fn adopt_forced(&mut self, remote: Organization, remote_patrols: Vec<Patrol>) {
        self.organization = Some(remote);
        self.finish_adoption(remote_patrols).await;
    }

    async fn finish_adoption(&mut self, remote_patrols: Vec<Patrol>) {
        let Some(organization) = self.organization.clone() else {
            return;
        };
        let applied = self
            .patrols
            .adopt_remote(remote_patrols, &organization.patrol_ids);
        for (patrol, kind) in applied {
            self.notify(ChangeNotice::PatrolChanged { patrol, kind });
        }
        self.persist_current().await;
        self.notify(ChangeNotice::AggregateChanged {
            organization,
            kind: ChangeKind::Update,
        });
    }

    async fn request_and_wait(&mut self) {
        let mut rx = self.channel.subscribe();
        self.request_sync().await;

        let own_id = self.config.client_id.clone();
        let bound = Duration::from_millis(self.config.request_timeout_ms);
        let answer = tokio::time::timeout(bound, async move {
            loop {
                match rx.recv().await {
                    Ok(message) if message.origin_client_id != own_id => {
                        if let SyncPayload::UpdateAggregate {
                            organization,
                            patrols,
                        } = message.payload
                        {
                            return Some((organization, patrols));
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .await;

        if let Ok(Some((organization, patrols))) = answer {
            self.adopt(organization, patrols).await;
        }
    }

    /// Writes the current aggregate to both stores. When the shared write
    /// could not land (backing object still missing, backend failure) the
    /// settle deadline is re-armed so the write is retried instead of
    /// waiting on the next unrelated mutation. Returns whether it landed.
    async fn persist_current(&mut self) -> bool {
        let Some(organization) = self.organization.clone() else {
            return false;
        };
        let state = SharedState {
            organization: organization.clone(),
            patrols: self.patrols.list(),
        };
        let landed = self.stores.save_shared(&state).await;
        self.stores.save_fallback(&organization).await;
        if landed {
            self.patrols.clear_pending();
        } else {
            self.patrols.mark_dirty(Instant::now());
        }
        landed
    }

    fn current_update_message(&self) -> Option<SyncMessage> {
        let organization = self.organization.clone()?;
        Some(self.envelope(SyncPayload::UpdateAggregate {
            organization,
            patrols: self.patrols.list(),
        }))
    }

    fn envelope(&self, payload: SyncPayload) -> SyncMessage {
        SyncMessage {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            channel: self.config.channel.clone(),
            origin_client_id: self.config.client_id.clone(),
            origin_privileged: self.authority.is_privileged(),
            payload,
        }
    }

    fn notify(&self, notice: ChangeNotice) {
        // Nobody listening is fine; notices are best-effort.
        let _ = self.notices.send(notice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use contracts::ResolutionStrategy;
    use tokio::sync::Mutex;

    use crate::authority::FixedAuthority;
    use crate::channel::LocalBus;
    use crate::memory::{MemoryFallbackStore, MemorySharedStore, MemoryStoreLocator};
    use crate::store::SharedStoreHandle;
    use crate::ChannelError;

    fn config(client_id: &str) -> SyncConfig {
        SyncConfig {
            client_id: client_id.to_string(),
            request_timeout_ms: 500,
            retry: contracts::RetryPolicy {
                base_delay_ms: 1,
                max_attempts: 2,
            },
            ..SyncConfig::default()
        }
    }

    fn coordinator(
        client_id: &str,
        privileged: bool,
        bus: Arc<LocalBus>,
    ) -> SyncCoordinator {
        let authority: Arc<dyn AuthorityProvider> = if privileged {
            Arc::new(FixedAuthority::privileged())
        } else {
            Arc::new(FixedAuthority::player())
        };
        SyncCoordinator::new(
            config(client_id),
            authority,
            bus,
            Arc::new(MemoryStoreLocator::empty()),
            Arc::new(MemoryFallbackStore::new()),
        )
    }

    fn update_from(
        origin: &str,
        privileged: bool,
        organization: Organization,
    ) -> SyncMessage {
        SyncMessage {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            channel: contracts::DEFAULT_CHANNEL_NAME.to_string(),
            origin_client_id: origin.to_string(),
            origin_privileged: privileged,
            payload: SyncPayload::UpdateAggregate {
                organization,
                patrols: Vec::new(),
            },
        }
    }

    #[tokio::test]
    async fn privileged_initialize_creates_and_persists_default() {
        let bus = Arc::new(LocalBus::new());
        let mut gm = coordinator("client_gm", true, bus);
        gm.initialize().await;
        let organization = gm.organization().expect("default created");
        assert_eq!(organization.version, 1);
    }

    #[tokio::test]
    async fn create_organization_seeds_fresh_then_edits_in_place() {
        let bus = Arc::new(LocalBus::new());
        let mut client = coordinator("client_b", false, bus);

        let seeded = client
            .create_organization(OrganizationPatch {
                name: Some("Harbor Watch".to_string()),
                subtitle: Some("west gate".to_string()),
                ..OrganizationPatch::default()
            })
            .await
            .expect("fields apply");
        assert_eq!(seeded.version, 1);
        assert_eq!(seeded.name, "Harbor Watch");
        assert_eq!(seeded.subtitle, "west gate");

        let edited = client
            .create_organization(OrganizationPatch {
                subtitle: Some("east gate".to_string()),
                ..OrganizationPatch::default()
            })
            .await
            .expect("fields apply");
        assert_eq!(edited.version, 2);
        assert_eq!(edited.name, "Harbor Watch");
        assert_eq!(edited.subtitle, "east gate");
    }

    #[tokio::test]
    async fn store_appearing_mid_session_receives_the_held_state() {
        // No backing object exists at startup; an edit is held in memory and
        // the settle retry must write it once the object turns up.
        let bus = Arc::new(LocalBus::new());
        let locator = Arc::new(MemoryStoreLocator::uncreatable());
        let mut cfg = config("client_gm");
        cfg.debounce_ms = 10;
        let mut gm = SyncCoordinator::new(
            cfg,
            Arc::new(FixedAuthority::privileged()),
            bus,
            locator.clone(),
            Arc::new(MemoryFallbackStore::new()),
        );
        gm.initialize().await;
        gm.update_organization(OrganizationPatch {
            subtitle: Some("held in memory".to_string()),
            ..OrganizationPatch::default()
        })
        .await
        .expect("patch applies");

        let store = Arc::new(MemorySharedStore::new());
        locator.attach(Arc::clone(&store)).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(gm.settle_patrols(Instant::now()).await);
        let held = store
            .read()
            .await
            .expect("read works")
            .expect("state written");
        assert_eq!(held.organization.subtitle, "held in memory");
        assert_eq!(held.organization.version, 2);

        // Nothing further is scheduled once the write landed.
        assert!(!gm.settle_patrols(Instant::now()).await);
    }

    #[tokio::test]
    async fn store_refresh_persists_without_waiting_for_the_debounce() {
        let bus = Arc::new(LocalBus::new());
        let locator = Arc::new(MemoryStoreLocator::uncreatable());
        let mut gm = SyncCoordinator::new(
            config("client_gm"),
            Arc::new(FixedAuthority::privileged()),
            bus,
            locator.clone(),
            Arc::new(MemoryFallbackStore::new()),
        );
        gm.initialize().await;
        gm.update_organization(OrganizationPatch {
            subtitle: Some("held in memory".to_string()),
            ..OrganizationPatch::default()
        })
        .await
        .expect("patch applies");
        assert!(!gm.refresh_stores().await);

        let store = Arc::new(MemorySharedStore::new());
        locator.attach(Arc::clone(&store)).await;
        assert!(gm.refresh_stores().await);
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test]
    async fn clean_forward_update_is_adopted_wholesale() {
        // Both clients loaded version 5; the peer reached 6 and broadcast.
        let bus = Arc::new(LocalBus::new());
        let mut client = coordinator("client_b", false, bus);
        client.initialize().await;

        let mut base = client.organization().expect("defaulted").clone();
        base.version = 5;
        client.organization = Some(base.clone());

        let mut remote = base.clone();
        remote.version = 6;
        remote.subtitle = "edited by A".to_string();
        client
            .handle_incoming(update_from("client_a", false, remote))
            .await;

        let adopted = client.organization().expect("still present");
        assert_eq!(adopted.version, 6);
        assert_eq!(adopted.subtitle, "edited by A");
    }

    #[tokio::test]
    async fn replaying_the_same_message_never_double_applies() {
        let bus = Arc::new(LocalBus::new());
        let mut client = coordinator("client_b", false, bus);
        client.initialize().await;

        let mut remote = client.organization().expect("defaulted").clone();
        remote.version = 6;
        remote.subtitle = "once".to_string();

        client
            .handle_incoming(update_from("client_a", false, remote.clone()))
            .await;
        let after_first = client.organization().expect("adopted").clone();
        client
            .handle_incoming(update_from("client_a", false, remote))
            .await;
        let after_second = client.organization().expect("still adopted").clone();

        assert_eq!(after_first.version, 6);
        assert_eq!(after_second, after_first);
    }

    #[tokio::test]
    async fn own_echo_is_ignored() {
        let bus = Arc::new(LocalBus::new());
        let mut client = coordinator("client_b", false, bus);
        client.initialize().await;
        let local = client.organization().expect("defaulted").clone();

        let mut echo = local.clone();
        echo.version = 99;
        client
            .handle_incoming(update_from("client_b", false, echo))
            .await;
        assert_eq!(client.organization().expect("unchanged").version, local.version);
    }

    #[tokio::test]
    async fn authority_priority_discards_the_unprivileged_concurrent_edit() {
        // GM and player both edited from version 5, producing different
        // version-6 copies. The player must end on the GM's 6, not 7.
        let bus = Arc::new(LocalBus::new());
        let mut player = coordinator("client_player", false, bus);
        player.initialize().await;

        let mut mine = player.organization().expect("defaulted").clone();
        mine.version = 6;
        mine.subtitle = "player edit".to_string();
        mine.updated_at_ms = 9_999;
        player.organization = Some(mine);

        let mut gm_copy = player.organization().expect("present").clone();
        gm_copy.subtitle = "gm edit".to_string();
        gm_copy.updated_at_ms = 1;

        player
            .handle_incoming(update_from("client_gm", true, gm_copy))
            .await;

        let settled = player.organization().expect("present");
        assert_eq!(settled.version, 6);
        assert_eq!(settled.subtitle, "gm edit");
    }

    #[tokio::test]
    async fn manual_strategy_parks_the_conflict_until_resolved() {
        let bus = Arc::new(LocalBus::new());
        let mut client = coordinator("client_b", false, bus);
        client.config.strategy = ResolutionStrategy::Manual;
        client.initialize().await;

        let mut mine = client.organization().expect("defaulted").clone();
        mine.version = 6;
        mine.subtitle = "mine".to_string();
        client.organization = Some(mine.clone());

        let mut theirs = mine.clone();
        theirs.subtitle = "theirs".to_string();
        theirs.updated_at_ms = mine.updated_at_ms + 50;
        client
            .handle_incoming(update_from("client_a", false, theirs))
            .await;

        // Aggregate untouched while the conflict is pending.
        assert_eq!(client.organization().expect("present").subtitle, "mine");
        assert_eq!(client.conflicts().len(), 1);

        let resolved = client
            .resolve_conflict(0, true)
            .await
            .expect("index in range");
        assert_eq!(resolved.subtitle, "theirs");
        assert_eq!(resolved.version, 7);
        assert!(client.conflicts().is_empty());

        let err = client.resolve_conflict(3, false).await.expect_err("gone");
        assert_eq!(err, SyncError::ConflictOutOfRange(3));
    }

    #[tokio::test]
    async fn startup_handshake_adopts_the_privileged_answer() {
        let bus = Arc::new(LocalBus::new());

        let mut gm = coordinator("client_gm", true, Arc::clone(&bus));
        gm.initialize().await;
        gm.update_organization(OrganizationPatch {
            subtitle: Some("answered".to_string()),
            ..OrganizationPatch::default()
        })
        .await
        .expect("patch applies");
        let expected = gm.organization().expect("present").clone();

        let gm = Arc::new(Mutex::new(gm));
        let mut gm_rx = bus.subscribe();
        let pump_gm = Arc::clone(&gm);
        let pump = tokio::spawn(async move {
            while let Ok(message) = gm_rx.recv().await {
                pump_gm.lock().await.handle_incoming(message).await;
            }
        });

        let mut player = coordinator("client_player", false, Arc::clone(&bus));
        player.initialize().await;
        pump.abort();

        let adopted = player.organization().expect("answer adopted");
        assert_eq!(adopted.version, expected.version);
        assert_eq!(adopted.subtitle, "answered");
    }

    #[tokio::test]
    async fn unanswered_handshake_falls_back_to_a_local_default() {
        let bus = Arc::new(LocalBus::new());
        let mut player = coordinator("client_player", false, bus);
        player.config.request_timeout_ms = 20;
        player.initialize().await;
        assert_eq!(player.organization().expect("defaulted").version, 1);
    }

    struct FlakyChannel {
        inner: LocalBus,
        failing: AtomicBool,
    }

    impl FlakyChannel {
        fn new() -> Self {
            Self {
                inner: LocalBus::new(),
                failing: AtomicBool::new(false),
            }
        }

        fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl BroadcastChannel for FlakyChannel {
        async fn publish(&self, message: SyncMessage) -> Result<(), ChannelError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(ChannelError::Transport("socket dropped".to_string()));
            }
            self.inner.publish(message).await
        }

        fn subscribe(&self) -> broadcast::Receiver<SyncMessage> {
            self.inner.subscribe()
        }
    }

    #[tokio::test]
    async fn failed_sends_stay_queued_for_the_next_flush() {
        let channel = Arc::new(FlakyChannel::new());
        let mut client = SyncCoordinator::new(
            config("client_gm"),
            Arc::new(FixedAuthority::privileged()),
            Arc::clone(&channel) as Arc<dyn BroadcastChannel>,
            Arc::new(MemoryStoreLocator::empty()),
            Arc::new(MemoryFallbackStore::new()),
        );
        client.initialize().await;

        channel.set_failing(true);
        client
            .update_organization(OrganizationPatch {
                subtitle: Some("will retry".to_string()),
                ..OrganizationPatch::default()
            })
            .await
            .expect("patch applies");
        assert_eq!(client.flush().await, 0);
        assert_eq!(client.pending_changes(), 1);

        channel.set_failing(false);
        assert_eq!(client.flush().await, 1);
        assert_eq!(client.pending_changes(), 0);
    }

    #[tokio::test]
    async fn privileged_holder_answers_aggregate_requests() {
        let bus = Arc::new(LocalBus::new());
        let mut rx = bus.subscribe();

        let mut gm = coordinator("client_gm", true, Arc::clone(&bus));
        gm.initialize().await;
        gm.handle_incoming(SyncMessage {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            channel: contracts::DEFAULT_CHANNEL_NAME.to_string(),
            origin_client_id: "client_player".to_string(),
            origin_privileged: false,
            payload: SyncPayload::RequestAggregate,
        })
        .await;

        let reply = rx.recv().await.expect("a reply was published");
        assert_eq!(reply.origin_client_id, "client_gm");
        assert!(matches!(
            reply.payload,
            SyncPayload::UpdateAggregate { .. }
        ));
    }

    #[tokio::test]
    async fn unprivileged_clients_ignore_aggregate_requests() {
        let bus = Arc::new(LocalBus::new());
        let mut rx = bus.subscribe();

        let mut player = coordinator("client_player", false, Arc::clone(&bus));
        player.config.request_timeout_ms = 10;
        player.initialize().await;

        // Drain the player's own startup request.
        while let Ok(message) = rx.try_recv() {
            assert_eq!(message.origin_client_id, "client_player");
        }

        player
            .handle_incoming(SyncMessage {
                schema_version: SCHEMA_VERSION_V1.to_string(),
                channel: contracts::DEFAULT_CHANNEL_NAME.to_string(),
                origin_client_id: "client_other".to_string(),
                origin_privileged: false,
                payload: SyncPayload::RequestAggregate,
            })
            .await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn patrol_lifecycle_keeps_parent_registration_consistent() {
        let bus = Arc::new(LocalBus::new());
        let mut gm = coordinator("client_gm", true, bus);
        gm.initialize().await;

        let patrol = gm
            .create_patrol(PatrolSeed::default(), &[])
            .await
            .expect("create works")
            .expect("organization present");
        assert!(gm
            .organization()
            .expect("present")
            .patrol_ids
            .contains(&patrol.id));

        let removed = gm.delete_patrol(&patrol.id).await.expect("existed");
        assert_eq!(removed.id, patrol.id);
        assert!(gm.organization().expect("present").patrol_ids.is_empty());
        assert!(gm.delete_patrol(&patrol.id).await.is_none());
    }
}
