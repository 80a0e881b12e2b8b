//! Dual-store persistence: a shared per-object slot any client can read (and
//! its owner can write), plus a world-scoped fallback only the privileged
//! client writes. The adapter enforces the authority asymmetry and degrades
//! to broadcast-only sync on every expected failure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use contracts::{Organization, Patrol, RetryPolicy};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::authority::AuthorityProvider;
use crate::StoreError;

/// Contents of the shared store slot: the aggregate plus its sub-aggregates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedState {
    pub organization: Organization,
    #[serde(default)]
    pub patrols: Vec<Patrol>,
}

#[async_trait]
pub trait SharedStoreHandle: Send + Sync {
    async fn read(&self) -> Result<Option<SharedState>, StoreError>;
    async fn write(&self, state: &SharedState) -> Result<(), StoreError>;
}

/// Locates (or creates) the shared store's backing object. The search
/// heuristic lives behind this seam so it can be swapped or mocked.
#[async_trait]
pub trait StoreLocator: Send + Sync {
    async fn find(&self) -> Option<Arc<dyn SharedStoreHandle>>;
    async fn create(&self) -> Result<Arc<dyn SharedStoreHandle>, StoreError>;
}

/// World-scoped single-value slot; any role reads, only the privileged role
/// is expected to have ever written it.
#[async_trait]
pub trait FallbackStore: Send + Sync {
    async fn read(&self) -> Result<Option<Organization>, StoreError>;
    async fn write(&self, organization: &Organization) -> Result<(), StoreError>;
}

pub struct DualStoreAdapter {
    locator: Arc<dyn StoreLocator>,
    fallback: Arc<dyn FallbackStore>,
    authority: Arc<dyn AuthorityProvider>,
    retry: RetryPolicy,
    cached_handle: Mutex<Option<Arc<dyn SharedStoreHandle>>>,
    discovery_failed: AtomicBool,
}

impl DualStoreAdapter {
    pub fn new(
        locator: Arc<dyn StoreLocator>,
        fallback: Arc<dyn FallbackStore>,
        authority: Arc<dyn AuthorityProvider>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            locator,
            fallback,
            authority,
            retry,
            cached_handle: Mutex::new(None),
            discovery_failed: AtomicBool::new(false),
        }
    }

    /// Drops the cached discovery outcome (handle or miss) so the next
    /// operation re-runs the full search; the "store became available"
    /// notification path calls this before re-persisting.
    pub async fn invalidate_handle(&self) {
        *self.cached_handle.lock().await = None;
        self.discovery_failed.store(false, Ordering::SeqCst);
    }

    pub async fn load_shared(&self) -> Option<SharedState> {
        let handle = self.locate(false).await?;
        match handle.read().await {
            Ok(state) => state,
            Err(err) => {
                warn!(error = %err, "shared store read failed");
                None
            }
        }
    }

    pub async fn load_fallback(&self) -> Option<Organization> {
        match self.fallback.read().await {
            Ok(organization) => organization,
            Err(err) => {
                warn!(error = %err, "fallback store read failed");
                None
            }
        }
    }

    /// Persists to the shared slot. Creates the backing object when absent —
    /// privileged callers only; everyone else silently degrades to
    /// broadcast-only propagation. Skips the write when the stored version
    /// already matches. Never surfaces an error to the caller; returns
    /// `false` when the write did not land for a reason worth retrying (no
    /// backing object yet, or a backend failure). A permission refusal counts
    /// as settled since this client can never write the slot.
    pub async fn save_shared(&self, state: &SharedState) -> bool {
        let Some(handle) = self.locate(true).await else {
            return false;
        };

        match handle.read().await {
            Ok(Some(stored)) if stored.organization.version == state.organization.version => {
                debug!(
                    version = state.organization.version,
                    "shared store already at this version, skipping write"
                );
                return true;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "shared store pre-write read failed");
            }
        }

        match handle.write(state).await {
            Ok(()) => true,
            Err(StoreError::PermissionDenied(detail)) => {
                debug!(detail, "shared store write not permitted, relying on broadcast");
                true
            }
            Err(err) => {
                warn!(error = %err, "shared store write failed");
                false
            }
        }
    }

    /// Persists the world-scoped backup. Only the privileged role writes it;
    /// attempts by others are dropped without surfacing an error.
    pub async fn save_fallback(&self, organization: &Organization) {
        if !self.authority.is_privileged() {
            debug!("fallback store write skipped for unprivileged client");
            return;
        }
        if let Err(err) = self.fallback.write(organization).await {
            warn!(error = %err, "fallback store write failed");
        }
    }

    /// Finds the shared store's backing object, retrying with exponential
    /// backoff while it does not exist yet. After the attempts are exhausted,
    /// a privileged caller may create it (when `allow_create`); everyone else
    /// gives up with a warning. The miss is cached: later calls check the
    /// locator once without the backoff, so a store appearing mid-session is
    /// still picked up while ordinary operations stay cheap.
    async fn locate(&self, allow_create: bool) -> Option<Arc<dyn SharedStoreHandle>> {
        {
            let cached = self.cached_handle.lock().await;
            if let Some(handle) = cached.as_ref() {
                return Some(Arc::clone(handle));
            }
        }

        if self.discovery_failed.load(Ordering::SeqCst) {
            if let Some(handle) = self.locator.find().await {
                self.discovery_failed.store(false, Ordering::SeqCst);
                *self.cached_handle.lock().await = Some(Arc::clone(&handle));
                return Some(handle);
            }
        } else {
            for attempt in 0..self.retry.max_attempts {
                if let Some(handle) = self.locator.find().await {
                    *self.cached_handle.lock().await = Some(Arc::clone(&handle));
                    return Some(handle);
                }
                tokio::time::sleep(Duration::from_millis(self.retry.delay_ms(attempt))).await;
            }
        }

        if allow_create && self.authority.is_privileged() {
            match self.locator.create().await {
                Ok(handle) => {
                    self.discovery_failed.store(false, Ordering::SeqCst);
                    *self.cached_handle.lock().await = Some(Arc::clone(&handle));
                    return Some(handle);
                }
                Err(err) => {
                    warn!(error = %err, "failed to create shared store backing object");
                    self.discovery_failed.store(true, Ordering::SeqCst);
                    return None;
                }
            }
        }

        if !self.discovery_failed.swap(true, Ordering::SeqCst) {
            warn!(
                attempts = self.retry.max_attempts,
                "shared store backing object not found after retries"
            );
        }
        None
    }
}
