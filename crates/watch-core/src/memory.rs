//! In-memory store implementations for tests and the in-process demo
//! harness.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use contracts::Organization;
use tokio::sync::Mutex;

use crate::store::{FallbackStore, SharedState, SharedStoreHandle, StoreLocator};
use crate::StoreError;

#[derive(Debug, Default)]
pub struct MemorySharedStore {
    state: Mutex<Option<SharedState>>,
    read_only: bool,
    writes: AtomicUsize,
}

impl MemorySharedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store the current client holds no edit rights on.
    pub fn read_only() -> Self {
        Self {
            state: Mutex::new(None),
            read_only: true,
            writes: AtomicUsize::new(0),
        }
    }

    pub fn with_state(state: SharedState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
            read_only: false,
            writes: AtomicUsize::new(0),
        }
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SharedStoreHandle for MemorySharedStore {
    async fn read(&self) -> Result<Option<SharedState>, StoreError> {
        Ok(self.state.lock().await.clone())
    }

    async fn write(&self, state: &SharedState) -> Result<(), StoreError> {
        if self.read_only {
            return Err(StoreError::PermissionDenied(
                "no edit rights on the backing object".to_string(),
            ));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        *self.state.lock().await = Some(state.clone());
        Ok(())
    }
}

pub struct MemoryStoreLocator {
    slot: Mutex<Option<Arc<MemorySharedStore>>>,
    can_create: bool,
    find_attempts: AtomicUsize,
}

impl MemoryStoreLocator {
    /// No backing object yet; creation permitted.
    pub fn empty() -> Self {
        Self {
            slot: Mutex::new(None),
            can_create: true,
            find_attempts: AtomicUsize::new(0),
        }
    }

    /// No backing object exists and none can be created, e.g. the world has
    /// no designated actor at all.
    pub fn uncreatable() -> Self {
        Self {
            slot: Mutex::new(None),
            can_create: false,
            find_attempts: AtomicUsize::new(0),
        }
    }

    pub fn with_store(store: Arc<MemorySharedStore>) -> Self {
        Self {
            slot: Mutex::new(Some(store)),
            can_create: true,
            find_attempts: AtomicUsize::new(0),
        }
    }

    pub fn find_attempts(&self) -> usize {
        self.find_attempts.load(Ordering::SeqCst)
    }

    /// Write count of the located store, if one exists.
    pub fn store_writes(&self) -> usize {
        self.slot
            .try_lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|store| store.writes()))
            .unwrap_or(0)
    }

    /// Simulates the backing object appearing later in the session.
    pub async fn attach(&self, store: Arc<MemorySharedStore>) {
        *self.slot.lock().await = Some(store);
    }
}

#[async_trait]
impl StoreLocator for MemoryStoreLocator {
    async fn find(&self) -> Option<Arc<dyn SharedStoreHandle>> {
        self.find_attempts.fetch_add(1, Ordering::SeqCst);
        self.slot
            .lock()
            .await
            .as_ref()
            .map(|store| Arc::clone(store) as Arc<dyn SharedStoreHandle>)
    }

    async fn create(&self) -> Result<Arc<dyn SharedStoreHandle>, StoreError> {
        if !self.can_create {
            return Err(StoreError::Backend(
                "no designated backing object can be created".to_string(),
            ));
        }
        let store = Arc::new(MemorySharedStore::new());
        *self.slot.lock().await = Some(Arc::clone(&store));
        Ok(store)
    }
}

#[derive(Debug, Default)]
pub struct MemoryFallbackStore {
    slot: Mutex<Option<Organization>>,
}

impl MemoryFallbackStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FallbackStore for MemoryFallbackStore {
    async fn read(&self) -> Result<Option<Organization>, StoreError> {
        Ok(self.slot.lock().await.clone())
    }

    async fn write(&self, organization: &Organization) -> Result<(), StoreError> {
        *self.slot.lock().await = Some(organization.clone());
        Ok(())
    }
}
