//! Async wrapper around the sync engine for server runtimes.

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::SyncConfig;
use crate::db::Database;
use crate::models::{ConflictDecision, Device, DeviceRegistration, SyncConflict};
use crate::sync::{GcReport, SyncEngine, SyncRequest, SyncResponse, SyncStatus};
use crate::{Error, Result};

/// Cheaply cloneable handle for async callers.
///
/// Every call runs on tokio's blocking pool, so `SQLite` work never stalls
/// the async workers serving other sessions.
#[derive(Clone)]
pub struct SyncService {
    engine: Arc<SyncEngine>,
}

impl SyncService {
    pub fn new(engine: SyncEngine) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }

    /// Open (or create) the sync store at `db_path`.
    pub async fn open_path(db_path: impl Into<PathBuf>, config: SyncConfig) -> Result<Self> {
        let db_path = db_path.into();
        let db = tokio::task::spawn_blocking(move || Database::open(&db_path))
            .await
            .map_err(|error| Error::Database(format!("open task failed: {error}")))??;

        Ok(Self::new(SyncEngine::new(Arc::new(db), config)))
    }

    /// Open an in-memory store (primarily for tests).
    pub fn open_in_memory(config: SyncConfig) -> Result<Self> {
        let db = Database::open_in_memory()?;
        Ok(Self::new(SyncEngine::new(Arc::new(db), config)))
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    async fn run<T, F>(&self, task: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&SyncEngine) -> Result<T> + Send + 'static,
    {
        let engine = Arc::clone(&self.engine);
        tokio::task::spawn_blocking(move || task(&engine))
            .await
            .map_err(|error| Error::Database(format!("sync task failed: {error}")))?
    }

    pub async fn sync_batch(&self, request: SyncRequest) -> Result<SyncResponse> {
        self.run(move |engine| engine.sync_batch(request)).await
    }

    pub async fn register_device(&self, registration: DeviceRegistration) -> Result<Device> {
        self.run(move |engine| engine.register_device(&registration))
            .await
    }

    pub async fn list_devices(
        &self,
        client_id: impl Into<String>,
        include_inactive: bool,
    ) -> Result<Vec<Device>> {
        let client_id = client_id.into();
        self.run(move |engine| engine.list_devices(&client_id, include_inactive))
            .await
    }

    pub async fn revoke_device(
        &self,
        client_id: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Result<Device> {
        let (client_id, device_id) = (client_id.into(), device_id.into());
        self.run(move |engine| engine.revoke_device(&client_id, &device_id))
            .await
    }

    pub async fn conflicts(
        &self,
        device_id: Option<String>,
        unresolved_only: bool,
        limit: usize,
    ) -> Result<Vec<SyncConflict>> {
        self.run(move |engine| engine.conflicts(device_id.as_deref(), unresolved_only, limit))
            .await
    }

    pub async fn resolve_conflict(
        &self,
        client_id: impl Into<String>,
        conflict_id: i64,
        decision: ConflictDecision,
    ) -> Result<SyncConflict> {
        let client_id = client_id.into();
        self.run(move |engine| engine.resolve_conflict(&client_id, conflict_id, decision))
            .await
    }

    pub async fn status(
        &self,
        client_id: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Result<SyncStatus> {
        let (client_id, device_id) = (client_id.into(), device_id.into());
        self.run(move |engine| engine.status(&client_id, &device_id))
            .await
    }

    pub async fn gc(&self, entity_type: impl Into<String>) -> Result<usize> {
        let entity_type = entity_type.into();
        self.run(move |engine| engine.gc(&entity_type)).await
    }

    /// Run the periodic maintenance pass.
    pub async fn gc_all(&self) -> Result<GcReport> {
        self.run(SyncEngine::gc_all).await
    }
}
