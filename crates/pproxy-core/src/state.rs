use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;

use pproxy_accesslog::LoggerRegistry;
use pproxy_auth::AuthService;
use pproxy_storage::{ModelRow, Storage, StorageResult};

/// Immutable view of the model-record table, keyed by client-facing id.
/// Readers hold the current snapshot; the single writer publishes a fresh map
/// and in-flight requests keep seeing the old one until their next read.
#[derive(Default)]
pub struct ModelSnapshot {
    models: HashMap<String, Arc<ModelRow>>,
}

impl ModelSnapshot {
    pub fn from_rows(rows: Vec<ModelRow>) -> Self {
        Self {
            models: rows
                .into_iter()
                .map(|row| (row.record.id.clone(), Arc::new(row)))
                .collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<ModelRow>> {
        self.models.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

pub struct AppState {
    pub models: ArcSwap<ModelSnapshot>,
    pub storage: Arc<dyn Storage>,
    pub auth: Arc<AuthService>,
    pub logs: Arc<LoggerRegistry>,
    pub config_dir: PathBuf,
    pub proxy_port: u16,
    pub admin_port: u16,
}

impl AppState {
    pub fn model_count(&self) -> usize {
        self.models.load().len()
    }

    pub fn apply_model_upsert(&self, row: ModelRow) {
        let mut models = self.models.load().models.clone();
        models.insert(row.record.id.clone(), Arc::new(row));
        self.models.store(Arc::new(ModelSnapshot { models }));
    }

    pub fn apply_model_delete(&self, id: &str) {
        let mut models = self.models.load().models.clone();
        models.remove(id);
        self.models.store(Arc::new(ModelSnapshot { models }));
    }

    /// Re-export the store's snapshot and swap it in atomically.
    pub async fn reload_models(&self) -> StorageResult<usize> {
        let snapshot = self.storage.load_snapshot().await?;
        let next = ModelSnapshot::from_rows(snapshot.models);
        let count = next.len();
        self.models.store(Arc::new(next));
        Ok(count)
    }
}
