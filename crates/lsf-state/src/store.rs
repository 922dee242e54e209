//! StateStore: redb-backed persistence for function apps.
//!
//! Values are JSON-serialized into redb's `&[u8]` value columns. The store
//! supports both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use lsf_core::FunctionApp;
use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::FUNCTION_APPS;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(FUNCTION_APPS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Insert or replace a function app.
    pub fn put_app(&self, app: &FunctionApp) -> StateResult<()> {
        let value = serde_json::to_vec(app).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(FUNCTION_APPS).map_err(map_err!(Table))?;
            table
                .insert(app.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(app_id = %app.id, "function app stored");
        Ok(())
    }

    pub fn get_app(&self, id: &str) -> StateResult<Option<FunctionApp>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(FUNCTION_APPS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let app: FunctionApp =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(app))
            }
            None => Ok(None),
        }
    }

    /// List all function apps, ordered by id.
    pub fn list_apps(&self) -> StateResult<Vec<FunctionApp>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(FUNCTION_APPS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let app: FunctionApp =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(app);
        }
        Ok(results)
    }

    /// Delete an app together with everything it owns. Returns true if it existed.
    pub fn delete_app(&self, id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(FUNCTION_APPS).map_err(map_err!(Table))?;
            existed = table.remove(id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(app_id = %id, existed, "function app deleted");
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use lsf_core::*;

    use super::*;

    fn test_app(id: &str) -> FunctionApp {
        FunctionApp {
            id: id.to_string(),
            name: "pipeline".to_string(),
            components: vec![Component {
                name: "grab".to_string(),
                memory_mb: 128,
                runtime_ms: 100,
                files: vec!["grab.py".to_string()],
            }],
            links: Vec::new(),
            latency_limit_ms: 200,
            compositions: vec![FunctionComposition {
                id: FunctionComposition::content_id(id, &["grab".to_string()]),
                function_app_id: id.to_string(),
                components: vec!["grab".to_string()],
                status: BuildStatus::Pending,
                build: None,
                deployments: vec![Deployment {
                    id: "dep-1".to_string(),
                    function_composition_id: format!("grab-{id}"),
                    node: "node-a".to_string(),
                    namespace: "application".to_string(),
                    routing_table: Default::default(),
                    status: DeploymentStatus::WaitingForBuild,
                }],
            }],
            layout_candidates: BTreeMap::new(),
            active_layout_key: None,
            created_at: 1000,
            updated_at: 1000,
        }
    }

    #[test]
    fn app_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let app = test_app("app-1");

        store.put_app(&app).unwrap();
        let retrieved = store.get_app("app-1").unwrap();

        assert_eq!(retrieved, Some(app));
    }

    #[test]
    fn app_get_nonexistent_returns_none() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get_app("missing").unwrap().is_none());
    }

    #[test]
    fn app_update_in_place() {
        let store = StateStore::open_in_memory().unwrap();
        let mut app = test_app("app-1");
        store.put_app(&app).unwrap();

        app.active_layout_key = Some("max_rate".to_string());
        app.compositions[0].status = BuildStatus::Built;
        store.put_app(&app).unwrap();

        let retrieved = store.get_app("app-1").unwrap().unwrap();
        assert_eq!(retrieved.active_layout_key.as_deref(), Some("max_rate"));
        assert_eq!(retrieved.compositions[0].status, BuildStatus::Built);
        assert_eq!(store.list_apps().unwrap().len(), 1);
    }

    #[test]
    fn app_list_is_ordered_by_id() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_app(&test_app("b")).unwrap();
        store.put_app(&test_app("a")).unwrap();

        let ids: Vec<String> = store.list_apps().unwrap().into_iter().map(|a| a.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn app_delete_removes_owned_records() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_app(&test_app("app-1")).unwrap();

        assert!(store.delete_app("app-1").unwrap());
        assert!(store.get_app("app-1").unwrap().is_none());
        assert!(!store.delete_app("app-1").unwrap());
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("lsf.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_app(&test_app("app-1")).unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        let app = store.get_app("app-1").unwrap();
        assert_eq!(app.map(|a| a.name), Some("pipeline".to_string()));
    }
}
