//! In-memory app registry with optional write-through persistence.
//!
//! Readers share the lock; every mutation holds the write lock for the
//! whole read-modify-write, including the store write, so the persisted
//! copy never lags behind a concurrent update.

use std::collections::HashMap;

use lsf_core::{AppId, FunctionApp};
use lsf_state::StateStore;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{ComposerError, ComposerResult};

pub struct AppRegistry {
    apps: RwLock<HashMap<AppId, FunctionApp>>,
    store: Option<StateStore>,
}

impl AppRegistry {
    pub fn new(store: Option<StateStore>) -> Self {
        Self {
            apps: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Load every persisted app into memory. Returns how many were loaded.
    pub async fn restore(&self) -> ComposerResult<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let persisted = store.list_apps()?;
        let count = persisted.len();
        let mut apps = self.apps.write().await;
        for app in persisted {
            apps.insert(app.id.clone(), app);
        }
        debug!(count, "function apps restored");
        Ok(count)
    }

    pub async fn insert(&self, app: FunctionApp) -> ComposerResult<()> {
        let mut apps = self.apps.write().await;
        if let Some(store) = &self.store {
            store.put_app(&app)?;
        }
        apps.insert(app.id.clone(), app);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<FunctionApp> {
        self.apps.read().await.get(id).cloned()
    }

    /// All apps, ordered by id.
    pub async fn list(&self) -> Vec<FunctionApp> {
        let apps = self.apps.read().await;
        let mut list: Vec<FunctionApp> = apps.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// Remove an app and everything it owns. Returns true if it existed.
    pub async fn remove(&self, id: &str) -> ComposerResult<bool> {
        let mut apps = self.apps.write().await;
        if let Some(store) = &self.store {
            store.delete_app(id)?;
        }
        Ok(apps.remove(id).is_some())
    }

    /// Mutate one app in place and persist the result.
    ///
    /// If `f` leaves the app unchanged nothing is written.
    pub async fn update<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut FunctionApp) -> R,
    ) -> ComposerResult<R> {
        let mut apps = self.apps.write().await;
        let app = apps
            .get_mut(id)
            .ok_or_else(|| ComposerError::AppNotFound(id.to_string()))?;

        let before = app.clone();
        let out = f(app);
        if *app != before {
            app.updated_at = before.updated_at.max(epoch_secs());
            if let Some(store) = &self.store
                && let Err(e) = store.put_app(app)
            {
                *app = before;
                return Err(e.into());
            }
        }
        Ok(out)
    }
}

fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
