use std::{
    collections::HashMap,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use async_trait::async_trait;

use crate::error::FiatSwapError;

use super::Persistence;

/// In-process store. Clones share the same map, which lets a test drop a
/// `TradeManager` and restore a fresh one from what the first one wrote.
#[derive(Clone, Default)]
pub struct MemoryPersistence {
    store: Arc<RwLock<HashMap<String, HashMap<String, String>>>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_store(&self) -> RwLockReadGuard<'_, HashMap<String, HashMap<String, String>>> {
        match self.store.read() {
            Ok(store) => store,
            Err(error) => {
                panic!("Error reading store - {}", error);
            }
        }
    }

    fn write_store(&self) -> RwLockWriteGuard<'_, HashMap<String, HashMap<String, String>>> {
        match self.store.write() {
            Ok(store) => store,
            Err(error) => {
                panic!("Error writing store - {}", error);
            }
        }
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn read(&self, namespace: &str, key: &str) -> Result<Option<String>, FiatSwapError> {
        Ok(self
            .read_store()
            .get(namespace)
            .and_then(|blobs| blobs.get(key))
            .cloned())
    }

    async fn write(&self, namespace: &str, key: &str, blob: String) -> Result<(), FiatSwapError> {
        self.write_store()
            .entry(namespace.to_owned())
            .or_default()
            .insert(key.to_owned(), blob);
        Ok(())
    }

    async fn remove(&self, namespace: &str, key: &str) -> Result<(), FiatSwapError> {
        if let Some(blobs) = self.write_store().get_mut(namespace) {
            blobs.remove(key);
        }
        Ok(())
    }

    async fn keys(&self, namespace: &str) -> Result<Vec<String>, FiatSwapError> {
        let mut keys: Vec<String> = self
            .read_store()
            .get(namespace)
            .map(|blobs| blobs.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        Ok(keys)
    }
}
