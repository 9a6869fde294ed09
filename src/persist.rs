mod file;
mod memory;

pub use file::FilePersistence;
pub use memory::MemoryPersistence;

use async_trait::async_trait;

use crate::error::FiatSwapError;

/// Namespaced blob store. Keys are unique per namespace; writes to one key are
/// atomic with respect to readers of the same key.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn read(&self, namespace: &str, key: &str) -> Result<Option<String>, FiatSwapError>;

    async fn write(&self, namespace: &str, key: &str, blob: String) -> Result<(), FiatSwapError>;

    async fn remove(&self, namespace: &str, key: &str) -> Result<(), FiatSwapError>;

    async fn keys(&self, namespace: &str) -> Result<Vec<String>, FiatSwapError>;
}
