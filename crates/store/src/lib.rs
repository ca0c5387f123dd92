//! Store implementations for taskforge.
//!
//! - [`InMemoryStore`] for tests and `:memory:` deployments
//! - [`SqliteStore`] for everything else

pub mod in_memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

use std::sync::Arc;
use taskforge_core::error::StoreError;
use taskforge_core::store::Store;

pub use in_memory::InMemoryStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

/// Open the store a database URL names. `:memory:` selects [`InMemoryStore`].
pub async fn open(url: &str) -> Result<Arc<dyn Store>, StoreError> {
    if url == ":memory:" {
        return Ok(Arc::new(InMemoryStore::new()));
    }
    #[cfg(feature = "sqlite")]
    {
        Ok(Arc::new(SqliteStore::new(url).await?))
    }
    #[cfg(not(feature = "sqlite"))]
    {
        Err(StoreError::Storage(format!(
            "no backend compiled in for {url}"
        )))
    }
}
