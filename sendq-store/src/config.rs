use std::sync::Arc;

use serde::Deserialize;

use crate::{
    backends::{FileBackingStore, MemoryBackingStore},
    error::Result,
    store::BackingStore,
};

/// Configuration for the message store backend
///
/// Allows runtime selection of the backing store implementation through
/// the daemon's configuration file.
///
/// # Examples
///
/// File-backed store in RON config:
/// ```ron
/// Sendq (
///     store: File(
///         path: "/var/spool/sendq",
///     ),
/// )
/// ```
///
/// Memory-backed store for testing:
/// ```ron
/// Sendq (
///     store: Memory(()),
/// )
/// ```
#[derive(Debug, Deserialize)]
pub enum StoreConfig {
    /// File-based store (production)
    File(FileBackingStore),
    /// Memory-based store (testing/development)
    ///
    /// Can optionally specify a capacity limit to prevent unbounded growth
    Memory(MemoryConfig),
}

/// Configuration for the memory-backed store
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MemoryConfig {
    /// Maximum number of messages to store (omit for unlimited)
    #[serde(default)]
    pub capacity: Option<usize>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::File(FileBackingStore::default())
    }
}

impl StoreConfig {
    /// Initialize the configured backend and return it as a trait object
    ///
    /// For file-backed stores this creates the store directory and cleans
    /// up leftovers of interrupted writes.
    ///
    /// # Errors
    /// Returns an error if file store initialization fails (directory
    /// creation, permissions, etc.)
    pub fn into_backing_store(self) -> Result<Arc<dyn BackingStore>> {
        match self {
            Self::File(store) => {
                store.init()?;
                Ok(Arc::new(store))
            }
            Self::Memory(config) => Ok(config.capacity.map_or_else(
                || Arc::new(MemoryBackingStore::new()) as Arc<dyn BackingStore>,
                |capacity| Arc::new(MemoryBackingStore::with_capacity(capacity)),
            )),
        }
    }
}
