pub mod error;
pub mod memory;
pub mod port;
pub mod s3;

use std::sync::Arc;

use maestro_core::config::{ObjectStoreConfig, ObjectStoreProvider};

pub use error::{Result, StorageError};
pub use port::ObjectStore;

/// Build the configured object-store backend.
pub fn build(config: &ObjectStoreConfig) -> Result<Arc<dyn ObjectStore>> {
    match config.provider {
        ObjectStoreProvider::Memory => Ok(Arc::new(memory::MemoryObjectStore::new())),
        ObjectStoreProvider::S3 | ObjectStoreProvider::Minio => {
            Ok(Arc::new(s3::S3ObjectStore::from_config(config)?))
        }
    }
}
