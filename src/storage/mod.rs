pub mod checkpoint;
pub mod fs;
pub mod memory;
pub mod swift;
pub mod traits;

pub use checkpoint::{CheckpointError, MarkerUpdate, ProcessedMarker, ProgressStore};
pub use fs::FsStore;
pub use memory::MemoryStore;
pub use swift::SwiftStore;
pub use traits::{ObjectInfo, ObjectStore, StorageError};

use crate::config::StorageConfig;
use std::sync::Arc;

/// Build the object store selected by the global `storage` section.
pub fn build_store(config: &StorageConfig) -> Result<Arc<dyn ObjectStore>, StorageError> {
    match config {
        StorageConfig::Filesystem { root } => {
            tracing::info!(root = %root.display(), "Using filesystem object store");
            Ok(Arc::new(FsStore::new(root)))
        }
        StorageConfig::Swift {
            storage_url,
            auth_token,
            timeout,
        } => {
            tracing::info!(storage_url = %storage_url, "Using Swift object store");
            Ok(Arc::new(SwiftStore::new(storage_url, auth_token, *timeout)?))
        }
    }
}
