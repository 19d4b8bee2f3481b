use std::sync::Arc;

use async_trait::async_trait;

use super::{AsyncFile, Depot, Device};
use crate::ResourceKey;

/// Device serving already-serialized containers straight from a depot.
pub struct DepotDevice {
    depot: Arc<dyn Depot>,
}

impl DepotDevice {
    /// Wraps a depot as a loader backend.
    pub fn new(depot: Arc<dyn Depot>) -> Self {
        Self { depot }
    }
}

#[async_trait]
impl Device for DepotDevice {
    async fn open(&self, key: &ResourceKey) -> Option<Box<dyn AsyncFile>> {
        self.depot.open(key.path().as_str()).await
    }

    fn timestamp(&self, key: &ResourceKey) -> Option<u64> {
        self.depot.file_timestamp(key.path().as_str())
    }
}
