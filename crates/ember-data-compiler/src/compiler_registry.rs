use ember_data_runtime::{ResourceKey, ResourceType};
use tracing::warn;

use crate::{Cooker, CookerHandle};

/// Set of registered cookers, selected per key at cook time.
///
/// Registration order is the priority order: the first cooker that claims
/// a key wins.
#[derive(Default)]
pub struct CookerRegistry {
    cookers: Vec<CookerHandle>,
}

impl CookerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a cooker backend.
    pub fn register(&mut self, cooker: CookerHandle) {
        if self
            .cookers
            .iter()
            .any(|existing| existing.name() == cooker.name())
        {
            warn!("Cooker '{}' registered twice", cooker.name());
        }
        self.cookers.push(cooker);
    }

    /// Finds the cooker claiming `key`, along with the concrete class it
    /// cooks to. `None` means the key is not cookable at all.
    pub fn find_cooker(&self, key: &ResourceKey) -> Option<(CookerHandle, ResourceType)> {
        self.cookers.iter().find_map(|cooker| {
            cooker
                .can_cook(key)
                .map(|cooked_class| (cooker.clone(), cooked_class))
        })
    }

    /// Looks up a registered cooker by its stable name, used to validate
    /// recorded metadata against the currently registered backend.
    pub fn find_by_name(&self, name: &str) -> Option<&dyn Cooker> {
        self.cookers
            .iter()
            .find(|cooker| cooker.name() == name)
            .map(AsRef::as_ref)
    }
}
