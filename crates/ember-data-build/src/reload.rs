use std::sync::Arc;

use ember_data_runtime::{AssetRegistry, HandleUntyped};
use tracing::{info, warn};

use crate::DependencyTracker;

/// Drives change notifications from the dependency tracker into registry
/// reloads, and applies finished reloads in FIFO order.
///
/// `update` is only ever called from one designated thread, so "apply
/// reload" side effects never race with normal traversal.
pub struct ReloadDriver {
    tracker: Arc<DependencyTracker>,
}

impl ReloadDriver {
    /// Creates a driver over a tracker.
    pub fn new(tracker: Arc<DependencyTracker>) -> Self {
        Self { tracker }
    }

    /// Runs one update pass: pumps depot events, reloads changed
    /// artifacts that are currently loaded and hands each finished
    /// `(previous, current)` pair to `apply` for reference migration.
    pub async fn update<F>(&self, registry: &AssetRegistry, mut apply: F)
    where
        F: FnMut(&HandleUntyped, &HandleUntyped),
    {
        self.tracker.pump_events();

        let changed = self.tracker.drain_changed_artifacts();
        if !changed.is_empty() {
            info!("Dependency tracker reported {} file(s) to reload", changed.len());
        }

        for key in changed {
            if registry.is_loaded(&key) {
                info!("Resource '{}' flagged for reloading", key);
                if let Err(err) = registry.reload(&key).await {
                    warn!("Reloading of '{}' failed: {}", key, err);
                }
            } else {
                info!(
                    "Resource '{}' not currently loaded, new version will be loaded on next resource load",
                    key
                );
            }
        }

        for (previous, current) in registry.drain_reload_events() {
            info!("Applying reload to '{}'", current.key());
            apply(&previous, &current);
        }
    }
}
