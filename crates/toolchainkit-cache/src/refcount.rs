use crate::error::{CacheError, Result};
use crate::registry::Registry;
use std::path::Path;

/// Per-project usage counts for cached toolchains.
///
/// Counts are never stored: a toolchain's count is the size of its project set
/// in the registry, so the two cannot drift apart.
#[derive(Clone, Debug)]
pub struct ReferenceCounter {
    registry: Registry,
}

impl ReferenceCounter {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    /// Adds `project` as a user of `toolchain_id`; returns the new count.
    pub fn increment(&self, toolchain_id: &str, project: &Path) -> Result<usize> {
        self.registry.add_ref(toolchain_id, project)
    }

    /// Removes `project` from the users of `toolchain_id`; returns the new count.
    ///
    /// Removing a project that is not a user leaves the count unchanged.
    pub fn decrement(&self, toolchain_id: &str, project: &Path) -> Result<usize> {
        self.registry
            .remove_ref(toolchain_id, project)?
            .ok_or_else(|| CacheError::ToolchainNotInCache {
                id: toolchain_id.to_owned(),
            })
    }

    pub fn count(&self, toolchain_id: &str) -> Result<usize> {
        self.registry.ref_count(toolchain_id)
    }
}
