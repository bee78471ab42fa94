//! Mapper configuration.

/// Default namespace for secure-id shared-memory objects.
pub const DEFAULT_SECURE_ID_NAMESPACE: &str = "gralloc";

/// Configuration for a [`BufferMapper`](crate::mapper::BufferMapper).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapperConfig {
    /// Prefix of the shared-memory object names that secure ids resolve to.
    pub secure_id_namespace: String,
    /// Invalidate the CPU view when a buffer is locked.
    pub sync_on_lock: bool,
    /// Flush the CPU view when a write lock is released.
    pub sync_on_unlock: bool,
    /// Unmap buffers still registered when the mapper is dropped.
    pub unmap_on_drop: bool,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            secure_id_namespace: DEFAULT_SECURE_ID_NAMESPACE.to_string(),
            sync_on_lock: true,
            sync_on_unlock: true,
            unmap_on_drop: true,
        }
    }
}

impl MapperConfig {
    /// Resolve secure ids within `namespace`.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.secure_id_namespace = namespace.into();
        self
    }

    /// Enable or disable both coherence calls.
    ///
    /// Disabling them is only correct for buffers that are never touched by
    /// a device, or whose mappings are uncached.
    pub fn with_coherence(mut self, enabled: bool) -> Self {
        self.sync_on_lock = enabled;
        self.sync_on_unlock = enabled;
        self
    }

    /// Enable or disable unmapping leftover buffers on drop.
    pub fn with_unmap_on_drop(mut self, enabled: bool) -> Self {
        self.unmap_on_drop = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MapperConfig::default();
        assert_eq!(config.secure_id_namespace, "gralloc");
        assert!(config.sync_on_lock);
        assert!(config.sync_on_unlock);
        assert!(config.unmap_on_drop);
    }

    #[test]
    fn test_builders() {
        let config = MapperConfig::default()
            .with_namespace("vendor")
            .with_coherence(false)
            .with_unmap_on_drop(false);
        assert_eq!(config.secure_id_namespace, "vendor");
        assert!(!config.sync_on_lock);
        assert!(!config.sync_on_unlock);
        assert!(!config.unmap_on_drop);
    }
}
