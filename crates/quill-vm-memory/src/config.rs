//! Memory manager configuration.

/// Tunables for the object memory manager.
///
/// The evacuation occupancy and large-object threshold are deliberately
/// configuration inputs rather than hard-coded constants; the defaults below
/// are conservative starting points, not derived optima.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Total size of each young semispace in bytes (default: 1MB).
    pub young_size: usize,
    /// Size of the slab carved from the young generation for each execution
    /// context (default: 4KB).
    pub slab_size: usize,
    /// Size of each mature-generation region (default: 32KB).
    pub region_size: usize,
    /// Maximum number of mature regions; caps the mature heap (default: 512,
    /// i.e. 16MB of mature space).
    pub max_regions: usize,
    /// Objects at or above this size bypass the young generation and land in
    /// the large object space (default: 8KB).
    pub large_object_threshold: usize,
    /// Mature regions whose live-byte occupancy falls below this fraction
    /// are evacuated; denser regions are swept in place (default: 0.5).
    pub evacuate_occupancy: f64,
    /// Number of young collections an object must survive before promotion
    /// to the mature generation (default: 2).
    pub promote_age: u8,
    /// Run mature marking on a dedicated concurrent marker thread instead of
    /// inline stop-the-world marking (default: off).
    pub concurrent_mark: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            young_size: 1024 * 1024,   // 1MB per semispace
            slab_size: 4 * 1024,       // 4KB
            region_size: 32 * 1024,    // 32KB
            max_regions: 512,          // 16MB mature cap
            large_object_threshold: 8 * 1024,
            evacuate_occupancy: 0.5,
            promote_age: 2,
            concurrent_mark: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let config = MemoryConfig::default();
        assert!(config.slab_size < config.young_size);
        assert!(config.large_object_threshold < config.region_size);
        assert!(config.evacuate_occupancy > 0.0 && config.evacuate_occupancy < 1.0);
    }
}
