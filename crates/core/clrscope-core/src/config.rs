//! Session configuration.

/// Small-object-heap instances larger than this are presumed corruption
/// when walking carefully (the collector never allocates such objects on a
/// normal segment).
pub const MAX_SMALL_OBJECT_SIZE: u64 = 85_000;

/// Default entry bound per shard of the heap cache's address index.
pub const DEFAULT_CACHE_SHARD_CAPACITY: usize = 40_000_000;

/// Tuning knobs for one analysis session.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SessionConfig {
    /// Wrap the memory source in a page-granular read cache.
    pub cache_reads: bool,

    /// Careful-walk rejection threshold for small-object-segment sizes.
    pub max_small_object_size: u64,

    /// Entries per shard of the heap cache's address index. Lower values
    /// mean more, smaller ordered maps.
    pub cache_shard_capacity: usize,

    /// Upper bound on characters returned by string reads.
    pub max_string_length: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cache_reads: true,
            max_small_object_size: MAX_SMALL_OBJECT_SIZE,
            cache_shard_capacity: DEFAULT_CACHE_SHARD_CAPACITY,
            max_string_length: 1024 * 1024,
        }
    }
}

impl SessionConfig {
    /// Validate invariants that would otherwise surface as confusing
    /// behavior deep inside a walk.
    pub fn validate(&self) -> crate::Result<()> {
        if self.cache_shard_capacity == 0 {
            return Err(crate::Error::invalid_config(
                "cache_shard_capacity must be nonzero",
            ));
        }
        if self.max_small_object_size == 0 {
            return Err(crate::Error::invalid_config(
                "max_small_object_size must be nonzero",
            ));
        }
        Ok(())
    }
}
