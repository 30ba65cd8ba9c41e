//! Per-resource admission limits

use serde::{Deserialize, Serialize};
use strata_errors::{ConfigError, Error};
use strata_types::Resource;

/// Limits for every resource partition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Default wait-list bound per priority band, inherited by partitions
    /// that do not set their own
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default)]
    pub none: PartitionConfig,

    #[serde(default)]
    pub index: PartitionConfig,

    #[serde(default)]
    pub archive: PartitionConfig,

    #[serde(default)]
    pub chunk_cache: PartitionConfig,

    #[serde(default)]
    pub file_system: PartitionConfig,
}

/// Limits for a single resource partition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartitionConfig {
    #[serde(default)]
    pub pool_size: usize, // 0 = auto-detect
    #[serde(default)]
    pub capacity_per_priority: Option<usize>,
}

/// Concrete, validated limits for one partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedPartition {
    pub pool_size: usize,
    pub capacity_per_priority: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            none: PartitionConfig::default(),
            index: PartitionConfig::default(),
            archive: PartitionConfig::default(),
            chunk_cache: PartitionConfig::default(),
            file_system: PartitionConfig::default(),
        }
    }
}

fn default_queue_capacity() -> usize {
    64
}

impl LimitsConfig {
    /// Raw configuration for a resource
    #[must_use]
    pub fn partition_config(&self, resource: Resource) -> &PartitionConfig {
        match resource {
            Resource::None => &self.none,
            Resource::Index => &self.index,
            Resource::Archive => &self.archive,
            Resource::ChunkCache => &self.chunk_cache,
            Resource::FileSystem => &self.file_system,
        }
    }

    /// Mutable raw configuration for a resource
    pub fn partition_config_mut(&mut self, resource: Resource) -> &mut PartitionConfig {
        match resource {
            Resource::None => &mut self.none,
            Resource::Index => &mut self.index,
            Resource::Archive => &mut self.archive,
            Resource::ChunkCache => &mut self.chunk_cache,
            Resource::FileSystem => &mut self.file_system,
        }
    }

    /// Resolve auto-detected and inherited values for a resource
    #[must_use]
    pub fn partition(&self, resource: Resource) -> ResolvedPartition {
        let config = self.partition_config(resource);
        ResolvedPartition {
            pool_size: calculate_pool_size(resource, config.pool_size),
            capacity_per_priority: config.capacity_per_priority.unwrap_or(self.queue_capacity),
        }
    }

    /// Check that every wait-list bound is positive
    ///
    /// # Errors
    ///
    /// Returns an error if the default queue capacity or any partition's
    /// explicit capacity is zero.
    pub fn validate(&self) -> Result<(), Error> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "limits.queue_capacity".to_string(),
                value: "0".to_string(),
            }
            .into());
        }

        for resource in Resource::ALL {
            if self.partition_config(resource).capacity_per_priority == Some(0) {
                return Err(ConfigError::InvalidValue {
                    field: format!("limits.{resource}.capacity_per_priority"),
                    value: "0".to_string(),
                }
                .into());
            }
        }

        Ok(())
    }
}

/// Calculate a partition's pool size
#[must_use]
pub fn calculate_pool_size(resource: Resource, config_value: usize) -> usize {
    if config_value > 0 {
        config_value // User override
    } else {
        auto_pool_size(resource, num_cpus::get())
    }
}

/// Pool size derived from the CPU count
///
/// Archive gets half the CPUs and the chunk cache twice as many; every other
/// resource gets one permit per CPU.
#[must_use]
pub fn auto_pool_size(resource: Resource, cpus: usize) -> usize {
    let cpus = cpus.max(1);
    match resource {
        Resource::Archive => (cpus / 2).max(1),
        Resource::ChunkCache => cpus * 2,
        Resource::None | Resource::Index | Resource::FileSystem => cpus,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_sizes_never_zero() {
        for resource in Resource::ALL {
            assert!(auto_pool_size(resource, 0) >= 1);
            assert!(auto_pool_size(resource, 1) >= 1);
        }
        assert_eq!(auto_pool_size(Resource::Archive, 8), 4);
        assert_eq!(auto_pool_size(Resource::ChunkCache, 8), 16);
    }

    #[test]
    fn partition_inherits_queue_capacity() {
        let mut limits = LimitsConfig {
            queue_capacity: 7,
            ..LimitsConfig::default()
        };
        limits.index.pool_size = 3;
        limits.archive.capacity_per_priority = Some(2);

        let index = limits.partition(Resource::Index);
        assert_eq!(index.pool_size, 3);
        assert_eq!(index.capacity_per_priority, 7);
        assert_eq!(limits.partition(Resource::Archive).capacity_per_priority, 2);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let mut limits = LimitsConfig::default();
        assert!(limits.validate().is_ok());
        limits.chunk_cache.capacity_per_priority = Some(0);
        assert!(limits.validate().is_err());
    }
}
