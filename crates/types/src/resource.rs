//! Backend resources guarded by admission control

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use strata_errors::ConfigError;

use crate::priority::PriorityClass;

/// Backend dependency whose concurrent access is bounded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    #[default]
    None,
    /// On-disk index
    Index,
    /// Cold/archive tier
    Archive,
    /// Chunk cache fills
    ChunkCache,
    /// Raw filesystem access
    FileSystem,
}

impl Resource {
    /// Number of resources, used to size per-resource tables
    pub const COUNT: usize = 5;

    /// All resources in declaration order, matching [`Resource::index`]
    pub const ALL: [Self; Self::COUNT] = [
        Self::None,
        Self::Index,
        Self::Archive,
        Self::ChunkCache,
        Self::FileSystem,
    ];

    /// Dense ordinal in `0..Resource::COUNT`
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Index => "index",
            Self::Archive => "archive",
            Self::ChunkCache => "chunk_cache",
            Self::FileSystem => "file_system",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resource {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|resource| resource.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ConfigError::InvalidValue {
                field: "resource".to_string(),
                value: s.to_string(),
            })
    }
}

/// Routing key into the partition router
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub resource: Resource,
    pub class: PriorityClass,
}

impl ResourceKey {
    #[must_use]
    pub const fn new(resource: Resource, class: PriorityClass) -> Self {
        Self { resource, class }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource, self.class)
    }
}
