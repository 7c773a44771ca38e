use serde::Deserialize;

use crate::error::Error;
use crate::policy::PolicyKind;
use crate::storage::entity::DEFAULT_BLOCK_SIZE;

pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Size in bytes of every block handled by the cache.
    pub block_size: usize,
    /// Maximum number of buffers resident at once.
    pub capacity: usize,
    pub policy: PolicyKind,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            capacity: DEFAULT_CAPACITY,
            policy: PolicyKind::default(),
        }
    }
}

impl CacheConfig {
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let config: Self =
            serde_json::from_str(json).map_err(|err| Error::InvalidConfig(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.block_size == 0 {
            return Err(Error::InvalidConfig("block_size must be positive".into()));
        }
        if self.capacity == 0 {
            return Err(Error::InvalidConfig("capacity must be positive".into()));
        }
        Ok(())
    }
}
