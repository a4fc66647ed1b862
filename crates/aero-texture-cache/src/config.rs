//! Cache configuration.
//!
//! Sizes can be overridden at runtime through environment variables so that memory-constrained
//! hosts (and tests exercising exhaustion paths) do not need a rebuild:
//! - `AERO_TEXCACHE_STAGING_SIZE`: staging ring size in bytes.
//! - `AERO_TEXCACHE_POOL_SIZE`: image memory pool size in bytes.
//! - `AERO_TEXCACHE_MAX_POOLS`: upper bound on image memory pools.

use tracing::warn;

use crate::allocator::AllocationPolicy;
use crate::error::TextureCacheError;
use crate::fetch::MAX_FETCH_CONSTANTS;

pub const STAGING_SIZE_ENV: &str = "AERO_TEXCACHE_STAGING_SIZE";
pub const POOL_SIZE_ENV: &str = "AERO_TEXCACHE_POOL_SIZE";
pub const MAX_POOLS_ENV: &str = "AERO_TEXCACHE_MAX_POOLS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureCacheConfig {
    /// Size of the staging ring used for uploads.
    pub staging_size: u64,
    /// Alignment of every staging allocation. Raised to the host's copy alignment if smaller.
    pub staging_alignment: u64,
    pub image_pool: AllocationPolicy,
    /// Capacity of each descriptor set; one entry per fetch constant.
    pub max_descriptor_bindings: u32,
}

impl Default for TextureCacheConfig {
    fn default() -> Self {
        Self {
            staging_size: 8 * 1024 * 1024,
            staging_alignment: 256,
            image_pool: AllocationPolicy::default(),
            max_descriptor_bindings: MAX_FETCH_CONSTANTS,
        }
    }
}

impl TextureCacheConfig {
    /// Default configuration with environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parse = |name: &str| -> Option<u64> {
            let raw = lookup(name)?;
            match raw.trim().parse::<u64>() {
                Ok(value) => Some(value),
                Err(err) => {
                    warn!(
                        var = name,
                        value = %raw,
                        %err,
                        "ignoring invalid texture cache override"
                    );
                    None
                }
            }
        };

        if let Some(size) = parse(STAGING_SIZE_ENV) {
            self.staging_size = size;
        }
        if let Some(size) = parse(POOL_SIZE_ENV) {
            self.image_pool.pool_size = size;
        }
        if let Some(pools) = parse(MAX_POOLS_ENV) {
            match usize::try_from(pools) {
                Ok(pools) => self.image_pool.max_pools = pools,
                Err(_) => warn!(var = MAX_POOLS_ENV, pools, "ignoring out of range pool count"),
            }
        }
        self
    }

    pub fn validate(&self) -> Result<(), TextureCacheError> {
        if self.staging_size == 0 {
            return Err(TextureCacheError::InvalidConfig(
                "staging_size must be > 0".into(),
            ));
        }
        if !self.staging_alignment.is_power_of_two() {
            return Err(TextureCacheError::InvalidConfig(format!(
                "staging_alignment {} is not a power of two",
                self.staging_alignment
            )));
        }
        if self.max_descriptor_bindings == 0 || self.max_descriptor_bindings > MAX_FETCH_CONSTANTS {
            return Err(TextureCacheError::InvalidConfig(format!(
                "max_descriptor_bindings must be in 1..={MAX_FETCH_CONSTANTS}"
            )));
        }
        self.image_pool.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = TextureCacheConfig::default();
        assert_eq!(config.max_descriptor_bindings, 32);
        config.validate().unwrap();
    }

    #[test]
    fn overrides_apply_and_invalid_values_are_ignored() {
        let config = TextureCacheConfig::default().with_overrides(|name| match name {
            STAGING_SIZE_ENV => Some(" 65536 ".to_string()),
            POOL_SIZE_ENV => Some("lots".to_string()),
            MAX_POOLS_ENV => Some("2".to_string()),
            _ => None,
        });
        assert_eq!(config.staging_size, 65536);
        assert_eq!(
            config.image_pool.pool_size,
            AllocationPolicy::default().pool_size
        );
        assert_eq!(config.image_pool.max_pools, 2);
    }

    #[test]
    fn validate_rejects_bad_sizes() {
        let config = TextureCacheConfig {
            staging_size: 0,
            ..TextureCacheConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(TextureCacheError::InvalidConfig(_))
        ));

        let config = TextureCacheConfig {
            staging_alignment: 48,
            ..TextureCacheConfig::default()
        };
        assert!(config.validate().is_err());

        let mut config = TextureCacheConfig::default();
        config.image_pool.alignment = 3;
        assert!(config.validate().is_err());
    }
}
