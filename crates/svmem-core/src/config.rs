//! Manager configuration

use crate::{Error, Result};
use serde::Deserialize;

/// Default maximum number of live regions per context
pub const DEFAULT_REGION_CAPACITY: usize = 1024;

/// Alignment used when the device reports none
pub const DEFAULT_ALIGNMENT: usize = 64;

/// Work items launched by the atomic probe
pub const DEFAULT_PROBE_WORK_ITEMS: usize = 1000;

/// What `SvmContext::destroy` does with regions that are still live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestroyPolicy {
    /// Refuse with `ResourceLeak`
    #[default]
    Strict,
    /// Free every remaining region, then destroy
    Cascade,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub destroy_policy: DestroyPolicy,
    pub region_capacity: usize,
    pub default_alignment: usize,
    pub probe_work_items: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            destroy_policy: DestroyPolicy::Strict,
            region_capacity: DEFAULT_REGION_CAPACITY,
            default_alignment: DEFAULT_ALIGNMENT,
            probe_work_items: DEFAULT_PROBE_WORK_ITEMS,
        }
    }
}

impl Config {
    /// Parse from TOML; missing keys keep their defaults
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(s).map_err(|e| Error::InvalidArgument(format!("config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_destroy_policy(mut self, policy: DestroyPolicy) -> Self {
        self.destroy_policy = policy;
        self
    }

    pub fn with_region_capacity(mut self, capacity: usize) -> Self {
        self.region_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.default_alignment.is_power_of_two() {
            return Err(Error::InvalidArgument(format!(
                "default_alignment must be a power of two, got {}",
                self.default_alignment
            )));
        }
        if self.region_capacity == 0 {
            return Err(Error::InvalidArgument("region_capacity must be > 0".to_string()));
        }
        Ok(())
    }
}
