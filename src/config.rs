//! Host configuration.

use thiserror::Error;

use crate::pool::{region_size, MAX_REGIONS, MIN_BLOCK};
use crate::stash::MIN_STASH_CAPACITY;

/// Maximum number of event ports per direction.
pub const MAX_PORTS: usize = 8;

/// What an output port carries while the script is not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BypassMode {
    /// An empty sequence.
    #[default]
    Silent,
    /// A copy of the input port with the same index, when it fits.
    Passthrough,
}

/// Configuration errors, reported at construction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("initial region size {0} must be a multiple of 8 and at least {min}", min = MIN_BLOCK * 4)]
    RegionSize(usize),
    #[error("region count {0} must be within 1..={max}", max = MAX_REGIONS)]
    RegionCount(usize),
    #[error("region {index} would exceed the 4 GiB region limit")]
    AddressSpace { index: u32 },
    #[error("port counts {input}/{output} exceed {max}", max = MAX_PORTS)]
    Ports { input: usize, output: usize },
    #[error("stash capacity {0} is below {min}", min = MIN_STASH_CAPACITY)]
    StashCapacity(usize),
    #[error("state capacity {0} is below {min}", min = MIN_STASH_CAPACITY)]
    StateCapacity(usize),
}

/// Everything needed to build a [`ScriptHost`](crate::host::ScriptHost).
#[derive(Debug, Clone, PartialEq)]
pub struct HostConfig {
    /// Size of region 0; region `i` is this size times `2^i`.
    pub initial_region_size: usize,
    /// Regions the pool may grow to, region 0 included.
    pub max_regions: usize,
    pub input_ports: usize,
    pub output_ports: usize,
    /// Stash bytes per input port.
    pub stash_capacity: usize,
    /// Scratch bytes for state save/restore and hot swap.
    pub state_capacity: usize,
    pub bypass: BypassMode,
    /// Script compiled at construction.
    pub initial_code: Option<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            initial_region_size: 128 * 1024,
            max_regions: 8,
            input_ports: 1,
            output_ports: 1,
            stash_capacity: 8 * 1024,
            state_capacity: 64 * 1024,
            bypass: BypassMode::Silent,
            initial_code: None,
        }
    }
}

impl HostConfig {
    pub fn with_initial_region_size(mut self, size: usize) -> Self {
        self.initial_region_size = size;
        self
    }

    pub fn with_max_regions(mut self, count: usize) -> Self {
        self.max_regions = count;
        self
    }

    pub fn with_ports(mut self, input: usize, output: usize) -> Self {
        self.input_ports = input;
        self.output_ports = output;
        self
    }

    pub fn with_stash_capacity(mut self, bytes: usize) -> Self {
        self.stash_capacity = bytes;
        self
    }

    pub fn with_state_capacity(mut self, bytes: usize) -> Self {
        self.state_capacity = bytes;
        self
    }

    pub fn with_bypass(mut self, mode: BypassMode) -> Self {
        self.bypass = mode;
        self
    }

    pub fn with_initial_code(mut self, code: impl Into<String>) -> Self {
        self.initial_code = Some(code.into());
        self
    }

    /// Check every field against the host's hard limits.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let base = self.initial_region_size;
        if base % 8 != 0 || base < MIN_BLOCK * 4 {
            return Err(ConfigError::RegionSize(base));
        }
        if self.max_regions == 0 || self.max_regions > MAX_REGIONS {
            return Err(ConfigError::RegionCount(self.max_regions));
        }
        let last = (self.max_regions - 1) as u32;
        match region_size(base, last) {
            Some(size) if size <= u32::MAX as usize => {}
            _ => return Err(ConfigError::AddressSpace { index: last }),
        }
        if self.input_ports > MAX_PORTS || self.output_ports > MAX_PORTS {
            return Err(ConfigError::Ports {
                input: self.input_ports,
                output: self.output_ports,
            });
        }
        if self.stash_capacity < MIN_STASH_CAPACITY {
            return Err(ConfigError::StashCapacity(self.stash_capacity));
        }
        if self.state_capacity < MIN_STASH_CAPACITY {
            return Err(ConfigError::StateCapacity(self.state_capacity));
        }
        Ok(())
    }
}
