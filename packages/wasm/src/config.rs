//! Boundary configuration: resource limits and host capabilities

use crate::error::BoundaryResult;
use serde::{Deserialize, Serialize};

/// Slots reserved at the bottom of the extern reference table
/// (undefined, null, true, false)
pub const RESERVED_SLOTS: u32 = 4;

/// Default initial extern reference table size
pub const DEFAULT_INITIAL_TABLE_SIZE: u32 = 128;

/// Default maximum extern reference table size: 1M slots
pub const DEFAULT_MAX_TABLE_SLOTS: u32 = 1 << 20;

/// Default maximum linear memory: 16384 pages (1GB)
pub const DEFAULT_MAX_MEMORY_PAGES: u32 = 16384;

/// Resource limits for a boundary context
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BoundaryLimits {
    /// Extern reference table capacity allocated up front
    pub initial_table_size: u32,

    /// Hard limit on extern reference table slots
    pub max_table_slots: u32,

    /// Hard limit on linear memory pages (64KB each)
    pub max_memory_pages: u32,
}

impl Default for BoundaryLimits {
    fn default() -> Self {
        Self {
            initial_table_size: DEFAULT_INITIAL_TABLE_SIZE,
            max_table_slots: DEFAULT_MAX_TABLE_SLOTS,
            max_memory_pages: DEFAULT_MAX_MEMORY_PAGES,
        }
    }
}

impl BoundaryLimits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrictive limits for untrusted modules
    pub fn restrictive() -> Self {
        Self {
            initial_table_size: 32,
            max_table_slots: 4096,
            max_memory_pages: 256, // 16MB
        }
    }

    pub fn with_table_slots(mut self, initial: u32, max: u32) -> Self {
        self.initial_table_size = initial;
        self.max_table_slots = max;
        self
    }

    pub fn with_max_memory_pages(mut self, pages: u32) -> Self {
        self.max_memory_pages = pages;
        self
    }
}

bitflags::bitflags! {
    /// Import families the linker exposes to the module
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HostCapabilities: u32 {
        /// No optional imports (core intrinsics are always linked)
        const NONE = 0;
        /// Wrap module closures into host functions and call host functions
        const CLOSURES = 1 << 0;
        /// Construct and chain host promises
        const PROMISES = 1 << 1;
        /// Drive stream controllers
        const STREAMS = 1 << 2;
        /// Console logging
        const CONSOLE = 1 << 3;

        /// Standard capabilities for most modules
        const STANDARD = Self::CLOSURES.bits() | Self::PROMISES.bits() | Self::CONSOLE.bits();

        /// Full capabilities
        const ALL = Self::CLOSURES.bits()
            | Self::PROMISES.bits()
            | Self::STREAMS.bits()
            | Self::CONSOLE.bits();
    }
}

impl Serialize for HostCapabilities {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.bits().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for HostCapabilities {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bits = u32::deserialize(deserializer)?;
        Ok(HostCapabilities::from_bits_truncate(bits))
    }
}

impl Default for HostCapabilities {
    fn default() -> Self {
        Self::STANDARD
    }
}

impl HostCapabilities {
    /// Check if a specific capability is granted
    pub fn has(&self, cap: HostCapabilities) -> bool {
        self.contains(cap)
    }

    /// Create from a list of capability names
    pub fn from_names(names: &[&str]) -> Self {
        let mut caps = Self::NONE;
        for name in names {
            match *name {
                "closures" => caps |= Self::CLOSURES,
                "promises" | "async" => caps |= Self::PROMISES,
                "streams" => caps |= Self::STREAMS,
                "console" | "log" => caps |= Self::CONSOLE,
                "standard" => caps |= Self::STANDARD,
                "all" => caps |= Self::ALL,
                _ => {}
            }
        }
        caps
    }
}

/// Complete configuration for a boundary context
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BoundaryConfig {
    /// Resource limits
    pub limits: BoundaryLimits,
    /// Import families linked for the module
    pub capabilities: HostCapabilities,
    /// Warn when a closure or stream adapter becomes unreachable without release
    pub leak_detection: bool,
}

impl Default for BoundaryConfig {
    fn default() -> Self {
        Self {
            limits: BoundaryLimits::default(),
            capabilities: HostCapabilities::STANDARD,
            leak_detection: cfg!(debug_assertions),
        }
    }
}

impl BoundaryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Development configuration (all imports, leak warnings on)
    pub fn development() -> Self {
        Self {
            limits: BoundaryLimits::default(),
            capabilities: HostCapabilities::ALL,
            leak_detection: true,
        }
    }

    /// Production configuration (all imports, leak warnings off)
    pub fn production() -> Self {
        Self {
            limits: BoundaryLimits::default(),
            capabilities: HostCapabilities::ALL,
            leak_detection: false,
        }
    }

    /// Restrictive config for untrusted modules
    pub fn restrictive() -> Self {
        Self {
            limits: BoundaryLimits::restrictive(),
            capabilities: HostCapabilities::NONE,
            leak_detection: true,
        }
    }

    /// Parse a configuration from TOML. Missing fields take their defaults.
    pub fn from_toml_str(source: &str) -> BoundaryResult<Self> {
        Ok(toml::from_str(source)?)
    }

    pub fn with_limits(mut self, limits: BoundaryLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_capabilities(mut self, capabilities: HostCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_leak_detection(mut self, enabled: bool) -> Self {
        self.leak_detection = enabled;
        self
    }
}
