//! # Vault Configuration & Constants
//!
//! Every tunable number in the vault subsystem lives here. The constants are
//! the defaults; [`VaultConfig`] is what a running service actually reads, so
//! a host can override slot counts, stack limits and flush cadence without
//! recompiling.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{VaultError, VaultResult};
use crate::types::Material;

// ---------------------------------------------------------------------------
// Storage Geometry
// ---------------------------------------------------------------------------

/// Number of slots in a freshly formed vault. Six rows of nine, the size of
/// a double chest.
pub const STORAGE_SIZE: usize = 54;

/// Upper bound on the slot count a vault may be configured with. Slot
/// indices are encoded as big-endian `u32` in storage keys, but nothing
/// sensible needs more than a few hundred.
pub const MAX_SLOT_COUNT: usize = 1024;

/// Stack size for any material without an explicit override.
pub const DEFAULT_MAX_STACK: u32 = 64;

/// Materials that stack to 16 rather than 64.
pub const SIXTEEN_STACK_MATERIALS: &[&str] = &[
    "ENDER_PEARL",
    "SNOWBALL",
    "EGG",
    "BUCKET",
    "HONEY_BOTTLE",
    "OAK_SIGN",
    "ARMOR_STAND",
];

/// Materials that never stack.
pub const UNSTACKABLE_MATERIALS: &[&str] = &[
    "DIAMOND_SWORD",
    "DIAMOND_PICKAXE",
    "IRON_SWORD",
    "IRON_PICKAXE",
    "BOW",
    "SHIELD",
    "ELYTRA",
    "WATER_BUCKET",
    "LAVA_BUCKET",
    "TOTEM_OF_UNDYING",
];

// ---------------------------------------------------------------------------
// Audit & Sessions
// ---------------------------------------------------------------------------

/// Rows per page when the audit log is displayed.
pub const TRANSACTION_PAGE_SIZE: usize = 10;

/// How often open sessions are flushed to the store while still in use.
/// Bounds what can be lost if the host dies with vaults open.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(30);

/// Capacity of the outbound event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// StackLimits
// ---------------------------------------------------------------------------

/// Per-material maximum stack sizes.
///
/// This is the authoritative answer to "how many of X fit in one slot".
/// Caller-supplied stack sizes are only ever allowed to lower it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackLimits {
    default_max: u32,
    overrides: HashMap<Material, u32>,
}

impl StackLimits {
    /// Limits where every material stacks to `default_max` and nothing is
    /// overridden.
    pub fn uniform(default_max: u32) -> Self {
        Self {
            default_max,
            overrides: HashMap::new(),
        }
    }

    /// Adds or replaces the limit for one material.
    pub fn with_override(mut self, material: Material, max: u32) -> Self {
        self.overrides.insert(material, max);
        self
    }

    /// Replaces the fallback limit, keeping every override.
    pub fn with_default_max(mut self, default_max: u32) -> Self {
        self.default_max = default_max;
        self
    }

    /// The stack size used for materials without an override.
    pub fn default_max(&self) -> u32 {
        self.default_max
    }

    /// Maximum stack size for `material`.
    pub fn max_for(&self, material: &Material) -> u32 {
        self.overrides
            .get(material)
            .copied()
            .unwrap_or(self.default_max)
    }
}

impl Default for StackLimits {
    fn default() -> Self {
        let mut limits = Self::uniform(DEFAULT_MAX_STACK);
        for name in SIXTEEN_STACK_MATERIALS {
            if let Ok(material) = Material::new(name) {
                limits.overrides.insert(material, 16);
            }
        }
        for name in UNSTACKABLE_MATERIALS {
            if let Ok(material) = Material::new(name) {
                limits.overrides.insert(material, 1);
            }
        }
        limits
    }
}

// ---------------------------------------------------------------------------
// VaultConfig
// ---------------------------------------------------------------------------

/// Runtime configuration for a [`VaultService`](crate::service::VaultService).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Slots allocated for every newly formed vault.
    pub slot_count: usize,

    /// Stack size table.
    pub stack_limits: StackLimits,

    /// Period of the background session flush.
    pub flush_interval: Duration,

    /// Capacity of the outbound event channel.
    pub event_capacity: usize,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            slot_count: STORAGE_SIZE,
            stack_limits: StackLimits::default(),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            event_capacity: EVENT_CHANNEL_CAPACITY,
        }
    }
}

impl VaultConfig {
    /// Rejects configurations the service cannot run with.
    pub fn validate(&self) -> VaultResult<()> {
        if self.slot_count == 0 || self.slot_count > MAX_SLOT_COUNT {
            return Err(VaultError::InvalidConfig(format!(
                "slot_count must be in 1..={MAX_SLOT_COUNT}, got {}",
                self.slot_count
            )));
        }
        if self.stack_limits.default_max == 0 {
            return Err(VaultError::InvalidConfig(
                "default max stack must be at least 1".to_string(),
            ));
        }
        if let Some((material, _)) = self.stack_limits.overrides.iter().find(|(_, max)| **max == 0)
        {
            return Err(VaultError::InvalidConfig(format!(
                "max stack for {material} must be at least 1"
            )));
        }
        if self.event_capacity == 0 {
            return Err(VaultError::InvalidConfig(
                "event_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
