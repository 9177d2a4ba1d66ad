//! Error types for the vault subsystem.
//!
//! Two layers: [`StoreError`] covers the backend itself (sled, encoding,
//! corrupt records) and [`VaultError`] is what callers of the service see.
//! Backend failures are wrapped rather than flattened so a caller can always
//! tell a genuine storage fault apart from a lost race.

use thiserror::Error;

use crate::types::{OwnerId, VaultId};

/// Convenience alias used throughout the crate.
pub type VaultResult<T> = Result<T, VaultError>;

/// What the viewer was trying to do when a permission check refused them.
///
/// The `Display` text is shown to the viewer verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denial {
    /// Opened a vault holding neither deposit nor withdraw rights.
    View,
    Deposit,
    Withdraw,
    /// Swaps move items both ways and need both rights.
    Swap,
    /// Requested destruction without owning the vault.
    Destroy,
}

impl std::fmt::Display for Denial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message = match self {
            Denial::View => "you don't have permission to access the vault",
            Denial::Deposit => "you don't have permission to deposit to the vault",
            Denial::Withdraw => "you don't have permission to withdraw from the vault",
            Denial::Swap => "you need both deposit and withdraw permission to swap items",
            Denial::Destroy => "only the guild owner can destroy the vault",
        };
        f.write_str(message)
    }
}

/// Failures originating in a storage backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The underlying sled database reported an error.
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    /// A value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A stored record is structurally invalid (wrong key length, etc.).
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Errors returned by vault operations.
#[derive(Debug, Error)]
pub enum VaultError {
    /// The viewer lacks the permission the action requires. No state was
    /// touched.
    #[error("permission denied: {0}")]
    PermissionDenied(Denial),

    /// The slot no longer holds what the viewer observed. The action was
    /// cancelled and the viewer's session has been refreshed.
    #[error("vault {vault_id} slot {slot} changed since it was observed")]
    Conflict { vault_id: VaultId, slot: usize },

    /// No vault with this id exists (or it has just been destroyed).
    #[error("vault not found: {0}")]
    VaultNotFound(VaultId),

    /// Slot index outside `0..slot_count`.
    #[error("slot {slot} out of range for vault {vault_id} ({slot_count} slots)")]
    SlotNotFound {
        vault_id: VaultId,
        slot: usize,
        slot_count: usize,
    },

    /// The owner already has a vault.
    #[error("owner {owner} already has a vault")]
    AlreadyExists { owner: OwnerId },

    /// A vault with this id is already registered or allocated.
    #[error("vault {0} already exists")]
    DuplicateVault(VaultId),

    /// The action is malformed or not meaningful for the slot.
    #[error("invalid action: {0}")]
    InvalidAction(String),

    /// Configuration rejected by [`VaultConfig::validate`](crate::config::VaultConfig::validate).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The backend failed. Fatal to the operation that hit it.
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
}

impl VaultError {
    /// Whether the caller can reasonably try again (after refreshing, or
    /// with different input). Storage and configuration failures are not.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, VaultError::Storage(_) | VaultError::InvalidConfig(_))
    }

    /// Whether this is a lost compare-and-set race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, VaultError::Conflict { .. })
    }

    /// Whether the error means "nothing by that name".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            VaultError::VaultNotFound(_) | VaultError::SlotNotFound { .. }
        )
    }
}

impl From<sled::Error> for VaultError {
    fn from(err: sled::Error) -> Self {
        VaultError::Storage(StoreError::Sled(err))
    }
}

impl From<bincode::Error> for VaultError {
    fn from(err: bincode::Error) -> Self {
        VaultError::Storage(StoreError::from(err))
    }
}
