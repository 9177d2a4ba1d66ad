//! Vault metadata registry.
//!
//! Maps vault ids to their [`Vault`] record and enforces that an owner holds
//! at most one vault at a time.

use crate::error::VaultResult;
use crate::types::{Location, OwnerId, Vault, VaultId};

pub trait VaultRegistry: Send + Sync {
    /// Registers a vault. Fails with `AlreadyExists` if the owner already
    /// has one and `DuplicateVault` if the id is taken; in both cases nothing
    /// is written.
    fn insert(&self, vault: &Vault) -> VaultResult<()>;

    fn find_by_id(&self, vault_id: VaultId) -> VaultResult<Option<Vault>>;

    fn find_by_owner(&self, owner: &OwnerId) -> VaultResult<Option<Vault>>;

    fn find_by_location(&self, location: &Location) -> VaultResult<Option<Vault>>;

    /// Removes the vault and frees its owner. Returns the removed record.
    fn remove(&self, vault_id: VaultId) -> VaultResult<Option<Vault>>;

    /// Number of registered vaults.
    fn count(&self) -> VaultResult<usize>;
}
