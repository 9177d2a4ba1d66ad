//! In-memory backend.
//!
//! Vaults live in a `DashMap`; each slot gets its own `parking_lot::Mutex`,
//! so two viewers hitting different slots never contend and two hitting the
//! same slot serialize on exactly that slot. Nothing survives a restart.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::error::{VaultError, VaultResult};
use crate::ledger::{NewTransaction, Transaction, TransactionLog};
use crate::registry::VaultRegistry;
use crate::slots::{check_slot, fill_slot, Fill, SlotStore};
use crate::types::{ActorId, ItemStack, Location, OwnerId, SlotContent, Vault, VaultId};

struct SlotArray {
    slots: Vec<Mutex<SlotContent>>,
}

impl SlotArray {
    fn new(slot_count: usize) -> Self {
        Self {
            slots: (0..slot_count).map(|_| Mutex::new(None)).collect(),
        }
    }
}

/// Volatile implementation of every storage trait.
#[derive(Default)]
pub struct MemoryBackend {
    slots: DashMap<VaultId, Arc<SlotArray>>,
    vaults: DashMap<VaultId, Vault>,
    owners: DashMap<OwnerId, VaultId>,
    /// Append order. The write lock is held while ids are assigned so the
    /// vector stays sorted by id.
    transactions: RwLock<Vec<Transaction>>,
    next_tx_id: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clones the slot array handle out of the map so no shard lock is held
    /// while a slot mutex is.
    fn slot_array(&self, vault_id: VaultId) -> VaultResult<Arc<SlotArray>> {
        self.slots
            .get(&vault_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(VaultError::VaultNotFound(vault_id))
    }

    /// Slot array for the vault, after checking `slot` is in range.
    fn checked_array(&self, vault_id: VaultId, slot: usize) -> VaultResult<Arc<SlotArray>> {
        let array = self.slot_array(vault_id)?;
        check_slot(vault_id, slot, array.slots.len())?;
        Ok(array)
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("vaults", &self.vaults.len())
            .field("slot_arrays", &self.slots.len())
            .field("transactions", &self.transactions.read().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// SlotStore
// ---------------------------------------------------------------------------

impl SlotStore for MemoryBackend {
    fn create(&self, vault_id: VaultId, slot_count: usize) -> VaultResult<()> {
        match self.slots.entry(vault_id) {
            Entry::Occupied(_) => Err(VaultError::DuplicateVault(vault_id)),
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(SlotArray::new(slot_count)));
                Ok(())
            }
        }
    }

    fn slot_count(&self, vault_id: VaultId) -> VaultResult<usize> {
        Ok(self.slot_array(vault_id)?.slots.len())
    }

    fn get(&self, vault_id: VaultId, slot: usize) -> VaultResult<SlotContent> {
        let array = self.checked_array(vault_id, slot)?;
        let content = array.slots[slot].lock().clone();
        Ok(content)
    }

    fn compare_and_set(
        &self,
        vault_id: VaultId,
        slot: usize,
        expected: &SlotContent,
        new: &SlotContent,
    ) -> VaultResult<bool> {
        let array = self.checked_array(vault_id, slot)?;
        let mut cell = array.slots[slot].lock();
        if *cell != *expected {
            return Ok(false);
        }
        *cell = new.clone();
        Ok(true)
    }

    fn fill(
        &self,
        vault_id: VaultId,
        slot: usize,
        stack: &ItemStack,
        max_stack: u32,
    ) -> VaultResult<Fill> {
        let array = self.checked_array(vault_id, slot)?;
        let mut cell = array.slots[slot].lock();
        let fill = fill_slot(&cell, stack, max_stack);
        *cell = fill.after.clone();
        Ok(fill)
    }

    fn snapshot(&self, vault_id: VaultId) -> VaultResult<Vec<SlotContent>> {
        let array = self.slot_array(vault_id)?;
        let contents = array.slots.iter().map(|cell| cell.lock().clone()).collect();
        Ok(contents)
    }

    fn purge(&self, vault_id: VaultId) -> VaultResult<()> {
        self.slots.remove(&vault_id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TransactionLog
// ---------------------------------------------------------------------------

impl TransactionLog for MemoryBackend {
    fn append(&self, entry: NewTransaction) -> VaultResult<Transaction> {
        let mut log = self.transactions.write();
        let id = self.next_tx_id.fetch_add(1, Ordering::Relaxed) + 1;
        let tx = entry.into_transaction(id);
        log.push(tx.clone());
        Ok(tx)
    }

    fn append_all(&self, entries: Vec<NewTransaction>) -> VaultResult<Vec<Transaction>> {
        let mut log = self.transactions.write();
        let first = self
            .next_tx_id
            .fetch_add(entries.len() as u64, Ordering::Relaxed)
            + 1;
        let rows: Vec<Transaction> = entries
            .into_iter()
            .zip(first..)
            .map(|(entry, id)| entry.into_transaction(id))
            .collect();
        log.extend(rows.iter().cloned());
        Ok(rows)
    }

    fn find_by_vault(&self, vault_id: VaultId, limit: usize) -> VaultResult<Vec<Transaction>> {
        let log = self.transactions.read();
        Ok(log
            .iter()
            .rev()
            .filter(|tx| tx.vault_id == vault_id)
            .take(limit)
            .cloned()
            .collect())
    }

    fn find_by_actor(&self, actor_id: ActorId, limit: usize) -> VaultResult<Vec<Transaction>> {
        let log = self.transactions.read();
        Ok(log
            .iter()
            .rev()
            .filter(|tx| tx.actor_id == actor_id)
            .take(limit)
            .cloned()
            .collect())
    }

    fn delete_by_vault(&self, vault_id: VaultId) -> VaultResult<usize> {
        let mut log = self.transactions.write();
        let before = log.len();
        log.retain(|tx| tx.vault_id != vault_id);
        Ok(before - log.len())
    }
}

// ---------------------------------------------------------------------------
// VaultRegistry
// ---------------------------------------------------------------------------

impl VaultRegistry for MemoryBackend {
    fn insert(&self, vault: &Vault) -> VaultResult<()> {
        // Lock order: owners shard, then vaults shard.
        match self.owners.entry(vault.owner.clone()) {
            Entry::Occupied(_) => Err(VaultError::AlreadyExists {
                owner: vault.owner.clone(),
            }),
            Entry::Vacant(owner_entry) => match self.vaults.entry(vault.id) {
                Entry::Occupied(_) => Err(VaultError::DuplicateVault(vault.id)),
                Entry::Vacant(vault_entry) => {
                    vault_entry.insert(vault.clone());
                    owner_entry.insert(vault.id);
                    Ok(())
                }
            },
        }
    }

    fn find_by_id(&self, vault_id: VaultId) -> VaultResult<Option<Vault>> {
        Ok(self.vaults.get(&vault_id).map(|v| v.value().clone()))
    }

    fn find_by_owner(&self, owner: &OwnerId) -> VaultResult<Option<Vault>> {
        let Some(vault_id) = self.owners.get(owner).map(|id| *id.value()) else {
            return Ok(None);
        };
        self.find_by_id(vault_id)
    }

    fn find_by_location(&self, location: &Location) -> VaultResult<Option<Vault>> {
        Ok(self
            .vaults
            .iter()
            .find(|entry| entry.value().location == *location)
            .map(|entry| entry.value().clone()))
    }

    fn remove(&self, vault_id: VaultId) -> VaultResult<Option<Vault>> {
        let Some((_, vault)) = self.vaults.remove(&vault_id) else {
            return Ok(None);
        };
        self.owners.remove_if(&vault.owner, |_, id| *id == vault_id);
        Ok(Some(vault))
    }

    fn count(&self) -> VaultResult<usize> {
        Ok(self.vaults.len())
    }
}
