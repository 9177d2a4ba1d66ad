//! # VaultDb — Persistent Storage Engine
//!
//! The sled-backed implementation of every vault storage trait. All on-disk
//! vault data flows through this module.
//!
//! ## Tree Layout
//!
//! | Tree           | Key                                | Value                 |
//! |----------------|------------------------------------|-----------------------|
//! | `slot_meta`    | `vault_id` (16B)                   | `slot_count` (4B BE)  |
//! | `slots`        | `vault_id` (16B) ‖ `slot` (4B BE)  | `bincode(ItemStack)`  |
//! | `vaults`       | `vault_id` (16B)                   | `bincode(Vault)`      |
//! | `vault_owners` | `owner` (UTF-8)                    | `vault_id` (16B)      |
//! | `transactions` | `vault_id` (16B) ‖ `seq` (8B BE)   | `bincode(Transaction)`|
//!
//! An empty slot has no key at all, so a fresh vault costs one `slot_meta`
//! row. Slot indices and transaction sequence numbers are big-endian so that
//! a prefix scan over one vault comes back in numeric order; scanning the
//! `transactions` prefix in reverse yields newest-first history for free.
//!
//! ## Atomicity
//!
//! `compare_and_set` is sled's own `compare_and_swap` on the encoded slot
//! value. `fill` is `fetch_and_update`, which sled retries internally until
//! the merge applies to the value it read. One-vault-per-owner is a
//! `compare_and_swap` on `vault_owners` from absent to the new id.

use std::path::Path;

use sled::{Batch, Db, IVec, Tree};

use crate::error::{StoreError, VaultError, VaultResult};
use crate::ledger::{NewTransaction, Transaction, TransactionLog};
use crate::registry::VaultRegistry;
use crate::slots::{check_slot, fill_slot, Fill, SlotStore};
use crate::types::{ActorId, ItemStack, Location, OwnerId, SlotContent, Vault, VaultId};

// ---------------------------------------------------------------------------
// Key Encoding
// ---------------------------------------------------------------------------

const VAULT_KEY_LEN: usize = 16;

fn slot_key(vault_id: VaultId, slot: usize) -> [u8; 20] {
    let mut key = [0u8; 20];
    key[..VAULT_KEY_LEN].copy_from_slice(vault_id.as_bytes());
    key[VAULT_KEY_LEN..].copy_from_slice(&(slot as u32).to_be_bytes());
    key
}

fn slot_index(key: &[u8]) -> Result<usize, StoreError> {
    let bytes: [u8; 4] = key
        .get(VAULT_KEY_LEN..)
        .and_then(|tail| tail.try_into().ok())
        .ok_or_else(|| StoreError::Corrupt(format!("slot key of length {}", key.len())))?;
    Ok(u32::from_be_bytes(bytes) as usize)
}

fn transaction_key(vault_id: VaultId, seq: u64) -> [u8; 24] {
    let mut key = [0u8; 24];
    key[..VAULT_KEY_LEN].copy_from_slice(vault_id.as_bytes());
    key[VAULT_KEY_LEN..].copy_from_slice(&seq.to_be_bytes());
    key
}

fn decode_count(bytes: &[u8]) -> Result<usize, StoreError> {
    let bytes: [u8; 4] = bytes
        .try_into()
        .map_err(|_| StoreError::Corrupt(format!("slot count of length {}", bytes.len())))?;
    Ok(u32::from_be_bytes(bytes) as usize)
}

fn decode_vault_id(bytes: &[u8]) -> Result<VaultId, StoreError> {
    let bytes: [u8; 16] = bytes
        .try_into()
        .map_err(|_| StoreError::Corrupt(format!("vault id of length {}", bytes.len())))?;
    Ok(VaultId::from_bytes(bytes))
}

fn encode_content(content: &SlotContent) -> Result<Option<Vec<u8>>, StoreError> {
    content
        .as_ref()
        .map(|stack| bincode::serialize(stack).map_err(StoreError::from))
        .transpose()
}

fn decode_stack(bytes: &[u8]) -> Result<ItemStack, StoreError> {
    Ok(bincode::deserialize(bytes)?)
}

// ---------------------------------------------------------------------------
// VaultDb
// ---------------------------------------------------------------------------

/// Persistent vault storage.
///
/// Cloning is cheap: sled handles are reference counted, and every clone
/// sees the same data.
#[derive(Debug, Clone)]
pub struct VaultDb {
    db: Db,
    /// Allocated slot count per vault.
    slot_meta: Tree,
    /// Non-empty slots, keyed by vault then index.
    slots: Tree,
    /// Registry records.
    vaults: Tree,
    /// Owner → vault id, the uniqueness index.
    vault_owners: Tree,
    /// Audit rows, keyed by vault then append sequence.
    transactions: Tree,
}

impl VaultDb {
    /// Open or create a database at the given filesystem path.
    pub fn open<P: AsRef<Path>>(path: P) -> VaultResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// A database that lives in a temporary directory and is removed when
    /// the last handle drops. For tests.
    pub fn open_temporary() -> VaultResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> VaultResult<Self> {
        Ok(Self {
            slot_meta: db.open_tree("slot_meta")?,
            slots: db.open_tree("slots")?,
            vaults: db.open_tree("vaults")?,
            vault_owners: db.open_tree("vault_owners")?,
            transactions: db.open_tree("transactions")?,
            db,
        })
    }

    /// Force pending writes to disk.
    pub fn flush(&self) -> VaultResult<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Number of audit rows across all vaults.
    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    /// Slot count for the vault, checking `slot` is in range when given.
    fn checked_count(&self, vault_id: VaultId, slot: Option<usize>) -> VaultResult<usize> {
        let bytes = self
            .slot_meta
            .get(vault_id.as_bytes())?
            .ok_or(VaultError::VaultNotFound(vault_id))?;
        let count = decode_count(&bytes)?;
        if let Some(slot) = slot {
            check_slot(vault_id, slot, count)?;
        }
        Ok(count)
    }

    fn decode_vault(bytes: &[u8]) -> VaultResult<Vault> {
        Ok(bincode::deserialize(bytes)?)
    }

    fn decode_transaction(bytes: &[u8]) -> VaultResult<Transaction> {
        Ok(bincode::deserialize(bytes)?)
    }

    fn remove_prefix(tree: &Tree, prefix: &[u8]) -> VaultResult<usize> {
        let mut batch = Batch::default();
        let mut removed = 0;
        for key in tree.scan_prefix(prefix).keys() {
            batch.remove(key?);
            removed += 1;
        }
        tree.apply_batch(batch)?;
        Ok(removed)
    }
}

// -- SlotStore ----------------------------------------------------------------

impl SlotStore for VaultDb {
    fn create(&self, vault_id: VaultId, slot_count: usize) -> VaultResult<()> {
        let count = (slot_count as u32).to_be_bytes();
        self.slot_meta
            .compare_and_swap(vault_id.as_bytes(), None::<&[u8]>, Some(&count[..]))?
            .map_err(|_| VaultError::DuplicateVault(vault_id))?;
        // Stale slot rows from a vault that was half purged.
        Self::remove_prefix(&self.slots, vault_id.as_bytes())?;
        Ok(())
    }

    fn slot_count(&self, vault_id: VaultId) -> VaultResult<usize> {
        self.checked_count(vault_id, None)
    }

    fn get(&self, vault_id: VaultId, slot: usize) -> VaultResult<SlotContent> {
        self.checked_count(vault_id, Some(slot))?;
        match self.slots.get(slot_key(vault_id, slot))? {
            Some(bytes) => Ok(Some(decode_stack(&bytes)?)),
            None => Ok(None),
        }
    }

    fn compare_and_set(
        &self,
        vault_id: VaultId,
        slot: usize,
        expected: &SlotContent,
        new: &SlotContent,
    ) -> VaultResult<bool> {
        self.checked_count(vault_id, Some(slot))?;
        let old_bytes = encode_content(expected)?;
        let new_bytes = encode_content(new)?;
        let swapped = self
            .slots
            .compare_and_swap(slot_key(vault_id, slot), old_bytes, new_bytes)?;
        Ok(swapped.is_ok())
    }

    fn fill(
        &self,
        vault_id: VaultId,
        slot: usize,
        stack: &ItemStack,
        max_stack: u32,
    ) -> VaultResult<Fill> {
        self.checked_count(vault_id, Some(slot))?;

        // The closure may run several times under contention; it must stay
        // a pure function of the value it is handed.
        let mut failure: Option<StoreError> = None;
        let previous = self
            .slots
            .fetch_and_update(slot_key(vault_id, slot), |old: Option<&[u8]>| {
                let current = match old.map(decode_stack).transpose() {
                    Ok(current) => current,
                    Err(err) => {
                        failure = Some(err);
                        return old.map(IVec::from);
                    }
                };
                match encode_content(&fill_slot(&current, stack, max_stack).after) {
                    Ok(bytes) => bytes.map(IVec::from),
                    Err(err) => {
                        failure = Some(err);
                        old.map(IVec::from)
                    }
                }
            })?;
        if let Some(err) = failure {
            return Err(err.into());
        }

        let before = previous.as_deref().map(decode_stack).transpose()?;
        Ok(fill_slot(&before, stack, max_stack))
    }

    fn snapshot(&self, vault_id: VaultId) -> VaultResult<Vec<SlotContent>> {
        let count = self.checked_count(vault_id, None)?;
        let mut contents: Vec<SlotContent> = vec![None; count];
        for entry in self.slots.scan_prefix(vault_id.as_bytes()) {
            let (key, value) = entry?;
            let index = slot_index(&key)?;
            if let Some(cell) = contents.get_mut(index) {
                *cell = Some(decode_stack(&value)?);
            }
        }
        Ok(contents)
    }

    fn purge(&self, vault_id: VaultId) -> VaultResult<()> {
        self.slot_meta.remove(vault_id.as_bytes())?;
        Self::remove_prefix(&self.slots, vault_id.as_bytes())?;
        Ok(())
    }
}

// -- TransactionLog -----------------------------------------------------------

impl TransactionLog for VaultDb {
    fn append(&self, entry: NewTransaction) -> VaultResult<Transaction> {
        // generate_id is monotonic across restarts, so ids double as the
        // append sequence.
        let seq = self.db.generate_id()?;
        let tx = entry.into_transaction(seq);
        let bytes = bincode::serialize(&tx)?;
        self.transactions
            .insert(transaction_key(tx.vault_id, seq), bytes)?;
        Ok(tx)
    }

    fn append_all(&self, entries: Vec<NewTransaction>) -> VaultResult<Vec<Transaction>> {
        let mut batch = Batch::default();
        let mut rows = Vec::with_capacity(entries.len());
        for entry in entries {
            let seq = self.db.generate_id()?;
            let tx = entry.into_transaction(seq);
            batch.insert(&transaction_key(tx.vault_id, seq)[..], bincode::serialize(&tx)?);
            rows.push(tx);
        }
        self.transactions.apply_batch(batch)?;
        Ok(rows)
    }

    fn find_by_vault(&self, vault_id: VaultId, limit: usize) -> VaultResult<Vec<Transaction>> {
        let mut rows = Vec::with_capacity(limit.min(64));
        for entry in self
            .transactions
            .scan_prefix(vault_id.as_bytes())
            .values()
            .rev()
            .take(limit)
        {
            rows.push(Self::decode_transaction(&entry?)?);
        }
        Ok(rows)
    }

    fn find_by_actor(&self, actor_id: ActorId, limit: usize) -> VaultResult<Vec<Transaction>> {
        let mut rows = Vec::new();
        for entry in self.transactions.iter().values() {
            let tx = Self::decode_transaction(&entry?)?;
            if tx.actor_id == actor_id {
                rows.push(tx);
            }
        }
        rows.sort_by(|a, b| b.id.cmp(&a.id));
        rows.truncate(limit);
        Ok(rows)
    }

    fn delete_by_vault(&self, vault_id: VaultId) -> VaultResult<usize> {
        Self::remove_prefix(&self.transactions, vault_id.as_bytes())
    }
}

// -- VaultRegistry ------------------------------------------------------------

impl VaultRegistry for VaultDb {
    fn insert(&self, vault: &Vault) -> VaultResult<()> {
        let owner_key = vault.owner.as_str().as_bytes();
        let id_bytes = vault.id.as_bytes();

        self.vault_owners
            .compare_and_swap(owner_key, None::<&[u8]>, Some(&id_bytes[..]))?
            .map_err(|_| VaultError::AlreadyExists {
                owner: vault.owner.clone(),
            })?;

        let record = bincode::serialize(vault)?;
        let inserted = self
            .vaults
            .compare_and_swap(id_bytes, None::<&[u8]>, Some(record))?;
        if inserted.is_err() {
            // Release the owner claim taken above.
            let _ = self.vault_owners.compare_and_swap(
                owner_key,
                Some(&id_bytes[..]),
                None::<&[u8]>,
            )?;
            return Err(VaultError::DuplicateVault(vault.id));
        }
        Ok(())
    }

    fn find_by_id(&self, vault_id: VaultId) -> VaultResult<Option<Vault>> {
        self.vaults
            .get(vault_id.as_bytes())?
            .map(|bytes| Self::decode_vault(&bytes))
            .transpose()
    }

    fn find_by_owner(&self, owner: &OwnerId) -> VaultResult<Option<Vault>> {
        match self.vault_owners.get(owner.as_str().as_bytes())? {
            Some(bytes) => self.find_by_id(decode_vault_id(&bytes)?),
            None => Ok(None),
        }
    }

    fn find_by_location(&self, location: &Location) -> VaultResult<Option<Vault>> {
        for entry in self.vaults.iter().values() {
            let vault = Self::decode_vault(&entry?)?;
            if vault.location == *location {
                return Ok(Some(vault));
            }
        }
        Ok(None)
    }

    fn remove(&self, vault_id: VaultId) -> VaultResult<Option<Vault>> {
        let Some(bytes) = self.vaults.remove(vault_id.as_bytes())? else {
            return Ok(None);
        };
        let vault = Self::decode_vault(&bytes)?;
        // Only free the owner if it still points at this vault.
        let _ = self.vault_owners.compare_and_swap(
            vault.owner.as_str().as_bytes(),
            Some(&vault_id.as_bytes()[..]),
            None::<&[u8]>,
        )?;
        Ok(Some(vault))
    }

    fn count(&self) -> VaultResult<usize> {
        Ok(self.vaults.len())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
