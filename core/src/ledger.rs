//! # Transaction Log
//!
//! Append-only audit of every deposit and withdrawal. Rows are written only
//! after the slot store has accepted the mutation they describe, so the log
//! never claims a movement that did not happen. The converse does not hold:
//! a crash between the two writes can leave a movement unlogged.
//!
//! Rows are never edited. They disappear only when their vault is destroyed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::TRANSACTION_PAGE_SIZE;
use crate::error::VaultResult;
use crate::types::{ActorId, ItemStack, Material, VaultId};

/// Direction of an item movement, from the vault's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Deposit,
    Withdraw,
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionKind::Deposit => f.write_str("DEPOSIT"),
            TransactionKind::Withdraw => f.write_str("WITHDRAW"),
        }
    }
}

/// A row about to be appended. The log assigns the id and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransaction {
    pub vault_id: VaultId,
    pub actor_id: ActorId,
    pub kind: TransactionKind,
    pub material: Material,
    pub amount: u32,
}

impl NewTransaction {
    pub fn deposit(vault_id: VaultId, actor_id: ActorId, stack: &ItemStack) -> Self {
        Self {
            vault_id,
            actor_id,
            kind: TransactionKind::Deposit,
            material: stack.material.clone(),
            amount: stack.amount,
        }
    }

    pub fn withdraw(vault_id: VaultId, actor_id: ActorId, stack: &ItemStack) -> Self {
        Self {
            vault_id,
            actor_id,
            kind: TransactionKind::Withdraw,
            material: stack.material.clone(),
            amount: stack.amount,
        }
    }

    /// Stamps the row with its id and the current time.
    pub fn into_transaction(self, id: u64) -> Transaction {
        Transaction {
            id,
            vault_id: self.vault_id,
            actor_id: self.actor_id,
            kind: self.kind,
            material: self.material,
            amount: self.amount,
            timestamp: Utc::now(),
        }
    }
}

/// A recorded movement. `id` strictly increases in append order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: u64,
    pub vault_id: VaultId,
    pub actor_id: ActorId,
    pub kind: TransactionKind,
    pub material: Material,
    pub amount: u32,
    pub timestamp: DateTime<Utc>,
}

/// Persistent audit storage.
pub trait TransactionLog: Send + Sync {
    /// Records a movement, returning the stored row.
    fn append(&self, entry: NewTransaction) -> VaultResult<Transaction>;

    /// Records several movements as one unit: either every row is stored,
    /// with ids increasing in the given order, or none is.
    fn append_all(&self, entries: Vec<NewTransaction>) -> VaultResult<Vec<Transaction>>;

    /// Up to `limit` rows for the vault, newest first.
    fn find_by_vault(&self, vault_id: VaultId, limit: usize) -> VaultResult<Vec<Transaction>>;

    /// Up to `limit` rows by the actor across all vaults, newest first.
    fn find_by_actor(&self, actor_id: ActorId, limit: usize) -> VaultResult<Vec<Transaction>>;

    /// Removes every row for the vault. Returns how many were removed.
    fn delete_by_vault(&self, vault_id: VaultId) -> VaultResult<usize>;
}

/// One page of a vault's history, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionPage {
    /// 1-based page number.
    pub page: usize,
    pub page_size: usize,
    pub entries: Vec<Transaction>,
    /// Whether an older page exists.
    pub has_more: bool,
}

impl TransactionPage {
    /// Loads page `page` (1-based; 0 is treated as 1).
    ///
    /// Fetches one row past the end of the page to learn whether another
    /// page follows.
    pub fn load(log: &dyn TransactionLog, vault_id: VaultId, page: usize) -> VaultResult<Self> {
        let page = page.max(1);
        let page_size = TRANSACTION_PAGE_SIZE;
        let offset = (page - 1) * page_size;

        let mut rows = log.find_by_vault(vault_id, offset + page_size + 1)?;
        let has_more = rows.len() > offset + page_size;
        let entries: Vec<Transaction> = if rows.len() > offset {
            rows.drain(offset..).take(page_size).collect()
        } else {
            Vec::new()
        };

        Ok(Self {
            page,
            page_size,
            entries,
            has_more,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;

    fn diamonds(amount: u32) -> ItemStack {
        ItemStack::new(Material::new("DIAMOND").unwrap(), amount).unwrap()
    }

    fn fill_log(log: &MemoryBackend, vault_id: VaultId, rows: u32) {
        let actor = ActorId::new();
        for i in 1..=rows {
            log.append(NewTransaction::deposit(vault_id, actor, &diamonds(i)))
                .unwrap();
        }
    }

    #[test]
    fn builders_capture_the_stack() {
        let vault_id = VaultId::new();
        let actor = ActorId::new();
        let entry = NewTransaction::withdraw(vault_id, actor, &diamonds(7));
        assert_eq!(entry.kind, TransactionKind::Withdraw);
        assert_eq!(entry.amount, 7);
        assert_eq!(entry.material.as_str(), "DIAMOND");

        let tx = entry.into_transaction(42);
        assert_eq!(tx.id, 42);
        assert_eq!(tx.vault_id, vault_id);
    }

    #[test]
    fn first_page_is_newest() {
        let log = MemoryBackend::new();
        let vault_id = VaultId::new();
        fill_log(&log, vault_id, 25);

        let page = TransactionPage::load(&log, vault_id, 1).unwrap();
        assert_eq!(page.entries.len(), TRANSACTION_PAGE_SIZE);
        assert_eq!(page.entries[0].amount, 25);
        assert!(page.has_more);
    }

    #[test]
    fn last_page_is_partial() {
        let log = MemoryBackend::new();
        let vault_id = VaultId::new();
        fill_log(&log, vault_id, 25);

        let page = TransactionPage::load(&log, vault_id, 3).unwrap();
        assert_eq!(page.entries.len(), 5);
        assert_eq!(page.entries[0].amount, 5);
        assert_eq!(page.entries[4].amount, 1);
        assert!(!page.has_more);
    }

    #[test]
    fn page_past_the_end_is_empty() {
        let log = MemoryBackend::new();
        let vault_id = VaultId::new();
        fill_log(&log, vault_id, 10);

        let exact = TransactionPage::load(&log, vault_id, 1).unwrap();
        assert_eq!(exact.entries.len(), 10);
        assert!(!exact.has_more);

        let beyond = TransactionPage::load(&log, vault_id, 4).unwrap();
        assert!(beyond.entries.is_empty());
        assert!(!beyond.has_more);
    }

    #[test]
    fn page_zero_means_page_one() {
        let log = MemoryBackend::new();
        let vault_id = VaultId::new();
        fill_log(&log, vault_id, 3);
        let page = TransactionPage::load(&log, vault_id, 0).unwrap();
        assert_eq!(page.page, 1);
        assert_eq!(page.entries.len(), 3);
    }

    #[test]
    fn append_all_keeps_the_given_order() {
        let log = MemoryBackend::new();
        let vault_id = VaultId::new();
        let actor = ActorId::new();
        fill_log(&log, vault_id, 1);

        let rows = log
            .append_all(vec![
                NewTransaction::deposit(vault_id, actor, &diamonds(5)),
                NewTransaction::withdraw(vault_id, actor, &diamonds(9)),
            ])
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, 2);
        assert_eq!(rows[1].id, 3);

        let newest = log.find_by_vault(vault_id, 10).unwrap();
        assert_eq!(newest[0].kind, TransactionKind::Withdraw);
        assert_eq!(newest[1].kind, TransactionKind::Deposit);
        assert_eq!(newest.len(), 3);
    }

    #[test]
    fn kind_display_matches_audit_format() {
        assert_eq!(TransactionKind::Deposit.to_string(), "DEPOSIT");
        assert_eq!(TransactionKind::Withdraw.to_string(), "WITHDRAW");
    }
}
