//! # Slot Store
//!
//! The authoritative, persistent contents of every vault. Each slot is an
//! independent cell; the store only promises linearizability per slot, never
//! across slots.
//!
//! Two write paths exist:
//!
//! - [`SlotStore::compare_and_set`] replaces a slot only if it still holds
//!   exactly what the caller observed. Every withdraw and swap uses it.
//! - [`SlotStore::fill`] merges a stack into a slot atomically, up to a
//!   maximum stack size. Deposits use it; concurrent deposits into the same
//!   slot never lose units and never conflict.

use crate::error::{VaultError, VaultResult};
use crate::types::{ItemStack, SlotContent, VaultId};

/// Result of an atomic fill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fill {
    /// Units actually merged into the slot.
    pub placed: u32,
    /// Slot contents after the merge.
    pub after: SlotContent,
}

/// Persistent per-slot storage.
///
/// Implementations must make `compare_and_set` and `fill` atomic for a single
/// `(vault_id, slot)` pair. Nothing is promised about reads spanning slots.
pub trait SlotStore: Send + Sync {
    /// Allocates `slot_count` empty slots for a new vault.
    fn create(&self, vault_id: VaultId, slot_count: usize) -> VaultResult<()>;

    /// Number of slots allocated for the vault.
    fn slot_count(&self, vault_id: VaultId) -> VaultResult<usize>;

    /// Current contents of one slot.
    fn get(&self, vault_id: VaultId, slot: usize) -> VaultResult<SlotContent>;

    /// Atomically replaces `expected` with `new`. Returns `false` (and leaves
    /// the slot alone) if the slot no longer equals `expected`.
    fn compare_and_set(
        &self,
        vault_id: VaultId,
        slot: usize,
        expected: &SlotContent,
        new: &SlotContent,
    ) -> VaultResult<bool>;

    /// Atomically merges as much of `stack` as fits (same material, at most
    /// `max_stack` units total) into the slot.
    fn fill(
        &self,
        vault_id: VaultId,
        slot: usize,
        stack: &ItemStack,
        max_stack: u32,
    ) -> VaultResult<Fill>;

    /// Fresh read of every slot, in index order.
    fn snapshot(&self, vault_id: VaultId) -> VaultResult<Vec<SlotContent>>;

    /// Discards the vault's slots entirely.
    fn purge(&self, vault_id: VaultId) -> VaultResult<()>;
}

/// What merging `stack` into `current` yields, capped at `max_stack`.
///
/// Shared by every backend so they agree on the arithmetic. A slot holding a
/// different material accepts nothing.
pub fn fill_slot(current: &SlotContent, stack: &ItemStack, max_stack: u32) -> Fill {
    match current {
        None => {
            let placed = stack.amount.min(max_stack);
            Fill {
                placed,
                after: stack.with_amount(placed),
            }
        }
        Some(existing) if existing.is_similar(stack) => {
            let room = max_stack.saturating_sub(existing.amount);
            let placed = room.min(stack.amount);
            Fill {
                placed,
                after: existing.with_amount(existing.amount + placed),
            }
        }
        Some(existing) => Fill {
            placed: 0,
            after: Some(existing.clone()),
        },
    }
}

/// Range check shared by backends.
pub fn check_slot(vault_id: VaultId, slot: usize, slot_count: usize) -> VaultResult<()> {
    if slot >= slot_count {
        return Err(VaultError::SlotNotFound {
            vault_id,
            slot,
            slot_count,
        });
    }
    Ok(())
}
