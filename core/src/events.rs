//! Outbound notifications.
//!
//! The service publishes a [`VaultEvent`] on a `tokio::sync::broadcast`
//! channel after each state change has been persisted and logged. Hosts
//! subscribe to refresh viewer screens, show "vault contents changed"
//! messages or drive dashboards. Events are serde-tagged so they can go
//! straight onto a websocket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ledger::{Transaction, TransactionKind};
use crate::types::{ActorId, ItemStack, Material, OwnerId, SlotContent, VaultId};

/// Contents of a vault at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultSnapshot {
    pub vault_id: VaultId,
    pub slots: Vec<SlotContent>,
}

impl VaultSnapshot {
    pub fn new(vault_id: VaultId, slots: Vec<SlotContent>) -> Self {
        Self { vault_id, slots }
    }

    /// Non-empty stacks, in slot order.
    pub fn items(&self) -> impl Iterator<Item = &ItemStack> {
        self.slots.iter().flatten()
    }

    pub fn used_slots(&self) -> usize {
        self.items().count()
    }

    /// Total units of `material` across all slots.
    pub fn total_of(&self, material: &Material) -> u64 {
        self.items()
            .filter(|stack| stack.material == *material)
            .map(|stack| u64::from(stack.amount))
            .sum()
    }
}

/// Audit row as published to listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionAppended {
    pub id: u64,
    pub vault_id: VaultId,
    pub actor_id: ActorId,
    pub kind: TransactionKind,
    pub material: Material,
    pub amount: u32,
    pub timestamp: DateTime<Utc>,
}

impl From<&Transaction> for TransactionAppended {
    fn from(tx: &Transaction) -> Self {
        Self {
            id: tx.id,
            vault_id: tx.vault_id,
            actor_id: tx.actor_id,
            kind: tx.kind,
            material: tx.material.clone(),
            amount: tx.amount,
            timestamp: tx.timestamp,
        }
    }
}

/// Told to a viewer whose action lost a race.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictNotice {
    pub vault_id: VaultId,
    pub slot: usize,
    pub viewer_id: ActorId,
}

impl ConflictNotice {
    /// Text shown to the viewer.
    pub fn message(&self) -> &'static str {
        "Vault contents changed, refreshing..."
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VaultEvent {
    /// A shared view was (re)loaded.
    Snapshot(VaultSnapshot),
    TransactionAppended(TransactionAppended),
    Conflict(ConflictNotice),
    Formed {
        vault_id: VaultId,
        owner: OwnerId,
    },
    Destroyed {
        vault_id: VaultId,
        owner: OwnerId,
        /// Stacks handed back to the world.
        ejected: usize,
    },
}

impl VaultEvent {
    pub fn vault_id(&self) -> VaultId {
        match self {
            VaultEvent::Snapshot(s) => s.vault_id,
            VaultEvent::TransactionAppended(t) => t.vault_id,
            VaultEvent::Conflict(c) => c.vault_id,
            VaultEvent::Formed { vault_id, .. } | VaultEvent::Destroyed { vault_id, .. } => {
                *vault_id
            }
        }
    }
}
