// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Guild Vault — Core Library
//!
//! A vault is a fixed array of item slots shared by every member of a guild.
//! Several members can have it open at once, each clicking around in their
//! own view, and none of them may ever be able to walk away with an item that
//! somebody else already took. That is the whole problem this crate solves.
//!
//! ## Architecture
//!
//! ```text
//! types.rs      — ids, materials, item stacks, locations, permissions
//! slots.rs      — SlotStore trait: get / compare_and_set / fill / snapshot
//! ledger.rs     — TransactionLog trait: append-only deposit/withdraw audit
//! registry.rs   — VaultRegistry trait: vault metadata, one vault per owner
//! storage/      — backends: in-memory (DashMap) and sled (VaultDb)
//! session.rs    — shared, reference-counted view of an open vault
//! action.rs     — viewer manipulation → store operations + audit rows
//! formation.rs  — structure formed / destroyed → vault lifecycle
//! events.rs     — outbound snapshots, audit and conflict notices
//! service.rs    — VaultService facade wiring everything together
//! config.rs     — constants and VaultConfig
//! ```
//!
//! ## Ground Rules
//!
//! 1. The slot store is the single source of truth. Session caches are
//!    convenience copies and may be stale.
//! 2. Anything that can shrink a slot goes through `compare_and_set` against
//!    the value the viewer actually saw. Deposits are additive and skip CAS.
//! 3. A conflict cancels the action outright. Nothing is retried on the
//!    viewer's behalf.
//! 4. The store mutation lands before its audit row, and the audit row lands
//!    before anyone is told about it.

pub mod action;
pub mod config;
pub mod error;
pub mod events;
pub mod formation;
pub mod ledger;
pub mod registry;
pub mod service;
pub mod session;
pub mod slots;
pub mod storage;
pub mod types;

pub use action::{ActionKind, ActionOutcome, ActionTranslator, OperationClass, ViewerAction};
pub use config::{StackLimits, VaultConfig};
pub use error::{Denial, StoreError, VaultError, VaultResult};
pub use events::{ConflictNotice, TransactionAppended, VaultEvent, VaultSnapshot};
pub use formation::{
    CreatorIsOwner, Destruction, DestructionConfirmation, FormationEvent, FormationGateway,
    OwnerAuthority,
};
pub use ledger::{NewTransaction, Transaction, TransactionKind, TransactionLog, TransactionPage};
pub use registry::VaultRegistry;
pub use service::{VaultInfo, VaultService};
pub use session::{SharedView, ViewHandle, ViewSessions};
pub use slots::{Fill, SlotStore};
pub use storage::{MemoryBackend, VaultDb};
pub use types::{
    ActorId, ItemStack, Location, Material, Orientation, OwnerId, Permissions, SlotContent, Vault,
    VaultId,
};
