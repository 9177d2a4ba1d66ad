//! # Storage Backends
//!
//! Each backend implements all three persistence traits
//! ([`SlotStore`](crate::slots::SlotStore),
//! [`TransactionLog`](crate::ledger::TransactionLog) and
//! [`VaultRegistry`](crate::registry::VaultRegistry)) so a service can be
//! wired to one object.
//!
//! ```text
//! memory.rs — DashMap + per-slot mutex; tests, benches, ephemeral hosts
//! db.rs     — sled trees; what the node runs on
//! ```
//!
//! Both give the same guarantee: `compare_and_set` and `fill` are atomic per
//! slot, and transaction ids strictly increase in append order.

pub mod db;
pub mod memory;

pub use db::VaultDb;
pub use memory::MemoryBackend;
