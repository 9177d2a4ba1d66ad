//! # Vault Service
//!
//! One object per host that owns every vault component and exposes the
//! operations a host actually calls: form, open, act, close, destroy,
//! inspect. It also publishes [`VaultEvent`]s once each change is durable.
//!
//! All methods are synchronous and may block on storage. Async hosts should
//! call them from `spawn_blocking`.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::action::{ActionOutcome, ActionTranslator, ViewerAction};
use crate::config::VaultConfig;
use crate::error::{VaultError, VaultResult};
use crate::events::{ConflictNotice, TransactionAppended, VaultEvent, VaultSnapshot};
use crate::formation::{
    Destruction, DestructionConfirmation, FormationEvent, FormationGateway, OwnerAuthority,
};
use crate::ledger::{Transaction, TransactionLog, TransactionPage};
use crate::registry::VaultRegistry;
use crate::session::{ViewHandle, ViewSessions};
use crate::slots::SlotStore;
use crate::storage::MemoryBackend;
use crate::types::{ActorId, Location, OwnerId, Permissions, Vault, VaultId};

/// Summary shown by an "info" command.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct VaultInfo {
    pub vault: Vault,
    pub used_slots: usize,
    pub total_slots: usize,
    pub active_viewers: usize,
}

pub struct VaultService {
    config: VaultConfig,
    registry: Arc<dyn VaultRegistry>,
    store: Arc<dyn SlotStore>,
    ledger: Arc<dyn TransactionLog>,
    sessions: Arc<ViewSessions>,
    translator: ActionTranslator,
    gateway: FormationGateway,
    events: broadcast::Sender<VaultEvent>,
}

impl VaultService {
    /// Wires the service to a backend implementing every storage trait.
    pub fn new<B>(
        config: VaultConfig,
        backend: Arc<B>,
        authority: Arc<dyn OwnerAuthority>,
    ) -> VaultResult<Self>
    where
        B: SlotStore + TransactionLog + VaultRegistry + 'static,
    {
        Self::from_parts(
            config,
            backend.clone(),
            backend.clone(),
            backend,
            authority,
        )
    }

    /// Wires the service to separate backends.
    pub fn from_parts(
        config: VaultConfig,
        registry: Arc<dyn VaultRegistry>,
        store: Arc<dyn SlotStore>,
        ledger: Arc<dyn TransactionLog>,
        authority: Arc<dyn OwnerAuthority>,
    ) -> VaultResult<Self> {
        config.validate()?;

        let sessions = Arc::new(ViewSessions::new(store.clone()));
        let translator = ActionTranslator::new(
            store.clone(),
            ledger.clone(),
            config.stack_limits.clone(),
        );
        let gateway = FormationGateway::new(
            registry.clone(),
            store.clone(),
            ledger.clone(),
            sessions.clone(),
            authority,
            config.slot_count,
        );
        let (events, _) = broadcast::channel(config.event_capacity);

        Ok(Self {
            config,
            registry,
            store,
            ledger,
            sessions,
            translator,
            gateway,
            events,
        })
    }

    /// A service over a fresh in-memory backend.
    pub fn in_memory(config: VaultConfig, authority: Arc<dyn OwnerAuthority>) -> VaultResult<Self> {
        Self::new(config, Arc::new(MemoryBackend::new()), authority)
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn sessions(&self) -> &ViewSessions {
        &self.sessions
    }

    /// Receives every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<VaultEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: VaultEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    // -- Lifecycle ------------------------------------------------------------

    pub fn form(&self, event: FormationEvent) -> VaultResult<Vault> {
        let vault = self.gateway.on_formation(event)?;
        self.publish(VaultEvent::Formed {
            vault_id: vault.id,
            owner: vault.owner.clone(),
        });
        Ok(vault)
    }

    pub fn destroy(&self, confirmation: DestructionConfirmation) -> VaultResult<Destruction> {
        let destruction = self.gateway.on_destruction(confirmation)?;
        self.publish_destruction(&destruction);
        Ok(destruction)
    }

    /// Destroys whatever vault stands at `location`.
    pub fn destroy_at(
        &self,
        location: &Location,
        requester: ActorId,
    ) -> VaultResult<Option<Destruction>> {
        let destruction = self.gateway.on_structure_broken(location, requester)?;
        if let Some(destruction) = &destruction {
            self.publish_destruction(destruction);
        }
        Ok(destruction)
    }

    fn publish_destruction(&self, destruction: &Destruction) {
        self.publish(VaultEvent::Destroyed {
            vault_id: destruction.vault.id,
            owner: destruction.vault.owner.clone(),
            ejected: destruction.contents.used_slots(),
        });
    }

    // -- Viewing --------------------------------------------------------------

    /// Opens the vault for a viewer with the rights the host resolved.
    pub fn open(
        &self,
        vault_id: VaultId,
        viewer: ActorId,
        permissions: Permissions,
    ) -> VaultResult<ViewHandle> {
        if self.registry.find_by_id(vault_id)?.is_none() {
            return Err(VaultError::VaultNotFound(vault_id));
        }
        let handle = self.sessions.open(vault_id, viewer, permissions)?;
        // Destroyed while the view was loading.
        if self.registry.find_by_id(vault_id)?.is_none() {
            drop(handle);
            self.sessions.evict(vault_id);
            return Err(VaultError::VaultNotFound(vault_id));
        }
        info!(
            vault_id = %vault_id,
            viewer = %viewer,
            permissions = %permissions,
            viewers = handle.view().viewer_count(),
            "vault opened"
        );
        self.publish(VaultEvent::Snapshot(VaultSnapshot::new(
            vault_id,
            handle.view().contents(),
        )));
        Ok(handle)
    }

    /// Opens the owner's vault, the usual entry point for a "vault open"
    /// command.
    pub fn open_for_owner(
        &self,
        owner: &OwnerId,
        viewer: ActorId,
        permissions: Permissions,
    ) -> VaultResult<ViewHandle> {
        let vault = self.vault_for_owner(owner)?.ok_or_else(|| {
            VaultError::InvalidAction(format!("{owner} does not have a vault"))
        })?;
        self.open(vault.id, viewer, permissions)
    }

    /// Releases a handle. Returns `true` when it was the vault's last viewer.
    pub fn close(&self, handle: ViewHandle) -> VaultResult<bool> {
        let vault_id = handle.vault_id();
        let viewer = handle.viewer();
        let last = self.sessions.close(handle)?;
        debug!(vault_id = %vault_id, viewer = %viewer, last, "vault closed");
        Ok(last)
    }

    /// Applies a viewer action and publishes what it changed.
    ///
    /// A lost race publishes a [`ConflictNotice`] for the viewer and a fresh
    /// snapshot of the reloaded view before the error is returned.
    pub fn act(&self, handle: &ViewHandle, action: &ViewerAction) -> VaultResult<ActionOutcome> {
        match self.translator.apply(handle, action) {
            Ok(outcome) => {
                for tx in &outcome.transactions {
                    self.publish(VaultEvent::TransactionAppended(TransactionAppended::from(tx)));
                }
                Ok(outcome)
            }
            Err(VaultError::Conflict { vault_id, slot }) => {
                self.publish(VaultEvent::Conflict(ConflictNotice {
                    vault_id,
                    slot,
                    viewer_id: action.viewer_id,
                }));
                self.publish(VaultEvent::Snapshot(VaultSnapshot::new(
                    vault_id,
                    handle.view().contents(),
                )));
                Err(VaultError::Conflict { vault_id, slot })
            }
            Err(e) => Err(e),
        }
    }

    // -- Inspection -----------------------------------------------------------

    /// Fresh read of the vault's contents from the store.
    pub fn snapshot(&self, vault_id: VaultId) -> VaultResult<VaultSnapshot> {
        Ok(VaultSnapshot::new(vault_id, self.store.snapshot(vault_id)?))
    }

    pub fn vault(&self, vault_id: VaultId) -> VaultResult<Vault> {
        self.registry
            .find_by_id(vault_id)?
            .ok_or(VaultError::VaultNotFound(vault_id))
    }

    pub fn vault_for_owner(&self, owner: &OwnerId) -> VaultResult<Option<Vault>> {
        self.registry.find_by_owner(owner)
    }

    pub fn vault_at(&self, location: &Location) -> VaultResult<Option<Vault>> {
        self.registry.find_by_location(location)
    }

    pub fn vault_count(&self) -> VaultResult<usize> {
        self.registry.count()
    }

    pub fn info(&self, vault_id: VaultId) -> VaultResult<VaultInfo> {
        let vault = self.vault(vault_id)?;
        let snapshot = self.snapshot(vault_id)?;
        Ok(VaultInfo {
            used_slots: snapshot.used_slots(),
            total_slots: snapshot.slots.len(),
            active_viewers: self.sessions.viewer_count(vault_id),
            vault,
        })
    }

    pub fn recent_transactions(
        &self,
        vault_id: VaultId,
        limit: usize,
    ) -> VaultResult<Vec<Transaction>> {
        self.ledger.find_by_vault(vault_id, limit)
    }

    /// Page `page` (1-based) of the vault's history.
    pub fn transactions_page(&self, vault_id: VaultId, page: usize) -> VaultResult<TransactionPage> {
        TransactionPage::load(self.ledger.as_ref(), vault_id, page)
    }

    pub fn actor_transactions(
        &self,
        actor_id: ActorId,
        limit: usize,
    ) -> VaultResult<Vec<Transaction>> {
        self.ledger.find_by_actor(actor_id, limit)
    }

    // -- Persistence ----------------------------------------------------------

    /// Periodic flush of open views. Returns slots written.
    pub fn flush_all(&self) -> usize {
        self.sessions.flush_all()
    }

    /// Flushes and forgets every open view.
    pub fn shutdown(&self) -> usize {
        let written = self.sessions.save_all_and_clear();
        info!(written, "vault service shut down");
        written
    }
}

impl std::fmt::Debug for VaultService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultService")
            .field("config", &self.config)
            .field("sessions", &self.sessions)
            .finish()
    }
}
