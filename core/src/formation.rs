//! # Formation Gateway
//!
//! Vault lifecycle driven by the world: a structure being built creates a
//! vault, a confirmed destruction (or the structure being broken) removes it.
//!
//! Formation writes the registry row first, then allocates slots. If slot
//! allocation fails the registry row is removed again, so a half-formed
//! vault never lingers.
//!
//! Destruction runs in this order:
//!
//! 1. authorize the requester against the vault's owner,
//! 2. stop new views from opening and evict the open one (without
//!    flushing; the translator writes through, so the store already has
//!    everything), waiting for actions already under way to finish,
//! 3. read the final contents, which are returned so the host can drop them
//!    into the world,
//! 4. purge the slots, delete the audit rows, remove the registry row.
//!
//! Every step tolerates the previous attempt having got partway, so a
//! failed destruction can simply be requested again.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::{Denial, VaultError, VaultResult};
use crate::events::VaultSnapshot;
use crate::ledger::TransactionLog;
use crate::registry::VaultRegistry;
use crate::session::ViewSessions;
use crate::slots::SlotStore;
use crate::types::{ActorId, Location, Orientation, OwnerId, Vault, VaultId};

/// A vault structure was completed in the world.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormationEvent {
    /// Id the new vault will carry. Chosen by the host so it can refer to
    /// the vault before formation returns.
    pub candidate_vault_id: VaultId,
    pub owner_id: OwnerId,
    pub created_by: ActorId,
    pub location: Location,
    #[serde(default)]
    pub orientation: Orientation,
}

/// The requester has confirmed they want the vault gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestructionConfirmation {
    pub vault_id: VaultId,
    pub requester_id: ActorId,
}

/// What a destruction removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destruction {
    pub vault: Vault,
    /// Final contents, to be dropped at the vault's location.
    pub contents: VaultSnapshot,
    pub transactions_removed: usize,
}

/// Decides who may destroy a vault.
pub trait OwnerAuthority: Send + Sync {
    fn can_destroy(&self, vault: &Vault, requester: ActorId) -> bool;
}

impl<F> OwnerAuthority for F
where
    F: Fn(&Vault, ActorId) -> bool + Send + Sync,
{
    fn can_destroy(&self, vault: &Vault, requester: ActorId) -> bool {
        self(vault, requester)
    }
}

/// Only the actor that formed the vault may destroy it.
#[derive(Debug, Clone, Copy, Default)]
pub struct CreatorIsOwner;

impl OwnerAuthority for CreatorIsOwner {
    fn can_destroy(&self, vault: &Vault, requester: ActorId) -> bool {
        vault.created_by == requester
    }
}

pub struct FormationGateway {
    registry: Arc<dyn VaultRegistry>,
    store: Arc<dyn SlotStore>,
    ledger: Arc<dyn TransactionLog>,
    sessions: Arc<ViewSessions>,
    authority: Arc<dyn OwnerAuthority>,
    slot_count: usize,
}

impl FormationGateway {
    pub fn new(
        registry: Arc<dyn VaultRegistry>,
        store: Arc<dyn SlotStore>,
        ledger: Arc<dyn TransactionLog>,
        sessions: Arc<ViewSessions>,
        authority: Arc<dyn OwnerAuthority>,
        slot_count: usize,
    ) -> Self {
        Self {
            registry,
            store,
            ledger,
            sessions,
            authority,
            slot_count,
        }
    }

    /// Registers the vault and allocates its empty slots.
    pub fn on_formation(&self, event: FormationEvent) -> VaultResult<Vault> {
        if let Some(existing) = self.registry.find_by_location(&event.location)? {
            return Err(VaultError::InvalidAction(format!(
                "vault {} already stands at {}",
                existing.id, event.location
            )));
        }

        let vault = Vault {
            id: event.candidate_vault_id,
            owner: event.owner_id,
            created_by: event.created_by,
            location: event.location,
            orientation: event.orientation,
            created_at: Utc::now(),
            slot_count: self.slot_count,
        };
        self.registry.insert(&vault)?;

        if let Err(e) = self.store.create(vault.id, vault.slot_count) {
            error!(vault_id = %vault.id, error = %e, "slot allocation failed, rolling back");
            if let Err(rollback) = self.registry.remove(vault.id) {
                error!(vault_id = %vault.id, error = %rollback, "registry rollback failed");
            }
            return Err(e);
        }

        info!(
            vault_id = %vault.id,
            owner = %vault.owner,
            location = %vault.location,
            slots = vault.slot_count,
            "vault formed"
        );
        Ok(vault)
    }

    /// Destroys the vault if the requester is allowed to.
    pub fn on_destruction(&self, confirmation: DestructionConfirmation) -> VaultResult<Destruction> {
        let vault_id = confirmation.vault_id;
        let vault = self
            .registry
            .find_by_id(vault_id)?
            .ok_or(VaultError::VaultNotFound(vault_id))?;

        if !self
            .authority
            .can_destroy(&vault, confirmation.requester_id)
        {
            warn!(
                vault_id = %vault_id,
                requester = %confirmation.requester_id,
                "destruction refused"
            );
            return Err(VaultError::PermissionDenied(Denial::Destroy));
        }

        if let Some(view) = self.sessions.begin_teardown(vault_id) {
            info!(
                vault_id = %vault_id,
                viewers = view.viewer_count(),
                "closed open views for destruction"
            );
        }
        let removed = self.remove_contents(vault_id);
        self.sessions.end_teardown(vault_id);
        let (contents, transactions_removed) = removed?;

        info!(
            vault_id = %vault_id,
            owner = %vault.owner,
            ejected = contents.used_slots(),
            transactions_removed,
            "vault destroyed"
        );
        Ok(Destruction {
            vault,
            contents,
            transactions_removed,
        })
    }

    /// Reads the final contents, then deletes everything stored for the
    /// vault.
    fn remove_contents(&self, vault_id: VaultId) -> VaultResult<(VaultSnapshot, usize)> {
        let slots = match self.store.snapshot(vault_id) {
            Ok(slots) => slots,
            // Slots already purged by an earlier attempt.
            Err(VaultError::VaultNotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        let contents = VaultSnapshot::new(vault_id, slots);

        self.store.purge(vault_id)?;
        let transactions_removed = self.ledger.delete_by_vault(vault_id)?;
        self.registry.remove(vault_id)?;
        Ok((contents, transactions_removed))
    }

    /// The structure at `location` was broken. Destroys the vault standing
    /// there, if any.
    pub fn on_structure_broken(
        &self,
        location: &Location,
        requester: ActorId,
    ) -> VaultResult<Option<Destruction>> {
        let Some(vault) = self.registry.find_by_location(location)? else {
            return Ok(None);
        };
        self.on_destruction(DestructionConfirmation {
            vault_id: vault.id,
            requester_id: requester,
        })
        .map(Some)
    }
}

impl std::fmt::Debug for FormationGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormationGateway")
            .field("slot_count", &self.slot_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::NewTransaction;
    use crate::storage::MemoryBackend;
    use crate::types::{ItemStack, Material, Permissions};

    // -- Helpers ------------------------------------------------------------

    struct Fixture {
        backend: Arc<MemoryBackend>,
        sessions: Arc<ViewSessions>,
        gateway: FormationGateway,
    }

    fn setup_with(authority: Arc<dyn OwnerAuthority>) -> Fixture {
        let backend = Arc::new(MemoryBackend::new());
        let sessions = Arc::new(ViewSessions::new(backend.clone()));
        let gateway = FormationGateway::new(
            backend.clone(),
            backend.clone(),
            backend.clone(),
            sessions.clone(),
            authority,
            27,
        );
        Fixture {
            backend,
            sessions,
            gateway,
        }
    }

    fn setup() -> Fixture {
        setup_with(Arc::new(CreatorIsOwner))
    }

    fn formation(owner: &str, x: i32) -> FormationEvent {
        FormationEvent {
            candidate_vault_id: VaultId::new(),
            owner_id: OwnerId::new(owner),
            created_by: ActorId::new(),
            location: Location::new("world", x, 64, 0),
            orientation: Orientation::Clockwise180,
        }
    }

    fn diamonds(amount: u32) -> ItemStack {
        ItemStack::new(Material::new("DIAMOND").unwrap(), amount).unwrap()
    }

    // -- Formation ----------------------------------------------------------

    #[test]
    fn formation_registers_and_allocates() {
        let fx = setup();
        let event = formation("guild-a", 0);
        let vault = fx.gateway.on_formation(event.clone()).unwrap();

        assert_eq!(vault.id, event.candidate_vault_id);
        assert_eq!(vault.orientation, Orientation::Clockwise180);
        assert_eq!(fx.backend.find_by_id(vault.id).unwrap(), Some(vault.clone()));
        assert_eq!(fx.backend.snapshot(vault.id).unwrap(), vec![None; 27]);
    }

    #[test]
    fn second_vault_for_owner_is_rejected() {
        let fx = setup();
        fx.gateway.on_formation(formation("guild-a", 0)).unwrap();
        let second = formation("guild-a", 10);
        assert!(matches!(
            fx.gateway.on_formation(second.clone()),
            Err(VaultError::AlreadyExists { .. })
        ));
        assert!(matches!(
            fx.backend.snapshot(second.candidate_vault_id),
            Err(VaultError::VaultNotFound(_))
        ));
    }

    #[test]
    fn occupied_location_is_rejected() {
        let fx = setup();
        fx.gateway.on_formation(formation("guild-a", 0)).unwrap();
        assert!(matches!(
            fx.gateway.on_formation(formation("guild-b", 0)),
            Err(VaultError::InvalidAction(_))
        ));
    }

    #[test]
    fn failed_allocation_rolls_back_registry() {
        let fx = setup();
        let event = formation("guild-a", 0);
        // Slots already exist under the candidate id.
        fx.backend.create(event.candidate_vault_id, 27).unwrap();

        assert!(matches!(
            fx.gateway.on_formation(event.clone()),
            Err(VaultError::DuplicateVault(_))
        ));
        assert!(fx.backend.find_by_owner(&event.owner_id).unwrap().is_none());
        assert_eq!(fx.backend.count().unwrap(), 0);
    }

    // -- Destruction --------------------------------------------------------

    #[test]
    fn owner_destruction_returns_contents_and_wipes_everything() {
        let fx = setup();
        let event = formation("guild-a", 0);
        let vault = fx.gateway.on_formation(event.clone()).unwrap();
        fx.backend
            .compare_and_set(vault.id, 3, &None, &Some(diamonds(9)))
            .unwrap();
        fx.backend
            .append(NewTransaction::deposit(vault.id, event.created_by, &diamonds(9)))
            .unwrap();
        let handle = fx
            .sessions
            .open(vault.id, ActorId::new(), Permissions::FULL)
            .unwrap();

        let destruction = fx
            .gateway
            .on_destruction(DestructionConfirmation {
                vault_id: vault.id,
                requester_id: event.created_by,
            })
            .unwrap();

        assert_eq!(destruction.contents.slots[3], Some(diamonds(9)));
        assert_eq!(destruction.transactions_removed, 1);
        assert!(handle.view().is_detached());
        assert_eq!(fx.sessions.active_count(), 0);
        assert!(fx.backend.find_by_id(vault.id).unwrap().is_none());
        assert!(fx.backend.find_by_vault(vault.id, 10).unwrap().is_empty());
        assert!(fx.backend.snapshot(vault.id).is_err());

        // Owner may form a new vault afterwards.
        fx.gateway.on_formation(formation("guild-a", 5)).unwrap();
    }

    #[test]
    fn non_owner_cannot_destroy() {
        let fx = setup();
        let vault = fx.gateway.on_formation(formation("guild-a", 0)).unwrap();
        let result = fx.gateway.on_destruction(DestructionConfirmation {
            vault_id: vault.id,
            requester_id: ActorId::new(),
        });
        assert!(matches!(
            result,
            Err(VaultError::PermissionDenied(Denial::Destroy))
        ));
        assert!(fx.backend.find_by_id(vault.id).unwrap().is_some());
    }

    #[test]
    fn closure_authority_is_consulted() {
        let officer = ActorId::new();
        let fx = setup_with(Arc::new(move |_: &Vault, requester: ActorId| {
            requester == officer
        }));
        let vault = fx.gateway.on_formation(formation("guild-a", 0)).unwrap();

        fx.gateway
            .on_destruction(DestructionConfirmation {
                vault_id: vault.id,
                requester_id: officer,
            })
            .unwrap();
    }

    #[test]
    fn destroying_unknown_vault_is_not_found() {
        let fx = setup();
        assert!(matches!(
            fx.gateway.on_destruction(DestructionConfirmation {
                vault_id: VaultId::new(),
                requester_id: ActorId::new(),
            }),
            Err(VaultError::VaultNotFound(_))
        ));
    }

    #[test]
    fn retry_after_partial_destruction_completes() {
        let fx = setup();
        let event = formation("guild-a", 0);
        let vault = fx.gateway.on_formation(event.clone()).unwrap();
        // Slots gone, registry row still present.
        fx.backend.purge(vault.id).unwrap();

        let destruction = fx
            .gateway
            .on_destruction(DestructionConfirmation {
                vault_id: vault.id,
                requester_id: event.created_by,
            })
            .unwrap();
        assert!(destruction.contents.slots.is_empty());
        assert!(fx.backend.find_by_id(vault.id).unwrap().is_none());
    }

    #[test]
    fn broken_structure_destroys_the_vault_there() {
        let fx = setup();
        let event = formation("guild-a", 7);
        fx.gateway.on_formation(event.clone()).unwrap();

        let nothing = fx
            .gateway
            .on_structure_broken(&Location::new("world", 99, 64, 0), event.created_by)
            .unwrap();
        assert!(nothing.is_none());

        let destruction = fx
            .gateway
            .on_structure_broken(&event.location, event.created_by)
            .unwrap()
            .unwrap();
        assert_eq!(destruction.vault.id, event.candidate_vault_id);
    }
}
