//! # Action Translator
//!
//! Turns a viewer's click into store operations and audit rows.
//!
//! Every manipulation a viewer can perform is an [`ActionKind`]. A kind
//! knows its [`OperationClass`], which permissions it needs, and how many
//! units it moves; the translator itself only dispatches on the class. A new
//! kind is one new variant plus its arms in the `ActionKind` methods.
//!
//! ## Operation Classes
//!
//! | Class    | Store call          | Conflicts? | Audit rows              |
//! |----------|---------------------|------------|-------------------------|
//! | Withdraw | `compare_and_set`   | yes        | one withdraw            |
//! | Deposit  | `fill` (+ spill)    | never      | one deposit             |
//! | Swap     | `compare_and_set`   | yes        | deposit, then withdraw  |
//!
//! A withdraw or swap is checked against the slot content the viewer was
//! shown. If the store disagrees, the action is cancelled, the shared view
//! is reloaded and the viewer gets [`VaultError::Conflict`]. Nothing is
//! retried.
//!
//! Deposits are additive: the store merges whatever fits into the target
//! slot atomically, so two viewers depositing into the same slot both
//! succeed. Overflow from `PlaceAll`/`MoveIn` spills into other slots
//! holding the same material, then into empty slots, in index order.
//! Whatever still does not fit is handed back as `leftover`.
//!
//! An action's audit rows are appended together. If that append fails, or a
//! spill write fails partway, the slot writes already made are undone and
//! the error is returned; the action counts as not having happened.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::config::StackLimits;
use crate::error::{Denial, VaultError, VaultResult};
use crate::ledger::{NewTransaction, Transaction, TransactionLog};
use crate::session::{SharedView, ViewHandle};
use crate::slots::{Fill, SlotStore};
use crate::types::{ActorId, ItemStack, Material, Permissions, SlotContent, VaultId};

// ---------------------------------------------------------------------------
// ActionKind
// ---------------------------------------------------------------------------

/// How a viewer manipulated a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Pick up the whole stack.
    TakeAll,
    /// Pick up half, rounding the amount taken down.
    TakeHalf,
    /// Pick up a single unit.
    TakeOne,
    /// Pick up as many as the viewer's held stack has room for.
    TakePartial,
    /// Put the whole held stack down.
    PlaceAll,
    /// Put a single unit down.
    PlaceOne,
    /// Put down as many as the slot has room for.
    PlacePartial,
    /// Shift-click out of the vault.
    MoveOut,
    /// Shift-click into the vault.
    MoveIn,
    /// Exchange the held stack with the slot.
    SwapHeld,
    /// Exchange a hotbar slot with the vault slot.
    HotbarSwap,
}

/// What an action does to the vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    Deposit,
    Withdraw,
    Swap,
}

impl ActionKind {
    pub const ALL: [ActionKind; 11] = [
        ActionKind::TakeAll,
        ActionKind::TakeHalf,
        ActionKind::TakeOne,
        ActionKind::TakePartial,
        ActionKind::PlaceAll,
        ActionKind::PlaceOne,
        ActionKind::PlacePartial,
        ActionKind::MoveOut,
        ActionKind::MoveIn,
        ActionKind::SwapHeld,
        ActionKind::HotbarSwap,
    ];

    pub fn class(self) -> OperationClass {
        match self {
            ActionKind::TakeAll
            | ActionKind::TakeHalf
            | ActionKind::TakeOne
            | ActionKind::TakePartial
            | ActionKind::MoveOut => OperationClass::Withdraw,
            ActionKind::PlaceAll
            | ActionKind::PlaceOne
            | ActionKind::PlacePartial
            | ActionKind::MoveIn => OperationClass::Deposit,
            ActionKind::SwapHeld | ActionKind::HotbarSwap => OperationClass::Swap,
        }
    }

    /// Rights the viewer must hold.
    pub fn required_permissions(self) -> Permissions {
        match self.class() {
            OperationClass::Deposit => Permissions::DEPOSIT_ONLY,
            OperationClass::Withdraw => Permissions::WITHDRAW_ONLY,
            OperationClass::Swap => Permissions::FULL,
        }
    }

    pub fn denial(self) -> Denial {
        match self.class() {
            OperationClass::Deposit => Denial::Deposit,
            OperationClass::Withdraw => Denial::Withdraw,
            OperationClass::Swap => Denial::Swap,
        }
    }

    /// Units left in the slot after a withdraw-class action, given the
    /// observed amount, what the viewer already holds and the stack limit.
    /// Other classes leave the slot as observed.
    pub fn remainder(self, observed: u32, held: u32, max_stack: u32) -> u32 {
        match self {
            ActionKind::TakeAll | ActionKind::MoveOut => 0,
            ActionKind::TakeHalf => observed - observed / 2,
            ActionKind::TakeOne => observed.saturating_sub(1),
            ActionKind::TakePartial => {
                let room = max_stack.saturating_sub(held);
                observed - observed.min(room)
            }
            _ => observed,
        }
    }

    /// Units a deposit-class action tries to put down, given what the viewer
    /// offers, what the slot held when observed and the stack limit.
    pub fn placement(self, offered: u32, observed: u32, max_stack: u32) -> u32 {
        match self {
            ActionKind::PlaceAll | ActionKind::MoveIn => offered,
            ActionKind::PlaceOne => offered.min(1),
            ActionKind::PlacePartial => offered.min(max_stack.saturating_sub(observed)),
            _ => 0,
        }
    }

    /// Whether overflow from the target slot may go to other slots.
    pub fn spills(self) -> bool {
        matches!(self, ActionKind::PlaceAll | ActionKind::MoveIn)
    }
}

// ---------------------------------------------------------------------------
// ViewerAction / ActionOutcome
// ---------------------------------------------------------------------------

/// A viewer's manipulation of one slot.
///
/// `viewer_held_*` describe what the viewer has on the cursor and are
/// supplied by the host. They are treated as claims: the held stack size is
/// never allowed above the configured limit for the material, and a max of
/// zero means "use the configured limit".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewerAction {
    pub vault_id: VaultId,
    pub slot: usize,
    pub viewer_id: ActorId,
    pub kind: ActionKind,
    #[serde(default)]
    pub viewer_held_amount: u32,
    #[serde(default)]
    pub viewer_held_max_stack: u32,
    /// The stack being put in, for deposits and swaps.
    #[serde(default)]
    pub incoming: Option<ItemStack>,
}

impl ViewerAction {
    pub fn new(vault_id: VaultId, viewer_id: ActorId, slot: usize, kind: ActionKind) -> Self {
        Self {
            vault_id,
            slot,
            viewer_id,
            kind,
            viewer_held_amount: 0,
            viewer_held_max_stack: 0,
            incoming: None,
        }
    }

    /// What the viewer already holds on the cursor.
    pub fn holding(mut self, amount: u32, max_stack: u32) -> Self {
        self.viewer_held_amount = amount;
        self.viewer_held_max_stack = max_stack;
        self
    }

    pub fn with_incoming(mut self, stack: ItemStack) -> Self {
        self.incoming = Some(stack);
        self
    }
}

/// What an applied action did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub kind: ActionKind,
    /// Units that left the vault (go to the viewer).
    pub withdrawn: Option<ItemStack>,
    /// Units that entered the vault.
    pub deposited: Option<ItemStack>,
    /// Part of the incoming stack that did not fit (stays with the viewer).
    pub leftover: Option<ItemStack>,
    /// Slots whose contents changed.
    pub changed: Vec<usize>,
    /// Audit rows appended, in order.
    pub transactions: Vec<Transaction>,
}

impl ActionOutcome {
    fn unchanged(kind: ActionKind, leftover: Option<ItemStack>) -> Self {
        Self {
            kind,
            withdrawn: None,
            deposited: None,
            leftover,
            changed: Vec::new(),
            transactions: Vec::new(),
        }
    }

    /// Whether the vault was left as it was.
    pub fn is_noop(&self) -> bool {
        self.changed.is_empty()
    }
}

/// A slot write that may need undoing if its audit row cannot be written.
#[derive(Debug, Clone)]
struct Change {
    slot: usize,
    before: SlotContent,
    after: SlotContent,
}

// ---------------------------------------------------------------------------
// ActionTranslator
// ---------------------------------------------------------------------------

/// Applies viewer actions against the store, the shared view and the log.
pub struct ActionTranslator {
    store: Arc<dyn SlotStore>,
    ledger: Arc<dyn TransactionLog>,
    limits: StackLimits,
}

impl ActionTranslator {
    pub fn new(
        store: Arc<dyn SlotStore>,
        ledger: Arc<dyn TransactionLog>,
        limits: StackLimits,
    ) -> Self {
        Self {
            store,
            ledger,
            limits,
        }
    }

    /// Applies one action on behalf of the handle's viewer.
    pub fn apply(&self, handle: &ViewHandle, action: &ViewerAction) -> VaultResult<ActionOutcome> {
        let view = handle.view();
        // Held until the audit rows are written; destruction waits on it.
        let _active = view.enter()?;
        if action.vault_id != handle.vault_id() {
            return Err(VaultError::InvalidAction(format!(
                "action targets vault {} but the viewer has {} open",
                action.vault_id,
                handle.vault_id()
            )));
        }
        if action.viewer_id != handle.viewer() {
            return Err(VaultError::InvalidAction(
                "action was submitted for a different viewer".to_string(),
            ));
        }
        if !handle.permissions().allows(action.kind.required_permissions()) {
            debug!(
                vault_id = %action.vault_id,
                viewer = %action.viewer_id,
                kind = ?action.kind,
                "action denied"
            );
            return Err(VaultError::PermissionDenied(action.kind.denial()));
        }

        let observed = view.observe(action.slot)?;
        match action.kind.class() {
            OperationClass::Withdraw => self.withdraw(view, action, observed),
            OperationClass::Deposit => self.deposit(view, action, observed),
            OperationClass::Swap => self.swap(view, action, observed),
        }
    }

    /// The stack limit in force: the configured one, lowered by the viewer's
    /// claim when that is smaller.
    pub fn effective_max(&self, material: &Material, claimed: u32) -> u32 {
        let limit = self.limits.max_for(material);
        if claimed == 0 {
            limit
        } else {
            claimed.min(limit)
        }
    }

    // -- Withdraw -------------------------------------------------------------

    fn withdraw(
        &self,
        view: &SharedView,
        action: &ViewerAction,
        observed: SlotContent,
    ) -> VaultResult<ActionOutcome> {
        let Some(stack) = observed.as_ref() else {
            return Ok(ActionOutcome::unchanged(action.kind, None));
        };

        let max = self.effective_max(&stack.material, action.viewer_held_max_stack);
        let held = action.viewer_held_amount.min(max);
        let remaining = action.kind.remainder(stack.amount, held, max);
        let after = stack.with_amount(remaining);

        if !self
            .store
            .compare_and_set(action.vault_id, action.slot, &observed, &after)?
        {
            return Err(self.conflict(view, action));
        }
        view.commit(action.slot, after.clone());

        let withdrawn = stack.with_amount(stack.amount - remaining);
        let entries = withdrawn
            .iter()
            .map(|taken| NewTransaction::withdraw(action.vault_id, action.viewer_id, taken))
            .collect();
        let change = Change {
            slot: action.slot,
            before: observed.clone(),
            after,
        };
        let transactions = self.record(view, entries, &[change])?;

        Ok(ActionOutcome {
            kind: action.kind,
            withdrawn,
            deposited: None,
            leftover: None,
            changed: vec![action.slot],
            transactions,
        })
    }

    // -- Deposit --------------------------------------------------------------

    fn deposit(
        &self,
        view: &SharedView,
        action: &ViewerAction,
        observed: SlotContent,
    ) -> VaultResult<ActionOutcome> {
        let incoming = action.incoming.as_ref().ok_or_else(|| {
            VaultError::InvalidAction(format!("{:?} needs an incoming stack", action.kind))
        })?;
        if let Some(existing) = &observed {
            if !existing.is_similar(incoming) {
                return Err(VaultError::InvalidAction(format!(
                    "slot {} holds {}, swap to replace it",
                    action.slot, existing.material
                )));
            }
        }

        let max = self.effective_max(&incoming.material, action.viewer_held_max_stack);
        let observed_amount = observed.as_ref().map_or(0, |s| s.amount);
        let wanted = action
            .kind
            .placement(incoming.amount.min(max), observed_amount, max);
        if wanted == 0 {
            return Ok(ActionOutcome::unchanged(action.kind, Some(incoming.clone())));
        }

        let mut changes = Vec::new();
        let mut placed = 0;

        let Some(portion) = incoming.with_amount(wanted) else {
            return Ok(ActionOutcome::unchanged(action.kind, Some(incoming.clone())));
        };
        let fill = self.store.fill(action.vault_id, action.slot, &portion, max)?;
        placed += self.absorb(view, action.slot, fill, &mut changes);

        if placed < wanted && action.kind.spills() {
            for target in spill_targets(&view.contents(), &incoming.material, max, action.slot) {
                let Some(portion) = incoming.with_amount(wanted - placed) else {
                    break;
                };
                match self.store.fill(action.vault_id, target, &portion, max) {
                    Ok(fill) => placed += self.absorb(view, target, fill, &mut changes),
                    Err(e) => {
                        error!(
                            vault_id = %action.vault_id,
                            slot = target,
                            error = %e,
                            "spill failed, undoing deposit"
                        );
                        self.revert(view, &changes);
                        return Err(e);
                    }
                }
            }
        }

        let deposited = incoming.with_amount(placed);
        let leftover = incoming.with_amount(incoming.amount - placed);
        let entries = deposited
            .iter()
            .map(|stack| NewTransaction::deposit(action.vault_id, action.viewer_id, stack))
            .collect();
        let transactions = self.record(view, entries, &changes)?;

        Ok(ActionOutcome {
            kind: action.kind,
            withdrawn: None,
            deposited,
            leftover,
            changed: changes.iter().map(|c| c.slot).collect(),
            transactions,
        })
    }

    /// Brings the view in line with a fill result. Returns units placed.
    fn absorb(&self, view: &SharedView, slot: usize, fill: Fill, changes: &mut Vec<Change>) -> u32 {
        view.commit(slot, fill.after.clone());
        if fill.placed == 0 {
            return 0;
        }
        let before = fill
            .after
            .as_ref()
            .and_then(|after| after.with_amount(after.amount - fill.placed));
        changes.push(Change {
            slot,
            before,
            after: fill.after,
        });
        fill.placed
    }

    // -- Swap -----------------------------------------------------------------

    fn swap(
        &self,
        view: &SharedView,
        action: &ViewerAction,
        observed: SlotContent,
    ) -> VaultResult<ActionOutcome> {
        let incoming = action.incoming.clone();
        if let Some(stack) = &incoming {
            let max = self.effective_max(&stack.material, action.viewer_held_max_stack);
            if stack.amount > max {
                return Err(VaultError::InvalidAction(format!(
                    "{stack} does not fit in one slot (max {max})"
                )));
            }
        }
        if observed == incoming {
            return Ok(ActionOutcome::unchanged(action.kind, None));
        }

        if !self
            .store
            .compare_and_set(action.vault_id, action.slot, &observed, &incoming)?
        {
            return Err(self.conflict(view, action));
        }
        view.commit(action.slot, incoming.clone());

        let mut entries = Vec::with_capacity(2);
        if let Some(stack) = &incoming {
            entries.push(NewTransaction::deposit(action.vault_id, action.viewer_id, stack));
        }
        if let Some(stack) = &observed {
            entries.push(NewTransaction::withdraw(action.vault_id, action.viewer_id, stack));
        }
        let change = Change {
            slot: action.slot,
            before: observed.clone(),
            after: incoming.clone(),
        };
        let transactions = self.record(view, entries, &[change])?;

        Ok(ActionOutcome {
            kind: action.kind,
            withdrawn: observed,
            deposited: incoming,
            leftover: None,
            changed: vec![action.slot],
            transactions,
        })
    }

    // -- Shared ---------------------------------------------------------------

    /// Reloads the view after a lost race and builds the error for it.
    fn conflict(&self, view: &SharedView, action: &ViewerAction) -> VaultError {
        warn!(
            vault_id = %action.vault_id,
            slot = action.slot,
            viewer = %action.viewer_id,
            kind = ?action.kind,
            "vault contents changed, refreshing"
        );
        match self.store.snapshot(action.vault_id) {
            Ok(fresh) => view.replace(fresh),
            Err(e) => warn!(vault_id = %action.vault_id, error = %e, "refresh after conflict failed"),
        }
        VaultError::Conflict {
            vault_id: action.vault_id,
            slot: action.slot,
        }
    }

    /// Appends the action's audit rows as one unit. If that fails the slot
    /// writes are undone where the store still holds what was written.
    fn record(
        &self,
        view: &SharedView,
        entries: Vec<NewTransaction>,
        changes: &[Change],
    ) -> VaultResult<Vec<Transaction>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let rows = entries.len();
        self.ledger.append_all(entries).map_err(|e| {
            error!(
                vault_id = %view.vault_id(),
                error = %e,
                rows,
                "audit append failed"
            );
            self.revert(view, changes);
            e
        })
    }

    fn revert(&self, view: &SharedView, changes: &[Change]) {
        for change in changes.iter().rev() {
            match self.store.compare_and_set(
                view.vault_id(),
                change.slot,
                &change.after,
                &change.before,
            ) {
                Ok(true) => view.commit(change.slot, change.before.clone()),
                Ok(false) => warn!(
                    vault_id = %view.vault_id(),
                    slot = change.slot,
                    "slot moved on before it could be reverted"
                ),
                Err(e) => error!(
                    vault_id = %view.vault_id(),
                    slot = change.slot,
                    error = %e,
                    "revert failed"
                ),
            }
        }
    }
}

impl std::fmt::Debug for ActionTranslator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionTranslator")
            .field("limits", &self.limits)
            .finish()
    }
}

/// Overflow targets for a deposit: same-material slots with room first, then
/// empty slots, each group in index order. `exclude` is the slot already
/// tried.
fn spill_targets(
    contents: &[SlotContent],
    material: &Material,
    max_stack: u32,
    exclude: usize,
) -> Vec<usize> {
    let partial = contents.iter().enumerate().filter(|(slot, content)| {
        *slot != exclude
            && matches!(content, Some(s) if s.material == *material && s.amount < max_stack)
    });
    let empty = contents
        .iter()
        .enumerate()
        .filter(|(slot, content)| *slot != exclude && content.is_none());
    partial.chain(empty).map(|(slot, _)| slot).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::ledger::TransactionKind;
    use crate::session::ViewSessions;
    use crate::storage::MemoryBackend;

    // -- Helpers ------------------------------------------------------------

    struct Fixture {
        backend: Arc<MemoryBackend>,
        sessions: ViewSessions,
        translator: ActionTranslator,
        vault_id: VaultId,
    }

    fn setup() -> Fixture {
        let backend = Arc::new(MemoryBackend::new());
        let vault_id = VaultId::new();
        backend.create(vault_id, 9).unwrap();
        Fixture {
            sessions: ViewSessions::new(backend.clone()),
            translator: ActionTranslator::new(
                backend.clone(),
                backend.clone(),
                StackLimits::default(),
            ),
            backend,
            vault_id,
        }
    }

    fn stack(name: &str, amount: u32) -> ItemStack {
        ItemStack::new(Material::new(name).unwrap(), amount).unwrap()
    }

    impl Fixture {
        fn seed(&self, slot: usize, content: ItemStack) {
            assert!(self
                .backend
                .compare_and_set(self.vault_id, slot, &None, &Some(content))
                .unwrap());
        }

        fn open(&self, permissions: Permissions) -> ViewHandle {
            self.sessions
                .open(self.vault_id, ActorId::new(), permissions)
                .unwrap()
        }

        fn action(&self, handle: &ViewHandle, slot: usize, kind: ActionKind) -> ViewerAction {
            ViewerAction::new(self.vault_id, handle.viewer(), slot, kind)
        }

        fn slot(&self, slot: usize) -> SlotContent {
            self.backend.get(self.vault_id, slot).unwrap()
        }

        fn history(&self) -> Vec<Transaction> {
            self.backend.find_by_vault(self.vault_id, 100).unwrap()
        }
    }

    // -- Kind table ---------------------------------------------------------

    #[test]
    fn every_kind_has_a_class() {
        let withdraws = ActionKind::ALL
            .iter()
            .filter(|k| k.class() == OperationClass::Withdraw)
            .count();
        let deposits = ActionKind::ALL
            .iter()
            .filter(|k| k.class() == OperationClass::Deposit)
            .count();
        let swaps = ActionKind::ALL
            .iter()
            .filter(|k| k.class() == OperationClass::Swap)
            .count();
        assert_eq!((withdraws, deposits, swaps), (5, 4, 2));
    }

    #[test]
    fn take_half_leaves_the_larger_half() {
        assert_eq!(ActionKind::TakeHalf.remainder(7, 0, 64), 4);
        assert_eq!(ActionKind::TakeHalf.remainder(8, 0, 64), 4);
        assert_eq!(ActionKind::TakeHalf.remainder(1, 0, 64), 1);
    }

    #[test]
    fn take_partial_respects_held_room() {
        assert_eq!(ActionKind::TakePartial.remainder(10, 60, 64), 6);
        assert_eq!(ActionKind::TakePartial.remainder(3, 10, 64), 0);
        assert_eq!(ActionKind::TakePartial.remainder(5, 64, 64), 5);
    }

    #[test]
    fn placement_amounts() {
        assert_eq!(ActionKind::PlaceAll.placement(20, 60, 64), 20);
        assert_eq!(ActionKind::PlaceOne.placement(20, 0, 64), 1);
        assert_eq!(ActionKind::PlacePartial.placement(20, 60, 64), 4);
        assert_eq!(ActionKind::TakeAll.placement(20, 0, 64), 0);
    }

    #[test]
    fn spill_prefers_partial_stacks_then_empty() {
        let iron = Material::new("IRON_INGOT").unwrap();
        let contents = vec![
            None,
            Some(stack("IRON_INGOT", 64)),
            Some(stack("GOLD_INGOT", 1)),
            Some(stack("IRON_INGOT", 10)),
            None,
        ];
        assert_eq!(spill_targets(&contents, &iron, 64, 0), vec![3, 4]);
        assert_eq!(spill_targets(&contents, &iron, 64, 3), vec![0, 4]);
    }

    // -- Withdraw -----------------------------------------------------------

    #[test]
    fn take_all_empties_slot_and_logs() {
        let fx = setup();
        fx.seed(0, stack("DIAMOND", 12));
        let handle = fx.open(Permissions::FULL);

        let outcome = fx
            .translator
            .apply(&handle, &fx.action(&handle, 0, ActionKind::TakeAll))
            .unwrap();

        assert_eq!(outcome.withdrawn, Some(stack("DIAMOND", 12)));
        assert_eq!(fx.slot(0), None);
        assert_eq!(handle.view().observe(0).unwrap(), None);
        let history = fx.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, TransactionKind::Withdraw);
        assert_eq!(history[0].amount, 12);
        assert_eq!(history[0].actor_id, handle.viewer());
    }

    #[test]
    fn take_half_of_seven_takes_three() {
        let fx = setup();
        fx.seed(1, stack("DIAMOND", 7));
        let handle = fx.open(Permissions::WITHDRAW_ONLY);

        let outcome = fx
            .translator
            .apply(&handle, &fx.action(&handle, 1, ActionKind::TakeHalf))
            .unwrap();

        assert_eq!(outcome.withdrawn, Some(stack("DIAMOND", 3)));
        assert_eq!(fx.slot(1), Some(stack("DIAMOND", 4)));
        assert_eq!(fx.history()[0].amount, 3);
    }

    #[test]
    fn take_half_of_one_logs_nothing() {
        let fx = setup();
        fx.seed(1, stack("DIAMOND", 1));
        let handle = fx.open(Permissions::FULL);
        let outcome = fx
            .translator
            .apply(&handle, &fx.action(&handle, 1, ActionKind::TakeHalf))
            .unwrap();
        assert_eq!(outcome.withdrawn, None);
        assert!(outcome.transactions.is_empty());
        assert_eq!(fx.slot(1), Some(stack("DIAMOND", 1)));
    }

    #[test]
    fn take_partial_uses_claimed_cursor_room() {
        let fx = setup();
        fx.seed(2, stack("COBBLESTONE", 40));
        let handle = fx.open(Permissions::FULL);
        let action = fx.action(&handle, 2, ActionKind::TakePartial).holding(50, 64);

        let outcome = fx.translator.apply(&handle, &action).unwrap();
        assert_eq!(outcome.withdrawn, Some(stack("COBBLESTONE", 14)));
        assert_eq!(fx.slot(2), Some(stack("COBBLESTONE", 26)));
    }

    #[test]
    fn inflated_max_stack_claim_is_capped() {
        let fx = setup();
        fx.seed(2, stack("ENDER_PEARL", 16));
        let handle = fx.open(Permissions::FULL);
        // Claims a 64 limit for a 16-stack item while holding 10.
        let action = fx.action(&handle, 2, ActionKind::TakePartial).holding(10, 64);

        let outcome = fx.translator.apply(&handle, &action).unwrap();
        assert_eq!(outcome.withdrawn, Some(stack("ENDER_PEARL", 6)));
        assert_eq!(fx.slot(2), Some(stack("ENDER_PEARL", 10)));
    }

    #[test]
    fn withdraw_from_empty_slot_is_a_noop() {
        let fx = setup();
        let handle = fx.open(Permissions::FULL);
        let outcome = fx
            .translator
            .apply(&handle, &fx.action(&handle, 0, ActionKind::TakeAll))
            .unwrap();
        assert!(outcome.is_noop());
        assert!(fx.history().is_empty());
    }

    #[test]
    fn stale_withdraw_conflicts_and_refreshes() {
        let fx = setup();
        fx.seed(0, stack("DIAMOND", 10));
        let handle = fx.open(Permissions::FULL);

        // Someone else drains the slot behind the view's back.
        fx.backend
            .compare_and_set(fx.vault_id, 0, &Some(stack("DIAMOND", 10)), &None)
            .unwrap();

        let result = fx
            .translator
            .apply(&handle, &fx.action(&handle, 0, ActionKind::TakeAll));
        assert!(matches!(result, Err(VaultError::Conflict { slot: 0, .. })));
        assert_eq!(handle.view().observe(0).unwrap(), None);
        assert!(fx.history().is_empty());
    }

    #[test]
    fn withdraw_without_permission_is_denied() {
        let fx = setup();
        fx.seed(0, stack("DIAMOND", 10));
        let handle = fx.open(Permissions::DEPOSIT_ONLY);

        let result = fx
            .translator
            .apply(&handle, &fx.action(&handle, 0, ActionKind::MoveOut));
        assert!(matches!(
            result,
            Err(VaultError::PermissionDenied(Denial::Withdraw))
        ));
        assert_eq!(fx.slot(0), Some(stack("DIAMOND", 10)));
        assert!(fx.history().is_empty());
    }

    // -- Deposit ------------------------------------------------------------

    #[test]
    fn place_all_into_empty_slot() {
        let fx = setup();
        let handle = fx.open(Permissions::DEPOSIT_ONLY);
        let action = fx
            .action(&handle, 4, ActionKind::PlaceAll)
            .with_incoming(stack("OAK_LOG", 32));

        let outcome = fx.translator.apply(&handle, &action).unwrap();
        assert_eq!(outcome.deposited, Some(stack("OAK_LOG", 32)));
        assert_eq!(outcome.leftover, None);
        assert_eq!(fx.slot(4), Some(stack("OAK_LOG", 32)));
        assert_eq!(fx.history()[0].kind, TransactionKind::Deposit);
    }

    #[test]
    fn place_all_spills_partial_then_empty() {
        let fx = setup();
        fx.seed(0, stack("IRON_INGOT", 60));
        fx.seed(1, stack("GOLD_INGOT", 5));
        fx.seed(5, stack("IRON_INGOT", 62));
        let handle = fx.open(Permissions::FULL);
        let action = fx
            .action(&handle, 0, ActionKind::PlaceAll)
            .with_incoming(stack("IRON_INGOT", 20));

        let outcome = fx.translator.apply(&handle, &action).unwrap();
        assert_eq!(outcome.deposited, Some(stack("IRON_INGOT", 20)));
        assert_eq!(outcome.changed, vec![0, 5, 2]);
        assert_eq!(fx.slot(0), Some(stack("IRON_INGOT", 64)));
        assert_eq!(fx.slot(5), Some(stack("IRON_INGOT", 64)));
        assert_eq!(fx.slot(2), Some(stack("IRON_INGOT", 14)));
        let history = fx.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].amount, 20);
    }

    #[test]
    fn place_one_returns_the_rest() {
        let fx = setup();
        let handle = fx.open(Permissions::FULL);
        let action = fx
            .action(&handle, 3, ActionKind::PlaceOne)
            .with_incoming(stack("TORCH", 10));

        let outcome = fx.translator.apply(&handle, &action).unwrap();
        assert_eq!(outcome.deposited, Some(stack("TORCH", 1)));
        assert_eq!(outcome.leftover, Some(stack("TORCH", 9)));
        assert_eq!(fx.slot(3), Some(stack("TORCH", 1)));
    }

    #[test]
    fn place_partial_into_full_slot_places_nothing() {
        let fx = setup();
        fx.seed(3, stack("TORCH", 64));
        let handle = fx.open(Permissions::FULL);
        let action = fx
            .action(&handle, 3, ActionKind::PlacePartial)
            .with_incoming(stack("TORCH", 10));

        let outcome = fx.translator.apply(&handle, &action).unwrap();
        assert!(outcome.is_noop());
        assert_eq!(outcome.leftover, Some(stack("TORCH", 10)));
        assert!(fx.history().is_empty());
    }

    #[test]
    fn deposit_onto_other_material_is_invalid() {
        let fx = setup();
        fx.seed(0, stack("STONE", 1));
        let handle = fx.open(Permissions::FULL);
        let action = fx
            .action(&handle, 0, ActionKind::PlaceAll)
            .with_incoming(stack("DIRT", 1));
        assert!(matches!(
            fx.translator.apply(&handle, &action),
            Err(VaultError::InvalidAction(_))
        ));
    }

    #[test]
    fn deposit_without_incoming_is_invalid() {
        let fx = setup();
        let handle = fx.open(Permissions::FULL);
        let action = fx.action(&handle, 0, ActionKind::MoveIn);
        assert!(matches!(
            fx.translator.apply(&handle, &action),
            Err(VaultError::InvalidAction(_))
        ));
    }

    #[test]
    fn stale_deposit_still_lands() {
        let fx = setup();
        let handle = fx.open(Permissions::FULL);
        // Slot filled elsewhere after the view loaded.
        fx.seed(0, stack("SAND", 10));

        let action = fx
            .action(&handle, 0, ActionKind::PlaceAll)
            .with_incoming(stack("SAND", 5));
        let outcome = fx.translator.apply(&handle, &action).unwrap();
        assert_eq!(outcome.deposited, Some(stack("SAND", 5)));
        assert_eq!(fx.slot(0), Some(stack("SAND", 15)));
        assert_eq!(handle.view().observe(0).unwrap(), Some(stack("SAND", 15)));
    }

    #[test]
    fn full_vault_hands_everything_back() {
        let fx = setup();
        for slot in 0..9 {
            fx.seed(slot, stack("DIRT", 64));
        }
        let handle = fx.open(Permissions::FULL);
        let action = fx
            .action(&handle, 0, ActionKind::MoveIn)
            .with_incoming(stack("DIRT", 30));

        let outcome = fx.translator.apply(&handle, &action).unwrap();
        assert!(outcome.is_noop());
        assert_eq!(outcome.leftover, Some(stack("DIRT", 30)));
    }

    #[test]
    fn deposit_without_permission_is_denied() {
        let fx = setup();
        let handle = fx.open(Permissions::WITHDRAW_ONLY);
        let action = fx
            .action(&handle, 0, ActionKind::PlaceAll)
            .with_incoming(stack("DIRT", 1));
        assert!(matches!(
            fx.translator.apply(&handle, &action),
            Err(VaultError::PermissionDenied(Denial::Deposit))
        ));
        assert_eq!(fx.slot(0), None);
    }

    // -- Swap ---------------------------------------------------------------

    #[test]
    fn swap_logs_deposit_then_withdraw() {
        let fx = setup();
        fx.seed(6, stack("EMERALD", 3));
        let handle = fx.open(Permissions::FULL);
        let action = fx
            .action(&handle, 6, ActionKind::HotbarSwap)
            .with_incoming(stack("GOLD_INGOT", 8));

        let outcome = fx.translator.apply(&handle, &action).unwrap();
        assert_eq!(outcome.withdrawn, Some(stack("EMERALD", 3)));
        assert_eq!(outcome.deposited, Some(stack("GOLD_INGOT", 8)));
        assert_eq!(fx.slot(6), Some(stack("GOLD_INGOT", 8)));

        let kinds: Vec<_> = outcome.transactions.iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![TransactionKind::Deposit, TransactionKind::Withdraw]);
        assert!(outcome.transactions[0].id < outcome.transactions[1].id);
    }

    #[test]
    fn swap_into_empty_slot_is_a_pure_deposit() {
        let fx = setup();
        let handle = fx.open(Permissions::FULL);
        let action = fx
            .action(&handle, 6, ActionKind::SwapHeld)
            .with_incoming(stack("GOLD_INGOT", 8));
        let outcome = fx.translator.apply(&handle, &action).unwrap();
        assert_eq!(outcome.transactions.len(), 1);
        assert_eq!(outcome.transactions[0].kind, TransactionKind::Deposit);
    }

    #[test]
    fn swap_needs_both_permissions() {
        let fx = setup();
        fx.seed(6, stack("EMERALD", 3));
        for permissions in [Permissions::DEPOSIT_ONLY, Permissions::WITHDRAW_ONLY] {
            let handle = fx.open(permissions);
            let action = fx
                .action(&handle, 6, ActionKind::SwapHeld)
                .with_incoming(stack("GOLD_INGOT", 1));
            assert!(matches!(
                fx.translator.apply(&handle, &action),
                Err(VaultError::PermissionDenied(Denial::Swap))
            ));
        }
        assert_eq!(fx.slot(6), Some(stack("EMERALD", 3)));
    }

    #[test]
    fn oversized_swap_is_rejected() {
        let fx = setup();
        let handle = fx.open(Permissions::FULL);
        let action = fx
            .action(&handle, 0, ActionKind::SwapHeld)
            .with_incoming(stack("ENDER_PEARL", 20));
        assert!(matches!(
            fx.translator.apply(&handle, &action),
            Err(VaultError::InvalidAction(_))
        ));
    }

    #[test]
    fn stale_swap_conflicts() {
        let fx = setup();
        fx.seed(6, stack("EMERALD", 3));
        let handle = fx.open(Permissions::FULL);
        fx.backend
            .compare_and_set(
                fx.vault_id,
                6,
                &Some(stack("EMERALD", 3)),
                &Some(stack("EMERALD", 2)),
            )
            .unwrap();

        let action = fx
            .action(&handle, 6, ActionKind::SwapHeld)
            .with_incoming(stack("GOLD_INGOT", 1));
        assert!(fx.translator.apply(&handle, &action).unwrap_err().is_conflict());
        assert_eq!(fx.slot(6), Some(stack("EMERALD", 2)));
        assert_eq!(handle.view().observe(6).unwrap(), Some(stack("EMERALD", 2)));
    }

    // -- Validation ---------------------------------------------------------

    #[test]
    fn out_of_range_slot_is_reported() {
        let fx = setup();
        let handle = fx.open(Permissions::FULL);
        assert!(matches!(
            fx.translator
                .apply(&handle, &fx.action(&handle, 9, ActionKind::TakeAll)),
            Err(VaultError::SlotNotFound { slot: 9, .. })
        ));
    }

    #[test]
    fn action_for_another_viewer_is_rejected() {
        let fx = setup();
        let handle = fx.open(Permissions::FULL);
        let action = ViewerAction::new(fx.vault_id, ActorId::new(), 0, ActionKind::TakeAll);
        assert!(matches!(
            fx.translator.apply(&handle, &action),
            Err(VaultError::InvalidAction(_))
        ));
    }

    #[test]
    fn detached_view_reports_vault_gone() {
        let fx = setup();
        let handle = fx.open(Permissions::FULL);
        fx.sessions.evict(fx.vault_id);
        assert!(matches!(
            fx.translator
                .apply(&handle, &fx.action(&handle, 0, ActionKind::TakeAll)),
            Err(VaultError::VaultNotFound(_))
        ));
    }

    // -- Storage failures ---------------------------------------------------

    /// Store whose `fill` fails for one slot.
    struct FailingFill {
        inner: Arc<MemoryBackend>,
        broken: usize,
    }

    impl SlotStore for FailingFill {
        fn create(&self, vault_id: VaultId, slot_count: usize) -> VaultResult<()> {
            self.inner.create(vault_id, slot_count)
        }

        fn slot_count(&self, vault_id: VaultId) -> VaultResult<usize> {
            self.inner.slot_count(vault_id)
        }

        fn get(&self, vault_id: VaultId, slot: usize) -> VaultResult<SlotContent> {
            self.inner.get(vault_id, slot)
        }

        fn compare_and_set(
            &self,
            vault_id: VaultId,
            slot: usize,
            expected: &SlotContent,
            new: &SlotContent,
        ) -> VaultResult<bool> {
            self.inner.compare_and_set(vault_id, slot, expected, new)
        }

        fn fill(
            &self,
            vault_id: VaultId,
            slot: usize,
            stack: &ItemStack,
            max_stack: u32,
        ) -> VaultResult<Fill> {
            if slot == self.broken {
                return Err(StoreError::Corrupt("slot row unreadable".into()).into());
            }
            self.inner.fill(vault_id, slot, stack, max_stack)
        }

        fn snapshot(&self, vault_id: VaultId) -> VaultResult<Vec<SlotContent>> {
            self.inner.snapshot(vault_id)
        }

        fn purge(&self, vault_id: VaultId) -> VaultResult<()> {
            self.inner.purge(vault_id)
        }
    }

    /// Log that cannot store more than one row at a time.
    struct SingleRowLedger {
        inner: Arc<MemoryBackend>,
    }

    impl TransactionLog for SingleRowLedger {
        fn append(&self, entry: NewTransaction) -> VaultResult<Transaction> {
            self.inner.append(entry)
        }

        fn append_all(&self, entries: Vec<NewTransaction>) -> VaultResult<Vec<Transaction>> {
            if entries.len() > 1 {
                return Err(StoreError::Corrupt("batch rejected".into()).into());
            }
            self.inner.append_all(entries)
        }

        fn find_by_vault(&self, vault_id: VaultId, limit: usize) -> VaultResult<Vec<Transaction>> {
            self.inner.find_by_vault(vault_id, limit)
        }

        fn find_by_actor(&self, actor_id: ActorId, limit: usize) -> VaultResult<Vec<Transaction>> {
            self.inner.find_by_actor(actor_id, limit)
        }

        fn delete_by_vault(&self, vault_id: VaultId) -> VaultResult<usize> {
            self.inner.delete_by_vault(vault_id)
        }
    }

    #[test]
    fn failed_spill_undoes_the_whole_deposit() {
        let backend = Arc::new(MemoryBackend::new());
        let vault_id = VaultId::new();
        backend.create(vault_id, 9).unwrap();
        backend
            .compare_and_set(vault_id, 0, &None, &Some(stack("DIRT", 30)))
            .unwrap();
        let store = Arc::new(FailingFill {
            inner: backend.clone(),
            broken: 1,
        });
        let sessions = ViewSessions::new(store.clone());
        let translator = ActionTranslator::new(store, backend.clone(), StackLimits::default());

        let handle = sessions
            .open(vault_id, ActorId::new(), Permissions::FULL)
            .unwrap();
        let action = ViewerAction::new(vault_id, handle.viewer(), 0, ActionKind::MoveIn)
            .with_incoming(stack("DIRT", 64));

        let result = translator.apply(&handle, &action);
        assert!(matches!(result, Err(VaultError::Storage(_))));
        assert_eq!(backend.get(vault_id, 0).unwrap(), Some(stack("DIRT", 30)));
        assert_eq!(handle.view().observe(0).unwrap(), Some(stack("DIRT", 30)));
        assert!(backend.find_by_vault(vault_id, 10).unwrap().is_empty());
    }

    #[test]
    fn failed_swap_audit_restores_the_slot() {
        let backend = Arc::new(MemoryBackend::new());
        let vault_id = VaultId::new();
        backend.create(vault_id, 9).unwrap();
        backend
            .compare_and_set(vault_id, 2, &None, &Some(stack("DIAMOND", 10)))
            .unwrap();
        let ledger = Arc::new(SingleRowLedger {
            inner: backend.clone(),
        });
        let sessions = ViewSessions::new(backend.clone());
        let translator = ActionTranslator::new(backend.clone(), ledger, StackLimits::default());

        let handle = sessions
            .open(vault_id, ActorId::new(), Permissions::FULL)
            .unwrap();
        let action = ViewerAction::new(vault_id, handle.viewer(), 2, ActionKind::SwapHeld)
            .with_incoming(stack("GOLD_INGOT", 5));

        let result = translator.apply(&handle, &action);
        assert!(matches!(result, Err(VaultError::Storage(_))));
        assert_eq!(backend.get(vault_id, 2).unwrap(), Some(stack("DIAMOND", 10)));
        assert_eq!(handle.view().observe(2).unwrap(), Some(stack("DIAMOND", 10)));
        assert!(backend.find_by_vault(vault_id, 10).unwrap().is_empty());

        // A single-row swap still goes through.
        let into_empty = ViewerAction::new(vault_id, handle.viewer(), 3, ActionKind::SwapHeld)
            .with_incoming(stack("GOLD_INGOT", 5));
        let outcome = translator.apply(&handle, &into_empty).unwrap();
        assert_eq!(outcome.transactions.len(), 1);
    }
}
