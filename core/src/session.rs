//! # View Sessions
//!
//! When several viewers open the same vault they all look at one
//! [`SharedView`]: a cached copy of the slot array, reference counted by
//! open handles. The first open loads it from the store; the last close
//! flushes and drops it.
//!
//! ## Cache Discipline
//!
//! The cache keeps two arrays per view:
//!
//! - `cache`, what viewers are shown, and
//! - `persisted`, what the store held the last time this view synced.
//!
//! Every store write made through the action translator updates both at
//! once, so in steady state they are equal and a flush has nothing to do.
//! A slot where they differ is a cached edit the store has not seen; a flush
//! writes it with `compare_and_set` from the `persisted` value. If the store
//! moved in the meantime, the store wins and the cache is corrected.
//!
//! ## Locking
//!
//! `sessions` is a `DashMap`. Open and close use its entry API so the
//! refcount only changes under the shard lock; the store read that hydrates a
//! new view happens before the entry is taken. Each view's arrays sit behind
//! a `parking_lot::RwLock`.
//!
//! Each view also carries an activity gate. Actions and flushes hold it
//! shared while they write; detaching takes it exclusively, so once a view
//! is detached nothing started through it is still writing. Vaults being
//! torn down are listed in `closing`, and no new view is handed out for
//! them.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use parking_lot::{RwLock, RwLockReadGuard};
use tracing::{debug, error, info, warn};

use crate::error::{Denial, VaultError, VaultResult};
use crate::slots::SlotStore;
use crate::types::{ActorId, Permissions, SlotContent, VaultId};

// ---------------------------------------------------------------------------
// SharedView
// ---------------------------------------------------------------------------

struct ViewState {
    cache: Vec<SlotContent>,
    persisted: Vec<SlotContent>,
}

/// One vault's cached contents, shared by all of its current viewers.
pub struct SharedView {
    vault_id: VaultId,
    state: RwLock<ViewState>,
    viewers: AtomicUsize,
    activity: RwLock<()>,
    /// Set once the view is evicted or cleared; handles that still point
    /// here must stop acting on it.
    detached: AtomicBool,
}

impl SharedView {
    fn new(vault_id: VaultId, contents: Vec<SlotContent>) -> Self {
        Self {
            vault_id,
            state: RwLock::new(ViewState {
                persisted: contents.clone(),
                cache: contents,
            }),
            viewers: AtomicUsize::new(0),
            activity: RwLock::new(()),
            detached: AtomicBool::new(false),
        }
    }

    pub fn vault_id(&self) -> VaultId {
        self.vault_id
    }

    pub fn slot_count(&self) -> usize {
        self.state.read().cache.len()
    }

    /// Cached contents of one slot, as a viewer would observe it.
    pub fn observe(&self, slot: usize) -> VaultResult<SlotContent> {
        let state = self.state.read();
        state
            .cache
            .get(slot)
            .cloned()
            .ok_or(VaultError::SlotNotFound {
                vault_id: self.vault_id,
                slot,
                slot_count: state.cache.len(),
            })
    }

    /// Cached contents of every slot.
    pub fn contents(&self) -> Vec<SlotContent> {
        self.state.read().cache.clone()
    }

    /// Handles currently attached.
    pub fn viewer_count(&self) -> usize {
        self.viewers.load(Ordering::Acquire)
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    /// Slots whose cached value the store has not seen.
    pub fn dirty_slots(&self) -> Vec<usize> {
        let state = self.state.read();
        state
            .cache
            .iter()
            .zip(&state.persisted)
            .enumerate()
            .filter(|(_, (cached, persisted))| cached != persisted)
            .map(|(slot, _)| slot)
            .collect()
    }

    /// Records a value the store has just accepted for `slot`.
    pub(crate) fn commit(&self, slot: usize, content: SlotContent) {
        let mut state = self.state.write();
        if slot < state.cache.len() {
            state.cache[slot] = content.clone();
            state.persisted[slot] = content;
        }
    }

    /// Replaces the whole cache with a fresh store read.
    pub(crate) fn replace(&self, contents: Vec<SlotContent>) {
        let mut state = self.state.write();
        state.persisted = contents.clone();
        state.cache = contents;
    }

    /// Advances the persisted marker, unless the cache moved on since the
    /// value was read for flushing.
    fn mark_persisted(&self, slot: usize, flushed: &SlotContent) {
        let mut state = self.state.write();
        if state.cache.get(slot) == Some(flushed) {
            state.persisted[slot] = flushed.clone();
        }
    }

    /// Cached edit not yet written to the store.
    #[cfg(test)]
    pub(crate) fn stage(&self, slot: usize, content: SlotContent) {
        self.state.write().cache[slot] = content;
    }

    /// Marks the start of a write through this view. The returned guard
    /// keeps the view from detaching until it is dropped.
    pub(crate) fn enter(&self) -> VaultResult<RwLockReadGuard<'_, ()>> {
        let active = self.activity.read();
        if self.is_detached() {
            return Err(VaultError::VaultNotFound(self.vault_id));
        }
        Ok(active)
    }

    /// Waits for in-flight writes, then cuts the view off.
    fn detach(&self) {
        let _quiet = self.activity.write();
        self.detached.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for SharedView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedView")
            .field("vault_id", &self.vault_id)
            .field("viewers", &self.viewer_count())
            .field("detached", &self.is_detached())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ViewHandle
// ---------------------------------------------------------------------------

/// One viewer's attachment to a shared view.
///
/// Not `Clone`: each handle accounts for exactly one reference, released by
/// [`ViewSessions::close`]. Permissions belong to the handle, so two viewers
/// of the same vault can hold different rights.
#[derive(Debug)]
pub struct ViewHandle {
    view: Arc<SharedView>,
    viewer: ActorId,
    permissions: Permissions,
}

impl ViewHandle {
    pub fn view(&self) -> &Arc<SharedView> {
        &self.view
    }

    pub fn vault_id(&self) -> VaultId {
        self.view.vault_id
    }

    pub fn viewer(&self) -> ActorId {
        self.viewer
    }

    pub fn permissions(&self) -> Permissions {
        self.permissions
    }
}

// ---------------------------------------------------------------------------
// ViewSessions
// ---------------------------------------------------------------------------

/// Registry of open shared views.
pub struct ViewSessions {
    store: Arc<dyn SlotStore>,
    sessions: DashMap<VaultId, Arc<SharedView>>,
    closing: DashSet<VaultId>,
}

impl ViewSessions {
    pub fn new(store: Arc<dyn SlotStore>) -> Self {
        Self {
            store,
            sessions: DashMap::new(),
            closing: DashSet::new(),
        }
    }

    /// Attaches a viewer, loading the vault from the store if nobody has it
    /// open yet.
    pub fn open(
        &self,
        vault_id: VaultId,
        viewer: ActorId,
        permissions: Permissions,
    ) -> VaultResult<ViewHandle> {
        if !permissions.can_view() {
            return Err(VaultError::PermissionDenied(Denial::View));
        }

        if self.closing.contains(&vault_id) {
            return Err(VaultError::VaultNotFound(vault_id));
        }

        let view = match self.join(vault_id) {
            Some(view) => view,
            None => {
                let contents = self.store.snapshot(vault_id)?;
                debug!(vault_id = %vault_id, slots = contents.len(), "loaded shared view");
                // Another viewer may have loaded it meanwhile; theirs wins.
                match self.sessions.entry(vault_id) {
                    Entry::Occupied(entry) => {
                        let view = Arc::clone(entry.get());
                        view.viewers.fetch_add(1, Ordering::AcqRel);
                        view
                    }
                    Entry::Vacant(entry) => {
                        let view = Arc::new(SharedView::new(vault_id, contents));
                        view.viewers.store(1, Ordering::Release);
                        entry.insert(Arc::clone(&view));
                        view
                    }
                }
            }
        };

        // A teardown that began while this view was loading may have missed it.
        if self.closing.contains(&vault_id) {
            if let Some((_, stale)) = self
                .sessions
                .remove_if(&vault_id, |_, current| Arc::ptr_eq(current, &view))
            {
                stale.detach();
            }
            return Err(VaultError::VaultNotFound(vault_id));
        }
        debug!(
            vault_id = %vault_id,
            viewer = %viewer,
            viewers = view.viewer_count(),
            "viewer attached"
        );

        Ok(ViewHandle {
            view,
            viewer,
            permissions,
        })
    }

    /// Joins the vault's live view, bumping its count under the entry lock so
    /// a racing close can never see zero and drop it.
    fn join(&self, vault_id: VaultId) -> Option<Arc<SharedView>> {
        match self.sessions.entry(vault_id) {
            Entry::Occupied(entry) => {
                let view = Arc::clone(entry.get());
                view.viewers.fetch_add(1, Ordering::AcqRel);
                Some(view)
            }
            Entry::Vacant(_) => None,
        }
    }

    /// The live view for a vault, if anyone has it open.
    pub fn get(&self, vault_id: VaultId) -> Option<Arc<SharedView>> {
        self.sessions
            .get(&vault_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Reloads a view from the store, discarding its cache.
    pub fn refresh_view(&self, view: &SharedView) -> VaultResult<()> {
        let contents = self.store.snapshot(view.vault_id)?;
        view.replace(contents);
        Ok(())
    }

    /// Reloads the vault's open view, if any. Returns the fresh contents.
    pub fn refresh(&self, vault_id: VaultId) -> VaultResult<Option<Vec<SlotContent>>> {
        let Some(view) = self.get(vault_id) else {
            return Ok(None);
        };
        self.refresh_view(&view)?;
        Ok(Some(view.contents()))
    }

    /// Releases a handle. When it was the last one the view is flushed and
    /// dropped; returns `true` in that case.
    ///
    /// A failed final flush keeps the idle view registered so the next
    /// [`flush_all`](Self::flush_all) retries it.
    pub fn close(&self, handle: ViewHandle) -> VaultResult<bool> {
        let ViewHandle { view, viewer, .. } = handle;
        let vault_id = view.vault_id;

        let Entry::Occupied(entry) = self.sessions.entry(vault_id) else {
            // Evicted while open (vault destroyed); nothing to persist.
            return Ok(false);
        };
        if !Arc::ptr_eq(entry.get(), &view) {
            return Ok(false);
        }

        let remaining = view.viewers.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        debug!(vault_id = %vault_id, viewer = %viewer, remaining, "viewer detached");
        if remaining > 0 {
            return Ok(false);
        }

        let persisted = self.flush_view(&view)?;
        entry.remove();
        view.detach();
        debug!(vault_id = %vault_id, persisted, "shared view closed");
        Ok(true)
    }

    /// Persists the vault's cached edits without closing anything.
    pub fn flush(&self, vault_id: VaultId) -> VaultResult<usize> {
        match self.get(vault_id) {
            Some(view) => self.flush_view(&view),
            None => Ok(0),
        }
    }

    /// Flushes every open view and drops views that are idle. Failures are
    /// logged and skipped. Returns the number of slots written.
    pub fn flush_all(&self) -> usize {
        let views: Vec<Arc<SharedView>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut written = 0;
        for view in views {
            match self.flush_view(&view) {
                Ok(count) => {
                    written += count;
                    let removed = self.sessions.remove_if(&view.vault_id, |_, current| {
                        Arc::ptr_eq(current, &view) && current.viewer_count() == 0
                    });
                    if removed.is_some() {
                        view.detach();
                    }
                }
                Err(e) => {
                    error!(vault_id = %view.vault_id, error = %e, "failed to flush shared view");
                }
            }
        }
        written
    }

    /// Flushes everything and forgets every view. Used at shutdown.
    pub fn save_all_and_clear(&self) -> usize {
        let written = self.flush_all();
        let remaining: Vec<VaultId> = self.sessions.iter().map(|entry| *entry.key()).collect();
        for vault_id in remaining {
            if let Some((_, view)) = self.sessions.remove(&vault_id) {
                view.detach();
            }
        }
        info!(written, "all shared views saved and cleared");
        written
    }

    /// Stops handing out views of the vault and evicts the current one.
    /// Returns once every action started through that view has finished.
    /// Pair with [`end_teardown`](Self::end_teardown).
    pub fn begin_teardown(&self, vault_id: VaultId) -> Option<Arc<SharedView>> {
        self.closing.insert(vault_id);
        self.evict(vault_id)
    }

    /// Lets the vault be opened again.
    pub fn end_teardown(&self, vault_id: VaultId) {
        self.closing.remove(&vault_id);
    }

    /// Drops the vault's view without flushing. Handles still pointing at
    /// it become inert.
    pub fn evict(&self, vault_id: VaultId) -> Option<Arc<SharedView>> {
        let (_, view) = self.sessions.remove(&vault_id)?;
        view.detach();
        debug!(vault_id = %vault_id, viewers = view.viewer_count(), "shared view evicted");
        Some(view)
    }

    /// Number of vaults with an open view.
    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    /// Viewers attached to the vault's view.
    pub fn viewer_count(&self, vault_id: VaultId) -> usize {
        self.get(vault_id).map_or(0, |view| view.viewer_count())
    }

    fn flush_view(&self, view: &SharedView) -> VaultResult<usize> {
        let Ok(_active) = view.enter() else {
            return Ok(0);
        };
        let dirty: Vec<(usize, SlotContent, SlotContent)> = {
            let state = view.state.read();
            state
                .cache
                .iter()
                .zip(&state.persisted)
                .enumerate()
                .filter(|(_, (cached, persisted))| cached != persisted)
                .map(|(slot, (cached, persisted))| (slot, persisted.clone(), cached.clone()))
                .collect()
        };

        let mut written = 0;
        for (slot, persisted, cached) in dirty {
            if self
                .store
                .compare_and_set(view.vault_id, slot, &persisted, &cached)?
            {
                view.mark_persisted(slot, &cached);
                written += 1;
            } else {
                let current = self.store.get(view.vault_id, slot)?;
                warn!(
                    vault_id = %view.vault_id,
                    slot,
                    "store changed under a cached edit, keeping stored value"
                );
                view.commit(slot, current);
            }
        }
        Ok(written)
    }
}

impl std::fmt::Debug for ViewSessions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewSessions")
            .field("active", &self.sessions.len())
            .finish()
    }
}
