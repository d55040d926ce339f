//! Global State Interner
//!
//! The process-wide set of canonical [`RenderState`]s, keyed by structural
//! equality. Members live in a dense table (for the garbage-collect
//! cursor) with a hash index over it (for structural lookup); each member
//! records its own table index so removal is O(1) with a swap-fill from
//! the tail.
//!
//! The interner also owns the states lock, the cycle-detect epoch and the
//! garbage-collect cursor, and constructs the canonical empty state before
//! anything else can build a state.

use std::hash::{Hash, Hasher};
use std::ptr::NonNull;

use once_cell::sync::Lazy;
use parking_lot::ReentrantMutex;
use rustc_hash::FxHashMap;

use crate::attrib;
use crate::state::config;
use crate::state::stats::CACHE_STATS;
use crate::state::{RenderState, StatePtr, StateRef};
use crate::utils::cell::{GuardedCell, StatesGuard};

// ─── Intern Table ────────────────────────────────────────────────────────────

// Structural key over a member: hashed by the state's cached content hash,
// equal when compare_to says so. Safe to dereference because every keyed
// state is alive while it is in the table.
struct TableKey {
    ptr: StatePtr,
    hash: u64,
}

impl TableKey {
    fn of(state: &RenderState) -> Self {
        Self {
            ptr: StatePtr(std::ptr::from_ref(state)),
            hash: state.get_hash(),
        }
    }
}

impl Hash for TableKey {
    fn hash<H: Hasher>(&self, hasher: &mut H) {
        self.hash.hash(hasher);
    }
}

impl PartialEq for TableKey {
    fn eq(&self, other: &Self) -> bool {
        if self.ptr == other.ptr {
            return true;
        }
        let a = unsafe { &*self.ptr.0 };
        let b = unsafe { &*other.ptr.0 };
        a.compare_to(b) == std::cmp::Ordering::Equal
    }
}

impl Eq for TableKey {}

#[derive(Default)]
struct InternTable {
    entries: Vec<StatePtr>,
    index: FxHashMap<TableKey, usize>,
}

impl InternTable {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn find(&self, state: &RenderState) -> Option<StatePtr> {
        self.index
            .get(&TableKey::of(state))
            .map(|&i| self.entries[i])
    }

    fn store(&mut self, ptr: StatePtr) -> usize {
        let index = self.entries.len();
        self.entries.push(ptr);
        let state = unsafe { &*ptr.0 };
        self.index.insert(TableKey::of(state), index);
        index
    }

    // Swap-removes the member at `index`; the tail element takes its
    // place. Returns the moved element so the caller can fix its recorded
    // index.
    fn remove_at(&mut self, index: usize, state: &RenderState) -> Option<StatePtr> {
        let removed = self.index.remove(&TableKey::of(state));
        debug_assert!(removed.is_some());
        self.entries.swap_remove(index);
        if index < self.entries.len() {
            let moved = self.entries[index];
            let moved_state = unsafe { &*moved.0 };
            if let Some(slot) = self.index.get_mut(&TableKey::of(moved_state)) {
                *slot = index;
            }
            Some(moved)
        } else {
            None
        }
    }
}

struct InternerInner {
    table: InternTable,
    cycle_epoch: u64,
    garbage_index: usize,
}

struct InternerCore {
    lock: ReentrantMutex<()>,
    inner: GuardedCell<InternerInner>,
    empty: StatePtr,
}

static CORE: Lazy<InternerCore> = Lazy::new(|| {
    attrib::kinds::register_builtins();

    let mut inner = InternerInner {
        table: InternTable::default(),
        cycle_epoch: 0,
        garbage_index: 0,
    };

    // The canonical empty state lives forever: two permanent references
    // keep any reclamation path away from it.
    let empty = Box::into_raw(RenderState::new_raw());
    unsafe {
        (*empty).ref_();
        (*empty).ref_();
        (*empty).get_hash();
        let index = inner.table.store(StatePtr(empty));
        // SAFETY: nothing else can reach this state before the Lazy
        // completes.
        (*empty).mutable.borrow_mut_unguarded().saved_entry = Some(index);
    }

    InternerCore {
        lock: ReentrantMutex::new(()),
        inner: GuardedCell::new(inner),
        empty: StatePtr(empty),
    }
});

/// Acquires the global states lock.
pub(crate) fn lock() -> StatesGuard<'static> {
    StatesGuard::new(CORE.lock.lock())
}

pub(crate) fn empty_state() -> StateRef {
    unsafe { StateRef::clone_from_ptr(CORE.empty.0) }
}

pub(crate) fn next_cycle_epoch(guard: &StatesGuard<'_>) -> u64 {
    let mut inner = CORE.inner.borrow_mut(guard);
    inner.cycle_epoch += 1;
    inner.cycle_epoch
}

// A state that bypasses the intern table: rooted to its handle, nothing
// more.
fn install_unrooted(state: Box<RenderState>) -> StateRef {
    let ptr = Box::into_raw(state);
    unsafe {
        (*ptr).ref_();
        StateRef::from_owned(NonNull::new_unchecked(ptr))
    }
}

/// Entry point for every state constructor. Skips the intern table when
/// `uniquify-states` is off (for non-empty states); otherwise defers to
/// [`return_unique`].
pub(crate) fn return_new(state: Box<RenderState>) -> StateRef {
    debug_assert!(state.validate_filled_slots());
    if !config::uniquify_states() && !state.is_empty() {
        return install_unrooted(state);
    }
    return_unique(state)
}

/// Canonicalizes a freshly built state: returns the structurally equal
/// member if one exists (discarding the new state), otherwise installs the
/// new state.
pub(crate) fn return_unique(mut state: Box<RenderState>) -> StateRef {
    if !config::state_cache() {
        return install_unrooted(state);
    }

    let guard = lock();

    // Attributes not canonicalized at construction time get canonicalized
    // here, before the state is keyed, so that pointer comparison is valid
    // on every interned state.
    if !config::uniquify_attribs() && !state.is_empty() {
        for slot in state.filled_slots().iter() {
            if let Some(entry) = &mut state.attributes[slot.index()] {
                entry.attrib = attrib::do_uniquify(entry.attrib.clone());
            }
        }
    }
    state.get_hash();

    let existing = CORE.inner.borrow(&guard).table.find(&state);
    if let Some(found) = existing {
        drop(state);
        return unsafe { StateRef::clone_from_ptr(found.0) };
    }

    let ptr = Box::into_raw(state);
    unsafe {
        (*ptr).ref_();
        if config::garbage_collect_states() {
            // The table keeps one cache reference of its own, so a member
            // with no external references sits at refcount 1 until a sweep
            // reclaims it.
            (*ptr).cache_ref();
        }
        let index = CORE.inner.borrow_mut(&guard).table.store(StatePtr(ptr));
        (*ptr).mutable.borrow_mut(&guard).saved_entry = Some(index);
        StateRef::from_owned(NonNull::new_unchecked(ptr))
    }
}

/// Removes a member from the table, if it is in it. The inverse of
/// [`return_unique`]; callers hold the states lock.
pub(crate) fn release(state: &RenderState, guard: &StatesGuard<'_>) {
    let saved = {
        let mut mutable = state.mutable.borrow_mut(guard);
        mutable.saved_entry.take()
    };
    let Some(index) = saved else { return };

    let moved = {
        let mut inner = CORE.inner.borrow_mut(guard);
        debug_assert!(std::ptr::eq(inner.table.entries[index].0, state));
        inner.table.remove_at(index, state)
    };
    if let Some(moved) = moved {
        let moved_state = unsafe { &*moved.0 };
        moved_state.mutable.borrow_mut(guard).saved_entry = Some(index);
    }
}

// ─── Queries ─────────────────────────────────────────────────────────────────

/// Number of canonical states currently interned (the empty state
/// included).
#[must_use]
pub fn num_states() -> usize {
    let guard = lock();
    let len = CORE.inner.borrow(&guard).table.len();
    len
}

/// Number of interned states whose references all live in the composition
/// cache (or the table itself, under garbage collection). Not necessarily
/// leaked: a cached composition result legitimately outlives its last
/// external reference until an operand dies.
#[must_use]
pub fn get_num_unused_states() -> usize {
    let guard = lock();
    let entries: Vec<StatePtr> = CORE.inner.borrow(&guard).table.entries.clone();
    entries
        .iter()
        .filter(|ptr| {
            let state = unsafe { &*ptr.0 };
            let cache = state.cache_ref_count();
            cache > 0 && state.ref_count() == cache
        })
        .count()
}

/// Structural sanity check over the whole table, for tests and debugging.
#[must_use]
pub fn validate_states() -> bool {
    let guard = lock();
    let entries: Vec<StatePtr> = CORE.inner.borrow(&guard).table.entries.clone();
    for (index, ptr) in entries.iter().enumerate() {
        let state = unsafe { &*ptr.0 };
        if !state.validate_filled_slots() {
            log::error!("intern table member {index} has an inconsistent slot mask");
            return false;
        }
        if state.mutable.borrow(&guard).saved_entry != Some(index) {
            log::error!("intern table member {index} records the wrong index");
            return false;
        }
        if state.cache_ref_count() > state.ref_count() {
            log::error!("intern table member {index} has cache refs exceeding total refs");
            return false;
        }
    }
    true
}

// ─── Cache-Wide Operations ───────────────────────────────────────────────────

/// Empties every state's composition caches, making every state forget
/// what it composes to. States kept alive only by cached results are
/// reclaimed (immediately without garbage collection, at the next sweep
/// with it). Returns the number of states freed immediately.
pub fn clear_cache() -> usize {
    let guard = lock();
    let orig_size = CORE.inner.borrow(&guard).table.len();

    {
        // Hold a reference to every member so nothing destructs while we
        // walk; the cascade begins when this vector drops.
        let held: Vec<StateRef> = CORE
            .inner
            .borrow(&guard)
            .table
            .entries
            .iter()
            .map(|ptr| unsafe { StateRef::clone_from_ptr(ptr.0) })
            .collect();

        for state in &held {
            let (forward, invert) = {
                let mut mutable = state.mutable.borrow_mut(&guard);
                (
                    std::mem::take(&mut mutable.composition_cache),
                    std::mem::take(&mut mutable.invert_composition_cache),
                )
            };
            let removed = forward.len() + invert.len();
            CACHE_STATS.add_total_size(-(removed as isize));
            for _ in 0..removed {
                CACHE_STATS.inc_dels();
            }
            for comp in forward.into_values().chain(invert.into_values()) {
                if let Some(result) = comp.result {
                    if result.0 != state.as_ptr() {
                        unsafe { RenderState::cache_unref_delete(result) };
                    }
                }
            }
        }
    }

    let new_size = CORE.inner.borrow(&guard).table.len();
    orig_size - new_size
}

/// Performs one garbage-collection sweep over a
/// `garbage-collect-states-rate` fraction of the table, starting at the
/// rolling cursor. Also sweeps the attribute interner. Returns the number
/// of states plus attributes freed.
///
/// Harmless (but pointless) when `garbage-collect-states` is off.
pub fn garbage_collect() -> usize {
    let num_attribs = attrib::garbage_collect();

    if !config::garbage_collect_states() {
        return num_attribs;
    }

    let guard = lock();
    let orig_size = CORE.inner.borrow(&guard).table.len();
    if orig_size == 0 {
        return num_attribs;
    }

    let rate = config::garbage_collect_states_rate();
    let mut num_this_pass = ((orig_size as f64) * rate).max(0.0) as usize;
    if num_this_pass == 0 {
        return num_attribs;
    }
    num_this_pass = num_this_pass.min(orig_size);

    let break_and_uniquify = config::auto_break_cycles() && config::uniquify_states();

    let mut size = orig_size;
    let mut si = {
        let inner = CORE.inner.borrow(&guard);
        let si = inner.garbage_index;
        if si >= size {
            0
        } else {
            si
        }
    };
    let mut stop_at = (si + num_this_pass) % size;

    loop {
        let ptr = CORE.inner.borrow(&guard).table.entries[si];
        let state = unsafe { &*ptr.0 };

        if break_and_uniquify {
            let cache = state.cache_ref_count();
            if cache > 0 && state.ref_count() == cache {
                // Only cache references remain; a cycle through this state
                // would never be reclaimed.
                state.detect_and_break_cycles(&guard);
            }
        }

        if state.unref_if_one() {
            // The only reference left was the table's own. Nobody else can
            // find the state (we hold the lock), so take it apart.
            release(state, &guard);
            state.remove_cache_pointers(&guard);
            state.cache_unref_only();
            unsafe { RenderState::destruct(ptr.0.cast_mut()) };

            // The removal swap-filled this index from the tail; revisit
            // the same index.
            size -= 1;
            if size == 0 {
                si = 0;
                break;
            }
            si = if si == 0 { size - 1 } else { si - 1 };
            if stop_at > 0 {
                stop_at -= 1;
            }
        }

        si = (si + 1) % size;
        if si == stop_at {
            break;
        }
    }

    CORE.inner.borrow_mut(&guard).garbage_index = si;

    debug_assert_eq!(CORE.inner.borrow(&guard).table.len(), size);

    orig_size - size + num_attribs
}
