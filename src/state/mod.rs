//! Interned Render States
//!
//! A [`RenderState`] is an immutable tuple of at most one attribute per
//! slot, each with a non-negative override priority. Every constructor
//! funnels through the global interner, so two states that compare equal
//! are guaranteed to be the *same pointer* — which is the property the
//! rest of the pipeline leans on for cheap state sorting.
//!
//! Composition results are memoized per state, in pairs: when
//! `a.compose(b)` is cached on `a`, an empty paired entry is installed on
//! `b` so either side can unlink the other in O(1) when it dies. The pair
//! discipline, the dual (total vs cache-only) reference counts, and the
//! cycle detector together keep the cache from leaking when compositions
//! loop back onto their own operands.
//!
//! Everything mutable here — the caches, the intern table, the cycle
//! epoch — is serialized under one process-wide reentrant lock; see
//! [`crate::utils::cell`].

pub mod bin;
pub mod config;
pub mod interner;
pub mod stats;

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering as MemOrdering};
use std::sync::Arc;

use log::{debug, error};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHasher};
use smallvec::SmallVec;

use crate::attrib::kinds::{CullBinAttrib, RenderModeAttrib, TexGenAttrib, TexMatrixAttrib,
    TransparencyAttrib};
use crate::attrib::registry::{self, Slot, SlotMask, MAX_SLOTS};
use crate::attrib::{Attrib, AttribRef, GeomRendering};
use crate::state::stats::CACHE_STATS;
use crate::utils::cell::{GuardedCell, StatesGuard};

// Lazily-derived flags, packed in one atomic word. Value fields are
// published with Release after being written under the narrow per-state
// lock, and read with Acquire.
const F_HASH_KNOWN: u32 = 1 << 0;
const F_CHECKED_BIN_INDEX: u32 = 1 << 1;
const F_CHECKED_CULL_CALLBACK: u32 = 1 << 2;
const F_HAS_CULL_CALLBACK: u32 = 1 << 3;
const F_DESTRUCTING: u32 = 1 << 4;

/// One filled slot: the attribute and its override priority.
#[derive(Clone)]
pub struct AttribEntry {
    pub attrib: AttribRef,
    pub priority: i32,
}

/// Address-identity key for the composition caches and intern table.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct StatePtr(pub(crate) *const RenderState);

// SAFETY: the pointee is heap-allocated, Sync, and kept alive by the
// reference-count protocol; the pointer itself is just an address used
// under the states lock.
unsafe impl Send for StatePtr {}
unsafe impl Sync for StatePtr {}

/// One composition-cache entry. `result == None` marks the paired
/// back-edge installed on the other operand; it keeps nothing alive.
pub(crate) struct Composition {
    pub(crate) result: Option<StatePtr>,
}

/// State-internal mutable data, guarded by the global states lock.
pub(crate) struct StateMut {
    pub(crate) composition_cache: FxHashMap<StatePtr, Composition>,
    pub(crate) invert_composition_cache: FxHashMap<StatePtr, Composition>,
    /// Index in the intern table, when interned.
    pub(crate) saved_entry: Option<usize>,
    /// Epoch stamp for the cycle detector.
    pub(crate) cycle_detect: u64,
}

/// An immutable, interned tuple of render attributes.
///
/// `RenderState` values are only handled through [`StateRef`]; the type
/// itself has no public constructor.
pub struct RenderState {
    attributes: [Option<AttribEntry>; MAX_SLOTS],
    filled_slots: SlotMask,

    hash: AtomicU64,
    flags: AtomicU32,
    bin_index: AtomicI32,
    draw_order: AtomicI32,

    ref_count: AtomicI32,
    cache_ref_count: AtomicI32,

    pub(crate) mutable: GuardedCell<StateMut>,
    // Narrow lock serializing writers of the lazy derived properties.
    // Never held together with the states lock.
    lazy_lock: Mutex<()>,
}

// ─── Construction ────────────────────────────────────────────────────────────

impl RenderState {
    pub(crate) fn new_raw() -> Box<RenderState> {
        CACHE_STATS.add_num_states(1);
        Box::new(RenderState {
            attributes: std::array::from_fn(|_| None),
            filled_slots: SlotMask::empty(),
            hash: AtomicU64::new(0),
            flags: AtomicU32::new(0),
            bin_index: AtomicI32::new(-1),
            draw_order: AtomicI32::new(0),
            ref_count: AtomicI32::new(0),
            cache_ref_count: AtomicI32::new(0),
            mutable: GuardedCell::new(StateMut {
                composition_cache: FxHashMap::default(),
                invert_composition_cache: FxHashMap::default(),
                saved_entry: None,
                cycle_detect: 0,
            }),
            lazy_lock: Mutex::new(()),
        })
    }

    // Copies the attribute table for a derived state; bookkeeping starts
    // fresh.
    fn copy_for_modify(&self) -> Box<RenderState> {
        let mut state = Self::new_raw();
        state.attributes = self.attributes.clone();
        state.filled_slots = self.filled_slots;
        state
    }

    /// The canonical empty state.
    #[must_use]
    pub fn make_empty() -> StateRef {
        interner::empty_state()
    }

    /// A state holding the given attributes at priority 0. Duplicate
    /// slots: last wins.
    #[must_use]
    pub fn make(attribs: &[AttribRef]) -> StateRef {
        Self::make_with_priority(attribs, 0)
    }

    /// A state holding the given attributes at one shared priority.
    #[must_use]
    pub fn make_with_priority(attribs: &[AttribRef], priority: i32) -> StateRef {
        if attribs.is_empty() {
            return Self::make_empty();
        }
        let mut state = Self::new_raw();
        for attrib in attribs {
            let slot = attrib.slot();
            state.attributes[slot.index()] = Some(AttribEntry {
                attrib: attrib.clone(),
                priority,
            });
            state.filled_slots.set(slot);
        }
        interner::return_new(state)
    }

    /// A state holding the given `(attribute, priority)` entries.
    #[must_use]
    pub fn make_entries(entries: &[(AttribRef, i32)]) -> StateRef {
        if entries.is_empty() {
            return Self::make_empty();
        }
        let mut state = Self::new_raw();
        for (attrib, priority) in entries {
            let slot = attrib.slot();
            state.attributes[slot.index()] = Some(AttribEntry {
                attrib: attrib.clone(),
                priority: *priority,
            });
            state.filled_slots.set(slot);
        }
        interner::return_new(state)
    }

    /// A state holding every registered slot's identity default.
    #[must_use]
    pub fn fill_default() -> StateRef {
        crate::attrib::kinds::register_builtins();
        let mut state = Self::new_raw();
        for index in 1..registry::num_slots() {
            let slot = Slot(index as u8);
            state.attributes[index] = Some(AttribEntry {
                attrib: registry::slot_default(slot),
                priority: 0,
            });
            state.filled_slots.set(slot);
        }
        interner::return_new(state)
    }

    /// The largest override priority the scene graph expects.
    #[must_use]
    pub fn get_max_priority() -> i32 {
        1_000_000_000
    }
}

// ─── Inspection ──────────────────────────────────────────────────────────────

impl RenderState {
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filled_slots.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn num_attribs(&self) -> usize {
        self.filled_slots.count() as usize
    }

    #[inline]
    #[must_use]
    pub fn filled_slots(&self) -> SlotMask {
        self.filled_slots
    }

    #[inline]
    #[must_use]
    pub fn has_attrib(&self, slot: Slot) -> bool {
        self.filled_slots.contains(slot)
    }

    #[must_use]
    pub fn get_attrib(&self, slot: Slot) -> Option<&AttribRef> {
        self.attributes[slot.index()].as_ref().map(|e| &e.attrib)
    }

    #[must_use]
    pub fn get_entry(&self, slot: Slot) -> Option<&AttribEntry> {
        self.attributes[slot.index()].as_ref()
    }

    /// The override priority at `slot`, or 0 when the slot is empty.
    #[must_use]
    pub fn get_priority(&self, slot: Slot) -> i32 {
        self.attributes[slot.index()]
            .as_ref()
            .map_or(0, |e| e.priority)
    }

    /// Typed accessor for a concrete attribute kind.
    #[must_use]
    pub fn get_attrib_as<T: Attrib>(&self) -> Option<&T> {
        let slot = registry::slot_of::<T>()?;
        self.attributes[slot.index()]
            .as_ref()?
            .attrib
            .as_any()
            .downcast_ref::<T>()
    }

    /// True iff the filled-slots mask agrees with the attribute table.
    #[must_use]
    pub fn validate_filled_slots(&self) -> bool {
        let mut mask = SlotMask::empty();
        for (index, entry) in self.attributes.iter().enumerate().skip(1) {
            if entry.is_some() {
                mask.set(Slot(index as u8));
            }
        }
        self.attributes[0].is_none() && mask == self.filled_slots
    }

    pub(crate) fn get_hash(&self) -> u64 {
        if self.flags.load(MemOrdering::Acquire) & F_HASH_KNOWN != 0 {
            return self.hash.load(MemOrdering::Relaxed);
        }
        let mut hasher = FxHasher::default();
        for slot in self.filled_slots.iter() {
            if let Some(entry) = &self.attributes[slot.index()] {
                (Arc::as_ptr(&entry.attrib).cast::<()>() as usize).hash(&mut hasher);
                entry.priority.hash(&mut hasher);
            }
        }
        let hash = hasher.finish();
        self.hash.store(hash, MemOrdering::Relaxed);
        self.flags.fetch_or(F_HASH_KNOWN, MemOrdering::Release);
        hash
    }
}

// ─── Ordering ────────────────────────────────────────────────────────────────

impl RenderState {
    /// Structural order over states: slot-by-slot attribute *value*
    /// comparison, then priority. This is the order that keys the intern
    /// table; outside it, pointer comparison suffices because equivalent
    /// states share one pointer.
    #[must_use]
    pub fn compare_to(&self, other: &RenderState) -> Ordering {
        let mask = self.filled_slots.union(other.filled_slots);
        for slot in mask.iter() {
            let a = &self.attributes[slot.index()];
            let b = &other.attributes[slot.index()];
            let ord = match (a, b) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(ae), Some(be)) => {
                    let value_ord = if crate::attrib::ptr_eq(&ae.attrib, &be.attrib) {
                        Ordering::Equal
                    } else {
                        ae.attrib.compare_value(&*be.attrib)
                    };
                    value_ord.then(ae.priority.cmp(&be.priority))
                }
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// Draw-performance order: iterates slots in the registry's sort-rank
    /// order and compares attributes by pointer, clustering states that
    /// share expensive attributes. Unrelated to [`RenderState::compare_to`].
    #[must_use]
    pub fn compare_sort(&self, other: &RenderState) -> Ordering {
        if std::ptr::eq(self, other) {
            return Ordering::Equal;
        }
        for slot in registry::sorted_slots() {
            let a = self.attrib_addr(slot);
            let b = other.attrib_addr(slot);
            if a != b {
                return a.cmp(&b);
            }
        }
        Ordering::Equal
    }

    /// Pointer comparison restricted to the slots in `mask`.
    #[must_use]
    pub fn compare_mask(&self, other: &RenderState, mask: SlotMask) -> Ordering {
        let mask = self.filled_slots.union(other.filled_slots).intersect(mask);
        for slot in mask.iter() {
            let a = self.attrib_addr(slot);
            let b = other.attrib_addr(slot);
            if a != b {
                return a.cmp(&b);
            }
        }
        Ordering::Equal
    }

    fn attrib_addr(&self, slot: Slot) -> usize {
        self.attributes[slot.index()]
            .as_ref()
            .map_or(0, |e| Arc::as_ptr(&e.attrib).cast::<()>() as usize)
    }
}

// ─── Derived States ──────────────────────────────────────────────────────────

impl RenderState {
    fn to_ref(&self) -> StateRef {
        self.ref_();
        StateRef {
            ptr: NonNull::from(self),
        }
    }

    /// A state with `attrib` added at `priority`. If the slot is already
    /// filled with a strictly higher priority, returns `self` unchanged.
    #[must_use]
    pub fn add_attrib(&self, attrib: &AttribRef, priority: i32) -> StateRef {
        let slot = attrib.slot();
        if let Some(existing) = &self.attributes[slot.index()] {
            if existing.priority > priority {
                return self.to_ref();
            }
        }
        let mut state = self.copy_for_modify();
        state.attributes[slot.index()] = Some(AttribEntry {
            attrib: attrib.clone(),
            priority,
        });
        state.filled_slots.set(slot);
        interner::return_new(state)
    }

    /// A state with `attrib` replaced unconditionally; any existing
    /// priority on the slot is kept.
    #[must_use]
    pub fn set_attrib(&self, attrib: &AttribRef) -> StateRef {
        let slot = attrib.slot();
        let priority = self.get_priority(slot);
        self.set_attrib_with_priority(attrib, priority)
    }

    /// A state with `attrib` and `priority` replaced unconditionally.
    #[must_use]
    pub fn set_attrib_with_priority(&self, attrib: &AttribRef, priority: i32) -> StateRef {
        let slot = attrib.slot();
        let mut state = self.copy_for_modify();
        state.attributes[slot.index()] = Some(AttribEntry {
            attrib: attrib.clone(),
            priority,
        });
        state.filled_slots.set(slot);
        interner::return_new(state)
    }

    /// A state with `slot` emptied. Removing the last filled slot yields
    /// the canonical empty state.
    #[must_use]
    pub fn remove_attrib(&self, slot: Slot) -> StateRef {
        if self.attributes[slot.index()].is_none() {
            return self.to_ref();
        }
        if self.filled_slots.count() == 1 {
            return Self::make_empty();
        }
        let mut state = self.copy_for_modify();
        state.attributes[slot.index()] = None;
        state.filled_slots.clear(slot);
        interner::return_new(state)
    }

    /// A state with every priority shifted by `delta`, floored at 0.
    #[must_use]
    pub fn adjust_all_priorities(&self, delta: i32) -> StateRef {
        let mut state = self.copy_for_modify();
        for slot in self.filled_slots.iter() {
            if let Some(entry) = &mut state.attributes[slot.index()] {
                entry.priority = (entry.priority + delta).max(0);
            }
        }
        interner::return_new(state)
    }
}

// ─── Composition ─────────────────────────────────────────────────────────────

impl RenderState {
    /// The composition of `self` with `other`: `other`'s attributes
    /// applied on top of `self`'s, per slot, honoring override priorities.
    ///
    /// The result is cached and retained as long as both operands live;
    /// when either destructs, the pair of cache entries is unlinked.
    #[must_use]
    pub fn compose(&self, other: &StateRef) -> StateRef {
        if self.is_empty() {
            return other.clone();
        }
        if other.is_empty() {
            return self.to_ref();
        }

        if !config::state_cache() {
            return self.do_compose(other);
        }

        let guard = interner::lock();
        let self_key = StatePtr(std::ptr::from_ref(self));
        let other_key = StatePtr(other.as_ptr());

        let cached = self
            .mutable
            .borrow(&guard)
            .composition_cache
            .get(&other_key)
            .map(|c| c.result);
        if let Some(result) = cached {
            if let Some(result) = result {
                CACHE_STATS.inc_hits();
                return unsafe { StateRef::clone_from_ptr(result.0) };
            }
            // The pair of a prior compose in the other direction; fill in
            // the result now.
            let result = self.do_compose(other);
            let stored = {
                let mut mutable = self.mutable.borrow_mut(&guard);
                match mutable.composition_cache.get_mut(&other_key) {
                    Some(comp) => {
                        comp.result = Some(StatePtr(result.as_ptr()));
                        true
                    }
                    None => false,
                }
            };
            if stored && result.as_ptr() != std::ptr::from_ref(self) {
                result.cache_ref();
            }
            CACHE_STATS.inc_hits();
            return result;
        }
        CACHE_STATS.inc_misses();

        let result = self.do_compose(other);

        // Record the result here, and an empty paired entry on the other
        // operand so it knows to unlink us when it destructs.
        self.mutable.borrow_mut(&guard).composition_cache.insert(
            other_key,
            Composition {
                result: Some(StatePtr(result.as_ptr())),
            },
        );
        CACHE_STATS.inc_adds();
        CACHE_STATS.add_total_size(1);

        if other_key != self_key {
            unsafe { &*other_key.0 }
                .mutable
                .borrow_mut(&guard)
                .composition_cache
                .insert(self_key, Composition { result: None });
            CACHE_STATS.inc_adds();
            CACHE_STATS.add_total_size(1);
        }

        if result.as_ptr() != std::ptr::from_ref(self) {
            // The stored result holds one cache reference. Storing self
            // does not; that would be a self-referential leak.
            result.cache_ref();
        }

        result
    }

    /// The relative transform from `self` to `other`: for each slot,
    /// `a.invert_compose(b)`, with the slot's identity default standing in
    /// for a missing right side.
    #[must_use]
    pub fn invert_compose(&self, other: &StateRef) -> StateRef {
        if self.is_empty() {
            return other.clone();
        }
        if std::ptr::from_ref(self) == other.as_ptr() {
            return Self::make_empty();
        }

        if !config::state_cache() {
            return self.do_invert_compose(other);
        }

        let guard = interner::lock();
        let self_key = StatePtr(std::ptr::from_ref(self));
        let other_key = StatePtr(other.as_ptr());

        let cached = self
            .mutable
            .borrow(&guard)
            .invert_composition_cache
            .get(&other_key)
            .map(|c| c.result);
        if let Some(result) = cached {
            if let Some(result) = result {
                CACHE_STATS.inc_hits();
                return unsafe { StateRef::clone_from_ptr(result.0) };
            }
            let result = self.do_invert_compose(other);
            let stored = {
                let mut mutable = self.mutable.borrow_mut(&guard);
                match mutable.invert_composition_cache.get_mut(&other_key) {
                    Some(comp) => {
                        comp.result = Some(StatePtr(result.as_ptr()));
                        true
                    }
                    None => false,
                }
            };
            if stored && result.as_ptr() != std::ptr::from_ref(self) {
                result.cache_ref();
            }
            CACHE_STATS.inc_hits();
            return result;
        }
        CACHE_STATS.inc_misses();

        let result = self.do_invert_compose(other);

        self.mutable
            .borrow_mut(&guard)
            .invert_composition_cache
            .insert(
                other_key,
                Composition {
                    result: Some(StatePtr(result.as_ptr())),
                },
            );
        CACHE_STATS.inc_adds();
        CACHE_STATS.add_total_size(1);

        if other_key != self_key {
            unsafe { &*other_key.0 }
                .mutable
                .borrow_mut(&guard)
                .invert_composition_cache
                .insert(self_key, Composition { result: None });
            CACHE_STATS.inc_adds();
            CACHE_STATS.add_total_size(1);
        }

        if result.as_ptr() != std::ptr::from_ref(self) {
            result.cache_ref();
        }

        result
    }

    // The actual composition, cache aside.
    fn do_compose(&self, other: &RenderState) -> StateRef {
        let mut state = Self::new_raw();
        let mask = self.filled_slots.union(other.filled_slots);
        state.filled_slots = mask;

        for slot in mask.iter() {
            let a = &self.attributes[slot.index()];
            let b = &other.attributes[slot.index()];
            let result = match (a, b) {
                (None, Some(be)) => be.clone(),
                (Some(ae), None) => ae.clone(),
                (Some(ae), Some(be)) => {
                    if be.priority < ae.priority {
                        // A, the higher entry, overrides.
                        ae.clone()
                    } else if ae.priority < be.priority && ae.attrib.lower_can_override() {
                        // B overrides outright. Normally a lower entry does
                        // not override a higher one even with a higher
                        // priority, but some kinds opt in.
                        be.clone()
                    } else {
                        // Equal priorities, or B is higher: compose the two
                        // at B's priority.
                        AttribEntry {
                            attrib: ae.attrib.compose(&be.attrib),
                            priority: be.priority,
                        }
                    }
                }
                (None, None) => {
                    debug_assert!(false, "filled_slots bit set over two empty slots");
                    continue;
                }
            };
            state.attributes[slot.index()] = Some(result);
        }

        interner::return_new(state)
    }

    fn do_invert_compose(&self, other: &RenderState) -> StateRef {
        let mut state = Self::new_raw();
        let mask = self.filled_slots.union(other.filled_slots);
        state.filled_slots = mask;

        for slot in mask.iter() {
            let a = &self.attributes[slot.index()];
            let b = &other.attributes[slot.index()];
            let result = match (a, b) {
                (None, Some(be)) => be.clone(),
                (Some(ae), None) => AttribEntry {
                    // Invert against the slot's identity default.
                    attrib: ae.attrib.invert_compose(&registry::slot_default(slot)),
                    priority: 0,
                },
                (Some(ae), Some(be)) => AttribEntry {
                    // Priorities play no part in invert composition.
                    attrib: ae.attrib.invert_compose(&be.attrib),
                    priority: 0,
                },
                (None, None) => {
                    debug_assert!(false, "filled_slots bit set over two empty slots");
                    continue;
                }
            };
            state.attributes[slot.index()] = Some(result);
        }

        interner::return_new(state)
    }
}

// ─── Derived Properties ──────────────────────────────────────────────────────

impl RenderState {
    /// The cull bin this state draws into, derived from the cull-bin
    /// attribute or, failing that, the transparency mode. Memoized.
    #[must_use]
    pub fn get_bin_index(&self) -> i32 {
        if self.flags.load(MemOrdering::Acquire) & F_CHECKED_BIN_INDEX == 0 {
            self.determine_bin_index();
        }
        self.bin_index.load(MemOrdering::Relaxed)
    }

    /// The in-bin draw order. Memoized alongside the bin index.
    #[must_use]
    pub fn get_draw_order(&self) -> i32 {
        if self.flags.load(MemOrdering::Acquire) & F_CHECKED_BIN_INDEX == 0 {
            self.determine_bin_index();
        }
        self.draw_order.load(MemOrdering::Relaxed)
    }

    /// Whether any filled slot advertises a cull callback. Memoized.
    #[must_use]
    pub fn has_cull_callback(&self) -> bool {
        let flags = self.flags.load(MemOrdering::Acquire);
        if flags & F_CHECKED_CULL_CALLBACK != 0 {
            return flags & F_HAS_CULL_CALLBACK != 0;
        }
        self.determine_cull_callback();
        self.flags.load(MemOrdering::Acquire) & F_HAS_CULL_CALLBACK != 0
    }

    /// Folds the render-mode, tex-gen and tex-matrix attributes into the
    /// geometry rendering feature bits.
    #[must_use]
    pub fn get_geom_rendering(&self, bits: GeomRendering) -> GeomRendering {
        let mut bits = bits;
        for slot in [
            RenderModeAttrib::slot(),
            TexGenAttrib::slot(),
            TexMatrixAttrib::slot(),
        ] {
            if let Some(entry) = &self.attributes[slot.index()] {
                bits = entry.attrib.geom_rendering(bits);
            }
        }
        bits
    }

    fn determine_bin_index(&self) {
        let _narrow = self.lazy_lock.lock();
        if self.flags.load(MemOrdering::Acquire) & F_CHECKED_BIN_INDEX != 0 {
            // Someone else derived it first.
            return;
        }

        let mut bin_name = String::new();
        let mut draw_order = 0;
        if let Some(bin) = self.get_attrib_as::<CullBinAttrib>() {
            bin_name = bin.bin_name.clone();
            draw_order = bin.draw_order;
        }

        if bin_name.is_empty() {
            // No explicit bin; fall back on opaque or transparent based on
            // the transparency mode.
            bin_name = "opaque".to_string();
            if let Some(transparency) = self.get_attrib_as::<TransparencyAttrib>() {
                if transparency.mode.needs_sorting() {
                    bin_name = "transparent".to_string();
                }
            }
        }

        let index = bin::find_or_create(&bin_name) as i32;
        self.bin_index.store(index, MemOrdering::Relaxed);
        self.draw_order.store(draw_order, MemOrdering::Relaxed);
        self.flags
            .fetch_or(F_CHECKED_BIN_INDEX, MemOrdering::Release);
    }

    fn determine_cull_callback(&self) {
        let _narrow = self.lazy_lock.lock();
        if self.flags.load(MemOrdering::Acquire) & F_CHECKED_CULL_CALLBACK != 0 {
            return;
        }
        let mut flags = F_CHECKED_CULL_CALLBACK;
        for slot in self.filled_slots.iter() {
            if let Some(entry) = &self.attributes[slot.index()] {
                if entry.attrib.has_cull_callback() {
                    flags |= F_HAS_CULL_CALLBACK;
                    break;
                }
            }
        }
        self.flags.fetch_or(flags, MemOrdering::Release);
    }
}

// ─── Reference Counting ──────────────────────────────────────────────────────

impl RenderState {
    /// Total reference count, cache references included.
    #[must_use]
    pub fn ref_count(&self) -> i32 {
        self.ref_count.load(MemOrdering::Acquire)
    }

    /// References held by composition caches and, under garbage
    /// collection, by the intern table. Always `<= ref_count()`.
    #[must_use]
    pub fn cache_ref_count(&self) -> i32 {
        self.cache_ref_count.load(MemOrdering::Acquire)
    }

    #[inline]
    pub(crate) fn ref_(&self) {
        self.ref_count.fetch_add(1, MemOrdering::AcqRel);
    }

    pub(crate) fn cache_ref(&self) {
        self.cache_ref_count.fetch_add(1, MemOrdering::AcqRel);
        self.ref_();
    }

    // The GC destroy path: the total count is already 0, only the cache
    // count is left to retire.
    pub(crate) fn cache_unref_only(&self) {
        self.cache_ref_count.fetch_sub(1, MemOrdering::AcqRel);
    }

    pub(crate) fn unref_if_one(&self) -> bool {
        self.ref_count
            .compare_exchange(1, 0, MemOrdering::AcqRel, MemOrdering::Acquire)
            .is_ok()
    }

    /// Drops one reference and returns the remaining count.
    ///
    /// With garbage collection on (or the cache off entirely), this is a
    /// plain atomic decrement. Otherwise the drop routes through the
    /// states lock: crossing into "only cache references remain" runs the
    /// cycle detector, and reaching zero pulls the state out of the intern
    /// table and unlinks its cache entries before anything else can find
    /// it.
    pub(crate) fn unref(&self) -> i32 {
        if config::garbage_collect_states() || !config::state_cache() {
            return self.ref_count.fetch_sub(1, MemOrdering::AcqRel) - 1;
        }

        let guard = interner::lock();

        if config::auto_break_cycles() && config::uniquify_states() {
            let cache = self.cache_ref_count();
            if cache > 0 && self.ref_count() == cache + 1 {
                // About to drop the one reference that is not in the
                // cache; a cycle through this state would now leak.
                self.detect_and_break_cycles(&guard);
            }
        }

        let remaining = self.ref_count.fetch_sub(1, MemOrdering::AcqRel) - 1;
        if remaining == 0 {
            interner::release(self, &guard);
            self.remove_cache_pointers(&guard);
        }
        remaining
    }

    pub(crate) unsafe fn destruct(ptr: *mut RenderState) {
        let state = &*ptr;
        let prior = state.flags.fetch_or(F_DESTRUCTING, MemOrdering::AcqRel);
        if prior & F_DESTRUCTING != 0 {
            debug_assert!(false, "render state destructed twice");
            error!("render state destructed twice");
            return;
        }
        debug_assert_eq!(state.ref_count(), 0);

        {
            let guard = interner::lock();
            let clean = {
                let mutable = state.mutable.borrow(&guard);
                mutable.saved_entry.is_none()
                    && mutable.composition_cache.is_empty()
                    && mutable.invert_composition_cache.is_empty()
            };
            debug_assert!(clean, "render state destructed with live cache entries");
            if !clean {
                error!("render state destructed with live cache entries");
                interner::release(state, &guard);
                state.remove_cache_pointers(&guard);
            }
        }

        drop(Box::from_raw(ptr));
    }

    // Drops one cache reference on `ptr`, destroying it if that was the
    // last reference of any kind.
    pub(crate) unsafe fn cache_unref_delete(ptr: StatePtr) {
        let state = &*ptr.0;
        state.cache_ref_count.fetch_sub(1, MemOrdering::AcqRel);
        if state.unref() == 0 {
            Self::destruct(ptr.0.cast_mut());
        }
    }
}

// ─── Cache Unlinking & Cycle Detection ───────────────────────────────────────

impl RenderState {
    /// Removes every cache pointer into and out of this state. Because
    /// entries were created in pairs, the set of states holding entries
    /// about us is exactly the set we hold entries about.
    ///
    /// Each iteration removes the map entry *before* dropping any
    /// reference, so the cascading destructors triggered by those drops
    /// see a consistent map. The paired entry may already be gone when the
    /// other state is itself mid-destruction; that is fine.
    pub(crate) fn remove_cache_pointers(&self, guard: &StatesGuard<'_>) {
        let self_key = StatePtr(std::ptr::from_ref(self));

        loop {
            let taken = {
                let mut mutable = self.mutable.borrow_mut(guard);
                let key = mutable.composition_cache.keys().next().copied();
                key.map(|k| (k, mutable.composition_cache.remove(&k).unwrap()))
            };
            let Some((other_key, comp)) = taken else { break };
            CACHE_STATS.inc_dels();
            CACHE_STATS.add_total_size(-1);

            if other_key != self_key {
                let other = unsafe { &*other_key.0 };
                let paired = other
                    .mutable
                    .borrow_mut(guard)
                    .composition_cache
                    .remove(&self_key);
                if let Some(paired) = paired {
                    CACHE_STATS.inc_dels();
                    CACHE_STATS.add_total_size(-1);
                    if let Some(result) = paired.result {
                        if result != other_key {
                            unsafe { Self::cache_unref_delete(result) };
                        }
                    }
                }
            }

            if let Some(result) = comp.result {
                if result != self_key {
                    unsafe { Self::cache_unref_delete(result) };
                }
            }
        }

        loop {
            let taken = {
                let mut mutable = self.mutable.borrow_mut(guard);
                let key = mutable.invert_composition_cache.keys().next().copied();
                key.map(|k| (k, mutable.invert_composition_cache.remove(&k).unwrap()))
            };
            let Some((other_key, comp)) = taken else { break };
            CACHE_STATS.inc_dels();
            CACHE_STATS.add_total_size(-1);

            if other_key != self_key {
                let other = unsafe { &*other_key.0 };
                let paired = other
                    .mutable
                    .borrow_mut(guard)
                    .invert_composition_cache
                    .remove(&self_key);
                if let Some(paired) = paired {
                    CACHE_STATS.inc_dels();
                    CACHE_STATS.add_total_size(-1);
                    if let Some(result) = paired.result {
                        if result != other_key {
                            unsafe { Self::cache_unref_delete(result) };
                        }
                    }
                }
            }

            if let Some(result) = comp.result {
                if result != self_key {
                    unsafe { Self::cache_unref_delete(result) };
                }
            }
        }
    }

    /// Checks for a composition-cache cycle beginning at this state and,
    /// if one exists, breaks it by unlinking this state's cache entries.
    pub(crate) fn detect_and_break_cycles(&self, guard: &StatesGuard<'_>) {
        let self_key = StatePtr(std::ptr::from_ref(self));

        let epoch = interner::next_cycle_epoch(guard);
        if r_detect_cycles(self_key, self_key, 1, epoch, guard) {
            debug!("Breaking composition cycle involving {self}");
            self.remove_cache_pointers(guard);
            return;
        }
        let epoch = interner::next_cycle_epoch(guard);
        if r_detect_reverse_cycles(self_key, self_key, 1, epoch, guard) {
            debug!("Breaking reverse composition cycle involving {self}");
            self.remove_cache_pointers(guard);
        }
    }
}

// Follows cached results forward from `current`, stamping each visited
// state with the epoch. A revisit of the start state at path length > 2 is
// a genuine cycle; one- and two-step loops (self-composition and the
// mutual pair) hold no leaked references.
fn r_detect_cycles(
    start: StatePtr,
    current: StatePtr,
    length: usize,
    epoch: u64,
    guard: &StatesGuard<'_>,
) -> bool {
    let state = unsafe { &*current.0 };
    {
        let mut mutable = state.mutable.borrow_mut(guard);
        if mutable.cycle_detect == epoch {
            return current == start && length > 2;
        }
        mutable.cycle_detect = epoch;
    }

    let forward: SmallVec<[StatePtr; 8]> = state
        .mutable
        .borrow(guard)
        .composition_cache
        .values()
        .filter_map(|c| c.result)
        .collect();
    for result in forward {
        if r_detect_cycles(start, result, length + 1, epoch, guard) {
            return true;
        }
    }

    let invert: SmallVec<[StatePtr; 8]> = state
        .mutable
        .borrow(guard)
        .invert_composition_cache
        .values()
        .filter_map(|c| c.result)
        .collect();
    for result in invert {
        if r_detect_cycles(start, result, length + 1, epoch, guard) {
            return true;
        }
    }

    false
}

// The reverse walk: follows the paired back-entries, i.e. for each state
// that has us in its cache, the result *it* recorded about us. A cycle may
// be reachable in either direction, so both walks run.
fn r_detect_reverse_cycles(
    start: StatePtr,
    current: StatePtr,
    length: usize,
    epoch: u64,
    guard: &StatesGuard<'_>,
) -> bool {
    let state = unsafe { &*current.0 };
    {
        let mut mutable = state.mutable.borrow_mut(guard);
        if mutable.cycle_detect == epoch {
            return current == start && length > 2;
        }
        mutable.cycle_detect = epoch;
    }

    let forward_keys: SmallVec<[StatePtr; 8]> = state
        .mutable
        .borrow(guard)
        .composition_cache
        .keys()
        .copied()
        .collect();
    for other_key in forward_keys {
        if other_key == current {
            continue;
        }
        let other = unsafe { &*other_key.0 };
        let result = other
            .mutable
            .borrow(guard)
            .composition_cache
            .get(&current)
            .and_then(|c| c.result);
        if let Some(result) = result {
            if r_detect_reverse_cycles(start, result, length + 1, epoch, guard) {
                return true;
            }
        }
    }

    let invert_keys: SmallVec<[StatePtr; 8]> = state
        .mutable
        .borrow(guard)
        .invert_composition_cache
        .keys()
        .copied()
        .collect();
    for other_key in invert_keys {
        if other_key == current {
            continue;
        }
        let other = unsafe { &*other_key.0 };
        let result = other
            .mutable
            .borrow(guard)
            .invert_composition_cache
            .get(&current)
            .and_then(|c| c.result);
        if let Some(result) = result {
            if r_detect_reverse_cycles(start, result, length + 1, epoch, guard) {
                return true;
            }
        }
    }

    false
}

// Counts live allocations, interned or not; provisional states discarded
// by the interner decrement here too.
impl Drop for RenderState {
    fn drop(&mut self) {
        CACHE_STATS.add_num_states(-1);
    }
}

// ─── Display ─────────────────────────────────────────────────────────────────

impl fmt::Display for RenderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S:")?;
        if self.is_empty() {
            return write!(f, "(empty)");
        }
        write!(f, "(")?;
        let mut sep = "";
        for slot in self.filled_slots.iter() {
            if let Some(entry) = &self.attributes[slot.index()] {
                write!(f, "{sep}{}", entry.attrib.kind_name())?;
                sep = " ";
            }
        }
        write!(f, ")")
    }
}

impl fmt::Debug for RenderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self} refs={}", self.ref_count())
    }
}

// ─── StateRef ────────────────────────────────────────────────────────────────

/// Owning handle to a canonical [`RenderState`].
///
/// Equality and hashing are by address: interning guarantees equivalent
/// states share one pointer, so address identity *is* value identity for
/// canonical states.
pub struct StateRef {
    ptr: NonNull<RenderState>,
}

// SAFETY: RenderState is Sync (all mutation is lock-guarded or atomic) and
// the reference count keeps the pointee alive for the handle's lifetime.
unsafe impl Send for StateRef {}
unsafe impl Sync for StateRef {}

impl StateRef {
    pub(crate) unsafe fn from_owned(ptr: NonNull<RenderState>) -> StateRef {
        StateRef { ptr }
    }

    pub(crate) unsafe fn clone_from_ptr(ptr: *const RenderState) -> StateRef {
        (*ptr).ref_();
        StateRef {
            ptr: NonNull::new_unchecked(ptr.cast_mut()),
        }
    }

    #[must_use]
    pub fn as_ptr(&self) -> *const RenderState {
        self.ptr.as_ptr()
    }

    /// Address identity; the canonical-state equality check.
    #[must_use]
    pub fn ptr_eq(&self, other: &StateRef) -> bool {
        self.ptr == other.ptr
    }
}

impl std::ops::Deref for StateRef {
    type Target = RenderState;

    fn deref(&self) -> &RenderState {
        unsafe { self.ptr.as_ref() }
    }
}

impl Clone for StateRef {
    fn clone(&self) -> Self {
        unsafe { Self::clone_from_ptr(self.ptr.as_ptr()) }
    }
}

impl Drop for StateRef {
    fn drop(&mut self) {
        unsafe {
            if self.ptr.as_ref().unref() == 0 {
                RenderState::destruct(self.ptr.as_ptr());
            }
        }
    }
}

impl PartialEq for StateRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl Eq for StateRef {}

impl Hash for StateRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.ptr.as_ptr() as usize).hash(state);
    }
}

impl fmt::Display for StateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&**self, f)
    }
}

impl fmt::Debug for StateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
