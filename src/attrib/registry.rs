//! Attribute Slot Registry
//!
//! Every attribute kind is assigned a dense *slot* index at registration
//! time. A render state holds at most one attribute per slot, so the slot
//! table bounds the state record and lets the hot composition loop iterate
//! with a single bitmask instead of a map.
//!
//! Slot 0 is reserved and always empty. Slots are handed out in
//! registration order, so two builds that register the same kinds in the
//! same order produce the same mapping.

use std::any::TypeId;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::attrib::{Attrib, AttribRef};
use crate::errors::Result;
use crate::wire::DatagramIterator;

/// Upper bound on the number of attribute slots, including the reserved
/// slot 0. Bounds the per-state dense array and the width of [`SlotMask`].
pub const MAX_SLOTS: usize = 32;

/// Read factory for one attribute kind, used by the wire reader.
pub type ReadFactory = fn(&mut DatagramIterator<'_>) -> Result<AttribRef>;

// ─── Slot ────────────────────────────────────────────────────────────────────

/// Dense index of one attribute kind. Valid slots are in `[1, MAX_SLOTS)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Slot(pub(crate) u8);

impl Slot {
    /// The array index backing this slot.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

// ─── SlotMask ────────────────────────────────────────────────────────────────

/// Bitmask over slots; bit *s* is set iff slot *s* holds an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SlotMask(u32);

impl SlotMask {
    #[inline]
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[inline]
    pub fn set(&mut self, slot: Slot) {
        self.0 |= 1 << slot.0;
    }

    #[inline]
    pub fn clear(&mut self, slot: Slot) {
        self.0 &= !(1 << slot.0);
    }

    #[inline]
    #[must_use]
    pub fn contains(self, slot: Slot) -> bool {
        self.0 & (1 << slot.0) != 0
    }

    #[inline]
    #[must_use]
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[inline]
    #[must_use]
    pub fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    #[inline]
    #[must_use]
    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterates the set slots, lowest first.
    #[inline]
    pub fn iter(self) -> impl Iterator<Item = Slot> {
        let mut bits = self.0;
        std::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let slot = bits.trailing_zeros() as u8;
            bits &= bits - 1;
            Some(Slot(slot))
        })
    }
}

// ─── Registry ────────────────────────────────────────────────────────────────

struct SlotRecord {
    name: &'static str,
    sort: i32,
    default: AttribRef,
    factory: ReadFactory,
}

#[derive(Default)]
struct RegistryInner {
    // records[i] describes slot i + 1; slot 0 is reserved
    records: Vec<SlotRecord>,
    by_type: FxHashMap<TypeId, Slot>,
    sorted: SmallVec<[Slot; MAX_SLOTS]>,
}

static REGISTRY: Lazy<RwLock<RegistryInner>> = Lazy::new(|| RwLock::new(RegistryInner::default()));

/// Registers an attribute kind, assigning it the next free slot. A kind
/// already registered keeps its original slot; the duplicate registration
/// is ignored.
///
/// # Panics
///
/// Panics if the slot table is full.
pub fn register<T: Attrib>(
    name: &'static str,
    sort: i32,
    default: AttribRef,
    factory: ReadFactory,
) -> Slot {
    let mut reg = REGISTRY.write();
    let type_id = TypeId::of::<T>();
    if let Some(&slot) = reg.by_type.get(&type_id) {
        return slot;
    }
    let index = reg.records.len() + 1;
    assert!(index < MAX_SLOTS, "attribute slot table is full ({name})");
    let slot = Slot(index as u8);
    reg.records.push(SlotRecord {
        name,
        sort,
        default,
        factory,
    });
    reg.by_type.insert(type_id, slot);

    let mut sorted: SmallVec<[Slot; MAX_SLOTS]> = (1..=reg.records.len())
        .map(|i| Slot(i as u8))
        .collect();
    sorted.sort_by_key(|s| (reg.records[s.index() - 1].sort, *s));
    reg.sorted = sorted;

    slot
}

/// Returns the slot assigned to kind `T`, if registered.
#[must_use]
pub fn slot_of<T: Attrib>() -> Option<Slot> {
    REGISTRY.read().by_type.get(&TypeId::of::<T>()).copied()
}

/// Number of slots in use, counting the reserved slot 0.
#[must_use]
pub fn num_slots() -> usize {
    REGISTRY.read().records.len() + 1
}

/// Capacity of the slot table.
#[must_use]
pub fn max_slots() -> usize {
    MAX_SLOTS
}

/// The identity attribute for a slot, used as the missing operand of
/// invert composition.
///
/// # Panics
///
/// Panics if the slot is reserved or unregistered.
#[must_use]
pub fn slot_default(slot: Slot) -> AttribRef {
    REGISTRY.read().records[slot.index() - 1].default.clone()
}

/// The registered name of a slot's kind.
#[must_use]
pub fn slot_name(slot: Slot) -> &'static str {
    REGISTRY.read().records[slot.index() - 1].name
}

/// Slots ordered by their registered sort rank (ties break on slot index).
/// Iterating states in this order clusters the attribute kinds that are
/// most expensive to switch between draw calls.
#[must_use]
pub fn sorted_slots() -> SmallVec<[Slot; MAX_SLOTS]> {
    REGISTRY.read().sorted.clone()
}

/// Looks up the wire read factory for a kind name.
#[must_use]
pub fn factory_for(name: &str) -> Option<ReadFactory> {
    let reg = REGISTRY.read();
    reg.records
        .iter()
        .find(|r| r.name == name)
        .map(|r| r.factory)
}
