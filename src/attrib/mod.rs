//! Render Attributes
//!
//! An attribute is one immutable per-kind render setting (a color, a
//! transparency mode, a cull-bin assignment, ...). The state core never
//! looks inside an attribute; it consumes the [`Attrib`] trait: slot
//! placement, value comparison, pairwise composition, and the few derived
//! hints (cull callbacks, geometry rendering bits).
//!
//! Like states, attributes are canonicalized through a process-wide
//! interner so that equal values share one `Arc`. Pointer comparison is
//! then sufficient wherever attributes are known to be canonical, which is
//! what makes the draw-sort comparison of states cheap.

pub mod kinds;
pub mod registry;

use std::any::{Any, TypeId};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::state::config;
use crate::wire::Datagram;

pub use registry::{Slot, SlotMask, MAX_SLOTS};

/// Shared handle to a canonical attribute.
pub type AttribRef = Arc<dyn Attrib>;

bitflags! {
    /// Geometry rendering feature bits accumulated by
    /// [`RenderState::get_geom_rendering`](crate::state::RenderState::get_geom_rendering).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct GeomRendering: u32 {
        const POINT_SIZE          = 1 << 0;
        const POINT_PERSPECTIVE   = 1 << 1;
        const POINT_SPRITES       = 1 << 2;
        const WIREFRAME           = 1 << 3;
        const TEX_GEN             = 1 << 4;
        const TEX_MATRIX          = 1 << 5;
    }
}

/// Interface one attribute kind presents to the state core.
///
/// `compose` and `invert_compose` default to "the right operand wins",
/// which is correct for every plain value attribute; kinds with merge
/// semantics (or tests arranging composition cycles) override them.
pub trait Attrib: Any + Send + Sync + fmt::Debug {
    fn as_any(&self) -> &dyn Any;

    /// The slot this kind was registered under.
    fn slot(&self) -> Slot;

    /// The registered kind name, used by the wire format and state display.
    fn kind_name(&self) -> &'static str;

    /// Total order over values of the same kind. `other` is guaranteed to
    /// be the same concrete kind (slots are one kind each).
    fn compare_value(&self, other: &dyn Attrib) -> Ordering;

    /// Structural hash consistent with [`Attrib::compare_value`].
    fn value_hash(&self) -> u64;

    /// Composition of `self` (the inherited setting) with `other` (the
    /// overriding setting).
    fn compose(&self, other: &AttribRef) -> AttribRef {
        other.clone()
    }

    /// Relative transform from `self` to `other`.
    fn invert_compose(&self, other: &AttribRef) -> AttribRef {
        other.clone()
    }

    /// Whether a higher override on the *lower* side of a state
    /// composition is allowed to win against this attribute.
    fn lower_can_override(&self) -> bool {
        false
    }

    /// Whether this attribute wants a callback during the cull traversal.
    fn has_cull_callback(&self) -> bool {
        false
    }

    /// Folds this attribute's contribution into the geometry rendering
    /// feature bits.
    fn geom_rendering(&self, bits: GeomRendering) -> GeomRendering {
        bits
    }

    /// Serializes the attribute's value fields.
    fn write_datagram(&self, dg: &mut Datagram);
}

/// Pointer equality on canonical handles.
#[inline]
#[must_use]
pub fn ptr_eq(a: &AttribRef, b: &AttribRef) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a).cast::<()>(),
        Arc::as_ptr(b).cast::<()>(),
    )
}

// ─── Attribute Interner ──────────────────────────────────────────────────────

// Buckets keyed by (concrete kind, value hash); compare_value resolves the
// rare hash collision.
#[derive(Default)]
struct AttribInterner {
    table: FxHashMap<(TypeId, u64), SmallVec<[AttribRef; 1]>>,
}

static ATTRIBS: Lazy<Mutex<AttribInterner>> = Lazy::new(|| Mutex::new(AttribInterner::default()));

/// Funnel for kind constructors: canonicalizes the new attribute when
/// `uniquify-attribs` is in effect, otherwise returns it as built.
pub fn return_new<T: Attrib>(attrib: T) -> AttribRef {
    let attrib: AttribRef = Arc::new(attrib);
    if !config::uniquify_attribs() {
        return attrib;
    }
    do_uniquify(attrib)
}

/// Canonicalizes one attribute through the interner, unconditionally.
/// The state interner uses this to repair pointer identity for states
/// built while `uniquify-attribs` was off.
#[must_use]
pub fn do_uniquify(attrib: AttribRef) -> AttribRef {
    let key = (attrib.as_any().type_id(), attrib.value_hash());
    let mut interner = ATTRIBS.lock();
    let bucket = interner.table.entry(key).or_default();
    for existing in bucket.iter() {
        if existing.compare_value(&*attrib) == Ordering::Equal {
            return existing.clone();
        }
    }
    bucket.push(attrib.clone());
    attrib
}

/// Sweeps the interner, dropping every attribute whose only remaining
/// reference is the interner itself. Returns the number of attributes
/// freed.
pub fn garbage_collect() -> usize {
    let mut interner = ATTRIBS.lock();
    let mut freed = 0;
    interner.table.retain(|_, bucket| {
        bucket.retain(|a| {
            if Arc::strong_count(a) > 1 {
                true
            } else {
                freed += 1;
                false
            }
        });
        !bucket.is_empty()
    });
    freed
}

/// Number of canonical attributes currently interned.
#[must_use]
pub fn num_attribs() -> usize {
    ATTRIBS.lock().table.values().map(|bucket| bucket.len()).sum()
}
