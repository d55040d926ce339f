//! Composition Cache & Garbage Collection Tests
//!
//! Tests for:
//! - Cache behavior: memoized results, paired entries, cache-off parity
//! - Reclamation: gc sweeps, forced composition cycles, auto cycle break
//! - Cache-wide operations: clear_cache, unused-state accounting
//!
//! Policy flags are process-global, so every test serializes on one lock
//! and asserts intern-table deltas against a drained baseline.

use std::any::Any;
use std::cmp::Ordering;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use saga::attrib::{self, registry};
use saga::state::stats;
use saga::wire::Datagram;
use saga::{Attrib, AttribRef, ColorAttrib, DepthWriteAttrib, RenderState, Slot};

static POLICY_LOCK: Mutex<()> = Mutex::new(());

/// Runs gc sweeps until the intern table stops shrinking.
fn drain_gc() {
    loop {
        let before = saga::num_states();
        let _ = saga::garbage_collect();
        if saga::num_states() == before {
            break;
        }
    }
}

/// Applies policy overrides through an explicit page for the duration of
/// the closure.
fn with_policy(settings: &[(&str, &str)], f: impl FnOnce()) {
    let page = saga::prc::make_explicit_page("cache-test-policy");
    for (variable, value) in settings {
        page.make_declaration(variable, value);
    }
    f();
    assert!(saga::prc::delete_explicit_page(&page));
}

fn color(value: f32) -> AttribRef {
    ColorAttrib::new([value, value * 0.5, 0.0, 1.0])
}

// ============================================================================
// Cache Behavior
// ============================================================================

#[test]
fn composition_results_are_memoized() {
    let _lock = POLICY_LOCK.lock().unwrap();
    let a = RenderState::make(&[color(0.11)]);
    let b = RenderState::make(&[DepthWriteAttrib::new(false)]);

    let before = stats::report();
    let c1 = a.compose(&b);
    let c2 = a.compose(&b);
    let after = stats::report();

    assert!(c1.ptr_eq(&c2));
    assert!(after.hits > before.hits);
    assert!(after.misses > before.misses);
}

#[test]
fn reverse_direction_fills_the_paired_entry() {
    let _lock = POLICY_LOCK.lock().unwrap();
    let a = RenderState::make(&[color(0.12)]);
    let b = RenderState::make(&[DepthWriteAttrib::new(false)]);

    let _forward = a.compose(&b);
    let reverse1 = b.compose(&a);
    let reverse2 = b.compose(&a);
    assert!(reverse1.ptr_eq(&reverse2));
}

#[test]
fn invert_compose_results_are_memoized() {
    let _lock = POLICY_LOCK.lock().unwrap();
    let a = RenderState::make(&[color(0.13)]);
    let b = RenderState::make(&[color(0.14)]);

    let r1 = a.invert_compose(&b);
    let r2 = a.invert_compose(&b);
    assert!(r1.ptr_eq(&r2));
}

#[test]
fn cache_off_produces_identical_compositions() {
    let _lock = POLICY_LOCK.lock().unwrap();

    // Computed with the cache on.
    let cached = {
        let a = RenderState::make(&[color(0.15)]);
        let b = RenderState::make_with_priority(&[color(0.16)], 1);
        a.compose(&b)
            .get_attrib_as::<ColorAttrib>()
            .unwrap()
            .color
    };

    with_policy(&[("state-cache", "0")], || {
        let a = RenderState::make(&[color(0.15)]);
        let b = RenderState::make_with_priority(&[color(0.16)], 1);
        let r1 = a.compose(&b);
        let r2 = a.compose(&b);

        // Same value every time, but nothing is interned or memoized.
        assert_eq!(r1.compare_to(&r2), Ordering::Equal);
        assert!(!r1.ptr_eq(&r2));
        assert_eq!(r1.get_attrib_as::<ColorAttrib>().unwrap().color, cached);
    });
}

// ============================================================================
// Garbage Collection
// ============================================================================

#[test]
fn gc_sweep_frees_unreferenced_states() {
    let _lock = POLICY_LOCK.lock().unwrap();
    drain_gc();
    let base = saga::num_states();

    {
        let _s = RenderState::make(&[color(0.21)]);
        assert_eq!(saga::num_states(), base + 1);
    }
    // The table's own reference keeps the state alive until a sweep.
    assert_eq!(saga::num_states(), base + 1);

    drain_gc();
    assert_eq!(saga::num_states(), base);
}

#[test]
fn gc_respects_live_references() {
    let _lock = POLICY_LOCK.lock().unwrap();
    drain_gc();
    let base = saga::num_states();

    let held = RenderState::make(&[color(0.22)]);
    drain_gc();
    assert_eq!(saga::num_states(), base + 1);
    assert!(held.has_attrib(ColorAttrib::slot()));

    drop(held);
    drain_gc();
    assert_eq!(saga::num_states(), base);
}

// ============================================================================
// Forced Composition Cycles
// ============================================================================

// Modular compose lets a test arrange A∘B = C and C∘D = A exactly:
// 1 + 2 = 3, and (3 + 5) mod 7 = 1.
static CYCLE_SLOT: Lazy<Slot> = Lazy::new(|| {
    registry::register::<CycleAttrib>("CycleAttrib", 28, CycleAttrib::new(0), |di| {
        Ok(CycleAttrib::new(di.get_u32()?))
    })
});

#[derive(Debug)]
struct CycleAttrib {
    id: u32,
}

impl CycleAttrib {
    fn new(id: u32) -> AttribRef {
        attrib::return_new(Self { id })
    }
}

impl Attrib for CycleAttrib {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn slot(&self) -> Slot {
        *CYCLE_SLOT
    }

    fn kind_name(&self) -> &'static str {
        "CycleAttrib"
    }

    fn compare_value(&self, other: &dyn Attrib) -> Ordering {
        other
            .as_any()
            .downcast_ref::<Self>()
            .map_or(Ordering::Less, |o| self.id.cmp(&o.id))
    }

    fn value_hash(&self) -> u64 {
        u64::from(self.id)
    }

    fn compose(&self, other: &AttribRef) -> AttribRef {
        let other_id = other
            .as_any()
            .downcast_ref::<Self>()
            .map_or(0, |o| o.id);
        CycleAttrib::new((self.id + other_id) % 7)
    }

    fn write_datagram(&self, dg: &mut Datagram) {
        dg.add_u32(self.id);
    }
}

#[test]
fn forced_cycle_is_reclaimed_by_gc() {
    let _lock = POLICY_LOCK.lock().unwrap();
    drain_gc();
    let base = saga::num_states();

    {
        let a = RenderState::make(&[CycleAttrib::new(1)]);
        let b = RenderState::make(&[CycleAttrib::new(2)]);
        let d = RenderState::make(&[CycleAttrib::new(5)]);

        let c = a.compose(&b);
        let back = c.compose(&d);
        // The cycle is closed: composing C with D yields A itself.
        assert!(back.ptr_eq(&a));
        assert_eq!(saga::num_states(), base + 4);
    }

    drain_gc();
    assert_eq!(saga::num_states(), base);
}

#[test]
fn forced_cycle_is_reclaimed_by_auto_break_without_gc() {
    let _lock = POLICY_LOCK.lock().unwrap();
    drain_gc();
    let base = saga::num_states();

    with_policy(&[("garbage-collect-states", "0")], || {
        let a = RenderState::make(&[CycleAttrib::new(1)]);
        let b = RenderState::make(&[CycleAttrib::new(2)]);
        let d = RenderState::make(&[CycleAttrib::new(5)]);

        let c = a.compose(&b);
        let back = c.compose(&d);
        assert!(back.ptr_eq(&a));

        // Dropping the references unwinds everything eagerly; the cycle
        // break fires as the last non-cache reference to A goes away.
        drop(back);
        drop(a);
        drop(b);
        drop(c);
        drop(d);
        assert_eq!(saga::num_states(), base);
    });
}

// ============================================================================
// Cache-Wide Operations
// ============================================================================

#[test]
fn cached_results_count_as_unused_states() {
    let _lock = POLICY_LOCK.lock().unwrap();
    drain_gc();

    let a = RenderState::make(&[color(0.31)]);
    let b = RenderState::make(&[DepthWriteAttrib::new(false)]);
    let before = saga::get_num_unused_states();
    let composed = a.compose(&b);
    drop(composed);
    // The composition result now lives only in the cache.
    assert!(saga::get_num_unused_states() > before);

    drain_gc();
}

#[test]
fn clear_cache_reclaims_cache_only_states() {
    let _lock = POLICY_LOCK.lock().unwrap();
    drain_gc();
    let base = saga::num_states();

    with_policy(&[("garbage-collect-states", "0")], || {
        let a = RenderState::make(&[color(0.32)]);
        let b = RenderState::make(&[DepthWriteAttrib::new(false)]);
        let composed = a.compose(&b);
        drop(composed);
        assert_eq!(saga::num_states(), base + 3);

        // The composed state has no references outside the cache; clearing
        // the cache reclaims it and only it.
        let freed = saga::clear_cache();
        assert!(freed >= 1);
        assert_eq!(saga::num_states(), base + 2);

        drop(a);
        drop(b);
        assert_eq!(saga::num_states(), base);
    });
}

#[test]
fn intern_table_is_valid_under_churn() {
    let _lock = POLICY_LOCK.lock().unwrap();
    let states: Vec<_> = (0..16)
        .map(|i| RenderState::make(&[color(0.4 + i as f32 * 0.01)]))
        .collect();
    let composed: Vec<_> = states
        .windows(2)
        .map(|pair| pair[0].compose(&pair[1]))
        .collect();
    assert!(saga::validate_states());
    drop(composed);
    drop(states);
    drain_gc();
    assert!(saga::validate_states());
}
