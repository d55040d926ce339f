//! Render State Integration Tests
//!
//! Tests for:
//! - Construction and interning: make, make_empty, structural uniqueness
//! - Composition: override priorities, identity, associativity
//! - Derived states: add/set/remove attrib, adjust_all_priorities
//! - Ordering: compare_to, compare_sort, compare_mask
//! - Derived properties: bin index, draw order, cull callback, geom bits

use std::any::Any;
use std::cmp::Ordering;

use once_cell::sync::Lazy;
use saga::attrib::{self, registry};
use saga::wire::Datagram;
use saga::{
    Attrib, AttribRef, ColorAttrib, CullBinAttrib, DepthWriteAttrib, GeomRendering, RenderMode,
    RenderModeAttrib, RenderState, Slot, SlotMask, TexGenAttrib, TexGenMode, TexMatrixAttrib,
    TransparencyAttrib, TransparencyMode,
};

fn red() -> AttribRef {
    ColorAttrib::new([1.0, 0.0, 0.0, 1.0])
}

fn blue() -> AttribRef {
    ColorAttrib::new([0.0, 0.0, 1.0, 1.0])
}

fn color_of(state: &RenderState) -> [f32; 4] {
    state.get_attrib_as::<ColorAttrib>().unwrap().color
}

// ============================================================================
// Interning
// ============================================================================

#[test]
fn equal_states_share_one_pointer() {
    let s1 = RenderState::make(&[red()]);
    let s2 = RenderState::make(&[red()]);
    assert!(s1.ptr_eq(&s2));

    let s3 = RenderState::make(&[blue()]);
    assert!(!s1.ptr_eq(&s3));
}

#[test]
fn interning_is_idempotent() {
    let s1 = RenderState::make(&[red(), DepthWriteAttrib::new(false)]);
    let s2 = RenderState::make_empty().add_attrib(&red(), 0);
    let s2 = s2.add_attrib(&DepthWriteAttrib::new(false), 0);
    assert!(s1.ptr_eq(&s2));
}

#[test]
fn structural_equality_matches_address_equality() {
    let s1 = RenderState::make_with_priority(&[red()], 2);
    let s2 = RenderState::make_with_priority(&[red()], 2);
    let s3 = RenderState::make_with_priority(&[red()], 3);

    assert_eq!(s1.compare_to(&s2), Ordering::Equal);
    assert!(s1.ptr_eq(&s2));
    assert_ne!(s1.compare_to(&s3), Ordering::Equal);
    assert!(!s1.ptr_eq(&s3));
}

#[test]
fn make_with_no_attribs_is_the_empty_state() {
    let empty = RenderState::make_empty();
    assert!(empty.is_empty());
    assert!(RenderState::make(&[]).ptr_eq(&empty));
}

#[test]
fn duplicate_slots_last_wins() {
    let state = RenderState::make(&[red(), blue()]);
    assert_eq!(state.num_attribs(), 1);
    assert_eq!(color_of(&state), [0.0, 0.0, 1.0, 1.0]);
}

#[test]
fn filled_slots_mask_matches_entries() {
    let state = RenderState::make(&[red(), TransparencyAttrib::new(TransparencyMode::Alpha)]);
    assert!(state.validate_filled_slots());
    assert_eq!(state.filled_slots().count(), 2);
    assert!(state.has_attrib(ColorAttrib::slot()));
    assert!(state.has_attrib(TransparencyAttrib::slot()));
    assert!(!state.has_attrib(DepthWriteAttrib::slot()));

    let removed = state.remove_attrib(ColorAttrib::slot());
    assert!(removed.validate_filled_slots());
    assert!(!removed.has_attrib(ColorAttrib::slot()));
}

// ============================================================================
// Composition
// ============================================================================

#[test]
fn empty_is_the_composition_identity() {
    let empty = RenderState::make_empty();
    let state = RenderState::make(&[red(), DepthWriteAttrib::new(false)]);

    assert!(empty.compose(&state).ptr_eq(&state));
    assert!(state.compose(&empty).ptr_eq(&state));
    assert!(state.invert_compose(&state).is_empty());
}

#[test]
fn equal_overrides_compose_to_the_right_operand() {
    let a = RenderState::make(&[red()]);
    let b = RenderState::make_with_priority(&[blue()], 1);
    let composed = a.compose(&b);
    assert_eq!(color_of(&composed), [0.0, 0.0, 1.0, 1.0]);
    assert_eq!(composed.get_priority(ColorAttrib::slot()), 1);
}

#[test]
fn higher_override_on_the_left_wins() {
    let a = RenderState::make_with_priority(&[red()], 5);
    let b = RenderState::make(&[blue()]);
    let composed = a.compose(&b);
    assert_eq!(color_of(&composed), [1.0, 0.0, 0.0, 1.0]);
    assert_eq!(composed.get_priority(ColorAttrib::slot()), 5);
}

#[test]
fn disjoint_slots_union() {
    let a = RenderState::make(&[red()]);
    let b = RenderState::make(&[DepthWriteAttrib::new(false)]);
    let composed = a.compose(&b);
    assert_eq!(composed.num_attribs(), 2);
    assert_eq!(color_of(&composed), [1.0, 0.0, 0.0, 1.0]);
    assert!(!composed.get_attrib_as::<DepthWriteAttrib>().unwrap().enabled);
}

#[test]
fn composition_is_associative_at_equal_overrides() {
    let a = RenderState::make(&[red()]);
    let b = RenderState::make(&[DepthWriteAttrib::new(false)]);
    let c = RenderState::make(&[blue(), TransparencyAttrib::new(TransparencyMode::Alpha)]);

    let left = a.compose(&b).compose(&c);
    let right = a.compose(&b.compose(&c));
    assert!(left.ptr_eq(&right));
}

#[test]
fn invert_compose_produces_the_relative_state() {
    let a = RenderState::make(&[red()]);
    let b = RenderState::make(&[blue()]);
    let relative = a.invert_compose(&b);
    assert_eq!(color_of(&relative), [0.0, 0.0, 1.0, 1.0]);
    assert_eq!(relative.get_priority(ColorAttrib::slot()), 0);

    // A slot filled only on the left inverts against the slot default.
    let c = RenderState::make(&[red(), DepthWriteAttrib::new(false)]);
    let relative = c.invert_compose(&b);
    assert!(relative.get_attrib_as::<DepthWriteAttrib>().unwrap().enabled);
}

// ============================================================================
// Derived States
// ============================================================================

#[test]
fn add_attrib_defers_to_a_higher_existing_override() {
    let state = RenderState::make_with_priority(&[red()], 5);
    let unchanged = state.add_attrib(&blue(), 3);
    assert!(unchanged.ptr_eq(&state));

    let replaced = state.add_attrib(&blue(), 5);
    assert_eq!(color_of(&replaced), [0.0, 0.0, 1.0, 1.0]);
}

#[test]
fn set_attrib_replaces_unconditionally_and_keeps_priority() {
    let state = RenderState::make_with_priority(&[red()], 5);
    let replaced = state.set_attrib(&blue());
    assert_eq!(color_of(&replaced), [0.0, 0.0, 1.0, 1.0]);
    assert_eq!(replaced.get_priority(ColorAttrib::slot()), 5);

    let rebased = state.set_attrib_with_priority(&blue(), 0);
    assert_eq!(rebased.get_priority(ColorAttrib::slot()), 0);
}

#[test]
fn remove_attrib_returns_self_or_empty_at_the_edges() {
    let state = RenderState::make(&[red()]);
    let missing = state.remove_attrib(DepthWriteAttrib::slot());
    assert!(missing.ptr_eq(&state));

    let emptied = state.remove_attrib(ColorAttrib::slot());
    assert!(emptied.ptr_eq(&RenderState::make_empty()));
}

#[test]
fn adjust_all_priorities_floors_at_zero() {
    let state = RenderState::make_entries(&[(red(), 5), (DepthWriteAttrib::new(false), 1)]);
    let adjusted = state.adjust_all_priorities(-3);
    assert_eq!(adjusted.get_priority(ColorAttrib::slot()), 2);
    assert_eq!(adjusted.get_priority(DepthWriteAttrib::slot()), 0);

    let raised = state.adjust_all_priorities(10);
    assert_eq!(raised.get_priority(ColorAttrib::slot()), 15);
}

#[test]
fn fill_default_fills_every_registered_slot() {
    let state = RenderState::fill_default();
    // At least the seven built-in kinds; test-registered kinds may add more.
    assert!(state.num_attribs() >= 7);
    assert!(state.validate_filled_slots());
    assert!(state.has_attrib(ColorAttrib::slot()));
    assert!(state.has_attrib(CullBinAttrib::slot()));
}

// ============================================================================
// Ordering
// ============================================================================

#[test]
fn compare_to_is_antisymmetric() {
    let s1 = RenderState::make(&[red()]);
    let s2 = RenderState::make(&[blue(), DepthWriteAttrib::new(false)]);
    assert_eq!(s1.compare_to(&s2), s2.compare_to(&s1).reverse());
    assert_eq!(s1.compare_to(&s1), Ordering::Equal);
}

#[test]
fn compare_sort_is_pointer_based_and_consistent() {
    let s1 = RenderState::make(&[red()]);
    let s2 = RenderState::make(&[blue()]);
    let s3 = RenderState::make(&[red()]);

    assert_eq!(s1.compare_sort(&s3), Ordering::Equal);
    assert_eq!(s1.compare_sort(&s2), s2.compare_sort(&s1).reverse());
}

#[test]
fn compare_mask_ignores_slots_outside_the_mask() {
    let s1 = RenderState::make(&[red(), DepthWriteAttrib::new(false)]);
    let s2 = RenderState::make(&[red(), DepthWriteAttrib::new(true)]);

    let mut color_only = SlotMask::empty();
    color_only.set(ColorAttrib::slot());
    assert_eq!(s1.compare_mask(&s2, color_only), Ordering::Equal);

    let mut depth_only = SlotMask::empty();
    depth_only.set(DepthWriteAttrib::slot());
    assert_ne!(s1.compare_mask(&s2, depth_only), Ordering::Equal);
}

// ============================================================================
// Derived Properties
// ============================================================================

#[test]
fn default_bin_is_opaque() {
    let state = RenderState::make(&[red()]);
    let index = state.get_bin_index();
    assert_eq!(saga::state::bin::bin_name(index as usize).as_deref(), Some("opaque"));
    assert_eq!(state.get_draw_order(), 0);
}

#[test]
fn sorted_transparency_selects_the_transparent_bin() {
    let state = RenderState::make(&[TransparencyAttrib::new(TransparencyMode::Alpha)]);
    let index = state.get_bin_index();
    assert_eq!(
        saga::state::bin::bin_name(index as usize).as_deref(),
        Some("transparent")
    );

    let binary = RenderState::make(&[TransparencyAttrib::new(TransparencyMode::Binary)]);
    let index = binary.get_bin_index();
    assert_eq!(saga::state::bin::bin_name(index as usize).as_deref(), Some("opaque"));
}

#[test]
fn explicit_bin_attrib_wins_and_carries_draw_order() {
    let state = RenderState::make(&[CullBinAttrib::new("fixed", 7)]);
    let index = state.get_bin_index();
    assert_eq!(saga::state::bin::bin_name(index as usize).as_deref(), Some("fixed"));
    assert_eq!(state.get_draw_order(), 7);
}

#[test]
fn unknown_bin_is_created_on_the_fly() {
    let state = RenderState::make(&[CullBinAttrib::new("state-test-halo", 0)]);
    let index = state.get_bin_index();
    assert_eq!(
        saga::state::bin::bin_name(index as usize).as_deref(),
        Some("state-test-halo")
    );
}

#[test]
fn geom_rendering_folds_mode_texgen_and_texmatrix() {
    let state = RenderState::make(&[
        RenderModeAttrib::new(RenderMode::Wireframe, 1.0, false),
        TexGenAttrib::new(TexGenMode::SphereMap),
        TexMatrixAttrib::new([2.0, 2.0], [0.5, 0.0]),
    ]);
    let bits = state.get_geom_rendering(GeomRendering::empty());
    assert!(bits.contains(GeomRendering::WIREFRAME));
    assert!(bits.contains(GeomRendering::TEX_GEN));
    assert!(bits.contains(GeomRendering::TEX_MATRIX));
    assert!(!bits.contains(GeomRendering::POINT_SIZE));

    let points = RenderState::make(&[RenderModeAttrib::new(RenderMode::Point, 4.0, true)]);
    let bits = points.get_geom_rendering(GeomRendering::empty());
    assert!(bits.contains(GeomRendering::POINT_SIZE));
    assert!(bits.contains(GeomRendering::POINT_PERSPECTIVE));
}

// ============================================================================
// Cull Callbacks (custom kind exercising the extension seam)
// ============================================================================

static PROBE_SLOT: Lazy<Slot> = Lazy::new(|| {
    registry::register::<CullProbeAttrib>(
        "CullProbeAttrib",
        25,
        CullProbeAttrib::new(false),
        |di| Ok(CullProbeAttrib::new(di.get_u8()? != 0)),
    )
});

#[derive(Debug)]
struct CullProbeAttrib {
    wants_callback: bool,
}

impl CullProbeAttrib {
    fn new(wants_callback: bool) -> AttribRef {
        attrib::return_new(Self { wants_callback })
    }
}

impl Attrib for CullProbeAttrib {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn slot(&self) -> Slot {
        *PROBE_SLOT
    }

    fn kind_name(&self) -> &'static str {
        "CullProbeAttrib"
    }

    fn compare_value(&self, other: &dyn Attrib) -> Ordering {
        other
            .as_any()
            .downcast_ref::<Self>()
            .map_or(Ordering::Less, |o| {
                self.wants_callback.cmp(&o.wants_callback)
            })
    }

    fn value_hash(&self) -> u64 {
        u64::from(self.wants_callback)
    }

    fn has_cull_callback(&self) -> bool {
        self.wants_callback
    }

    fn write_datagram(&self, dg: &mut Datagram) {
        dg.add_u8(u8::from(self.wants_callback));
    }
}

#[test]
fn cull_callback_is_an_or_over_filled_slots() {
    let quiet = RenderState::make(&[red()]);
    assert!(!quiet.has_cull_callback());

    let probed = RenderState::make(&[red(), CullProbeAttrib::new(true)]);
    assert!(probed.has_cull_callback());

    let declined = RenderState::make(&[CullProbeAttrib::new(false)]);
    assert!(!declined.has_cull_callback());
}

// ============================================================================
// Display
// ============================================================================

#[test]
fn display_lists_kind_names() {
    assert_eq!(RenderState::make_empty().to_string(), "S:(empty)");
    let state = RenderState::make(&[red()]);
    assert_eq!(state.to_string(), "S:(ColorAttrib)");
}

#[test]
fn intern_table_stays_valid() {
    let _s1 = RenderState::make(&[red()]);
    let _s2 = RenderState::make(&[blue(), DepthWriteAttrib::new(false)]);
    assert!(saga::validate_states());
}
