//! Built-in Attribute Kinds
//!
//! The handful of attribute kinds the core itself consults: cull-bin and
//! transparency drive bin assignment, render-mode / tex-gen / tex-matrix
//! contribute geometry rendering bits, color and depth-write are the plain
//! value attributes everything else is modeled on.
//!
//! Every constructor funnels through [`attrib::return_new`], so equal
//! values share one canonical `Arc` whenever `uniquify-attribs` is on.

use std::any::Any;
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use once_cell::sync::Lazy;
use rustc_hash::FxHasher;

use crate::attrib::registry::{self, Slot};
use crate::attrib::{self, Attrib, AttribRef, GeomRendering};
use crate::errors::Result;
use crate::wire::{Datagram, DatagramIterator};

fn hash_of<T: Hash>(value: &T) -> u64 {
    let mut hasher = FxHasher::default();
    value.hash(&mut hasher);
    hasher.finish()
}

fn downcast<'a, T: Attrib>(other: &'a dyn Attrib) -> Option<&'a T> {
    other.as_any().downcast_ref::<T>()
}

/// Forces registration of every built-in kind, in a fixed order, so slot
/// numbers are deterministic for a given build. Called by the state
/// interner before the first state is constructed.
pub fn register_builtins() {
    static ONCE: Lazy<()> = Lazy::new(|| {
        let _ = *COLOR_SLOT;
        let _ = *DEPTH_WRITE_SLOT;
        let _ = *RENDER_MODE_SLOT;
        let _ = *TEX_MATRIX_SLOT;
        let _ = *TEX_GEN_SLOT;
        let _ = *TRANSPARENCY_SLOT;
        let _ = *CULL_BIN_SLOT;
    });
    let () = *ONCE;
}

// ─── ColorAttrib ─────────────────────────────────────────────────────────────

static COLOR_SLOT: Lazy<Slot> = Lazy::new(|| {
    registry::register::<ColorAttrib>("ColorAttrib", 15, ColorAttrib::new([1.0; 4]), read_color)
});

/// Flat vertex color override.
#[derive(Debug)]
pub struct ColorAttrib {
    pub color: [f32; 4],
}

impl ColorAttrib {
    #[must_use]
    pub fn new(color: [f32; 4]) -> AttribRef {
        attrib::return_new(Self { color })
    }

    #[must_use]
    pub fn slot() -> Slot {
        *COLOR_SLOT
    }
}

impl Attrib for ColorAttrib {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn slot(&self) -> Slot {
        *COLOR_SLOT
    }

    fn kind_name(&self) -> &'static str {
        "ColorAttrib"
    }

    fn compare_value(&self, other: &dyn Attrib) -> Ordering {
        downcast::<Self>(other).map_or(Ordering::Less, |o| {
            self.color
                .iter()
                .zip(o.color.iter())
                .map(|(a, b)| a.total_cmp(b))
                .find(|c| *c != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        })
    }

    fn value_hash(&self) -> u64 {
        hash_of(&self.color.map(f32::to_bits))
    }

    // A child node's color is allowed to replace an ancestor's even when
    // the ancestor's override is higher.
    fn lower_can_override(&self) -> bool {
        true
    }

    fn write_datagram(&self, dg: &mut Datagram) {
        for c in self.color {
            dg.add_f32(c);
        }
    }
}

fn read_color(di: &mut DatagramIterator<'_>) -> Result<AttribRef> {
    let mut color = [0.0f32; 4];
    for c in &mut color {
        *c = di.get_f32()?;
    }
    Ok(ColorAttrib::new(color))
}

// ─── DepthWriteAttrib ────────────────────────────────────────────────────────

static DEPTH_WRITE_SLOT: Lazy<Slot> = Lazy::new(|| {
    registry::register::<DepthWriteAttrib>(
        "DepthWriteAttrib",
        10,
        DepthWriteAttrib::new(true),
        read_depth_write,
    )
});

/// Enables or disables depth-buffer writes.
#[derive(Debug)]
pub struct DepthWriteAttrib {
    pub enabled: bool,
}

impl DepthWriteAttrib {
    #[must_use]
    pub fn new(enabled: bool) -> AttribRef {
        attrib::return_new(Self { enabled })
    }

    #[must_use]
    pub fn slot() -> Slot {
        *DEPTH_WRITE_SLOT
    }
}

impl Attrib for DepthWriteAttrib {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn slot(&self) -> Slot {
        *DEPTH_WRITE_SLOT
    }

    fn kind_name(&self) -> &'static str {
        "DepthWriteAttrib"
    }

    fn compare_value(&self, other: &dyn Attrib) -> Ordering {
        downcast::<Self>(other).map_or(Ordering::Less, |o| self.enabled.cmp(&o.enabled))
    }

    fn value_hash(&self) -> u64 {
        hash_of(&self.enabled)
    }

    fn write_datagram(&self, dg: &mut Datagram) {
        dg.add_u8(u8::from(self.enabled));
    }
}

fn read_depth_write(di: &mut DatagramIterator<'_>) -> Result<AttribRef> {
    Ok(DepthWriteAttrib::new(di.get_u8()? != 0))
}

// ─── RenderModeAttrib ────────────────────────────────────────────────────────

static RENDER_MODE_SLOT: Lazy<Slot> = Lazy::new(|| {
    registry::register::<RenderModeAttrib>(
        "RenderModeAttrib",
        12,
        RenderModeAttrib::new(RenderMode::Filled, 1.0, false),
        read_render_mode,
    )
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RenderMode {
    Filled,
    Wireframe,
    Point,
}

/// Polygon rasterization mode with point/line thickness.
#[derive(Debug)]
pub struct RenderModeAttrib {
    pub mode: RenderMode,
    pub thickness: f32,
    pub perspective: bool,
}

impl RenderModeAttrib {
    #[must_use]
    pub fn new(mode: RenderMode, thickness: f32, perspective: bool) -> AttribRef {
        attrib::return_new(Self {
            mode,
            thickness,
            perspective,
        })
    }

    #[must_use]
    pub fn slot() -> Slot {
        *RENDER_MODE_SLOT
    }
}

impl Attrib for RenderModeAttrib {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn slot(&self) -> Slot {
        *RENDER_MODE_SLOT
    }

    fn kind_name(&self) -> &'static str {
        "RenderModeAttrib"
    }

    fn compare_value(&self, other: &dyn Attrib) -> Ordering {
        downcast::<Self>(other).map_or(Ordering::Less, |o| {
            self.mode
                .cmp(&o.mode)
                .then(self.thickness.total_cmp(&o.thickness))
                .then(self.perspective.cmp(&o.perspective))
        })
    }

    fn value_hash(&self) -> u64 {
        hash_of(&(self.mode, self.thickness.to_bits(), self.perspective))
    }

    fn geom_rendering(&self, bits: GeomRendering) -> GeomRendering {
        match self.mode {
            RenderMode::Filled => bits,
            RenderMode::Wireframe => bits | GeomRendering::WIREFRAME,
            RenderMode::Point => {
                let mut bits = bits | GeomRendering::POINT_SIZE;
                if self.perspective {
                    bits |= GeomRendering::POINT_PERSPECTIVE;
                }
                bits
            }
        }
    }

    fn write_datagram(&self, dg: &mut Datagram) {
        dg.add_u8(self.mode as u8);
        dg.add_f32(self.thickness);
        dg.add_u8(u8::from(self.perspective));
    }
}

fn read_render_mode(di: &mut DatagramIterator<'_>) -> Result<AttribRef> {
    let mode = match di.get_u8()? {
        0 => RenderMode::Filled,
        1 => RenderMode::Wireframe,
        _ => RenderMode::Point,
    };
    let thickness = di.get_f32()?;
    let perspective = di.get_u8()? != 0;
    Ok(RenderModeAttrib::new(mode, thickness, perspective))
}

// ─── TexMatrixAttrib ─────────────────────────────────────────────────────────

static TEX_MATRIX_SLOT: Lazy<Slot> = Lazy::new(|| {
    registry::register::<TexMatrixAttrib>(
        "TexMatrixAttrib",
        16,
        TexMatrixAttrib::new([1.0, 1.0], [0.0, 0.0]),
        read_tex_matrix,
    )
});

/// UV-space scale and offset applied before texture lookup.
#[derive(Debug)]
pub struct TexMatrixAttrib {
    pub scale: [f32; 2],
    pub offset: [f32; 2],
}

impl TexMatrixAttrib {
    #[must_use]
    pub fn new(scale: [f32; 2], offset: [f32; 2]) -> AttribRef {
        attrib::return_new(Self { scale, offset })
    }

    #[must_use]
    pub fn slot() -> Slot {
        *TEX_MATRIX_SLOT
    }

    fn is_identity(&self) -> bool {
        self.scale == [1.0, 1.0] && self.offset == [0.0, 0.0]
    }
}

impl Attrib for TexMatrixAttrib {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn slot(&self) -> Slot {
        *TEX_MATRIX_SLOT
    }

    fn kind_name(&self) -> &'static str {
        "TexMatrixAttrib"
    }

    fn compare_value(&self, other: &dyn Attrib) -> Ordering {
        downcast::<Self>(other).map_or(Ordering::Less, |o| {
            let a = [self.scale[0], self.scale[1], self.offset[0], self.offset[1]];
            let b = [o.scale[0], o.scale[1], o.offset[0], o.offset[1]];
            a.iter()
                .zip(b.iter())
                .map(|(x, y)| x.total_cmp(y))
                .find(|c| *c != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        })
    }

    fn value_hash(&self) -> u64 {
        hash_of(&(self.scale.map(f32::to_bits), self.offset.map(f32::to_bits)))
    }

    fn geom_rendering(&self, bits: GeomRendering) -> GeomRendering {
        if self.is_identity() {
            bits
        } else {
            bits | GeomRendering::TEX_MATRIX
        }
    }

    fn write_datagram(&self, dg: &mut Datagram) {
        for v in [self.scale[0], self.scale[1], self.offset[0], self.offset[1]] {
            dg.add_f32(v);
        }
    }
}

fn read_tex_matrix(di: &mut DatagramIterator<'_>) -> Result<AttribRef> {
    let scale = [di.get_f32()?, di.get_f32()?];
    let offset = [di.get_f32()?, di.get_f32()?];
    Ok(TexMatrixAttrib::new(scale, offset))
}

// ─── TexGenAttrib ────────────────────────────────────────────────────────────

static TEX_GEN_SLOT: Lazy<Slot> = Lazy::new(|| {
    registry::register::<TexGenAttrib>(
        "TexGenAttrib",
        14,
        TexGenAttrib::new(TexGenMode::Off),
        read_tex_gen,
    )
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TexGenMode {
    Off,
    WorldPosition,
    EyeNormal,
    SphereMap,
}

/// Automatic texture coordinate generation.
#[derive(Debug)]
pub struct TexGenAttrib {
    pub mode: TexGenMode,
}

impl TexGenAttrib {
    #[must_use]
    pub fn new(mode: TexGenMode) -> AttribRef {
        attrib::return_new(Self { mode })
    }

    #[must_use]
    pub fn slot() -> Slot {
        *TEX_GEN_SLOT
    }
}

impl Attrib for TexGenAttrib {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn slot(&self) -> Slot {
        *TEX_GEN_SLOT
    }

    fn kind_name(&self) -> &'static str {
        "TexGenAttrib"
    }

    fn compare_value(&self, other: &dyn Attrib) -> Ordering {
        downcast::<Self>(other).map_or(Ordering::Less, |o| self.mode.cmp(&o.mode))
    }

    fn value_hash(&self) -> u64 {
        hash_of(&self.mode)
    }

    fn geom_rendering(&self, bits: GeomRendering) -> GeomRendering {
        if self.mode == TexGenMode::Off {
            bits
        } else {
            bits | GeomRendering::TEX_GEN
        }
    }

    fn write_datagram(&self, dg: &mut Datagram) {
        dg.add_u8(self.mode as u8);
    }
}

fn read_tex_gen(di: &mut DatagramIterator<'_>) -> Result<AttribRef> {
    let mode = match di.get_u8()? {
        0 => TexGenMode::Off,
        1 => TexGenMode::WorldPosition,
        2 => TexGenMode::EyeNormal,
        _ => TexGenMode::SphereMap,
    };
    Ok(TexGenAttrib::new(mode))
}

// ─── TransparencyAttrib ──────────────────────────────────────────────────────

static TRANSPARENCY_SLOT: Lazy<Slot> = Lazy::new(|| {
    registry::register::<TransparencyAttrib>(
        "TransparencyAttrib",
        18,
        TransparencyAttrib::new(TransparencyMode::None),
        read_transparency,
    )
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransparencyMode {
    None,
    Alpha,
    PremultipliedAlpha,
    Multisample,
    Binary,
    Dual,
}

impl TransparencyMode {
    /// Whether this mode requires back-to-front sorting, and therefore the
    /// transparent bin.
    #[must_use]
    pub fn needs_sorting(self) -> bool {
        matches!(
            self,
            TransparencyMode::Alpha | TransparencyMode::PremultipliedAlpha | TransparencyMode::Dual
        )
    }
}

/// Transparency blending mode.
#[derive(Debug)]
pub struct TransparencyAttrib {
    pub mode: TransparencyMode,
}

impl TransparencyAttrib {
    #[must_use]
    pub fn new(mode: TransparencyMode) -> AttribRef {
        attrib::return_new(Self { mode })
    }

    #[must_use]
    pub fn slot() -> Slot {
        *TRANSPARENCY_SLOT
    }
}

impl Attrib for TransparencyAttrib {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn slot(&self) -> Slot {
        *TRANSPARENCY_SLOT
    }

    fn kind_name(&self) -> &'static str {
        "TransparencyAttrib"
    }

    fn compare_value(&self, other: &dyn Attrib) -> Ordering {
        downcast::<Self>(other).map_or(Ordering::Less, |o| self.mode.cmp(&o.mode))
    }

    fn value_hash(&self) -> u64 {
        hash_of(&self.mode)
    }

    fn write_datagram(&self, dg: &mut Datagram) {
        dg.add_u8(self.mode as u8);
    }
}

fn read_transparency(di: &mut DatagramIterator<'_>) -> Result<AttribRef> {
    let mode = match di.get_u8()? {
        0 => TransparencyMode::None,
        1 => TransparencyMode::Alpha,
        2 => TransparencyMode::PremultipliedAlpha,
        3 => TransparencyMode::Multisample,
        4 => TransparencyMode::Binary,
        _ => TransparencyMode::Dual,
    };
    Ok(TransparencyAttrib::new(mode))
}

// ─── CullBinAttrib ───────────────────────────────────────────────────────────

static CULL_BIN_SLOT: Lazy<Slot> = Lazy::new(|| {
    registry::register::<CullBinAttrib>(
        "CullBinAttrib",
        20,
        CullBinAttrib::new("", 0),
        read_cull_bin,
    )
});

/// Explicit cull-bin assignment with an in-bin draw order.
#[derive(Debug)]
pub struct CullBinAttrib {
    pub bin_name: String,
    pub draw_order: i32,
}

impl CullBinAttrib {
    #[must_use]
    pub fn new(bin_name: &str, draw_order: i32) -> AttribRef {
        attrib::return_new(Self {
            bin_name: bin_name.to_string(),
            draw_order,
        })
    }

    #[must_use]
    pub fn slot() -> Slot {
        *CULL_BIN_SLOT
    }
}

impl Attrib for CullBinAttrib {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn slot(&self) -> Slot {
        *CULL_BIN_SLOT
    }

    fn kind_name(&self) -> &'static str {
        "CullBinAttrib"
    }

    fn compare_value(&self, other: &dyn Attrib) -> Ordering {
        downcast::<Self>(other).map_or(Ordering::Less, |o| {
            self.bin_name
                .cmp(&o.bin_name)
                .then(self.draw_order.cmp(&o.draw_order))
        })
    }

    fn value_hash(&self) -> u64 {
        hash_of(&(&self.bin_name, self.draw_order))
    }

    fn write_datagram(&self, dg: &mut Datagram) {
        dg.add_string(&self.bin_name);
        dg.add_i32(self.draw_order);
    }
}

fn read_cull_bin(di: &mut DatagramIterator<'_>) -> Result<AttribRef> {
    let bin_name = di.get_string()?;
    let draw_order = di.get_i32()?;
    Ok(CullBinAttrib::new(&bin_name, draw_order))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_values_intern_to_one_pointer() {
        register_builtins();
        let a = ColorAttrib::new([0.5, 0.25, 0.0, 1.0]);
        let b = ColorAttrib::new([0.5, 0.25, 0.0, 1.0]);
        let c = ColorAttrib::new([0.5, 0.25, 0.1, 1.0]);
        assert!(attrib::ptr_eq(&a, &b));
        assert!(!attrib::ptr_eq(&a, &c));
    }

    #[test]
    fn builtin_slots_are_distinct() {
        register_builtins();
        let slots = [
            ColorAttrib::slot(),
            DepthWriteAttrib::slot(),
            RenderModeAttrib::slot(),
            TexMatrixAttrib::slot(),
            TexGenAttrib::slot(),
            TransparencyAttrib::slot(),
            CullBinAttrib::slot(),
        ];
        for (i, a) in slots.iter().enumerate() {
            assert!(a.index() >= 1);
            for b in &slots[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
