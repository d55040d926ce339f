#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod attrib;
pub mod errors;
pub mod prc;
pub mod state;
pub mod wire;

pub(crate) mod utils;

pub use attrib::kinds::{
    ColorAttrib, CullBinAttrib, DepthWriteAttrib, RenderMode, RenderModeAttrib, TexGenAttrib,
    TexGenMode, TexMatrixAttrib, TransparencyAttrib, TransparencyMode,
};
pub use attrib::registry::{Slot, SlotMask, MAX_SLOTS};
pub use attrib::{Attrib, AttribRef, GeomRendering};
pub use errors::{Result, SagaError};
pub use prc::{BlobInfo, ConfigPage, ConfigVariableBool, ConfigVariableDouble, ConfigVariableInt,
    ConfigVariableString};
pub use state::interner::{clear_cache, garbage_collect, get_num_unused_states, num_states,
    validate_states};
pub use state::{AttribEntry, RenderState, StateRef};
pub use wire::{Datagram, DatagramIterator};
