//! State Core Policy Variables
//!
//! The tunables that govern interning, composition caching, cycle breaking
//! and garbage collection, each backed by the prc page stack.

use once_cell::sync::Lazy;

use crate::prc::{ConfigVariableBool, ConfigVariableDouble};

/// Whether composition results are memoized at all. With this off,
/// `compose` and `invert_compose` recompute every time and states are not
/// interned.
pub fn state_cache() -> bool {
    static VAR: Lazy<ConfigVariableBool> = Lazy::new(|| {
        ConfigVariableBool::new(
            "state-cache",
            true,
            "Set this false to disable the composition cache and state \
             interning entirely. Normally only useful to rule the cache out \
             while debugging.",
        )
    });
    VAR.get()
}

/// Whether structurally equal states are collapsed to one canonical
/// pointer.
pub fn uniquify_states() -> bool {
    static VAR: Lazy<ConfigVariableBool> = Lazy::new(|| {
        ConfigVariableBool::new(
            "uniquify-states",
            true,
            "Set this true to ensure that equivalent render states share a \
             single pointer, so that pointer equality implies value \
             equality.",
        )
    });
    VAR.get()
}

/// Whether equal attribute values are collapsed to one canonical pointer
/// at construction time. When false, attributes are canonicalized late,
/// as a state enters the intern table.
pub fn uniquify_attribs() -> bool {
    static VAR: Lazy<ConfigVariableBool> = Lazy::new(|| {
        ConfigVariableBool::new(
            "uniquify-attribs",
            true,
            "Set this true to ensure that equivalent render attributes \
             share a single pointer.",
        )
    });
    VAR.get()
}

/// Whether state lifetime is managed by periodic `garbage_collect()`
/// sweeps instead of eager removal on the last reference drop.
pub fn garbage_collect_states() -> bool {
    static VAR: Lazy<ConfigVariableBool> = Lazy::new(|| {
        ConfigVariableBool::new(
            "garbage-collect-states",
            true,
            "Set this true to defer reclamation of unused render states to \
             a periodic garbage_collect() call, instead of tracking every \
             reference drop through the states lock.",
        )
    });
    VAR.get()
}

/// Fraction of the intern table each `garbage_collect()` sweep examines.
pub fn garbage_collect_states_rate() -> f64 {
    static VAR: Lazy<ConfigVariableDouble> = Lazy::new(|| {
        ConfigVariableDouble::new(
            "garbage-collect-states-rate",
            1.0,
            "The fraction of the intern table scanned by each \
             garbage_collect() sweep.",
        )
    });
    VAR.get()
}

/// Whether reference cycles through the composition cache are detected and
/// broken when a state's external references go away.
pub fn auto_break_cycles() -> bool {
    static VAR: Lazy<ConfigVariableBool> = Lazy::new(|| {
        ConfigVariableBool::new(
            "auto-break-cycles",
            true,
            "Set this true to automatically detect and break reference \
             cycles in the composition cache. With this false, cycles can \
             keep groups of otherwise-unused states alive until \
             clear_cache() is called.",
        )
    });
    VAR.get()
}
