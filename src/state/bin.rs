//! Cull Bin Registry
//!
//! Maps bin names to dense indices for `get_bin_index`. States that name a
//! bin nobody registered get a new unsorted bin on the fly, with a
//! warning, so a typo degrades to odd draw order instead of a failure.

use log::warn;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

/// How draw calls within a bin are ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinSort {
    Unsorted,
    StateSorted,
    BackToFront,
    FrontToBack,
    Fixed,
}

struct Bin {
    name: String,
    sort_type: BinSort,
    sort: i32,
}

static BINS: Lazy<Mutex<Vec<Bin>>> = Lazy::new(|| {
    Mutex::new(vec![
        Bin {
            name: "background".to_string(),
            sort_type: BinSort::Fixed,
            sort: 10,
        },
        Bin {
            name: "opaque".to_string(),
            sort_type: BinSort::StateSorted,
            sort: 20,
        },
        Bin {
            name: "transparent".to_string(),
            sort_type: BinSort::BackToFront,
            sort: 30,
        },
        Bin {
            name: "fixed".to_string(),
            sort_type: BinSort::Fixed,
            sort: 40,
        },
        Bin {
            name: "unsorted".to_string(),
            sort_type: BinSort::Unsorted,
            sort: 50,
        },
    ])
});

/// Index of a named bin, if registered.
#[must_use]
pub fn find_bin(name: &str) -> Option<usize> {
    BINS.lock().iter().position(|bin| bin.name == name)
}

/// Registers a new bin and returns its index. A bin already registered
/// under the name keeps its index.
pub fn add_bin(name: &str, sort_type: BinSort, sort: i32) -> usize {
    let mut bins = BINS.lock();
    if let Some(index) = bins.iter().position(|bin| bin.name == name) {
        return index;
    }
    bins.push(Bin {
        name: name.to_string(),
        sort_type,
        sort,
    });
    bins.len() - 1
}

/// Find-or-create used by bin-index derivation.
pub(crate) fn find_or_create(name: &str) -> usize {
    if let Some(index) = find_bin(name) {
        return index;
    }
    warn!("No bin named {name}; creating default bin.");
    add_bin(name, BinSort::Unsorted, 0)
}

#[must_use]
pub fn bin_name(index: usize) -> Option<String> {
    BINS.lock().get(index).map(|bin| bin.name.clone())
}

#[must_use]
pub fn bin_sort_type(index: usize) -> Option<BinSort> {
    BINS.lock().get(index).map(|bin| bin.sort_type)
}

#[must_use]
pub fn bin_sort(index: usize) -> Option<i32> {
    BINS.lock().get(index).map(|bin| bin.sort)
}

#[must_use]
pub fn num_bins() -> usize {
    BINS.lock().len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_bins_are_seeded() {
        assert!(find_bin("opaque").is_some());
        assert!(find_bin("transparent").is_some());
        assert!(find_bin("no-such-bin").is_none());
    }

    #[test]
    fn unknown_bin_is_created_once() {
        let first = find_or_create("bin-test-glow");
        let second = find_or_create("bin-test-glow");
        assert_eq!(first, second);
        assert_eq!(bin_sort_type(first), Some(BinSort::Unsorted));
    }
}
