//! Typed Config Variables
//!
//! A variable binds a key to a default value and a description. Each query
//! scans the page stack head-to-tail and parses the first matching
//! declaration; the result is cached until the manager's generation
//! counter moves (any page mutation bumps it).
//!
//! `set_value` installs a *local value* that shadows every page, which is
//! how embedders and tests override policy at runtime without touching the
//! page stack.

use log::warn;
use parking_lot::Mutex;

use crate::prc::manager;

struct VarCore {
    key: String,
    #[allow(dead_code)]
    description: &'static str,
    local_value: Mutex<Option<String>>,
    // (generation, resolved raw value) — None means "no page declares it"
    cache: Mutex<Option<(u64, Option<String>)>>,
}

impl VarCore {
    fn new(key: &str, description: &'static str) -> Self {
        Self {
            key: key.to_string(),
            description,
            local_value: Mutex::new(None),
            cache: Mutex::new(None),
        }
    }

    fn resolve(&self) -> Option<String> {
        if let Some(local) = self.local_value.lock().clone() {
            return Some(local);
        }
        let generation = manager::generation();
        {
            let cache = self.cache.lock();
            if let Some((cached_generation, value)) = cache.as_ref() {
                if *cached_generation == generation {
                    return value.clone();
                }
            }
        }
        let value = manager::lookup(&self.key);
        *self.cache.lock() = Some((generation, value.clone()));
        value
    }

    fn set_local(&self, value: Option<String>) {
        *self.local_value.lock() = value;
        manager::invalidate_cache();
    }
}

macro_rules! typed_variable {
    ($(#[$meta:meta])* $name:ident, $ty:ty, $parse:expr, $format:expr) => {
        $(#[$meta])*
        pub struct $name {
            core: VarCore,
            default: $ty,
        }

        impl $name {
            #[must_use]
            pub fn new(key: &str, default: $ty, description: &'static str) -> Self {
                Self {
                    core: VarCore::new(key, description),
                    default,
                }
            }

            /// The effective value: local value, then the highest-priority
            /// page declaring the key, then the default.
            #[must_use]
            #[allow(clippy::redundant_closure_call)]
            pub fn get(&self) -> $ty {
                match self.core.resolve() {
                    Some(raw) => match ($parse)(raw.as_str()) {
                        Some(value) => value,
                        None => {
                            warn!(
                                "Invalid value {raw:?} for config variable {}; using default",
                                self.core.key
                            );
                            self.default.clone()
                        }
                    },
                    None => self.default.clone(),
                }
            }

            /// Installs a local value shadowing every page.
            #[allow(clippy::redundant_closure_call)]
            pub fn set_value(&self, value: $ty) {
                self.core.set_local(Some(($format)(&value)));
            }

            /// Removes the local value, falling back to the page stack.
            pub fn clear_local_value(&self) {
                self.core.set_local(None);
            }

            #[must_use]
            pub fn key(&self) -> &str {
                &self.core.key
            }
        }
    };
}

fn parse_bool(raw: &str) -> Option<bool> {
    if raw.eq_ignore_ascii_case("true") || raw == "1" || raw == "#t" {
        Some(true)
    } else if raw.eq_ignore_ascii_case("false") || raw == "0" || raw == "#f" || raw.is_empty() {
        Some(false)
    } else {
        None
    }
}

typed_variable!(
    /// Boolean variable. Accepts `true`/`false`, `1`/`0`, `#t`/`#f`; an
    /// empty value reads as false.
    ConfigVariableBool,
    bool,
    parse_bool,
    |v: &bool| v.to_string()
);

typed_variable!(
    /// Integer variable.
    ConfigVariableInt,
    i64,
    |raw: &str| raw.parse::<i64>().ok(),
    |v: &i64| v.to_string()
);

typed_variable!(
    /// Floating-point variable.
    ConfigVariableDouble,
    f64,
    |raw: &str| raw.parse::<f64>().ok(),
    |v: &f64| v.to_string()
);

typed_variable!(
    /// String variable; the raw declaration value, whitespace-trimmed.
    ConfigVariableString,
    String,
    |raw: &str| Some(raw.to_string()),
    |v: &String| v.clone()
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_parsing() {
        assert_eq!(parse_bool("true"), Some(true));
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool("#t"), Some(true));
        assert_eq!(parse_bool("false"), Some(false));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("#f"), Some(false));
        assert_eq!(parse_bool(""), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn local_value_shadows_pages_and_default() {
        let var = ConfigVariableInt::new("variable-test-local", 4, "");
        assert_eq!(var.get(), 4);
        var.set_value(9);
        assert_eq!(var.get(), 9);
        var.clear_local_value();
        assert_eq!(var.get(), 4);
    }
}
