//! Config Pages
//!
//! A page is one logical batch of variable declarations loaded from a
//! single source: a file on the search path, the inline builtin blob, a
//! subprocess's stdout, or user code. Pages form a priority-ordered stack;
//! the page at the head shadows declarations in every page below it.

use std::cmp::Reverse;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::prc::{keys, manager};

/// One `variable value` line of a page, with its source line number.
#[derive(Debug, Clone)]
pub struct Declaration {
    pub variable: String,
    pub value: String,
    pub line: usize,
}

#[derive(Default)]
struct PageInner {
    declarations: Vec<Declaration>,
    signature: String,
    trust_level: u32,
}

/// One batch of declarations from a single source.
pub struct ConfigPage {
    name: String,
    implicit: bool,
    seq: u64,
    inner: RwLock<PageInner>,
}

impl ConfigPage {
    pub(crate) fn new(name: &str, implicit: bool, seq: u64) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            implicit,
            seq,
            inner: RwLock::new(PageInner::default()),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Implicit pages come from the filesystem scan and are replaced
    /// wholesale by the next reload; explicit pages are user-created.
    #[must_use]
    pub fn is_implicit(&self) -> bool {
        self.implicit
    }

    /// Sequence number within the page's list; later pages shadow earlier
    /// ones of the same trust level.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Number of keys that validated this page's signature.
    #[must_use]
    pub fn trust_level(&self) -> u32 {
        self.inner.read().trust_level
    }

    #[must_use]
    pub fn signature(&self) -> String {
        self.inner.read().signature.clone()
    }

    #[must_use]
    pub fn num_declarations(&self) -> usize {
        self.inner.read().declarations.len()
    }

    /// Parses prc text into this page, replacing any previous contents.
    ///
    /// Lines starting with `#` are comments; `##!` lines form the trailing
    /// signature block; anything else is `variable value-to-end-of-line`.
    pub fn read_prc(&self, text: &str) {
        let mut declarations = Vec::new();
        let mut signature = String::new();
        let mut body = String::new();

        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if let Some(sig_part) = line.strip_prefix("##!") {
                signature.push_str(sig_part.trim());
                continue;
            }
            body.push_str(raw);
            body.push('\n');
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (variable, value) = match line.split_once(char::is_whitespace) {
                Some((name, rest)) => (name, rest.trim()),
                None => (line, ""),
            };
            declarations.push(Declaration {
                variable: variable.to_string(),
                value: value.to_string(),
                line: index + 1,
            });
        }

        let trust_level = if signature.is_empty() {
            0
        } else {
            keys::count_matches(&body, &signature)
        };

        let mut inner = self.inner.write();
        inner.declarations = declarations;
        inner.signature = signature;
        inner.trust_level = trust_level;
        drop(inner);

        manager::mark_pages_unsorted();
        manager::invalidate_cache();
    }

    /// Appends one declaration directly, shadowing nothing within the page
    /// (the first declaration for a variable wins).
    pub fn make_declaration(&self, variable: &str, value: &str) {
        let mut inner = self.inner.write();
        let line = inner.declarations.len() + 1;
        inner.declarations.push(Declaration {
            variable: variable.to_string(),
            value: value.to_string(),
            line,
        });
        drop(inner);
        manager::invalidate_cache();
    }

    /// Removes every declaration for `variable`. Returns true if any was
    /// present.
    pub fn clear_declaration(&self, variable: &str) -> bool {
        let mut inner = self.inner.write();
        let before = inner.declarations.len();
        inner.declarations.retain(|d| d.variable != variable);
        let changed = inner.declarations.len() != before;
        drop(inner);
        if changed {
            manager::invalidate_cache();
        }
        changed
    }

    /// First declaration matching `variable`, if any.
    #[must_use]
    pub(crate) fn lookup(&self, variable: &str) -> Option<String> {
        self.inner
            .read()
            .declarations
            .iter()
            .find(|d| d.variable == variable)
            .map(|d| d.value.clone())
    }

    /// Snapshot of the page's declarations.
    #[must_use]
    pub fn declarations(&self) -> Vec<Declaration> {
        self.inner.read().declarations.clone()
    }

    // Priority within a list: trusted pages first, then newest first.
    pub(crate) fn sort_key(&self) -> (Reverse<u32>, Reverse<u64>) {
        (Reverse(self.trust_level()), Reverse(self.seq))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_declarations_and_comments() {
        let page = ConfigPage::new("test", false, 1);
        page.read_prc("# a comment\nquality-level 5\n\nwindow-title Hello World\n");
        assert_eq!(page.num_declarations(), 2);
        assert_eq!(page.lookup("quality-level"), Some("5".to_string()));
        assert_eq!(page.lookup("window-title"), Some("Hello World".to_string()));
        assert_eq!(page.lookup("missing"), None);
    }

    #[test]
    fn bare_variable_has_empty_value() {
        let page = ConfigPage::new("test", false, 1);
        page.read_prc("want-dev\n");
        assert_eq!(page.lookup("want-dev"), Some(String::new()));
    }

    #[test]
    fn first_declaration_wins_within_a_page() {
        let page = ConfigPage::new("test", false, 1);
        page.read_prc("quality-level 5\nquality-level 9\n");
        assert_eq!(page.lookup("quality-level"), Some("5".to_string()));
    }

    #[test]
    fn signature_block_sets_trust_level() {
        keys::record_key("page-test", b"page-test-key");
        let body = "quality-level 5\n";
        let sig = keys::sign(body, b"page-test-key");
        let page = ConfigPage::new("signed", true, 1);
        page.read_prc(&format!("{body}##!{sig}\n"));
        assert!(page.trust_level() >= 1);

        let unsigned = ConfigPage::new("unsigned", true, 2);
        unsigned.read_prc(body);
        assert_eq!(unsigned.trust_level(), 0);
    }
}
