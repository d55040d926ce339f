//! Config Page Manager
//!
//! Process-wide owner of the page stack. Implicit pages are discovered on
//! the prc search path (built from environment conventions, optionally
//! superseded by a host-registered [`BlobInfo`]), loaded lowest-priority
//! first so the most important file ends up at the head of the stack.
//! Explicit pages are created and deleted by user code.
//!
//! Directory names may carry an `<auto>` prefix, resolved by scanning
//! upward from the executable's directory (then from `MAIN_DIR`) until a
//! directory is found whose suffix child contains a matching file.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::{env, fs};

use globset::{Glob, GlobSet, GlobSetBuilder};
use log::{error, warn};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::prc::crypt;
use crate::prc::page::ConfigPage;

// Build-time defaults, overridden by the environment, superseded by BlobInfo.
const DEFAULT_DIR_ENVVARS: &str = "PRC_DIR";
const DEFAULT_PATH_ENVVARS: &str = "PRC_PATH";
const DEFAULT_PATH2_ENVVARS: &str = "";
const DEFAULT_PATTERNS: &str = "*.prc";
const DEFAULT_ENCRYPTED_PATTERNS: &str = "*.prc.pe";
const DEFAULT_EXECUTABLE_PATTERNS: &str = "";
const DEFAULT_PRC_DIR: &str = "<auto>etc";
const DEFAULT_EXECUTABLE_ARGS_ENVVAR: &str = "PRC_EXECUTABLE_ARGS";

const AUTO_PREFIX: &str = "<auto>";

/// Configuration record a host binary may register to bake prc settings
/// into itself. Present fields supersede the matching environment values.
///
/// `num_pointers` counts how many of the string fields (in declaration
/// order) are meaningful; fields beyond it are ignored, and a record with
/// `version == 0` or fewer than 10 pointers is rejected, mirroring the
/// packager contract.
#[derive(Debug, Default, Clone)]
pub struct BlobInfo {
    pub version: u16,
    pub num_pointers: u16,
    pub prc_data: Option<String>,
    pub default_prc_dir: Option<String>,
    pub prc_dir_envvars: Option<String>,
    pub prc_path_envvars: Option<String>,
    pub prc_patterns: Option<String>,
    pub prc_encrypted_patterns: Option<String>,
    pub prc_encryption_key: Option<String>,
    pub prc_executable_patterns: Option<String>,
    pub prc_executable_args_envvar: Option<String>,
    pub main_dir: Option<String>,
    pub log_filename: Option<String>,
}

impl BlobInfo {
    fn validate(mut self) -> Option<Self> {
        if self.version == 0 || self.num_pointers < 10 {
            return None;
        }
        // Zero out the fields the packager did not claim.
        let claimed = self.num_pointers as usize;
        let fields: [&mut Option<String>; 11] = [
            &mut self.prc_data,
            &mut self.default_prc_dir,
            &mut self.prc_dir_envvars,
            &mut self.prc_path_envvars,
            &mut self.prc_patterns,
            &mut self.prc_encrypted_patterns,
            &mut self.prc_encryption_key,
            &mut self.prc_executable_patterns,
            &mut self.prc_executable_args_envvar,
            &mut self.main_dir,
            &mut self.log_filename,
        ];
        for (index, field) in fields.into_iter().enumerate() {
            if index >= claimed {
                *field = None;
            }
        }
        Some(self)
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct FileFlags: u32 {
        const READ    = 1 << 0;
        const DECRYPT = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

struct ConfigFile {
    flags: FileFlags,
    path: PathBuf,
}

struct PatternList {
    globs: GlobSet,
}

impl PatternList {
    fn from_words(words: &str) -> Self {
        let mut builder = GlobSetBuilder::new();
        for word in words.split_whitespace() {
            match Glob::new(word) {
                Ok(glob) => {
                    builder.add(glob);
                }
                Err(err) => warn!("Ignoring invalid prc pattern {word:?}: {err}"),
            }
        }
        let globs = builder.build().unwrap_or_else(|err| {
            warn!("Failed to build prc pattern set: {err}");
            GlobSet::empty()
        });
        Self { globs }
    }

    fn matches(&self, file_name: &str) -> bool {
        self.globs.is_match(file_name)
    }
}

struct ManagerInner {
    implicit_pages: Vec<Arc<ConfigPage>>,
    explicit_pages: Vec<Arc<ConfigPage>>,
    search_path: Vec<PathBuf>,
    next_page_seq: u64,
    pages_sorted: bool,
    loaded_implicit: bool,
    currently_loading: bool,
    blob_info: Option<BlobInfo>,
}

static MANAGER: Lazy<Mutex<ManagerInner>> = Lazy::new(|| {
    Mutex::new(ManagerInner {
        implicit_pages: Vec::new(),
        explicit_pages: Vec::new(),
        search_path: Vec::new(),
        next_page_seq: 1,
        pages_sorted: true,
        loaded_implicit: false,
        currently_loading: false,
        blob_info: None,
    })
});

// Bumped on every page mutation; config variables revalidate their caches
// against it.
static GENERATION: AtomicU64 = AtomicU64::new(0);

/// Invalidates every config variable's cached value.
pub fn invalidate_cache() {
    GENERATION.fetch_add(1, Ordering::Release);
}

// A page's trust level can change when its text is (re)read, so the
// priority order has to be recomputed before the next query.
pub(crate) fn mark_pages_unsorted() {
    MANAGER.lock().pages_sorted = false;
}

pub(crate) fn generation() -> u64 {
    GENERATION.load(Ordering::Acquire)
}

/// Registers the host blob-info record consulted by the next
/// [`reload_implicit_pages`]. An invalid record is dropped with a warning.
pub fn set_blob_info(info: BlobInfo) {
    let validated = info.validate();
    if validated.is_none() {
        warn!("Rejecting blob-info record (bad version or pointer count)");
    }
    MANAGER.lock().blob_info = validated;
}

// setting precedence: blob-info, then environment, then build-time default.
// A variable set to the empty string is an explicit override, not a fall
// through.
fn setting(blob: Option<&String>, env_name: &str, default: &str) -> String {
    if let Some(value) = blob {
        return value.clone();
    }
    env::var(env_name).unwrap_or_else(|_| default.to_string())
}

fn env_value(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}

// ─── <auto> Resolution ───────────────────────────────────────────────────────

/// Scans upward from `start`, looking for a directory whose `suffix` child
/// contains at least one file matching the read or execute patterns.
fn scan_up_from(
    start: &Path,
    suffix: &str,
    read: &PatternList,
    execute: &PatternList,
) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        let consider = if suffix.is_empty() {
            dir.clone()
        } else {
            dir.join(suffix)
        };
        if consider.is_dir() {
            if let Ok(entries) = fs::read_dir(&consider) {
                for entry in entries.flatten() {
                    let file_name = entry.file_name();
                    let Some(name) = file_name.to_str() else {
                        continue;
                    };
                    if read.matches(name) || execute.matches(name) {
                        return Some(consider);
                    }
                }
            }
        }
        if !dir.pop() {
            return None;
        }
    }
}

/// Resolves an `<auto>`-prefixed directory, or passes a plain directory
/// through unchanged. Returns `None` (with a warning) when resolution
/// fails; the directory is then omitted from the search path.
fn scan_auto_prc_dir(dir: &str, read: &PatternList, execute: &PatternList) -> Option<PathBuf> {
    let Some(suffix) = dir.strip_prefix(AUTO_PREFIX) else {
        return Some(PathBuf::from(dir));
    };
    let suffix = suffix.trim_start_matches(['/', '\\']);

    if let Ok(exe) = env::current_exe() {
        if let Some(exe_dir) = exe.parent() {
            if let Some(found) = scan_up_from(exe_dir, suffix, read, execute) {
                return Some(found);
            }
        }
    }
    if let Some(main_dir) = env_value("MAIN_DIR") {
        if let Some(found) = scan_up_from(Path::new(&main_dir), suffix, read, execute) {
            return Some(found);
        }
    }

    warn!("Unable to auto-locate config files in directory named by {dir:?}");
    None
}

// ─── Implicit Page Loading ───────────────────────────────────────────────────

/// Rebuilds the pattern lists and search path, rescans the filesystem, and
/// replaces the entire implicit page set. May be called after startup to
/// force a re-read; a reentrant call is a no-op.
pub fn reload_implicit_pages() {
    let blob = {
        let mut manager = MANAGER.lock();
        if manager.currently_loading {
            return;
        }
        manager.currently_loading = true;
        manager.blob_info.clone()
    };

    let blob_ref = blob.as_ref();
    let patterns = PatternList::from_words(&setting(
        blob_ref.and_then(|b| b.prc_patterns.as_ref()),
        "PRC_PATTERNS",
        DEFAULT_PATTERNS,
    ));
    let encrypted_patterns = PatternList::from_words(&setting(
        blob_ref.and_then(|b| b.prc_encrypted_patterns.as_ref()),
        "PRC_ENCRYPTED_PATTERNS",
        DEFAULT_ENCRYPTED_PATTERNS,
    ));
    let executable_patterns = PatternList::from_words(&setting(
        blob_ref.and_then(|b| b.prc_executable_patterns.as_ref()),
        "PRC_EXECUTABLE_PATTERNS",
        DEFAULT_EXECUTABLE_PATTERNS,
    ));

    // Each word of dir-envvars names a variable holding one directory.
    let mut search_path: Vec<PathBuf> = Vec::new();
    let dir_envvars = setting(
        blob_ref.and_then(|b| b.prc_dir_envvars.as_ref()),
        "PRC_DIR_ENVVARS",
        DEFAULT_DIR_ENVVARS,
    );
    for envvar in dir_envvars.split_whitespace() {
        if let Some(dir) = env_value(envvar) {
            if let Some(resolved) = scan_auto_prc_dir(&dir, &patterns, &executable_patterns) {
                search_path.push(resolved);
            }
        }
    }

    // Each word of path-envvars names a variable holding an OS-separated
    // list of directories.
    let path_envvars = setting(
        blob_ref.and_then(|b| b.prc_path_envvars.as_ref()),
        "PRC_PATH_ENVVARS",
        DEFAULT_PATH_ENVVARS,
    );
    for envvar in path_envvars.split_whitespace() {
        if let Some(path) = env_value(envvar) {
            for dir in env::split_paths(&path) {
                let Some(dir) = dir.to_str() else { continue };
                if dir.is_empty() {
                    continue;
                }
                if let Some(resolved) = scan_auto_prc_dir(dir, &patterns, &executable_patterns) {
                    search_path.push(resolved);
                }
            }
        }
    }

    // Legacy space-delimited convention, ignored when a blob is present.
    if blob.is_none() {
        let path2_envvars = setting(None, "PRC_PATH2_ENVVARS", DEFAULT_PATH2_ENVVARS);
        for envvar in path2_envvars.split_whitespace() {
            if let Some(path) = env_value(envvar) {
                for dir in path.split(' ').filter(|d| !d.is_empty()) {
                    if let Some(resolved) =
                        scan_auto_prc_dir(dir, &patterns, &executable_patterns)
                    {
                        search_path.push(resolved);
                    }
                }
            }
        }
    }

    if search_path.is_empty() {
        let default_dir = setting(
            blob_ref.and_then(|b| b.default_prc_dir.as_ref()),
            "DEFAULT_PRC_DIR",
            DEFAULT_PRC_DIR,
        );
        if !default_dir.is_empty() {
            if let Some(resolved) =
                scan_auto_prc_dir(&default_dir, &patterns, &executable_patterns)
            {
                search_path.push(resolved);
            }
        }
    }

    // Collect matching files, most important directory first, and within a
    // directory in reverse alphabetical order (the alphabetically last
    // file of a directory has the highest priority).
    let mut config_files: Vec<ConfigFile> = Vec::new();
    let mut unique_dirs: FxHashSet<PathBuf> = FxHashSet::default();
    for directory in &search_path {
        if !directory.is_dir() {
            continue;
        }
        let canonical = fs::canonicalize(directory).unwrap_or_else(|_| directory.clone());
        if !unique_dirs.insert(canonical) {
            continue;
        }
        let Ok(entries) = fs::read_dir(directory) else {
            continue;
        };
        let mut names: Vec<String> = entries
            .flatten()
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .collect();
        names.sort();
        for name in names.iter().rev() {
            let mut flags = FileFlags::empty();
            if patterns.matches(name) {
                flags |= FileFlags::READ;
            }
            if encrypted_patterns.matches(name) {
                flags |= FileFlags::READ | FileFlags::DECRYPT;
            }
            if executable_patterns.matches(name) {
                flags |= FileFlags::EXECUTE;
            }
            if !flags.is_empty() {
                config_files.push(ConfigFile {
                    flags,
                    path: directory.join(name),
                });
            }
        }
    }

    let encryption_key = setting(
        blob_ref.and_then(|b| b.prc_encryption_key.as_ref()),
        "PRC_ENCRYPTION_KEY",
        "",
    );
    let executable_args_envvar = setting(
        blob_ref.and_then(|b| b.prc_executable_args_envvar.as_ref()),
        "PRC_EXECUTABLE_ARGS_ENVVAR",
        DEFAULT_EXECUTABLE_ARGS_ENVVAR,
    );

    let mut pages: Vec<Arc<ConfigPage>> = Vec::new();
    let mut seq = 1u64;

    // Inline blob data loads first, as the lowest implicit page.
    if let Some(data) = blob_ref.and_then(|b| b.prc_data.as_ref()) {
        let page = ConfigPage::new("builtin", true, seq);
        seq += 1;
        page.read_prc(data);
        pages.push(page);
    }

    // Walk lowest-priority first so pushing yields highest priority last
    // (the sort below puts the newest sequence numbers at the head).
    for file in config_files.iter().rev() {
        let name = file.path.display().to_string();
        if file.flags.contains(FileFlags::EXECUTE) && is_executable(&file.path) {
            match run_executable_page(&file.path, &executable_args_envvar) {
                Ok(output) => {
                    let page = ConfigPage::new(&name, true, seq);
                    seq += 1;
                    page.read_prc(&output);
                    pages.push(page);
                }
                Err(err) => error!("Unable to execute {name}: {err}"),
            }
        } else if file.flags.contains(FileFlags::DECRYPT) {
            match fs::read(&file.path)
                .map_err(Into::into)
                .and_then(|data| crypt::decrypt_prc_data(&data, &encryption_key))
            {
                Ok(text) => {
                    let page = ConfigPage::new(&name, true, seq);
                    seq += 1;
                    page.read_prc(&text);
                    pages.push(page);
                }
                Err(err) => error!("Unable to read {name}: {err}"),
            }
        } else if file.flags.contains(FileFlags::READ) {
            match fs::read_to_string(&file.path) {
                Ok(text) => {
                    let page = ConfigPage::new(&name, true, seq);
                    seq += 1;
                    page.read_prc(&text);
                    pages.push(page);
                }
                Err(err) => error!("Unable to read {name}: {err}"),
            }
        }
    }

    {
        let mut manager = MANAGER.lock();
        manager.implicit_pages = pages;
        manager.search_path = search_path;
        manager.pages_sorted = false;
        manager.loaded_implicit = true;
        manager.currently_loading = false;
    }
    invalidate_cache();
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::metadata(path).is_ok_and(|m| m.permissions().mode() & 0o111 != 0)
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        true
    }
}

fn run_executable_page(path: &Path, args_envvar: &str) -> crate::errors::Result<String> {
    let mut command = Command::new(path);
    if !args_envvar.is_empty() {
        if let Some(args) = env_value(args_envvar) {
            command.args(args.split_whitespace());
        }
    }
    // stderr passes through to the host process.
    let output = command.stderr(Stdio::inherit()).output()?;
    if !output.status.success() {
        return Err(crate::errors::SagaError::SubprocessError {
            command: path.display().to_string(),
            status: output.status.code().unwrap_or(-1),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

// ─── Page Operations ─────────────────────────────────────────────────────────

fn ensure_implicit_loaded() {
    let needs_load = {
        let manager = MANAGER.lock();
        !manager.loaded_implicit && !manager.currently_loading
    };
    if needs_load {
        reload_implicit_pages();
    }
}

/// Creates a new, empty explicit page stacked on top of every existing
/// page of equal trust.
pub fn make_explicit_page(name: &str) -> Arc<ConfigPage> {
    let page = {
        let mut manager = MANAGER.lock();
        let seq = manager.next_page_seq;
        manager.next_page_seq += 1;
        let page = ConfigPage::new(name, false, seq);
        manager.explicit_pages.push(page.clone());
        manager.pages_sorted = false;
        page
    };
    invalidate_cache();
    page
}

/// Removes a previously created explicit page. Returns false if the page
/// was not found.
pub fn delete_explicit_page(page: &Arc<ConfigPage>) -> bool {
    let removed = {
        let mut manager = MANAGER.lock();
        let position = manager
            .explicit_pages
            .iter()
            .position(|p| Arc::ptr_eq(p, page));
        match position {
            Some(index) => {
                manager.explicit_pages.remove(index);
                true
            }
            None => false,
        }
    };
    if removed {
        invalidate_cache();
    }
    removed
}

#[must_use]
pub fn num_implicit_pages() -> usize {
    MANAGER.lock().implicit_pages.len()
}

#[must_use]
pub fn num_explicit_pages() -> usize {
    MANAGER.lock().explicit_pages.len()
}

/// The directories the last reload searched, after `<auto>` resolution and
/// dedup.
#[must_use]
pub fn search_path() -> Vec<PathBuf> {
    MANAGER.lock().search_path.clone()
}

/// Scans the page stack head-to-tail for the first declaration of
/// `variable`. Explicit pages shadow implicit pages; within each list,
/// higher trust then newer sequence wins.
#[must_use]
pub(crate) fn lookup(variable: &str) -> Option<String> {
    ensure_implicit_loaded();
    let mut manager = MANAGER.lock();
    if !manager.pages_sorted {
        manager.explicit_pages.sort_by_key(|p| p.sort_key());
        manager.implicit_pages.sort_by_key(|p| p.sort_key());
        manager.pages_sorted = true;
    }
    manager
        .explicit_pages
        .iter()
        .chain(manager.implicit_pages.iter())
        .find_map(|page| page.lookup(variable))
}
