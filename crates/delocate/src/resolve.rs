//! Resolution of raw Mach-O dependency references.
//!
//! Dependency strings recorded in load commands may carry the dynamic
//! linker tokens `@executable_path`, `@loader_path`, and `@rpath`. Each is
//! resolved against a [`ResolveContext`] describing the file that performs
//! the load.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::DelocateError;
use crate::fs::canonicalize_if_exists;

/// The search context a reference is resolved against.
#[derive(Debug, Clone)]
pub struct ResolveContext {
    /// The directory of the file performing the load.
    pub loader_path: PathBuf,
    /// The directory substituted for `@executable_path`. For a library tree
    /// with no main program this is the root of the traversal.
    pub executable_path: PathBuf,
    /// The runtime search paths accumulated along the chain of loaders,
    /// each already resolved against the context of the file that declared
    /// it.
    pub rpaths: Vec<PathBuf>,
}

impl ResolveContext {
    pub fn new(loader_path: PathBuf, executable_path: PathBuf) -> Self {
        Self {
            loader_path,
            executable_path,
            rpaths: Vec::new(),
        }
    }

    /// Resolve a raw `LC_RPATH` entry declared by the loader itself.
    ///
    /// Rpath entries may use `@loader_path` and `@executable_path`, but not
    /// `@rpath`.
    pub fn resolve_rpath_entry(&self, rpath: &str) -> PathBuf {
        if let Some(rest) = rpath.strip_prefix("@loader_path/") {
            canonicalize_if_exists(&self.loader_path.join(rest))
        } else if let Some(rest) = rpath.strip_prefix("@executable_path/") {
            canonicalize_if_exists(&self.executable_path.join(rest))
        } else if rpath == "@loader_path" {
            canonicalize_if_exists(&self.loader_path)
        } else if rpath == "@executable_path" {
            canonicalize_if_exists(&self.executable_path)
        } else {
            canonicalize_if_exists(Path::new(rpath))
        }
    }
}

/// The outcome of resolving a raw reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The reference names an existing file.
    Found(PathBuf),
    /// The reference is an absolute path onto the system that need not
    /// exist on the build host (dylibs under `/usr/lib` and `/System` live
    /// in the dyld shared cache).
    System(PathBuf),
}

impl Resolution {
    pub fn path(&self) -> &Path {
        match self {
            Self::Found(path) | Self::System(path) => path,
        }
    }
}

/// Returns `true` if `name` refers to an OS-provided library.
pub fn is_system_path(name: &Path) -> bool {
    name.starts_with("/usr/lib") || name.starts_with("/System")
}

/// Resolve the raw dependency string `name` against `ctx`.
///
/// The canonical (symlink-collapsed) path is returned. Failures carry both
/// the raw string and the loader that requested it.
pub fn resolve_install_name(
    name: &str,
    ctx: &ResolveContext,
    loader: &Path,
) -> Result<Resolution, DelocateError> {
    let not_found = || DelocateError::DependencyNotFound {
        install_name: name.to_string(),
        loader: loader.to_path_buf(),
    };

    if let Some(rest) = name.strip_prefix("@executable_path/") {
        let candidate = ctx.executable_path.join(rest);
        if candidate.is_file() {
            return Ok(Resolution::Found(canonicalize_if_exists(&candidate)));
        }
        return Err(not_found());
    }

    if let Some(rest) = name.strip_prefix("@loader_path/") {
        let candidate = ctx.loader_path.join(rest);
        if candidate.is_file() {
            return Ok(Resolution::Found(canonicalize_if_exists(&candidate)));
        }
        return Err(not_found());
    }

    if let Some(rest) = name.strip_prefix("@rpath/") {
        for rpath in &ctx.rpaths {
            let candidate = rpath.join(rest);
            if candidate.is_file() {
                debug!("{} resolved to: {}", name, candidate.display());
                return Ok(Resolution::Found(canonicalize_if_exists(&candidate)));
            }
        }
        return Err(not_found());
    }

    let path = Path::new(name);
    if path.is_absolute() {
        // dyld searches DYLD_LIBRARY_PATH by basename before the literal
        // path, and DYLD_FALLBACK_LIBRARY_PATH after it.
        for candidate in environment_candidates(path, "DYLD_LIBRARY_PATH") {
            if candidate.is_file() {
                return Ok(Resolution::Found(canonicalize_if_exists(&candidate)));
            }
        }
        if path.is_file() {
            return Ok(Resolution::Found(canonicalize_if_exists(path)));
        }
        for candidate in environment_candidates(path, "DYLD_FALLBACK_LIBRARY_PATH") {
            if candidate.is_file() {
                return Ok(Resolution::Found(canonicalize_if_exists(&candidate)));
            }
        }
        if is_system_path(path) {
            return Ok(Resolution::System(path.to_path_buf()));
        }
        return Err(not_found());
    }

    // A relative reference means no install id was ever baked into the
    // dependency. It loads only by accident, relative to the process
    // working directory, so it is malformed for distribution purposes. A
    // file of the same basename next to the loader is accepted so the tree
    // can be repaired; anything else is unresolvable.
    let adjacent = ctx.loader_path.join(name);
    if adjacent.is_file() {
        return Ok(Resolution::Found(canonicalize_if_exists(&adjacent)));
    }
    for candidate in environment_candidates(path, "DYLD_LIBRARY_PATH") {
        if candidate.is_file() {
            return Ok(Resolution::Found(canonicalize_if_exists(&candidate)));
        }
    }
    for candidate in environment_candidates(path, "DYLD_FALLBACK_LIBRARY_PATH") {
        if candidate.is_file() {
            return Ok(Resolution::Found(canonicalize_if_exists(&candidate)));
        }
    }
    Err(not_found())
}

/// Candidate paths for `name` from a colon-separated environment variable,
/// searched by basename.
fn environment_candidates(name: &Path, variable: &str) -> Vec<PathBuf> {
    let Some(basename) = name.file_name() else {
        return Vec::new();
    };
    let Ok(value) = std::env::var(variable) else {
        return Vec::new();
    };
    value
        .split(':')
        .filter(|entry| !entry.is_empty())
        .map(|entry| Path::new(entry).join(basename))
        .collect()
}

/// Search paths contributed by the environment, appended after a file's own
/// `LC_RPATH` entries.
pub(crate) fn environment_rpaths() -> Vec<PathBuf> {
    ["DYLD_LIBRARY_PATH", "DYLD_FALLBACK_LIBRARY_PATH"]
        .iter()
        .filter_map(|variable| std::env::var(variable).ok())
        .flat_map(|value| {
            value
                .split(':')
                .filter(|entry| !entry.is_empty())
                .map(PathBuf::from)
                .collect::<Vec<_>>()
        })
        .collect()
}
