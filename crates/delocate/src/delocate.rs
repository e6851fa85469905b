//! Copying and relinking of external library dependencies.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::DelocateError;
use crate::fs::canonicalize_if_exists;
use crate::graph::{DependencyGraph, DependencyKind, ScanOptions};
use crate::macho::{
    change_install_id, change_install_name, delete_rpath, is_macho_file, parse_macho, Arch,
    MacOSVersion,
};
use crate::resolve::ResolveContext;

/// Where copied libraries are placed within a wheel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SidecarPolicy {
    /// One sidecar directory inside each top-level package that needs one.
    #[default]
    PerPackage,
    /// A single sidecar directory at the wheel root.
    WheelRoot,
}

/// Options for delocate operations.
#[derive(Debug, Clone)]
pub struct DelocateOptions {
    /// Name of the sidecar directory created inside package roots.
    pub lib_sdir: String,
    /// Libraries whose path contains any of these strings are not copied.
    pub exclude: Vec<String>,
    /// Only inspect files with known dynamic library extensions.
    pub dylibs_only: bool,
    /// An alternative directory for resolving `@executable_path`.
    pub executable_path: Option<PathBuf>,
    /// Architectures that every Mach-O file must provide after delocation.
    pub require_archs: Vec<Arch>,
    /// Fail if a copied library requires a newer macOS than this.
    pub require_target_macos_version: Option<MacOSVersion>,
    pub sidecar_policy: SidecarPolicy,
    /// Demote unresolved dependencies to warnings.
    pub ignore_missing: bool,
}

impl Default for DelocateOptions {
    fn default() -> Self {
        Self {
            lib_sdir: ".dylibs".to_string(),
            exclude: Vec::new(),
            dylibs_only: false,
            executable_path: None,
            require_archs: Vec::new(),
            require_target_macos_version: None,
            sidecar_policy: SidecarPolicy::default(),
            ignore_missing: false,
        }
    }
}

impl DelocateOptions {
    pub(crate) fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            executable_path: self.executable_path.clone(),
            dylibs_only: self.dylibs_only,
            exclude: self.exclude.clone(),
        }
    }
}

/// Copied library source paths, each mapped to the loaders that referenced
/// it and the raw install name each loader used.
pub type CopiedLibraries = BTreeMap<PathBuf, BTreeMap<PathBuf, String>>;

/// Maps each loader to the sidecar directory its copies are placed in.
#[derive(Debug)]
pub(crate) struct SidecarLayout {
    /// Top-level package roots, most specific first. Empty when a single
    /// fallback sidecar serves the whole tree.
    package_roots: Vec<PathBuf>,
    lib_sdir: String,
    /// Sidecar for loaders outside every package root.
    fallback: PathBuf,
}

impl SidecarLayout {
    pub(crate) fn single(sidecar: &Path) -> Self {
        Self {
            package_roots: Vec::new(),
            lib_sdir: String::new(),
            fallback: canonicalize_parent(sidecar),
        }
    }

    pub(crate) fn per_package(package_roots: Vec<PathBuf>, lib_sdir: &str, fallback: &Path) -> Self {
        Self {
            package_roots,
            lib_sdir: lib_sdir.to_string(),
            fallback: fallback.to_path_buf(),
        }
    }

    fn sidecar_for(&self, loader: &Path) -> PathBuf {
        for root in &self.package_roots {
            if loader.starts_with(root) {
                return root.join(&self.lib_sdir);
            }
        }
        self.fallback.clone()
    }
}

/// Resolve symlinks in the existing part of a path that may not exist yet.
///
/// Sidecar directories are created on demand; comparing them against the
/// canonicalized tree root only works if their parent is canonical too.
fn canonicalize_parent(path: &Path) -> PathBuf {
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => canonicalize_if_exists(parent).join(name),
        _ => path.to_path_buf(),
    }
}

/// Copy required libraries for files under `tree_path` into `lib_path`, and
/// rewrite every reference to resolve via `@loader_path`.
///
/// Libraries already inside the tree stay where they are; their references
/// are rewritten to relative form. Returns the copied libraries keyed by
/// their original path.
pub fn delocate_path(
    tree_path: &Path,
    lib_path: &Path,
    options: &DelocateOptions,
) -> Result<CopiedLibraries, DelocateError> {
    let copied = delocate_tree(tree_path, &SidecarLayout::single(lib_path), options)?;
    if !options.require_archs.is_empty() {
        verify_archs(tree_path, &options.require_archs)?;
    }
    Ok(copied)
}

/// One delocation run over a staging tree. Passes repeat until a full pass
/// performs no copies: a copied library may itself pull in further external
/// dependencies.
pub(crate) fn delocate_tree(
    tree_path: &Path,
    layout: &SidecarLayout,
    options: &DelocateOptions,
) -> Result<CopiedLibraries, DelocateError> {
    let root = canonicalize_if_exists(tree_path);
    let scan_options = options.scan_options();
    let mut copied: CopiedLibraries = BTreeMap::new();
    // Copy destination for every (sidecar, source) pair handled so far.
    let mut copies: FxHashMap<(PathBuf, PathBuf), PathBuf> = FxHashMap::default();
    // Every in-tree copy that exists of an external library.
    let mut copy_sites: FxHashMap<PathBuf, Vec<PathBuf>> = FxHashMap::default();
    // Basenames claimed in each sidecar, to detect collisions.
    let mut claimed: FxHashMap<PathBuf, FxHashMap<String, PathBuf>> = FxHashMap::default();

    loop {
        let graph = DependencyGraph::build(&root, &scan_options)?;

        let unresolved = graph.unresolved();
        if let Some(first) = unresolved.first() {
            if options.ignore_missing {
                warn!("Ignoring {} missing dependencies", unresolved.len());
            } else {
                return Err(DelocateError::DependencyNotFound {
                    install_name: first.install_name.clone(),
                    loader: first.loader.clone(),
                });
            }
        }

        let dependencies = graph.dependencies();
        let mut copies_this_pass = 0usize;

        // The in-tree files that stand for a loader: the loader itself when
        // it is inside the tree, otherwise every copy made of it. Files
        // outside the tree are never modified.
        let loader_sites = |loader: &Path,
                            copy_sites: &FxHashMap<PathBuf, Vec<PathBuf>>|
         -> Vec<PathBuf> {
            if loader.starts_with(&root) {
                vec![loader.to_path_buf()]
            } else {
                copy_sites.get(loader).cloned().unwrap_or_default()
            }
        };

        // Copy external libraries, chasing chains within the pass: copying
        // a library creates a new loader site whose own dependencies may
        // then need copying next to it.
        loop {
            let mut progressed = false;
            for dependency in &dependencies {
                if dependency.kind != DependencyKind::External {
                    continue;
                }
                for loader in dependency.dependents.keys() {
                    for site in loader_sites(loader, &copy_sites) {
                        let sidecar = layout.sidecar_for(&site);
                        let key = (sidecar.clone(), dependency.path.clone());
                        if copies.contains_key(&key) {
                            continue;
                        }
                        let copy = copy_library(
                            &dependency.path,
                            &sidecar,
                            &root,
                            claimed.entry(sidecar.clone()).or_default(),
                        )?;
                        copies.insert(key, copy.clone());
                        copy_sites
                            .entry(dependency.path.clone())
                            .or_default()
                            .push(copy);
                        copies_this_pass += 1;
                        progressed = true;
                    }
                }
            }
            if !progressed {
                break;
            }
        }

        // Copies are fully flushed and self-named before any reference is
        // rewritten, so every rewrite sees a consistent tree.
        let mut rewrites: Vec<(PathBuf, String, String)> = Vec::new();
        for dependency in &dependencies {
            match dependency.kind {
                DependencyKind::System => {}
                DependencyKind::Within => {
                    // In-tree libraries stay in place; every reference is
                    // normalized to a loader-relative form.
                    for (loader, names) in &dependency.dependents {
                        for site in loader_sites(loader, &copy_sites) {
                            let new_name = loader_relative(&dependency.path, &site)?;
                            for old_name in names {
                                if *old_name != new_name {
                                    rewrites.push((
                                        site.clone(),
                                        old_name.clone(),
                                        new_name.clone(),
                                    ));
                                }
                            }
                        }
                    }
                }
                DependencyKind::External => {
                    for (loader, names) in &dependency.dependents {
                        for site in loader_sites(loader, &copy_sites) {
                            let sidecar = layout.sidecar_for(&site);
                            let Some(copy) =
                                copies.get(&(sidecar, dependency.path.clone()))
                            else {
                                continue;
                            };
                            let new_name = loader_relative(copy, &site)?;
                            for old_name in names {
                                if *old_name != new_name {
                                    rewrites.push((
                                        site.clone(),
                                        old_name.clone(),
                                        new_name.clone(),
                                    ));
                                }
                            }
                        }
                        copied
                            .entry(dependency.path.clone())
                            .or_default()
                            .entry(loader.clone())
                            .or_insert_with(|| names.first().cloned().unwrap_or_default());
                    }
                }
            }
        }

        for (site, old_name, new_name) in rewrites {
            info!(
                "Modifying install name in {} from {} to {}",
                site.strip_prefix(&root).unwrap_or(&site).display(),
                old_name,
                new_name
            );
            change_install_name(&site, &old_name, &new_name)?;
        }

        if copies_this_pass == 0 {
            break;
        }
    }

    strip_external_rpaths(&root, options)?;

    Ok(copied)
}

/// Copy `source` into `sidecar`, preserving its mode plus the write bit,
/// and give the copy a self-referential install id.
fn copy_library(
    source: &Path,
    sidecar: &Path,
    root: &Path,
    claimed: &mut FxHashMap<String, PathBuf>,
) -> Result<PathBuf, DelocateError> {
    let basename = source
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| DelocateError::DependencyNotFound {
            install_name: source.display().to_string(),
            loader: root.to_path_buf(),
        })?;

    // Two distinct libraries may share a basename; the loser is renamed
    // with a digest of its source path.
    let name = match claimed.get(basename) {
        Some(existing) if existing == source => basename.to_string(),
        Some(_) => format!("{}-{basename}", path_digest(source)),
        None => {
            claimed.insert(basename.to_string(), source.to_path_buf());
            basename.to_string()
        }
    };

    fs_err::create_dir_all(sidecar)?;
    let destination = sidecar.join(&name);
    if destination.exists() && !files_equal(source, &destination)? {
        // A foreign file already sits at the destination; keep it and
        // disambiguate the copy.
        let name = format!("{}-{basename}", path_digest(source));
        return copy_named(source, &sidecar.join(name), root);
    }
    copy_named(source, &destination, root)
}

fn copy_named(source: &Path, destination: &Path, root: &Path) -> Result<PathBuf, DelocateError> {
    info!(
        "Copying library {} to {}",
        source.display(),
        destination
            .strip_prefix(root)
            .unwrap_or(destination)
            .display()
    );
    fs_err::copy(source, destination)?;
    #[cfg(unix)]
    {
        use std::fs::Permissions;
        use std::os::unix::fs::PermissionsExt;
        let mode = fs_err::metadata(source)?.permissions().mode();
        fs_err::set_permissions(destination, Permissions::from_mode(mode | 0o200))?;
    }
    let name = destination
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default();
    change_install_id(destination, &format!("@loader_path/{name}"))?;
    Ok(destination.to_path_buf())
}

/// The `@loader_path`-relative reference from `loader` to `target`.
fn loader_relative(target: &Path, loader: &Path) -> Result<String, DelocateError> {
    let loader_dir = loader.parent().unwrap_or(Path::new("/"));
    let relative = pathdiff::diff_paths(target, loader_dir).ok_or_else(|| {
        DelocateError::PathOutsideTree {
            path: target.to_path_buf(),
            root: loader_dir.to_path_buf(),
        }
    })?;
    Ok(format!("@loader_path/{}", relative.display()))
}

/// Remove `LC_RPATH` entries that point outside the tree. References have
/// all been rewritten to fully resolved `@loader_path` forms, so external
/// search paths are never needed again.
fn strip_external_rpaths(root: &Path, options: &DelocateOptions) -> Result<(), DelocateError> {
    let executable_path = options
        .executable_path
        .clone()
        .map(|path| canonicalize_if_exists(&path))
        .unwrap_or_else(|| root.to_path_buf());

    for entry in walkdir::WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() || !is_macho_file(path)? {
            continue;
        }
        let macho = parse_macho(path)?;
        if macho.rpaths.is_empty() {
            continue;
        }
        let ctx = ResolveContext::new(
            path.parent().unwrap_or(Path::new("/")).to_path_buf(),
            executable_path.clone(),
        );
        for rpath in &macho.rpaths {
            let resolved = ctx.resolve_rpath_entry(rpath);
            if !resolved.starts_with(root) {
                info!(
                    "Deleting rpath {} from {}",
                    rpath,
                    path.strip_prefix(root).unwrap_or(path).display()
                );
                delete_rpath(path, rpath)?;
            }
        }
    }
    Ok(())
}

/// An 8-hex-digit digest of a path, used to disambiguate basename
/// collisions among copied libraries.
fn path_digest(path: &Path) -> String {
    let digest = Sha256::digest(path.as_os_str().as_encoded_bytes());
    let mut out = String::with_capacity(8);
    for byte in &digest[..4] {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn files_equal(left: &Path, right: &Path) -> Result<bool, DelocateError> {
    Ok(fs_err::read(left)? == fs_err::read(right)?)
}

/// Verify that every Mach-O file under `root` provides all of
/// `require_archs`, reporting every deficit at once.
pub fn verify_archs(root: &Path, require_archs: &[Arch]) -> Result<(), DelocateError> {
    let root = canonicalize_if_exists(root);
    let mut reports = Vec::new();
    for entry in walkdir::WalkDir::new(&root).sort_by_file_name() {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() || !is_macho_file(path)? {
            continue;
        }
        let macho = parse_macho(path)?;
        let missing: Vec<Arch> = require_archs
            .iter()
            .copied()
            .filter(|arch| !macho.archs.contains(arch))
            .collect();
        if !missing.is_empty() {
            reports.push(format!(
                "Required {} {} missing from {}",
                if missing.len() > 1 { "archs" } else { "arch" },
                missing
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", "),
                path.strip_prefix(&root).unwrap_or(path).display()
            ));
        }
    }
    if reports.is_empty() {
        Ok(())
    } else {
        Err(DelocateError::ArchitectureDeficit {
            report: reports.join("\n"),
        })
    }
}
