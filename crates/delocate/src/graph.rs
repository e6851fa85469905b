//! Transitive dependency analysis over a directory tree.
//!
//! The graph is an arena of file records keyed by canonical path, with
//! adjacency stored as arena indices. References that cannot be resolved
//! are kept in a side table so callers can report every missing dependency
//! at once.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};

use rustc_hash::FxHashMap;
use tracing::{debug, error};

use crate::error::DelocateError;
use crate::fs::canonicalize_if_exists;
use crate::macho::{is_macho_file, parse_macho, MachOFile};
use crate::resolve::{
    environment_rpaths, is_system_path, resolve_install_name, Resolution, ResolveContext,
};

/// Which files are inspected and which dependencies are followed.
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// An alternative directory for resolving `@executable_path`. Defaults
    /// to the root of the traversal.
    pub executable_path: Option<PathBuf>,
    /// Only inspect files with known dynamic library extensions.
    pub dylibs_only: bool,
    /// Dependencies whose path contains any of these strings are neither
    /// followed nor reported.
    pub exclude: Vec<String>,
}

impl ScanOptions {
    fn inspects(&self, path: &Path) -> bool {
        if !self.dylibs_only {
            return true;
        }
        matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("so" | "dylib")
        )
    }

    fn excludes(&self, path: &Path) -> bool {
        let name = path.to_string_lossy();
        self.exclude.iter().any(|pattern| name.contains(pattern))
    }
}

/// How a resolved dependency relates to the tree being analyzed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyKind {
    /// Provided by the operating system; never copied.
    System,
    /// Already inside the tree.
    Within,
    /// Outside the tree; a candidate for copying.
    External,
}

/// A resolved dependency and every file that references it.
#[derive(Debug, Clone)]
pub struct Dependency {
    /// Canonical path of the library being depended on.
    pub path: PathBuf,
    pub kind: DependencyKind,
    /// Loader path to the raw install names it uses for this dependency.
    pub dependents: BTreeMap<PathBuf, Vec<String>>,
}

/// A reference that could not be satisfied by the resolver.
#[derive(Debug, Clone)]
pub struct UnresolvedReference {
    pub loader: PathBuf,
    pub install_name: String,
}

struct FileRecord {
    path: PathBuf,
    macho: MachOFile,
    /// The file's own resolved rpaths followed by those inherited along the
    /// chain of loaders.
    rpaths: Vec<PathBuf>,
}

/// An inverse dependency map over a directory tree and everything reachable
/// from it.
pub struct DependencyGraph {
    root: PathBuf,
    files: Vec<FileRecord>,
    /// Dependency arena index to loader arena index to raw install names.
    dependents: FxHashMap<usize, FxHashMap<usize, Vec<String>>>,
    /// System references, keyed by raw path (these routinely have no
    /// on-disk file to canonicalize).
    system: BTreeMap<PathBuf, BTreeMap<PathBuf, Vec<String>>>,
    unresolved: Vec<(usize, String)>,
}

impl DependencyGraph {
    /// Analyze every Mach-O file under `root` and everything they
    /// transitively depend on.
    pub fn build(root: &Path, options: &ScanOptions) -> Result<Self, DelocateError> {
        Builder::new(root, options).run()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The Mach-O files inside the tree, in path order.
    pub fn tree_files(&self) -> impl Iterator<Item = (&Path, &MachOFile)> {
        let mut files: Vec<_> = self
            .files
            .iter()
            .filter(|record| record.path.starts_with(&self.root))
            .map(|record| (record.path.as_path(), &record.macho))
            .collect();
        files.sort_by(|(left, _), (right, _)| left.cmp(right));
        files.into_iter()
    }

    /// Every resolved dependency edge, in path order. System references are
    /// included with [`DependencyKind::System`].
    pub fn dependencies(&self) -> Vec<Dependency> {
        let mut result: BTreeMap<PathBuf, Dependency> = BTreeMap::new();
        for (dep, loaders) in &self.dependents {
            let path = self.files[*dep].path.clone();
            let kind = if is_system_path(&path) {
                DependencyKind::System
            } else if path.starts_with(&self.root) {
                DependencyKind::Within
            } else {
                DependencyKind::External
            };
            let mut dependents = BTreeMap::new();
            for (loader, names) in loaders {
                dependents.insert(self.files[*loader].path.clone(), names.clone());
            }
            result.insert(
                path.clone(),
                Dependency {
                    path,
                    kind,
                    dependents,
                },
            );
        }
        for (path, loaders) in &self.system {
            result
                .entry(path.clone())
                .or_insert_with(|| Dependency {
                    path: path.clone(),
                    kind: DependencyKind::System,
                    dependents: BTreeMap::new(),
                })
                .dependents
                .extend(loaders.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        result.into_values().collect()
    }

    /// References the resolver could not satisfy, in discovery order.
    pub fn unresolved(&self) -> Vec<UnresolvedReference> {
        self.unresolved
            .iter()
            .map(|(loader, install_name)| UnresolvedReference {
                loader: self.files[*loader].path.clone(),
                install_name: install_name.clone(),
            })
            .collect()
    }
}

struct Builder<'a> {
    root: PathBuf,
    executable_path: PathBuf,
    options: &'a ScanOptions,
    environment_rpaths: Vec<PathBuf>,
    files: Vec<FileRecord>,
    index: FxHashMap<PathBuf, usize>,
    dependents: FxHashMap<usize, FxHashMap<usize, Vec<String>>>,
    system: BTreeMap<PathBuf, BTreeMap<PathBuf, Vec<String>>>,
    unresolved: Vec<(usize, String)>,
    queue: VecDeque<usize>,
}

impl<'a> Builder<'a> {
    fn new(root: &Path, options: &'a ScanOptions) -> Self {
        let root = canonicalize_if_exists(root);
        let executable_path = options
            .executable_path
            .clone()
            .map(|path| canonicalize_if_exists(&path))
            .unwrap_or_else(|| root.clone());
        Self {
            root,
            executable_path,
            options,
            environment_rpaths: environment_rpaths(),
            files: Vec::new(),
            index: FxHashMap::default(),
            dependents: FxHashMap::default(),
            system: BTreeMap::new(),
            unresolved: Vec::new(),
            queue: VecDeque::new(),
        }
    }

    fn run(mut self) -> Result<DependencyGraph, DelocateError> {
        // Seed with every Mach-O file in the tree, in a stable order.
        for entry in walkdir::WalkDir::new(&self.root)
            .sort_by_file_name()
            .into_iter()
        {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() || !self.options.inspects(path) {
                continue;
            }
            if !is_macho_file(path)? {
                continue;
            }
            self.ensure_record(&canonicalize_if_exists(path))?;
        }

        // Chase dependencies to a fixpoint; records are re-enqueued when
        // their inherited rpaths grow.
        while let Some(index) = self.queue.pop_front() {
            self.process(index)?;
        }

        Ok(DependencyGraph {
            root: self.root,
            files: self.files,
            dependents: self.dependents,
            system: self.system,
            unresolved: self.unresolved,
        })
    }

    /// Intern `path` (canonical) into the arena, parsing it and resolving
    /// its own rpath entries. Newly interned records are queued.
    fn ensure_record(&mut self, path: &Path) -> Result<usize, DelocateError> {
        if let Some(index) = self.index.get(path) {
            return Ok(*index);
        }
        let macho = parse_macho(path)?;
        let loader_dir = path.parent().unwrap_or(Path::new("/")).to_path_buf();
        let ctx = ResolveContext::new(loader_dir, self.executable_path.clone());
        let rpaths = macho
            .rpaths
            .iter()
            .map(|rpath| ctx.resolve_rpath_entry(rpath))
            .collect();
        let index = self.files.len();
        self.files.push(FileRecord {
            path: path.to_path_buf(),
            macho,
            rpaths,
        });
        self.index.insert(path.to_path_buf(), index);
        self.queue.push_back(index);
        Ok(index)
    }

    /// Resolve every dependency of one file, recording edges and queuing
    /// newly discovered out-of-tree libraries.
    fn process(&mut self, index: usize) -> Result<(), DelocateError> {
        let path = self.files[index].path.clone();
        let loader_dir = path.parent().unwrap_or(Path::new("/")).to_path_buf();
        let mut rpaths = self.files[index].rpaths.clone();
        rpaths.extend(self.environment_rpaths.iter().cloned());
        let ctx = ResolveContext {
            loader_path: loader_dir,
            executable_path: self.executable_path.clone(),
            rpaths,
        };

        // Stale entries from an earlier pass may now be resolvable.
        self.unresolved.retain(|(loader, _)| *loader != index);

        let raw_names = self.files[index].macho.dependencies.clone();
        for name in raw_names {
            match resolve_install_name(&name, &ctx, &path) {
                Ok(Resolution::System(system_path)) => {
                    self.system
                        .entry(system_path)
                        .or_default()
                        .entry(path.clone())
                        .or_default()
                        .push(name.clone());
                }
                Ok(Resolution::Found(resolved)) => {
                    if is_system_path(&resolved) {
                        self.system
                            .entry(resolved)
                            .or_default()
                            .entry(path.clone())
                            .or_default()
                            .push(name.clone());
                        continue;
                    }
                    if self.options.excludes(&resolved) {
                        debug!(
                            "Skipping {} (excluded by filter)",
                            resolved.display()
                        );
                        continue;
                    }
                    if !is_macho_file(&resolved)? {
                        debug!("Skipping {} (not a Mach-O file)", resolved.display());
                        continue;
                    }
                    let dep_index = self.ensure_record(&resolved)?;
                    let names = self
                        .dependents
                        .entry(dep_index)
                        .or_default()
                        .entry(index)
                        .or_default();
                    if !names.contains(&name) {
                        names.push(name.clone());
                    }
                    self.inherit_rpaths(index, dep_index);
                }
                Err(DelocateError::DependencyNotFound {
                    install_name,
                    loader,
                }) => {
                    error!("{install_name} not found, requested by {}", loader.display());
                    self.unresolved.push((index, install_name));
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Extend a dependency's search paths with those accumulated by its
    /// loader, so an `@rpath` reference satisfied upstream stays satisfied
    /// downstream. Re-queues the dependency when anything new appears.
    fn inherit_rpaths(&mut self, loader: usize, dep: usize) {
        if loader == dep {
            return;
        }
        let inherited: Vec<PathBuf> = self.files[loader]
            .rpaths
            .iter()
            .filter(|&rpath| !self.files[dep].rpaths.contains(rpath))
            .cloned()
            .collect();
        if inherited.is_empty() {
            return;
        }
        self.files[dep].rpaths.extend(inherited);
        if !self.queue.contains(&dep) {
            self.queue.push_back(dep);
        }
    }
}
