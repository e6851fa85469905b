//! Python wheel file operations.
//!
//! Provides functionality for unpacking, modifying, and repacking wheel
//! files, including RECORD file updates and platform tag rewrites.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use fs_err as fs;
use fs_err::File;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::delocate::{
    delocate_tree, verify_archs, CopiedLibraries, DelocateOptions, SidecarLayout, SidecarPolicy,
};
use crate::error::DelocateError;
use crate::fs::{canonicalize_if_exists, persist};
use crate::graph::{DependencyGraph, DependencyKind};
use crate::macho::parse_macho;
use crate::tags::{MacosPlatformTag, WheelFilename};

/// Build a wheel filename string with the given platform tags.
pub fn filename_with_platform(filename: &WheelFilename, platform_tags: &[MacosPlatformTag]) -> String {
    filename
        .with_platform_tags(platform_tags.iter().map(ToString::to_string).collect())
        .to_string()
}

/// Unpack a wheel to a directory, restoring recorded permission bits.
pub fn unpack_wheel(wheel_path: &Path, dest_dir: &Path) -> Result<(), DelocateError> {
    let file = File::open(wheel_path)?;
    let mut archive = ZipArchive::new(io::BufReader::new(file))?;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let Some(enclosed_name) = entry.enclosed_name() else {
            continue;
        };
        let path = dest_dir.join(enclosed_name);
        if entry.is_dir() {
            fs::create_dir_all(&path)?;
            continue;
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut outfile = File::create(&path)?;
        io::copy(&mut entry, &mut outfile)?;
        drop(outfile);

        #[cfg(unix)]
        {
            use std::fs::Permissions;
            use std::os::unix::fs::PermissionsExt;

            if let Some(mode) = entry.unix_mode() {
                if mode & 0o777 != 0 {
                    fs::set_permissions(&path, Permissions::from_mode(mode & 0o7777))?;
                }
            }
        }
    }
    Ok(())
}

/// Repack a directory into a wheel file.
///
/// Entries are written in lexical path order with their permission bits
/// preserved. When `SOURCE_DATE_EPOCH` is set, every entry carries that
/// fixed timestamp and the archive is byte-reproducible.
pub fn pack_wheel(source_dir: &Path, wheel_path: &Path) -> Result<(), DelocateError> {
    let file = File::create(wheel_path)?;
    let mut zip = ZipWriter::new(file);

    let epoch_time = source_date_epoch();

    let walkdir = WalkDir::new(source_dir);
    let mut paths: Vec<_> = walkdir
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .collect();

    // Lexical order, so repeated packs of the same tree are identical.
    paths.sort_by(|a, b| a.path().cmp(b.path()));

    for entry in paths {
        let path = entry.path();
        let relative = path
            .strip_prefix(source_dir)
            .map_err(|_| DelocateError::PathOutsideTree {
                path: path.to_path_buf(),
                root: source_dir.to_path_buf(),
            })?;

        let relative_str = relative.to_string_lossy().replace('\\', "/");

        let mut options = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .unix_permissions(0o644);

        // Determine permissions.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let metadata = fs::metadata(path)?;
            options = options.unix_permissions(metadata.permissions().mode());
        }

        let timestamp = epoch_time.or_else(|| {
            fs::metadata(path)
                .ok()
                .and_then(|metadata| metadata.modified().ok())
                .and_then(|modified| jiff::Timestamp::try_from(modified).ok())
                .and_then(zip_datetime)
        });
        options = options.last_modified_time(timestamp.unwrap_or_default());

        zip.start_file(relative_str, options)?;

        let mut f = File::open(path)?;
        io::copy(&mut f, &mut zip)?;
    }

    zip.finish()?;
    Ok(())
}

/// The fixed archive timestamp requested via `SOURCE_DATE_EPOCH`, if any.
fn source_date_epoch() -> Option<zip::DateTime> {
    let epoch = std::env::var("SOURCE_DATE_EPOCH").ok()?;
    let seconds: i64 = epoch.parse().ok()?;
    zip_datetime(jiff::Timestamp::from_second(seconds).ok()?)
}

fn zip_datetime(timestamp: jiff::Timestamp) -> Option<zip::DateTime> {
    let zoned = timestamp.to_zoned(jiff::tz::TimeZone::UTC);
    // Zip timestamps cannot represent dates before 1980.
    if zoned.year() < 1980 {
        return Some(zip::DateTime::default());
    }
    zip::DateTime::from_date_and_time(
        u16::try_from(zoned.year()).ok()?,
        u8::try_from(zoned.month()).ok()?,
        u8::try_from(zoned.day()).ok()?,
        u8::try_from(zoned.hour()).ok()?,
        u8::try_from(zoned.minute()).ok()?,
        u8::try_from(zoned.second()).ok()?,
    )
    .ok()
}

/// Hash and measure a file the way RECORD rows record it.
fn digest_entry(path: &Path) -> Result<(String, u64), DelocateError> {
    let mut hasher = Sha256::new();
    let size = io::copy(&mut File::open(path)?, &mut hasher)?;
    let digest = URL_SAFE_NO_PAD.encode(hasher.finalize());
    Ok((format!("sha256={digest}"), size))
}

/// A single entry in a RECORD file.
///
/// See: <https://packaging.python.org/en/latest/specifications/recording-installed-packages/#the-record-file>
#[derive(Serialize, Deserialize)]
struct RecordEntry {
    path: String,
    hash: Option<String>,
    size: Option<u64>,
}

/// Regenerate the RECORD file of an unpacked wheel from its contents.
pub fn update_record(wheel_dir: &Path, dist_info_dir: &str) -> Result<(), DelocateError> {
    let record_name = format!("{dist_info_dir}/RECORD");
    let record_path = wheel_dir.join(dist_info_dir).join("RECORD");

    // A signature over the old record would no longer verify.
    let signature_path = wheel_dir.join(dist_info_dir).join("RECORD.jws");
    if signature_path.exists() {
        fs::remove_file(&signature_path)?;
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(wheel_dir).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry
            .path()
            .strip_prefix(wheel_dir)
            .map_err(|_| DelocateError::PathOutsideTree {
                path: entry.path().to_path_buf(),
                root: wheel_dir.to_path_buf(),
            })?
            .to_string_lossy()
            .replace('\\', "/");
        files.push((name, entry.into_path()));
    }
    files.sort();

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(&record_path)?;
    for (name, path) in files {
        let row = if name == record_name {
            // The record cannot contain its own hash.
            RecordEntry {
                path: name,
                hash: None,
                size: None,
            }
        } else {
            let (hash, size) = digest_entry(&path)?;
            RecordEntry {
                path: name,
                hash: Some(hash),
                size: Some(size),
            }
        };
        writer.serialize(row)?;
    }

    Ok(())
}

/// Verify every RECORD row against the unpacked contents.
pub fn verify_record(wheel_dir: &Path, dist_info_dir: &str) -> Result<(), DelocateError> {
    let record_path = wheel_dir.join(dist_info_dir).join("RECORD");
    if !record_path.is_file() {
        return Err(DelocateError::MissingMetadata {
            name: "RECORD",
            dist_info: dist_info_dir.to_string(),
        });
    }
    if !wheel_dir.join(dist_info_dir).join("WHEEL").is_file() {
        return Err(DelocateError::MissingMetadata {
            name: "WHEEL",
            dist_info: dist_info_dir.to_string(),
        });
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(&record_path)?;
    for record in reader.deserialize() {
        let entry: RecordEntry = record?;
        let Some(expected_hash) = entry.hash.as_deref().filter(|hash| !hash.is_empty()) else {
            continue;
        };
        let path = wheel_dir.join(&entry.path);
        if !path.is_file() {
            return Err(DelocateError::RecordMismatch { path: entry.path });
        }
        let (hash, size) = digest_entry(&path)?;
        if hash != expected_hash || entry.size.is_some_and(|expected| expected != size) {
            return Err(DelocateError::RecordMismatch { path: entry.path });
        }
    }
    Ok(())
}

/// Locate the `*.dist-info` directory of an unpacked wheel.
///
/// A well-formed wheel carries exactly one; none or several is a corrupt
/// wheel.
pub fn find_dist_info(wheel_dir: &Path) -> Result<String, DelocateError> {
    let mut found = None;
    for entry in fs::read_dir(wheel_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".dist-info") && found.replace(name).is_some() {
            return Err(DelocateError::MissingDistInfo);
        }
    }
    found.ok_or(DelocateError::MissingDistInfo)
}

/// The top-level package roots of an unpacked wheel.
///
/// A directory is a package root if it is declared in
/// `{dist_info}/top_level.txt` (covering namespace packages with no
/// `__init__`), or if it contains an `__init__.*` file.
pub fn find_package_roots(
    wheel_dir: &Path,
    dist_info_dir: &str,
) -> Result<Vec<PathBuf>, DelocateError> {
    let mut roots = Vec::new();

    let top_level = wheel_dir.join(dist_info_dir).join("top_level.txt");
    if top_level.is_file() {
        for line in fs::read_to_string(&top_level)?.lines() {
            let name = line.trim();
            if name.is_empty() {
                continue;
            }
            let candidate = wheel_dir.join(name);
            if candidate.is_dir() {
                roots.push(candidate);
            }
        }
    }

    for entry in fs::read_dir(wheel_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.ends_with(".dist-info") || name.ends_with(".data") {
            continue;
        }
        if roots.contains(&path) {
            continue;
        }
        let has_init = fs::read_dir(&path)?.filter_map(Result::ok).any(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .starts_with("__init__.")
        });
        if has_init {
            roots.push(path);
        }
    }

    roots.sort();
    Ok(roots)
}

/// Update a wheel by copying required libraries into sidecar directories.
///
/// The processed wheel is written into `out_dir`, under a name that only
/// differs from the input when a copied library forces a newer deployment
/// target. Returns the path of the written wheel.
pub fn delocate_wheel(
    in_wheel: &Path,
    out_dir: &Path,
    options: &DelocateOptions,
) -> Result<PathBuf, DelocateError> {
    let wheel_name = in_wheel
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| DelocateError::InvalidWheelFilename {
            filename: in_wheel.display().to_string(),
            reason: "not a file path".to_string(),
        })?;
    let filename = WheelFilename::from_str(wheel_name)?;

    let staging = tempfile::tempdir()?;
    let wheel_dir = staging.path().join("wheel");
    fs::create_dir_all(&wheel_dir)?;
    unpack_wheel(in_wheel, &wheel_dir)?;
    let wheel_dir = canonicalize_if_exists(&wheel_dir);

    let dist_info = find_dist_info(&wheel_dir)?;
    verify_record(&wheel_dir, &dist_info)?;

    let layout = match options.sidecar_policy {
        SidecarPolicy::PerPackage => SidecarLayout::per_package(
            find_package_roots(&wheel_dir, &dist_info)?,
            &options.lib_sdir,
            &wheel_dir.join(format!("{}.dylibs", filename.distribution)),
        ),
        SidecarPolicy::WheelRoot => {
            SidecarLayout::single(&wheel_dir.join(format!("{}.dylibs", filename.distribution)))
        }
    };

    let copied = delocate_tree(&wheel_dir, &layout, options)?;

    if !options.require_archs.is_empty() {
        verify_archs(&wheel_dir, &options.require_archs)?;
    }

    let filename = update_deployment_targets(&filename, &copied, &wheel_dir, &dist_info, options)?;

    update_record(&wheel_dir, &dist_info)?;

    let out_name = filename.to_string();
    let packed = staging.path().join(&out_name);
    pack_wheel(&wheel_dir, &packed)?;

    fs::create_dir_all(out_dir)?;
    let out_path = out_dir.join(&out_name);
    persist(&packed, &out_path)?;
    Ok(out_path)
}

/// Bump the wheel's macOS platform tags when a copied library requires a
/// newer deployment target than the wheel declares, rewriting `Tag:` lines
/// in the `WHEEL` metadata to match.
fn update_deployment_targets(
    filename: &WheelFilename,
    copied: &CopiedLibraries,
    wheel_dir: &Path,
    dist_info_dir: &str,
    options: &DelocateOptions,
) -> Result<WheelFilename, DelocateError> {
    if copied.is_empty() {
        return Ok(filename.clone());
    }

    let mut macos_tags: Vec<MacosPlatformTag> = Vec::new();
    for tag in &filename.platform_tags {
        match MacosPlatformTag::from_str(tag) {
            Ok(tag) => macos_tags.push(tag),
            // Leave non-macOS platform tags untouched.
            Err(_) => return Ok(filename.clone()),
        }
    }

    let mut replacements: BTreeMap<String, String> = BTreeMap::new();
    let mut updated = Vec::new();
    for tag in &macos_tags {
        let mut needed = tag.version();
        for source in copied.keys() {
            let macho = parse_macho(source)?;
            let Some(version) = macho.min_macos_version else {
                continue;
            };
            let relevant = macho
                .archs
                .iter()
                .any(|arch| tag.binary_format.archs().contains(arch));
            if relevant && version > needed {
                if let Some(ceiling) = options.require_target_macos_version {
                    if version > ceiling {
                        return Err(DelocateError::IncompatibleMacOSVersion {
                            library: source.clone(),
                            library_version: version,
                            wheel_version: ceiling,
                        });
                    }
                }
                needed = version;
            }
        }
        if needed > tag.version() {
            let bumped = tag.with_version(needed);
            warn!(
                "Copied libraries require macOS {needed}; changing platform tag {tag} to {bumped}"
            );
            replacements.insert(tag.to_string(), bumped.to_string());
            updated.push(bumped);
        } else {
            updated.push(*tag);
        }
    }

    if replacements.is_empty() {
        return Ok(filename.clone());
    }

    rewrite_wheel_tags(wheel_dir, dist_info_dir, &replacements)?;
    Ok(filename.with_platform_tags(updated.iter().map(ToString::to_string).collect()))
}

/// Rewrite the platform component of `Tag:` lines in the `WHEEL` metadata.
pub(crate) fn rewrite_wheel_tags(
    wheel_dir: &Path,
    dist_info_dir: &str,
    replacements: &BTreeMap<String, String>,
) -> Result<(), DelocateError> {
    let wheel_path = wheel_dir.join(dist_info_dir).join("WHEEL");
    let contents = fs::read_to_string(&wheel_path)?;
    let mut lines = Vec::new();
    for line in contents.lines() {
        let Some(triple) = line.strip_prefix("Tag: ") else {
            lines.push(line.to_string());
            continue;
        };
        let mut parts = triple.splitn(3, '-');
        let (Some(python), Some(abi), Some(platform)) =
            (parts.next(), parts.next(), parts.next())
        else {
            lines.push(line.to_string());
            continue;
        };
        let platform = replacements
            .get(platform)
            .map_or_else(|| platform.to_string(), Clone::clone);
        let rewritten = format!("Tag: {python}-{abi}-{platform}");
        // Distinct tags may collapse onto one after a merge.
        if !lines.contains(&rewritten) {
            lines.push(rewritten);
        }
    }
    let mut contents = lines.join("\n");
    contents.push('\n');
    fs::write(&wheel_path, contents)?;
    Ok(())
}

/// Analyze the library dependencies of a wheel without modifying it.
///
/// Returns dependencies mapped to their dependents, with in-wheel paths
/// made relative to the wheel root. System libraries are included only
/// when `include_system` is set.
pub fn wheel_libs(
    wheel_path: &Path,
    include_system: bool,
) -> Result<BTreeMap<PathBuf, BTreeMap<PathBuf, String>>, DelocateError> {
    let staging = tempfile::tempdir()?;
    let wheel_dir = staging.path().join("wheel");
    fs::create_dir_all(&wheel_dir)?;
    unpack_wheel(wheel_path, &wheel_dir)?;
    let wheel_dir = canonicalize_if_exists(&wheel_dir);
    tree_dependencies(&wheel_dir, include_system)
}

/// Analyze the library dependencies of a wheel, excluding system libraries.
pub fn list_wheel_dependencies(
    wheel_path: &Path,
) -> Result<BTreeMap<PathBuf, BTreeMap<PathBuf, String>>, DelocateError> {
    wheel_libs(wheel_path, false)
}

/// Analyze the library dependencies of a directory tree. See
/// [`wheel_libs`].
pub fn tree_dependencies(
    root: &Path,
    include_system: bool,
) -> Result<BTreeMap<PathBuf, BTreeMap<PathBuf, String>>, DelocateError> {
    let root = canonicalize_if_exists(root);
    let graph = DependencyGraph::build(&root, &crate::graph::ScanOptions::default())?;

    // Listing is best-effort: unresolved references were already logged
    // during the scan and the resolvable remainder is still worth showing.
    for unresolved in graph.unresolved() {
        warn!(
            "Could not resolve {} (required by {})",
            unresolved.install_name,
            unresolved.loader.display()
        );
    }

    let strip = |path: &Path| path.strip_prefix(&root).unwrap_or(path).to_path_buf();
    let mut result = BTreeMap::new();
    for dependency in graph.dependencies() {
        if dependency.kind == DependencyKind::System && !include_system {
            continue;
        }
        let dependents = dependency
            .dependents
            .iter()
            .map(|(loader, names)| {
                (strip(loader), names.first().cloned().unwrap_or_default())
            })
            .collect();
        result.insert(strip(&dependency.path), dependents);
    }
    Ok(result)
}
