//! Fusing two single-architecture wheels into one universal wheel.
//!
//! Merging walks the union of the two file sets: common Mach-O files are
//! assembled into fat binaries, any other common file must be bytewise
//! identical, and files present in only one wheel are copied as-is. The
//! merged platform tag keeps the newer minimum deployment target.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use fs_err as fs;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::DelocateError;
use crate::fs::{canonicalize_if_exists, persist};
use crate::macho::{is_macho_file, make_universal};
use crate::tags::{MacosPlatformTag, WheelFilename};
use crate::wheel::{
    find_dist_info, pack_wheel, rewrite_wheel_tags, unpack_wheel, update_record, verify_record,
};

/// Fuse `from_wheel` into `to_wheel`, writing the merged wheel into
/// `out_dir` under a name derived from the merged platform tag.
///
/// The two wheels must be the same distribution, version, and Python/ABI
/// tags, and must cover disjoint architecture sets. Returns the path of the
/// merged wheel.
pub fn fuse_wheels(
    to_wheel: &Path,
    from_wheel: &Path,
    out_dir: &Path,
) -> Result<PathBuf, DelocateError> {
    let to_filename = parse_filename(to_wheel)?;
    let from_filename = parse_filename(from_wheel)?;

    let mismatch = |reason: &str| DelocateError::MismatchedWheels {
        left: to_filename.to_string(),
        right: from_filename.to_string(),
        reason: reason.to_string(),
    };

    if to_filename.distribution != from_filename.distribution {
        return Err(mismatch("distribution names differ"));
    }
    if to_filename.version != from_filename.version {
        return Err(mismatch("versions differ"));
    }
    if to_filename.build_tag != from_filename.build_tag {
        return Err(mismatch("build tags differ"));
    }
    if to_filename.python_tags != from_filename.python_tags
        || to_filename.abi_tags != from_filename.abi_tags
    {
        return Err(mismatch("Python or ABI tags differ"));
    }

    let to_tag = single_macos_tag(&to_filename)?;
    let from_tag = single_macos_tag(&from_filename)?;
    let merged_tag = to_tag
        .merged(&from_tag)
        .map_err(|err| mismatch(&err.to_string()))?;

    let out_filename = to_filename.with_platform_tags(vec![merged_tag.to_string()]);
    fs::create_dir_all(out_dir)?;
    let out_path = out_dir.join(out_filename.to_string());
    for input in [to_wheel, from_wheel] {
        if canonicalize_if_exists(&out_path) == canonicalize_if_exists(input) {
            return Err(DelocateError::MergeOntoSelf {
                wheel: input.to_path_buf(),
            });
        }
    }

    let staging = tempfile::tempdir()?;
    let to_dir = staging.path().join("to_wheel");
    let from_dir = staging.path().join("from_wheel");
    fs::create_dir_all(&to_dir)?;
    fs::create_dir_all(&from_dir)?;
    unpack_wheel(to_wheel, &to_dir)?;
    unpack_wheel(from_wheel, &from_dir)?;

    let dist_info = find_dist_info(&to_dir)?;
    verify_record(&to_dir, &dist_info)?;
    let from_dist_info = find_dist_info(&from_dir)?;
    verify_record(&from_dir, &from_dist_info)?;
    if from_dist_info != dist_info {
        return Err(mismatch("dist-info directories differ"));
    }

    fuse_trees(&to_dir, &from_dir, &dist_info)?;

    let replacements: BTreeMap<String, String> = [
        (to_tag.to_string(), merged_tag.to_string()),
        (from_tag.to_string(), merged_tag.to_string()),
    ]
    .into_iter()
    .collect();
    rewrite_wheel_tags(&to_dir, &dist_info, &replacements)?;

    update_record(&to_dir, &dist_info)?;

    let packed = staging.path().join(out_filename.to_string());
    pack_wheel(&to_dir, &packed)?;
    persist(&packed, &out_path)?;
    info!("Merged wheel written to {}", out_path.display());
    Ok(out_path)
}

/// Fuse the tree `from_dir` into `to_dir`.
///
/// `RECORD` is regenerated afterwards and `WHEEL` is retagged, so both are
/// expected to differ and are skipped here; every other common non-Mach-O
/// file must be identical.
pub(crate) fn fuse_trees(
    to_dir: &Path,
    from_dir: &Path,
    dist_info_dir: &str,
) -> Result<(), DelocateError> {
    for entry in WalkDir::new(from_dir).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let from_path = entry.path();
        let relative = from_path
            .strip_prefix(from_dir)
            .map_err(|_| DelocateError::PathOutsideTree {
                path: from_path.to_path_buf(),
                root: from_dir.to_path_buf(),
            })?;

        let relative_str = relative.to_string_lossy().replace('\\', "/");
        if relative_str == format!("{dist_info_dir}/RECORD")
            || relative_str == format!("{dist_info_dir}/RECORD.jws")
            || relative_str == format!("{dist_info_dir}/WHEEL")
        {
            continue;
        }

        let to_path = to_dir.join(relative);
        if !to_path.exists() {
            if let Some(parent) = to_path.parent() {
                fs::create_dir_all(parent)?;
            }
            debug!("Copying {relative_str}");
            fs::copy(from_path, &to_path)?;
            continue;
        }

        if fs::read(from_path)? == fs::read(&to_path)? {
            continue;
        }

        if is_macho_file(&to_path)? && is_macho_file(from_path)? {
            debug!("Fusing {relative_str}");
            make_universal(&to_path, &[to_path.as_path(), from_path])?;
        } else {
            return Err(DelocateError::IrreconcilableFile {
                left: to_path,
                right: from_path.to_path_buf(),
            });
        }
    }
    Ok(())
}

fn parse_filename(wheel: &Path) -> Result<WheelFilename, DelocateError> {
    let name = wheel
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| DelocateError::InvalidWheelFilename {
            filename: wheel.display().to_string(),
            reason: "not a file path".to_string(),
        })?;
    WheelFilename::from_str(name)
}

fn single_macos_tag(filename: &WheelFilename) -> Result<MacosPlatformTag, DelocateError> {
    match filename.platform_tags.as_slice() {
        [tag] => MacosPlatformTag::from_str(tag),
        _ => Err(DelocateError::InvalidPlatformTag {
            tag: filename.platform_tags.join("."),
        }),
    }
}
