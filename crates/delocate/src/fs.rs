//! Filesystem display and permission helpers.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use crate::error::DelocateError;

/// The current working directory.
static CWD: LazyLock<PathBuf> =
    LazyLock::new(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

pub trait Simplified {
    /// Render a [`Path`] for user-facing display.
    ///
    /// Relativizes the path against the current working directory, if possible.
    fn user_display(&self) -> impl std::fmt::Display;
}

impl<T: AsRef<Path>> Simplified for T {
    fn user_display(&self) -> impl std::fmt::Display {
        let path = self.as_ref();

        // If current working directory is root, display the path as-is.
        if CWD.ancestors().nth(1).is_none() {
            return path.display();
        }

        path.strip_prefix(CWD.as_path()).unwrap_or(path).display()
    }
}

/// Canonicalize `path` if it exists, otherwise return it unchanged.
///
/// Dependency references routinely point at symlinks (`libfoo.dylib ->
/// libfoo.1.dylib`); the canonical path is the one the dynamic linker
/// ultimately maps in, and the one under which a library is copied.
pub(crate) fn canonicalize_if_exists(path: &Path) -> PathBuf {
    fs_err::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Run `f` against `path` with the user-write bit temporarily set.
///
/// The original mode is restored on every exit path.
#[cfg(unix)]
pub(crate) fn ensure_writable<T>(
    path: &Path,
    f: impl FnOnce() -> Result<T, DelocateError>,
) -> Result<T, DelocateError> {
    use std::fs::Permissions;
    use std::os::unix::fs::PermissionsExt;

    let mode = fs_err::metadata(path)?.permissions().mode();
    let writable = mode & 0o200 != 0;
    if !writable {
        fs_err::set_permissions(path, Permissions::from_mode(mode | 0o200))?;
    }
    let result = f();
    if !writable {
        if let Err(err) = fs_err::set_permissions(path, Permissions::from_mode(mode)) {
            return Err(DelocateError::Permission {
                path: path.to_path_buf(),
                err,
            });
        }
    }
    result
}

#[cfg(not(unix))]
pub(crate) fn ensure_writable<T>(
    _path: &Path,
    f: impl FnOnce() -> Result<T, DelocateError>,
) -> Result<T, DelocateError> {
    f()
}

/// Move `src` to `dst`, falling back to copy-and-remove across filesystems.
///
/// The rename is the only externally visible commit point of a wheel
/// operation, so it replaces any existing `dst` atomically where the
/// platform allows.
pub(crate) fn persist(src: &Path, dst: &Path) -> Result<(), DelocateError> {
    match fs_err::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs_err::copy(src, dst)?;
            fs_err::remove_file(src)?;
            Ok(())
        }
    }
}
