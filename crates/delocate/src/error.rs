use std::path::PathBuf;

use thiserror::Error;

use crate::fs::Simplified;
use crate::macho::MacOSVersion;

/// Every failure surfaced by the delocation, analysis, and merge
/// operations.
#[derive(Debug, Error)]
pub enum DelocateError {
    #[error("failed to read or write a file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to read or write a wheel archive: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("failed to walk a directory tree: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("failed to process a RECORD file: {0}")]
    Csv(#[from] csv::Error),

    #[error("malformed Mach-O file: {0}")]
    MachOParse(String),

    #[error("unsupported Mach-O layout: {0}")]
    UnsupportedFormat(String),

    #[error("could not resolve `{install_name}`, needed by {}", loader.user_display())]
    DependencyNotFound {
        install_name: String,
        loader: PathBuf,
    },

    #[error("Missing required architectures:\n{report}")]
    ArchitectureDeficit { report: String },

    #[error(
        "Cannot merge `{}` and `{}`: file contents differ",
        left.user_display(),
        right.user_display()
    )]
    IrreconcilableFile { left: PathBuf, right: PathBuf },

    #[error("Cannot merge wheels `{left}` and `{right}`: {reason}")]
    MismatchedWheels {
        left: String,
        right: String,
        reason: String,
    },

    #[error("Merging a wheel onto itself is not supported: {}", wheel.user_display())]
    MergeOntoSelf { wheel: PathBuf },

    #[error("Duplicate {arch} slice while building a universal binary from {}", path.user_display())]
    DuplicateSlice { arch: String, path: PathBuf },

    #[error("Invalid wheel filename: {filename}: {reason}")]
    InvalidWheelFilename { filename: String, reason: String },

    #[error("Invalid platform tag: {tag}")]
    InvalidPlatformTag { tag: String },

    #[error("expected exactly one `*.dist-info` directory in the wheel")]
    MissingDistInfo,

    #[error("Missing `{name}` file in `{dist_info}`")]
    MissingMetadata { name: &'static str, dist_info: String },

    #[error("RECORD entry for `{path}` does not match the archived content")]
    RecordMismatch { path: String },

    #[error("{} escapes the tree rooted at {}", path.user_display(), root.user_display())]
    PathOutsideTree { path: PathBuf, root: PathBuf },

    #[error(
        "Library {} requires macOS {library_version}, but {wheel_version} was requested",
        library.user_display()
    )]
    IncompatibleMacOSVersion {
        library: PathBuf,
        library_version: MacOSVersion,
        wheel_version: MacOSVersion,
    },

    #[error("Load commands in {} have no room for `{new_name}`", path.user_display())]
    LoadCommandSpaceExhausted { path: PathBuf, new_name: String },

    #[error("Failed to restore permissions on {}", path.user_display())]
    Permission {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("`codesign` could not re-sign {}: {stderr}", path.user_display())]
    CodesignFailed { path: PathBuf, stderr: String },

    #[error("`install_name_tool` exited with an error for {}: {stderr}", path.user_display())]
    InstallNameToolFailed { path: PathBuf, stderr: String },

    #[error("`install_name_tool` not found: {0}")]
    InstallNameToolNotFound(#[from] which::Error),
}
