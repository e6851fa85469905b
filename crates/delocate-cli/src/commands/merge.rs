use std::path::Path;

use delocate::{fuse_wheels, DelocateError};

use crate::commands::ExitStatus;

/// Fuse two wheels with disjoint architectures into a universal wheel.
pub(crate) fn merge(
    to_wheel: &Path,
    from_wheel: &Path,
    wheel_dir: &Path,
) -> Result<ExitStatus, DelocateError> {
    let out_wheel = fuse_wheels(to_wheel, from_wheel, wheel_dir)?;
    // The merged filename is derived from the merged tag; report it.
    println!("{}", out_wheel.display());
    Ok(ExitStatus::Success)
}
