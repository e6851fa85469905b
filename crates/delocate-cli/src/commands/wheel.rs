use std::path::{Path, PathBuf};

use tracing::info;

use delocate::{delocate_wheel, DelocateError, DelocateOptions};

use crate::commands::ExitStatus;

/// Delocate wheels, writing each into `wheel_dir` (or over the input when
/// no output directory was given).
pub(crate) fn wheel(
    wheels: &[PathBuf],
    wheel_dir: Option<&Path>,
    options: &DelocateOptions,
) -> Result<ExitStatus, DelocateError> {
    for wheel in wheels {
        let out_dir = match wheel_dir {
            Some(dir) => dir.to_path_buf(),
            None => match wheel.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                _ => PathBuf::from("."),
            },
        };
        let out_wheel = delocate_wheel(wheel, &out_dir, options)?;
        info!("Wrote {}", out_wheel.display());
    }
    Ok(ExitStatus::Success)
}
