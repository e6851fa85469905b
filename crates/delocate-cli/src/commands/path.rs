use std::path::PathBuf;

use tracing::info;

use delocate::{delocate_path, DelocateError, DelocateOptions};

use crate::commands::ExitStatus;

/// Delocate directory trees in place.
pub(crate) fn path(
    paths: &[PathBuf],
    options: &DelocateOptions,
) -> Result<ExitStatus, DelocateError> {
    for tree in paths {
        let lib_path = tree.join(&options.lib_sdir);
        let copied = delocate_path(tree, &lib_path, options)?;
        info!(
            "Copied {} libraries into {}",
            copied.len(),
            lib_path.display()
        );
    }
    Ok(ExitStatus::Success)
}
