use std::collections::BTreeMap;
use std::path::PathBuf;

use delocate::wheel::{tree_dependencies, wheel_libs};
use delocate::DelocateError;

use crate::commands::ExitStatus;

/// Print the library dependencies of directory trees or wheels.
pub(crate) fn listdeps(
    paths: &[PathBuf],
    all: bool,
    depending: bool,
) -> Result<ExitStatus, DelocateError> {
    let multiple = paths.len() > 1;
    for path in paths {
        let dependencies = if path.extension().is_some_and(|ext| ext == "whl") {
            wheel_libs(path, all)?
        } else {
            tree_dependencies(path, all)?
        };
        if multiple {
            println!("{}:", path.display());
        }
        report(&dependencies, depending, multiple);
    }
    Ok(ExitStatus::Success)
}

fn report(
    dependencies: &BTreeMap<PathBuf, BTreeMap<PathBuf, String>>,
    depending: bool,
    indent: bool,
) {
    let pad = if indent { "    " } else { "" };
    for (dependency, dependents) in dependencies {
        if depending {
            println!("{pad}{}:", dependency.display());
            for loader in dependents.keys() {
                println!("{pad}    {}", loader.display());
            }
        } else {
            println!("{pad}{}", dependency.display());
        }
    }
}
