use std::process::ExitCode;

use delocate::DelocateError;

pub(crate) use listdeps::listdeps;
pub(crate) use merge::merge;
pub(crate) use path::path;
pub(crate) use wheel::wheel;

mod listdeps;
mod merge;
mod path;
mod wheel;

#[derive(Copy, Clone)]
pub(crate) enum ExitStatus {
    /// The command succeeded.
    Success,
    /// The command failed due to an error in the user input.
    Failure,
    /// A dependency reference could not be resolved.
    UnresolvedDependency,
    /// A required architecture was missing from at least one file.
    ArchitectureDeficit,
    /// Two wheels could not be merged.
    IrreconcilableMerge,
    /// The command failed with an unexpected error.
    Error,
}

impl From<ExitStatus> for ExitCode {
    fn from(status: ExitStatus) -> Self {
        match status {
            ExitStatus::Success => Self::from(0),
            ExitStatus::Failure => Self::from(1),
            ExitStatus::UnresolvedDependency => Self::from(2),
            ExitStatus::ArchitectureDeficit => Self::from(3),
            ExitStatus::IrreconcilableMerge => Self::from(4),
            ExitStatus::Error => Self::from(5),
        }
    }
}

/// The exit status a failed operation reports.
pub(crate) fn error_status(err: &DelocateError) -> ExitStatus {
    match err {
        DelocateError::DependencyNotFound { .. } => ExitStatus::UnresolvedDependency,
        DelocateError::ArchitectureDeficit { .. } => ExitStatus::ArchitectureDeficit,
        DelocateError::IrreconcilableFile { .. }
        | DelocateError::MismatchedWheels { .. }
        | DelocateError::MergeOntoSelf { .. }
        | DelocateError::DuplicateSlice { .. }
        | DelocateError::InvalidPlatformTag { .. } => ExitStatus::IrreconcilableMerge,
        DelocateError::InvalidWheelFilename { .. } => ExitStatus::Failure,
        _ => ExitStatus::Error,
    }
}
