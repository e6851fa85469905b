//! Make macOS Python wheels self-contained.
//!
//! A wheel built on a development machine typically links against dynamic
//! libraries that only exist there, such as a Homebrew prefix. This crate:
//!
//! 1. Parses Mach-O binaries and extracts dependency information.
//! 2. Copies external library dependencies into Python wheels.
//! 3. Updates install names to use relative paths (`@loader_path`).
//! 4. Validates binary architectures.
//! 5. Fuses two single-architecture wheels into a universal wheel.

mod delocate;
mod error;
mod fs;
pub mod fuse;
pub mod graph;
pub mod macho;
pub mod resolve;
pub mod tags;
pub mod wheel;

pub use delocate::{
    delocate_path, verify_archs, CopiedLibraries, DelocateOptions, SidecarPolicy,
};
pub use error::DelocateError;
pub use fs::Simplified;
pub use fuse::fuse_wheels;
pub use macho::{Arch, MacOSVersion, MachOFile};
pub use wheel::{delocate_wheel, list_wheel_dependencies};
