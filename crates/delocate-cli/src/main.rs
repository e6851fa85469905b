#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::PathBuf;
use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::{Args, Parser, Subcommand};
use owo_colors::OwoColorize;

use delocate::macho::Arch;
use delocate::{DelocateError, DelocateOptions, MacOSVersion};

use crate::commands::ExitStatus;

mod commands;
mod logging;

#[derive(Parser)]
#[command(name = "delocate", author, version)]
#[command(about = "Make macOS binaries and Python wheels self-contained.")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Do not print any output.
    #[arg(global = true, long, short, conflicts_with = "verbose")]
    quiet: bool,

    /// Show a more verbose report of progress and failure. Repeat for even
    /// more detail.
    #[arg(global = true, long, short, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the library dependencies of directory trees or wheels.
    Listdeps(ListdepsArgs),
    /// Copy the external libraries that trees depend on into the trees, and
    /// relink everything in place.
    Path(PathArgs),
    /// Copy the external libraries that wheels depend on into the wheels,
    /// and relink everything.
    Wheel(WheelArgs),
    /// Fuse two wheels with disjoint architectures into a universal wheel.
    Merge(MergeArgs),
}

#[derive(Args)]
struct ListdepsArgs {
    /// Directories or wheel files to inspect.
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Include system libraries in the report.
    #[arg(long)]
    all: bool,

    /// Show which files depend on each library.
    #[arg(long)]
    depending: bool,
}

/// Options shared by the `path` and `wheel` subcommands.
#[derive(Args)]
struct SharedDelocateArgs {
    /// Name of the directory in which to store copied libraries.
    #[arg(long, default_value = ".dylibs")]
    lib_sdir: String,

    /// Architectures that every delocated file must provide: one or more
    /// architecture names, or the aliases `intel` and `universal2`.
    #[arg(long, value_parser = parse_require_archs)]
    require_archs: Option<RequireArchs>,

    /// The path used to resolve `@executable_path` in dependencies.
    #[arg(long)]
    executable_path: Option<PathBuf>,

    /// Exclude any library whose path includes the given string.
    #[arg(long, short = 'e')]
    exclude: Vec<String>,

    /// Only analyze files with known dynamic library extensions.
    #[arg(long, short = 'd')]
    dylibs_only: bool,

    /// Skip dependencies which couldn't be found and delocate as much as
    /// possible.
    #[arg(long)]
    ignore_missing_dependencies: bool,

    /// Fail if a copied library requires a newer macOS than this version
    /// (e.g. `10.9`), instead of updating the wheel's platform tag.
    #[arg(long, value_parser = parse_macos_version)]
    require_target_macos_version: Option<MacOSVersion>,
}

impl SharedDelocateArgs {
    fn options(&self) -> DelocateOptions {
        DelocateOptions {
            lib_sdir: self.lib_sdir.clone(),
            exclude: self.exclude.clone(),
            dylibs_only: self.dylibs_only,
            executable_path: self.executable_path.clone(),
            require_archs: self
                .require_archs
                .clone()
                .map(|archs| archs.0)
                .unwrap_or_default(),
            require_target_macos_version: self.require_target_macos_version,
            ignore_missing: self.ignore_missing_dependencies,
            ..DelocateOptions::default()
        }
    }
}

#[derive(Debug, Clone)]
struct RequireArchs(Vec<Arch>);

fn parse_require_archs(value: &str) -> Result<RequireArchs, String> {
    let mut archs = Vec::new();
    for spec in value.split(',').filter(|spec| !spec.is_empty()) {
        let parsed = Arch::from_spec(spec)
            .ok_or_else(|| format!("unknown architecture specifier: {spec}"))?;
        for arch in parsed {
            if !archs.contains(&arch) {
                archs.push(arch);
            }
        }
    }
    if archs.is_empty() {
        return Err("expected at least one architecture".to_string());
    }
    Ok(RequireArchs(archs))
}

fn parse_macos_version(value: &str) -> Result<MacOSVersion, String> {
    value.parse().map_err(|err: DelocateError| err.to_string())
}

#[derive(Args)]
struct PathArgs {
    /// Directory trees to delocate, in place.
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    #[command(flatten)]
    shared: SharedDelocateArgs,
}

#[derive(Args)]
struct WheelArgs {
    /// Wheel files to delocate.
    #[arg(required = true)]
    wheels: Vec<PathBuf>,

    #[command(flatten)]
    shared: SharedDelocateArgs,

    /// Directory to store delocated wheels (default is to overwrite each
    /// input wheel in place).
    #[arg(long, short = 'w')]
    wheel_dir: Option<PathBuf>,
}

#[derive(Args)]
struct MergeArgs {
    /// The two wheels to fuse.
    #[arg(required = true, num_args = 2)]
    wheels: Vec<PathBuf>,

    /// Directory to store the merged wheel.
    #[arg(long, short = 'w', required = true)]
    wheel_dir: PathBuf,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitStatus::Success,
                _ => ExitStatus::Failure,
            };
            let _ = err.print();
            return code.into();
        }
    };

    if let Err(err) = logging::setup_logging(if cli.quiet {
        logging::Level::Quiet
    } else {
        match cli.verbose {
            0 => logging::Level::Default,
            1 => logging::Level::Verbose,
            _ => logging::Level::ExtraVerbose,
        }
    }) {
        eprintln!("{}: {}", "error".red().bold(), err);
        return ExitStatus::Error.into();
    }

    let result = match &cli.command {
        Commands::Listdeps(args) => commands::listdeps(&args.paths, args.all, args.depending),
        Commands::Path(args) => commands::path(&args.paths, &args.shared.options()),
        Commands::Wheel(args) => {
            commands::wheel(&args.wheels, args.wheel_dir.as_deref(), &args.shared.options())
        }
        Commands::Merge(args) => {
            commands::merge(&args.wheels[0], &args.wheels[1], &args.wheel_dir)
        }
    };

    match result {
        Ok(status) => status.into(),
        Err(err) => {
            eprintln!("{}: {}", "error".red().bold(), err);
            commands::error_status(&err).into()
        }
    }
}
