//! Mach-O inspection and load-command editing.
//!
//! Reads are backed by [`goblin`]; writes patch load-command strings in
//! place, shifting later commands into the header padding when a
//! replacement does not fit. On macOS hosts, edits that exceed the padding
//! fall back to `install_name_tool`, and rewritten files that carried a
//! code signature are re-signed ad hoc.

use std::fmt::{self, Display, Formatter};
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use goblin::mach::cputype::{get_arch_name_from_types, CPU_SUBTYPE_MASK};
use goblin::mach::fat::{FAT_MAGIC, SIZEOF_FAT_ARCH, SIZEOF_FAT_HEADER};
use goblin::mach::header::{MH_CIGAM, MH_CIGAM_64, MH_MAGIC, MH_MAGIC_64};
use goblin::mach::load_command::{CommandVariant, LC_RPATH};
use goblin::mach::{fat::FatArch, Mach, MachO};
use scroll::{Pread, Pwrite};

use crate::error::DelocateError;
use crate::fs::ensure_writable;

/// `platform` value of `LC_BUILD_VERSION` denoting macOS.
const PLATFORM_MACOS: u32 = 1;

impl From<goblin::error::Error> for DelocateError {
    fn from(err: goblin::error::Error) -> Self {
        Self::MachOParse(err.to_string())
    }
}

impl From<scroll::Error> for DelocateError {
    fn from(err: scroll::Error) -> Self {
        Self::MachOParse(err.to_string())
    }
}

/// A CPU architecture of a Mach-O slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Arch {
    I386,
    X86_64,
    X86_64h,
    Arm64,
    Arm64e,
    Ppc,
    Ppc64,
}

impl Arch {
    /// All architectures matching an `--require-archs` specifier.
    ///
    /// Accepts a single architecture name or one of the aliases `intel`
    /// (`i386` plus `x86_64`) and `universal2` (`x86_64` plus `arm64`).
    pub fn from_spec(spec: &str) -> Option<Vec<Self>> {
        match spec {
            "intel" => Some(vec![Self::I386, Self::X86_64]),
            "universal2" => Some(vec![Self::X86_64, Self::Arm64]),
            _ => Self::from_str(spec).ok().map(|arch| vec![arch]),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::I386 => "i386",
            Self::X86_64 => "x86_64",
            Self::X86_64h => "x86_64h",
            Self::Arm64 => "arm64",
            Self::Arm64e => "arm64e",
            Self::Ppc => "ppc",
            Self::Ppc64 => "ppc64",
        }
    }
}

impl Display for Arch {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Arch {
    type Err = DelocateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "i386" => Ok(Self::I386),
            "x86_64" => Ok(Self::X86_64),
            "x86_64h" => Ok(Self::X86_64h),
            "arm64" => Ok(Self::Arm64),
            "arm64e" => Ok(Self::Arm64e),
            "ppc" => Ok(Self::Ppc),
            "ppc64" => Ok(Self::Ppc64),
            _ => Err(DelocateError::UnsupportedFormat(format!(
                "unknown architecture: {s}"
            ))),
        }
    }
}

/// A minimum macOS deployment target, as recorded in `LC_VERSION_MIN_MACOSX`
/// or `LC_BUILD_VERSION`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MacOSVersion {
    pub major: u16,
    pub minor: u16,
}

impl MacOSVersion {
    pub fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Decode the `xxxx.yy.zz` nibble encoding used by version load commands.
    fn from_packed(version: u32) -> Self {
        Self {
            major: (version >> 16) as u16,
            minor: ((version >> 8) & 0xff) as u16,
        }
    }
}

impl Display for MacOSVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for MacOSVersion {
    type Err = DelocateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DelocateError::UnsupportedFormat(format!("invalid macOS version: {s}"));
        let (major, minor) = s.split_once('.').ok_or_else(invalid)?;
        Ok(Self {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor
                .split('.')
                .next()
                .unwrap_or(minor)
                .parse()
                .map_err(|_| invalid())?,
        })
    }
}

/// The observed view of a Mach-O file.
///
/// For universal binaries, the install name, dependencies, and rpaths are
/// read from the first slice; `archs` covers every slice.
#[derive(Debug, Clone)]
pub struct MachOFile {
    /// The self-name recorded in `LC_ID_DYLIB`, if any.
    pub install_name: Option<String>,
    /// Raw dependency strings, in load-command order.
    pub dependencies: Vec<String>,
    /// Raw `LC_RPATH` entries, in load-command order.
    pub rpaths: Vec<String>,
    /// The architectures of all slices.
    pub archs: Vec<Arch>,
    /// The minimum macOS version the file requires, if recorded.
    pub min_macos_version: Option<MacOSVersion>,
}

/// Returns `true` if `path` is a regular file starting with a Mach-O (thin
/// or fat) magic number. A missing file is reported as `false`, not an
/// error, so directory walks can probe freely.
pub fn is_macho_file(path: &Path) -> Result<bool, DelocateError> {
    let mut file = match fs_err::File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err.into()),
    };
    let mut buf = [0u8; 8];
    match file.read_exact(&mut buf) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(false),
        Err(err) => return Err(err.into()),
    }
    let magic_le: u32 = buf.as_slice().pread_with(0, scroll::LE)?;
    if matches!(magic_le, MH_MAGIC | MH_MAGIC_64 | MH_CIGAM | MH_CIGAM_64) {
        return Ok(true);
    }
    let magic_be: u32 = buf.as_slice().pread_with(0, scroll::BE)?;
    if magic_be == FAT_MAGIC {
        // Java class files share the fat magic; a genuine fat header has a
        // small slice count.
        let narches: u32 = buf.as_slice().pread_with(4, scroll::BE)?;
        return Ok((1..=30).contains(&narches));
    }
    Ok(false)
}

/// Parse the Mach-O file at `path`.
pub fn parse_macho(path: &Path) -> Result<MachOFile, DelocateError> {
    let data = fs_err::read(path)?;
    parse_macho_bytes(&data)
}

fn parse_macho_bytes(data: &[u8]) -> Result<MachOFile, DelocateError> {
    match Mach::parse(data)? {
        Mach::Binary(macho) => {
            let mut file = parse_thin(data, &macho)?;
            file.archs = vec![arch_of(&macho)?];
            Ok(file)
        }
        Mach::Fat(multi) => {
            let mut file = None;
            let mut archs = Vec::new();
            for arch in multi.iter_arches() {
                let arch = arch?;
                let slice = slice_of(data, &arch)?;
                let macho = MachO::parse(slice, 0)?;
                archs.push(arch_of(&macho)?);
                if file.is_none() {
                    file = Some(parse_thin(slice, &macho)?);
                }
            }
            let mut file = file.ok_or_else(|| {
                DelocateError::MachOParse("fat binary contains no slices".to_string())
            })?;
            file.archs = archs;
            Ok(file)
        }
    }
}

fn parse_thin(data: &[u8], macho: &MachO) -> Result<MachOFile, DelocateError> {
    let mut install_name = None;
    let mut dependencies = Vec::new();
    let mut rpaths = Vec::new();
    let mut min_macos_version = None;

    for cmd in &macho.load_commands {
        match &cmd.command {
            CommandVariant::IdDylib(id) => {
                install_name = Some(read_lc_str(data, cmd.offset, id.dylib.name)?.to_string());
            }
            CommandVariant::LoadDylib(dylib)
            | CommandVariant::LoadWeakDylib(dylib)
            | CommandVariant::ReexportDylib(dylib)
            | CommandVariant::LazyLoadDylib(dylib)
            | CommandVariant::LoadUpwardDylib(dylib) => {
                dependencies.push(read_lc_str(data, cmd.offset, dylib.dylib.name)?.to_string());
            }
            CommandVariant::Rpath(rpath) => {
                rpaths.push(read_lc_str(data, cmd.offset, rpath.path)?.to_string());
            }
            CommandVariant::VersionMinMacosx(version) => {
                min_macos_version = Some(MacOSVersion::from_packed(version.version));
            }
            CommandVariant::BuildVersion(build) if build.platform == PLATFORM_MACOS => {
                min_macos_version = Some(MacOSVersion::from_packed(build.minos));
            }
            _ => {}
        }
    }

    Ok(MachOFile {
        install_name,
        dependencies,
        rpaths,
        archs: Vec::new(),
        min_macos_version,
    })
}

fn arch_of(macho: &MachO) -> Result<Arch, DelocateError> {
    let cputype = macho.header.cputype;
    let cpusubtype = macho.header.cpusubtype & !CPU_SUBTYPE_MASK;
    let name = get_arch_name_from_types(cputype, cpusubtype).ok_or_else(|| {
        DelocateError::UnsupportedFormat(format!("unknown cputype {cputype}/{cpusubtype}"))
    })?;
    Arch::from_str(name)
}

fn slice_of<'a>(data: &'a [u8], arch: &FatArch) -> Result<&'a [u8], DelocateError> {
    let start = arch.offset as usize;
    let end = start + arch.size as usize;
    data.get(start..end)
        .ok_or_else(|| DelocateError::MachOParse("fat slice extends past end of file".to_string()))
}

fn read_lc_str<'a>(
    data: &'a [u8],
    cmd_offset: usize,
    lc_offset: u32,
) -> Result<&'a str, DelocateError> {
    Ok(data.pread::<&str>(cmd_offset + lc_offset as usize)?)
}

/// Rewrite the dependency entry `old` to `new` in the file at `path`.
///
/// Like `install_name_tool -change`, a missing `old` entry is not an error;
/// the file is left untouched.
pub fn change_install_name(path: &Path, old: &str, new: &str) -> Result<(), DelocateError> {
    edit_file(path, &Edit::InstallName { old, new }).map(|_| ())
}

/// Set the `LC_ID_DYLIB` install name of the library at `path`.
pub fn change_install_id(path: &Path, new: &str) -> Result<(), DelocateError> {
    edit_file(path, &Edit::InstallId { new }).map(|_| ())
}

/// Append an `LC_RPATH` entry. Adding an already-present rpath is a no-op.
pub fn add_rpath(path: &Path, rpath: &str) -> Result<(), DelocateError> {
    edit_file(path, &Edit::AddRpath { rpath }).map(|_| ())
}

/// Remove an `LC_RPATH` entry. Removing an absent rpath is a no-op.
pub fn delete_rpath(path: &Path, rpath: &str) -> Result<(), DelocateError> {
    edit_file(path, &Edit::DeleteRpath { rpath }).map(|_| ())
}

enum Edit<'a> {
    InstallName { old: &'a str, new: &'a str },
    InstallId { new: &'a str },
    AddRpath { rpath: &'a str },
    DeleteRpath { rpath: &'a str },
}

fn edit_file(path: &Path, edit: &Edit) -> Result<bool, DelocateError> {
    let data = fs_err::read(path)?;
    match apply_edit(&data, edit, path) {
        Ok(None) => Ok(false),
        Ok(Some(patched)) => {
            debug_assert_eq!(patched.len(), data.len());
            ensure_writable(path, || {
                fs_err::write(path, &patched)?;
                Ok(())
            })?;
            if has_code_signature(&data)? {
                resign(path)?;
            }
            Ok(true)
        }
        Err(DelocateError::LoadCommandSpaceExhausted { .. }) if cfg!(target_os = "macos") => {
            install_name_tool(path, edit)?;
            resign(path)?;
            Ok(true)
        }
        Err(err) => Err(err),
    }
}

/// Apply `edit` to a thin or fat Mach-O image, returning the patched bytes,
/// or `None` if nothing matched. The image size never changes.
fn apply_edit(data: &[u8], edit: &Edit, path: &Path) -> Result<Option<Vec<u8>>, DelocateError> {
    let magic_be: u32 = data.pread_with(0, scroll::BE)?;
    if magic_be == FAT_MAGIC {
        let mut out = data.to_vec();
        let mut changed = false;
        let narches: u32 = data.pread_with(4, scroll::BE)?;
        for index in 0..narches as usize {
            let entry = SIZEOF_FAT_HEADER + index * SIZEOF_FAT_ARCH;
            let offset: u32 = data.pread_with(entry + 8, scroll::BE)?;
            let size: u32 = data.pread_with(entry + 12, scroll::BE)?;
            let range = offset as usize..offset as usize + size as usize;
            let slice = data.get(range.clone()).ok_or_else(|| {
                DelocateError::MachOParse("fat slice extends past end of file".to_string())
            })?;
            if let Some(patched) = apply_edit_thin(slice, edit, path)? {
                out[range].copy_from_slice(&patched);
                changed = true;
            }
        }
        Ok(changed.then_some(out))
    } else {
        apply_edit_thin(data, edit, path)
    }
}

fn apply_edit_thin(data: &[u8], edit: &Edit, path: &Path) -> Result<Option<Vec<u8>>, DelocateError> {
    if let Edit::InstallName { old, new } = edit {
        if old == new {
            return Ok(None);
        }
    }

    let mut out = data.to_vec();
    let mut changed = false;

    // Re-parse after every mutation: a grown command shifts the offsets of
    // everything behind it.
    loop {
        let layout = Layout::read(&out)?;
        let macho = MachO::parse(&out, 0)?;
        let mut target = None;
        for cmd in &macho.load_commands {
            match (edit, &cmd.command) {
                (
                    Edit::InstallName { old, .. },
                    CommandVariant::LoadDylib(dylib)
                    | CommandVariant::LoadWeakDylib(dylib)
                    | CommandVariant::ReexportDylib(dylib)
                    | CommandVariant::LazyLoadDylib(dylib)
                    | CommandVariant::LoadUpwardDylib(dylib),
                ) => {
                    if read_lc_str(&out, cmd.offset, dylib.dylib.name)? == *old {
                        target = Some(Target {
                            cmd_offset: cmd.offset,
                            cmdsize: dylib.cmdsize as usize,
                            str_offset: dylib.dylib.name as usize,
                        });
                        break;
                    }
                }
                (Edit::InstallId { .. }, CommandVariant::IdDylib(id)) => {
                    target = Some(Target {
                        cmd_offset: cmd.offset,
                        cmdsize: id.cmdsize as usize,
                        str_offset: id.dylib.name as usize,
                    });
                    break;
                }
                (
                    Edit::AddRpath { rpath } | Edit::DeleteRpath { rpath },
                    CommandVariant::Rpath(command),
                ) => {
                    if read_lc_str(&out, cmd.offset, command.path)? == *rpath {
                        target = Some(Target {
                            cmd_offset: cmd.offset,
                            cmdsize: command.cmdsize as usize,
                            str_offset: command.path as usize,
                        });
                        break;
                    }
                }
                _ => {}
            }
        }

        match (edit, target) {
            (Edit::InstallName { new, .. }, Some(target)) => {
                out = write_command_string(out, &layout, &target, new, path)?;
                changed = true;
            }
            (Edit::InstallId { new }, Some(target)) => {
                // A single LC_ID_DYLIB exists per slice; the loop would
                // match it again indefinitely.
                out = write_command_string(out, &layout, &target, new, path)?;
                changed = true;
                break;
            }
            (Edit::InstallId { .. }, None) => {
                return Err(DelocateError::UnsupportedFormat(format!(
                    "{} has no install id",
                    path.display()
                )));
            }
            (Edit::AddRpath { .. }, Some(_)) => break,
            (Edit::AddRpath { rpath }, None) => {
                out = insert_rpath_command(out, &layout, rpath, path)?;
                changed = true;
                break;
            }
            (Edit::DeleteRpath { .. }, Some(target)) => {
                out = remove_command(out, &layout, &target);
                changed = true;
            }
            (_, None) => break,
        }
    }

    Ok(changed.then_some(out))
}

/// A load command selected for editing: its file offset, its size, and the
/// offset of its string payload within the command.
struct Target {
    cmd_offset: usize,
    cmdsize: usize,
    str_offset: usize,
}

/// The fixed-layout fields of a thin Mach-O header, plus the file offset at
/// which load commands must end (the start of the first section's data).
struct Layout {
    header_size: usize,
    ncmds: u32,
    sizeofcmds: u32,
    align: usize,
    text_start: usize,
}

impl Layout {
    fn read(data: &[u8]) -> Result<Self, DelocateError> {
        let magic: u32 = data.pread_with(0, scroll::LE)?;
        let is64 = match magic {
            MH_MAGIC_64 => true,
            MH_MAGIC => false,
            _ => {
                return Err(DelocateError::UnsupportedFormat(
                    "editing big-endian Mach-O files is not supported".to_string(),
                ))
            }
        };
        let ncmds: u32 = data.pread_with(16, scroll::LE)?;
        let sizeofcmds: u32 = data.pread_with(20, scroll::LE)?;

        // The load commands can only grow into the zero padding before the
        // first section's file contents.
        let macho = MachO::parse(data, 0)?;
        let text_start = macho
            .segments
            .iter()
            .filter_map(|segment| segment.sections().ok())
            .flatten()
            .map(|(section, _)| section.offset as usize)
            .filter(|offset| *offset > 0)
            .min()
            .unwrap_or(data.len());

        Ok(Self {
            header_size: if is64 { 32 } else { 28 },
            ncmds,
            sizeofcmds,
            align: if is64 { 8 } else { 4 },
            text_start,
        })
    }

    fn cmds_end(&self) -> usize {
        self.header_size + self.sizeofcmds as usize
    }
}

fn align_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

/// Replace the string of a single load command, in place when the new value
/// fits, otherwise by growing the command into the header padding.
fn write_command_string(
    mut data: Vec<u8>,
    layout: &Layout,
    target: &Target,
    new: &str,
    path: &Path,
) -> Result<Vec<u8>, DelocateError> {
    let space = target.cmdsize - target.str_offset;
    if new.len() < space {
        let start = target.cmd_offset + target.str_offset;
        let end = target.cmd_offset + target.cmdsize;
        data[start..start + new.len()].copy_from_slice(new.as_bytes());
        data[start + new.len()..end].fill(0);
        return Ok(data);
    }

    let new_cmdsize = align_up(target.str_offset + new.len() + 1, layout.align);
    let delta = new_cmdsize - target.cmdsize;
    if layout.cmds_end() + delta > layout.text_start {
        return Err(DelocateError::LoadCommandSpaceExhausted {
            path: path.to_path_buf(),
            new_name: new.to_string(),
        });
    }

    // Shift every later command down, then write the widened command.
    data.copy_within(
        target.cmd_offset + target.cmdsize..layout.cmds_end(),
        target.cmd_offset + new_cmdsize,
    );
    let start = target.cmd_offset + target.str_offset;
    data[start..start + new.len()].copy_from_slice(new.as_bytes());
    data[start + new.len()..target.cmd_offset + new_cmdsize].fill(0);
    data.pwrite_with(new_cmdsize as u32, target.cmd_offset + 4, scroll::LE)?;
    data.pwrite_with(layout.sizeofcmds + delta as u32, 20, scroll::LE)?;
    Ok(data)
}

fn insert_rpath_command(
    mut data: Vec<u8>,
    layout: &Layout,
    rpath: &str,
    path: &Path,
) -> Result<Vec<u8>, DelocateError> {
    // cmd, cmdsize, and the path offset, followed by the string.
    let str_offset = 12;
    let cmdsize = align_up(str_offset + rpath.len() + 1, layout.align);
    if layout.cmds_end() + cmdsize > layout.text_start {
        return Err(DelocateError::LoadCommandSpaceExhausted {
            path: path.to_path_buf(),
            new_name: rpath.to_string(),
        });
    }

    let offset = layout.cmds_end();
    data.pwrite_with(LC_RPATH, offset, scroll::LE)?;
    data.pwrite_with(cmdsize as u32, offset + 4, scroll::LE)?;
    data.pwrite_with(str_offset as u32, offset + 8, scroll::LE)?;
    data[offset + str_offset..offset + str_offset + rpath.len()]
        .copy_from_slice(rpath.as_bytes());
    data[offset + str_offset + rpath.len()..offset + cmdsize].fill(0);
    data.pwrite_with(layout.ncmds + 1, 16, scroll::LE)?;
    data.pwrite_with(layout.sizeofcmds + cmdsize as u32, 20, scroll::LE)?;
    Ok(data)
}

fn remove_command(mut data: Vec<u8>, layout: &Layout, target: &Target) -> Vec<u8> {
    let cmds_end = layout.cmds_end();
    data.copy_within(target.cmd_offset + target.cmdsize..cmds_end, target.cmd_offset);
    data[cmds_end - target.cmdsize..cmds_end].fill(0);
    // Infallible: both offsets were just read from the same buffer.
    let _ = data.pwrite_with(layout.ncmds - 1, 16, scroll::LE);
    let _ = data.pwrite_with(layout.sizeofcmds - target.cmdsize as u32, 20, scroll::LE);
    data
}

fn has_code_signature(data: &[u8]) -> Result<bool, DelocateError> {
    let check = |macho: &MachO| {
        macho
            .load_commands
            .iter()
            .any(|cmd| matches!(&cmd.command, CommandVariant::CodeSignature(_)))
    };
    match Mach::parse(data)? {
        Mach::Binary(macho) => Ok(check(&macho)),
        Mach::Fat(multi) => {
            for arch in multi.iter_arches() {
                let arch = arch?;
                let macho = MachO::parse(slice_of(data, &arch)?, 0)?;
                if check(&macho) {
                    return Ok(true);
                }
            }
            Ok(false)
        }
    }
}

/// Re-apply an ad-hoc code signature after a rewrite.
///
/// `dyld` on Apple Silicon refuses to load dylibs whose signature was
/// invalidated by a load-command edit.
#[cfg(target_os = "macos")]
fn resign(path: &Path) -> Result<(), DelocateError> {
    let output = std::process::Command::new("codesign")
        .arg("--force")
        .arg("--sign")
        .arg("-")
        .arg(path)
        .output()?;
    if !output.status.success() {
        return Err(DelocateError::CodesignFailed {
            path: path.to_path_buf(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(())
}

#[cfg(not(target_os = "macos"))]
fn resign(_path: &Path) -> Result<(), DelocateError> {
    Ok(())
}

/// Shell out to `install_name_tool` for an edit that does not fit in the
/// header padding.
#[cfg(target_os = "macos")]
fn install_name_tool(path: &Path, edit: &Edit) -> Result<(), DelocateError> {
    let tool = which::which("install_name_tool")?;
    let mut command = std::process::Command::new(tool);
    match edit {
        Edit::InstallName { old, new } => {
            command.arg("-change").arg(old).arg(new);
        }
        Edit::InstallId { new } => {
            command.arg("-id").arg(new);
        }
        Edit::AddRpath { rpath } => {
            command.arg("-add_rpath").arg(rpath);
        }
        Edit::DeleteRpath { rpath } => {
            command.arg("-delete_rpath").arg(rpath);
        }
    }
    command.arg(path);
    let output = ensure_writable(path, || Ok(command.output()?))?;
    if !output.status.success() {
        return Err(DelocateError::InstallNameToolFailed {
            path: path.to_path_buf(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(())
}

#[cfg(not(target_os = "macos"))]
fn install_name_tool(path: &Path, _edit: &Edit) -> Result<(), DelocateError> {
    Err(DelocateError::InstallNameToolFailed {
        path: path.to_path_buf(),
        stderr: "install_name_tool is only available on macOS".to_string(),
    })
}

/// Assemble `output` as a universal binary whose slices are the union of the
/// slices of `inputs`.
///
/// Slices are normalized to `(cputype, cpusubtype)` order, so the result is
/// independent of the input ordering. Two inputs carrying the same
/// architecture with different contents are rejected.
pub fn make_universal<P: AsRef<Path>>(output: &Path, inputs: &[P]) -> Result<(), DelocateError> {
    let mut slices: Vec<(u32, u32, Vec<u8>)> = Vec::new();

    for input in inputs {
        let input = input.as_ref();
        let data = fs_err::read(input)?;
        let thin_slices: Vec<Vec<u8>> = match Mach::parse(&data)? {
            Mach::Binary(_) => vec![data],
            Mach::Fat(multi) => {
                let mut extracted = Vec::new();
                for arch in multi.iter_arches() {
                    let arch = arch?;
                    extracted.push(slice_of(&data, &arch)?.to_vec());
                }
                extracted
            }
        };
        for slice in thin_slices {
            let macho = MachO::parse(&slice, 0)?;
            let key = (macho.header.cputype, macho.header.cpusubtype);
            match slices
                .iter()
                .position(|(cputype, cpusubtype, _)| (*cputype, *cpusubtype) == key)
            {
                Some(index) if slices[index].2 == slice => {}
                Some(_) => {
                    return Err(DelocateError::DuplicateSlice {
                        arch: arch_of(&macho)?.to_string(),
                        path: input.to_path_buf(),
                    });
                }
                None => slices.push((key.0, key.1, slice)),
            }
        }
    }

    slices.sort_by_key(|(cputype, cpusubtype, _)| (*cputype, *cpusubtype));

    let bytes = if let [(_, _, slice)] = slices.as_slice() {
        slice.clone()
    } else {
        write_fat(&slices)?
    };
    fs_err::write(output, bytes)?;
    Ok(())
}

/// Serialize slices into a fat container.
///
/// Slices are aligned on 16 KiB boundaries, which satisfies both the x86-64
/// and arm64 page sizes.
fn write_fat(slices: &[(u32, u32, Vec<u8>)]) -> Result<Vec<u8>, DelocateError> {
    const ALIGN_SHIFT: u32 = 14;
    let align = 2usize.pow(ALIGN_SHIFT);

    let header_end = SIZEOF_FAT_HEADER + slices.len() * SIZEOF_FAT_ARCH;
    if header_end > align {
        return Err(DelocateError::UnsupportedFormat(format!(
            "too many slices for a fat header: {}",
            slices.len()
        )));
    }

    let mut records = Vec::with_capacity(slices.len());
    let mut offset = align;
    for (cputype, cpusubtype, slice) in slices {
        offset = align_up(offset, align);
        records.push(FatArch {
            cputype: *cputype,
            cpusubtype: *cpusubtype,
            offset: u32::try_from(offset).map_err(|_| {
                DelocateError::UnsupportedFormat("fat binary exceeds 4 GiB".to_string())
            })?,
            size: u32::try_from(slice.len()).map_err(|_| {
                DelocateError::UnsupportedFormat("fat slice exceeds 4 GiB".to_string())
            })?,
            align: ALIGN_SHIFT,
        });
        offset += slice.len();
    }

    let mut out = vec![0u8; offset];
    out.pwrite_with(FAT_MAGIC, 0, scroll::BE)?;
    out.pwrite_with(slices.len() as u32, 4, scroll::BE)?;
    for (index, record) in records.iter().enumerate() {
        out.pwrite_with(record, SIZEOF_FAT_HEADER + index * SIZEOF_FAT_ARCH, scroll::BE)?;
    }
    for (record, (_, _, slice)) in records.iter().zip(slices) {
        let start = record.offset as usize;
        out[start..start + slice.len()].copy_from_slice(slice);
    }
    Ok(out)
}
