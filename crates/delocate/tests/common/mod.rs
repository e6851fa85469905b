//! Shared test support: synthesized Mach-O dylibs and wheels.
//!
//! Tests build their own fixtures so the suite runs on any host. The
//! builders emit minimal but valid little-endian 64-bit Mach-O images
//! (header plus dylib/rpath/build-version load commands and header
//! padding) and complete wheels with correct RECORD files.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use fs_err as fs;

use delocate::wheel::{pack_wheel, update_record};

const MH_MAGIC_64: u32 = 0xfeed_facf;
const MH_DYLIB: u32 = 0x6;
const MH_BUNDLE: u32 = 0x8;
const LC_LOAD_DYLIB: u32 = 0xc;
const LC_ID_DYLIB: u32 = 0xd;
const LC_RPATH: u32 = 0x8000_001c;
const LC_BUILD_VERSION: u32 = 0x32;
const PLATFORM_MACOS: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestArch {
    X86_64,
    Arm64,
}

impl TestArch {
    fn cputype(self) -> u32 {
        match self {
            Self::X86_64 => 0x0100_0007,
            Self::Arm64 => 0x0100_000c,
        }
    }

    fn cpusubtype(self) -> u32 {
        match self {
            Self::X86_64 => 3,
            Self::Arm64 => 0,
        }
    }
}

/// Builds a minimal Mach-O image.
#[derive(Debug, Clone)]
pub struct DylibBuilder {
    arch: TestArch,
    filetype: u32,
    install_id: Option<String>,
    dependencies: Vec<String>,
    rpaths: Vec<String>,
    min_macos: Option<(u16, u16)>,
    headerpad: usize,
}

impl DylibBuilder {
    /// A shared library carrying the given install id.
    pub fn dylib(install_id: &str) -> Self {
        Self {
            arch: TestArch::X86_64,
            filetype: MH_DYLIB,
            install_id: Some(install_id.to_string()),
            dependencies: Vec::new(),
            rpaths: Vec::new(),
            min_macos: None,
            headerpad: 512,
        }
    }

    /// A loadable bundle (the file type of Python extension modules); no
    /// install id.
    pub fn bundle() -> Self {
        Self {
            arch: TestArch::X86_64,
            filetype: MH_BUNDLE,
            install_id: None,
            dependencies: Vec::new(),
            rpaths: Vec::new(),
            min_macos: None,
            headerpad: 512,
        }
    }

    pub fn arch(mut self, arch: TestArch) -> Self {
        self.arch = arch;
        self
    }

    pub fn depends_on(mut self, name: &str) -> Self {
        self.dependencies.push(name.to_string());
        self
    }

    pub fn rpath(mut self, rpath: &str) -> Self {
        self.rpaths.push(rpath.to_string());
        self
    }

    pub fn min_macos(mut self, major: u16, minor: u16) -> Self {
        self.min_macos = Some((major, minor));
        self
    }

    /// Space left after the load commands, into which edits can grow.
    pub fn headerpad(mut self, headerpad: usize) -> Self {
        self.headerpad = headerpad;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut commands: Vec<u8> = Vec::new();
        let mut ncmds = 0u32;

        if let Some(install_id) = &self.install_id {
            push_dylib_command(&mut commands, LC_ID_DYLIB, install_id);
            ncmds += 1;
        }
        if let Some((major, minor)) = self.min_macos {
            let version = (u32::from(major) << 16) | (u32::from(minor) << 8);
            push_u32(&mut commands, LC_BUILD_VERSION);
            push_u32(&mut commands, 24);
            push_u32(&mut commands, PLATFORM_MACOS);
            push_u32(&mut commands, version);
            push_u32(&mut commands, version);
            push_u32(&mut commands, 0);
            ncmds += 1;
        }
        for dependency in &self.dependencies {
            push_dylib_command(&mut commands, LC_LOAD_DYLIB, dependency);
            ncmds += 1;
        }
        for rpath in &self.rpaths {
            let cmdsize = align8(12 + rpath.len() + 1);
            push_u32(&mut commands, LC_RPATH);
            push_u32(&mut commands, cmdsize as u32);
            push_u32(&mut commands, 12);
            commands.extend_from_slice(rpath.as_bytes());
            commands.resize(commands.len() + cmdsize - 12 - rpath.len(), 0);
            ncmds += 1;
        }

        let mut out = Vec::with_capacity(32 + commands.len() + self.headerpad);
        push_u32(&mut out, MH_MAGIC_64);
        push_u32(&mut out, self.arch.cputype());
        push_u32(&mut out, self.arch.cpusubtype());
        push_u32(&mut out, self.filetype);
        push_u32(&mut out, ncmds);
        push_u32(&mut out, commands.len() as u32);
        push_u32(&mut out, 0);
        push_u32(&mut out, 0);
        out.extend_from_slice(&commands);
        out.resize(out.len() + self.headerpad, 0);
        out
    }

    pub fn write(&self, path: &Path) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, self.build()).unwrap();
    }
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn align8(value: usize) -> usize {
    value.div_ceil(8) * 8
}

fn push_dylib_command(out: &mut Vec<u8>, cmd: u32, name: &str) {
    let cmdsize = align8(24 + name.len() + 1);
    push_u32(out, cmd);
    push_u32(out, cmdsize as u32);
    push_u32(out, 24);
    push_u32(out, 2);
    push_u32(out, 0x0001_0000);
    push_u32(out, 0x0001_0000);
    out.extend_from_slice(name.as_bytes());
    out.resize(out.len() + cmdsize - 24 - name.len(), 0);
}

/// Assemble thin images into a fat container.
pub fn fat(slices: &[Vec<u8>]) -> Vec<u8> {
    const FAT_MAGIC: u32 = 0xcafe_babe;
    const ALIGN: usize = 32;

    let push_be = |out: &mut Vec<u8>, value: u32| out.extend_from_slice(&value.to_be_bytes());

    let mut header = Vec::new();
    push_be(&mut header, FAT_MAGIC);
    push_be(&mut header, slices.len() as u32);

    let mut offset = align_to(8 + slices.len() * 20, ALIGN);
    let mut records = Vec::new();
    for slice in slices {
        let cputype = u32::from_le_bytes(slice[4..8].try_into().unwrap());
        let cpusubtype = u32::from_le_bytes(slice[8..12].try_into().unwrap());
        records.push((cputype, cpusubtype, offset, slice.len()));
        offset = align_to(offset + slice.len(), ALIGN);
    }
    for (cputype, cpusubtype, offset, size) in &records {
        push_be(&mut header, *cputype);
        push_be(&mut header, *cpusubtype);
        push_be(&mut header, *offset as u32);
        push_be(&mut header, *size as u32);
        push_be(&mut header, 5);
    }

    let total = records
        .last()
        .map(|(_, _, offset, size)| offset + size)
        .unwrap_or(header.len());
    let mut out = vec![0u8; total];
    out[..header.len()].copy_from_slice(&header);
    for ((_, _, offset, _), slice) in records.iter().zip(slices) {
        out[*offset..*offset + slice.len()].copy_from_slice(slice);
    }
    out
}

fn align_to(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

/// Builds a complete wheel: the given files plus `.dist-info` metadata and
/// a correct RECORD.
pub struct WheelBuilder {
    distribution: String,
    version: String,
    tag: String,
    files: Vec<(String, Vec<u8>, Option<u32>)>,
    top_level: Option<String>,
}

impl WheelBuilder {
    /// `tag` is the full `py-abi-platform` triple, e.g.
    /// `cp311-cp311-macosx_10_9_x86_64`.
    pub fn new(distribution: &str, version: &str, tag: &str) -> Self {
        Self {
            distribution: distribution.to_string(),
            version: version.to_string(),
            tag: tag.to_string(),
            files: Vec::new(),
            top_level: None,
        }
    }

    pub fn file(mut self, path: &str, contents: impl Into<Vec<u8>>) -> Self {
        self.files.push((path.to_string(), contents.into(), None));
        self
    }

    pub fn file_with_mode(mut self, path: &str, contents: impl Into<Vec<u8>>, mode: u32) -> Self {
        self.files.push((path.to_string(), contents.into(), Some(mode)));
        self
    }

    pub fn top_level(mut self, contents: &str) -> Self {
        self.top_level = Some(contents.to_string());
        self
    }

    /// Write the wheel into `out_dir` and return its path.
    pub fn build(&self, out_dir: &Path) -> PathBuf {
        let staging = tempfile::tempdir().unwrap();
        let tree = staging.path().join("wheel");
        fs::create_dir_all(&tree).unwrap();

        for (path, contents, mode) in &self.files {
            let path = tree.join(path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(&path, contents).unwrap();
            #[cfg(unix)]
            if let Some(mode) = mode {
                use std::fs::Permissions;
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&path, Permissions::from_mode(*mode)).unwrap();
            }
            #[cfg(not(unix))]
            let _ = mode;
        }

        let dist_info = format!("{}-{}.dist-info", self.distribution, self.version);
        let dist_info_dir = tree.join(&dist_info);
        fs::create_dir_all(&dist_info_dir).unwrap();
        fs::write(
            dist_info_dir.join("METADATA"),
            format!(
                "Metadata-Version: 2.1\nName: {}\nVersion: {}\n",
                self.distribution, self.version
            ),
        )
        .unwrap();
        fs::write(
            dist_info_dir.join("WHEEL"),
            format!(
                "Wheel-Version: 1.0\nGenerator: bdist_wheel (0.41.2)\nRoot-Is-Purelib: false\nTag: {}\n",
                self.tag
            ),
        )
        .unwrap();
        if let Some(top_level) = &self.top_level {
            fs::write(dist_info_dir.join("top_level.txt"), top_level).unwrap();
        }

        update_record(&tree, &dist_info).unwrap();

        fs::create_dir_all(out_dir).unwrap();
        let out_path = out_dir.join(format!(
            "{}-{}-{}.whl",
            self.distribution, self.version, self.tag
        ));
        pack_wheel(&tree, &out_path).unwrap();
        out_path
    }
}

/// Unpack a wheel into `dest` for assertions.
pub fn unpack(wheel: &Path, dest: &Path) -> PathBuf {
    fs::create_dir_all(dest).unwrap();
    delocate::wheel::unpack_wheel(wheel, dest).unwrap();
    dest.to_path_buf()
}
