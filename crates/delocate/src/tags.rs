//! Wheel filenames and macOS platform tags.

use std::collections::BTreeSet;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use crate::error::DelocateError;
use crate::macho::{Arch, MacOSVersion};

/// The components of a wheel filename.
///
/// For example, in `foo-1.0-cp311-cp311-macosx_10_9_x86_64.whl`, the
/// distribution is `foo`, the version `1.0`, and the tags
/// `cp311-cp311-macosx_10_9_x86_64`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct WheelFilename {
    pub distribution: String,
    pub version: String,
    pub build_tag: Option<String>,
    pub python_tags: Vec<String>,
    pub abi_tags: Vec<String>,
    pub platform_tags: Vec<String>,
}

impl FromStr for WheelFilename {
    type Err = DelocateError;

    fn from_str(filename: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| DelocateError::InvalidWheelFilename {
            filename: filename.to_string(),
            reason: reason.to_string(),
        };
        let stem = filename
            .strip_suffix(".whl")
            .ok_or_else(|| invalid("must end with .whl"))?;

        let parts: Vec<&str> = stem.split('-').collect();
        let (distribution, version, build_tag, python, abi, platform) = match parts.as_slice() {
            [distribution, version, python, abi, platform] => {
                (*distribution, *version, None, *python, *abi, *platform)
            }
            [distribution, version, build, python, abi, platform] => (
                *distribution,
                *version,
                Some((*build).to_string()),
                *python,
                *abi,
                *platform,
            ),
            _ => return Err(invalid("expected 5 or 6 dash-separated components")),
        };
        if distribution.is_empty() || version.is_empty() {
            return Err(invalid("empty distribution or version"));
        }

        let split_tags = |tags: &str| tags.split('.').map(String::from).collect::<Vec<_>>();
        Ok(Self {
            distribution: distribution.to_string(),
            version: version.to_string(),
            build_tag,
            python_tags: split_tags(python),
            abi_tags: split_tags(abi),
            platform_tags: split_tags(platform),
        })
    }
}

impl Display for WheelFilename {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.distribution, self.version)?;
        if let Some(build_tag) = &self.build_tag {
            write!(f, "-{build_tag}")?;
        }
        write!(
            f,
            "-{}-{}-{}.whl",
            self.python_tags.join("."),
            self.abi_tags.join("."),
            self.platform_tags.join(".")
        )
    }
}

impl WheelFilename {
    /// The same filename with the platform tags replaced.
    pub fn with_platform_tags(&self, platform_tags: Vec<String>) -> Self {
        Self {
            platform_tags,
            ..self.clone()
        }
    }

    /// The `py-abi-platform` tag triples enumerated by this filename, as
    /// they appear on `Tag:` lines of the `WHEEL` metadata file.
    pub fn tag_triples(&self) -> Vec<String> {
        let mut triples = Vec::new();
        for python in &self.python_tags {
            for abi in &self.abi_tags {
                for platform in &self.platform_tags {
                    triples.push(format!("{python}-{abi}-{platform}"));
                }
            }
        }
        triples
    }
}

/// The macOS binary format component of a platform tag.
#[derive(Debug, Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub enum BinaryFormat {
    I386,
    X86_64,
    X86_64h,
    Arm64,
    Arm64e,
    /// `i386` plus `x86_64`.
    Intel,
    /// `x86_64` plus `arm64`.
    Universal2,
}

impl BinaryFormat {
    /// The architectures a binary of this format carries.
    pub fn archs(self) -> Vec<Arch> {
        match self {
            Self::I386 => vec![Arch::I386],
            Self::X86_64 => vec![Arch::X86_64],
            Self::X86_64h => vec![Arch::X86_64h],
            Self::Arm64 => vec![Arch::Arm64],
            Self::Arm64e => vec![Arch::Arm64e],
            Self::Intel => vec![Arch::I386, Arch::X86_64],
            Self::Universal2 => vec![Arch::X86_64, Arch::Arm64],
        }
    }

    /// The format covering exactly `archs`, if one exists.
    pub fn from_archs(archs: &BTreeSet<Arch>) -> Option<Self> {
        for format in [
            Self::I386,
            Self::X86_64,
            Self::X86_64h,
            Self::Arm64,
            Self::Arm64e,
            Self::Intel,
            Self::Universal2,
        ] {
            if format.archs().into_iter().collect::<BTreeSet<_>>() == *archs {
                return Some(format);
            }
        }
        None
    }
}

impl Display for BinaryFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::I386 => "i386",
            Self::X86_64 => "x86_64",
            Self::X86_64h => "x86_64h",
            Self::Arm64 => "arm64",
            Self::Arm64e => "arm64e",
            Self::Intel => "intel",
            Self::Universal2 => "universal2",
        };
        f.write_str(name)
    }
}

impl FromStr for BinaryFormat {
    type Err = DelocateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "i386" => Ok(Self::I386),
            "x86_64" => Ok(Self::X86_64),
            "x86_64h" => Ok(Self::X86_64h),
            "arm64" => Ok(Self::Arm64),
            "arm64e" => Ok(Self::Arm64e),
            "intel" => Ok(Self::Intel),
            "universal2" => Ok(Self::Universal2),
            _ => Err(DelocateError::InvalidPlatformTag { tag: s.to_string() }),
        }
    }
}

/// A `macosx_{major}_{minor}_{binary_format}` platform tag.
#[derive(Debug, Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct MacosPlatformTag {
    pub major: u16,
    pub minor: u16,
    pub binary_format: BinaryFormat,
}

impl MacosPlatformTag {
    /// The minimum deployment target this tag declares.
    pub fn version(&self) -> MacOSVersion {
        MacOSVersion::new(self.major, self.minor)
    }

    /// The same tag with a newer minimum deployment target.
    pub fn with_version(&self, version: MacOSVersion) -> Self {
        Self {
            major: version.major,
            minor: version.minor,
            binary_format: self.binary_format,
        }
    }

    /// Synthesize the platform tag of a wheel merged from two wheels with
    /// disjoint architecture sets, keeping the newer minimum deployment
    /// target.
    pub fn merged(&self, other: &Self) -> Result<Self, DelocateError> {
        let left: BTreeSet<Arch> = self.binary_format.archs().into_iter().collect();
        let right: BTreeSet<Arch> = other.binary_format.archs().into_iter().collect();
        if left.intersection(&right).next().is_some() {
            return Err(DelocateError::InvalidPlatformTag {
                tag: format!("{self} and {other} share an architecture"),
            });
        }
        let union: BTreeSet<Arch> = left.union(&right).copied().collect();
        let binary_format =
            BinaryFormat::from_archs(&union).ok_or_else(|| DelocateError::InvalidPlatformTag {
                tag: format!("no binary format covers {self} plus {other}"),
            })?;
        let version = self.version().max(other.version());
        Ok(Self {
            major: version.major,
            minor: version.minor,
            binary_format,
        })
    }
}

impl Display for MacosPlatformTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "macosx_{}_{}_{}",
            self.major, self.minor, self.binary_format
        )
    }
}

impl FromStr for MacosPlatformTag {
    type Err = DelocateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DelocateError::InvalidPlatformTag { tag: s.to_string() };
        let rest = s.strip_prefix("macosx_").ok_or_else(invalid)?;
        let mut parts = rest.splitn(3, '_');
        let major = parts
            .next()
            .and_then(|major| major.parse().ok())
            .ok_or_else(invalid)?;
        let minor = parts
            .next()
            .and_then(|minor| minor.parse().ok())
            .ok_or_else(invalid)?;
        let binary_format = parts.next().ok_or_else(invalid)?.parse()?;
        Ok(Self {
            major,
            minor,
            binary_format,
        })
    }
}
