//! Integration tests for wheel fusing.

use std::path::{Path, PathBuf};

use fs_err as fs;
use tempfile::TempDir;

use delocate::macho::parse_macho;
use delocate::wheel::{find_dist_info, verify_record};
use delocate::{fuse_wheels, Arch, DelocateError};

mod common;
use common::{unpack, DylibBuilder, TestArch, WheelBuilder};

fn arch_wheel(dir: &Path, tag: &str, arch: TestArch, extra: Option<(&str, &str)>) -> PathBuf {
    let mut builder = WheelBuilder::new("fakepkg", "1.0", &format!("cp311-cp311-{tag}"))
        .file("fakepkg/__init__.py", "")
        .file("fakepkg/module.py", "answer = 42\n")
        .file(
            "fakepkg/ext.so",
            DylibBuilder::bundle()
                .arch(arch)
                .depends_on("/usr/lib/libSystem.B.dylib")
                .build(),
        )
        .top_level("fakepkg\n");
    if let Some((path, contents)) = extra {
        builder = builder.file(path, contents);
    }
    builder.build(dir)
}

#[test]
fn test_fuse_wheels() {
    let temp_dir = TempDir::new().unwrap();
    let x86_64 = arch_wheel(temp_dir.path(), "macosx_10_9_x86_64", TestArch::X86_64, None);
    let arm64 = arch_wheel(
        &temp_dir.path().join("other"),
        "macosx_11_0_arm64",
        TestArch::Arm64,
        Some(("fakepkg/only_arm.txt", "arm\n")),
    );

    let out_dir = temp_dir.path().join("out");
    let merged = fuse_wheels(&x86_64, &arm64, &out_dir).unwrap();

    // The merged tag keeps the newer minimum deployment target.
    assert_eq!(
        merged.file_name().unwrap(),
        "fakepkg-1.0-cp311-cp311-macosx_11_0_universal2.whl"
    );

    let tree = unpack(&merged, &temp_dir.path().join("tree"));

    // Common Mach-O files carry the union of the slices.
    let ext = parse_macho(&tree.join("fakepkg/ext.so")).unwrap();
    assert!(ext.archs.contains(&Arch::X86_64));
    assert!(ext.archs.contains(&Arch::Arm64));
    assert_eq!(ext.archs.len(), 2);

    // Files present in only one wheel are carried over.
    assert!(tree.join("fakepkg/only_arm.txt").exists());

    // The WHEEL metadata was retagged and the RECORD regenerated.
    let wheel_metadata =
        fs::read_to_string(tree.join("fakepkg-1.0.dist-info").join("WHEEL")).unwrap();
    assert!(wheel_metadata.contains("Tag: cp311-cp311-macosx_11_0_universal2"));
    assert!(!wheel_metadata.contains("x86_64"));
    let dist_info = find_dist_info(&tree).unwrap();
    verify_record(&tree, &dist_info).unwrap();
}

#[test]
fn test_fuse_is_commutative() {
    std::env::set_var("SOURCE_DATE_EPOCH", "1577836800");

    let temp_dir = TempDir::new().unwrap();
    let x86_64 = arch_wheel(temp_dir.path(), "macosx_10_9_x86_64", TestArch::X86_64, None);
    let arm64 = arch_wheel(
        &temp_dir.path().join("other"),
        "macosx_11_0_arm64",
        TestArch::Arm64,
        None,
    );

    let forward = fuse_wheels(&x86_64, &arm64, &temp_dir.path().join("out1")).unwrap();
    let backward = fuse_wheels(&arm64, &x86_64, &temp_dir.path().join("out2")).unwrap();

    assert_eq!(forward.file_name(), backward.file_name());
    assert_eq!(fs::read(&forward).unwrap(), fs::read(&backward).unwrap());
}

#[test]
fn test_fuse_rejects_differing_files() {
    let temp_dir = TempDir::new().unwrap();
    let x86_64 = arch_wheel(
        temp_dir.path(),
        "macosx_10_9_x86_64",
        TestArch::X86_64,
        Some(("fakepkg/conflict.txt", "left\n")),
    );
    let arm64 = arch_wheel(
        &temp_dir.path().join("other"),
        "macosx_11_0_arm64",
        TestArch::Arm64,
        Some(("fakepkg/conflict.txt", "right\n")),
    );

    let err = fuse_wheels(&x86_64, &arm64, &temp_dir.path().join("out")).unwrap_err();
    assert!(matches!(err, DelocateError::IrreconcilableFile { .. }));
}

#[test]
fn test_fuse_rejects_mismatched_wheels() {
    let temp_dir = TempDir::new().unwrap();
    let one = WheelBuilder::new("fakepkg", "1.0", "cp311-cp311-macosx_10_9_x86_64")
        .file("fakepkg/__init__.py", "")
        .build(temp_dir.path());
    let two = WheelBuilder::new("fakepkg", "2.0", "cp311-cp311-macosx_11_0_arm64")
        .file("fakepkg/__init__.py", "")
        .build(&temp_dir.path().join("other"));

    let err = fuse_wheels(&one, &two, &temp_dir.path().join("out")).unwrap_err();
    assert!(matches!(err, DelocateError::MismatchedWheels { .. }));
}

#[test]
fn test_fuse_rejects_overlapping_architectures() {
    let temp_dir = TempDir::new().unwrap();
    let one = arch_wheel(temp_dir.path(), "macosx_10_9_x86_64", TestArch::X86_64, None);
    let two = arch_wheel(
        &temp_dir.path().join("other"),
        "macosx_10_13_x86_64",
        TestArch::X86_64,
        None,
    );

    let err = fuse_wheels(&one, &two, &temp_dir.path().join("out")).unwrap_err();
    assert!(matches!(err, DelocateError::MismatchedWheels { .. }));
}
