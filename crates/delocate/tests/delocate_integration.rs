//! Integration tests for wheel delocate functionality.

use std::path::{Path, PathBuf};

use fs_err as fs;
use tempfile::TempDir;

use delocate::macho::parse_macho;
use delocate::wheel::{find_dist_info, verify_record};
use delocate::{
    delocate_path, delocate_wheel, list_wheel_dependencies, Arch, DelocateError, DelocateOptions,
    MacOSVersion,
};

mod common;
use common::{fat, unpack, DylibBuilder, TestArch, WheelBuilder};

const TAG: &str = "cp311-cp311-macosx_10_9_x86_64";

/// A wheel whose `fakepkg/ext.so` depends on the given raw install names.
fn wheel_with_ext(dir: &Path, dependencies: &[&str]) -> PathBuf {
    let mut ext = DylibBuilder::bundle();
    for dependency in dependencies {
        ext = ext.depends_on(dependency);
    }
    WheelBuilder::new("fakepkg", "1.0", TAG)
        .file("fakepkg/__init__.py", "")
        .file("fakepkg/module.py", "answer = 42\n")
        .file("fakepkg/ext.so", ext.build())
        .top_level("fakepkg\n")
        .build(dir)
}

#[test]
fn test_delocate_copies_external_library() {
    let temp_dir = TempDir::new().unwrap();
    let libfoo = temp_dir.path().join("opt").join("libfoo.1.dylib");
    DylibBuilder::dylib("/opt/x/libfoo.1.dylib")
        .depends_on("/usr/lib/libSystem.B.dylib")
        .write(&libfoo);

    let wheel = wheel_with_ext(temp_dir.path(), &[libfoo.to_str().unwrap()]);
    let out_dir = temp_dir.path().join("out");
    let out_wheel = delocate_wheel(&wheel, &out_dir, &DelocateOptions::default()).unwrap();
    assert_eq!(out_wheel.file_name(), wheel.file_name());

    let tree = unpack(&out_wheel, &temp_dir.path().join("tree"));

    // The library was copied into the package sidecar.
    let copy = tree.join("fakepkg/.dylibs/libfoo.1.dylib");
    assert!(copy.exists());

    // The extension now resolves it relative to itself.
    let ext = parse_macho(&tree.join("fakepkg/ext.so")).unwrap();
    assert_eq!(
        ext.dependencies,
        vec!["@loader_path/.dylibs/libfoo.1.dylib".to_string()]
    );

    // The copy is self-named so it loads from its own directory.
    let copied = parse_macho(&copy).unwrap();
    assert_eq!(
        copied.install_name.as_deref(),
        Some("@loader_path/libfoo.1.dylib")
    );
    // System dependencies are left alone.
    assert_eq!(
        copied.dependencies,
        vec!["/usr/lib/libSystem.B.dylib".to_string()]
    );

    // The rewritten wheel carries a consistent RECORD.
    let dist_info = find_dist_info(&tree).unwrap();
    verify_record(&tree, &dist_info).unwrap();
}

#[test]
fn test_delocate_transitive_rpath_dependency() {
    let temp_dir = TempDir::new().unwrap();
    let opt = temp_dir.path().join("opt");
    let liba = opt.join("liba.dylib");
    let libb = opt.join("libb.dylib");
    DylibBuilder::dylib("liba.dylib").write(&liba);
    DylibBuilder::dylib("/opt/x/libb.dylib")
        .depends_on("@rpath/liba.dylib")
        .write(&libb);

    // The rpath satisfying libb's reference is set on the parent loader.
    let ext = DylibBuilder::bundle()
        .depends_on(libb.to_str().unwrap())
        .rpath(opt.to_str().unwrap());
    let wheel = WheelBuilder::new("fakepkg", "1.0", TAG)
        .file("fakepkg/__init__.py", "")
        .file("fakepkg/ext.so", ext.build())
        .top_level("fakepkg\n")
        .build(temp_dir.path());

    let out_dir = temp_dir.path().join("out");
    let out_wheel = delocate_wheel(&wheel, &out_dir, &DelocateOptions::default()).unwrap();
    let tree = unpack(&out_wheel, &temp_dir.path().join("tree"));

    // Both libraries land in the sidecar.
    assert!(tree.join("fakepkg/.dylibs/libb.dylib").exists());
    assert!(tree.join("fakepkg/.dylibs/liba.dylib").exists());

    // The copied libb references its sibling directly.
    let copied_b = parse_macho(&tree.join("fakepkg/.dylibs/libb.dylib")).unwrap();
    assert_eq!(
        copied_b.dependencies,
        vec!["@loader_path/liba.dylib".to_string()]
    );

    // The out-of-tree rpath was removed from the extension.
    let ext = parse_macho(&tree.join("fakepkg/ext.so")).unwrap();
    assert!(ext.rpaths.is_empty());
    assert_eq!(
        ext.dependencies,
        vec!["@loader_path/.dylibs/libb.dylib".to_string()]
    );
}

#[test]
fn test_delocate_missing_bare_name_dependency() {
    let temp_dir = TempDir::new().unwrap();
    let wheel = wheel_with_ext(temp_dir.path(), &["libme.dylib"]);

    let err = delocate_wheel(
        &wheel,
        &temp_dir.path().join("out"),
        &DelocateOptions::default(),
    )
    .unwrap_err();

    let DelocateError::DependencyNotFound {
        install_name,
        loader,
    } = err
    else {
        panic!("expected DependencyNotFound, got {err:?}");
    };
    assert_eq!(install_name, "libme.dylib");
    assert!(loader.ends_with("fakepkg/ext.so"));
}

#[test]
fn test_delocate_architecture_deficit() {
    let temp_dir = TempDir::new().unwrap();
    let libfoo = temp_dir.path().join("opt").join("libfoo.1.dylib");
    DylibBuilder::dylib("libfoo.1.dylib").write(&libfoo);

    // The extension is universal, the library x86_64-only.
    let ext = fat(&[
        DylibBuilder::bundle()
            .depends_on(libfoo.to_str().unwrap())
            .build(),
        DylibBuilder::bundle()
            .arch(TestArch::Arm64)
            .depends_on(libfoo.to_str().unwrap())
            .build(),
    ]);
    let wheel = WheelBuilder::new("fakepkg", "1.0", TAG)
        .file("fakepkg/__init__.py", "")
        .file("fakepkg/ext.so", ext)
        .top_level("fakepkg\n")
        .build(temp_dir.path());

    let options = DelocateOptions {
        require_archs: vec![Arch::X86_64, Arch::Arm64],
        ..Default::default()
    };
    let err = delocate_wheel(&wheel, &temp_dir.path().join("out"), &options).unwrap_err();

    let DelocateError::ArchitectureDeficit { report } = err else {
        panic!("expected ArchitectureDeficit, got {err:?}");
    };
    assert!(report.contains("arm64"));
    assert!(report.contains("libfoo.1.dylib"));
}

#[test]
fn test_delocate_basename_collision() {
    let temp_dir = TempDir::new().unwrap();
    let first = temp_dir.path().join("opt/a/libsame.dylib");
    let second = temp_dir.path().join("opt/b/libsame.dylib");
    DylibBuilder::dylib("libsame.dylib").write(&first);
    DylibBuilder::dylib("libsame.dylib")
        .depends_on("/usr/lib/libSystem.B.dylib")
        .write(&second);

    let wheel = wheel_with_ext(
        temp_dir.path(),
        &[first.to_str().unwrap(), second.to_str().unwrap()],
    );
    let out_wheel = delocate_wheel(
        &wheel,
        &temp_dir.path().join("out"),
        &DelocateOptions::default(),
    )
    .unwrap();
    let tree = unpack(&out_wheel, &temp_dir.path().join("tree"));

    // Both copies exist under disambiguated names.
    let sidecar = tree.join("fakepkg/.dylibs");
    let mut names: Vec<String> = fs::read_dir(&sidecar)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names.len(), 2);
    assert!(names.iter().all(|name| name.ends_with("libsame.dylib")));
    assert!(names.contains(&"libsame.dylib".to_string()));

    // The extension references both, distinctly, and each copy is
    // self-named after its disambiguated basename.
    let ext = parse_macho(&tree.join("fakepkg/ext.so")).unwrap();
    assert_eq!(ext.dependencies.len(), 2);
    for dependency in &ext.dependencies {
        assert!(dependency.starts_with("@loader_path/.dylibs/"));
        assert!(dependency.ends_with("libsame.dylib"));
    }
    assert_ne!(ext.dependencies[0], ext.dependencies[1]);
    for name in &names {
        let copied = parse_macho(&sidecar.join(name)).unwrap();
        assert_eq!(
            copied.install_name.as_deref(),
            Some(format!("@loader_path/{name}").as_str())
        );
    }
}

#[test]
fn test_delocate_is_idempotent() {
    std::env::set_var("SOURCE_DATE_EPOCH", "1577836800");

    let temp_dir = TempDir::new().unwrap();
    let libfoo = temp_dir.path().join("opt").join("libfoo.1.dylib");
    DylibBuilder::dylib("libfoo.1.dylib").write(&libfoo);
    let wheel = wheel_with_ext(temp_dir.path(), &[libfoo.to_str().unwrap()]);

    let once = delocate_wheel(
        &wheel,
        &temp_dir.path().join("out1"),
        &DelocateOptions::default(),
    )
    .unwrap();
    let twice = delocate_wheel(
        &once,
        &temp_dir.path().join("out2"),
        &DelocateOptions::default(),
    )
    .unwrap();

    assert_eq!(fs::read(&once).unwrap(), fs::read(&twice).unwrap());
}

#[test]
fn test_delocate_pure_python_wheel() {
    let temp_dir = TempDir::new().unwrap();
    let wheel = WheelBuilder::new("fakepkg2", "1.0", "py3-none-any")
        .file("fakepkg2/__init__.py", "")
        .top_level("fakepkg2\n")
        .build(temp_dir.path());

    // Pure Python wheel should have no external dependencies.
    let deps = list_wheel_dependencies(&wheel).unwrap();
    assert!(deps.is_empty());

    let out_wheel = delocate_wheel(
        &wheel,
        &temp_dir.path().join("out"),
        &DelocateOptions::default(),
    )
    .unwrap();
    assert_eq!(
        out_wheel.file_name().unwrap(),
        "fakepkg2-1.0-py3-none-any.whl"
    );

    // No sidecar appears in the output.
    let tree = unpack(&out_wheel, &temp_dir.path().join("tree"));
    assert!(!tree.join("fakepkg2/.dylibs").exists());
    assert!(!tree.join("fakepkg2.dylibs").exists());
}

#[test]
fn test_delocate_exclude_filter() {
    let temp_dir = TempDir::new().unwrap();
    let libfoo = temp_dir.path().join("opt").join("libfoo.1.dylib");
    DylibBuilder::dylib("libfoo.1.dylib").write(&libfoo);
    let raw_name = libfoo.to_str().unwrap().to_string();
    let wheel = wheel_with_ext(temp_dir.path(), &[&raw_name]);

    let options = DelocateOptions {
        exclude: vec!["libfoo".to_string()],
        ..Default::default()
    };
    let out_wheel = delocate_wheel(&wheel, &temp_dir.path().join("out"), &options).unwrap();
    let tree = unpack(&out_wheel, &temp_dir.path().join("tree"));

    // The excluded library is neither copied nor rewritten.
    assert!(!tree.join("fakepkg/.dylibs").exists());
    let ext = parse_macho(&tree.join("fakepkg/ext.so")).unwrap();
    assert_eq!(ext.dependencies, vec![raw_name]);
}

#[test]
fn test_delocate_bumps_deployment_target() {
    let temp_dir = TempDir::new().unwrap();
    let libfoo = temp_dir.path().join("opt").join("libfoo.1.dylib");
    DylibBuilder::dylib("libfoo.1.dylib")
        .min_macos(11, 0)
        .write(&libfoo);
    let wheel = wheel_with_ext(temp_dir.path(), &[libfoo.to_str().unwrap()]);

    let out_wheel = delocate_wheel(
        &wheel,
        &temp_dir.path().join("out"),
        &DelocateOptions::default(),
    )
    .unwrap();

    // The platform tag follows the library's requirement.
    assert_eq!(
        out_wheel.file_name().unwrap(),
        "fakepkg-1.0-cp311-cp311-macosx_11_0_x86_64.whl"
    );
    let tree = unpack(&out_wheel, &temp_dir.path().join("tree"));
    let wheel_metadata =
        fs::read_to_string(tree.join("fakepkg-1.0.dist-info").join("WHEEL")).unwrap();
    assert!(wheel_metadata.contains("Tag: cp311-cp311-macosx_11_0_x86_64"));
    assert!(!wheel_metadata.contains("macosx_10_9"));
}

#[test]
fn test_delocate_pinned_deployment_target_fails() {
    let temp_dir = TempDir::new().unwrap();
    let libfoo = temp_dir.path().join("opt").join("libfoo.1.dylib");
    DylibBuilder::dylib("libfoo.1.dylib")
        .min_macos(11, 0)
        .write(&libfoo);
    let wheel = wheel_with_ext(temp_dir.path(), &[libfoo.to_str().unwrap()]);

    let options = DelocateOptions {
        require_target_macos_version: Some(MacOSVersion::new(10, 9)),
        ..Default::default()
    };
    let err = delocate_wheel(&wheel, &temp_dir.path().join("out"), &options).unwrap_err();
    assert!(matches!(
        err,
        DelocateError::IncompatibleMacOSVersion { .. }
    ));
}

#[test]
fn test_delocate_multiple_packages_get_own_sidecars() {
    let temp_dir = TempDir::new().unwrap();
    let libfoo = temp_dir.path().join("opt").join("libfoo.1.dylib");
    DylibBuilder::dylib("libfoo.1.dylib").write(&libfoo);
    let raw_name = libfoo.to_str().unwrap();

    let wheel = WheelBuilder::new("fakepkg", "1.0", TAG)
        .file("pkg_a/__init__.py", "")
        .file(
            "pkg_a/ext_a.so",
            DylibBuilder::bundle().depends_on(raw_name).build(),
        )
        .file("pkg_b/__init__.py", "")
        .file(
            "pkg_b/ext_b.so",
            DylibBuilder::bundle().depends_on(raw_name).build(),
        )
        .top_level("pkg_a\npkg_b\n")
        .build(temp_dir.path());

    let out_wheel = delocate_wheel(
        &wheel,
        &temp_dir.path().join("out"),
        &DelocateOptions::default(),
    )
    .unwrap();
    let tree = unpack(&out_wheel, &temp_dir.path().join("tree"));

    // Each depending package carries its own copy.
    for package in ["pkg_a", "pkg_b"] {
        assert!(tree.join(package).join(".dylibs/libfoo.1.dylib").exists());
    }
    let ext_a = parse_macho(&tree.join("pkg_a/ext_a.so")).unwrap();
    assert_eq!(
        ext_a.dependencies,
        vec!["@loader_path/.dylibs/libfoo.1.dylib".to_string()]
    );
}

#[cfg(unix)]
#[test]
fn test_delocate_read_only_library_keeps_mode() {
    use std::os::unix::fs::PermissionsExt;

    let temp_dir = TempDir::new().unwrap();
    let libfoo = temp_dir.path().join("opt").join("libfoo.1.dylib");
    DylibBuilder::dylib("libfoo.1.dylib").write(&libfoo);

    // A read-only in-wheel library that must be relinked.
    let wheel = WheelBuilder::new("fakepkg", "1.0", TAG)
        .file("fakepkg/__init__.py", "")
        .file_with_mode(
            "fakepkg/libbar.dylib",
            DylibBuilder::dylib("libbar.dylib")
                .depends_on(libfoo.to_str().unwrap())
                .build(),
            0o444,
        )
        .top_level("fakepkg\n")
        .build(temp_dir.path());

    let out_wheel = delocate_wheel(
        &wheel,
        &temp_dir.path().join("out"),
        &DelocateOptions::default(),
    )
    .unwrap();
    let tree = unpack(&out_wheel, &temp_dir.path().join("tree"));

    // The relink happened and the mode bits are unchanged.
    let libbar = tree.join("fakepkg/libbar.dylib");
    let macho = parse_macho(&libbar).unwrap();
    assert_eq!(
        macho.dependencies,
        vec!["@loader_path/.dylibs/libfoo.1.dylib".to_string()]
    );
    let mode = fs::metadata(&libbar).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o444);
}

#[test]
fn test_delocate_path_in_place() {
    let temp_dir = TempDir::new().unwrap();
    let libfoo = temp_dir.path().join("opt").join("libfoo.1.dylib");
    DylibBuilder::dylib("libfoo.1.dylib").write(&libfoo);

    let tree = temp_dir.path().join("tree");
    let ext = tree.join("ext.so");
    DylibBuilder::bundle()
        .depends_on(libfoo.to_str().unwrap())
        .write(&ext);

    let lib_path = tree.join(".dylibs");
    let copied = delocate_path(&tree, &lib_path, &DelocateOptions::default()).unwrap();
    assert_eq!(copied.len(), 1);

    assert!(lib_path.join("libfoo.1.dylib").exists());
    let ext = parse_macho(&ext).unwrap();
    assert_eq!(
        ext.dependencies,
        vec!["@loader_path/.dylibs/libfoo.1.dylib".to_string()]
    );
}
