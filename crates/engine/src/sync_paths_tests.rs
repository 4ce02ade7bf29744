// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use serial_test::serial;
use std::fs;

fn write(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, contents).unwrap();
}

#[test]
fn app_dir_alone_by_default() {
    let config = DispatcherConfig::builder().app_dir("/apps/suite").build();
    assert_eq!(dirs_to_mirror(&config), [PathBuf::from("/apps/suite")]);
}

#[test]
#[serial]
fn slave_code_adds_install_root_and_personal_log() {
    std::env::set_var(PERSONAL_LOG_VAR, "/home/tester/.texttest");
    let config = DispatcherConfig::builder()
        .app_dir("/apps/suite")
        .sync_slave_code(true)
        .install_root("/opt/toolkit")
        .build();
    assert_eq!(
        dirs_to_mirror(&config),
        [
            PathBuf::from("/apps/suite"),
            PathBuf::from("/opt/toolkit"),
            PathBuf::from("/home/tester/.texttest"),
        ]
    );
    std::env::remove_var(PERSONAL_LOG_VAR);
}

#[test]
#[serial]
fn personal_log_needs_the_slave_code_flag() {
    std::env::set_var(PERSONAL_LOG_VAR, "/home/tester/.texttest");
    let config = DispatcherConfig::builder().app_dir("/apps/suite").build();
    assert_eq!(dirs_to_mirror(&config), [PathBuf::from("/apps/suite")]);
    std::env::remove_var(PERSONAL_LOG_VAR);
}

#[test]
fn checkout_inside_app_dir_is_not_repeated() {
    let config = DispatcherConfig::builder()
        .app_dir("/apps/suite")
        .checkout("/apps/suite/src")
        .build();
    assert_eq!(dirs_to_mirror(&config), [PathBuf::from("/apps/suite")]);
}

#[test]
fn external_checkout_is_mirrored() {
    let tmp = tempfile::tempdir().unwrap();
    let checkout = tmp.path().join("checkout");
    fs::create_dir_all(&checkout).unwrap();
    let config = DispatcherConfig::builder()
        .app_dir("/apps/suite")
        .checkout(checkout.clone())
        .build();
    assert_eq!(dirs_to_mirror(&config), [PathBuf::from("/apps/suite"), checkout]);
}

#[test]
fn egg_links_resolve_to_the_setup_dir() {
    let tmp = tempfile::tempdir().unwrap();
    let checkout = tmp.path().join("checkout");
    let linked = tmp.path().join("linked");
    write(&linked.join("setup.py"), "from setuptools import setup\n");
    fs::create_dir_all(linked.join("src/module")).unwrap();
    write(
        &checkout.join("venv/pkg.egg-link"),
        &format!("{}\n.", linked.join("src/module").display()),
    );

    let dirs = virtualenv_linked_dirs(&checkout, Path::new("/usr"));
    assert_eq!(dirs, [linked]);
}

#[test]
fn egg_link_without_setup_py_is_ignored() {
    let tmp = tempfile::tempdir().unwrap();
    let checkout = tmp.path().join("checkout");
    let target = tmp.path().join("nowhere/src");
    fs::create_dir_all(&target).unwrap();
    write(&checkout.join("venv/pkg.egg-link"), &format!("{}\n", target.display()));

    assert!(virtualenv_linked_dirs(&checkout, Path::new("/usr")).is_empty());
}

#[test]
fn orig_prefix_is_mirrored_unless_it_is_the_interpreter() {
    let tmp = tempfile::tempdir().unwrap();
    let checkout = tmp.path().join("checkout");
    write(&checkout.join("venv-a/lib/orig-prefix.txt"), "/opt/other-python\n");
    write(&checkout.join("venv-b/lib/orig-prefix.txt"), "/usr\n");

    let dirs = virtualenv_linked_dirs(&checkout, Path::new("/usr"));
    assert_eq!(dirs, [PathBuf::from("/opt/other-python")]);
}

#[test]
fn linked_dirs_are_deduplicated_in_discovery_order() {
    let tmp = tempfile::tempdir().unwrap();
    let checkout = tmp.path().join("checkout");
    let linked = tmp.path().join("linked");
    write(&linked.join("setup.py"), "");
    write(&checkout.join("a.egg-link"), &format!("{}\n", linked.display()));
    write(&checkout.join("b.egg-link"), &format!("{}\n", linked.display()));
    write(&checkout.join("venv/orig-prefix.txt"), "/opt/base\n");

    let dirs = virtualenv_linked_dirs(&checkout, Path::new("/usr"));
    assert_eq!(dirs, [linked, PathBuf::from("/opt/base")]);
}

#[test]
fn full_resolution_preserves_order_and_suppresses_duplicates() {
    let tmp = tempfile::tempdir().unwrap();
    let checkout = tmp.path().join("checkout");
    let linked = tmp.path().join("linked");
    write(&linked.join("setup.py"), "");
    write(&checkout.join("pkg.egg-link"), &format!("{}\n", linked.display()));

    let config = DispatcherConfig::builder()
        .app_dir(tmp.path().join("apps"))
        .checkout(checkout.clone())
        .build();
    assert_eq!(dirs_to_mirror(&config), [tmp.path().join("apps"), checkout, linked]);
}
