// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Resolution of the local directories mirrored to each instance.
//!
//! Virtual environments complicate the checkout: egg-links are a sort
//! of portable symbolic link that transfer tools do not understand, and
//! a virtualenv can also point at the environment it was created from.
//! Both get resolved to real directories and mirrored alongside.

use crate::config::DispatcherConfig;
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable naming an extra personal log directory to
/// mirror when slave code is synchronized.
pub const PERSONAL_LOG_VAR: &str = "TEXTTEST_PERSONAL_LOG";

/// The set of local directories mirrored to every owned instance.
/// Order preserved, duplicates suppressed.
pub fn dirs_to_mirror(config: &DispatcherConfig) -> Vec<PathBuf> {
    let mut dirs = vec![config.app_dir.clone()];
    if config.sync_slave_code {
        if let Some(root) = &config.install_root {
            push_unique(&mut dirs, root.clone());
        }
        if let Ok(log) = std::env::var(PERSONAL_LOG_VAR) {
            if !log.is_empty() {
                push_unique(&mut dirs, PathBuf::from(log));
            }
        }
    }
    if let Some(checkout) = &config.checkout {
        if !checkout.starts_with(&config.app_dir) {
            push_unique(&mut dirs, checkout.clone());
            for dir in virtualenv_linked_dirs(checkout, &config.interpreter_prefix) {
                push_unique(&mut dirs, dir);
            }
        }
    }
    dirs
}

fn push_unique(dirs: &mut Vec<PathBuf>, dir: PathBuf) {
    if !dirs.contains(&dir) {
        dirs.push(dir);
    }
}

/// Directories the checkout's virtual environments link out to.
///
/// Walks the checkout recursively; within each directory files are
/// visited in name order before subdirectories.
pub fn virtualenv_linked_dirs(checkout: &Path, interpreter_prefix: &Path) -> Vec<PathBuf> {
    let mut linked = Vec::new();
    collect_linked_dirs(checkout, interpreter_prefix, &mut linked);
    linked
}

fn collect_linked_dirs(dir: &Path, interpreter_prefix: &Path, linked: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else { return };
    let mut files = Vec::new();
    let mut subdirs = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            subdirs.push(path);
        } else {
            files.push(path);
        }
    }
    files.sort();
    subdirs.sort();

    for path in files {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
        if name.ends_with(".egg-link") {
            // The egg-link points at the package code, which may not be
            // all of the checkout; assume the setup.py is where it starts.
            if let Some(target) = first_nonempty_line(&path) {
                if let Some(setup_dir) = find_setup_dir(Path::new(&target)) {
                    if !linked.contains(&setup_dir) {
                        linked.push(setup_dir);
                    }
                }
            }
        } else if name == "orig-prefix.txt" {
            if let Ok(contents) = fs::read_to_string(&path) {
                let prefix = PathBuf::from(contents.trim());
                // Don't try to mirror the system interpreter
                if prefix != interpreter_prefix && !linked.contains(&prefix) {
                    linked.push(prefix);
                }
            }
        }
    }
    for sub in subdirs {
        collect_linked_dirs(&sub, interpreter_prefix, linked);
    }
}

fn first_nonempty_line(path: &Path) -> Option<String> {
    let contents = fs::read_to_string(path).ok()?;
    contents.lines().map(str::trim).find(|line| !line.is_empty()).map(str::to_string)
}

/// Ascend from `start` until a directory containing `setup.py` is found.
fn find_setup_dir(start: &Path) -> Option<PathBuf> {
    let mut dir = start;
    loop {
        if dir.join("setup.py").is_file() {
            return Some(dir.to_path_buf());
        }
        dir = dir.parent()?;
    }
}

#[cfg(test)]
#[path = "sync_paths_tests.rs"]
mod tests;
