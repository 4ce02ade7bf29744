// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Dispatcher configuration.
//!
//! Loaded from the embedding program's config as a TOML table. The
//! submitting user falls back to the `USER`/`USERNAME` environment
//! variables, first non-empty wins.

use flo_core::tag::{TagFilter, TagFilterError};
use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or validating dispatcher configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot determine submitting user: set `user` or the USER/USERNAME environment variables")]
    MissingUser,
    #[error(transparent)]
    BadFilter(#[from] TagFilterError),
    #[error("invalid dispatcher config: {0}")]
    Parse(#[from] toml::de::Error),
}

fn default_max_capacity() -> u32 {
    100_000
}

fn default_interpreter_prefix() -> PathBuf {
    PathBuf::from("/usr")
}

fn default_slave_program() -> String {
    "texttest".to_string()
}

/// Configuration consumed by the dispatcher.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherConfig {
    /// Tag filters selecting candidate instances, each `NAME` or
    /// `NAME=GLOB` (the `queue_system_resource` config value).
    #[serde(default)]
    pub resource_filters: Vec<String>,
    /// Upper bound on the summed core budgets we initially try to claim
    /// (the `queue_system_max_capacity` config value).
    #[serde(default = "default_max_capacity")]
    pub max_capacity: u32,
    /// Mirror the toolkit's own code to slaves and run that instead of a
    /// central installation.
    #[serde(default)]
    pub sync_slave_code: bool,
    /// Application directory, mirrored to every slave.
    pub app_dir: PathBuf,
    /// Source checkout, mirrored when it lives outside `app_dir`.
    #[serde(default)]
    pub checkout: Option<PathBuf>,
    /// Toolkit installation root, mirrored with `sync_slave_code`.
    #[serde(default)]
    pub install_root: Option<PathBuf>,
    /// System interpreter prefix that virtualenv link discovery must
    /// never mirror.
    #[serde(default = "default_interpreter_prefix")]
    pub interpreter_prefix: PathBuf,
    /// Submitting user; when unset, resolved from the environment.
    #[serde(default)]
    pub user: Option<String>,
    /// Program slaves run when the local code is not mirrored.
    #[serde(default = "default_slave_program")]
    pub slave_program: String,
}

impl DispatcherConfig {
    /// Parse a TOML table.
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// The submitting user: the configured one, else `USER`, else
    /// `USERNAME` — first non-empty wins.
    pub fn resolve_user(&self) -> Result<String, ConfigError> {
        self.user
            .clone()
            .filter(|u| !u.is_empty())
            .or_else(|| std::env::var("USER").ok().filter(|u| !u.is_empty()))
            .or_else(|| std::env::var("USERNAME").ok().filter(|u| !u.is_empty()))
            .ok_or(ConfigError::MissingUser)
    }

    /// Parse the resource filters.
    pub fn parsed_filters(&self) -> Result<Vec<TagFilter>, ConfigError> {
        self.resource_filters
            .iter()
            .map(|raw| TagFilter::parse(raw).map_err(ConfigError::from))
            .collect()
    }
}

flo_core::builder! {
    pub struct DispatcherConfigBuilder => DispatcherConfig {
        into {
            app_dir: PathBuf = "/apps/suite",
            interpreter_prefix: PathBuf = "/usr",
            slave_program: String = "texttest",
        }
        set {
            resource_filters: Vec<String> = Vec::new(),
            max_capacity: u32 = default_max_capacity(),
            sync_slave_code: bool = false,
        }
        option {
            checkout: PathBuf = None,
            install_root: PathBuf = None,
            user: String = None,
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
