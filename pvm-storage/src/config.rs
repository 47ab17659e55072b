// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for working with disk adapter configuration

use camino::{Utf8Path, Utf8PathBuf};
use pvm_client::backoff::{conflict_retry_policy, ExponentialBackoff};
use serde::Deserialize;
use std::time::Duration;

/// Which storage strategy backs instance disks.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiskDriver {
    /// A Volume Group on one Virtual I/O Server.
    #[default]
    #[serde(rename = "localdisk")]
    LocalDisk,
    /// A Shared Storage Pool spanning a cluster of Virtual I/O Servers.
    Ssp,
}

/// Configuration for the disk adapters.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub disk_driver: DiskDriver,
    #[serde(default)]
    pub localdisk: LocalDiskConfig,
    #[serde(default)]
    pub ssp: SspConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct LocalDiskConfig {
    /// Volume Group holding instance disks.
    #[serde(default = "default_volume_group_name")]
    pub volume_group_name: String,
    /// Restricts the Volume Group search to the VIOS with this name.
    ///
    /// If unsupplied, the first VIOS on the host hosting a Volume Group named
    /// `volume_group_name` is used.
    pub volume_group_vios_name: Option<String>,
}

fn default_volume_group_name() -> String {
    "rootvg".to_string()
}

impl Default for LocalDiskConfig {
    fn default() -> Self {
        Self {
            volume_group_name: default_volume_group_name(),
            volume_group_vios_name: None,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct SspConfig {
    /// Cluster hosting the Shared Storage Pool. May be omitted if the host
    /// belongs to exactly one cluster.
    pub cluster_name: Option<String>,
}

/// Bounds on retrying writes that lose an etag race.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    /// Give up after this long. Retries forever if unset.
    pub max_elapsed_ms: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 250,
            max_interval_ms: 5_000,
            max_elapsed_ms: Some(60_000),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> ExponentialBackoff {
        conflict_retry_policy(
            Duration::from_millis(self.initial_interval_ms),
            Duration::from_millis(self.max_interval_ms),
            self.max_elapsed_ms.map(Duration::from_millis),
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config from {path}: {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("Failed to parse config from {path}: {err}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
}

impl Config {
    pub fn from_file<P: AsRef<Utf8Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::Io { path: path.into(), err })?;
        let config = toml::from_str(&contents)
            .map_err(|err| ConfigError::Parse { path: path.into(), err })?;
        Ok(config)
    }
}
