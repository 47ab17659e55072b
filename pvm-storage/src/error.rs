// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Errors surfaced by the disk adapters

use crate::driver::DiskType;
use pvm_client::backoff::ConflictSignal;
use uuid::Uuid;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Unable to locate volume group {vg_name} on the host")]
    VgNotFound { vg_name: String },

    #[error("Unable to locate cluster by name {name}")]
    ClusterNotFoundByName { name: String },

    #[error("Unexpectedly found {count} clusters matching name {name}")]
    TooManyClustersFound { count: usize, name: String },

    #[error("No cluster name was configured and none were found on the host")]
    NoConfigNoClusterFound,

    #[error(
        "No cluster name was configured and {count} clusters were found on \
         the host; one must be chosen in the configuration"
    )]
    NoConfigTooManyClusters { count: usize },

    #[error("No {disk_type} disk named {name} found")]
    DiskNotFound { disk_type: DiskType, name: String },

    #[error(
        "No usable Virtual I/O Server in the cluster{}",
        host_filter(.host_uuid)
    )]
    NoViosAvailable { host_uuid: Option<Uuid> },

    #[error("{strategy} storage cannot operate on {name}: {reason}")]
    UnsupportedStorage {
        strategy: &'static str,
        name: String,
        reason: &'static str,
    },

    #[error("Failed to parse {field} {value:?} of volume group {vg_name}")]
    InvalidCapacity { vg_name: String, field: &'static str, value: String },

    #[error("Failed to download image {image_id}")]
    ImageDownload {
        image_id: String,
        #[source]
        err: anyhow::Error,
    },

    #[error(transparent)]
    Client(#[from] pvm_client::Error),
}

fn host_filter(host_uuid: &Option<Uuid>) -> String {
    match host_uuid {
        Some(host) => format!(" on host {host}"),
        None => String::new(),
    }
}

impl Error {
    /// Returns true if the remote service rejected a write because the
    /// entity changed since it was read.
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Client(err) => err.is_conflict(),
            _ => false,
        }
    }
}

impl ConflictSignal for Error {
    fn is_conflict(&self) -> bool {
        Error::is_conflict(self)
    }
}
