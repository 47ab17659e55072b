// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client-side model of the PowerVM management REST API.
//!
//! The management console owns every entity described here. Callers hold
//! snapshots of those entities, each carrying the [`types::Etag`] it was read
//! at, and write them back through an [`Adapter`]. A write whose etag no longer
//! matches the server's copy is rejected with [`Error::Conflict`], and the
//! caller is expected to re-read and try again (see [`backoff`]).

mod adapter;
pub mod backoff;
#[cfg(any(test, feature = "testing"))]
pub mod fakes;
pub mod types;
pub mod util;

pub use adapter::{Adapter, BoxedAdapter, UploadStream, VDiskUpload};

#[derive(Debug)]
pub struct HttpFailureInfo {
    pub method: &'static str,
    pub path: String,
    pub status: u16,
    pub reason: String,
}

impl std::fmt::Display for HttpFailureInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Request [{} {}] failed with status {}: {}",
            self.method, self.path, self.status, self.reason
        )
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Entity not found at {path}")]
    NotFound { path: String },

    /// The entity changed on the server since it was read.
    #[error("Update of {path} rejected: etag {etag} is stale")]
    Conflict { path: String, etag: String },

    #[error("{0}")]
    Http(Box<HttpFailureInfo>),

    #[error("Failed to read upload stream for {name}: {err}")]
    Upload {
        name: String,
        #[source]
        err: std::io::Error,
    },

    #[error("Invalid name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("No UUID found in href {href:?}")]
    InvalidHref { href: String },
}

impl Error {
    pub fn http(
        method: &'static str,
        path: impl Into<String>,
        status: u16,
        reason: impl Into<String>,
    ) -> Self {
        Error::Http(Box::new(HttpFailureInfo {
            method,
            path: path.into(),
            status,
            reason: reason.into(),
        }))
    }

    /// Returns true if this is an optimistic-concurrency rejection.
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Http(info) => info.status == 412,
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Http(info) => info.status == 404,
            _ => false,
        }
    }
}

impl backoff::ConflictSignal for Error {
    fn is_conflict(&self) -> bool {
        Error::is_conflict(self)
    }
}
