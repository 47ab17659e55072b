// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The contract every disk storage strategy implements.

use crate::error::Error;
use async_trait::async_trait;
use pvm_client::types::StorageElement;
use pvm_client::util::{sanitize_file_name_for_api, FILENAME_MAX_LEN};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Bytes in a gigabyte, as the management API counts them.
pub const GIB: u64 = 1 << 30;

/// Capacity reported by strategies with no natural ceiling, in GB.
pub const UNBOUNDED_CAPACITY_GB: f64 = (1u64 << 21) as f64;

/// Purpose of a disk. The prefix becomes part of the disk's name, which lets
/// disconnect target one kind of disk on a VM.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DiskType {
    Boot,
    Rescue,
    Image,
}

impl DiskType {
    pub fn as_prefix(&self) -> &'static str {
        match self {
            DiskType::Boot => "boot",
            DiskType::Rescue => "rescue",
            DiskType::Image => "image",
        }
    }
}

impl std::fmt::Display for DiskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_prefix())
    }
}

/// Caller identity carried through to collaborators such as the image
/// service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub project_id: Option<String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self { request_id: Uuid::new_v4(), project_id: None }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// The VM that disks are created for.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub uuid: Uuid,
    pub name: String,
}

/// Image metadata as returned by the image service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMeta {
    pub id: String,
    pub name: String,
    /// Size of the image contents, in bytes.
    pub size: u64,
}

/// Identifies an existing disk of an instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskInfo {
    pub disk_type: DiskType,
}

/// Name of the disk of kind `disk_type` belonging to `instance`.
pub fn disk_name(
    disk_type: DiskType,
    instance: &Instance,
) -> Result<String, Error> {
    let prefix = format!("{}_", disk_type.as_prefix());
    Ok(sanitize_file_name_for_api(
        &instance.name,
        &prefix,
        "",
        FILENAME_MAX_LEN,
    )?)
}

/// Name of the storage copy of `image`.
pub fn image_name(image: &ImageMeta) -> Result<String, Error> {
    let prefix = format!("{}_", DiskType::Image.as_prefix());
    Ok(sanitize_file_name_for_api(&image.name, &prefix, "", FILENAME_MAX_LEN)?)
}

/// Converts a size in GB to bytes, never returning less than `floor`.
pub fn disk_gb_to_bytes(size_gb: u64, floor: Option<u64>) -> u64 {
    let disk_bytes = size_gb.saturating_mul(GIB);
    match floor {
        Some(floor) => disk_bytes.max(floor),
        None => disk_bytes,
    }
}

/// Management of the disks backing instances.
///
/// Mutating operations perform one read-modify-write of the entity they
/// change, starting from a fresh read. If another host wins the race the
/// write fails with an error for which [Error::is_conflict] is true, and
/// repeating the call is safe (see [crate::extend_disk_with_retry]).
#[async_trait]
pub trait DiskAdapter: Send + Sync {
    /// Name of the strategy, for logs.
    fn name(&self) -> &'static str;

    /// Capacity of the storage, in GB.
    async fn capacity(&self) -> Result<f64, Error> {
        Ok(UNBOUNDED_CAPACITY_GB)
    }

    /// Capacity of the storage in use, in GB.
    async fn capacity_used(&self) -> Result<f64, Error> {
        Ok(0.0)
    }

    /// Creates a disk of at least `disk_size_gb` for `instance`, holding the
    /// contents of `image`. The disk is never smaller than the image.
    async fn create_disk_from_image(
        &self,
        ctx: &RequestContext,
        instance: &Instance,
        image: &ImageMeta,
        disk_size_gb: u64,
        image_type: DiskType,
    ) -> Result<StorageElement, Error>;

    /// Maps `disk` to the VM `lpar_uuid`.
    async fn connect_disk(
        &self,
        ctx: &RequestContext,
        instance: &Instance,
        disk: &StorageElement,
        lpar_uuid: Uuid,
    ) -> Result<(), Error>;

    /// Removes the mappings of the VM's disks, or only those of the listed
    /// kinds. Returns the storage that was unmapped, which is left in place
    /// for [DiskAdapter::delete_disks].
    async fn disconnect_image_disk(
        &self,
        ctx: &RequestContext,
        instance: &Instance,
        lpar_uuid: Uuid,
        disk_types: Option<&[DiskType]>,
    ) -> Result<Vec<StorageElement>, Error>;

    /// Permanently removes `disks`.
    async fn delete_disks(
        &self,
        ctx: &RequestContext,
        instance: &Instance,
        disks: &[StorageElement],
    ) -> Result<(), Error>;

    /// Grows the disk described by `disk_info` to `size_gb`.
    async fn extend_disk(
        &self,
        ctx: &RequestContext,
        instance: &Instance,
        disk_info: &DiskInfo,
        size_gb: u64,
    ) -> Result<(), Error>;

    /// Runs on the destination host of a migration. Returns a token
    /// identifying this host's storage, or `None` if storage is never shared.
    async fn check_instance_shared_storage_local(
        &self,
        _ctx: &RequestContext,
        _instance: &Instance,
    ) -> Result<Option<serde_json::Value>, Error> {
        Ok(None)
    }

    /// Runs on the source host with the destination's token. Returns true if
    /// both hosts see the same storage.
    async fn check_instance_shared_storage_remote(
        &self,
        _ctx: &RequestContext,
        _data: Option<&serde_json::Value>,
    ) -> Result<bool, Error> {
        Ok(false)
    }

    async fn check_instance_shared_storage_cleanup(
        &self,
        _ctx: &RequestContext,
        _data: Option<&serde_json::Value>,
    ) -> Result<(), Error> {
        Ok(())
    }
}

pub(crate) fn disk_prefixes(
    disk_types: Option<&[DiskType]>,
) -> Option<Vec<String>> {
    disk_types.map(|types| {
        types.iter().map(|t| t.as_prefix().to_string()).collect()
    })
}
