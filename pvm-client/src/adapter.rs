// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::types::{
    Cluster, LogicalUnit, PartitionInfo, SharedStoragePool, StorageElement,
    VirtualDisk, Vios, VolumeGroup,
};
use crate::Error;
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

/// Byte source for uploads. The adapter pulls from it until it returns 0.
pub type UploadStream = Box<dyn std::io::Read + Send>;

/// Describes the commonly-used "safe-to-reference" type describing the
/// Adapter as a trait object.
pub type BoxedAdapter = Arc<dyn Adapter>;

/// Request to create a new virtual disk in a Volume Group and fill it from
/// a stream.
pub struct VDiskUpload {
    pub vios_uuid: Uuid,
    pub vg_uuid: Uuid,
    pub stream: UploadStream,
    pub name: String,
    /// Number of bytes the stream will produce.
    pub f_size: u64,
    /// Size of the disk to create, in bytes. Never smaller than `f_size`.
    pub d_size: u64,
}

impl std::fmt::Debug for VDiskUpload {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("VDiskUpload")
            .field("vios_uuid", &self.vios_uuid)
            .field("vg_uuid", &self.vg_uuid)
            .field("name", &self.name)
            .field("f_size", &self.f_size)
            .field("d_size", &self.d_size)
            .finish_non_exhaustive()
    }
}

/// Session with the management console.
///
/// - In production this wraps the REST session.
/// - Under test, [crate::fakes::FakeAdapter] keeps everything in memory.
///
/// Writes are optimistic: `update_*` sends the etag carried by the snapshot
/// and fails with [Error::Conflict] if the server's copy has moved on.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Reads the feed of Virtual I/O Servers on a managed system.
    async fn read_vios_feed(
        &self,
        host_uuid: Uuid,
    ) -> Result<Vec<Vios>, Error>;

    async fn search_vios_by_name(
        &self,
        host_uuid: Uuid,
        name: &str,
    ) -> Result<Vec<Vios>, Error>;

    /// Reads the feed of Volume Groups hosted by one VIOS.
    async fn read_volume_groups(
        &self,
        host_uuid: Uuid,
        vios_uuid: Uuid,
    ) -> Result<Vec<VolumeGroup>, Error>;

    async fn read_volume_group(
        &self,
        host_uuid: Uuid,
        vios_uuid: Uuid,
        vg_uuid: Uuid,
    ) -> Result<VolumeGroup, Error>;

    async fn update_volume_group(
        &self,
        host_uuid: Uuid,
        vios_uuid: Uuid,
        vg: &VolumeGroup,
    ) -> Result<VolumeGroup, Error>;

    /// Reads every cluster visible to the console.
    async fn read_clusters(&self) -> Result<Vec<Cluster>, Error>;

    async fn search_clusters_by_name(
        &self,
        name: &str,
    ) -> Result<Vec<Cluster>, Error>;

    /// Re-reads a cluster, returning the server's current version of it.
    async fn refresh_cluster(
        &self,
        cluster: &Cluster,
    ) -> Result<Cluster, Error>;

    async fn read_ssp_by_href(
        &self,
        href: &str,
    ) -> Result<SharedStoragePool, Error>;

    async fn refresh_ssp(
        &self,
        ssp: &SharedStoragePool,
    ) -> Result<SharedStoragePool, Error>;

    async fn update_ssp(
        &self,
        ssp: &SharedStoragePool,
    ) -> Result<SharedStoragePool, Error>;

    /// Reads the live placement attributes of a partition.
    async fn read_partition(
        &self,
        lpar_uuid: Uuid,
    ) -> Result<PartitionInfo, Error>;

    /// Creates a virtual disk and streams its contents.
    async fn upload_new_vdisk(
        &self,
        upload: VDiskUpload,
    ) -> Result<VirtualDisk, Error>;

    /// Creates an image LU in the pool through `vios_uuid` and streams its
    /// contents.
    async fn upload_new_lu(
        &self,
        vios_uuid: Uuid,
        ssp: &SharedStoragePool,
        stream: UploadStream,
        lu_name: &str,
        f_size: u64,
    ) -> Result<LogicalUnit, Error>;

    /// Creates a disk LU as a linked clone of `image_lu`, returning the
    /// updated pool along with the new LU.
    async fn create_lu_linked_clone(
        &self,
        ssp: &SharedStoragePool,
        cluster: &Cluster,
        image_lu: &LogicalUnit,
        lu_name: &str,
        size_gb: u64,
    ) -> Result<(SharedStoragePool, LogicalUnit), Error>;

    async fn add_vscsi_mapping(
        &self,
        host_uuid: Uuid,
        vios_uuid: Uuid,
        lpar_uuid: Uuid,
        storage: &StorageElement,
    ) -> Result<(), Error>;

    /// Removes virtual-disk mappings to a partition, optionally limited to
    /// disks whose names start with one of `disk_prefixes`. Returns the
    /// disks that were unmapped.
    async fn remove_vdisk_mapping(
        &self,
        vios_uuid: Uuid,
        lpar_id: u32,
        disk_prefixes: Option<&[String]>,
    ) -> Result<Vec<VirtualDisk>, Error>;

    /// As [Adapter::remove_vdisk_mapping], for logical units.
    async fn remove_lu_mapping(
        &self,
        vios_uuid: Uuid,
        lpar_id: u32,
        disk_prefixes: Option<&[String]>,
    ) -> Result<Vec<LogicalUnit>, Error>;
}
