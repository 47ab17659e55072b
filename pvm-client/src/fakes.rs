// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A fake implementation of [crate::Adapter].
//!
//! [FakeAdapter] keeps every entity in memory and behaves like the console
//! where it matters to callers: each write bumps the entity's etag, and a
//! write carrying a stale etag is rejected with [Error::Conflict].

use crate::adapter::{Adapter, UploadStream, VDiskUpload};
use crate::types::{
    Cluster, Etag, LogicalUnit, LuType, Node, PartitionInfo,
    SharedStoragePool, StorageElement, VirtualDisk, Vios, VolumeGroup,
};
use crate::Error;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::Read;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

const GIB: f64 = (1u64 << 30) as f64;

/// Record of a stream the fake consumed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FakeUpload {
    pub name: String,
    pub vios_uuid: Uuid,
    pub f_size: u64,
    pub d_size: u64,
    pub bytes_read: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FakeMapping {
    pub host_uuid: Uuid,
    pub vios_uuid: Uuid,
    pub lpar_uuid: Uuid,
    pub lpar_id: u32,
    pub storage: StorageElement,
}

#[derive(Default)]
struct FakeAdapterInner {
    generation: u64,
    vioses: Vec<(Uuid, Vios)>,
    volume_groups: Vec<(Uuid, VolumeGroup)>,
    clusters: Vec<Cluster>,
    ssps: Vec<SharedStoragePool>,
    partitions: BTreeMap<Uuid, PartitionInfo>,
    mappings: Vec<FakeMapping>,
    uploads: Vec<FakeUpload>,
    calls: BTreeMap<&'static str, usize>,
    pending_conflicts: usize,
}

impl FakeAdapterInner {
    fn record(&mut self, op: &'static str) {
        *self.calls.entry(op).or_insert(0) += 1;
    }

    fn next_etag(&mut self) -> Option<Etag> {
        self.generation += 1;
        Some(Etag(format!("etag-{}", self.generation)))
    }

    fn next_udid(prefix: &str) -> String {
        format!("{prefix}{}", Uuid::new_v4().simple())
    }

    // Simulates another writer having won the race: the stored copy moves
    // to a new version and the caller's write is rejected.
    fn take_injected_conflict(&mut self) -> bool {
        if self.pending_conflicts > 0 {
            self.pending_conflicts -= 1;
            true
        } else {
            false
        }
    }

    fn volume_group_mut(
        &mut self,
        vios_uuid: Uuid,
        vg_uuid: Uuid,
    ) -> Result<&mut VolumeGroup, Error> {
        self.volume_groups
            .iter_mut()
            .find(|(v, vg)| *v == vios_uuid && vg.uuid == vg_uuid)
            .map(|(_, vg)| vg)
            .ok_or_else(|| Error::NotFound {
                path: format!(
                    "/VirtualIOServer/{vios_uuid}/VolumeGroup/{vg_uuid}"
                ),
            })
    }

    fn ssp_index(&self, uuid: Uuid) -> Result<usize, Error> {
        self.ssps.iter().position(|ssp| ssp.uuid == uuid).ok_or_else(|| {
            Error::NotFound { path: format!("/SharedStoragePool/{uuid}") }
        })
    }
}

/// In-memory stand-in for the management console.
#[derive(Clone, Default)]
pub struct FakeAdapter {
    inner: Arc<Mutex<FakeAdapterInner>>,
}

impl FakeAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Perform some type coercion to access a commonly-used trait object.
    pub fn as_adapter(self: Arc<Self>) -> crate::BoxedAdapter {
        self
    }

    pub fn add_vios(&self, host_uuid: Uuid, vios: Vios) {
        self.inner.lock().unwrap().vioses.push((host_uuid, vios));
    }

    pub fn add_volume_group(&self, vios_uuid: Uuid, mut vg: VolumeGroup) {
        let mut inner = self.inner.lock().unwrap();
        vg.etag = inner.next_etag();
        inner.volume_groups.push((vios_uuid, vg));
    }

    pub fn add_cluster(&self, mut cluster: Cluster) {
        let mut inner = self.inner.lock().unwrap();
        cluster.etag = inner.next_etag();
        inner.clusters.push(cluster);
    }

    pub fn add_ssp(&self, mut ssp: SharedStoragePool) {
        let mut inner = self.inner.lock().unwrap();
        ssp.etag = inner.next_etag();
        inner.ssps.push(ssp);
    }

    pub fn add_partition(&self, lpar_uuid: Uuid, info: PartitionInfo) {
        self.inner.lock().unwrap().partitions.insert(lpar_uuid, info);
    }

    pub fn add_mapping(&self, mapping: FakeMapping) {
        self.inner.lock().unwrap().mappings.push(mapping);
    }

    /// Replaces the nodes of a stored cluster, as if the cluster had been
    /// reconfigured from another host.
    pub fn set_cluster_nodes(&self, cluster_uuid: Uuid, nodes: Vec<Node>) {
        let mut inner = self.inner.lock().unwrap();
        let etag = inner.next_etag();
        if let Some(cluster) =
            inner.clusters.iter_mut().find(|c| c.uuid == cluster_uuid)
        {
            cluster.nodes = nodes;
            cluster.etag = etag;
        }
    }

    /// Applies `f` to a stored pool and bumps its etag, as another host
    /// writing to the cluster would.
    pub fn modify_ssp<F>(&self, ssp_uuid: Uuid, f: F)
    where
        F: FnOnce(&mut SharedStoragePool),
    {
        let mut inner = self.inner.lock().unwrap();
        let etag = inner.next_etag();
        if let Some(ssp) = inner.ssps.iter_mut().find(|s| s.uuid == ssp_uuid) {
            f(ssp);
            ssp.etag = etag;
        }
    }

    /// Makes the next `count` updates fail with [Error::Conflict].
    pub fn inject_conflicts(&self, count: usize) {
        self.inner.lock().unwrap().pending_conflicts = count;
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.inner.lock().unwrap().calls.get(op).copied().unwrap_or(0)
    }

    pub fn volume_group(&self, vg_uuid: Uuid) -> Option<VolumeGroup> {
        self.inner
            .lock()
            .unwrap()
            .volume_groups
            .iter()
            .find(|(_, vg)| vg.uuid == vg_uuid)
            .map(|(_, vg)| vg.clone())
    }

    pub fn ssp(&self, ssp_uuid: Uuid) -> Option<SharedStoragePool> {
        self.inner
            .lock()
            .unwrap()
            .ssps
            .iter()
            .find(|ssp| ssp.uuid == ssp_uuid)
            .cloned()
    }

    pub fn mappings(&self) -> Vec<FakeMapping> {
        self.inner.lock().unwrap().mappings.clone()
    }

    pub fn uploads(&self) -> Vec<FakeUpload> {
        self.inner.lock().unwrap().uploads.clone()
    }
}

fn drain(name: &str, mut stream: UploadStream) -> Result<u64, Error> {
    let mut buf = [0u8; 4096];
    let mut total = 0u64;
    loop {
        let n = stream
            .read(&mut buf)
            .map_err(|err| Error::Upload { name: name.to_string(), err })?;
        if n == 0 {
            return Ok(total);
        }
        total += n as u64;
    }
}

fn prefix_matches(name: &str, disk_prefixes: Option<&[String]>) -> bool {
    match disk_prefixes {
        None => true,
        Some(prefixes) => prefixes.iter().any(|p| name.starts_with(p.as_str())),
    }
}

#[async_trait]
impl Adapter for FakeAdapter {
    async fn read_vios_feed(
        &self,
        host_uuid: Uuid,
    ) -> Result<Vec<Vios>, Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.record("read_vios_feed");
        Ok(inner
            .vioses
            .iter()
            .filter(|(host, _)| *host == host_uuid)
            .map(|(_, vios)| vios.clone())
            .collect())
    }

    async fn search_vios_by_name(
        &self,
        host_uuid: Uuid,
        name: &str,
    ) -> Result<Vec<Vios>, Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.record("search_vios_by_name");
        Ok(inner
            .vioses
            .iter()
            .filter(|(host, vios)| *host == host_uuid && vios.name == name)
            .map(|(_, vios)| vios.clone())
            .collect())
    }

    async fn read_volume_groups(
        &self,
        _host_uuid: Uuid,
        vios_uuid: Uuid,
    ) -> Result<Vec<VolumeGroup>, Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.record("read_volume_groups");
        Ok(inner
            .volume_groups
            .iter()
            .filter(|(vios, _)| *vios == vios_uuid)
            .map(|(_, vg)| vg.clone())
            .collect())
    }

    async fn read_volume_group(
        &self,
        _host_uuid: Uuid,
        vios_uuid: Uuid,
        vg_uuid: Uuid,
    ) -> Result<VolumeGroup, Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.record("read_volume_group");
        inner.volume_group_mut(vios_uuid, vg_uuid).map(|vg| vg.clone())
    }

    async fn update_volume_group(
        &self,
        _host_uuid: Uuid,
        vios_uuid: Uuid,
        vg: &VolumeGroup,
    ) -> Result<VolumeGroup, Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.record("update_volume_group");
        let injected = inner.take_injected_conflict();
        let etag = inner.next_etag();
        let stored = inner.volume_group_mut(vios_uuid, vg.uuid)?;
        if injected || stored.etag != vg.etag {
            stored.etag = etag;
            return Err(Error::Conflict {
                path: stored.href.clone(),
                etag: vg
                    .etag
                    .as_ref()
                    .map(|e| e.0.clone())
                    .unwrap_or_default(),
            });
        }
        *stored = vg.clone();
        stored.etag = etag;
        Ok(stored.clone())
    }

    async fn read_clusters(&self) -> Result<Vec<Cluster>, Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.record("read_clusters");
        Ok(inner.clusters.clone())
    }

    async fn search_clusters_by_name(
        &self,
        name: &str,
    ) -> Result<Vec<Cluster>, Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.record("search_clusters_by_name");
        Ok(inner.clusters.iter().filter(|c| c.name == name).cloned().collect())
    }

    async fn refresh_cluster(
        &self,
        cluster: &Cluster,
    ) -> Result<Cluster, Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.record("refresh_cluster");
        inner
            .clusters
            .iter()
            .find(|c| c.uuid == cluster.uuid)
            .cloned()
            .ok_or_else(|| Error::NotFound { path: cluster.href.clone() })
    }

    async fn read_ssp_by_href(
        &self,
        href: &str,
    ) -> Result<SharedStoragePool, Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.record("read_ssp_by_href");
        inner
            .ssps
            .iter()
            .find(|ssp| ssp.href == href)
            .cloned()
            .ok_or_else(|| Error::NotFound { path: href.to_string() })
    }

    async fn refresh_ssp(
        &self,
        ssp: &SharedStoragePool,
    ) -> Result<SharedStoragePool, Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.record("refresh_ssp");
        let idx = inner.ssp_index(ssp.uuid)?;
        Ok(inner.ssps[idx].clone())
    }

    async fn update_ssp(
        &self,
        ssp: &SharedStoragePool,
    ) -> Result<SharedStoragePool, Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.record("update_ssp");
        let injected = inner.take_injected_conflict();
        let etag = inner.next_etag();
        let idx = inner.ssp_index(ssp.uuid)?;
        let stored = &mut inner.ssps[idx];
        if injected || stored.etag != ssp.etag {
            stored.etag = etag;
            return Err(Error::Conflict {
                path: stored.href.clone(),
                etag: ssp
                    .etag
                    .as_ref()
                    .map(|e| e.0.clone())
                    .unwrap_or_default(),
            });
        }
        *stored = ssp.clone();
        stored.etag = etag;
        Ok(stored.clone())
    }

    async fn read_partition(
        &self,
        lpar_uuid: Uuid,
    ) -> Result<PartitionInfo, Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.record("read_partition");
        inner.partitions.get(&lpar_uuid).cloned().ok_or_else(|| {
            Error::NotFound { path: format!("/LogicalPartition/{lpar_uuid}") }
        })
    }

    async fn upload_new_vdisk(
        &self,
        upload: VDiskUpload,
    ) -> Result<VirtualDisk, Error> {
        let VDiskUpload { vios_uuid, vg_uuid, stream, name, f_size, d_size } =
            upload;
        let bytes_read = drain(&name, stream)?;

        let mut inner = self.inner.lock().unwrap();
        inner.record("upload_new_vdisk");
        let etag = inner.next_etag();
        let vdisk = VirtualDisk {
            name: name.clone(),
            capacity_gb: d_size as f64 / GIB,
            udid: FakeAdapterInner::next_udid("01"),
        };
        let vg = inner.volume_group_mut(vios_uuid, vg_uuid)?;
        vg.virtual_disks.push(vdisk.clone());
        vg.etag = etag;
        inner.uploads.push(FakeUpload {
            name,
            vios_uuid,
            f_size,
            d_size,
            bytes_read,
        });
        Ok(vdisk)
    }

    async fn upload_new_lu(
        &self,
        vios_uuid: Uuid,
        ssp: &SharedStoragePool,
        stream: UploadStream,
        lu_name: &str,
        f_size: u64,
    ) -> Result<LogicalUnit, Error> {
        let bytes_read = drain(lu_name, stream)?;

        let mut inner = self.inner.lock().unwrap();
        inner.record("upload_new_lu");
        let etag = inner.next_etag();
        let idx = inner.ssp_index(ssp.uuid)?;
        let mut lu =
            LogicalUnit::new(lu_name, f_size as f64 / GIB, LuType::Image);
        lu.udid = FakeAdapterInner::next_udid("29");
        let stored = &mut inner.ssps[idx];
        stored.logical_units.push(lu.clone());
        stored.etag = etag;
        inner.uploads.push(FakeUpload {
            name: lu_name.to_string(),
            vios_uuid,
            f_size,
            d_size: f_size,
            bytes_read,
        });
        Ok(lu)
    }

    async fn create_lu_linked_clone(
        &self,
        ssp: &SharedStoragePool,
        _cluster: &Cluster,
        image_lu: &LogicalUnit,
        lu_name: &str,
        size_gb: u64,
    ) -> Result<(SharedStoragePool, LogicalUnit), Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.record("create_lu_linked_clone");
        let etag = inner.next_etag();
        let idx = inner.ssp_index(ssp.uuid)?;
        let stored = &mut inner.ssps[idx];
        if !stored.logical_units.iter().any(|lu| lu.udid == image_lu.udid) {
            return Err(Error::NotFound {
                path: format!("{}/LogicalUnit/{}", stored.href, image_lu.udid),
            });
        }
        let mut lu = LogicalUnit::new(lu_name, size_gb as f64, LuType::Disk);
        lu.udid = FakeAdapterInner::next_udid("27");
        lu.cloned_from_udid =
            image_lu.udid.get(2..).map(|suffix| format!("27{suffix}"));
        stored.logical_units.push(lu.clone());
        stored.etag = etag;
        Ok((stored.clone(), lu))
    }

    async fn add_vscsi_mapping(
        &self,
        host_uuid: Uuid,
        vios_uuid: Uuid,
        lpar_uuid: Uuid,
        storage: &StorageElement,
    ) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.record("add_vscsi_mapping");
        let lpar_id = inner
            .partitions
            .get(&lpar_uuid)
            .map(|p| p.partition_id)
            .ok_or_else(|| Error::NotFound {
                path: format!("/LogicalPartition/{lpar_uuid}"),
            })?;
        inner.mappings.push(FakeMapping {
            host_uuid,
            vios_uuid,
            lpar_uuid,
            lpar_id,
            storage: storage.clone(),
        });
        Ok(())
    }

    async fn remove_vdisk_mapping(
        &self,
        vios_uuid: Uuid,
        lpar_id: u32,
        disk_prefixes: Option<&[String]>,
    ) -> Result<Vec<VirtualDisk>, Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.record("remove_vdisk_mapping");
        let mut removed = Vec::new();
        inner.mappings.retain(|m| {
            let matched = m.vios_uuid == vios_uuid
                && m.lpar_id == lpar_id
                && m.storage
                    .as_virtual_disk()
                    .map(|vd| prefix_matches(&vd.name, disk_prefixes))
                    .unwrap_or(false);
            if let (true, Some(vd)) = (matched, m.storage.as_virtual_disk()) {
                removed.push(vd.clone());
            }
            !matched
        });
        Ok(removed)
    }

    async fn remove_lu_mapping(
        &self,
        vios_uuid: Uuid,
        lpar_id: u32,
        disk_prefixes: Option<&[String]>,
    ) -> Result<Vec<LogicalUnit>, Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.record("remove_lu_mapping");
        let mut removed = Vec::new();
        inner.mappings.retain(|m| {
            let matched = m.vios_uuid == vios_uuid
                && m.lpar_id == lpar_id
                && m.storage
                    .as_logical_unit()
                    .map(|lu| prefix_matches(&lu.name, disk_prefixes))
                    .unwrap_or(false);
            if let (true, Some(lu)) = (matched, m.storage.as_logical_unit()) {
                removed.push(lu.clone());
            }
            !matched
        });
        Ok(removed)
    }
}
