// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Disks backed by a Shared Storage Pool.
//!
//! Boot disks are linked clones of an image LU. The first disk created from
//! an image uploads it into the pool, later disks clone the existing copy,
//! and the image LU is removed along with the last clone that refers to it.
//!
//! The pool is shared by every host in the cluster, so it is re-read before
//! each use. Writes that lose a race with another host fail with a conflict.

use crate::config::SspConfig;
use crate::driver::{
    disk_name, disk_prefixes, image_name, DiskAdapter, DiskInfo, DiskType,
    ImageMeta, Instance, RequestContext, GIB,
};
use crate::error::Error;
use crate::image::{image_upload, ImageApi};
use async_trait::async_trait;
use pvm_client::types::{
    Cluster, LogicalUnit, LuType, SharedStoragePool, StorageElement,
};
use pvm_client::util::root_uuid_from_href;
use pvm_client::BoxedAdapter;
use rand::prelude::IteratorRandom;
use rand::SeedableRng;
use slog::{debug, info, o, warn, Logger};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

const SHARED_STORAGE_KEY: &str = "ssp_uuid";

/// Picks the VIOS that serves a request.
pub trait ViosChooser: Send + Sync {
    fn choose(&self, candidates: &[Uuid]) -> Option<Uuid>;
}

/// Spreads requests uniformly across the candidates.
#[derive(Debug, Default)]
pub struct RandomViosChooser;

impl ViosChooser for RandomViosChooser {
    fn choose(&self, candidates: &[Uuid]) -> Option<Uuid> {
        let mut rng = rand::rngs::StdRng::from_entropy();
        candidates.iter().copied().choose(&mut rng)
    }
}

pub struct SspDiskAdapter {
    log: Logger,
    client: BoxedAdapter,
    image_api: Arc<dyn ImageApi>,
    cluster: Mutex<Cluster>,
    ssp: Mutex<SharedStoragePool>,
    chooser: Box<dyn ViosChooser>,
}

impl SspDiskAdapter {
    /// Resolves the cluster and its pool.
    pub async fn new(
        log: &Logger,
        client: BoxedAdapter,
        host_uuid: Uuid,
        config: &SspConfig,
        image_api: Arc<dyn ImageApi>,
    ) -> Result<Self, Error> {
        Self::new_with_chooser(
            log,
            client,
            host_uuid,
            config,
            image_api,
            Box::new(RandomViosChooser),
        )
        .await
    }

    pub async fn new_with_chooser(
        log: &Logger,
        client: BoxedAdapter,
        host_uuid: Uuid,
        config: &SspConfig,
        image_api: Arc<dyn ImageApi>,
        chooser: Box<dyn ViosChooser>,
    ) -> Result<Self, Error> {
        let log = log.new(o!(
            "component" => "SspDiskAdapter",
            "host_uuid" => host_uuid.to_string(),
        ));
        let cluster = fetch_cluster(&log, &client, config).await?;
        let ssp = client.read_ssp_by_href(&cluster.ssp_href).await?;
        info!(
            log,
            "Using shared storage pool";
            "cluster" => &cluster.name,
            "cluster_uuid" => %cluster.uuid,
            "ssp" => &ssp.name,
            "ssp_uuid" => %ssp.uuid,
        );
        Ok(Self {
            log,
            client,
            image_api,
            cluster: Mutex::new(cluster),
            ssp: Mutex::new(ssp),
            chooser,
        })
    }

    /// The cluster as last read.
    pub fn cluster(&self) -> Cluster {
        self.cluster.lock().unwrap().clone()
    }

    /// Re-reads the cluster.
    pub async fn refresh_cluster(&self) -> Result<Cluster, Error> {
        let current = self.cluster();
        let cluster = self.client.refresh_cluster(&current).await?;
        *self.cluster.lock().unwrap() = cluster.clone();
        Ok(cluster)
    }

    /// Returns the current version of the pool.
    pub async fn ssp(&self) -> Result<SharedStoragePool, Error> {
        let current = self.ssp.lock().unwrap().clone();
        let ssp = self.client.refresh_ssp(&current).await?;
        self.store_ssp(ssp.clone());
        Ok(ssp)
    }

    fn store_ssp(&self, ssp: SharedStoragePool) {
        *self.ssp.lock().unwrap() = ssp;
    }

    fn ssp_uuid(&self) -> Uuid {
        self.ssp.lock().unwrap().uuid
    }

    /// UUIDs of the cluster's VIOSes, optionally limited to those on one
    /// host. Nodes that do not report both a VIOS UUID and URI are skipped.
    pub fn vios_uuids(&self, host_uuid: Option<Uuid>) -> Vec<Uuid> {
        let cluster = self.cluster.lock().unwrap();
        cluster
            .nodes
            .iter()
            .filter_map(|node| {
                let (Some(vios_uuid), Some(vios_uri)) =
                    (node.vios_uuid, node.vios_uri.as_deref())
                else {
                    return None;
                };
                if let Some(host_uuid) = host_uuid {
                    match root_uuid_from_href(vios_uri) {
                        Ok(node_host) if node_host == host_uuid => {}
                        Ok(_) => return None,
                        Err(err) => {
                            warn!(
                                self.log,
                                "Skipping cluster node";
                                "hostname" => &node.hostname,
                                "error" => %err,
                            );
                            return None;
                        }
                    }
                }
                Some(vios_uuid)
            })
            .collect()
    }

    /// Picks one of [Self::vios_uuids].
    pub fn any_vios_uuid(
        &self,
        host_uuid: Option<Uuid>,
    ) -> Result<Uuid, Error> {
        let candidates = self.vios_uuids(host_uuid);
        self.chooser
            .choose(&candidates)
            .ok_or(Error::NoViosAvailable { host_uuid })
    }

    /// Returns the image LU for `image`, uploading the image first if the
    /// pool does not have it yet.
    async fn get_or_upload_image_lu(
        &self,
        ctx: &RequestContext,
        image: &ImageMeta,
    ) -> Result<LogicalUnit, Error> {
        let lu_name = image_name(image)?;
        let ssp = self.ssp().await?;
        if let Some(lu) = ssp
            .logical_units
            .iter()
            .find(|lu| lu.lu_type == LuType::Image && lu.name == lu_name)
        {
            info!(
                self.log,
                "Using existing image LU";
                "lu" => &lu.name,
                "udid" => &lu.udid,
            );
            return Ok(lu.clone());
        }

        let vios_uuid = self.any_vios_uuid(None)?;
        info!(
            self.log,
            "Uploading image LU";
            "lu" => &lu_name,
            "image_id" => &image.id,
            "vios_uuid" => %vios_uuid,
        );
        let stream = image_upload(self.image_api.as_ref(), ctx, image).await?;
        let lu = self
            .client
            .upload_new_lu(vios_uuid, &ssp, stream, &lu_name, image.size)
            .await?;
        Ok(lu)
    }

    async fn host_of_partition(
        &self,
        lpar_uuid: Uuid,
    ) -> Result<(Uuid, u32), Error> {
        let partition = self.client.read_partition(lpar_uuid).await?;
        let host_uuid =
            root_uuid_from_href(&partition.associated_managed_system)?;
        Ok((host_uuid, partition.partition_id))
    }
}

/// Resolves the cluster, by its configured name if there is one.
async fn fetch_cluster(
    log: &Logger,
    client: &BoxedAdapter,
    config: &SspConfig,
) -> Result<Cluster, Error> {
    let mut clusters = match &config.cluster_name {
        Some(name) => {
            let clusters = client.search_clusters_by_name(name).await?;
            match clusters.len() {
                0 => {
                    return Err(Error::ClusterNotFoundByName {
                        name: name.clone(),
                    })
                }
                1 => clusters,
                count => {
                    return Err(Error::TooManyClustersFound {
                        count,
                        name: name.clone(),
                    })
                }
            }
        }
        None => {
            let clusters = client.read_clusters().await?;
            match clusters.len() {
                0 => return Err(Error::NoConfigNoClusterFound),
                1 => clusters,
                count => {
                    return Err(Error::NoConfigTooManyClusters { count })
                }
            }
        }
    };
    let cluster = clusters.remove(0);
    debug!(log, "Resolved cluster"; "cluster" => &cluster.name);
    Ok(cluster)
}

/// Removes `to_remove` from `lus`, along with any image LU that no remaining
/// disk LU is cloned from. Returns what was removed.
fn remove_lus_and_orphans(
    lus: &mut Vec<LogicalUnit>,
    to_remove: &[&LogicalUnit],
) -> Vec<LogicalUnit> {
    let mut removed = Vec::new();
    for target in to_remove {
        let Some(idx) = lus.iter().position(|lu| lu.udid == target.udid) else {
            continue;
        };
        let lu = lus.remove(idx);

        let backing_image = match (&lu.lu_type, &lu.cloned_from_udid) {
            (LuType::Disk, Some(src)) => lus.iter().position(|img| {
                img.lu_type == LuType::Image
                    && LogicalUnit::udid_matches(&img.udid, src)
            }),
            _ => None,
        };
        removed.push(lu);

        if let Some(img_idx) = backing_image {
            let img_udid = lus[img_idx].udid.clone();
            let in_use = lus.iter().any(|other| {
                other.lu_type == LuType::Disk && other.is_clone_of(&img_udid)
            });
            if !in_use {
                removed.push(lus.remove(img_idx));
            }
        }
    }
    removed
}

#[async_trait]
impl DiskAdapter for SspDiskAdapter {
    fn name(&self) -> &'static str {
        "ssp"
    }

    async fn capacity(&self) -> Result<f64, Error> {
        Ok(self.ssp().await?.capacity_gb)
    }

    async fn capacity_used(&self) -> Result<f64, Error> {
        let ssp = self.ssp().await?;
        Ok(ssp.capacity_gb - ssp.free_space_gb)
    }

    async fn create_disk_from_image(
        &self,
        ctx: &RequestContext,
        instance: &Instance,
        image: &ImageMeta,
        disk_size_gb: u64,
        image_type: DiskType,
    ) -> Result<StorageElement, Error> {
        let name = disk_name(image_type, instance)?;
        let image_lu = self.get_or_upload_image_lu(ctx, image).await?;

        // A clone is never smaller than the image it comes from.
        let size_gb = disk_size_gb.max(image.size.div_ceil(GIB));
        let ssp = self.ssp().await?;
        let cluster = self.cluster();
        let (ssp, lu) = self
            .client
            .create_lu_linked_clone(&ssp, &cluster, &image_lu, &name, size_gb)
            .await?;
        self.store_ssp(ssp);
        info!(
            self.log,
            "Created linked clone";
            "lu" => &lu.name,
            "image_lu" => &image_lu.name,
            "size_gb" => size_gb,
            "instance" => &instance.name,
        );
        Ok(lu.into())
    }

    async fn connect_disk(
        &self,
        _ctx: &RequestContext,
        instance: &Instance,
        disk: &StorageElement,
        lpar_uuid: Uuid,
    ) -> Result<(), Error> {
        if disk.as_logical_unit().is_none() {
            return Err(Error::UnsupportedStorage {
                strategy: self.name(),
                name: disk.name().to_string(),
                reason: "only logical units can be mapped",
            });
        }
        // The VM may have moved since the disk was created.
        let (host_uuid, _) = self.host_of_partition(lpar_uuid).await?;
        let vios_uuid = self.any_vios_uuid(Some(host_uuid))?;
        info!(
            self.log,
            "Connecting disk";
            "lu" => disk.name(),
            "instance" => &instance.name,
            "vios_uuid" => %vios_uuid,
            "vm_host_uuid" => %host_uuid,
        );
        self.client
            .add_vscsi_mapping(host_uuid, vios_uuid, lpar_uuid, disk)
            .await?;
        Ok(())
    }

    async fn disconnect_image_disk(
        &self,
        _ctx: &RequestContext,
        instance: &Instance,
        lpar_uuid: Uuid,
        disk_types: Option<&[DiskType]>,
    ) -> Result<Vec<StorageElement>, Error> {
        let (host_uuid, lpar_id) = self.host_of_partition(lpar_uuid).await?;
        let prefixes = disk_prefixes(disk_types);

        let mut removed: Vec<LogicalUnit> = Vec::new();
        for vios_uuid in self.vios_uuids(Some(host_uuid)) {
            let lus = self
                .client
                .remove_lu_mapping(vios_uuid, lpar_id, prefixes.as_deref())
                .await?;
            for lu in lus {
                if !removed.iter().any(|seen| seen.udid == lu.udid) {
                    removed.push(lu);
                }
            }
        }
        info!(
            self.log,
            "Disconnected disks";
            "instance" => &instance.name,
            "count" => removed.len(),
        );
        Ok(removed.into_iter().map(StorageElement::from).collect())
    }

    async fn delete_disks(
        &self,
        _ctx: &RequestContext,
        instance: &Instance,
        disks: &[StorageElement],
    ) -> Result<(), Error> {
        let to_remove = disks
            .iter()
            .map(|disk| {
                disk.as_logical_unit().ok_or_else(|| Error::UnsupportedStorage {
                    strategy: self.name(),
                    name: disk.name().to_string(),
                    reason: "only logical units can be deleted",
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut ssp = self.ssp().await?;
        let removed =
            remove_lus_and_orphans(&mut ssp.logical_units, &to_remove);
        if removed.is_empty() {
            debug!(
                self.log,
                "No logical units to delete";
                "instance" => &instance.name,
            );
            return Ok(());
        }
        for lu in &removed {
            debug!(
                self.log,
                "Removing logical unit";
                "lu" => &lu.name,
                "udid" => &lu.udid,
                "lu_type" => ?lu.lu_type,
            );
        }

        let ssp = self.client.update_ssp(&ssp).await?;
        self.store_ssp(ssp);
        info!(
            self.log,
            "Deleted logical units";
            "instance" => &instance.name,
            "count" => removed.len(),
        );
        Ok(())
    }

    async fn extend_disk(
        &self,
        _ctx: &RequestContext,
        instance: &Instance,
        disk_info: &DiskInfo,
        size_gb: u64,
    ) -> Result<(), Error> {
        let name = disk_name(disk_info.disk_type, instance)?;
        info!(self.log, "Extending disk"; "lu" => &name, "size_gb" => size_gb);

        let mut ssp = self.ssp().await?;
        let Some(lu) = ssp
            .logical_units
            .iter_mut()
            .find(|lu| lu.lu_type == LuType::Disk && lu.name == name)
        else {
            return Err(Error::DiskNotFound {
                disk_type: disk_info.disk_type,
                name,
            });
        };
        lu.capacity_gb = size_gb as f64;

        let ssp = self.client.update_ssp(&ssp).await?;
        self.store_ssp(ssp);
        Ok(())
    }

    async fn check_instance_shared_storage_local(
        &self,
        _ctx: &RequestContext,
        _instance: &Instance,
    ) -> Result<Option<serde_json::Value>, Error> {
        let mut token = serde_json::Map::new();
        token.insert(
            SHARED_STORAGE_KEY.to_string(),
            self.ssp_uuid().to_string().into(),
        );
        Ok(Some(token.into()))
    }

    async fn check_instance_shared_storage_remote(
        &self,
        _ctx: &RequestContext,
        data: Option<&serde_json::Value>,
    ) -> Result<bool, Error> {
        let remote = data
            .and_then(|data| data.as_object())
            .and_then(|data| data.get(SHARED_STORAGE_KEY))
            .and_then(|uuid| uuid.as_str())
            .and_then(|uuid| Uuid::parse_str(uuid).ok());
        Ok(remote == Some(self.ssp_uuid()))
    }
}
