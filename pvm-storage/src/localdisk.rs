// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Disks backed by a Volume Group on a single Virtual I/O Server.

use crate::config::LocalDiskConfig;
use crate::driver::{
    disk_gb_to_bytes, disk_name, disk_prefixes, DiskAdapter, DiskInfo,
    DiskType, ImageMeta, Instance, RequestContext,
};
use crate::error::Error;
use crate::image::{image_upload, ImageApi};
use async_trait::async_trait;
use pvm_client::types::{StorageElement, VolumeGroup};
use pvm_client::{BoxedAdapter, VDiskUpload};
use slog::{debug, error, info, o, Logger};
use std::sync::Arc;
use uuid::Uuid;

pub struct LocalStorage {
    log: Logger,
    client: BoxedAdapter,
    image_api: Arc<dyn ImageApi>,
    host_uuid: Uuid,
    vg_name: String,
    vios_uuid: Uuid,
    vg_uuid: Uuid,
}

impl LocalStorage {
    /// Locates the configured Volume Group on the host.
    pub async fn new(
        log: &Logger,
        client: BoxedAdapter,
        host_uuid: Uuid,
        config: &LocalDiskConfig,
        image_api: Arc<dyn ImageApi>,
    ) -> Result<Self, Error> {
        let log = log.new(o!(
            "component" => "LocalStorage",
            "host_uuid" => host_uuid.to_string(),
        ));
        let (vios_uuid, vg_uuid) =
            get_vg_uuid(&log, &client, host_uuid, config).await?;
        info!(
            log,
            "Using volume group";
            "vg_name" => &config.volume_group_name,
            "vg_uuid" => %vg_uuid,
            "vios_uuid" => %vios_uuid,
        );
        Ok(Self {
            log,
            client,
            image_api,
            host_uuid,
            vg_name: config.volume_group_name.clone(),
            vios_uuid,
            vg_uuid,
        })
    }

    pub fn vios_uuid(&self) -> Uuid {
        self.vios_uuid
    }

    pub fn vg_uuid(&self) -> Uuid {
        self.vg_uuid
    }

    async fn get_vg(&self) -> Result<VolumeGroup, Error> {
        Ok(self
            .client
            .read_volume_group(self.host_uuid, self.vios_uuid, self.vg_uuid)
            .await?)
    }

    fn parse_capacity(
        &self,
        field: &'static str,
        value: &str,
    ) -> Result<f64, Error> {
        value.trim().parse::<f64>().map_err(|_| Error::InvalidCapacity {
            vg_name: self.vg_name.clone(),
            field,
            value: value.to_string(),
        })
    }
}

/// Returns the UUIDs of the VIOS and Volume Group holding instance disks.
///
/// If a VIOS name is configured only that VIOS is searched, otherwise the
/// first VIOS on the host with a matching Volume Group wins.
async fn get_vg_uuid(
    log: &Logger,
    client: &BoxedAdapter,
    host_uuid: Uuid,
    config: &LocalDiskConfig,
) -> Result<(Uuid, Uuid), Error> {
    let vg_name = &config.volume_group_name;
    let vioses = match &config.volume_group_vios_name {
        Some(vios_name) => {
            client.search_vios_by_name(host_uuid, vios_name).await?
        }
        None => client.read_vios_feed(host_uuid).await?,
    };

    for vios in &vioses {
        let vgs = client.read_volume_groups(host_uuid, vios.uuid).await?;
        debug!(
            log,
            "Searching VIOS for volume group";
            "vios" => &vios.name,
            "count" => vgs.len(),
        );
        if let Some(vg) = vgs.iter().find(|vg| &vg.name == vg_name) {
            return Ok((vios.uuid, vg.uuid));
        }
    }

    error!(
        log,
        "Unable to locate volume group";
        "vg_name" => vg_name,
        "vios_name" => ?config.volume_group_vios_name,
    );
    Err(Error::VgNotFound { vg_name: vg_name.clone() })
}

#[async_trait]
impl DiskAdapter for LocalStorage {
    fn name(&self) -> &'static str {
        "localdisk"
    }

    async fn capacity(&self) -> Result<f64, Error> {
        let vg = self.get_vg().await?;
        self.parse_capacity("capacity", &vg.capacity)
    }

    async fn capacity_used(&self) -> Result<f64, Error> {
        let vg = self.get_vg().await?;
        let capacity = self.parse_capacity("capacity", &vg.capacity)?;
        let available =
            self.parse_capacity("available_size", &vg.available_size)?;
        Ok(capacity - available)
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
        info!(
            self.log,
            "Creating disk from image";
            "disk" => &name,
            "image_id" => &image.id,
            "instance" => &instance.name,
        );

        let stream =
            image_upload(self.image_api.as_ref(), ctx, image).await?;
        // The API grows the disk to fit the image if it would not.
        let d_size = disk_gb_to_bytes(disk_size_gb, Some(image.size));
        let vdisk = self
            .client
            .upload_new_vdisk(VDiskUpload {
                vios_uuid: self.vios_uuid,
                vg_uuid: self.vg_uuid,
                stream,
                name,
                f_size: image.size,
                d_size,
            })
            .await?;
        Ok(vdisk.into())
    }

    async fn connect_disk(
        &self,
        _ctx: &RequestContext,
        instance: &Instance,
        disk: &StorageElement,
        lpar_uuid: Uuid,
    ) -> Result<(), Error> {
        if disk.as_virtual_disk().is_none() {
            return Err(Error::UnsupportedStorage {
                strategy: self.name(),
                name: disk.name().to_string(),
                reason: "only virtual disks can be mapped",
            });
        }
        info!(
            self.log,
            "Connecting disk";
            "disk" => disk.name(),
            "instance" => &instance.name,
            "lpar_uuid" => %lpar_uuid,
        );
        self.client
            .add_vscsi_mapping(self.host_uuid, self.vios_uuid, lpar_uuid, disk)
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
        let partition = self.client.read_partition(lpar_uuid).await?;
        let prefixes = disk_prefixes(disk_types);
        let removed = self
            .client
            .remove_vdisk_mapping(
                self.vios_uuid,
                partition.partition_id,
                prefixes.as_deref(),
            )
            .await?;
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
        for disk in disks {
            if disk.as_virtual_disk().is_none() {
                return Err(Error::UnsupportedStorage {
                    strategy: self.name(),
                    name: disk.name().to_string(),
                    reason: "only virtual disks can be deleted",
                });
            }
        }

        // Always start from the current version of the Volume Group.
        let mut vg = self.get_vg().await?;
        let before = vg.virtual_disks.len();
        vg.virtual_disks
            .retain(|vdisk| !disks.iter().any(|d| d.name() == vdisk.name));
        let removed = before - vg.virtual_disks.len();

        self.client
            .update_volume_group(self.host_uuid, self.vios_uuid, &vg)
            .await?;
        info!(
            self.log,
            "Deleted disks";
            "instance" => &instance.name,
            "count" => removed,
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
        info!(
            self.log,
            "Extending disk";
            "disk" => &name,
            "size_gb" => size_gb,
        );

        let mut vg = self.get_vg().await?;
        let Some(vdisk) =
            vg.virtual_disks.iter_mut().find(|vdisk| vdisk.name == name)
        else {
            error!(
                self.log,
                "Disk not found during resize";
                "disk" => &name,
                "vg_name" => &self.vg_name,
            );
            return Err(Error::DiskNotFound {
                disk_type: disk_info.disk_type,
                name,
            });
        };
        vdisk.capacity_gb = size_gb as f64;

        self.client
            .update_volume_group(self.host_uuid, self.vios_uuid, &vg)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::image::StaticImageApi;
    use bytes::Bytes;
    use pvm_client::fakes::{FakeAdapter, FakeMapping};
    use pvm_client::types::{PartitionInfo, VirtualDisk, Vios};
    use pvm_client::Adapter;
    use pvm_test_utils::dev::test_setup_log;

    const HOST: Uuid = Uuid::from_u128(0x67dca605_3923_34da_bd8f_26a378fc817f);

    struct Harness {
        fake: Arc<FakeAdapter>,
        vios1: Uuid,
        vios2: Uuid,
        rootvg: Uuid,
        instvg: Uuid,
    }

    fn vios(name: &str) -> Vios {
        let uuid = Uuid::new_v4();
        Vios {
            uuid,
            href: format!(
                "https://hmc/rest/api/uom/ManagedSystem/{HOST}/\
                 VirtualIOServer/{uuid}"
            ),
            name: name.to_string(),
            partition_id: 1,
        }
    }

    fn vg(name: &str, capacity: &str, available: &str) -> VolumeGroup {
        let uuid = Uuid::new_v4();
        VolumeGroup {
            uuid,
            href: format!("https://hmc/rest/api/uom/VolumeGroup/{uuid}"),
            etag: None,
            name: name.to_string(),
            capacity: capacity.to_string(),
            available_size: available.to_string(),
            virtual_disks: vec![],
        }
    }

    fn vdisk(name: &str) -> VirtualDisk {
        VirtualDisk {
            name: name.to_string(),
            capacity_gb: 10.0,
            udid: format!("01{name}"),
        }
    }

    // vios1 hosts rootvg, vios2 hosts rootvg and instancevg.
    fn setup() -> Harness {
        let fake = FakeAdapter::new();
        let vios1 = vios("vios1");
        let vios2 = vios("vios2");
        let rootvg1 = vg("rootvg", "5120", "2048");
        let rootvg2 = vg("rootvg", "100", "50");
        let instvg = vg("instancevg", "2000", "1500");
        let h = Harness {
            fake: fake.clone(),
            vios1: vios1.uuid,
            vios2: vios2.uuid,
            rootvg: rootvg1.uuid,
            instvg: instvg.uuid,
        };
        fake.add_vios(HOST, vios1.clone());
        fake.add_vios(HOST, vios2.clone());
        fake.add_volume_group(vios1.uuid, rootvg1);
        fake.add_volume_group(vios2.uuid, rootvg2);
        fake.add_volume_group(vios2.uuid, instvg);
        h
    }

    fn image_api(len: usize) -> Arc<dyn ImageApi> {
        Arc::new(StaticImageApi {
            contents: Bytes::from(vec![7u8; len]),
            chunk_size: 16,
        })
    }

    fn instance() -> Instance {
        Instance { uuid: Uuid::new_v4(), name: "instance-name".to_string() }
    }

    async fn local_storage(
        log: &Logger,
        h: &Harness,
        config: &LocalDiskConfig,
    ) -> LocalStorage {
        LocalStorage::new(
            log,
            h.fake.clone().as_adapter(),
            HOST,
            config,
            image_api(50),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_get_vg_uuid_first_match() {
        let logctx = test_setup_log("test_get_vg_uuid_first_match");
        let h = setup();
        let stor =
            local_storage(&logctx.log, &h, &LocalDiskConfig::default()).await;
        assert_eq!(stor.vios_uuid(), h.vios1);
        assert_eq!(stor.vg_uuid(), h.rootvg);
        assert_eq!(h.fake.call_count("read_vios_feed"), 1);
        assert_eq!(h.fake.call_count("search_vios_by_name"), 0);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_get_vg_uuid_searches_past_first_vios() {
        let logctx =
            test_setup_log("test_get_vg_uuid_searches_past_first_vios");
        let h = setup();
        let config = LocalDiskConfig {
            volume_group_name: "instancevg".to_string(),
            volume_group_vios_name: None,
        };
        let stor = local_storage(&logctx.log, &h, &config).await;
        assert_eq!(stor.vios_uuid(), h.vios2);
        assert_eq!(stor.vg_uuid(), h.instvg);
        assert_eq!(h.fake.call_count("read_volume_groups"), 2);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_get_vg_uuid_with_vios_name() {
        let logctx = test_setup_log("test_get_vg_uuid_with_vios_name");
        let h = setup();
        let config = LocalDiskConfig {
            volume_group_name: "rootvg".to_string(),
            volume_group_vios_name: Some("vios2".to_string()),
        };
        let stor = local_storage(&logctx.log, &h, &config).await;
        assert_eq!(stor.vios_uuid(), h.vios2);
        assert_ne!(stor.vg_uuid(), h.rootvg);
        assert_eq!(h.fake.call_count("search_vios_by_name"), 1);
        assert_eq!(h.fake.call_count("read_vios_feed"), 0);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_get_vg_uuid_not_found() {
        let logctx = test_setup_log("test_get_vg_uuid_not_found");
        let h = setup();

        for config in [
            LocalDiskConfig {
                volume_group_name: "novg".to_string(),
                volume_group_vios_name: None,
            },
            LocalDiskConfig {
                volume_group_name: "instancevg".to_string(),
                volume_group_vios_name: Some("vios1".to_string()),
            },
            LocalDiskConfig {
                volume_group_name: "rootvg".to_string(),
                volume_group_vios_name: Some("novios".to_string()),
            },
        ] {
            let result = LocalStorage::new(
                &logctx.log,
                h.fake.clone().as_adapter(),
                HOST,
                &config,
                image_api(0),
            )
            .await;
            assert!(
                matches!(result, Err(Error::VgNotFound { ref vg_name })
                    if *vg_name == config.volume_group_name),
                "config {config:?}"
            );
        }
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_capacity() {
        let logctx = test_setup_log("test_capacity");
        let h = setup();
        let stor =
            local_storage(&logctx.log, &h, &LocalDiskConfig::default()).await;
        assert_eq!(stor.capacity().await.unwrap(), 5120.0);
        assert_eq!(stor.capacity_used().await.unwrap(), 3072.0);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_capacity_unparseable() {
        let logctx = test_setup_log("test_capacity_unparseable");
        let fake = FakeAdapter::new();
        let v = vios("vios1");
        fake.add_vios(HOST, v.clone());
        fake.add_volume_group(v.uuid, vg("rootvg", "lots", "some"));
        let stor = LocalStorage::new(
            &logctx.log,
            fake.clone().as_adapter(),
            HOST,
            &LocalDiskConfig::default(),
            image_api(0),
        )
        .await
        .unwrap();
        assert!(matches!(
            stor.capacity().await,
            Err(Error::InvalidCapacity { field: "capacity", .. })
        ));
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_create_disk_from_image() {
        let logctx = test_setup_log("test_create_disk_from_image");
        let h = setup();
        let stor =
            local_storage(&logctx.log, &h, &LocalDiskConfig::default()).await;
        let image = ImageMeta {
            id: "image-id".to_string(),
            name: "image-name".to_string(),
            size: 50,
        };

        let disk = stor
            .create_disk_from_image(
                &RequestContext::new(),
                &instance(),
                &image,
                20,
                DiskType::Boot,
            )
            .await
            .unwrap();
        assert_eq!(disk.name(), "boot_instance_name");

        let uploads = h.fake.uploads();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].name, "boot_instance_name");
        assert_eq!(uploads[0].vios_uuid, h.vios1);
        assert_eq!(uploads[0].f_size, 50);
        assert_eq!(uploads[0].d_size, 21474836480);
        assert_eq!(uploads[0].bytes_read, 50);

        let vg = h.fake.volume_group(h.rootvg).unwrap();
        assert!(vg
            .virtual_disks
            .iter()
            .any(|d| d.name == "boot_instance_name"));
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let logctx = test_setup_log("test_connect_and_disconnect");
        let h = setup();
        let stor =
            local_storage(&logctx.log, &h, &LocalDiskConfig::default()).await;
        let ctx = RequestContext::new();
        let inst = instance();
        let lpar_uuid = Uuid::new_v4();
        h.fake.add_partition(
            lpar_uuid,
            PartitionInfo {
                partition_id: 9,
                associated_managed_system: format!(
                    "https://hmc/rest/api/uom/ManagedSystem/{HOST}"
                ),
            },
        );

        let boot: StorageElement = vdisk("boot_instance_name").into();
        let rescue: StorageElement = vdisk("rescue_instance_name").into();
        stor.connect_disk(&ctx, &inst, &boot, lpar_uuid).await.unwrap();
        stor.connect_disk(&ctx, &inst, &rescue, lpar_uuid).await.unwrap();
        // A mapping to another VM on the same VIOS stays put.
        h.fake.add_mapping(FakeMapping {
            host_uuid: HOST,
            vios_uuid: h.vios1,
            lpar_uuid: Uuid::new_v4(),
            lpar_id: 10,
            storage: vdisk("boot_other").into(),
        });

        let mappings = h.fake.mappings();
        assert_eq!(mappings.len(), 3);
        assert!(mappings[..2]
            .iter()
            .all(|m| m.vios_uuid == h.vios1 && m.lpar_id == 9));

        let removed = stor
            .disconnect_image_disk(
                &ctx,
                &inst,
                lpar_uuid,
                Some(&[DiskType::Rescue]),
            )
            .await
            .unwrap();
        assert_eq!(removed, vec![rescue]);

        let removed = stor
            .disconnect_image_disk(&ctx, &inst, lpar_uuid, None)
            .await
            .unwrap();
        assert_eq!(removed, vec![boot]);
        assert_eq!(h.fake.mappings().len(), 1);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_delete_disks() {
        let logctx = test_setup_log("test_delete_disks");
        let h = setup();
        let stor =
            local_storage(&logctx.log, &h, &LocalDiskConfig::default()).await;
        let mut vg = h.fake.volume_group(h.rootvg).unwrap();
        vg.virtual_disks =
            vec![vdisk("boot_a"), vdisk("boot_b"), vdisk("rescue_a")];
        h.fake.update_volume_group(HOST, h.vios1, &vg).await.unwrap();

        stor.delete_disks(
            &RequestContext::new(),
            &instance(),
            &[vdisk("boot_a").into(), vdisk("rescue_a").into()],
        )
        .await
        .unwrap();

        let vg = h.fake.volume_group(h.rootvg).unwrap();
        let names: Vec<_> =
            vg.virtual_disks.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["boot_b"]);
        assert_eq!(h.fake.call_count("update_volume_group"), 2);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_extend_disk() {
        let logctx = test_setup_log("test_extend_disk");
        let h = setup();
        let stor =
            local_storage(&logctx.log, &h, &LocalDiskConfig::default()).await;
        let ctx = RequestContext::new();
        let inst = instance();
        let info = DiskInfo { disk_type: DiskType::Boot };

        let err = stor.extend_disk(&ctx, &inst, &info, 30).await.unwrap_err();
        assert!(matches!(
            err,
            Error::DiskNotFound { disk_type: DiskType::Boot, ref name }
                if name == "boot_instance_name"
        ));
        assert_eq!(h.fake.call_count("update_volume_group"), 0);

        let mut vg = h.fake.volume_group(h.rootvg).unwrap();
        vg.virtual_disks = vec![vdisk("boot_instance_name")];
        h.fake.update_volume_group(HOST, h.vios1, &vg).await.unwrap();

        stor.extend_disk(&ctx, &inst, &info, 30).await.unwrap();
        let vg = h.fake.volume_group(h.rootvg).unwrap();
        assert_eq!(vg.virtual_disks[0].capacity_gb, 30.0);
        assert_eq!(h.fake.call_count("update_volume_group"), 2);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_extend_disk_conflict_surfaces() {
        let logctx = test_setup_log("test_extend_disk_conflict_surfaces");
        let h = setup();
        let stor =
            local_storage(&logctx.log, &h, &LocalDiskConfig::default()).await;
        let mut vg = h.fake.volume_group(h.rootvg).unwrap();
        vg.virtual_disks = vec![vdisk("boot_instance_name")];
        h.fake.update_volume_group(HOST, h.vios1, &vg).await.unwrap();

        h.fake.inject_conflicts(1);
        let err = stor
            .extend_disk(
                &RequestContext::new(),
                &instance(),
                &DiskInfo { disk_type: DiskType::Boot },
                30,
            )
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_shared_storage_defaults() {
        let logctx = test_setup_log("test_shared_storage_defaults");
        let h = setup();
        let stor =
            local_storage(&logctx.log, &h, &LocalDiskConfig::default()).await;
        let ctx = RequestContext::new();
        let data = stor
            .check_instance_shared_storage_local(&ctx, &instance())
            .await
            .unwrap();
        assert!(data.is_none());
        assert!(!stor
            .check_instance_shared_storage_remote(&ctx, data.as_ref())
            .await
            .unwrap());
        stor.check_instance_shared_storage_cleanup(&ctx, data.as_ref())
            .await
            .unwrap();
        logctx.cleanup_successful();
    }
}
