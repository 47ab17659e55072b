// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Storage of instance disks on PowerVM hosts.
//!
//! A [DiskAdapter] creates, maps, resizes and deletes the disks that back
//! instances. Two strategies exist:
//!
//! - [LocalStorage] keeps flat virtual disks in a Volume Group of one
//!   Virtual I/O Server.
//! - [SspDiskAdapter] keeps linked clones of shared image LUs in a Shared
//!   Storage Pool spanning a cluster of Virtual I/O Servers.

pub mod config;
pub mod driver;
pub mod error;
pub mod image;
pub mod localdisk;
pub mod ssp;

pub use config::{Config, DiskDriver};
pub use driver::{
    DiskAdapter, DiskInfo, DiskType, ImageMeta, Instance, RequestContext,
};
pub use error::Error;
pub use image::{ImageApi, ImageStream};
pub use localdisk::LocalStorage;
pub use ssp::{RandomViosChooser, SspDiskAdapter, ViosChooser};

use config::RetryConfig;
use pvm_client::backoff::retry_on_conflict;
use pvm_client::BoxedAdapter;
use serde::Serialize;
use slog::{info, Logger};
use std::sync::Arc;
use uuid::Uuid;

/// Builds the disk adapter selected by `config`.
pub async fn disk_adapter(
    log: &Logger,
    config: &Config,
    client: BoxedAdapter,
    host_uuid: Uuid,
    image_api: Arc<dyn ImageApi>,
) -> Result<Box<dyn DiskAdapter>, Error> {
    info!(
        log,
        "Initializing disk adapter";
        "disk_driver" => ?config.disk_driver,
    );
    let adapter: Box<dyn DiskAdapter> = match config.disk_driver {
        DiskDriver::LocalDisk => Box::new(
            LocalStorage::new(
                log,
                client,
                host_uuid,
                &config.localdisk,
                image_api,
            )
            .await?,
        ),
        DiskDriver::Ssp => Box::new(
            SspDiskAdapter::new(log, client, host_uuid, &config.ssp, image_api)
                .await?,
        ),
    };
    Ok(adapter)
}

/// Disk space available to instances on this host, in GB.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HostStorage {
    pub local_gb: f64,
    pub local_gb_used: f64,
}

pub async fn host_storage(
    adapter: &dyn DiskAdapter,
) -> Result<HostStorage, Error> {
    Ok(HostStorage {
        local_gb: adapter.capacity().await?,
        local_gb_used: adapter.capacity_used().await?,
    })
}

/// Grows a disk, starting over from a fresh read whenever another writer
/// changes the underlying Volume Group or pool first.
pub async fn extend_disk_with_retry(
    log: &Logger,
    adapter: &dyn DiskAdapter,
    retry: &RetryConfig,
    ctx: &RequestContext,
    instance: &Instance,
    disk_info: &DiskInfo,
    size_gb: u64,
) -> Result<(), Error> {
    retry_on_conflict(log, retry.policy(), || {
        adapter.extend_disk(ctx, instance, disk_info, size_gb)
    })
    .await
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{LocalDiskConfig, SspConfig};
    use crate::image::StaticImageApi;
    use bytes::Bytes;
    use pvm_client::fakes::FakeAdapter;
    use pvm_client::types::{
        Cluster, LogicalUnit, LuType, SharedStoragePool, Vios, VolumeGroup,
    };
    use pvm_test_utils::dev::test_setup_log;

    const HOST: Uuid = Uuid::from_u128(0x67dca605_3923_34da_bd8f_26a378fc817f);

    fn image_api() -> Arc<dyn ImageApi> {
        Arc::new(StaticImageApi { contents: Bytes::new(), chunk_size: 1 })
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            initial_interval_ms: 1,
            max_interval_ms: 2,
            max_elapsed_ms: Some(5_000),
        }
    }

    // A host with both a Volume Group and a Shared Storage Pool.
    fn seeded_fake() -> (Arc<FakeAdapter>, Uuid) {
        let fake = FakeAdapter::new();
        let vios_uuid = Uuid::new_v4();
        fake.add_vios(
            HOST,
            Vios {
                uuid: vios_uuid,
                href: format!(
                    "https://hmc/rest/api/uom/ManagedSystem/{HOST}/\
                     VirtualIOServer/{vios_uuid}"
                ),
                name: "vios1".to_string(),
                partition_id: 1,
            },
        );
        fake.add_volume_group(
            vios_uuid,
            VolumeGroup {
                uuid: Uuid::new_v4(),
                href: "https://hmc/rest/api/uom/VolumeGroup/vg".to_string(),
                etag: None,
                name: "rootvg".to_string(),
                capacity: "5120".to_string(),
                available_size: "2048".to_string(),
                virtual_disks: vec![],
            },
        );

        let ssp_uuid = Uuid::new_v4();
        let ssp_href =
            format!("https://hmc/rest/api/uom/SharedStoragePool/{ssp_uuid}");
        fake.add_cluster(Cluster {
            uuid: Uuid::new_v4(),
            href: "https://hmc/rest/api/uom/Cluster/c".to_string(),
            etag: None,
            name: "clust1".to_string(),
            ssp_href: ssp_href.clone(),
            nodes: vec![],
        });
        fake.add_ssp(SharedStoragePool {
            uuid: ssp_uuid,
            href: ssp_href,
            etag: None,
            name: "ssp1".to_string(),
            capacity_gb: 100.0,
            free_space_gb: 60.0,
            logical_units: vec![LogicalUnit::new(
                "boot_instance_name",
                10.0,
                LuType::Disk,
            )],
        });
        (fake, ssp_uuid)
    }

    fn instance() -> Instance {
        Instance { uuid: Uuid::new_v4(), name: "instance-name".to_string() }
    }

    #[tokio::test]
    async fn test_disk_adapter_selects_strategy() {
        let logctx = test_setup_log("test_disk_adapter_selects_strategy");
        let (fake, _) = seeded_fake();

        let config = Config::default();
        let adapter = disk_adapter(
            &logctx.log,
            &config,
            fake.clone().as_adapter(),
            HOST,
            image_api(),
        )
        .await
        .unwrap();
        assert_eq!(adapter.name(), "localdisk");

        let config = Config { disk_driver: DiskDriver::Ssp, ..config };
        let adapter = disk_adapter(
            &logctx.log,
            &config,
            fake.clone().as_adapter(),
            HOST,
            image_api(),
        )
        .await
        .unwrap();
        assert_eq!(adapter.name(), "ssp");

        let config = Config {
            ssp: SspConfig { cluster_name: Some("other".to_string()) },
            ..config
        };
        let result = disk_adapter(
            &logctx.log,
            &config,
            fake.clone().as_adapter(),
            HOST,
            image_api(),
        )
        .await;
        assert!(matches!(result, Err(Error::ClusterNotFoundByName { .. })));

        let config = Config {
            disk_driver: DiskDriver::LocalDisk,
            localdisk: LocalDiskConfig {
                volume_group_name: "missing".to_string(),
                volume_group_vios_name: None,
            },
            ..config
        };
        let result = disk_adapter(
            &logctx.log,
            &config,
            fake.as_adapter(),
            HOST,
            image_api(),
        )
        .await;
        assert!(matches!(result, Err(Error::VgNotFound { .. })));
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_host_storage() {
        let logctx = test_setup_log("test_host_storage");
        let (fake, _) = seeded_fake();

        let local = LocalStorage::new(
            &logctx.log,
            fake.clone().as_adapter(),
            HOST,
            &LocalDiskConfig::default(),
            image_api(),
        )
        .await
        .unwrap();
        assert_eq!(
            host_storage(&local).await.unwrap(),
            HostStorage { local_gb: 5120.0, local_gb_used: 3072.0 }
        );

        let ssp = SspDiskAdapter::new(
            &logctx.log,
            fake.as_adapter(),
            HOST,
            &SspConfig::default(),
            image_api(),
        )
        .await
        .unwrap();
        assert_eq!(
            host_storage(&ssp).await.unwrap(),
            HostStorage { local_gb: 100.0, local_gb_used: 40.0 }
        );
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_extend_disk_retries_conflicts() {
        let logctx = test_setup_log("test_extend_disk_retries_conflicts");
        let (fake, ssp_uuid) = seeded_fake();
        let ssp = SspDiskAdapter::new(
            &logctx.log,
            fake.clone().as_adapter(),
            HOST,
            &SspConfig::default(),
            image_api(),
        )
        .await
        .unwrap();

        // Two other hosts win the race before this write lands.
        fake.inject_conflicts(2);
        extend_disk_with_retry(
            &logctx.log,
            &ssp,
            &fast_retry(),
            &RequestContext::new(),
            &instance(),
            &DiskInfo { disk_type: DiskType::Boot },
            25,
        )
        .await
        .unwrap();

        assert_eq!(fake.call_count("update_ssp"), 3);
        let lus = fake.ssp(ssp_uuid).unwrap().logical_units;
        assert_eq!(lus[0].capacity_gb, 25.0);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_extend_disk_retry_stops_on_other_errors() {
        let logctx =
            test_setup_log("test_extend_disk_retry_stops_on_other_errors");
        let (fake, _) = seeded_fake();
        let local = LocalStorage::new(
            &logctx.log,
            fake.clone().as_adapter(),
            HOST,
            &LocalDiskConfig::default(),
            image_api(),
        )
        .await
        .unwrap();

        let err = extend_disk_with_retry(
            &logctx.log,
            &local,
            &fast_retry(),
            &RequestContext::new(),
            &instance(),
            &DiskInfo { disk_type: DiskType::Boot },
            25,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::DiskNotFound { .. }));
        assert_eq!(fake.call_count("read_volume_group"), 1);
        assert_eq!(fake.call_count("update_volume_group"), 0);
        logctx.cleanup_successful();
    }
}
