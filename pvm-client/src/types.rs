// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Entity snapshots returned by the management API

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// UDIDs carry a two-character type tag ahead of the unique portion. The tag
// differs between an image LU and the back-reference stored in its clones.
const UDID_PREFIX_LEN: usize = 2;

/// Opaque version tag of an entity, as returned by the server.
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, Display, Serialize, Deserialize,
)]
pub struct Etag(pub String);

/// A Volume Group hosted by a single Virtual I/O Server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VolumeGroup {
    pub uuid: Uuid,
    pub href: String,
    pub etag: Option<Etag>,
    pub name: String,
    /// Total capacity in GB, as reported by the API.
    pub capacity: String,
    /// Unallocated capacity in GB, as reported by the API.
    pub available_size: String,
    pub virtual_disks: Vec<VirtualDisk>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VirtualDisk {
    pub name: String,
    pub capacity_gb: f64,
    pub udid: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vios {
    pub uuid: Uuid,
    pub href: String,
    pub name: String,
    pub partition_id: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub uuid: Uuid,
    pub href: String,
    pub etag: Option<Etag>,
    pub name: String,
    pub ssp_href: String,
    pub nodes: Vec<Node>,
}

/// A cluster member.
///
/// Nodes that live on another managed system may be reported without a VIOS
/// UUID or URI.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub hostname: String,
    pub vios_uuid: Option<Uuid>,
    pub vios_uri: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SharedStoragePool {
    pub uuid: Uuid,
    pub href: String,
    pub etag: Option<Etag>,
    pub name: String,
    pub capacity_gb: f64,
    pub free_space_gb: f64,
    pub logical_units: Vec<LogicalUnit>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LuType {
    /// Read-only template that disks are linked-cloned from.
    Image,
    Disk,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogicalUnit {
    pub name: String,
    pub udid: String,
    pub lu_type: LuType,
    pub capacity_gb: f64,
    /// For a linked clone, the UDID of the image LU it was cloned from.
    pub cloned_from_udid: Option<String>,
}

impl LogicalUnit {
    pub fn new(
        name: impl Into<String>,
        capacity_gb: f64,
        lu_type: LuType,
    ) -> Self {
        LogicalUnit {
            name: name.into(),
            udid: String::new(),
            lu_type,
            capacity_gb,
            cloned_from_udid: None,
        }
    }

    /// Returns true if `a` and `b` identify the same LU, ignoring the type tag.
    pub fn udid_matches(a: &str, b: &str) -> bool {
        match (a.get(UDID_PREFIX_LEN..), b.get(UDID_PREFIX_LEN..)) {
            (Some(a), Some(b)) => !a.is_empty() && a == b,
            _ => false,
        }
    }

    /// Returns true if this LU is a linked clone of the LU whose UDID is
    /// `image_udid`.
    pub fn is_clone_of(&self, image_udid: &str) -> bool {
        self.cloned_from_udid
            .as_deref()
            .map(|src| Self::udid_matches(src, image_udid))
            .unwrap_or(false)
    }
}

/// Partition attributes needed to map storage to a VM.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub partition_id: u32,
    /// href of the managed system currently hosting the partition.
    pub associated_managed_system: String,
}

/// A backing storage object that can be mapped to a VM.
#[derive(Clone, Debug, PartialEq, From, Serialize, Deserialize)]
pub enum StorageElement {
    VirtualDisk(VirtualDisk),
    LogicalUnit(LogicalUnit),
}

impl StorageElement {
    pub fn name(&self) -> &str {
        match self {
            Self::VirtualDisk(vdisk) => &vdisk.name,
            Self::LogicalUnit(lu) => &lu.name,
        }
    }

    pub fn as_virtual_disk(&self) -> Option<&VirtualDisk> {
        match self {
            Self::VirtualDisk(vdisk) => Some(vdisk),
            Self::LogicalUnit(_) => None,
        }
    }

    pub fn as_logical_unit(&self) -> Option<&LogicalUnit> {
        match self {
            Self::VirtualDisk(_) => None,
            Self::LogicalUnit(lu) => Some(lu),
        }
    }
}
