// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Placement domain types.
//!
//! Topology entities (hosts, pools, VMs, volumes) come from the
//! [`Inventory`](crate::inventory::Inventory); reservations and the capacity
//! ledger live in the [`ReservationStore`](crate::reservations::ReservationStore).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    /// Defined but not running anywhere.
    Stopped,
    /// A start command is in flight.
    Starting,
    /// Running on its host.
    Running,
    /// A stop command is in flight.
    Stopping,
    /// Gone for good.
    Destroyed,
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// Administrative state of a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HostState {
    /// Accepting VMs.
    #[default]
    Up,
    /// Not reachable.
    Down,
    /// Drained by an operator.
    Maintenance,
}

/// Administrative state of a storage pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PoolState {
    /// Usable.
    #[default]
    Up,
    /// Drained; existing placements on it are not honoured.
    Maintenance,
}

/// Root or data disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VolumeKind {
    /// Boot disk; its pool anchors placement.
    Root,
    /// Additional disk.
    #[default]
    Data,
}

/// A hypervisor host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    /// Host id.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Agent address (host name or IP).
    pub address: String,
    /// Zone.
    pub data_center_id: i64,
    /// Pod within the zone.
    pub pod_id: i64,
    /// Cluster within the pod.
    pub cluster_id: i64,
    /// Administrative state.
    #[serde(default)]
    pub state: HostState,
    /// CPU cores.
    pub total_cpu: i64,
    /// Memory in MiB.
    pub total_memory: i64,
}

/// Primary storage pool. Zone-wide pools have no pod or cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePool {
    /// Pool id.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Zone.
    pub data_center_id: i64,
    /// Pod for cluster-scoped pools.
    #[serde(default)]
    pub pod_id: Option<i64>,
    /// Cluster for cluster-scoped pools.
    #[serde(default)]
    pub cluster_id: Option<i64>,
    /// Administrative state.
    #[serde(default)]
    pub state: PoolState,
}

impl StoragePool {
    /// Whether hosts of `host` can reach this pool.
    pub fn serves(&self, host: &Host) -> bool {
        self.data_center_id == host.data_center_id
            && self.cluster_id.is_none_or(|c| c == host.cluster_id)
    }
}

/// A virtual machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMachine {
    /// VM id.
    pub id: i64,
    /// Instance name sent to the agent.
    pub name: String,
    /// Owning account.
    pub account_id: i64,
    /// Zone the VM belongs to.
    pub data_center_id: i64,
    /// Requested CPU cores.
    pub cpu: i64,
    /// Requested memory in MiB.
    pub memory: i64,
    /// Lifecycle state.
    pub state: VmState,
    /// Current host, while starting, running or stopping.
    #[serde(default)]
    pub host_id: Option<i64>,
    /// Soft-deleted from the inventory.
    #[serde(default)]
    pub removed: bool,
}

/// A disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Volume id.
    pub id: i64,
    /// Attached VM.
    #[serde(default)]
    pub vm_id: Option<i64>,
    /// Root or data.
    #[serde(default)]
    pub kind: VolumeKind,
    /// Pool it currently lives on, if allocated.
    #[serde(default)]
    pub pool_id: Option<i64>,
}

/// Where a caller wants the VM to land. Unset fields are unconstrained.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentPlan {
    /// Zone.
    #[serde(default)]
    pub data_center_id: Option<i64>,
    /// Pod.
    #[serde(default)]
    pub pod_id: Option<i64>,
    /// Cluster.
    #[serde(default)]
    pub cluster_id: Option<i64>,
    /// Host.
    #[serde(default)]
    pub host_id: Option<i64>,
    /// Pool for the root volume.
    #[serde(default)]
    pub pool_id: Option<i64>,
}

impl DeploymentPlan {
    /// Plan scoped to a zone.
    pub fn in_data_center(data_center_id: i64) -> Self {
        Self {
            data_center_id: Some(data_center_id),
            ..Default::default()
        }
    }

    /// Whether a host satisfies every set field.
    pub fn admits(&self, host: &Host) -> bool {
        self.data_center_id.is_none_or(|id| id == host.data_center_id)
            && self.pod_id.is_none_or(|id| id == host.pod_id)
            && self.cluster_id.is_none_or(|id| id == host.cluster_id)
            && self.host_id.is_none_or(|id| id == host.id)
    }
}

/// Entities a planner must not pick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExcludeList {
    /// Zones.
    #[serde(default)]
    pub data_centers: BTreeSet<i64>,
    /// Pods.
    #[serde(default)]
    pub pods: BTreeSet<i64>,
    /// Clusters.
    #[serde(default)]
    pub clusters: BTreeSet<i64>,
    /// Hosts.
    #[serde(default)]
    pub hosts: BTreeSet<i64>,
    /// Pools.
    #[serde(default)]
    pub pools: BTreeSet<i64>,
}

impl ExcludeList {
    /// Avoid a host from now on.
    pub fn add_host(&mut self, host_id: i64) {
        self.hosts.insert(host_id);
    }

    /// Avoid a pool from now on.
    pub fn add_pool(&mut self, pool_id: i64) {
        self.pools.insert(pool_id);
    }

    /// Whether the host or any of its enclosing scopes is excluded.
    pub fn should_avoid_host(&self, host: &Host) -> bool {
        self.hosts.contains(&host.id)
            || self.clusters.contains(&host.cluster_id)
            || self.pods.contains(&host.pod_id)
            || self.data_centers.contains(&host.data_center_id)
    }

    /// Whether the pool or its enclosing scopes is excluded.
    pub fn should_avoid_pool(&self, pool: &StoragePool) -> bool {
        self.pools.contains(&pool.id)
            || pool.cluster_id.is_some_and(|c| self.clusters.contains(&c))
            || pool.pod_id.is_some_and(|p| self.pods.contains(&p))
            || self.data_centers.contains(&pool.data_center_id)
    }
}

/// Who asked for an operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    /// User id.
    pub user_id: i64,
    /// Account id.
    pub account_id: i64,
}

/// Everything a planner needs to know about the VM being placed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualMachineProfile {
    /// The VM.
    pub vm: VirtualMachine,
    /// Its volumes, root first.
    pub volumes: Vec<Volume>,
    /// Free-form deploy parameters.
    pub params: BTreeMap<String, String>,
}

impl VirtualMachineProfile {
    /// Build a profile, ordering the root volume first.
    pub fn new(
        vm: VirtualMachine,
        mut volumes: Vec<Volume>,
        params: BTreeMap<String, String>,
    ) -> Self {
        volumes.sort_by_key(|v| (v.kind != VolumeKind::Root, v.id));
        Self {
            vm,
            volumes,
            params,
        }
    }

    /// The root volume, if the VM has one.
    pub fn root_volume(&self) -> Option<&Volume> {
        self.volumes.iter().find(|v| v.kind == VolumeKind::Root)
    }
}

/// A placement produced by a planner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployDestination {
    /// Zone.
    pub data_center_id: i64,
    /// Pod.
    pub pod_id: i64,
    /// Cluster.
    pub cluster_id: i64,
    /// Host.
    pub host_id: i64,
    /// Volume id to pool id.
    pub volume_pools: BTreeMap<i64, i64>,
}

/// Reservation lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationStatus {
    /// Capacity held, waiting for deploy.
    Reserved,
    /// Used by a deploy; capacity held by the running VM.
    Consumed,
    /// Capacity returned.
    Released,
}

impl ReservationStatus {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reserved => "reserved",
            Self::Consumed => "consumed",
            Self::Released => "released",
        }
    }

    /// Parse the database representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "reserved" => Some(Self::Reserved),
            "consumed" => Some(Self::Consumed),
            "released" => Some(Self::Released),
            _ => None,
        }
    }
}

/// Reservation row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VmReservation {
    /// Reservation id.
    pub id: Uuid,
    /// Reserved VM.
    pub vm_id: i64,
    /// Zone.
    pub data_center_id: i64,
    /// Pod.
    pub pod_id: i64,
    /// Cluster.
    pub cluster_id: i64,
    /// Host whose capacity is held.
    pub host_id: i64,
    /// CPU held.
    pub cpu: i64,
    /// Memory held.
    pub memory: i64,
    /// reserved / consumed / released.
    pub status: String,
    /// When the reservation was made.
    pub created: DateTime<Utc>,
    /// Unconsumed reservations are released after this.
    pub expires_at: DateTime<Utc>,
    /// When deploy consumed it.
    pub consumed_at: Option<DateTime<Utc>>,
    /// When its capacity was returned.
    pub released_at: Option<DateTime<Utc>>,
}

impl VmReservation {
    /// Parsed status; unknown values read as released.
    pub fn reservation_status(&self) -> ReservationStatus {
        ReservationStatus::parse(&self.status).unwrap_or(ReservationStatus::Released)
    }
}

/// Volume placement pinned by a reservation.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct VmReservationVolume {
    /// Owning reservation.
    pub reservation_id: Uuid,
    /// Volume.
    pub volume_id: i64,
    /// Pool chosen for it.
    pub pool_id: i64,
}

/// Capacity ledger row of one host.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct HostCapacity {
    /// Host id.
    pub host_id: i64,
    /// CPU cores.
    pub total_cpu: i64,
    /// Memory in MiB.
    pub total_memory: i64,
    /// Cores held by reservations and running VMs.
    pub used_cpu: i64,
    /// Memory held by reservations and running VMs.
    pub used_memory: i64,
}

impl HostCapacity {
    /// Whether `cpu` and `memory` still fit.
    pub fn fits(&self, cpu: i64, memory: i64) -> bool {
        self.used_cpu + cpu <= self.total_cpu && self.used_memory + memory <= self.total_memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(id: i64, cluster_id: i64) -> Host {
        Host {
            id,
            name: format!("h{}", id),
            address: "10.0.0.1".to_string(),
            data_center_id: 1,
            pod_id: 1,
            cluster_id,
            state: HostState::Up,
            total_cpu: 8,
            total_memory: 8192,
        }
    }

    #[test]
    fn test_plan_admits_by_scope() {
        let plan = DeploymentPlan {
            cluster_id: Some(2),
            ..DeploymentPlan::in_data_center(1)
        };
        assert!(plan.admits(&host(1, 2)));
        assert!(!plan.admits(&host(1, 3)));
        assert!(DeploymentPlan::default().admits(&host(9, 9)));
    }

    #[test]
    fn test_exclude_list_scopes() {
        let mut avoid = ExcludeList::default();
        assert!(!avoid.should_avoid_host(&host(1, 2)));
        avoid.add_host(1);
        assert!(avoid.should_avoid_host(&host(1, 2)));

        let mut avoid = ExcludeList::default();
        avoid.clusters.insert(2);
        assert!(avoid.should_avoid_host(&host(5, 2)));

        let pool = StoragePool {
            id: 7,
            name: "p".to_string(),
            data_center_id: 1,
            pod_id: Some(1),
            cluster_id: Some(2),
            state: PoolState::Up,
        };
        assert!(avoid.should_avoid_pool(&pool));
    }

    #[test]
    fn test_zone_wide_pool_serves_every_cluster() {
        let pool = StoragePool {
            id: 1,
            name: "zone".to_string(),
            data_center_id: 1,
            pod_id: None,
            cluster_id: None,
            state: PoolState::Up,
        };
        assert!(pool.serves(&host(1, 2)));
        assert!(pool.serves(&host(2, 3)));
    }

    #[test]
    fn test_profile_orders_root_first() {
        let vm = VirtualMachine {
            id: 1,
            name: "i-1".to_string(),
            account_id: 1,
            data_center_id: 1,
            cpu: 1,
            memory: 512,
            state: VmState::Stopped,
            host_id: None,
            removed: false,
        };
        let volumes = vec![
            Volume {
                id: 1,
                vm_id: Some(1),
                kind: VolumeKind::Data,
                pool_id: None,
            },
            Volume {
                id: 2,
                vm_id: Some(1),
                kind: VolumeKind::Root,
                pool_id: None,
            },
        ];
        let profile = VirtualMachineProfile::new(vm, volumes, BTreeMap::new());
        assert_eq!(profile.root_volume().map(|v| v.id), Some(2));
        assert_eq!(profile.volumes[0].id, 2);
    }

    #[test]
    fn test_capacity_fits() {
        let cap = HostCapacity {
            host_id: 1,
            total_cpu: 4,
            total_memory: 4096,
            used_cpu: 3,
            used_memory: 1024,
        };
        assert!(cap.fits(1, 3072));
        assert!(!cap.fits(2, 1));
        assert!(!cap.fits(1, 3073));
    }
}
