// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Topology and VM state source.
//!
//! Entity persistence (accounts, VMs, hosts, pools) belongs to the wider
//! control plane; orchestration only reads it and flips VM state through
//! [`Inventory::transition_vm`], a compare-and-set on the current state.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::{Host, StoragePool, VirtualMachine, VmState, Volume};

/// Read access to the topology plus the VM state CAS.
#[async_trait::async_trait]
pub trait Inventory: Send + Sync {
    /// VM by id, including removed ones.
    async fn get_vm(&self, vm_id: i64) -> Result<Option<VirtualMachine>>;

    /// Volume by id.
    async fn get_volume(&self, volume_id: i64) -> Result<Option<Volume>>;

    /// Volumes attached to a VM.
    async fn volumes_of_vm(&self, vm_id: i64) -> Result<Vec<Volume>>;

    /// Pool by id.
    async fn get_pool(&self, pool_id: i64) -> Result<Option<StoragePool>>;

    /// Pools of a zone.
    async fn list_pools(&self, data_center_id: i64) -> Result<Vec<StoragePool>>;

    /// Host by id.
    async fn get_host(&self, host_id: i64) -> Result<Option<Host>>;

    /// Hosts of a zone, ordered by id.
    async fn list_hosts(&self, data_center_id: i64) -> Result<Vec<Host>>;

    /// VMs currently placed on a host (starting, running or stopping).
    async fn vms_on_host(&self, host_id: i64) -> Result<Vec<VirtualMachine>>;

    /// Move a VM from `from` to `to` if it is still in `from`.
    ///
    /// `host_id` becomes the VM's host. Returns whether the swap happened.
    async fn transition_vm(
        &self,
        vm_id: i64,
        from: VmState,
        to: VmState,
        host_id: Option<i64>,
    ) -> Result<bool>;

    /// Record the pool a volume was placed on.
    async fn assign_volume_pool(&self, volume_id: i64, pool_id: i64) -> Result<()>;
}

/// Serialized topology file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Topology {
    /// Hosts.
    #[serde(default)]
    pub hosts: Vec<Host>,
    /// Primary storage pools.
    #[serde(default)]
    pub pools: Vec<StoragePool>,
    /// VMs.
    #[serde(default)]
    pub vms: Vec<VirtualMachine>,
    /// Volumes.
    #[serde(default)]
    pub volumes: Vec<Volume>,
}

#[derive(Default)]
struct Tables {
    hosts: BTreeMap<i64, Host>,
    pools: BTreeMap<i64, StoragePool>,
    vms: BTreeMap<i64, VirtualMachine>,
    volumes: BTreeMap<i64, Volume>,
}

/// In-memory inventory seeded from a [`Topology`].
///
/// VM state changes live only in memory.
pub struct StaticInventory {
    tables: RwLock<Tables>,
}

impl StaticInventory {
    /// Inventory over an in-memory topology.
    pub fn new(topology: Topology) -> Self {
        let tables = Tables {
            hosts: topology.hosts.into_iter().map(|h| (h.id, h)).collect(),
            pools: topology.pools.into_iter().map(|p| (p.id, p)).collect(),
            vms: topology.vms.into_iter().map(|v| (v.id, v)).collect(),
            volumes: topology.volumes.into_iter().map(|v| (v.id, v)).collect(),
        };
        Self {
            tables: RwLock::new(tables),
        }
    }

    /// Load a topology JSON file.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await?;
        let topology: Topology = serde_json::from_str(&raw)
            .map_err(|e| Error::Inventory(format!("{}: {}", path.display(), e)))?;
        info!(
            path = %path.display(),
            hosts = topology.hosts.len(),
            pools = topology.pools.len(),
            vms = topology.vms.len(),
            "Inventory loaded"
        );
        Ok(Self::new(topology))
    }

    /// Current topology, including state changes made since loading.
    pub fn snapshot(&self) -> Topology {
        let t = self.read();
        Topology {
            hosts: t.hosts.values().cloned().collect(),
            pools: t.pools.values().cloned().collect(),
            vms: t.vms.values().cloned().collect(),
            volumes: t.volumes.values().cloned().collect(),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait::async_trait]
impl Inventory for StaticInventory {
    async fn get_vm(&self, vm_id: i64) -> Result<Option<VirtualMachine>> {
        Ok(self.read().vms.get(&vm_id).cloned())
    }

    async fn get_volume(&self, volume_id: i64) -> Result<Option<Volume>> {
        Ok(self.read().volumes.get(&volume_id).cloned())
    }

    async fn volumes_of_vm(&self, vm_id: i64) -> Result<Vec<Volume>> {
        Ok(self
            .read()
            .volumes
            .values()
            .filter(|v| v.vm_id == Some(vm_id))
            .cloned()
            .collect())
    }

    async fn get_pool(&self, pool_id: i64) -> Result<Option<StoragePool>> {
        Ok(self.read().pools.get(&pool_id).cloned())
    }

    async fn list_pools(&self, data_center_id: i64) -> Result<Vec<StoragePool>> {
        Ok(self
            .read()
            .pools
            .values()
            .filter(|p| p.data_center_id == data_center_id)
            .cloned()
            .collect())
    }

    async fn get_host(&self, host_id: i64) -> Result<Option<Host>> {
        Ok(self.read().hosts.get(&host_id).cloned())
    }

    async fn list_hosts(&self, data_center_id: i64) -> Result<Vec<Host>> {
        Ok(self
            .read()
            .hosts
            .values()
            .filter(|h| h.data_center_id == data_center_id)
            .cloned()
            .collect())
    }

    async fn vms_on_host(&self, host_id: i64) -> Result<Vec<VirtualMachine>> {
        Ok(self
            .read()
            .vms
            .values()
            .filter(|vm| {
                vm.host_id == Some(host_id)
                    && matches!(
                        vm.state,
                        VmState::Starting | VmState::Running | VmState::Stopping
                    )
            })
            .cloned()
            .collect())
    }

    async fn transition_vm(
        &self,
        vm_id: i64,
        from: VmState,
        to: VmState,
        host_id: Option<i64>,
    ) -> Result<bool> {
        let mut tables = self.write();
        let Some(vm) = tables.vms.get_mut(&vm_id) else {
            return Err(Error::VmNotFound(vm_id));
        };
        if vm.state != from || vm.removed {
            debug!(vm_id, %from, %to, actual = %vm.state, "VM state CAS lost");
            return Ok(false);
        }
        vm.state = to;
        vm.host_id = host_id;
        debug!(vm_id, %from, %to, ?host_id, "VM state changed");
        Ok(true)
    }

    async fn assign_volume_pool(&self, volume_id: i64, pool_id: i64) -> Result<()> {
        let mut tables = self.write();
        let volume = tables
            .volumes
            .get_mut(&volume_id)
            .ok_or(Error::VolumeNotFound(volume_id))?;
        volume.pool_id = Some(pool_id);
        Ok(())
    }
}

/// Admission check for jobs bound to `"VirtualMachine"` instances.
pub struct VmInstanceResolver {
    inventory: Arc<dyn Inventory>,
}

impl VmInstanceResolver {
    /// Resolver backed by an inventory.
    pub fn new(inventory: Arc<dyn Inventory>) -> Self {
        Self { inventory }
    }
}

#[async_trait::async_trait]
impl nimbus_core::InstanceResolver for VmInstanceResolver {
    async fn exists(&self, instance_id: i64) -> nimbus_core::Result<bool> {
        let vm = self.inventory.get_vm(instance_id).await.map_err(|e| {
            nimbus_core::CoreError::DatabaseError {
                operation: "inventory_get_vm".to_string(),
                details: e.to_string(),
            }
        })?;
        Ok(vm.is_some_and(|vm| !vm.removed))
    }
}
