// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deployment planners.
//!
//! A planner turns a [`VirtualMachineProfile`] plus caller constraints into a
//! [`DeployDestination`]: a host with room for the VM and a pool for each of
//! its volumes. Planners only read; capacity is taken afterwards by the
//! reservation CAS, and a planner may be asked again with the losing host
//! excluded.

mod first_fit;
mod user_dispersing;

pub use first_fit::FirstFitPlanner;
pub use user_dispersing::UserDispersingPlanner;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::inventory::Inventory;
use crate::model::{
    DeployDestination, DeploymentPlan, ExcludeList, Host, HostState, PoolState, StoragePool,
    VirtualMachineProfile, VolumeKind,
};
use crate::reservations::ReservationStore;

/// What planners may look at.
#[derive(Clone)]
pub struct PlannerContext {
    /// Topology.
    pub inventory: Arc<dyn Inventory>,
    /// Capacity ledger.
    pub reservations: Arc<dyn ReservationStore>,
}

/// Placement strategy.
#[async_trait::async_trait]
pub trait DeploymentPlanner: Send + Sync {
    /// Registry name.
    fn name(&self) -> &str;

    /// Whether this planner accepts the request at all.
    fn can_handle(
        &self,
        profile: &VirtualMachineProfile,
        plan: &DeploymentPlan,
        avoid: &ExcludeList,
    ) -> bool;

    /// Pick a destination, or `None` when nothing fits.
    async fn plan(
        &self,
        ctx: &PlannerContext,
        profile: &VirtualMachineProfile,
        plan: &DeploymentPlan,
        avoid: &ExcludeList,
    ) -> Result<Option<DeployDestination>>;
}

/// Planners by name.
#[derive(Clone, Default)]
pub struct PlannerRegistry {
    planners: HashMap<String, Arc<dyn DeploymentPlanner>>,
}

impl PlannerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with [`FirstFitPlanner`] and [`UserDispersingPlanner`].
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .register(FirstFitPlanner)
            .register(UserDispersingPlanner);
        registry
    }

    /// Register a planner under its own name.
    pub fn register(&mut self, planner: impl DeploymentPlanner + 'static) -> &mut Self {
        self.planners
            .insert(planner.name().to_string(), Arc::new(planner));
        self
    }

    /// Planner by name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn DeploymentPlanner>> {
        self.planners
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownPlanner(name.to_string()))
    }
}

/// Zone the request is confined to.
pub(crate) fn data_center_of(profile: &VirtualMachineProfile, plan: &DeploymentPlan) -> i64 {
    plan.data_center_id.unwrap_or(profile.vm.data_center_id)
}

/// Up hosts admitted by the plan, not excluded, with room for the VM.
/// Ordered by host id.
pub(crate) async fn candidate_hosts(
    ctx: &PlannerContext,
    profile: &VirtualMachineProfile,
    plan: &DeploymentPlan,
    avoid: &ExcludeList,
) -> Result<Vec<Host>> {
    let hosts = ctx
        .inventory
        .list_hosts(data_center_of(profile, plan))
        .await?;

    let mut candidates = Vec::new();
    for host in hosts {
        if host.state != HostState::Up || !plan.admits(&host) || avoid.should_avoid_host(&host) {
            continue;
        }
        let Some(capacity) = ctx.reservations.get_host_capacity(host.id).await? else {
            continue;
        };
        if capacity.fits(profile.vm.cpu, profile.vm.memory) {
            candidates.push(host);
        }
    }
    Ok(candidates)
}

fn usable(pool: &StoragePool, host: &Host, avoid: &ExcludeList) -> bool {
    pool.state == PoolState::Up && pool.serves(host) && !avoid.should_avoid_pool(pool)
}

/// Pool for every volume of the VM as seen from `host`.
///
/// A volume stays on its current pool when the host can reach it; the root
/// volume honours `plan.pool_id`; anything else goes to the lowest-id usable
/// pool. `None` when some volume has nowhere to go.
pub(crate) async fn assign_pools(
    ctx: &PlannerContext,
    profile: &VirtualMachineProfile,
    plan: &DeploymentPlan,
    host: &Host,
    avoid: &ExcludeList,
) -> Result<Option<BTreeMap<i64, i64>>> {
    let pools = ctx.inventory.list_pools(host.data_center_id).await?;
    let by_id: BTreeMap<i64, &StoragePool> = pools.iter().map(|p| (p.id, p)).collect();

    let mut assignment = BTreeMap::new();
    for volume in &profile.volumes {
        let wanted = match (volume.kind, plan.pool_id) {
            (VolumeKind::Root, Some(pool_id)) => Some(pool_id),
            _ => volume.pool_id,
        };

        let pinned = wanted
            .and_then(|id| by_id.get(&id))
            .filter(|pool| usable(pool, host, avoid));

        let chosen = match pinned {
            Some(pool) => pool.id,
            // An explicit root pool that the host cannot use rules the host out.
            None if volume.kind == VolumeKind::Root && plan.pool_id.is_some() => return Ok(None),
            None => match pools.iter().find(|p| usable(p, host, avoid)) {
                Some(pool) => pool.id,
                None => return Ok(None),
            },
        };
        assignment.insert(volume.id, chosen);
    }
    Ok(Some(assignment))
}

/// Destination on `host` with the given pools.
pub(crate) fn destination(host: &Host, volume_pools: BTreeMap<i64, i64>) -> DeployDestination {
    DeployDestination {
        data_center_id: host.data_center_id,
        pod_id: host.pod_id,
        cluster_id: host.cluster_id,
        host_id: host.id,
        volume_pools,
    }
}
