// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reserve-then-deploy entry points.
//!
//! `reserve` plans a placement and takes host capacity for it; `deploy`
//! consumes that reservation exactly once and boots the VM there.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::{Error, Result, Scope};
use crate::model::{
    Caller, DeployDestination, DeploymentPlan, ExcludeList, PoolState, ReservationStatus,
    VirtualMachine, VirtualMachineProfile, VmReservation, VmState,
};
use crate::orchestrator::VmOrchestrator;
use crate::planner::{PlannerContext, PlannerRegistry};
use crate::reservations::NewReservation;

/// Placement and lifecycle facade used by the VM job handlers.
pub struct VmEntityManager {
    ctx: PlannerContext,
    planners: PlannerRegistry,
    orchestrator: Arc<VmOrchestrator>,
    reservation_ttl: Duration,
    placement_attempts: u32,
}

impl VmEntityManager {
    /// Create a manager.
    ///
    /// `placement_attempts` bounds re-planning after another node took the
    /// capacity a planner picked.
    pub fn new(
        ctx: PlannerContext,
        planners: PlannerRegistry,
        orchestrator: Arc<VmOrchestrator>,
        reservation_ttl: Duration,
        placement_attempts: u32,
    ) -> Self {
        Self {
            ctx,
            planners,
            orchestrator,
            reservation_ttl,
            placement_attempts: placement_attempts.max(1),
        }
    }

    async fn load_vm(&self, vm_id: i64) -> Result<VirtualMachine> {
        self.ctx
            .inventory
            .get_vm(vm_id)
            .await?
            .filter(|vm| !vm.removed)
            .ok_or(Error::VmNotFound(vm_id))
    }

    /// Narrow the plan to where the root volume already lives.
    async fn anchor_to_root_pool(
        &self,
        profile: &VirtualMachineProfile,
        mut plan: DeploymentPlan,
    ) -> Result<DeploymentPlan> {
        let Some(pool_id) = profile.root_volume().and_then(|v| v.pool_id) else {
            return Ok(plan);
        };
        let Some(pool) = self.ctx.inventory.get_pool(pool_id).await? else {
            return Ok(plan);
        };
        if pool.state == PoolState::Maintenance {
            info!(vm_id = profile.vm.id, pool_id, "Root pool in maintenance, ignoring it");
            return Ok(plan);
        }

        if let (Some(wanted), Some(actual)) = (plan.cluster_id, pool.cluster_id)
            && wanted != actual
        {
            return Err(Error::PlacementConflict(format!(
                "root volume of VM {} is in cluster {}, requested cluster {}",
                profile.vm.id, actual, wanted
            )));
        }
        if let Some(wanted) = plan.data_center_id
            && wanted != pool.data_center_id
        {
            return Err(Error::PlacementConflict(format!(
                "root volume of VM {} is in data center {}, requested data center {}",
                profile.vm.id, pool.data_center_id, wanted
            )));
        }

        plan.data_center_id = Some(pool.data_center_id);
        plan.pod_id = pool.pod_id.or(plan.pod_id);
        plan.cluster_id = pool.cluster_id.or(plan.cluster_id);
        plan.pool_id = Some(pool.id);
        Ok(plan)
    }

    /// Bring the capacity ledger's totals in line with the inventory.
    async fn sync_capacity(&self, data_center_id: i64) -> Result<()> {
        for host in self.ctx.inventory.list_hosts(data_center_id).await? {
            self.ctx
                .reservations
                .ensure_host_capacity(host.id, host.total_cpu, host.total_memory)
                .await?;
        }
        Ok(())
    }

    /// Find a destination with `planner_name` and hold capacity for it.
    #[instrument(skip(self, plan, exclude))]
    pub async fn reserve(
        &self,
        vm_id: i64,
        planner_name: &str,
        plan: DeploymentPlan,
        exclude: ExcludeList,
    ) -> Result<Uuid> {
        let vm = self.load_vm(vm_id).await?;
        // A VM mid-start already holds a consumed reservation.
        if vm.state != VmState::Stopped {
            return Err(Error::InvalidVmState {
                vm_id,
                expected: VmState::Stopped,
                actual: vm.state,
            });
        }
        let volumes = self.ctx.inventory.volumes_of_vm(vm_id).await?;
        let profile = VirtualMachineProfile::new(vm, volumes, BTreeMap::new());

        let plan = self.anchor_to_root_pool(&profile, plan).await?;
        let data_center_id = plan.data_center_id.unwrap_or(profile.vm.data_center_id);

        let planner = self.planners.get(planner_name)?;
        let mut avoid = exclude;
        if !planner.can_handle(&profile, &plan, &avoid) {
            return Err(Error::PlannerCannotHandle(planner_name.to_string()));
        }

        self.sync_capacity(data_center_id).await?;

        for attempt in 1..=self.placement_attempts {
            let Some(dest) = planner.plan(&self.ctx, &profile, &plan, &avoid).await? else {
                break;
            };

            let now = Utc::now();
            let request = NewReservation {
                id: Uuid::new_v4(),
                vm_id,
                cpu: profile.vm.cpu,
                memory: profile.vm.memory,
                expires_at: now
                    + chrono::Duration::milliseconds(self.reservation_ttl.as_millis() as i64),
                destination: dest,
            };

            if let Some(reservation) = self.ctx.reservations.create_reservation(&request, now).await? {
                info!(
                    vm_id,
                    reservation_id = %reservation.id,
                    host_id = reservation.host_id,
                    planner = planner_name,
                    "Capacity reserved"
                );
                return Ok(reservation.id);
            }

            warn!(
                vm_id,
                host_id = request.destination.host_id,
                attempt,
                "Lost capacity race, re-planning"
            );
            avoid.add_host(request.destination.host_id);
        }

        Err(Error::InsufficientCapacity {
            scope: Scope::DataCenter,
            id: data_center_id,
        })
    }

    /// Consume a reservation and boot the VM there.
    ///
    /// A reservation is good for one deploy; a failed boot releases it.
    #[instrument(skip(self, params), fields(user_id = caller.user_id))]
    pub async fn deploy(
        &self,
        reservation_id: Uuid,
        caller: Caller,
        params: BTreeMap<String, String>,
    ) -> Result<DeployDestination> {
        let reservation = self
            .ctx
            .reservations
            .get_reservation(reservation_id)
            .await?
            .ok_or(Error::ReservationNotFound(reservation_id))?;

        if !self
            .ctx
            .reservations
            .consume_reservation(reservation_id, Utc::now())
            .await?
        {
            return Err(Error::ReservationConsumed(reservation_id));
        }

        let dest = self.destination_of(&reservation).await?;

        info!(
            vm_id = reservation.vm_id,
            %reservation_id,
            host_id = dest.host_id,
            params = params.len(),
            "Deploying VM"
        );

        self.start_on(&reservation, &dest).await?;
        Ok(dest)
    }

    /// Finish a start that a previous run of the job began.
    ///
    /// A VM left in `Starting` is booted on the host of its consumed
    /// reservation instead of reserving again. `None` when there is nothing
    /// to resume.
    #[instrument(skip(self))]
    pub async fn resume_start(&self, vm_id: i64) -> Result<Option<(Uuid, DeployDestination)>> {
        let vm = self.load_vm(vm_id).await?;
        if vm.state != VmState::Starting {
            return Ok(None);
        }
        let consumed = self
            .ctx
            .reservations
            .active_reservations_for_vm(vm_id)
            .await?
            .into_iter()
            .rev()
            .find(|r| r.reservation_status() == ReservationStatus::Consumed);
        let Some(reservation) = consumed else {
            warn!(vm_id, "VM is starting without a consumed reservation");
            return Ok(None);
        };

        let dest = self.destination_of(&reservation).await?;
        info!(vm_id, reservation_id = %reservation.id, host_id = dest.host_id, "Resuming VM start");
        self.start_on(&reservation, &dest).await?;
        Ok(Some((reservation.id, dest)))
    }

    async fn destination_of(&self, reservation: &VmReservation) -> Result<DeployDestination> {
        let volume_pools = self
            .ctx
            .reservations
            .reservation_volumes(reservation.id)
            .await?
            .into_iter()
            .map(|v| (v.volume_id, v.pool_id))
            .collect();
        Ok(DeployDestination {
            data_center_id: reservation.data_center_id,
            pod_id: reservation.pod_id,
            cluster_id: reservation.cluster_id,
            host_id: reservation.host_id,
            volume_pools,
        })
    }

    /// Boot on the reserved destination; a failed boot releases the
    /// reservation.
    async fn start_on(&self, reservation: &VmReservation, dest: &DeployDestination) -> Result<()> {
        if let Err(e) = self.orchestrator.start(reservation.vm_id, dest).await {
            if let Err(release) = self
                .ctx
                .reservations
                .release_reservation(reservation.id, Utc::now())
                .await
            {
                warn!(reservation_id = %reservation.id, error = %release, "Failed to release reservation after failed start");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Stop a VM where it runs.
    #[instrument(skip(self), fields(user_id = caller.user_id))]
    pub async fn stop(&self, vm_id: i64, caller: Caller) -> Result<()> {
        self.orchestrator.stop(vm_id).await
    }

    /// Destroy a VM, stopping it first if needed.
    #[instrument(skip(self), fields(user_id = caller.user_id))]
    pub async fn destroy(&self, vm_id: i64, caller: Caller) -> Result<()> {
        self.orchestrator.destroy(vm_id).await
    }

    /// Whether the VM exists and is running.
    pub async fn is_running(&self, vm_id: i64) -> Result<bool> {
        let vm = self.load_vm(vm_id).await?;
        Ok(vm.state == VmState::Running)
    }
}
