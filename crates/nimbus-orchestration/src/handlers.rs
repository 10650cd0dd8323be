// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Async job handlers for VM work.
//!
//! Every VM job is bound to the `("VirtualMachine", vm_id)` instance, so
//! work on one VM runs strictly one job at a time through its sync queue.
//! Handlers may run more than once for the same job after a node failure
//! and are written to converge: starting a running VM, stopping a stopped
//! one or destroying a destroyed one succeeds without touching the host,
//! and a start interrupted after its reservation was consumed resumes on
//! that reservation.

use std::collections::BTreeMap;
use std::sync::Arc;

use nimbus_core::{
    CommandHandler, HandlerError, HandlerRegistry, InstanceResolvers, JobContext, JobOutcome,
    SubmitJob,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::entity_manager::VmEntityManager;
use crate::inventory::{Inventory, VmInstanceResolver};
use crate::model::{Caller, DeploymentPlan, ExcludeList};

/// Instance type of VM-bound jobs.
pub const VM_INSTANCE_TYPE: &str = "VirtualMachine";
/// Start (reserve if needed, then deploy) a VM.
pub const VM_WORK_START: &str = "VmWorkStart";
/// Stop a VM.
pub const VM_WORK_STOP: &str = "VmWorkStop";
/// Destroy a VM.
pub const VM_WORK_DESTROY: &str = "VmWorkDestroy";

fn default_planner() -> String {
    "FirstFitPlanner".to_string()
}

/// Parameters of [`VM_WORK_START`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartParams {
    /// VM to start.
    pub vm_id: i64,
    /// Existing reservation to deploy; one is made when absent.
    #[serde(default)]
    pub reservation_id: Option<Uuid>,
    /// Planner used when reserving.
    #[serde(default = "default_planner")]
    pub planner: String,
    /// Placement constraints.
    #[serde(default)]
    pub plan: DeploymentPlan,
    /// Entities to avoid.
    #[serde(default)]
    pub exclude: ExcludeList,
    /// Free-form deploy parameters.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl StartParams {
    /// Start `vm_id` with the default planner and no constraints.
    pub fn new(vm_id: i64) -> Self {
        Self {
            vm_id,
            reservation_id: None,
            planner: default_planner(),
            plan: DeploymentPlan::default(),
            exclude: ExcludeList::default(),
            params: BTreeMap::new(),
        }
    }
}

/// Parameters of [`VM_WORK_STOP`] and [`VM_WORK_DESTROY`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmParams {
    /// Target VM.
    pub vm_id: i64,
}

/// Submission for a VM job, bound to the VM's sync queue.
pub fn vm_job<T: Serialize>(
    cmd: &str,
    vm_id: i64,
    params: &T,
    caller: Caller,
) -> nimbus_core::Result<SubmitJob> {
    SubmitJob::new(cmd)
        .caller(caller.user_id, caller.account_id)
        .instance(VM_INSTANCE_TYPE, vm_id)
        .params(params)
}

async fn caller_of(ctx: &JobContext) -> Result<Caller, HandlerError> {
    let job = ctx.store().query_status(ctx.job_id()).await?;
    Ok(Caller {
        user_id: job.user_id,
        account_id: job.account_id,
    })
}

async fn bail_if_cancelled(ctx: &JobContext) -> Result<(), HandlerError> {
    if ctx.is_cancel_requested().await? {
        info!(job_id = ctx.job_id(), "Cancelled before any VM change");
        return Err(HandlerError::internal("job cancelled"));
    }
    Ok(())
}

/// Handler of [`VM_WORK_START`].
pub struct VmWorkStart {
    manager: Arc<VmEntityManager>,
}

#[async_trait::async_trait]
impl CommandHandler for VmWorkStart {
    type Params = StartParams;

    async fn handle(&self, ctx: &JobContext, p: StartParams) -> Result<JobOutcome, HandlerError> {
        if self.manager.is_running(p.vm_id).await? {
            return Ok(JobOutcome::Completed(json!({
                "vm_id": p.vm_id,
                "state": "running",
            })));
        }
        // A previous run got as far as the host; finish that start.
        if let Some((reservation_id, dest)) = self.manager.resume_start(p.vm_id).await? {
            return Ok(JobOutcome::Completed(json!({
                "vm_id": p.vm_id,
                "state": "running",
                "host_id": dest.host_id,
                "reservation_id": reservation_id,
            })));
        }
        bail_if_cancelled(ctx).await?;
        let caller = caller_of(ctx).await?;

        let reservation_id = match p.reservation_id {
            Some(id) => id,
            None => {
                self.manager
                    .reserve(p.vm_id, &p.planner, p.plan, p.exclude)
                    .await?
            }
        };
        ctx.update_progress(50).await?;

        let dest = self.manager.deploy(reservation_id, caller, p.params).await?;
        Ok(JobOutcome::Completed(json!({
            "vm_id": p.vm_id,
            "state": "running",
            "host_id": dest.host_id,
            "reservation_id": reservation_id,
        })))
    }
}

/// Handler of [`VM_WORK_STOP`].
pub struct VmWorkStop {
    manager: Arc<VmEntityManager>,
}

#[async_trait::async_trait]
impl CommandHandler for VmWorkStop {
    type Params = VmParams;

    async fn handle(&self, ctx: &JobContext, p: VmParams) -> Result<JobOutcome, HandlerError> {
        bail_if_cancelled(ctx).await?;
        let caller = caller_of(ctx).await?;
        self.manager.stop(p.vm_id, caller).await?;
        Ok(JobOutcome::Completed(json!({
            "vm_id": p.vm_id,
            "state": "stopped",
        })))
    }
}

/// Handler of [`VM_WORK_DESTROY`].
pub struct VmWorkDestroy {
    manager: Arc<VmEntityManager>,
}

#[async_trait::async_trait]
impl CommandHandler for VmWorkDestroy {
    type Params = VmParams;

    async fn handle(&self, ctx: &JobContext, p: VmParams) -> Result<JobOutcome, HandlerError> {
        bail_if_cancelled(ctx).await?;
        let caller = caller_of(ctx).await?;
        self.manager.destroy(p.vm_id, caller).await?;
        Ok(JobOutcome::Completed(json!({
            "vm_id": p.vm_id,
            "state": "destroyed",
        })))
    }
}

/// Register the VM handlers.
pub fn register_vm_handlers(registry: &mut HandlerRegistry, manager: Arc<VmEntityManager>) {
    registry
        .register_command(
            VM_WORK_START,
            VmWorkStart {
                manager: manager.clone(),
            },
        )
        .register_command(
            VM_WORK_STOP,
            VmWorkStop {
                manager: manager.clone(),
            },
        )
        .register_command(VM_WORK_DESTROY, VmWorkDestroy { manager });
}

/// Resolvers that reject VM jobs for unknown or removed VMs.
pub fn vm_resolvers(inventory: Arc<dyn Inventory>) -> InstanceResolvers {
    let mut resolvers = InstanceResolvers::new();
    resolvers.register(VM_INSTANCE_TYPE, Arc::new(VmInstanceResolver::new(inventory)));
    resolvers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_params_defaults() {
        let p: StartParams = serde_json::from_str(r#"{"vm_id": 3}"#).unwrap();
        assert_eq!(p.vm_id, 3);
        assert_eq!(p.planner, "FirstFitPlanner");
        assert!(p.reservation_id.is_none());
        assert_eq!(p.plan, DeploymentPlan::default());
    }

    #[test]
    fn test_vm_job_is_bound_to_vm_queue() {
        let job = vm_job(
            VM_WORK_STOP,
            42,
            &VmParams { vm_id: 42 },
            Caller {
                user_id: 2,
                account_id: 3,
            },
        )
        .unwrap();
        assert_eq!(job.instance_type.as_deref(), Some(VM_INSTANCE_TYPE));
        assert_eq!(job.instance_id, Some(42));
        assert_eq!((job.user_id, job.account_id), (2, 3));
        assert_eq!(job.cmd_info, r#"{"vm_id":42}"#);
    }
}
