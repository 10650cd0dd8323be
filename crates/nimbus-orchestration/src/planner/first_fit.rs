// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lowest-id host that fits.

use tracing::debug;

use super::{DeploymentPlanner, PlannerContext, assign_pools, candidate_hosts, destination};
use crate::error::Result;
use crate::model::{DeployDestination, DeploymentPlan, ExcludeList, VirtualMachineProfile};

/// Places the VM on the first candidate host, in host id order, whose
/// pools can take every volume.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstFitPlanner;

#[async_trait::async_trait]
impl DeploymentPlanner for FirstFitPlanner {
    fn name(&self) -> &str {
        "FirstFitPlanner"
    }

    fn can_handle(
        &self,
        _profile: &VirtualMachineProfile,
        _plan: &DeploymentPlan,
        _avoid: &ExcludeList,
    ) -> bool {
        true
    }

    async fn plan(
        &self,
        ctx: &PlannerContext,
        profile: &VirtualMachineProfile,
        plan: &DeploymentPlan,
        avoid: &ExcludeList,
    ) -> Result<Option<DeployDestination>> {
        for host in candidate_hosts(ctx, profile, plan, avoid).await? {
            if let Some(pools) = assign_pools(ctx, profile, plan, &host, avoid).await? {
                debug!(vm_id = profile.vm.id, host_id = host.id, "First fit");
                return Ok(Some(destination(&host, pools)));
            }
        }
        Ok(None)
    }
}
