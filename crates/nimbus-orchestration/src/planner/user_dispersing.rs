// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Spread an account's VMs across hosts.

use tracing::debug;

use super::{DeploymentPlanner, PlannerContext, assign_pools, candidate_hosts, destination};
use crate::error::Result;
use crate::model::{DeployDestination, DeploymentPlan, ExcludeList, VirtualMachineProfile};

/// Prefers the candidate host running the fewest VMs of the same account.
/// Ties go to the lower host id.
#[derive(Debug, Clone, Copy, Default)]
pub struct UserDispersingPlanner;

#[async_trait::async_trait]
impl DeploymentPlanner for UserDispersingPlanner {
    fn name(&self) -> &str {
        "UserDispersingPlanner"
    }

    // A pinned host leaves nothing to disperse.
    fn can_handle(
        &self,
        _profile: &VirtualMachineProfile,
        plan: &DeploymentPlan,
        _avoid: &ExcludeList,
    ) -> bool {
        plan.host_id.is_none()
    }

    async fn plan(
        &self,
        ctx: &PlannerContext,
        profile: &VirtualMachineProfile,
        plan: &DeploymentPlan,
        avoid: &ExcludeList,
    ) -> Result<Option<DeployDestination>> {
        let account_id = profile.vm.account_id;

        let mut ranked = Vec::new();
        for host in candidate_hosts(ctx, profile, plan, avoid).await? {
            let same_account = ctx
                .inventory
                .vms_on_host(host.id)
                .await?
                .iter()
                .filter(|vm| vm.account_id == account_id && vm.id != profile.vm.id)
                .count();
            ranked.push((same_account, host));
        }
        ranked.sort_by_key(|(count, host)| (*count, host.id));

        for (count, host) in ranked {
            if let Some(pools) = assign_pools(ctx, profile, plan, &host, avoid).await? {
                debug!(
                    vm_id = profile.vm.id,
                    host_id = host.id,
                    account_vms = count,
                    "Dispersed placement"
                );
                return Ok(Some(destination(&host, pools)));
            }
        }
        Ok(None)
    }
}
