// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! VM lifecycle through the host agent.
//!
//! ```text
//! Stopped ──start──▶ Starting ──ok──▶ Running
//!    ▲                  │ fail           │ stop
//!    │◀─────────────────┘                ▼
//!    │◀──────────────ok─────────────  Stopping ──fail──▶ Running
//!    │
//!    └──destroy──▶ Destroyed
//! ```
//!
//! Every edge is a compare-and-set on the inventory. A VM left in `Starting`
//! or `Stopping` by a node that died mid-command is picked up again by the
//! re-executed job and the command is resent.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::agent::{AgentClient, AgentCommand, AgentError, VolumeTO};
use crate::error::{Error, Result};
use crate::inventory::Inventory;
use crate::model::{DeployDestination, Host, ReservationStatus, VirtualMachine, VmState, VolumeKind};
use crate::reservations::ReservationStore;

/// Drives VM state changes on hosts.
pub struct VmOrchestrator {
    inventory: Arc<dyn Inventory>,
    agent: Arc<dyn AgentClient>,
    reservations: Arc<dyn ReservationStore>,
    command_timeout: Duration,
}

impl VmOrchestrator {
    /// Create an orchestrator. `command_timeout` bounds each agent command.
    pub fn new(
        inventory: Arc<dyn Inventory>,
        agent: Arc<dyn AgentClient>,
        reservations: Arc<dyn ReservationStore>,
        command_timeout: Duration,
    ) -> Self {
        Self {
            inventory,
            agent,
            reservations,
            command_timeout,
        }
    }

    async fn load_vm(&self, vm_id: i64) -> Result<VirtualMachine> {
        self.inventory
            .get_vm(vm_id)
            .await?
            .filter(|vm| !vm.removed)
            .ok_or(Error::VmNotFound(vm_id))
    }

    async fn load_host(&self, host_id: i64) -> Result<Host> {
        self.inventory
            .get_host(host_id)
            .await?
            .ok_or(Error::HostNotFound(host_id))
    }

    /// CAS, turning a lost race into the state actually found.
    async fn transition(
        &self,
        vm_id: i64,
        from: VmState,
        to: VmState,
        host_id: Option<i64>,
    ) -> Result<()> {
        if self.inventory.transition_vm(vm_id, from, to, host_id).await? {
            return Ok(());
        }
        let actual = self.load_vm(vm_id).await?.state;
        Err(Error::InvalidVmState {
            vm_id,
            expected: from,
            actual,
        })
    }

    async fn send(&self, host: &Host, command: AgentCommand) -> Result<()> {
        let answer = tokio::time::timeout(self.command_timeout, self.agent.send(host, &command))
            .await
            .map_err(|_| AgentError::Timeout {
                host_id: host.id,
                timeout: self.command_timeout,
            })??;

        if answer.result {
            Ok(())
        } else {
            Err(Error::AgentFailed {
                host_id: host.id,
                details: answer
                    .details
                    .unwrap_or_else(|| format!("{} failed", command.name())),
            })
        }
    }

    /// Boot the VM on the destination. Succeeds immediately if it is
    /// already running.
    #[instrument(skip(self, dest), fields(host_id = dest.host_id))]
    pub async fn start(&self, vm_id: i64, dest: &DeployDestination) -> Result<()> {
        let vm = self.load_vm(vm_id).await?;
        match vm.state {
            VmState::Running => {
                info!(vm_id, host_id = ?vm.host_id, "VM already running");
                return Ok(());
            }
            VmState::Stopped => {
                self.transition(vm_id, VmState::Stopped, VmState::Starting, Some(dest.host_id))
                    .await?;
            }
            VmState::Starting if vm.host_id == Some(dest.host_id) => {
                warn!(vm_id, "Resuming interrupted start");
            }
            actual => {
                return Err(Error::InvalidVmState {
                    vm_id,
                    expected: VmState::Stopped,
                    actual,
                });
            }
        }

        match self.boot(&vm, dest).await {
            Ok(()) => {
                self.transition(vm_id, VmState::Starting, VmState::Running, Some(dest.host_id))
                    .await?;
                info!(vm_id, host_id = dest.host_id, "VM started");
                Ok(())
            }
            Err(e) => {
                warn!(vm_id, host_id = dest.host_id, error = %e, "VM start failed");
                if let Err(revert) = self
                    .transition(vm_id, VmState::Starting, VmState::Stopped, None)
                    .await
                {
                    warn!(vm_id, error = %revert, "Failed to revert VM to stopped");
                }
                Err(e)
            }
        }
    }

    async fn boot(&self, vm: &VirtualMachine, dest: &DeployDestination) -> Result<()> {
        let host = self.load_host(dest.host_id).await?;

        let mut volumes = Vec::new();
        for volume in self.inventory.volumes_of_vm(vm.id).await? {
            let pool_id = dest
                .volume_pools
                .get(&volume.id)
                .copied()
                .or(volume.pool_id)
                .ok_or(Error::VolumeNotFound(volume.id))?;
            if volume.pool_id != Some(pool_id) {
                self.inventory.assign_volume_pool(volume.id, pool_id).await?;
            }
            volumes.push(VolumeTO {
                id: volume.id,
                kind: volume.kind,
                pool_id,
            });
        }
        volumes.sort_by_key(|v| (v.kind != VolumeKind::Root, v.id));

        self.send(&host, AgentCommand::start(vm, volumes)).await
    }

    /// Shut the VM down and return its consumed capacity. No-op when it is
    /// not running.
    #[instrument(skip(self))]
    pub async fn stop(&self, vm_id: i64) -> Result<()> {
        let vm = self.load_vm(vm_id).await?;
        let host_id = match (vm.state, vm.host_id) {
            (VmState::Stopped | VmState::Destroyed, _) => {
                info!(vm_id, state = %vm.state, "VM not running, nothing to stop");
                return Ok(());
            }
            (VmState::Running, Some(host_id)) => {
                self.transition(vm_id, VmState::Running, VmState::Stopping, Some(host_id))
                    .await?;
                host_id
            }
            (VmState::Stopping, Some(host_id)) => {
                warn!(vm_id, "Resuming interrupted stop");
                host_id
            }
            (actual, _) => {
                return Err(Error::InvalidVmState {
                    vm_id,
                    expected: VmState::Running,
                    actual,
                });
            }
        };

        let host = self.load_host(host_id).await?;
        if let Err(e) = self.send(&host, AgentCommand::stop(&vm)).await {
            warn!(vm_id, host_id, error = %e, "VM stop failed");
            if let Err(revert) = self
                .transition(vm_id, VmState::Stopping, VmState::Running, Some(host_id))
                .await
            {
                warn!(vm_id, error = %revert, "Failed to revert VM to running");
            }
            return Err(e);
        }

        self.transition(vm_id, VmState::Stopping, VmState::Stopped, None)
            .await?;
        self.release_reservations(vm_id, Some(ReservationStatus::Consumed))
            .await?;
        info!(vm_id, host_id, "VM stopped");
        Ok(())
    }

    /// Stop the VM if needed and mark it destroyed. No-op when already
    /// destroyed.
    #[instrument(skip(self))]
    pub async fn destroy(&self, vm_id: i64) -> Result<()> {
        let vm = self.load_vm(vm_id).await?;
        match vm.state {
            VmState::Destroyed => {
                info!(vm_id, "VM already destroyed");
                return Ok(());
            }
            VmState::Running | VmState::Stopping => self.stop(vm_id).await?,
            VmState::Stopped => {}
            VmState::Starting => {
                return Err(Error::InvalidVmState {
                    vm_id,
                    expected: VmState::Stopped,
                    actual: VmState::Starting,
                });
            }
        }

        self.transition(vm_id, VmState::Stopped, VmState::Destroyed, None)
            .await?;
        // Unconsumed reservations die with the VM.
        self.release_reservations(vm_id, None).await?;
        info!(vm_id, "VM destroyed");
        Ok(())
    }

    async fn release_reservations(
        &self,
        vm_id: i64,
        only: Option<ReservationStatus>,
    ) -> Result<()> {
        for reservation in self.reservations.active_reservations_for_vm(vm_id).await? {
            if only.is_some_and(|status| reservation.reservation_status() != status) {
                continue;
            }
            if self
                .reservations
                .release_reservation(reservation.id, Utc::now())
                .await?
            {
                info!(vm_id, reservation_id = %reservation.id, host_id = reservation.host_id, "Reservation released");
            }
        }
        Ok(())
    }
}
