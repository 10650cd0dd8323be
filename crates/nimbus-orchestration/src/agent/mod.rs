// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Host agent commands and transports.
//!
//! The orchestrator never talks to a hypervisor directly; it sends
//! [`AgentCommand`]s to the agent running on the chosen host and reads back an
//! [`Answer`].

mod http;
mod mock;

pub use http::HttpAgentClient;
pub use mock::MockAgent;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::{Host, VirtualMachine, VolumeKind};

/// Volume as the agent sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeTO {
    /// Volume id.
    pub id: i64,
    /// Root or data.
    pub kind: VolumeKind,
    /// Pool holding the volume.
    pub pool_id: i64,
}

/// Command sent to a host agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentCommand {
    /// Boot a VM.
    Start {
        /// VM id.
        vm_id: i64,
        /// Instance name.
        vm_name: String,
        /// CPU cores.
        cpu: i64,
        /// Memory in MiB.
        memory: i64,
        /// Disks, root first.
        volumes: Vec<VolumeTO>,
    },
    /// Shut a VM down.
    Stop {
        /// VM id.
        vm_id: i64,
        /// Instance name.
        vm_name: String,
    },
}

impl AgentCommand {
    /// Start command for a VM with its placed volumes.
    pub fn start(vm: &VirtualMachine, volumes: Vec<VolumeTO>) -> Self {
        Self::Start {
            vm_id: vm.id,
            vm_name: vm.name.clone(),
            cpu: vm.cpu,
            memory: vm.memory,
            volumes,
        }
    }

    /// Stop command for a VM.
    pub fn stop(vm: &VirtualMachine) -> Self {
        Self::Stop {
            vm_id: vm.id,
            vm_name: vm.name.clone(),
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "StartCommand",
            Self::Stop { .. } => "StopCommand",
        }
    }
}

/// Agent reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    /// Whether the command succeeded.
    pub result: bool,
    /// Failure reason or informational text.
    #[serde(default)]
    pub details: Option<String>,
}

impl Answer {
    /// Successful answer.
    pub fn ok() -> Self {
        Self {
            result: true,
            details: None,
        }
    }

    /// Failed answer.
    pub fn failed(details: impl Into<String>) -> Self {
        Self {
            result: false,
            details: Some(details.into()),
        }
    }
}

/// Transport failure talking to an agent.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AgentError {
    /// No answer within the command timeout.
    #[error("agent on host {host_id} did not answer within {timeout:?}")]
    Timeout {
        /// Host addressed.
        host_id: i64,
        /// Timeout that elapsed.
        timeout: Duration,
    },

    /// Connection could not be established.
    #[error("agent on host {host_id} unreachable: {details}")]
    Unreachable {
        /// Host addressed.
        host_id: i64,
        /// Transport details.
        details: String,
    },

    /// The agent answered something unreadable.
    #[error("agent protocol error: {0}")]
    Protocol(String),
}

/// Sends commands to host agents.
#[async_trait::async_trait]
pub trait AgentClient: Send + Sync {
    /// Deliver `command` to the agent on `host` and wait for its answer.
    async fn send(&self, host: &Host, command: &AgentCommand) -> Result<Answer, AgentError>;
}
