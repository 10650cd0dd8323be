// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process agent that records commands and answers from a script.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use super::{AgentClient, AgentCommand, AgentError, Answer};
use crate::model::Host;

#[derive(Default)]
struct State {
    sent: Vec<(i64, AgentCommand)>,
    scripted: HashMap<i64, VecDeque<Answer>>,
    delay: Option<Duration>,
}

/// Agent double. Answers `ok` unless a failure was scripted for the host.
#[derive(Default)]
pub struct MockAgent {
    state: Mutex<State>,
}

impl MockAgent {
    /// Agent that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an answer for the next command sent to `host_id`.
    pub fn script(&self, host_id: i64, answer: Answer) {
        self.lock()
            .scripted
            .entry(host_id)
            .or_default()
            .push_back(answer);
    }

    /// Delay every answer, to exercise command timeouts.
    pub fn set_delay(&self, delay: Duration) {
        self.lock().delay = Some(delay);
    }

    /// Commands received so far as `(host_id, command)`.
    pub fn sent(&self) -> Vec<(i64, AgentCommand)> {
        self.lock().sent.clone()
    }

    /// Number of commands with the given name, e.g. `"StartCommand"`.
    pub fn count(&self, name: &str) -> usize {
        self.lock()
            .sent
            .iter()
            .filter(|(_, cmd)| cmd.name() == name)
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait::async_trait]
impl AgentClient for MockAgent {
    async fn send(&self, host: &Host, command: &AgentCommand) -> Result<Answer, AgentError> {
        let (answer, delay) = {
            let mut state = self.lock();
            state.sent.push((host.id, command.clone()));
            let answer = state
                .scripted
                .get_mut(&host.id)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(Answer::ok);
            (answer, state.delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(answer)
    }
}
