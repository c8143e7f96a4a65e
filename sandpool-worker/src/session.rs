// Copyright 2025 The Sandpool Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use parking_lot::Mutex;
use sandpool_error::{Code, Error, ResultExt, make_err};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::typings::{AgentOutput, AgentOutputStatus, EnvOutput, HistoryItem, SampleStatus, TaskOutput};

#[derive(Debug, Default)]
struct Turns {
    history: Vec<HistoryItem>,
    /// First history entry the agent has not seen yet.
    history_ptr: usize,
    status: SampleStatus,
}

/// Hands turns back and forth between the agent (HTTP side) and the
/// running sample (task side).
///
/// The agent side calls [`SessionController::agent_pull`] with its output
/// and waits for the next environment output. The task side calls
/// [`SessionController::env_pull`] with what the environment produced and
/// waits for the agent's next output. Only one agent turn may be in flight.
#[derive(Debug)]
pub struct SessionController {
    to_agent: mpsc::UnboundedSender<EnvOutput>,
    /// Held for the duration of an agent turn.
    agent_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<EnvOutput>>,
    to_env: mpsc::UnboundedSender<AgentOutput>,
    env_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<AgentOutput>>,
    turns: Mutex<Turns>,
}

impl Default for SessionController {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionController {
    pub fn new() -> Self {
        let (to_agent, agent_rx) = mpsc::unbounded_channel();
        let (to_env, env_rx) = mpsc::unbounded_channel();
        Self {
            to_agent,
            agent_rx: tokio::sync::Mutex::new(agent_rx),
            to_env,
            env_rx: tokio::sync::Mutex::new(env_rx),
            turns: Mutex::new(Turns::default()),
        }
    }

    /// Whether an agent turn is in flight.
    pub fn is_busy(&self) -> bool {
        self.agent_rx.try_lock().is_err()
    }

    /// Sends the agent's output, if any, and waits for the next environment
    /// output. Fails with `FailedPrecondition` while another turn is in
    /// flight.
    pub async fn agent_pull(&self, output: Option<AgentOutput>) -> Result<EnvOutput, Error> {
        let mut agent_rx = self.agent_rx.try_lock().map_err(|_| {
            make_err!(
                Code::FailedPrecondition,
                "Task Executing, please do not send new request."
            )
        })?;
        if let Some(output) = output {
            self.inject(output)?;
        }
        agent_rx
            .recv()
            .await
            .err_tip_with_code(|_| (Code::Internal, "Sample stopped producing output"))
    }

    /// Queues agent output for the sample without waiting for an answer.
    pub fn inject(&self, output: AgentOutput) -> Result<(), Error> {
        self.to_env
            .send(output)
            .map_err(|_| make_err!(Code::Internal, "Sample no longer accepts agent output"))
    }

    /// Appends `items` to the history, hands the new state to the agent and
    /// waits for its next output. Agent messages are recorded in the history.
    pub async fn env_pull(&self, items: Vec<HistoryItem>) -> Result<AgentOutput, Error> {
        let env_output = {
            let mut turns = self.turns.lock();
            turns.history.extend(items);
            EnvOutput {
                status: SampleStatus::Running,
                result: None,
                history: turns.history.clone(),
                history_ptr: turns.history_ptr,
            }
        };
        self.to_agent
            .send(env_output)
            .map_err(|_| make_err!(Code::Internal, "Agent side of the session is gone"))?;

        let agent_output = self
            .env_rx
            .lock()
            .await
            .recv()
            .await
            .err_tip_with_code(|_| (Code::Internal, "Agent side of the session is gone"))?;
        let mut turns = self.turns.lock();
        if agent_output.status == AgentOutputStatus::Normal {
            turns
                .history
                .extend(agent_output.messages.iter().cloned().map(HistoryItem::Chat));
        }
        turns.history_ptr = turns.history.len();
        drop(turns);
        debug!(status = ?agent_output.status, "Agent turn received");
        Ok(agent_output)
    }

    /// Records the final state of the sample and hands it to the agent.
    pub fn env_finish(&self, output: &TaskOutput) {
        let env_output = {
            let mut turns = self.turns.lock();
            turns.status = output.status;
            turns.history.clone_from(&output.history);
            EnvOutput {
                status: output.status,
                result: output.result.clone(),
                history: output.history.clone(),
                history_ptr: turns.history_ptr.min(output.history.len()),
            }
        };
        if self.to_agent.send(env_output).is_err() {
            debug!("Sample finished after the agent side went away");
        }
    }

    pub fn get_status(&self) -> SampleStatus {
        self.turns.lock().status
    }

    pub fn history(&self) -> Vec<HistoryItem> {
        self.turns.lock().history.clone()
    }

    /// Appends entries without handing a turn to the agent, e.g. rewards.
    pub fn push_history(&self, item: HistoryItem) {
        self.turns.lock().history.push(item);
    }
}

/// One sample's session as seen by a task.
#[derive(Debug)]
pub struct Session {
    pub session_id: u64,
    pub controller: SessionController,
    tools: Mutex<Option<Value>>,
    cancel_token: CancellationToken,
}

impl Session {
    pub fn new(session_id: u64) -> Self {
        Self {
            session_id,
            controller: SessionController::new(),
            tools: Mutex::new(None),
            cancel_token: CancellationToken::new(),
        }
    }

    /// Overrides the task's tool list for this session.
    pub fn set_tools(&self, tools: Value) {
        *self.tools.lock() = Some(tools);
    }

    pub fn tools(&self) -> Option<Value> {
        self.tools.lock().clone()
    }

    /// Fired when the sample is cancelled outright.
    pub const fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }
}
