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

//! Wire types shared by the worker, its tasks and the controller.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Sample index. `-1` marks a custom task.
pub type SampleIndex = i64;

pub const CUSTOM_TASK_INDEX: SampleIndex = -1;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SampleStatus {
    #[default]
    Running,
    Completed,
    AgentContextLimit,
    AgentValidationFailed,
    AgentInvalidAction,
    TaskLimitReached,
    Unknown,
    TaskError,
    Cancelled,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentOutputStatus {
    #[default]
    Normal,
    Cancelled,
    AgentContextLimit,
}

/// What the agent sends into a sample.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct AgentOutput {
    #[serde(default)]
    pub status: AgentOutputStatus,
    #[serde(default)]
    pub messages: Vec<Value>,
}

impl AgentOutput {
    pub const fn normal(messages: Vec<Value>) -> Self {
        Self {
            status: AgentOutputStatus::Normal,
            messages,
        }
    }

    pub const fn cancelled() -> Self {
        Self {
            status: AgentOutputStatus::Cancelled,
            messages: Vec::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct RewardHistoryItem {
    pub reward: f64,
    #[serde(default)]
    pub metrics: Map<String, Value>,
}

/// One history entry. Reward entries are kept apart from chat messages
/// when building responses.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum HistoryItem {
    Reward(RewardHistoryItem),
    Chat(Value),
}

/// Splits history into chat messages and rewards, keeping order.
pub fn split_history(history: &[HistoryItem]) -> (Vec<Value>, Vec<RewardHistoryItem>) {
    let mut chat = Vec::new();
    let mut rewards = Vec::new();
    for item in history {
        match item {
            HistoryItem::Reward(reward) => rewards.push(reward.clone()),
            HistoryItem::Chat(message) => chat.push(message.clone()),
        }
    }
    (chat, rewards)
}

/// What a sample hands back to the agent. Items from `history_ptr` on are
/// new to the agent.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct EnvOutput {
    pub status: SampleStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub history: Vec<HistoryItem>,
    #[serde(default)]
    pub history_ptr: usize,
}

/// Final record of a sample.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TaskOutput {
    pub index: SampleIndex,
    pub status: SampleStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub history: Vec<HistoryItem>,
}

/// What a task returns for one sample.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TaskSampleResult {
    pub status: SampleStatus,
    #[serde(default)]
    pub result: Option<Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct WorkerStartSampleRequest {
    #[serde(default = "default_index")]
    pub index: SampleIndex,
    pub session_id: u64,
    #[serde(default)]
    pub custom_task: Option<Value>,
}

const fn default_index() -> SampleIndex {
    CUSTOM_TASK_INDEX
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct InteractRequest {
    pub session_id: u64,
    #[serde(default)]
    pub messages: Vec<Value>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct CancelRequest {
    pub session_id: u64,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct SampleStatusRequest {
    pub session_id: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CalculateOverallRequest {
    pub results: Vec<TaskOutput>,
}

/// Turn result handed to the agent.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EnvResponse {
    pub messages: Vec<Value>,
    pub tools: Value,
    pub status: SampleStatus,
    pub finish: bool,
    pub reward: f64,
    pub metric: Map<String, Value>,
}

impl EnvResponse {
    pub fn from_env_output(output: &EnvOutput, tools: Value) -> Self {
        let unseen = output.history.get(output.history_ptr..).unwrap_or_default();
        let (messages, rewards) = split_history(unseen);
        let last = rewards.last();
        Self {
            messages,
            tools,
            status: output.status,
            finish: output.status != SampleStatus::Running,
            reward: last.map_or(0., |reward| reward.reward),
            metric: last.map(|reward| reward.metrics.clone()).unwrap_or_default(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct InteractResponse {
    pub session_id: u64,
    pub env_out: EnvResponse,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct CancelResponse {
    pub session_id: u64,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct SampleStatusResponse {
    pub session_id: u64,
    pub index: SampleIndex,
    pub status: SampleStatus,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerStatus {
    pub concurrency: usize,
    pub current: usize,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct HeartbeatRequest {
    pub name: String,
    pub address: Option<String>,
    pub concurrency: usize,
    pub indices: Vec<SampleIndex>,
}
