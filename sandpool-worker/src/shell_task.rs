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

use core::time::Duration;
use std::sync::Arc;

use async_trait::async_trait;
use sandpool_config::task::{ShellSampleSpec, ShellTaskSpec};
use sandpool_error::{Code, Error, ResultExt, make_err, make_input_err};
use sandpool_pool::{EnvironmentPool, SessionAllocation};
use sandpool_util::{background_spawn, spawn};
use sandpool_util::task::JoinHandleDropGuard;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::session::Session;
use crate::task::Task;
use crate::typings::{
    AgentOutputStatus, HistoryItem, RewardHistoryItem, SampleIndex, SampleStatus,
    TaskSampleResult,
};

const DEFAULT_COMMAND_TIMEOUT_S: u64 = 30;
const DEFAULT_SESSION_RENEW_INTERVAL_S: u64 = 60;

fn default_tools() -> Value {
    json!([
        {
            "type": "function",
            "function": {
                "name": "bash",
                "description": "Run a command in the sandbox shell and return its output.",
                "parameters": {
                    "type": "object",
                    "properties": {"command": {"type": "string"}},
                    "required": ["command"],
                },
            },
        },
        {
            "type": "function",
            "function": {
                "name": "submit",
                "description": "Finish the task.",
                "parameters": {"type": "object", "properties": {}},
            },
        },
    ])
}

/// A tool call the agent made.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Action {
    Bash {
        call_id: Option<String>,
        command: String,
    },
    Submit,
}

/// Why an agent turn could not be acted on.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ActionError {
    /// Not a tool the task knows, or no tool call at all.
    Invalid(String),
    /// A known tool with unusable arguments.
    Malformed(String),
}

impl ActionError {
    fn into_result(self) -> TaskSampleResult {
        let (status, reason) = match self {
            Self::Invalid(reason) => (SampleStatus::AgentInvalidAction, reason),
            Self::Malformed(reason) => (SampleStatus::AgentValidationFailed, reason),
        };
        TaskSampleResult {
            status,
            result: Some(Value::String(reason)),
        }
    }
}

/// Reads the tool calls of the agent's last message. Arguments may be an
/// object or a JSON encoded string.
fn parse_actions(messages: &[Value]) -> Result<Vec<Action>, ActionError> {
    let calls = messages
        .last()
        .and_then(|message| message.get("tool_calls"))
        .and_then(Value::as_array)
        .filter(|calls| !calls.is_empty())
        .ok_or_else(|| ActionError::Invalid("No tool call in agent output".to_string()))?;

    calls
        .iter()
        .map(|call| {
            let call_id = call.get("id").and_then(Value::as_str).map(ToString::to_string);
            let function = call.get("function").unwrap_or(call);
            let name = function.get("name").and_then(Value::as_str).unwrap_or_default();
            match name {
                "submit" => Ok(Action::Submit),
                "bash" => {
                    let arguments = match function.get("arguments") {
                        Some(Value::String(raw)) => serde_json::from_str(raw).map_err(|e| {
                            ActionError::Malformed(format!("Bad bash arguments: {e}"))
                        })?,
                        Some(arguments) => arguments.clone(),
                        None => Value::Null,
                    };
                    let command = arguments
                        .get("command")
                        .and_then(Value::as_str)
                        .ok_or_else(|| {
                            ActionError::Malformed("bash needs a string `command`".to_string())
                        })?;
                    Ok(Action::Bash {
                        call_id,
                        command: command.to_string(),
                    })
                }
                other => Err(ActionError::Invalid(format!("Unknown tool: {other:?}"))),
            }
        })
        .collect()
}

/// Turns raw tty output into what the agent reads: normalized newlines and
/// no trailing prompt.
fn clean_output(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw).replace("\r\n", "\n");
    let text = text.trim_end_matches('\n');
    let body = match text.rsplit_once('\n') {
        Some((body, last)) if last.ends_with("# ") || last.ends_with("$ ") => body,
        None if text.ends_with("# ") || text.ends_with("$ ") => "",
        _ => text,
    };
    body.trim_end().to_string()
}

/// Appends the URLs of the sample's other containers to the prompt.
fn prompt_with_services(prompt: &str, shell_subtype: &str, allocation: &SessionAllocation) -> String {
    let mut services: Vec<_> = allocation
        .urls
        .iter()
        .filter(|(subtype, _)| subtype.as_str() != shell_subtype)
        .collect();
    if services.is_empty() {
        return prompt.to_string();
    }
    services.sort_unstable();
    let listing: Vec<String> = services
        .into_iter()
        .map(|(subtype, url)| format!("- {subtype}: {url}"))
        .collect();
    format!("{prompt}\n\nServices:\n{}", listing.join("\n"))
}

fn tool_message(call_id: Option<String>, content: String) -> HistoryItem {
    let mut message = Map::new();
    message.insert("role".to_string(), json!("tool"));
    if let Some(call_id) = call_id {
        message.insert("tool_call_id".to_string(), json!(call_id));
    }
    message.insert("content".to_string(), json!(content));
    HistoryItem::Chat(Value::Object(message))
}

/// Sandbox task: the agent drives a shell in pooled containers until it
/// submits, and an optional check command scores the result.
async fn end_pool_session(pool: Arc<EnvironmentPool>, pool_session: u64) {
    if let Err(err) = pool.end_session(pool_session).await {
        warn!(pool_session, ?err, "Failed to end session");
    }
}

#[derive(Debug)]
pub struct ShellTask {
    spec: ShellTaskSpec,
    pool: Arc<EnvironmentPool>,
    command_timeout: Duration,
    renew_interval: Duration,
}

impl ShellTask {
    pub fn new(spec: ShellTaskSpec, pool: Arc<EnvironmentPool>) -> Self {
        let command_timeout = Duration::from_secs(if spec.command_timeout_s == 0 {
            DEFAULT_COMMAND_TIMEOUT_S
        } else {
            spec.command_timeout_s
        });
        let renew_interval = Duration::from_secs(if spec.session_renew_interval_s == 0 {
            DEFAULT_SESSION_RENEW_INTERVAL_S
        } else {
            spec.session_renew_interval_s
        });
        Self {
            spec,
            pool,
            command_timeout,
            renew_interval,
        }
    }

    /// Allocates the sample's containers, runs the conversation and always
    /// gives the containers back. Allocation and teardown run in their own
    /// tokio tasks so that aborting this future cannot strand containers.
    async fn run(
        &self,
        sample: &ShellSampleSpec,
        params: Value,
        session: Arc<Session>,
    ) -> Result<TaskSampleResult, Error> {
        let allocation = self
            .allocate(sample, params, &session)
            .await
            .err_tip(|| format!("While allocating containers for session {}", session.session_id))?;
        let pool_session = allocation.session_id;
        info!(
            session_id = session.session_id,
            pool_session,
            containers = ?allocation.containers,
            "Sample containers ready"
        );

        let pool = self.pool.clone();
        let renew_interval = self.renew_interval;
        let keep_alive: JoinHandleDropGuard<()> = spawn!(
            "session_keep_alive",
            async move {
                loop {
                    tokio::time::sleep(renew_interval).await;
                    if let Err(err) = pool.renew_session(pool_session).await {
                        warn!(pool_session, ?err, "Failed to renew session");
                    }
                }
            },
            pool_session
        );

        let result = tokio::select! {
            result = self.converse(sample, &allocation, &session) => result,
            () = session.cancel_token().cancelled() => {
                debug!(session_id = session.session_id, "Conversation cut short");
                Ok(TaskSampleResult {
                    status: SampleStatus::Cancelled,
                    result: None,
                })
            }
        };

        drop(keep_alive);
        let teardown = background_spawn!(
            "end_pool_session",
            end_pool_session(self.pool.clone(), pool_session),
            pool_session
        );
        if let Err(err) = teardown.await {
            warn!(pool_session, ?err, "Session teardown did not finish");
        }
        result
    }

    /// Starts the pool session. A session that comes up after the sample
    /// was cancelled is ended right away.
    async fn allocate(
        &self,
        sample: &ShellSampleSpec,
        params: Value,
        session: &Session,
    ) -> Result<SessionAllocation, Error> {
        let pool = self.pool.clone();
        let subtypes = sample.subtypes.clone();
        let immutable = sample.immutable;
        let cancelled = session.cancel_token().clone();
        background_spawn!(
            "start_pool_session",
            async move {
                let allocation = pool.start_session(&subtypes, immutable, &params).await?;
                if cancelled.is_cancelled() {
                    end_pool_session(pool, allocation.session_id).await;
                    return Err(make_err!(
                        Code::Cancelled,
                        "Sample cancelled while its containers were starting"
                    ));
                }
                Ok(allocation)
            },
            session_id = session.session_id
        )
        .await?
    }

    async fn converse(
        &self,
        sample: &ShellSampleSpec,
        allocation: &SessionAllocation,
        session: &Session,
    ) -> Result<TaskSampleResult, Error> {
        let subtype = sample
            .subtypes
            .first()
            .err_tip_with_code(|_| (Code::InvalidArgument, "Sample has no subtypes"))?;
        let container_id = allocation
            .containers
            .get(subtype)
            .err_tip_with_code(|_| (Code::Internal, format!("No container for {subtype}")))?;

        let mut items = vec![HistoryItem::Chat(json!({
            "role": "user",
            "content": prompt_with_services(&sample.prompt, subtype, allocation),
        }))];
        for round in 0..self.spec.max_rounds() {
            let agent_output = session
                .controller
                .env_pull(core::mem::take(&mut items))
                .await?;
            match agent_output.status {
                AgentOutputStatus::Normal => {}
                AgentOutputStatus::Cancelled => {
                    return Ok(TaskSampleResult {
                        status: SampleStatus::Cancelled,
                        result: None,
                    });
                }
                AgentOutputStatus::AgentContextLimit => {
                    return Ok(TaskSampleResult {
                        status: SampleStatus::AgentContextLimit,
                        result: None,
                    });
                }
            }

            let actions = match parse_actions(&agent_output.messages) {
                Ok(actions) => actions,
                Err(err) => {
                    debug!(session_id = session.session_id, round, ?err, "Unusable agent turn");
                    return Ok(err.into_result());
                }
            };
            for action in actions {
                match action {
                    Action::Bash { call_id, command } => {
                        let output = self.run_bash(container_id, &command).await;
                        items.push(tool_message(call_id, output));
                    }
                    Action::Submit => return self.evaluate(sample, container_id, session).await,
                }
            }
        }
        Ok(TaskSampleResult {
            status: SampleStatus::TaskLimitReached,
            result: None,
        })
    }

    async fn run_bash(&self, container_id: &str, command: &str) -> String {
        match self
            .pool
            .execute_shell(container_id, command, self.command_timeout)
            .await
        {
            Ok(output) => clean_output(&output),
            Err(err) if err.code == Code::DeadlineExceeded => format!(
                "Command timed out after {}s",
                self.command_timeout.as_secs()
            ),
            Err(err) => format!("Error: {}", err.message_string()),
        }
    }

    async fn evaluate(
        &self,
        sample: &ShellSampleSpec,
        container_id: &str,
        session: &Session,
    ) -> Result<TaskSampleResult, Error> {
        let mut metrics = Map::new();
        let reward = match &sample.check_command {
            Some(check) => {
                let output = self
                    .pool
                    .execute_command(
                        container_id,
                        vec!["bash".to_string(), "-c".to_string(), check.clone()],
                        self.command_timeout,
                    )
                    .await
                    .err_tip(|| "While running the check command")?;
                metrics.insert("exit_code".to_string(), json!(output.exit_code));
                if output.exit_code == 0 { 1. } else { 0. }
            }
            None => 0.,
        };
        info!(session_id = session.session_id, reward, "Sample submitted");
        session
            .controller
            .push_history(HistoryItem::Reward(RewardHistoryItem { reward, metrics }));
        Ok(TaskSampleResult {
            status: SampleStatus::Completed,
            result: Some(json!({"reward": reward})),
        })
    }
}

#[async_trait]
impl Task for ShellTask {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn concurrency(&self) -> usize {
        self.spec.concurrency()
    }

    fn full_async(&self) -> bool {
        self.spec.full_async
    }

    fn tools(&self) -> Value {
        self.spec.tools.clone().unwrap_or_else(default_tools)
    }

    fn get_indices(&self) -> Vec<SampleIndex> {
        (0..self.spec.samples.len())
            .filter_map(|index| SampleIndex::try_from(index).ok())
            .collect()
    }

    async fn start_sample(
        &self,
        index: SampleIndex,
        session: Arc<Session>,
    ) -> Result<TaskSampleResult, Error> {
        let sample = usize::try_from(index)
            .ok()
            .and_then(|index| self.spec.samples.get(index))
            .ok_or_else(|| make_input_err!("Sample index {index} out of range"))?;
        self.run(sample, json!({"index": index}), session).await
    }

    async fn start_sample_custom(
        &self,
        custom_task: Value,
        session: Arc<Session>,
    ) -> Result<TaskSampleResult, Error> {
        let sample: ShellSampleSpec =
            serde_json::from_value(custom_task.clone()).err_tip(|| "While reading custom task")?;
        self.run(&sample, custom_task, session).await
    }
}
