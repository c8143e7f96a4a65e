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

use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use futures::future::join_all;
use parking_lot::Mutex;
use sandpool_error::{Code, Error, make_err};
use sandpool_util::background_spawn;
use sandpool_util::spawn;
use sandpool_util::task::JoinHandleDropGuard;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::controller_client::ControllerClient;
use crate::session::Session;
use crate::task::Task;
use crate::typings::{
    AgentOutput, CUSTOM_TASK_INDEX, CancelResponse, EnvResponse, HeartbeatRequest,
    InteractResponse, SampleIndex, SampleStatus, SampleStatusResponse, TaskOutput,
    WorkerStartSampleRequest, WorkerStatus,
};

const DEFAULT_HEART_RATE: Duration = Duration::from_secs(8);

/// How long a cancelled `full_async` sample may spend tearing down before
/// it is aborted.
const CANCEL_GRACE: Duration = Duration::from_secs(10);

/// A sample running in this process.
#[derive(Debug)]
pub struct RunningSample {
    pub index: SampleIndex,
    pub custom_task: Option<Value>,
    pub session: Arc<Session>,
    cancelling: AtomicBool,
    finished: watch::Receiver<bool>,
}

impl RunningSample {
    pub fn is_cancelling(&self) -> bool {
        self.cancelling.load(Ordering::Acquire)
    }

    /// Resolves once the sample's background unit is done.
    async fn wait_finished(&self) {
        let mut finished = self.finished.clone();
        if let Err(err) = finished.wait_for(|done| *done).await {
            // The unit dropped its sender, so it is gone all the same.
            debug!(session_id = self.session.session_id, ?err, "Sample unit ended without reporting");
        }
    }
}

/// Runs samples of one task on behalf of a controller.
pub struct TaskWorker {
    task: Arc<dyn Task>,
    controller: Option<Arc<dyn ControllerClient>>,
    self_address: Option<String>,
    heart_rate: Duration,
    worker_id: String,
    samples: Mutex<HashMap<u64, Arc<RunningSample>>>,
    notice_tasks: Mutex<Vec<JoinHandleDropGuard<()>>>,
    weak_self: Weak<Self>,
}

impl core::fmt::Debug for TaskWorker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TaskWorker")
            .field("task", &self.task.name())
            .field("worker_id", &self.worker_id)
            .field("self_address", &self.self_address)
            .field("running", &self.samples.lock().len())
            .finish_non_exhaustive()
    }
}

impl TaskWorker {
    pub fn new(
        task: Arc<dyn Task>,
        controller: Option<Arc<dyn ControllerClient>>,
        self_address: Option<String>,
        heart_rate: Duration,
    ) -> Arc<Self> {
        let worker_id = Uuid::new_v4().to_string();
        info!(worker_id, task = task.name(), "Task worker initialized");
        Arc::new_cyclic(|weak_self| Self {
            task,
            controller,
            self_address,
            heart_rate: if heart_rate.is_zero() {
                DEFAULT_HEART_RATE
            } else {
                heart_rate
            },
            worker_id,
            samples: Mutex::new(HashMap::new()),
            notice_tasks: Mutex::new(Vec::new()),
            weak_self: weak_self.clone(),
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn task(&self) -> &Arc<dyn Task> {
        &self.task
    }

    fn running(&self, session_id: u64) -> Result<Arc<RunningSample>, Error> {
        self.samples
            .lock()
            .get(&session_id)
            .cloned()
            .ok_or_else(|| make_err!(Code::NotFound, "No such session"))
    }

    fn response_tools(&self, session: &Session) -> Value {
        session.tools().unwrap_or_else(|| self.task.tools())
    }

    /// Launches a sample in the background and returns the first turn.
    pub async fn start_sample(&self, request: WorkerStartSampleRequest) -> Result<EnvResponse, Error> {
        let session_id = request.session_id;
        let session = Arc::new(Session::new(session_id));
        let custom_task = if request.index == CUSTOM_TASK_INDEX {
            Some(request.custom_task.unwrap_or(Value::Null))
        } else {
            None
        };
        let worker = self
            .weak_self
            .upgrade()
            .ok_or_else(|| make_err!(Code::Internal, "Task worker is shutting down"))?;
        {
            let mut samples = self.samples.lock();
            if samples.contains_key(&session_id) {
                return Err(make_err!(Code::AlreadyExists, "Session ID already exists"));
            }
            let concurrency = self.task.concurrency();
            if samples.len() >= concurrency {
                return Err(make_err!(
                    Code::ResourceExhausted,
                    "Sample concurrency limit reached: {concurrency}"
                ));
            }
            let (finished_tx, finished) = watch::channel(false);
            let running = Arc::new(RunningSample {
                index: request.index,
                custom_task,
                session: session.clone(),
                cancelling: AtomicBool::new(false),
                finished,
            });
            samples.insert(session_id, running.clone());
            // Detached: the unit removes itself from the registry and
            // signals `finished` when done.
            background_spawn!(
                "run_sample",
                worker.run_sample(running, finished_tx),
                session_id
            );
        }
        info!(session_id, index = request.index, "Started sample");

        let env_output = session.controller.agent_pull(None).await?;
        debug!(session_id, status = ?env_output.status, "First turn pulled");
        Ok(EnvResponse::from_env_output(&env_output, self.response_tools(&session)))
    }

    /// Background unit of one sample. The task itself runs in its own tokio
    /// task so that a panic is reported like an error.
    async fn run_sample(self: Arc<Self>, running: Arc<RunningSample>, finished: watch::Sender<bool>) {
        let session_id = running.session.session_id;
        let task = self.task.clone();
        let session = running.session.clone();
        let index = running.index;
        let custom_task = running.custom_task.clone();
        let mut unit = background_spawn!(
            "task_sample",
            async move {
                match custom_task {
                    Some(custom_task) => task.start_sample_custom(custom_task, session).await,
                    None => task.start_sample(index, session).await,
                }
            },
            session_id
        );

        let (status, result) = tokio::select! {
            joined = &mut unit => match joined {
                Ok(Ok(output)) => (output.status, output.result),
                Ok(Err(err)) if running.is_cancelling() => {
                    debug!(session_id, ?err, "Sample failed while cancelling");
                    (SampleStatus::Cancelled, None)
                }
                Ok(Err(err)) => {
                    error!(session_id, ?err, "Task execution failed");
                    (SampleStatus::TaskError, Some(Value::String(err.message_string())))
                }
                Err(join_err) if join_err.is_cancelled() => (SampleStatus::Cancelled, None),
                Err(join_err) => {
                    error!(session_id, ?join_err, "Task execution panicked");
                    (SampleStatus::TaskError, Some(Value::String(join_err.to_string())))
                }
            },
            () = running.session.cancel_token().cancelled() => {
                if tokio::time::timeout(CANCEL_GRACE, &mut unit).await.is_err() {
                    warn!(session_id, grace = ?CANCEL_GRACE, "Sample ignored cancellation, aborting it");
                    unit.abort();
                }
                info!(session_id, "Task execution cancelled");
                (SampleStatus::Cancelled, None)
            }
        };

        {
            let mut samples = self.samples.lock();
            if samples
                .get(&session_id)
                .is_some_and(|current| Arc::ptr_eq(current, &running))
            {
                samples.remove(&session_id);
            }
        }
        running.session.controller.env_finish(&TaskOutput {
            index,
            status,
            result,
            history: running.session.controller.history(),
        });
        info!(session_id, ?status, "Sample finished");
        finished.send_replace(true);
    }

    /// Feeds the agent's messages to the sample and returns the next turn.
    pub async fn interact(&self, session_id: u64, messages: Vec<Value>) -> Result<InteractResponse, Error> {
        let running = self.running(session_id)?;
        if running.is_cancelling() || running.session.controller.is_busy() {
            return Err(make_err!(
                Code::FailedPrecondition,
                "Task Executing, please do not send new request."
            ));
        }
        let env_output = running
            .session
            .controller
            .agent_pull(Some(AgentOutput::normal(messages)))
            .await?;
        if env_output.status == SampleStatus::Completed {
            info!(session_id, result = ?env_output.result, "Interaction completed");
        }
        Ok(InteractResponse {
            session_id,
            env_out: EnvResponse::from_env_output(&env_output, self.response_tools(&running.session)),
        })
    }

    /// Cancels a sample and waits until it is gone.
    pub async fn cancel(&self, session_id: u64) -> Result<CancelResponse, Error> {
        let running = self.begin_cancel(session_id)?;
        self.finish_cancel(running, false).await;
        Ok(CancelResponse { session_id })
    }

    /// Cancels a sample and returns at once. The controller is notified
    /// once the sample is gone.
    pub async fn cancel_with_notice(&self, session_id: u64) -> Result<CancelResponse, Error> {
        let running = self.begin_cancel(session_id)?;
        let worker = self
            .weak_self
            .upgrade()
            .ok_or_else(|| make_err!(Code::Internal, "Task worker is shutting down"))?;
        let task = spawn!(
            "cancel_with_notice",
            async move { worker.finish_cancel(running, true).await },
            session_id
        );
        let mut notice_tasks = self.notice_tasks.lock();
        notice_tasks.retain(|task| !task.is_finished());
        notice_tasks.push(task);
        Ok(CancelResponse { session_id })
    }

    fn begin_cancel(&self, session_id: u64) -> Result<Arc<RunningSample>, Error> {
        let running = self.running(session_id)?;
        info!(session_id, "Cancelling sample");
        running.cancelling.store(true, Ordering::Release);
        if let Err(err) = running.session.controller.inject(AgentOutput::cancelled()) {
            debug!(session_id, ?err, "Sample no longer reads agent output");
        }
        Ok(running)
    }

    async fn finish_cancel(&self, running: Arc<RunningSample>, with_notice: bool) {
        let session_id = running.session.session_id;
        if self.task.full_async() {
            running.session.cancel_token().cancel();
        }
        running.wait_finished().await;
        {
            let mut samples = self.samples.lock();
            if samples
                .get(&session_id)
                .is_some_and(|current| Arc::ptr_eq(current, &running))
            {
                samples.remove(&session_id);
            }
        }
        if with_notice {
            if let Some(controller) = &self.controller {
                if let Err(err) = controller.cancel_notice(session_id).await {
                    warn!(session_id, ?err, "Failed to send cancel notice");
                }
            }
        }
    }

    pub async fn cancel_all(&self) {
        let session_ids: Vec<u64> = self.samples.lock().keys().copied().collect();
        join_all(session_ids.into_iter().map(|session_id| async move {
            if let Err(err) = self.cancel(session_id).await {
                debug!(session_id, ?err, "Sample ended before it was cancelled");
            }
        }))
        .await;
    }

    pub async fn cancel_all_with_notice(&self) {
        let session_ids: Vec<u64> = self.samples.lock().keys().copied().collect();
        join_all(session_ids.into_iter().map(|session_id| async move {
            if let Err(err) = self.cancel_with_notice(session_id).await {
                debug!(session_id, ?err, "Sample ended before it was cancelled");
            }
        }))
        .await;
    }

    pub fn sample_status(&self, session_id: u64) -> Result<SampleStatusResponse, Error> {
        let running = self.running(session_id)?;
        Ok(SampleStatusResponse {
            session_id,
            index: running.index,
            status: running.session.controller.get_status(),
        })
    }

    pub fn get_sessions(&self) -> HashMap<u64, SampleIndex> {
        self.samples
            .lock()
            .iter()
            .map(|(session_id, running)| (*session_id, running.index))
            .collect()
    }

    pub fn get_indices(&self) -> Vec<SampleIndex> {
        self.task.get_indices()
    }

    pub fn worker_status(&self) -> WorkerStatus {
        WorkerStatus {
            concurrency: self.task.concurrency(),
            current: self.samples.lock().len(),
        }
    }

    pub fn calculate_overall(&self, results: &[TaskOutput]) -> Value {
        self.task.calculate_overall(results)
    }

    /// Reports to the controller every heart rate. Never returns.
    pub async fn heart_beat(&self) {
        let Some(controller) = &self.controller else {
            debug!("No controller configured, not sending heartbeats");
            return;
        };
        loop {
            let request = HeartbeatRequest {
                name: self.task.name().to_string(),
                address: self.self_address.clone(),
                concurrency: self.task.concurrency(),
                indices: self.task.get_indices(),
            };
            if let Err(err) = controller.heartbeat(&request).await {
                error!(?err, "Heartbeat failed");
            }
            tokio::time::sleep(self.heart_rate).await;
        }
    }

    /// Cancels what is still running and lets the task clean up.
    pub async fn shutdown(&self) {
        self.cancel_all().await;
        self.task.release().await;
    }
}
