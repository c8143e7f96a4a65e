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
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use sandpool_error::{Code, Error, make_err};
use sandpool_macro::sandpool_test;
use sandpool_worker::typings::{
    AgentOutputStatus, CUSTOM_TASK_INDEX, HeartbeatRequest, HistoryItem, SampleIndex,
    SampleStatus, TaskOutput, TaskSampleResult, WorkerStartSampleRequest,
};
use sandpool_worker::{ControllerClient, Session, Task, TaskWorker};
use serde_json::{Value, json};
use tokio::sync::Notify;

const ECHO: SampleIndex = 0;
const FAILING: SampleIndex = 1;
const PANICKING: SampleIndex = 2;
const STUCK: SampleIndex = 3;
const SLOW: SampleIndex = 4;

/// Task whose behaviour depends on the sample index.
struct ScriptTask {
    full_async: bool,
}

fn user(content: &str) -> Value {
    json!({"role": "user", "content": content})
}

fn last_content(messages: &[Value]) -> String {
    messages
        .last()
        .and_then(|message| message["content"].as_str())
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl Task for ScriptTask {
    fn name(&self) -> &str {
        "script"
    }

    fn concurrency(&self) -> usize {
        2
    }

    fn full_async(&self) -> bool {
        self.full_async
    }

    fn tools(&self) -> Value {
        json!([{"name": "echo"}])
    }

    fn get_indices(&self) -> Vec<SampleIndex> {
        vec![ECHO, FAILING, PANICKING, STUCK, SLOW]
    }

    async fn start_sample(
        &self,
        index: SampleIndex,
        session: Arc<Session>,
    ) -> Result<TaskSampleResult, Error> {
        match index {
            FAILING => return Err(make_err!(Code::Internal, "boom")),
            PANICKING => panic!("sample panicked"),
            _ => {}
        }
        let mut items = vec![HistoryItem::Chat(user("start"))];
        let mut rounds = 0;
        loop {
            let output = session.controller.env_pull(items).await?;
            if index == STUCK {
                core::future::pending::<()>().await;
            }
            if output.status == AgentOutputStatus::Cancelled {
                return Ok(TaskSampleResult {
                    status: SampleStatus::Cancelled,
                    result: None,
                });
            }
            if index == SLOW {
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
            rounds += 1;
            let content = last_content(&output.messages);
            if content == "done" {
                return Ok(TaskSampleResult {
                    status: SampleStatus::Completed,
                    result: Some(json!({"rounds": rounds})),
                });
            }
            items = vec![HistoryItem::Chat(user(&format!("echo: {content}")))];
        }
    }
}

#[derive(Default)]
struct MockController {
    heartbeats: Mutex<Vec<HeartbeatRequest>>,
    notices: Mutex<Vec<u64>>,
    notified: Notify,
}

#[async_trait]
impl ControllerClient for MockController {
    async fn heartbeat(&self, request: &HeartbeatRequest) -> Result<(), Error> {
        self.heartbeats.lock().push(request.clone());
        Ok(())
    }

    async fn cancel_notice(&self, session_id: u64) -> Result<(), Error> {
        self.notices.lock().push(session_id);
        self.notified.notify_one();
        Ok(())
    }
}

fn worker(full_async: bool) -> (Arc<TaskWorker>, Arc<MockController>) {
    let controller = Arc::new(MockController::default());
    let client: Arc<dyn ControllerClient> = controller.clone();
    let worker = TaskWorker::new(
        Arc::new(ScriptTask { full_async }),
        Some(client),
        Some("http://worker:5001/api".to_string()),
        Duration::from_secs(8),
    );
    (worker, controller)
}

const fn start(index: SampleIndex, session_id: u64) -> WorkerStartSampleRequest {
    WorkerStartSampleRequest {
        index,
        session_id,
        custom_task: None,
    }
}

#[sandpool_test]
async fn sample_runs_until_the_task_completes() -> Result<(), Error> {
    let (worker, _) = worker(false);

    let first = worker.start_sample(start(ECHO, 7)).await?;
    assert_eq!(first.messages, vec![user("start")]);
    assert_eq!(first.status, SampleStatus::Running);
    assert!(!first.finish);
    assert_eq!(first.tools, json!([{"name": "echo"}]));
    assert_eq!(worker.get_sessions().get(&7), Some(&ECHO));
    assert_eq!(worker.sample_status(7)?.status, SampleStatus::Running);

    let turn = worker.interact(7, vec![user("hi")]).await?;
    assert_eq!(turn.session_id, 7);
    assert_eq!(turn.env_out.messages, vec![user("echo: hi")]);

    let last = worker.interact(7, vec![user("done")]).await?;
    assert!(last.env_out.finish);
    assert_eq!(last.env_out.status, SampleStatus::Completed);
    assert!(worker.get_sessions().is_empty());
    assert_eq!(worker.sample_status(7).unwrap_err().code, Code::NotFound);
    Ok(())
}

#[sandpool_test]
async fn start_rejects_duplicates_and_overload() -> Result<(), Error> {
    let (worker, _) = worker(false);
    worker.start_sample(start(ECHO, 1)).await?;

    let duplicate = worker.start_sample(start(ECHO, 1)).await.unwrap_err();
    assert_eq!(duplicate.code, Code::AlreadyExists);

    worker.start_sample(start(ECHO, 2)).await?;
    let overload = worker.start_sample(start(ECHO, 3)).await.unwrap_err();
    assert_eq!(overload.code, Code::ResourceExhausted);
    assert_eq!(worker.worker_status().current, 2);
    assert_eq!(worker.worker_status().concurrency, 2);
    Ok(())
}

#[sandpool_test]
async fn failing_and_panicking_samples_end_in_task_error() -> Result<(), Error> {
    let (worker, _) = worker(false);

    let failed = worker.start_sample(start(FAILING, 1)).await?;
    assert_eq!(failed.status, SampleStatus::TaskError);
    assert!(failed.finish);

    let panicked = worker.start_sample(start(PANICKING, 2)).await?;
    assert_eq!(panicked.status, SampleStatus::TaskError);

    let custom = worker
        .start_sample(WorkerStartSampleRequest {
            index: CUSTOM_TASK_INDEX,
            session_id: 3,
            custom_task: Some(json!({"q": 1})),
        })
        .await?;
    assert_eq!(custom.status, SampleStatus::TaskError);
    assert!(worker.get_sessions().is_empty());
    Ok(())
}

#[sandpool_test(start_paused = true)]
async fn concurrent_interaction_is_rejected() -> Result<(), Error> {
    let (worker, _) = worker(false);
    worker.start_sample(start(SLOW, 1)).await?;

    let background = worker.clone();
    let in_flight = tokio::spawn(async move { background.interact(1, vec![user("hi")]).await });
    tokio::time::sleep(Duration::from_millis(1)).await;

    let rejected = worker.interact(1, vec![user("again")]).await.unwrap_err();
    assert_eq!(rejected.code, Code::FailedPrecondition);

    let turn = in_flight.await.unwrap()?;
    assert_eq!(turn.env_out.messages, vec![user("echo: hi")]);
    Ok(())
}

#[sandpool_test]
async fn cancel_waits_for_the_sample() -> Result<(), Error> {
    let (worker, _) = worker(false);
    worker.start_sample(start(ECHO, 1)).await?;

    assert_eq!(worker.cancel(1).await?.session_id, 1);
    assert!(worker.get_sessions().is_empty());
    assert_eq!(worker.cancel(1).await.unwrap_err().code, Code::NotFound);
    assert_eq!(worker.interact(1, vec![]).await.unwrap_err().code, Code::NotFound);
    Ok(())
}

#[sandpool_test(start_paused = true)]
async fn full_async_cancel_aborts_stuck_samples_after_grace() -> Result<(), Error> {
    let (worker, _) = worker(true);
    // The sample ignores the injected cancellation and only stops when
    // aborted.
    worker.start_sample(start(STUCK, 1)).await?;

    let started = tokio::time::Instant::now();
    tokio::time::timeout(Duration::from_secs(60), worker.cancel(1))
        .await
        .map_err(|_| make_err!(Code::DeadlineExceeded, "cancel hung"))??;
    assert!(started.elapsed() >= Duration::from_secs(10));
    assert!(worker.get_sessions().is_empty());
    Ok(())
}

#[sandpool_test(start_paused = true)]
async fn full_async_cancel_lets_cooperative_samples_finish() -> Result<(), Error> {
    let (worker, _) = worker(true);
    worker.start_sample(start(ECHO, 2)).await?;

    let started = tokio::time::Instant::now();
    worker.cancel(2).await?;
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(worker.get_sessions().is_empty());
    Ok(())
}

#[sandpool_test]
async fn cancel_with_notice_reports_to_the_controller() -> Result<(), Error> {
    let (worker, controller) = worker(false);
    worker.start_sample(start(ECHO, 4)).await?;
    worker.start_sample(start(ECHO, 5)).await?;

    worker.cancel_with_notice(4).await?;
    tokio::time::timeout(Duration::from_secs(5), controller.notified.notified())
        .await
        .map_err(|_| make_err!(Code::DeadlineExceeded, "no notice"))?;
    assert_eq!(*controller.notices.lock(), vec![4]);

    worker.cancel_all().await;
    assert!(worker.get_sessions().is_empty());
    assert_eq!(*controller.notices.lock(), vec![4]);
    Ok(())
}

#[sandpool_test]
async fn cancel_all_with_notice_reports_every_session() -> Result<(), Error> {
    let (worker, controller) = worker(false);
    worker.start_sample(start(ECHO, 8)).await?;
    worker.start_sample(start(ECHO, 9)).await?;

    worker.cancel_all_with_notice().await;
    while controller.notices.lock().len() < 2 {
        tokio::time::timeout(Duration::from_secs(5), controller.notified.notified())
            .await
            .map_err(|_| make_err!(Code::DeadlineExceeded, "missing notice"))?;
    }

    let mut notices = controller.notices.lock().clone();
    notices.sort_unstable();
    assert_eq!(notices, vec![8, 9]);
    assert!(worker.get_sessions().is_empty());
    Ok(())
}

#[sandpool_test(start_paused = true)]
async fn heart_beat_reports_every_heart_rate() -> Result<(), Error> {
    let (worker, controller) = worker(false);
    let beating = worker.clone();
    let heart = tokio::spawn(async move { beating.heart_beat().await });

    tokio::time::sleep(Duration::from_secs(20)).await;
    heart.abort();

    let heartbeats = controller.heartbeats.lock().clone();
    assert_eq!(heartbeats.len(), 3);
    assert_eq!(
        heartbeats[0],
        HeartbeatRequest {
            name: "script".to_string(),
            address: Some("http://worker:5001/api".to_string()),
            concurrency: 2,
            indices: vec![ECHO, FAILING, PANICKING, STUCK, SLOW],
        }
    );
    Ok(())
}

#[sandpool_test]
async fn read_only_operations_pass_through() -> Result<(), Error> {
    let (worker, _) = worker(false);
    assert_eq!(worker.get_indices(), vec![ECHO, FAILING, PANICKING, STUCK, SLOW]);
    assert_eq!(worker.worker_status().current, 0);

    let results = vec![
        TaskOutput {
            index: ECHO,
            status: SampleStatus::Completed,
            result: None,
            history: vec![],
        },
        TaskOutput {
            index: FAILING,
            status: SampleStatus::TaskError,
            result: None,
            history: vec![],
        },
    ];
    assert_eq!(
        worker.calculate_overall(&results),
        json!({"total": 2, "completed": 1})
    );
    Ok(())
}
