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
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use pretty_assertions::assert_eq;
use sandpool_error::{Code, Error, make_err};
use sandpool_macro::sandpool_test;
use sandpool_service::{SESSION_ID_HEADER, router};
use sandpool_worker::typings::{
    AgentOutputStatus, HistoryItem, SampleIndex, SampleStatus, TaskSampleResult,
};
use sandpool_worker::{Session, Task, TaskWorker};
use serde_json::{Value, json};
use tower::ServiceExt;

/// Answers every agent turn with `ok` until told `stop`.
struct ChatTask;

#[async_trait]
impl Task for ChatTask {
    fn name(&self) -> &str {
        "chat"
    }

    fn concurrency(&self) -> usize {
        1
    }

    fn tools(&self) -> Value {
        json!([])
    }

    fn get_indices(&self) -> Vec<SampleIndex> {
        vec![0, 1]
    }

    async fn start_sample(
        &self,
        index: SampleIndex,
        session: Arc<Session>,
    ) -> Result<TaskSampleResult, Error> {
        if index == 1 {
            return Err(make_err!(Code::Internal, "bad sample"));
        }
        let mut items = vec![HistoryItem::Chat(json!({"content": "hello"}))];
        loop {
            let output = session.controller.env_pull(items).await?;
            if output.status == AgentOutputStatus::Cancelled {
                return Ok(TaskSampleResult {
                    status: SampleStatus::Cancelled,
                    result: None,
                });
            }
            if output.messages.iter().any(|message| message["content"] == "stop") {
                return Ok(TaskSampleResult {
                    status: SampleStatus::Completed,
                    result: None,
                });
            }
            items = vec![HistoryItem::Chat(json!({"content": "ok"}))];
        }
    }
}

fn app() -> Router {
    router(TaskWorker::new(
        Arc::new(ChatTask),
        None,
        None,
        Duration::from_secs(8),
    ))
}

async fn call(
    app: &Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> Result<(StatusCode, Option<String>, Value), Box<dyn core::error::Error>> {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(body.map_or_else(Body::empty, |body| Body::from(body.to_string())))?;
    let response = app.clone().oneshot(request).await?;
    let status = response.status();
    let session_header = response
        .headers()
        .get(SESSION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(ToString::to_string);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)?
    };
    Ok((status, session_header, json))
}

#[sandpool_test]
async fn sample_round_trip_over_http() -> Result<(), Box<dyn core::error::Error>> {
    let app = app();

    let (status, header, body) = call(
        &app,
        "POST",
        "/api/start_sample",
        Some(json!({"index": 0, "session_id": 11})),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(header.as_deref(), Some("11"));
    assert_eq!(body["messages"], json!([{"content": "hello"}]));
    assert_eq!(body["finish"], json!(false));

    let (_, _, sessions) = call(&app, "GET", "/api/get_sessions", None).await?;
    assert_eq!(sessions, json!({"11": 0}));

    let (status, _, body) = call(
        &app,
        "POST",
        "/api/sample_status",
        Some(json!({"session_id": 11})),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("running"));

    let (_, _, body) = call(
        &app,
        "POST",
        "/api/interact",
        Some(json!({"session_id": 11, "messages": [{"content": "hi"}]})),
    )
    .await?;
    assert_eq!(body["session_id"], json!(11));
    assert_eq!(body["env_out"]["messages"], json!([{"content": "ok"}]));

    let (_, _, body) = call(
        &app,
        "POST",
        "/api/interact",
        Some(json!({"session_id": 11, "messages": [{"content": "stop"}]})),
    )
    .await?;
    assert_eq!(body["env_out"]["status"], json!("completed"));
    assert_eq!(body["env_out"]["finish"], json!(true));

    let (_, _, status) = call(&app, "GET", "/api/worker_status", None).await?;
    assert_eq!(status, json!({"concurrency": 1, "current": 0}));
    Ok(())
}

#[sandpool_test]
async fn errors_carry_detail_and_status() -> Result<(), Box<dyn core::error::Error>> {
    let app = app();

    let (status, _, body) = call(
        &app,
        "POST",
        "/api/interact",
        Some(json!({"session_id": 5, "messages": []})),
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"detail": "No such session"}));

    call(
        &app,
        "POST",
        "/api/start_sample",
        Some(json!({"index": 0, "session_id": 1})),
    )
    .await?;
    let (status, _, _) = call(
        &app,
        "POST",
        "/api/start_sample",
        Some(json!({"index": 0, "session_id": 1})),
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, body) = call(
        &app,
        "POST",
        "/api/start_sample",
        Some(json!({"index": 0, "session_id": 2})),
    )
    .await?;
    assert_eq!(status, StatusCode::NOT_ACCEPTABLE);
    assert!(body["detail"].as_str().unwrap_or_default().contains("concurrency"));

    let (status, _, body) = call(&app, "POST", "/api/cancel", Some(json!({"session_id": 1}))).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"session_id": 1}));
    Ok(())
}

#[sandpool_test]
async fn task_failure_is_reported_in_band() -> Result<(), Box<dyn core::error::Error>> {
    let app = app();
    let (status, _, body) = call(
        &app,
        "POST",
        "/api/start_sample",
        Some(json!({"index": 1, "session_id": 3})),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("task_error"));

    let (_, _, indices) = call(&app, "GET", "/api/get_indices", None).await?;
    assert_eq!(indices, json!([0, 1]));

    let (_, _, overall) = call(
        &app,
        "POST",
        "/api/calculate_overall",
        Some(json!({"results": [
            {"index": 0, "status": "completed"},
            {"index": 1, "status": "task_error"},
        ]})),
    )
    .await?;
    assert_eq!(overall, json!({"total": 2, "completed": 1}));

    let (status, _, body) = call(&app, "POST", "/api/cancel_all", None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::Null);
    Ok(())
}
