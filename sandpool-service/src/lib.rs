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

//! HTTP surface of a task worker, mounted under `/api`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use sandpool_error::{Code, Error};
use sandpool_worker::TaskWorker;
use sandpool_worker::typings::{
    CalculateOverallRequest, CancelRequest, CancelResponse, InteractRequest, InteractResponse,
    SampleIndex, SampleStatusRequest, SampleStatusResponse, WorkerStartSampleRequest,
    WorkerStatus,
};
use serde_json::{Value, json};
use tracing::{info, warn};

/// Response header carrying the session a sample was started under.
pub const SESSION_ID_HEADER: &str = "session_id";

pub const API_PREFIX: &str = "/api";

/// HTTP status an error is reported with.
pub const fn status_for(code: Code) -> StatusCode {
    match code {
        Code::NotFound | Code::AlreadyExists | Code::FailedPrecondition | Code::InvalidArgument => {
            StatusCode::BAD_REQUEST
        }
        Code::ResourceExhausted => StatusCode::NOT_ACCEPTABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// [`Error`] rendered as `{"detail": <message>}`.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(self.0.code);
        if status.is_server_error() {
            warn!(err = ?self.0, "Request failed");
        }
        (status, Json(json!({"detail": self.0.message_string()}))).into_response()
    }
}

type WorkerState = State<Arc<TaskWorker>>;

async fn get_indices(State(worker): WorkerState) -> Json<Vec<SampleIndex>> {
    Json(worker.get_indices())
}

async fn get_sessions(State(worker): WorkerState) -> Json<HashMap<u64, SampleIndex>> {
    Json(worker.get_sessions())
}

async fn worker_status(State(worker): WorkerState) -> Json<WorkerStatus> {
    Json(worker.worker_status())
}

async fn sample_status(
    State(worker): WorkerState,
    Json(request): Json<SampleStatusRequest>,
) -> Result<Json<SampleStatusResponse>, ApiError> {
    Ok(Json(worker.sample_status(request.session_id)?))
}

async fn start_sample(
    State(worker): WorkerState,
    Json(request): Json<WorkerStartSampleRequest>,
) -> Result<Response, ApiError> {
    let session_id = request.session_id;
    info!(session_id, index = request.index, "Start sample request");
    let env_response = worker.start_sample(request).await?;
    let mut response = Json(env_response).into_response();
    response.headers_mut().insert(
        HeaderName::from_static(SESSION_ID_HEADER),
        HeaderValue::from(session_id),
    );
    Ok(response)
}

async fn interact(
    State(worker): WorkerState,
    Json(request): Json<InteractRequest>,
) -> Result<Json<InteractResponse>, ApiError> {
    Ok(Json(worker.interact(request.session_id, request.messages).await?))
}

async fn cancel(
    State(worker): WorkerState,
    Json(request): Json<CancelRequest>,
) -> Result<Json<CancelResponse>, ApiError> {
    Ok(Json(worker.cancel(request.session_id).await?))
}

async fn cancel_with_notice(
    State(worker): WorkerState,
    Json(request): Json<CancelRequest>,
) -> Result<Json<CancelResponse>, ApiError> {
    Ok(Json(worker.cancel_with_notice(request.session_id).await?))
}

async fn cancel_all(State(worker): WorkerState) -> Json<Value> {
    worker.cancel_all().await;
    Json(Value::Null)
}

async fn cancel_all_with_notice(State(worker): WorkerState) -> Json<Value> {
    worker.cancel_all_with_notice().await;
    Json(Value::Null)
}

async fn calculate_overall(
    State(worker): WorkerState,
    Json(request): Json<CalculateOverallRequest>,
) -> Json<Value> {
    Json(worker.calculate_overall(&request.results))
}

/// Routes of `worker` under [`API_PREFIX`].
pub fn router(worker: Arc<TaskWorker>) -> Router {
    let api = Router::new()
        .route("/get_indices", get(get_indices))
        .route("/get_sessions", get(get_sessions))
        .route("/worker_status", get(worker_status))
        .route("/sample_status", post(sample_status))
        .route("/start_sample", post(start_sample))
        .route("/interact", post(interact))
        .route("/cancel", post(cancel))
        .route("/cancel_with_notice", post(cancel_with_notice))
        .route("/cancel_all", post(cancel_all))
        .route("/cancel_all_with_notice", post(cancel_all_with_notice))
        .route("/calculate_overall", post(calculate_overall))
        .with_state(worker);
    Router::new().nest(API_PREFIX, api)
}
