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

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Request, StatusCode, header};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use sandpool_error::{Code, Error, ResultExt, make_err};
use sandpool_util::task::TaskExecutor;
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use crate::typings::HeartbeatRequest;

/// Calls the worker makes to its controller.
#[async_trait]
pub trait ControllerClient: Send + Sync + 'static {
    async fn heartbeat(&self, request: &HeartbeatRequest) -> Result<(), Error>;

    /// Tells the controller a cancelled session has finished.
    async fn cancel_notice(&self, session_id: u64) -> Result<(), Error>;
}

/// [`ControllerClient`] posting JSON over HTTP.
#[derive(Debug, Clone)]
pub struct HttpControllerClient {
    base_address: String,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl HttpControllerClient {
    /// `address` is the controller's API root, e.g. `http://ctrl:5000/api`.
    pub fn new(address: &str) -> Self {
        Self {
            base_address: address.trim_end_matches('/').to_string(),
            client: Client::builder(TaskExecutor::default()).build_http(),
        }
    }

    async fn post<T: Serialize + Sync>(
        &self,
        api: &str,
        body: &T,
        session_id: Option<u64>,
    ) -> Result<(), Error> {
        let uri = format!("{}{api}", self.base_address);
        let payload = serde_json::to_vec(body)?;
        let mut builder = Request::post(&uri).header(header::CONTENT_TYPE, "application/json");
        if let Some(session_id) = session_id {
            builder = builder.header("session_id", session_id.to_string());
        }
        let request = builder
            .body(Full::new(Bytes::from(payload)))
            .map_err(|e| make_err!(Code::InvalidArgument, "Bad controller request {uri}: {e}"))?;

        let response = self
            .client
            .request(request)
            .await
            .err_tip(|| format!("While calling {uri}"))?;
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| make_err!(Code::Unavailable, "Reading response of {uri}: {e}"))?
            .to_bytes();
        if status != StatusCode::OK {
            return Err(make_err!(
                Code::Unavailable,
                "Controller returned {status} for {api}: {}",
                String::from_utf8_lossy(&body)
            ));
        }
        debug!(api, %status, "Controller call succeeded");
        Ok(())
    }
}

#[async_trait]
impl ControllerClient for HttpControllerClient {
    async fn heartbeat(&self, request: &HeartbeatRequest) -> Result<(), Error> {
        self.post("/receive_heartbeat", request, None).await
    }

    async fn cancel_notice(&self, session_id: u64) -> Result<(), Error> {
        self.post(
            "/cancel_notice",
            &json!({ "session_id": session_id }),
            Some(session_id),
        )
        .await
    }
}
