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

use std::sync::Arc;

use async_trait::async_trait;
use sandpool_error::{Code, Error, make_err};
use serde_json::{Value, json};

use crate::session::Session;
use crate::typings::{SampleIndex, SampleStatus, TaskOutput, TaskSampleResult};

/// A benchmark the worker runs samples of.
#[async_trait]
pub trait Task: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Samples the worker may run at once.
    fn concurrency(&self) -> usize;

    /// Whether a sample may be aborted at any await point. Otherwise a
    /// cancelled sample is only told through its session and is waited for.
    fn full_async(&self) -> bool {
        false
    }

    /// Tool definitions handed to the agent.
    fn tools(&self) -> Value;

    fn get_indices(&self) -> Vec<SampleIndex>;

    async fn start_sample(
        &self,
        index: SampleIndex,
        session: Arc<Session>,
    ) -> Result<TaskSampleResult, Error>;

    async fn start_sample_custom(
        &self,
        _custom_task: Value,
        _session: Arc<Session>,
    ) -> Result<TaskSampleResult, Error> {
        Err(make_err!(
            Code::Unimplemented,
            "Task {} does not run custom samples",
            self.name()
        ))
    }

    /// Aggregates finished samples. Defaults to counting statuses.
    fn calculate_overall(&self, results: &[TaskOutput]) -> Value {
        let completed = results
            .iter()
            .filter(|output| output.status == SampleStatus::Completed)
            .count();
        json!({
            "total": results.len(),
            "completed": completed,
        })
    }

    /// Called once when the worker shuts down.
    async fn release(&self) {}
}
