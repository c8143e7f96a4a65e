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

use serde::{Deserialize, Serialize};

use crate::serde_utils::{
    convert_numeric_with_shellexpand, convert_optional_string_with_shellexpand,
    convert_string_with_shellexpand,
};

/// Configuration of the generic shell task served by the worker binary.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ShellTaskSpec {
    /// Task name reported to the controller. Also part of the state store
    /// namespace.
    #[serde(deserialize_with = "convert_string_with_shellexpand")]
    pub name: String,

    /// Maximum number of samples running at once in this worker.
    ///
    /// Default: 1
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub concurrency: usize,

    /// When set, cancelling a sample also aborts its in-flight work instead
    /// of only waiting for the next turn to observe the cancellation.
    #[serde(default)]
    pub full_async: bool,

    /// Maximum number of agent turns before the sample ends with
    /// `task_limit_reached`.
    ///
    /// Default: 20
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub max_rounds: usize,

    /// Timeout for a single `bash` tool call.
    ///
    /// Default: 30
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub command_timeout_s: u64,

    /// Interval at which session TTLs are renewed while a sample runs.
    ///
    /// Default: 60
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub session_renew_interval_s: u64,

    /// Tool schema handed to the agent. When unset the built-in `bash` and
    /// `submit` tools are advertised.
    #[serde(default)]
    pub tools: Option<serde_json::Value>,

    /// Samples addressable by index.
    pub samples: Vec<ShellSampleSpec>,
}

impl ShellTaskSpec {
    pub const fn concurrency(&self) -> usize {
        if self.concurrency == 0 { 1 } else { self.concurrency }
    }

    pub const fn max_rounds(&self) -> usize {
        if self.max_rounds == 0 { 20 } else { self.max_rounds }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ShellSampleSpec {
    /// Subtypes to allocate. `bash` calls run in the first one.
    pub subtypes: Vec<String>,

    /// First user message of the conversation.
    pub prompt: String,

    /// Command run in the first container once the agent submits. Exit code
    /// zero scores 1, anything else 0. Without a check the reward is 0.
    #[serde(default, deserialize_with = "convert_optional_string_with_shellexpand")]
    pub check_command: Option<String>,

    /// Whether the sample leaves its containers untouched, allowing them to
    /// be shared under a reuse budget.
    ///
    /// Default: true
    #[serde(default = "default_immutable")]
    pub immutable: bool,
}

const fn default_immutable() -> bool {
    true
}
