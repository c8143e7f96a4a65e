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

use crate::pool::PoolSpec;
use crate::state::StateSpec;
use crate::task::ShellTaskSpec;
use crate::worker::WorkerSpec;

/// Top level of the JSON5 file passed to the `sandpool` binary.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct SandpoolConfig {
    pub task: ShellTaskSpec,
    pub state: StateSpec,
    pub pool: PoolSpec,
    pub worker: WorkerSpec,
}
