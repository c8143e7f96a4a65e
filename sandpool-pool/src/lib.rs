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

pub mod docker_engine;
pub mod engine;
pub mod labels;
pub mod pool;
pub mod shell;

pub use docker_engine::DockerEngine;
pub use engine::{ContainerEngine, ContainerInfo, ContainerSpec, ExecOutput, ShellStream};
pub use pool::{ContainerHooks, EnvironmentPool, SessionAllocation};
pub use shell::{InteractiveShell, PromptShell};
