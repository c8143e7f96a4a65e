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

pub mod controller_client;
pub mod session;
pub mod shell_task;
pub mod task;
pub mod typings;
pub mod worker;

pub use controller_client::{ControllerClient, HttpControllerClient};
pub use session::{Session, SessionController};
pub use shell_task::ShellTask;
pub use task::Task;
pub use worker::{RunningSample, TaskWorker};
