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

use core::pin::Pin;
use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use sandpool_error::Error;
use tokio::io::AsyncWrite;

use crate::labels::{ContainerFilter, ContainerLabels, ContainerStatus, HealthState};

/// Everything needed to create a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: HashMap<String, String>,
    pub labels: ContainerLabels,
    /// Network the container joins. Also its network mode.
    pub network: String,
    pub cmd: Option<Vec<String>>,
    pub auto_remove: bool,
    pub init: bool,
}

impl ContainerSpec {
    /// `KEY=VALUE` pairs sorted by key.
    pub fn env_list(&self) -> Vec<String> {
        let mut env: Vec<String> = self.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        env.sort_unstable();
        env
    }
}

/// Snapshot of a container as seen by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
    pub status: ContainerStatus,
    pub health: HealthState,
    /// Network name to address.
    pub networks: HashMap<String, String>,
    /// Configured `KEY=VALUE` environment. Only filled by inspection.
    pub env: Vec<String>,
}

impl ContainerInfo {
    pub fn typed_labels(&self) -> Option<ContainerLabels> {
        ContainerLabels::from_map(&self.labels)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: Bytes,
    pub stderr: Bytes,
}

/// Bidirectional stream attached to a process with a tty.
pub struct ShellStream {
    pub output: BoxStream<'static, Result<Bytes, Error>>,
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
}

impl core::fmt::Debug for ShellStream {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ShellStream").finish_non_exhaustive()
    }
}

/// The container engine operations the pool relies on.
///
/// Implementations map engine failures onto error codes: a missing image or
/// container is `NotFound`, transport trouble is `Unavailable` and timeouts
/// are `DeadlineExceeded`. The pool retries only the last two.
#[async_trait]
pub trait ContainerEngine: Send + Sync + 'static {
    /// Creates the container and returns its id. Does not start it.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, Error>;

    async fn start_container(&self, container_id: &str) -> Result<(), Error>;

    async fn inspect_container(&self, container_id: &str) -> Result<ContainerInfo, Error>;

    async fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerInfo>, Error>;

    /// Force removes the container and its anonymous volumes.
    async fn remove_container(&self, container_id: &str) -> Result<(), Error>;

    async fn pull_image(&self, image: &str) -> Result<(), Error>;

    /// Runs `cmd` to completion and collects its output.
    async fn exec(&self, container_id: &str, cmd: Vec<String>) -> Result<ExecOutput, Error>;

    /// Starts `cmd` with stdin and a tty attached.
    async fn open_shell(&self, container_id: &str, cmd: Vec<String>) -> Result<ShellStream, Error>;

    /// Drops any cached connection so the next call builds a fresh one.
    async fn reconnect(&self);
}
