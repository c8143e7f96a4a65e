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

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::{API_DEFAULT_VERSION, Docker};
use bytes::BytesMut;
use futures::{StreamExt, TryStreamExt};
use sandpool_config::pool::DockerSpec;
use sandpool_error::{Code, Error, ResultExt, make_err};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::engine::{ContainerEngine, ContainerInfo, ContainerSpec, ExecOutput, ShellStream};
use crate::labels::{ContainerFilter, ContainerStatus, HealthState};

/// Default request timeout towards the engine.
const DEFAULT_TIMEOUT_S: u64 = 120;

/// Maps engine failures onto error codes the pool can act on.
pub fn from_docker_err(err: DockerError) -> Error {
    let code = match &err {
        DockerError::DockerResponseServerError { status_code, .. } => match status_code {
            400 => Code::InvalidArgument,
            401 | 403 => Code::PermissionDenied,
            404 => Code::NotFound,
            409 => Code::AlreadyExists,
            500 | 502 | 503 | 504 | 900 => Code::Unavailable,
            _ => Code::Internal,
        },
        DockerError::RequestTimeoutError => Code::DeadlineExceeded,
        DockerError::IOError { .. }
        | DockerError::HyperResponseError { .. }
        | DockerError::HyperLegacyError { .. }
        | DockerError::DockerStreamError { .. } => Code::Unavailable,
        _ => Code::Internal,
    };
    make_err!(code, "Docker Error: {err}")
}

/// Splits `repo[:tag]` so pulls never fall back to fetching every tag.
fn split_image_reference(image: &str) -> (&str, &str) {
    if image.contains('@') {
        return (image, "");
    }
    match image.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, tag),
        _ => (image, "latest"),
    }
}

/// [`ContainerEngine`] talking to the Docker Engine API.
#[derive(Debug)]
pub struct DockerEngine {
    spec: DockerSpec,
    /// Cached connection, created on first use and dropped on reconnect.
    client: RwLock<Option<Docker>>,
}

impl DockerEngine {
    pub fn new(spec: DockerSpec) -> Self {
        Self {
            spec,
            client: RwLock::new(None),
        }
    }

    fn connect(&self) -> Result<Docker, Error> {
        let timeout = if self.spec.timeout_s == 0 {
            DEFAULT_TIMEOUT_S
        } else {
            self.spec.timeout_s
        };
        let docker = match self.spec.host.as_deref() {
            None => Docker::connect_with_local_defaults(),
            Some(host) if host.starts_with("unix://") => {
                Docker::connect_with_unix(host, timeout, API_DEFAULT_VERSION)
            }
            Some(host) if host.starts_with("https://") || self.spec.tls.is_some() => {
                let tls = self
                    .spec
                    .tls
                    .as_ref()
                    .err_tip_with_code(|_| (Code::InvalidArgument, "https docker hosts need tls files"))?;
                Docker::connect_with_ssl(
                    host,
                    Path::new(&tls.key_file),
                    Path::new(&tls.cert_file),
                    Path::new(&tls.ca_file),
                    timeout,
                    API_DEFAULT_VERSION,
                )
            }
            Some(host) => Docker::connect_with_http(host, timeout, API_DEFAULT_VERSION),
        };
        docker.map_err(from_docker_err)
    }

    async fn docker(&self) -> Result<Docker, Error> {
        {
            let guard = self.client.read().await;
            if let Some(docker) = &*guard {
                return Ok(docker.clone());
            }
        }
        let mut guard = self.client.write().await;
        if let Some(docker) = &*guard {
            return Ok(docker.clone());
        }
        let docker = self.connect().err_tip(|| "While connecting to docker")?;
        debug!(host = ?self.spec.host, "Connected to docker");
        *guard = Some(docker.clone());
        Ok(docker)
    }
}

fn networks_of(
    networks: Option<HashMap<String, bollard::models::EndpointSettings>>,
) -> HashMap<String, String> {
    networks
        .unwrap_or_default()
        .into_iter()
        .map(|(name, endpoint)| (name, endpoint.ip_address.unwrap_or_default()))
        .collect()
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, Error> {
        let docker = self.docker().await?;
        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env_list()),
            labels: Some(spec.labels.to_map()),
            cmd: spec.cmd.clone(),
            host_config: Some(HostConfig {
                auto_remove: Some(spec.auto_remove),
                init: Some(spec.init),
                network_mode: Some(spec.network.clone()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };
        let response = docker
            .create_container(Some(options), config)
            .await
            .map_err(from_docker_err)?;
        Ok(response.id)
    }

    async fn start_container(&self, container_id: &str) -> Result<(), Error> {
        self.docker()
            .await?
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(from_docker_err)
    }

    async fn inspect_container(&self, container_id: &str) -> Result<ContainerInfo, Error> {
        let response = self
            .docker()
            .await?
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(from_docker_err)?;
        let state = response.state.unwrap_or_default();
        let status = state
            .status
            .and_then(|status| status.to_string().parse::<ContainerStatus>().ok())
            .unwrap_or(ContainerStatus::Created);
        let health = state
            .health
            .and_then(|health| health.status)
            .and_then(|health| health.to_string().parse::<HealthState>().ok())
            .unwrap_or(HealthState::None);
        let config = response.config.unwrap_or_default();
        Ok(ContainerInfo {
            id: response.id.unwrap_or_else(|| container_id.to_string()),
            name: response
                .name
                .map(|name| name.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            labels: config.labels.unwrap_or_default(),
            status,
            health,
            networks: networks_of(response.network_settings.and_then(|settings| settings.networks)),
            env: config.env.unwrap_or_default(),
        })
    }

    async fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerInfo>, Error> {
        let options = ListContainersOptions::<String> {
            all: true,
            filters: filter.to_docker_filters(),
            ..Default::default()
        };
        let summaries = self
            .docker()
            .await?
            .list_containers(Some(options))
            .await
            .map_err(from_docker_err)?;
        Ok(summaries
            .into_iter()
            .filter_map(|summary| {
                let status = summary
                    .state
                    .as_deref()
                    .and_then(|state| state.parse().ok())
                    .unwrap_or(ContainerStatus::Created);
                Some(ContainerInfo {
                    id: summary.id?,
                    name: summary
                        .names
                        .and_then(|names| names.into_iter().next())
                        .map(|name| name.trim_start_matches('/').to_string())
                        .unwrap_or_default(),
                    labels: summary.labels.unwrap_or_default(),
                    status,
                    health: HealthState::from_status_text(summary.status.as_deref().unwrap_or("")),
                    networks: networks_of(summary.network_settings.and_then(|s| s.networks)),
                    env: Vec::new(),
                })
            })
            .collect())
    }

    async fn remove_container(&self, container_id: &str) -> Result<(), Error> {
        self.docker()
            .await?
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(from_docker_err)
    }

    async fn pull_image(&self, image: &str) -> Result<(), Error> {
        let (repo, tag) = split_image_reference(image);
        info!(image, "Pulling image");
        let options = CreateImageOptions {
            from_image: repo.to_string(),
            tag: tag.to_string(),
            ..Default::default()
        };
        self.docker()
            .await?
            .create_image(Some(options), None, None)
            .map_err(from_docker_err)
            .try_for_each(|_progress| async { Ok(()) })
            .await
            .err_tip(|| format!("While pulling {image}"))
    }

    async fn exec(&self, container_id: &str, cmd: Vec<String>) -> Result<ExecOutput, Error> {
        let docker = self.docker().await?;
        let exec = docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(cmd),
                    ..Default::default()
                },
            )
            .await
            .map_err(from_docker_err)?;

        let mut stdout = BytesMut::new();
        let mut stderr = BytesMut::new();
        match docker
            .start_exec(&exec.id, None)
            .await
            .map_err(from_docker_err)?
        {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(message) = output.next().await {
                    match message.map_err(from_docker_err)? {
                        LogOutput::StdOut { message } | LogOutput::Console { message } => {
                            stdout.extend_from_slice(&message);
                        }
                        LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                        LogOutput::StdIn { .. } => {}
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(make_err!(
                    Code::Internal,
                    "Exec in {container_id} started detached"
                ));
            }
        }

        let inspect = docker
            .inspect_exec(&exec.id)
            .await
            .map_err(from_docker_err)?;
        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(0),
            stdout: stdout.freeze(),
            stderr: stderr.freeze(),
        })
    }

    async fn open_shell(&self, container_id: &str, cmd: Vec<String>) -> Result<ShellStream, Error> {
        let docker = self.docker().await?;
        let exec = docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(true),
                    cmd: Some(cmd),
                    ..Default::default()
                },
            )
            .await
            .map_err(from_docker_err)?;
        match docker
            .start_exec(&exec.id, None)
            .await
            .map_err(from_docker_err)?
        {
            StartExecResults::Attached { output, input } => Ok(ShellStream {
                output: output
                    .map(|message| message.map(LogOutput::into_bytes).map_err(from_docker_err))
                    .boxed(),
                input,
            }),
            StartExecResults::Detached => Err(make_err!(
                Code::Internal,
                "Shell in {container_id} started detached"
            )),
        }
    }

    async fn reconnect(&self) {
        *self.client.write().await = None;
    }
}
