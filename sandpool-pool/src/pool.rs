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

use core::future::Future;
use core::time::Duration;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::unfold;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use sandpool_config::pool::{HomepageSpec, PoolSpec, SubtypeSpec};
use sandpool_config::retry::{ErrorCode, Retry};
use sandpool_error::{Code, Error, ResultExt, error_if, make_err};
use sandpool_state::{SessionData, SessionId, StateStore, with_lock};
use sandpool_util::retry::{Retrier, RetryResult};
use sandpool_util::spawn;
use sandpool_util::task::JoinHandleDropGuard;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::{ContainerEngine, ContainerInfo, ContainerSpec, ExecOutput};
use crate::labels::{ContainerFilter, ContainerLabels, ContainerStatus, HealthState};
use crate::shell::{DEFAULT_SHELL, INITIAL_PROMPT_TIMEOUT, InteractiveShell, PromptShell};

const DEFAULT_BACKGROUND_INTERVAL_S: u64 = 10;
const DEFAULT_BACKGROUND_LOCK_TTL_S: u64 = 120;
const DEFAULT_ALLOCATION_LOCK_TTL_S: u64 = 10;
const DEFAULT_HEALTH_POLL_INTERVAL_MS: u64 = 1000;
const DEFAULT_HEALTH_TIMEOUT_S: u64 = 300;
const DEFAULT_MAX_ALLOCATION_ATTEMPTS: usize = 8;
const DEFAULT_IMAGE_PULL_TIMEOUT_S: u64 = 120;

/// Name of the store lock guarding the sweep.
const BACKGROUND_LOCK: &str = "background";

const fn or_default(value: u64, default: u64) -> u64 {
    if value == 0 { default } else { value }
}

const fn default_lock_retry() -> Retry {
    Retry {
        max_retries: 100,
        delay: 0.1,
        jitter: 0.5,
        retry_on_errors: None,
    }
}

fn engine_retry(configured: Option<&Retry>) -> Retry {
    let retry = configured.cloned().unwrap_or(Retry {
        max_retries: 1,
        delay: 0.,
        jitter: 0.,
        retry_on_errors: None,
    });
    Retry {
        retry_on_errors: retry
            .retry_on_errors
            .or_else(|| Some(vec![ErrorCode::Unavailable, ErrorCode::DeadlineExceeded])),
        ..retry
    }
}

fn allocation_lock(subtype: &str) -> String {
    format!("allocation:{subtype}")
}

/// Builds the address a session uses to reach a container.
pub fn format_url(ip: &str, port: Option<u16>) -> String {
    match port {
        None | Some(0) => ip.to_string(),
        Some(80) => format!("http://{ip}"),
        Some(port) => format!("http://{ip}:{port}"),
    }
}

/// Environment variable a subtype's URL is exported under on the homepage.
fn homepage_env_name(homepage: &HomepageSpec, subtype: &str) -> String {
    homepage.url_env.get(subtype).cloned().unwrap_or_else(|| {
        format!("{}_URL", subtype.replace('-', "_").to_uppercase())
    })
}

/// Hooks a deployment can use to shape containers.
#[async_trait]
pub trait ContainerHooks: Send + Sync + 'static {
    /// Edits the container before it is created. `params` are the
    /// arguments the session was started with.
    fn customize(
        &self,
        _subtype: &str,
        _spec: &mut ContainerSpec,
        _params: &Value,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// Called in the background once a new container is healthy.
    async fn post_create(&self, _subtype: &str, _container_id: &str, _url: &str) -> Result<(), Error> {
        Ok(())
    }
}

/// What a session got.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionAllocation {
    pub session_id: SessionId,
    /// Subtype to container id.
    pub containers: HashMap<String, String>,
    /// Subtype to URL.
    pub urls: HashMap<String, String>,
}

/// A container's shell slot. The slot lock is held while the shell is
/// opened or running a command, so each container has at most one shell.
type SharedShell = Arc<tokio::sync::Mutex<Option<Box<dyn InteractiveShell>>>>;

/// Allocates containers to sessions and reclaims them.
pub struct EnvironmentPool {
    task_name: String,
    spec: PoolSpec,
    engine: Arc<dyn ContainerEngine>,
    state: Arc<dyn StateStore>,
    hooks: Option<Arc<dyn ContainerHooks>>,
    /// Persistent shells by container id.
    shells: Mutex<HashMap<String, SharedShell>>,
    engine_retrier: Retrier,
    lock_retry: Retry,
    post_create_tasks: Mutex<Vec<JoinHandleDropGuard<()>>>,
    weak_self: Weak<Self>,
}

impl core::fmt::Debug for EnvironmentPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EnvironmentPool")
            .field("task_name", &self.task_name)
            .field("network_name", &self.spec.network_name)
            .field("subtypes", &self.spec.subtypes.keys().collect::<Vec<_>>())
            .field("shells", &self.shells.lock().len())
            .finish_non_exhaustive()
    }
}

impl EnvironmentPool {
    pub fn new(
        task_name: impl Into<String>,
        spec: PoolSpec,
        engine: Arc<dyn ContainerEngine>,
        state: Arc<dyn StateStore>,
        hooks: Option<Arc<dyn ContainerHooks>>,
    ) -> Result<Arc<Self>, Error> {
        error_if!(spec.network_name.is_empty(), "pool.network_name must be set");
        error_if!(spec.subtypes.is_empty(), "pool.subtypes must not be empty");
        if let Some(homepage) = &spec.homepage {
            error_if!(
                !spec.subtypes.contains_key(&homepage.subtype),
                "Homepage subtype {} is not a configured subtype",
                homepage.subtype
            );
        }
        let engine_retrier = Retrier::from_config(engine_retry(spec.engine_retry.as_ref()));
        let lock_retry = spec.lock_retry.clone().unwrap_or_else(default_lock_retry);
        let task_name = task_name.into();
        Ok(Arc::new_cyclic(|weak_self| Self {
            task_name,
            spec,
            engine,
            state,
            hooks,
            shells: Mutex::new(HashMap::new()),
            engine_retrier,
            lock_retry,
            post_create_tasks: Mutex::new(Vec::new()),
            weak_self: weak_self.clone(),
        }))
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn network_name(&self) -> &str {
        &self.spec.network_name
    }

    pub fn state(&self) -> &Arc<dyn StateStore> {
        &self.state
    }

    fn subtype_spec(&self, subtype: &str) -> Result<&SubtypeSpec, Error> {
        self.spec.subtypes.get(subtype).err_tip_with_code(|_| {
            (
                Code::InvalidArgument,
                format!("Invalid subtype {subtype} for task {}", self.task_name),
            )
        })
    }

    const fn allocation_lock_ttl(&self) -> Duration {
        Duration::from_secs(or_default(
            self.spec.allocation_lock_ttl_s,
            DEFAULT_ALLOCATION_LOCK_TTL_S,
        ))
    }

    const fn max_allocation_attempts(&self) -> usize {
        if self.spec.max_allocation_attempts == 0 {
            DEFAULT_MAX_ALLOCATION_ATTEMPTS
        } else {
            self.spec.max_allocation_attempts
        }
    }

    const fn health_timeout(&self) -> Duration {
        Duration::from_secs(or_default(self.spec.health_timeout_s, DEFAULT_HEALTH_TIMEOUT_S))
    }

    const fn health_poll_interval(&self) -> Duration {
        Duration::from_millis(or_default(
            self.spec.health_poll_interval_ms,
            DEFAULT_HEALTH_POLL_INTERVAL_MS,
        ))
    }

    /// Runs one engine operation. Retryable operations that fail with a
    /// transport error reconnect and run again according to the engine
    /// retry policy.
    async fn engine_call<T, F, Fut>(&self, description: &str, retryable: bool, op: F) -> Result<T, Error>
    where
        T: Send,
        F: Fn(Arc<dyn ContainerEngine>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, Error>> + Send,
    {
        if !retryable {
            return op(self.engine.clone())
                .await
                .err_tip(|| format!("Docker {description}"));
        }
        let op = &op;
        self.engine_retrier
            .retry(unfold(0usize, move |attempt| async move {
                if attempt > 0 {
                    warn!(description, attempt = attempt + 1, "Docker call failed, reconnecting");
                    self.reconnect().await;
                }
                let result = match op(self.engine.clone()).await {
                    Ok(value) => RetryResult::Ok(value),
                    Err(err) => RetryResult::Retry(err.append(format!("Docker {description}"))),
                };
                Some((result, attempt + 1))
            }))
            .await
    }

    /// Drops the engine connection and every open shell.
    async fn reconnect(&self) {
        self.engine.reconnect().await;
        let shells: Vec<SharedShell> = self.shells.lock().drain().map(|(_, shell)| shell).collect();
        for shell in shells {
            close_shell(&shell).await;
        }
    }

    async fn list(&self, description: &str, filter: ContainerFilter) -> Result<Vec<ContainerInfo>, Error> {
        let filter = &filter;
        self.engine_call(description, true, |engine| async move {
            engine.list_containers(filter).await
        })
        .await
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerInfo, Error> {
        self.engine_call(&format!("inspect {container_id}"), true, |engine| async move {
            engine.inspect_container(container_id).await
        })
        .await
    }

    /// Running shared containers of `subtype` that may take new sessions.
    fn shared_filter(&self, subtype: &str) -> ContainerFilter {
        ContainerFilter::managed(&self.task_name)
            .subtype(subtype)
            .exclusive(false)
            .status(ContainerStatus::Running)
            .health(&[HealthState::Starting, HealthState::Healthy, HealthState::None])
            .network(&self.spec.network_name)
    }

    /// Allocates one container per subtype, waits for them to be healthy and
    /// returns their URLs. On failure everything allocated so far is given
    /// back before the error is returned.
    pub async fn start_session(
        &self,
        subtypes: &[String],
        immutable: bool,
        params: &Value,
    ) -> Result<SessionAllocation, Error> {
        error_if!(subtypes.is_empty(), "At least one subtype is required");
        let mut seen = HashSet::new();
        for subtype in subtypes {
            self.subtype_spec(subtype)?;
            error_if!(!seen.insert(subtype), "Subtype {subtype} requested twice");
        }

        let session_id = self
            .state
            .generate_session_id()
            .await
            .err_tip(|| "While generating a session id")?;
        let mut session = SessionData::default();
        match self
            .allocate_session(session_id, subtypes, immutable, params, &mut session)
            .await
        {
            Ok(urls) => Ok(SessionAllocation {
                session_id,
                containers: session.containers,
                urls,
            }),
            Err(err) => {
                warn!(session_id, ?err, "Failed to start session, giving back its containers");
                if let Err(release_err) = self.release_session(session_id, &session).await {
                    warn!(session_id, ?release_err, "Failed to give back containers");
                }
                if let Err(delete_err) = self.state.delete_session(session_id).await {
                    warn!(session_id, ?delete_err, "Failed to delete session record");
                }
                Err(err)
            }
        }
    }

    async fn allocate_session(
        &self,
        session_id: SessionId,
        subtypes: &[String],
        immutable: bool,
        params: &Value,
        session: &mut SessionData,
    ) -> Result<HashMap<String, String>, Error> {
        let mut shared = Vec::new();
        for subtype in subtypes {
            if !self.subtype_spec(subtype)?.is_exclusive(immutable) {
                shared.push(subtype);
                continue;
            }
            let container_id = self
                .create_container(subtype, HashMap::new(), true, params)
                .await?;
            session.containers.insert(subtype.clone(), container_id.clone());
            session.exclusive_containers.push(container_id.clone());
            self.state.allocate_container(&container_id, session_id).await?;
        }

        for subtype in shared {
            let container_id = self.allocate_shared(subtype, session_id, params).await?;
            session.containers.insert(subtype.clone(), container_id);
        }

        if let Some(homepage) = &self.spec.homepage {
            let mut env = HashMap::with_capacity(session.containers.len());
            for (subtype, container_id) in &session.containers {
                env.insert(
                    homepage_env_name(homepage, subtype),
                    self.container_url(subtype, container_id).await?,
                );
            }
            let container_id = self
                .create_container(&homepage.subtype, env, true, params)
                .await
                .err_tip(|| "While creating the homepage container")?;
            session.containers.insert(homepage.subtype.clone(), container_id.clone());
            session.exclusive_containers.push(container_id.clone());
            self.state.allocate_container(&container_id, session_id).await?;
        }

        self.state
            .store_session(session_id, session)
            .await
            .err_tip(|| format!("While storing session {session_id}"))?;
        for (subtype, container_id) in &session.containers {
            info!(session_id, subtype, container_id, "Allocated container");
        }

        let container_ids: Vec<String> = session.containers.values().cloned().collect();
        self.wait_for_health(&container_ids).await?;

        let mut urls = HashMap::with_capacity(session.containers.len());
        for (subtype, container_id) in &session.containers {
            urls.insert(subtype.clone(), self.container_url(subtype, container_id).await?);
        }
        Ok(urls)
    }

    /// Picks a shared container with spare capacity, creating new ones when
    /// none qualifies. Candidates are re-listed from the engine and checked
    /// under the subtype's allocation lock on every pass. Creation happens
    /// outside the lock, so a container created here may be taken by a
    /// concurrent session first; the next pass re-verifies.
    async fn allocate_shared(
        &self,
        subtype: &str,
        session_id: SessionId,
        params: &Value,
    ) -> Result<String, Error> {
        let spec = self.subtype_spec(subtype)?;
        let owner = session_id.to_string();
        let lock_name = allocation_lock(subtype);
        let mut created = 0;
        loop {
            let selected = with_lock(
                &*self.state,
                &lock_name,
                &owner,
                self.allocation_lock_ttl(),
                &self.lock_retry,
                || async move {
                    for container_id in self.shared_candidates(subtype).await? {
                        if self.has_capacity(spec, &container_id).await? {
                            self.state.allocate_container(&container_id, session_id).await?;
                            return Ok(Some(container_id));
                        }
                    }
                    Ok::<_, Error>(None)
                },
            )
            .await
            .err_tip(|| format!("While allocating a {subtype} container"))?;

            if let Some(container_id) = selected {
                return Ok(container_id);
            }
            if created >= self.max_allocation_attempts() {
                return Err(make_err!(
                    Code::ResourceExhausted,
                    "No {subtype} container left with capacity after creating {created}"
                ));
            }
            created += 1;
            debug!(subtype, created, "No shared container has capacity, creating one");
            self.create_container(subtype, HashMap::new(), false, params).await?;
        }
    }

    /// Shared containers of `subtype`, busiest first so that sessions pack
    /// onto containers that are already in use. Ties are broken randomly.
    async fn shared_candidates(&self, subtype: &str) -> Result<Vec<String>, Error> {
        let mut candidates = Vec::new();
        for container in self
            .list("list shared containers", self.shared_filter(subtype))
            .await?
        {
            let uses = self.state.container_current_uses(&container.id).await?;
            candidates.push((uses, container.id));
        }
        candidates.shuffle(&mut rand::rng());
        candidates.sort_by(|(a, _), (b, _)| b.cmp(a));
        Ok(candidates.into_iter().map(|(_, id)| id).collect())
    }

    async fn has_capacity(&self, spec: &SubtypeSpec, container_id: &str) -> Result<bool, Error> {
        if spec.reuse_limit > 0
            && self.state.container_total_uses(container_id).await? >= spec.reuse_limit
        {
            return Ok(false);
        }
        if spec.concurrency_limit > 0
            && self.state.container_current_uses(container_id).await? >= spec.concurrency_limit
        {
            return Ok(false);
        }
        Ok(true)
    }

    /// Extends the session record and every allocation it holds.
    pub async fn renew_session(&self, session_id: SessionId) -> Result<(), Error> {
        self.state
            .renew_session(session_id)
            .await
            .err_tip(|| format!("While renewing session {session_id}"))?;
        if let Some(session) = self.state.get_session(session_id).await? {
            for container_id in session.containers.values() {
                self.state.renew_container(container_id, session_id).await?;
            }
        }
        Ok(())
    }

    /// Gives every container of the session back. Ending an unknown session
    /// only deletes its record.
    pub async fn end_session(&self, session_id: SessionId) -> Result<(), Error> {
        let released = match self.state.get_session(session_id).await? {
            Some(session) => self.release_session(session_id, &session).await,
            None => {
                debug!(session_id, "Ending unknown session");
                Ok(())
            }
        };
        released.merge(
            self.state
                .delete_session(session_id)
                .await
                .err_tip(|| format!("While deleting session {session_id}")),
        )
    }

    async fn release_session(&self, session_id: SessionId, session: &SessionData) -> Result<(), Error> {
        let owner = session_id.to_string();
        let mut error: Option<Error> = None;
        for (subtype, container_id) in &session.containers {
            if session.exclusive_containers.contains(container_id) {
                continue;
            }
            let released = with_lock(
                &*self.state,
                &allocation_lock(subtype),
                &owner,
                self.allocation_lock_ttl(),
                &self.lock_retry,
                || self.state.release_container(container_id, session_id),
            )
            .await;
            match released {
                Ok(()) => info!(session_id, container_id, "Released container"),
                Err(err) => error = Error::merge_option(error, Some(err)),
            }
        }
        for container_id in &session.exclusive_containers {
            if let Err(err) = self.delete_container(container_id).await {
                error = Error::merge_option(error, Some(err));
            }
        }
        error.map_or(Ok(()), Err)
    }

    /// Creates and starts a container of `subtype`. Returns its id.
    pub async fn create_container(
        &self,
        subtype: &str,
        extra_env: HashMap<String, String>,
        exclusive: bool,
        params: &Value,
    ) -> Result<String, Error> {
        let subtype_spec = self.subtype_spec(subtype)?;
        let suffix = Uuid::new_v4().simple().to_string();
        let mut spec = ContainerSpec {
            name: format!("{}-{}", subtype.replace('_', "-").to_lowercase(), &suffix[..8]),
            image: subtype_spec.image.clone(),
            env: subtype_spec.env.clone(),
            labels: ContainerLabels {
                task: self.task_name.clone(),
                subtype: subtype.to_string(),
                exclusive,
                depends_on: Vec::new(),
            },
            network: self.spec.network_name.clone(),
            cmd: subtype_spec.cmd.clone(),
            auto_remove: true,
            init: true,
        };
        if let Some(hooks) = &self.hooks {
            hooks
                .customize(subtype, &mut spec, params)
                .err_tip(|| format!("While customizing {subtype} container"))?;
        }
        spec.env.extend(extra_env);

        let spec_ref = &spec;
        let description = format!("create container {}", spec.name);
        let create = |engine: Arc<dyn ContainerEngine>| async move {
            engine.create_container(spec_ref).await
        };
        let container_id = match self.engine_call(&description, false, create).await {
            Ok(container_id) => container_id,
            Err(err) if err.code == Code::NotFound => {
                warn!(image = spec.image, "Image not found, pulling it");
                let image = spec.image.as_str();
                let pull_timeout = Duration::from_secs(or_default(
                    self.spec.image_pull_timeout_s,
                    DEFAULT_IMAGE_PULL_TIMEOUT_S,
                ));
                tokio::time::timeout(
                    pull_timeout,
                    self.engine_call(&format!("pull image {image}"), true, |engine| async move {
                        engine.pull_image(image).await
                    }),
                )
                .await
                .map_err(|_| err.append(format!("Timed out pulling image {image}")))??;
                self.engine_call(&description, false, create).await?
            }
            Err(err) => return Err(err),
        };
        debug!(container_id, name = spec.name, "Created container");

        let start = self
            .engine_call(&format!("start container {container_id}"), true, |engine| {
                let container_id = &container_id;
                async move { engine.start_container(container_id).await }
            })
            .await;
        if let Err(err) = start {
            if let Err(delete_err) = self.delete_container(&container_id).await {
                warn!(container_id, ?delete_err, "Failed to clean up container that did not start");
            }
            return Err(err);
        }

        if let (Some(hooks), Some(pool)) = (self.hooks.clone(), self.weak_self.upgrade()) {
            let subtype = subtype.to_string();
            let id = container_id.clone();
            let task = spawn!("post_create_container", async move {
                if let Err(err) = pool.run_post_create(&*hooks, &subtype, &id).await {
                    warn!(container_id = id, ?err, "Post-create hook failed");
                }
            });
            let mut tasks = self.post_create_tasks.lock();
            tasks.retain(|task| !task.is_finished());
            tasks.push(task);
        }
        Ok(container_id)
    }

    async fn run_post_create(
        &self,
        hooks: &dyn ContainerHooks,
        subtype: &str,
        container_id: &str,
    ) -> Result<(), Error> {
        self.wait_for_health(&[container_id.to_string()]).await?;
        let url = self.container_url(subtype, container_id).await?;
        hooks.post_create(subtype, container_id, &url).await
    }

    /// Removes a container and everything it depends on, then purges its
    /// store keys. Engine failures while removing are logged, not returned.
    pub fn delete_container<'a>(&'a self, container_id: &'a str) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let mut visited = HashSet::new();
            self.delete_container_visited(container_id, &mut visited).await
        })
    }

    fn delete_container_visited<'a>(
        &'a self,
        container_id: &'a str,
        visited: &'a mut HashSet<String>,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            if !visited.insert(container_id.to_string()) {
                return Ok(());
            }
            let shell = self.shells.lock().remove(container_id);
            if let Some(shell) = shell {
                close_shell(&shell).await;
            }

            let depends_on = match self.inspect(container_id).await {
                Ok(info) => info.typed_labels().map(|labels| labels.depends_on).unwrap_or_default(),
                Err(err) => {
                    debug!(container_id, ?err, "Could not inspect container before deleting");
                    Vec::new()
                }
            };
            for dependency in &depends_on {
                self.delete_container_visited(dependency, visited).await?;
            }

            let removed = self
                .engine_call(&format!("delete container {container_id}"), false, |engine| async move {
                    engine.remove_container(container_id).await
                })
                .await;
            match removed {
                Ok(()) => {}
                Err(err) if err.code == Code::NotFound => {
                    debug!(container_id, "Container already gone");
                }
                Err(err) => warn!(container_id, ?err, "Failed to remove container"),
            }

            self.state
                .remove_container(container_id)
                .await
                .err_tip(|| format!("While purging keys of {container_id}"))?;
            info!(container_id, "Deleted container");
            Ok(())
        })
    }

    /// Runs `command` to completion inside the container.
    pub async fn execute_command(
        &self,
        container_id: &str,
        command: Vec<String>,
        timeout: Duration,
    ) -> Result<ExecOutput, Error> {
        let command = &command;
        let description = format!("exec in {container_id}");
        let exec = self.engine_call(&description, false, |engine| async move {
            engine.exec(container_id, command.clone()).await
        });
        tokio::time::timeout(timeout, exec).await.map_err(|_| {
            make_err!(
                Code::DeadlineExceeded,
                "Command in {container_id} timed out after {timeout:?}"
            )
        })?
    }

    /// Opens the container's persistent shell if it is not open yet.
    pub async fn create_shell(&self, container_id: &str) -> Result<(), Error> {
        let slot = self.shell_slot(container_id);
        let mut shell = slot.lock().await;
        self.open_shell_into(container_id, &mut shell).await
    }

    fn shell_slot(&self, container_id: &str) -> SharedShell {
        self.shells
            .lock()
            .entry(container_id.to_string())
            .or_default()
            .clone()
    }

    async fn open_shell_into(
        &self,
        container_id: &str,
        shell: &mut Option<Box<dyn InteractiveShell>>,
    ) -> Result<(), Error> {
        if shell.is_some() {
            return Ok(());
        }
        let cmd: Vec<String> = DEFAULT_SHELL.iter().map(ToString::to_string).collect();
        let cmd = &cmd;
        let stream = self
            .engine_call(&format!("shell exec {container_id}"), false, |engine| async move {
                engine.open_shell(container_id, cmd.clone()).await
            })
            .await?;
        let opened = PromptShell::open(stream, INITIAL_PROMPT_TIMEOUT)
            .await
            .err_tip(|| format!("While opening shell in {container_id}"))?;
        *shell = Some(Box::new(opened));
        Ok(())
    }

    /// Runs `command` in the container's persistent shell. A failed or timed
    /// out command closes the shell so the next call starts a fresh one.
    pub async fn execute_shell(
        &self,
        container_id: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<Bytes, Error> {
        let slot = self.shell_slot(container_id);
        let mut shell = slot.lock().await;
        self.open_shell_into(container_id, &mut shell).await?;
        let Some(open) = shell.as_mut() else {
            return Err(make_err!(Code::Internal, "Shell of {container_id} vanished"));
        };
        let result = open.run(command, timeout).await;
        if let Err(err) = &result {
            debug!(container_id, ?err, "Shell command failed, closing shell");
            if let Some(mut failed) = shell.take() {
                failed.close().await;
            }
        }
        result
    }

    /// The container's configured environment.
    pub async fn get_env_variables(&self, container_id: &str) -> Result<HashMap<String, String>, Error> {
        let info = self.inspect(container_id).await?;
        Ok(info
            .env
            .iter()
            .filter_map(|pair| pair.split_once('='))
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect())
    }

    /// URL of a container of `subtype` on the pool network.
    pub async fn container_url(&self, subtype: &str, container_id: &str) -> Result<String, Error> {
        let port = self.subtype_spec(subtype)?.service_port;
        let info = self.inspect(container_id).await?;
        let ip = info
            .networks
            .get(&self.spec.network_name)
            .filter(|ip| !ip.is_empty())
            .err_tip_with_code(|_| {
                (
                    Code::FailedPrecondition,
                    format!(
                        "Container {container_id} has no address on {}",
                        self.spec.network_name
                    ),
                )
            })?;
        Ok(format_url(ip, port))
    }

    /// Waits until none of the containers is still being created, then
    /// until none is starting or unhealthy.
    pub async fn wait_for_health(&self, container_ids: &[String]) -> Result<(), Error> {
        if container_ids.is_empty() {
            return Ok(());
        }
        let network = &self.spec.network_name;
        let poll = async {
            loop {
                let created = self
                    .list(
                        "list created containers",
                        ContainerFilter::default()
                            .ids(container_ids.iter().cloned())
                            .status(ContainerStatus::Created)
                            .network(network),
                    )
                    .await?;
                if created.is_empty() {
                    let unhealthy = self
                        .list(
                            "list unhealthy containers",
                            ContainerFilter::default()
                                .ids(container_ids.iter().cloned())
                                .health(&[HealthState::Starting, HealthState::Unhealthy])
                                .network(network),
                        )
                        .await?;
                    if unhealthy.is_empty() {
                        return Ok::<(), Error>(());
                    }
                }
                tokio::time::sleep(self.health_poll_interval()).await;
            }
        };
        let timeout = self.health_timeout();
        tokio::time::timeout(timeout, poll).await.map_err(|_| {
            make_err!(
                Code::DeadlineExceeded,
                "Containers {container_ids:?} not healthy after {timeout:?}"
            )
        })?
    }

    /// One reclamation pass over the containers of this task.
    pub async fn sweep(&self) -> Result<(), Error> {
        let network = &self.spec.network_name;

        let exclusive = self
            .list(
                "list exclusive containers",
                ContainerFilter::managed(&self.task_name)
                    .exclusive(true)
                    .network(network),
            )
            .await?;
        for container in exclusive {
            if !self.state.container_is_allocated(&container.id).await? {
                self.delete_container(&container.id).await?;
            }
        }

        let unhealthy = self
            .list(
                "list unhealthy shared containers",
                ContainerFilter::managed(&self.task_name)
                    .exclusive(false)
                    .health(&[HealthState::Unhealthy])
                    .network(network),
            )
            .await?;
        for container in unhealthy {
            if !self.state.container_is_allocated(&container.id).await? {
                self.delete_container(&container.id).await?;
            }
        }

        for (subtype, spec) in &self.spec.subtypes {
            if spec.reuse_limit == 0 {
                continue;
            }
            let listed: Vec<String> = self
                .list("list shared containers", self.shared_filter(subtype))
                .await?
                .into_iter()
                .map(|container| container.id)
                .collect();
            let mut exhausted = Vec::new();
            for container_id in &listed {
                if self.state.container_total_uses(container_id).await? >= spec.reuse_limit {
                    exhausted.push(container_id.clone());
                }
            }
            // The listing may lag behind the store, so also look at what the
            // store knows to be exhausted.
            for container_id in self.state.containers_total_uses_gte(spec.reuse_limit).await? {
                if exhausted.contains(&container_id) || listed.contains(&container_id) {
                    continue;
                }
                match self.inspect(&container_id).await {
                    Ok(info) => {
                        let ours = info.typed_labels().is_some_and(|labels| {
                            labels.task == self.task_name
                                && labels.subtype == *subtype
                                && !labels.exclusive
                        });
                        if ours {
                            exhausted.push(container_id);
                        }
                    }
                    Err(err) if err.code == Code::NotFound => {
                        if !self.state.container_is_allocated(&container_id).await? {
                            debug!(container_id, "Purging keys of vanished container");
                            self.state.remove_container(&container_id).await?;
                        }
                    }
                    Err(err) => return Err(err),
                }
            }
            for container_id in exhausted {
                if !self.state.container_is_allocated(&container_id).await? {
                    self.delete_container(&container_id).await?;
                }
            }
        }
        Ok(())
    }

    /// Sweeps every interval while holding the store's background lock.
    /// Never returns.
    pub async fn background_task(&self) {
        let interval = Duration::from_secs(or_default(
            self.spec.background_interval_s,
            DEFAULT_BACKGROUND_INTERVAL_S,
        ));
        let ttl = Duration::from_secs(or_default(
            self.spec.background_lock_ttl_s,
            DEFAULT_BACKGROUND_LOCK_TTL_S,
        ));
        let owner = self.state.client_id().to_string();
        loop {
            match self.state.acquire_lock(BACKGROUND_LOCK, &owner, ttl).await {
                Ok(true) => {
                    if let Err(err) = self.sweep().await {
                        warn!(?err, "Error while cleaning containers");
                    }
                    if let Err(err) = self.state.release_lock(BACKGROUND_LOCK, &owner).await {
                        warn!(?err, "Failed to release background lock");
                    }
                }
                Ok(false) => debug!("Another process is cleaning containers"),
                Err(err) => warn!(?err, "Error in background task"),
            }
            tokio::time::sleep(interval).await;
        }
    }
}

/// Waits for any command in flight, then closes the shell.
async fn close_shell(slot: &SharedShell) {
    if let Some(mut shell) = slot.lock().await.take() {
        shell.close().await;
    }
}
