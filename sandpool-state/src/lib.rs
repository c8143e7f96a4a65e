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
use std::collections::HashMap;

use async_trait::async_trait;
use futures::stream::unfold;
use sandpool_config::retry::Retry;
use sandpool_error::{Code, Error, make_err};
use sandpool_util::retry::{Retrier, RetryResult};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub mod keys;
pub mod memory_store;
pub mod redis_store;

pub use memory_store::MemoryStateStore;
pub use redis_store::RedisStateStore;

pub type SessionId = u64;

/// Record of what a session holds, persisted with a TTL so a crashed
/// worker's sessions eventually disappear.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionData {
    /// Subtype to container id.
    pub containers: HashMap<String, String>,
    /// Containers that must be destroyed when the session ends.
    pub exclusive_containers: Vec<String>,
}

/// Coordination state shared by every worker on the same network.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    /// Random token identifying this process. Used as the default lock owner.
    fn client_id(&self) -> &str;

    /// Takes `name` for `owner`, or renews it if `owner` already holds it.
    /// Returns false without side effects when someone else holds it.
    async fn acquire_lock(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool, Error>;

    /// Drops `name` only if `owner` still holds it.
    async fn release_lock(&self, name: &str, owner: &str) -> Result<(), Error>;

    /// Marks `container_id` as in use by `session_id` and bumps its lifetime
    /// use counter.
    async fn allocate_container(
        &self,
        container_id: &str,
        session_id: SessionId,
    ) -> Result<(), Error>;

    async fn renew_container(
        &self,
        container_id: &str,
        session_id: SessionId,
    ) -> Result<(), Error>;

    async fn renew_session(&self, session_id: SessionId) -> Result<(), Error>;

    /// Removes the allocation marker. The lifetime counter is untouched.
    async fn release_container(
        &self,
        container_id: &str,
        session_id: SessionId,
    ) -> Result<(), Error>;

    /// Number of live allocation markers.
    async fn container_current_uses(&self, container_id: &str) -> Result<u64, Error>;

    /// Lifetime number of allocations, zero if never allocated.
    async fn container_total_uses(&self, container_id: &str) -> Result<u64, Error>;

    async fn container_is_allocated(&self, container_id: &str) -> Result<bool, Error> {
        Ok(self.container_current_uses(container_id).await? > 0)
    }

    /// Containers whose lifetime counter reached `threshold`.
    async fn containers_total_uses_gte(&self, threshold: u64) -> Result<Vec<String>, Error>;

    /// Purges every key belonging to `container_id`.
    async fn remove_container(&self, container_id: &str) -> Result<(), Error>;

    async fn store_session(&self, session_id: SessionId, data: &SessionData) -> Result<(), Error>;

    /// Returns `None` for missing, expired or unreadable records.
    async fn get_session(&self, session_id: SessionId) -> Result<Option<SessionData>, Error>;

    async fn delete_session(&self, session_id: SessionId) -> Result<(), Error>;

    async fn generate_session_id(&self) -> Result<SessionId, Error>;
}

/// Runs `fut_fn` while holding `name`.
///
/// Acquisition is retried according to `retry`. The lock is released when
/// the future completes, whether it succeeded or not. Failing to get the lock
/// returns `ResourceExhausted`.
pub async fn with_lock<S, F, Fut, T>(
    store: &S,
    name: &str,
    owner: &str,
    ttl: Duration,
    retry: &Retry,
    fut_fn: F,
) -> Result<T, Error>
where
    S: StateStore + ?Sized,
    F: FnOnce() -> Fut + Send,
    Fut: Future<Output = Result<T, Error>> + Send,
    T: Send,
{
    let retrier = Retrier::from_config(Retry {
        retry_on_errors: None,
        ..retry.clone()
    });
    retrier
        .retry(unfold((), move |()| async move {
            let result = match store.acquire_lock(name, owner, ttl).await {
                Ok(true) => RetryResult::Ok(()),
                Ok(false) => RetryResult::Retry(make_err!(
                    Code::ResourceExhausted,
                    "Lock {name} is held by another owner"
                )),
                Err(err) if err.code == Code::Unavailable || err.code == Code::DeadlineExceeded => {
                    RetryResult::Retry(err.set_code(Code::ResourceExhausted))
                }
                Err(err) => RetryResult::Err(err),
            };
            Some((result, ()))
        }))
        .await?;

    let result = fut_fn().await;
    if let Err(err) = store.release_lock(name, owner).await {
        warn!(?err, lock = name, "Failed to release lock, it will expire on its own");
    }
    result
}
