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

use core::time::Duration;

use async_trait::async_trait;
use fred::clients::Client;
use fred::interfaces::{ClientLike, KeysInterface};
use fred::prelude::Builder;
use fred::types::Expiration;
use fred::types::config::{
    Config as RedisConfig, ConnectionConfig, PerformanceConfig, ReconnectPolicy,
};
use fred::types::scripts::Script;
use sandpool_config::state::{RedisMode, RedisSpec};
use sandpool_error::{Code, Error, ResultExt, error_if};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::keys::KeySpace;
use crate::{SessionData, SessionId, StateStore};

/// The default amount of time before a redis command is considered timed out.
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 5_000;

/// The default amount of time before a redis connection is considered dead.
pub const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 3_000;

/// The default delay between reconnect attempts, in seconds.
const DEFAULT_RETRY_DELAY: f32 = 0.1;

/// Upper bound of the exponential reconnect delay.
const MAX_RETRY_DELAY_MS: u32 = 8_000;

/// Sets the lock if unheld, or renews it when ARGV[1] already owns it.
pub const LUA_ACQUIRE_LOCK: &str = r"
if redis.call('SET', KEYS[1], ARGV[1], 'NX', 'EX', ARGV[2]) then
    return 1
end
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('EXPIRE', KEYS[1], ARGV[2])
    return 1
end
return 0
";

/// Deletes the lock only when ARGV[1] still owns it.
pub const LUA_RELEASE_LOCK: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

/// Marks KEYS[1] as held by ARGV[1] for ARGV[2] seconds and bumps the
/// lifetime use counter at KEYS[2] in the same step.
pub const LUA_ALLOCATE_CONTAINER: &str = r"
redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[2])
return redis.call('INCR', KEYS[2])
";

pub const LUA_COUNT_PATTERN: &str = r"
return #redis.call('KEYS', ARGV[1])
";

pub const LUA_DELETE_PATTERN: &str = r"
local keys = redis.call('KEYS', ARGV[1])
for _, key in ipairs(keys) do
    redis.call('DEL', key)
end
return #keys
";

/// Returns every key matching ARGV[1] whose integer value is >= ARGV[2].
pub const LUA_KEYS_VALUE_GTE: &str = r"
local matched = {}
for _, key in ipairs(redis.call('KEYS', ARGV[1])) do
    local value = tonumber(redis.call('GET', key))
    if value and value >= tonumber(ARGV[2]) then
        table.insert(matched, key)
    end
end
return matched
";

/// A [`StateStore`] backed by Redis. Compound operations run as Lua scripts
/// so they stay atomic across processes.
pub struct RedisStateStore {
    client: Client,
    keys: KeySpace,
    client_id: String,
    session_expiry: Duration,
    acquire_lock_script: Script,
    release_lock_script: Script,
    allocate_container_script: Script,
    count_pattern_script: Script,
    delete_pattern_script: Script,
    keys_value_gte_script: Script,
}

impl core::fmt::Debug for RedisStateStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisStateStore")
            .field("namespace", &self.keys.namespace())
            .field("client_id", &self.client_id)
            .field("session_expiry", &self.session_expiry)
            .finish_non_exhaustive()
    }
}

impl RedisStateStore {
    /// Connects to the server described by `spec`. Keys are prefixed with
    /// `spec.key_prefix` when set, otherwise with `default_namespace`.
    pub async fn new(
        spec: &RedisSpec,
        default_namespace: String,
        session_expiry: Duration,
    ) -> Result<Self, Error> {
        error_if!(
            spec.addresses.len() != 1,
            "Exactly one redis address is required, got {}",
            spec.addresses.len()
        );
        let address = &spec.addresses[0];
        let redis_config = match spec.mode {
            RedisMode::Cluster => RedisConfig::from_url_clustered(address),
            RedisMode::Sentinel => RedisConfig::from_url_sentinel(address),
            RedisMode::Standard => RedisConfig::from_url_centralized(address),
        }
        .err_tip_with_code(|_| (Code::InvalidArgument, "While parsing redis node address"))?;

        let reconnect_policy = {
            let mut retry = spec.retry.clone();
            if retry.delay == 0.0 {
                retry.delay = DEFAULT_RETRY_DELAY;
            }
            let max_retries = u32::try_from(retry.max_retries)
                .err_tip(|| "max_retries could not be converted to u32")?;
            let min_delay_ms = (retry.delay * 1000.0) as u32;
            let jitter = (retry.jitter * retry.delay * 1000.0) as u32;

            let mut reconnect_policy =
                ReconnectPolicy::new_exponential(max_retries, min_delay_ms, MAX_RETRY_DELAY_MS, 2);
            reconnect_policy.set_jitter(jitter);
            reconnect_policy
        };

        let command_timeout = Duration::from_millis(if spec.command_timeout_ms == 0 {
            DEFAULT_COMMAND_TIMEOUT_MS
        } else {
            spec.command_timeout_ms
        });
        let connection_timeout = Duration::from_millis(if spec.connection_timeout_ms == 0 {
            DEFAULT_CONNECTION_TIMEOUT_MS
        } else {
            spec.connection_timeout_ms
        });

        let mut builder = Builder::from_config(redis_config);
        builder
            .set_performance_config(PerformanceConfig {
                default_command_timeout: command_timeout,
                ..Default::default()
            })
            .set_connection_config(ConnectionConfig {
                connection_timeout,
                internal_command_timeout: command_timeout,
                ..Default::default()
            })
            .set_policy(reconnect_policy);

        let namespace = spec.key_prefix.clone().unwrap_or(default_namespace);
        Self::new_from_builder(&builder, namespace, session_expiry).await
    }

    /// Used directly by tests to inject a mocked backend.
    pub async fn new_from_builder(
        builder: &Builder,
        namespace: String,
        session_expiry: Duration,
    ) -> Result<Self, Error> {
        let client = builder
            .build()
            .err_tip(|| "While creating redis client")?;
        client
            .init()
            .await
            .err_tip(|| "While connecting to redis")?;
        let client_id = Uuid::new_v4().simple().to_string();
        debug!(namespace, client_id, "Connected redis state store");
        Ok(Self {
            client,
            keys: KeySpace::new(namespace),
            client_id,
            session_expiry,
            acquire_lock_script: Script::from_lua(LUA_ACQUIRE_LOCK),
            release_lock_script: Script::from_lua(LUA_RELEASE_LOCK),
            allocate_container_script: Script::from_lua(LUA_ALLOCATE_CONTAINER),
            count_pattern_script: Script::from_lua(LUA_COUNT_PATTERN),
            delete_pattern_script: Script::from_lua(LUA_DELETE_PATTERN),
            keys_value_gte_script: Script::from_lua(LUA_KEYS_VALUE_GTE),
        })
    }

    pub const fn keys(&self) -> &KeySpace {
        &self.keys
    }

    /// Redis rejects a zero expiry, so sub-second settings round up.
    fn expiry_secs(&self) -> i64 {
        i64::try_from(self.session_expiry.as_secs().max(1)).unwrap_or(i64::MAX)
    }

    fn expiry(&self) -> Expiration {
        Expiration::EX(self.expiry_secs())
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn acquire_lock(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool, Error> {
        let acquired: i64 = self
            .acquire_lock_script
            .evalsha_with_reload(
                &self.client,
                vec![self.keys.lock(name)],
                vec![owner.to_string(), ttl.as_secs().max(1).to_string()],
            )
            .await
            .err_tip(|| format!("In RedisStateStore::acquire_lock for {name}"))?;
        Ok(acquired == 1)
    }

    async fn release_lock(&self, name: &str, owner: &str) -> Result<(), Error> {
        let _deleted: i64 = self
            .release_lock_script
            .evalsha_with_reload(
                &self.client,
                vec![self.keys.lock(name)],
                vec![owner.to_string()],
            )
            .await
            .err_tip(|| format!("In RedisStateStore::release_lock for {name}"))?;
        Ok(())
    }

    async fn allocate_container(
        &self,
        container_id: &str,
        session_id: SessionId,
    ) -> Result<(), Error> {
        let _uses: i64 = self
            .allocate_container_script
            .evalsha_with_reload(
                &self.client,
                vec![
                    self.keys.allocation(container_id, session_id),
                    self.keys.uses(container_id),
                ],
                vec![self.client_id.clone(), self.expiry_secs().to_string()],
            )
            .await
            .err_tip(|| format!("In RedisStateStore::allocate_container for {container_id}"))?;
        Ok(())
    }

    async fn renew_container(
        &self,
        container_id: &str,
        session_id: SessionId,
    ) -> Result<(), Error> {
        self.client
            .expire::<i64, _>(
                self.keys.allocation(container_id, session_id),
                self.expiry_secs(),
                None,
            )
            .await
            .err_tip(|| "In RedisStateStore::renew_container")?;
        Ok(())
    }

    async fn renew_session(&self, session_id: SessionId) -> Result<(), Error> {
        self.client
            .expire::<i64, _>(
                self.keys.session(session_id),
                self.expiry_secs(),
                None,
            )
            .await
            .err_tip(|| "In RedisStateStore::renew_session")?;
        Ok(())
    }

    async fn release_container(
        &self,
        container_id: &str,
        session_id: SessionId,
    ) -> Result<(), Error> {
        self.client
            .del::<i64, _>(self.keys.allocation(container_id, session_id))
            .await
            .err_tip(|| "In RedisStateStore::release_container")?;
        Ok(())
    }

    async fn container_current_uses(&self, container_id: &str) -> Result<u64, Error> {
        let count: u64 = self
            .count_pattern_script
            .evalsha_with_reload(
                &self.client,
                Vec::<String>::new(),
                vec![self.keys.allocation_pattern(container_id)],
            )
            .await
            .err_tip(|| "In RedisStateStore::container_current_uses")?;
        Ok(count)
    }

    async fn container_total_uses(&self, container_id: &str) -> Result<u64, Error> {
        let uses: Option<u64> = self
            .client
            .get(self.keys.uses(container_id))
            .await
            .err_tip(|| "In RedisStateStore::container_total_uses")?;
        Ok(uses.unwrap_or(0))
    }

    async fn containers_total_uses_gte(&self, threshold: u64) -> Result<Vec<String>, Error> {
        let keys: Vec<String> = self
            .keys_value_gte_script
            .evalsha_with_reload(
                &self.client,
                Vec::<String>::new(),
                vec![self.keys.all_uses_pattern(), threshold.to_string()],
            )
            .await
            .err_tip(|| "In RedisStateStore::containers_total_uses_gte")?;
        Ok(keys
            .iter()
            .filter_map(|key| self.keys.container_from_uses(key))
            .map(str::to_string)
            .collect())
    }

    async fn remove_container(&self, container_id: &str) -> Result<(), Error> {
        let _deleted: i64 = self
            .delete_pattern_script
            .evalsha_with_reload(
                &self.client,
                Vec::<String>::new(),
                vec![self.keys.container_pattern(container_id)],
            )
            .await
            .err_tip(|| "In RedisStateStore::remove_container")?;
        Ok(())
    }

    async fn store_session(&self, session_id: SessionId, data: &SessionData) -> Result<(), Error> {
        let json = serde_json::to_string(data).err_tip(|| "While encoding session data")?;
        self.client
            .set::<(), _, _>(
                self.keys.session(session_id),
                json,
                Some(self.expiry()),
                None,
                false,
            )
            .await
            .err_tip(|| "In RedisStateStore::store_session")?;
        Ok(())
    }

    async fn get_session(&self, session_id: SessionId) -> Result<Option<SessionData>, Error> {
        let json: Option<String> = self
            .client
            .get(self.keys.session(session_id))
            .await
            .err_tip(|| "In RedisStateStore::get_session")?;
        let Some(json) = json else {
            return Ok(None);
        };
        match serde_json::from_str(&json) {
            Ok(data) => Ok(Some(data)),
            Err(err) => {
                warn!(session_id, ?err, "Ignoring unreadable session record");
                Ok(None)
            }
        }
    }

    async fn delete_session(&self, session_id: SessionId) -> Result<(), Error> {
        self.client
            .del::<i64, _>(self.keys.session(session_id))
            .await
            .err_tip(|| "In RedisStateStore::delete_session")?;
        Ok(())
    }

    async fn generate_session_id(&self) -> Result<SessionId, Error> {
        self.client
            .incr::<u64, _>(self.keys.session_counter())
            .await
            .err_tip(|| "In RedisStateStore::generate_session_id")
    }
}
