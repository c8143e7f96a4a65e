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
use std::collections::VecDeque;
use std::sync::Arc;

use fred::error::Error as RedisError;
use fred::mocks::{MockCommand, Mocks};
use fred::prelude::Builder;
use fred::types::Value as RedisValue;
use fred::types::config::Config as RedisConfig;
use fred::types::scripts::Script;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use sandpool_error::Error;
use sandpool_macro::sandpool_test;
use sandpool_state::redis_store::{
    LUA_ACQUIRE_LOCK, LUA_ALLOCATE_CONTAINER, LUA_KEYS_VALUE_GTE, LUA_RELEASE_LOCK,
};
use sandpool_state::{RedisStateStore, SessionData, StateStore};

const NAMESPACE: &str = "sandpool:shell:test-net";

/// Records every command and answers from a queue of canned responses.
/// Commands without a queued response get `Null`.
#[derive(Debug, Default)]
struct MockRedisBackend {
    responses: Mutex<VecDeque<RedisValue>>,
    received: Mutex<Vec<MockCommand>>,
}

impl MockRedisBackend {
    fn respond(&self, value: RedisValue) -> &Self {
        self.responses.lock().push_back(value);
        self
    }

    /// Commands named `cmd`, with their arguments rendered as strings.
    fn received(&self, cmd: &str) -> Vec<Vec<String>> {
        self.received
            .lock()
            .iter()
            .filter(|command| command.cmd == cmd)
            .map(|command| {
                command
                    .args
                    .iter()
                    .map(|arg| arg.as_string().unwrap_or_default())
                    .collect()
            })
            .collect()
    }
}

impl Mocks for MockRedisBackend {
    fn process_command(&self, actual: MockCommand) -> Result<RedisValue, RedisError> {
        self.received.lock().push(actual);
        Ok(self
            .responses
            .lock()
            .pop_front()
            .unwrap_or(RedisValue::Null))
    }
}

async fn make_mock_store(mocks: &Arc<MockRedisBackend>) -> RedisStateStore {
    make_mock_store_with_expiry(mocks, Duration::from_secs(600)).await
}

async fn make_mock_store_with_expiry(
    mocks: &Arc<MockRedisBackend>,
    session_expiry: Duration,
) -> RedisStateStore {
    let mut builder = Builder::default_centralized();
    builder.set_config(RedisConfig {
        mocks: Some(Arc::clone(mocks) as Arc<dyn Mocks>),
        ..Default::default()
    });
    RedisStateStore::new_from_builder(&builder, NAMESPACE.to_string(), session_expiry)
        .await
        .unwrap()
}

fn sha1(lua: &str) -> String {
    Script::from_lua(lua).sha1().to_string()
}

#[sandpool_test]
async fn acquire_lock_runs_script_on_namespaced_key() -> Result<(), Error> {
    let mocks = Arc::new(MockRedisBackend::default());
    let store = make_mock_store(&mocks).await;
    mocks.respond(RedisValue::Integer(1)).respond(RedisValue::Integer(0));

    assert!(store.acquire_lock("allocation:web", "42", Duration::from_secs(10)).await?);
    assert!(!store.acquire_lock("allocation:web", "43", Duration::from_secs(10)).await?);

    let calls = mocks.received("EVALSHA");
    assert_eq!(
        calls[0],
        vec![
            sha1(LUA_ACQUIRE_LOCK),
            "1".to_string(),
            format!("{NAMESPACE}:lock:allocation:web"),
            "42".to_string(),
            "10".to_string(),
        ]
    );
    assert_eq!(calls[1][3], "43");
    Ok(())
}

#[sandpool_test]
async fn release_lock_passes_owner() -> Result<(), Error> {
    let mocks = Arc::new(MockRedisBackend::default());
    let store = make_mock_store(&mocks).await;
    mocks.respond(RedisValue::Integer(0));

    store.release_lock("background", "not-the-owner").await?;

    assert_eq!(
        mocks.received("EVALSHA"),
        vec![vec![
            sha1(LUA_RELEASE_LOCK),
            "1".to_string(),
            format!("{NAMESPACE}:lock:background"),
            "not-the-owner".to_string(),
        ]]
    );
    Ok(())
}

#[sandpool_test]
async fn allocate_marks_and_counts_in_one_script() -> Result<(), Error> {
    let mocks = Arc::new(MockRedisBackend::default());
    let store = make_mock_store(&mocks).await;
    mocks.respond(RedisValue::Integer(3));

    store.allocate_container("c1", 7).await?;

    assert_eq!(
        mocks.received("EVALSHA"),
        vec![vec![
            sha1(LUA_ALLOCATE_CONTAINER),
            "2".to_string(),
            format!("{NAMESPACE}:container:c1:allocation:7"),
            format!("{NAMESPACE}:container:c1:uses"),
            store.client_id().to_string(),
            "600".to_string(),
        ]]
    );
    assert!(mocks.received("SET").is_empty());
    assert!(mocks.received("INCR").is_empty());
    Ok(())
}

#[sandpool_test]
async fn sub_second_expiry_renews_for_one_second() -> Result<(), Error> {
    let mocks = Arc::new(MockRedisBackend::default());
    let store = make_mock_store_with_expiry(&mocks, Duration::from_millis(500)).await;
    mocks.respond(RedisValue::Integer(1)).respond(RedisValue::Integer(1));

    store.renew_container("c1", 7).await?;
    store.renew_session(7).await?;

    assert_eq!(
        mocks.received("EXPIRE"),
        vec![
            vec![
                format!("{NAMESPACE}:container:c1:allocation:7"),
                "1".to_string(),
            ],
            vec![format!("{NAMESPACE}:session:7"), "1".to_string()],
        ]
    );
    Ok(())
}

#[sandpool_test]
async fn total_uses_defaults_to_zero() -> Result<(), Error> {
    let mocks = Arc::new(MockRedisBackend::default());
    let store = make_mock_store(&mocks).await;
    mocks.respond(RedisValue::Null).respond(RedisValue::from("4"));

    assert_eq!(store.container_total_uses("c1").await?, 0);
    assert_eq!(store.container_total_uses("c2").await?, 4);
    Ok(())
}

#[sandpool_test]
async fn total_uses_gte_strips_key_layout() -> Result<(), Error> {
    let mocks = Arc::new(MockRedisBackend::default());
    let store = make_mock_store(&mocks).await;
    mocks.respond(RedisValue::Array(vec![
        RedisValue::from(format!("{NAMESPACE}:container:abc:uses")),
        RedisValue::from(format!("{NAMESPACE}:container:def:uses")),
    ]));

    assert_eq!(
        store.containers_total_uses_gte(5).await?,
        vec!["abc".to_string(), "def".to_string()]
    );
    let calls = mocks.received("EVALSHA");
    assert_eq!(
        calls[0],
        vec![
            sha1(LUA_KEYS_VALUE_GTE),
            "0".to_string(),
            format!("{NAMESPACE}:container:*:uses"),
            "5".to_string(),
        ]
    );
    Ok(())
}

#[sandpool_test]
async fn unreadable_session_reads_as_absent() -> Result<(), Error> {
    let mocks = Arc::new(MockRedisBackend::default());
    let store = make_mock_store(&mocks).await;
    let data = SessionData {
        containers: [("web".to_string(), "c1".to_string())].into(),
        exclusive_containers: vec![],
    };
    mocks
        .respond(RedisValue::from("{not json"))
        .respond(RedisValue::from(serde_json::to_string(&data).unwrap()));

    assert_eq!(store.get_session(1).await?, None);
    assert_eq!(store.get_session(2).await?, Some(data));
    assert_eq!(
        mocks.received("GET"),
        vec![
            vec![format!("{NAMESPACE}:session:1")],
            vec![format!("{NAMESPACE}:session:2")],
        ]
    );
    Ok(())
}

#[sandpool_test]
async fn session_ids_come_from_incr() -> Result<(), Error> {
    let mocks = Arc::new(MockRedisBackend::default());
    let store = make_mock_store(&mocks).await;
    mocks.respond(RedisValue::Integer(17));

    assert_eq!(store.generate_session_id().await?, 17);
    assert_eq!(
        mocks.received("INCR"),
        vec![vec![format!("{NAMESPACE}:session_id")]]
    );
    Ok(())
}
