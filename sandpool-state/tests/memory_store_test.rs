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
use std::collections::HashMap;

use pretty_assertions::assert_eq;
use sandpool_config::retry::Retry;
use sandpool_error::{Code, Error, make_err};
use sandpool_macro::sandpool_test;
use sandpool_state::{MemoryStateStore, SessionData, StateStore, with_lock};

const SESSION_EXPIRY: Duration = Duration::from_secs(600);
const LOCK_TTL: Duration = Duration::from_secs(10);

fn quick_retry() -> Retry {
    Retry {
        max_retries: 3,
        delay: 0.01,
        jitter: 0.,
        retry_on_errors: None,
    }
}

#[sandpool_test(start_paused = true)]
async fn lock_is_owned_by_its_token() -> Result<(), Error> {
    let store = MemoryStateStore::new(SESSION_EXPIRY);

    assert!(store.acquire_lock("allocation:web", "a", LOCK_TTL).await?);
    assert!(!store.acquire_lock("allocation:web", "b", LOCK_TTL).await?);

    // B releasing A's lock is a no-op.
    store.release_lock("allocation:web", "b").await?;
    assert!(!store.acquire_lock("allocation:web", "b", LOCK_TTL).await?);

    store.release_lock("allocation:web", "a").await?;
    assert!(store.acquire_lock("allocation:web", "b", LOCK_TTL).await?);
    Ok(())
}

#[sandpool_test(start_paused = true)]
async fn reacquire_renews_lock_ttl() -> Result<(), Error> {
    let store = MemoryStateStore::new(SESSION_EXPIRY);

    assert!(store.acquire_lock("background", "a", LOCK_TTL).await?);
    tokio::time::advance(Duration::from_secs(8)).await;
    assert!(store.acquire_lock("background", "a", LOCK_TTL).await?);
    tokio::time::advance(Duration::from_secs(8)).await;
    // 16s after the first acquisition but only 8s after the renewal.
    assert!(!store.acquire_lock("background", "b", LOCK_TTL).await?);
    tokio::time::advance(Duration::from_secs(3)).await;
    assert!(store.acquire_lock("background", "b", LOCK_TTL).await?);
    Ok(())
}

#[sandpool_test(start_paused = true)]
async fn allocation_markers_and_counters() -> Result<(), Error> {
    let store = MemoryStateStore::new(SESSION_EXPIRY);

    store.allocate_container("c1", 1).await?;
    store.allocate_container("c1", 2).await?;
    assert_eq!(store.container_current_uses("c1").await?, 2);
    assert_eq!(store.container_total_uses("c1").await?, 2);

    store.release_container("c1", 1).await?;
    assert_eq!(store.container_current_uses("c1").await?, 1);
    assert_eq!(store.container_total_uses("c1").await?, 2, "Counter never decreases");
    assert!(store.container_is_allocated("c1").await?);

    store.release_container("c1", 2).await?;
    assert!(!store.container_is_allocated("c1").await?);
    assert_eq!(store.container_total_uses("unknown").await?, 0);
    Ok(())
}

#[sandpool_test(start_paused = true)]
async fn allocation_markers_expire_unless_renewed() -> Result<(), Error> {
    let store = MemoryStateStore::new(SESSION_EXPIRY);

    store.allocate_container("c1", 1).await?;
    store.allocate_container("c1", 2).await?;
    tokio::time::advance(Duration::from_secs(500)).await;
    store.renew_container("c1", 1).await?;
    tokio::time::advance(Duration::from_secs(200)).await;

    assert_eq!(store.container_current_uses("c1").await?, 1);
    assert_eq!(store.container_total_uses("c1").await?, 2);
    Ok(())
}

#[sandpool_test(start_paused = true)]
async fn total_uses_gte_and_remove() -> Result<(), Error> {
    let store = MemoryStateStore::new(SESSION_EXPIRY);

    for session_id in 1..=3 {
        store.allocate_container("worn", session_id).await?;
    }
    store.allocate_container("fresh", 4).await?;

    assert_eq!(store.containers_total_uses_gte(3).await?, vec!["worn".to_string()]);
    assert_eq!(
        store.containers_total_uses_gte(1).await?,
        vec!["fresh".to_string(), "worn".to_string()]
    );

    store.remove_container("worn").await?;
    assert_eq!(store.container_total_uses("worn").await?, 0);
    assert_eq!(store.container_current_uses("worn").await?, 0);
    Ok(())
}

#[sandpool_test(start_paused = true)]
async fn session_records_expire_and_renew() -> Result<(), Error> {
    let store = MemoryStateStore::new(SESSION_EXPIRY);
    let first = store.generate_session_id().await?;
    let second = store.generate_session_id().await?;
    assert!(second > first, "Session ids must be unique and increasing");

    let data = SessionData {
        containers: HashMap::from([("web".to_string(), "c1".to_string())]),
        exclusive_containers: vec!["c1".to_string()],
    };
    store.store_session(first, &data).await?;
    store.store_session(second, &data).await?;

    tokio::time::advance(Duration::from_secs(400)).await;
    store.renew_session(first).await?;
    tokio::time::advance(Duration::from_secs(400)).await;

    assert_eq!(store.get_session(first).await?, Some(data));
    assert_eq!(store.get_session(second).await?, None);

    store.delete_session(first).await?;
    assert_eq!(store.get_session(first).await?, None);
    Ok(())
}

#[sandpool_test(start_paused = true)]
async fn with_lock_releases_after_failure() -> Result<(), Error> {
    let store = MemoryStateStore::new(SESSION_EXPIRY);

    let result: Result<(), Error> = with_lock(&store, "allocation:web", "a", LOCK_TTL, &quick_retry(), || async {
        Err(make_err!(Code::Internal, "Allocation blew up"))
    })
    .await;
    assert_eq!(result.unwrap_err().code, Code::Internal);
    assert!(store.acquire_lock("allocation:web", "b", LOCK_TTL).await?);
    Ok(())
}

#[sandpool_test(start_paused = true)]
async fn with_lock_gives_up_with_resource_exhausted() -> Result<(), Error> {
    let store = MemoryStateStore::new(SESSION_EXPIRY);
    assert!(store.acquire_lock("allocation:web", "a", LOCK_TTL).await?);

    let result = with_lock(&store, "allocation:web", "b", LOCK_TTL, &quick_retry(), || async {
        Ok(42)
    })
    .await;
    assert_eq!(result.unwrap_err().code, Code::ResourceExhausted);

    // The holder can still re-enter with its own token.
    let value = with_lock(&store, "allocation:web", "a", LOCK_TTL, &quick_retry(), || async {
        Ok(42)
    })
    .await?;
    assert_eq!(value, 42);
    assert!(store.acquire_lock("allocation:web", "b", LOCK_TTL).await?);
    Ok(())
}
