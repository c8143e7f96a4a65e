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

use async_trait::async_trait;
use parking_lot::Mutex;
use sandpool_error::Error;
use tokio::time::Instant;
use uuid::Uuid;

use crate::{SessionData, SessionId, StateStore};

#[derive(Debug, Default)]
struct MemoryState {
    /// Lock name to (owner, expiry).
    locks: HashMap<String, (String, Instant)>,
    /// Container id to the expiry of each session's allocation marker.
    allocations: HashMap<String, HashMap<SessionId, Instant>>,
    /// Lifetime use counters. Never decremented.
    uses: HashMap<String, u64>,
    sessions: HashMap<SessionId, (SessionData, Instant)>,
    last_session_id: SessionId,
}

impl MemoryState {
    fn live_allocations(&mut self, container_id: &str, now: Instant) -> u64 {
        let Some(markers) = self.allocations.get_mut(container_id) else {
            return 0;
        };
        markers.retain(|_, expiry| *expiry > now);
        markers.len() as u64
    }
}

/// Single process [`StateStore`]. Expiry follows the tokio clock so tests
/// can drive it with `tokio::time::pause` and `advance`.
#[derive(Debug)]
pub struct MemoryStateStore {
    state: Mutex<MemoryState>,
    client_id: String,
    session_expiry: Duration,
}

impl MemoryStateStore {
    pub fn new(session_expiry: Duration) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            client_id: Uuid::new_v4().simple().to_string(),
            session_expiry,
        }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn acquire_lock(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool, Error> {
        let now = Instant::now();
        let mut state = self.state.lock();
        match state.locks.get_mut(name) {
            Some((holder, expiry)) if *expiry > now && holder.as_str() != owner => Ok(false),
            Some((holder, expiry)) => {
                owner.clone_into(holder);
                *expiry = now + ttl;
                Ok(true)
            }
            None => {
                state
                    .locks
                    .insert(name.to_string(), (owner.to_string(), now + ttl));
                Ok(true)
            }
        }
    }

    async fn release_lock(&self, name: &str, owner: &str) -> Result<(), Error> {
        let mut state = self.state.lock();
        if state
            .locks
            .get(name)
            .is_some_and(|(holder, _)| holder == owner)
        {
            state.locks.remove(name);
        }
        Ok(())
    }

    async fn allocate_container(
        &self,
        container_id: &str,
        session_id: SessionId,
    ) -> Result<(), Error> {
        let expiry = Instant::now() + self.session_expiry;
        let mut state = self.state.lock();
        state
            .allocations
            .entry(container_id.to_string())
            .or_default()
            .insert(session_id, expiry);
        *state.uses.entry(container_id.to_string()).or_default() += 1;
        Ok(())
    }

    async fn renew_container(
        &self,
        container_id: &str,
        session_id: SessionId,
    ) -> Result<(), Error> {
        let now = Instant::now();
        let mut state = self.state.lock();
        if let Some(expiry) = state
            .allocations
            .get_mut(container_id)
            .and_then(|markers| markers.get_mut(&session_id))
        {
            // An expired marker stays expired, like EXPIRE on a missing key.
            if *expiry > now {
                *expiry = now + self.session_expiry;
            }
        }
        Ok(())
    }

    async fn renew_session(&self, session_id: SessionId) -> Result<(), Error> {
        let now = Instant::now();
        let mut state = self.state.lock();
        if let Some((_, expiry)) = state.sessions.get_mut(&session_id) {
            if *expiry > now {
                *expiry = now + self.session_expiry;
            }
        }
        Ok(())
    }

    async fn release_container(
        &self,
        container_id: &str,
        session_id: SessionId,
    ) -> Result<(), Error> {
        let mut state = self.state.lock();
        if let Some(markers) = state.allocations.get_mut(container_id) {
            markers.remove(&session_id);
        }
        Ok(())
    }

    async fn container_current_uses(&self, container_id: &str) -> Result<u64, Error> {
        Ok(self
            .state
            .lock()
            .live_allocations(container_id, Instant::now()))
    }

    async fn container_total_uses(&self, container_id: &str) -> Result<u64, Error> {
        Ok(self
            .state
            .lock()
            .uses
            .get(container_id)
            .copied()
            .unwrap_or(0))
    }

    async fn containers_total_uses_gte(&self, threshold: u64) -> Result<Vec<String>, Error> {
        let mut matched: Vec<String> = self
            .state
            .lock()
            .uses
            .iter()
            .filter(|(_, uses)| **uses >= threshold)
            .map(|(container_id, _)| container_id.clone())
            .collect();
        matched.sort_unstable();
        Ok(matched)
    }

    async fn remove_container(&self, container_id: &str) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.allocations.remove(container_id);
        state.uses.remove(container_id);
        Ok(())
    }

    async fn store_session(&self, session_id: SessionId, data: &SessionData) -> Result<(), Error> {
        let expiry = Instant::now() + self.session_expiry;
        self.state
            .lock()
            .sessions
            .insert(session_id, (data.clone(), expiry));
        Ok(())
    }

    async fn get_session(&self, session_id: SessionId) -> Result<Option<SessionData>, Error> {
        let now = Instant::now();
        let mut state = self.state.lock();
        match state.sessions.get(&session_id) {
            Some((data, expiry)) if *expiry > now => Ok(Some(data.clone())),
            Some(_) => {
                state.sessions.remove(&session_id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete_session(&self, session_id: SessionId) -> Result<(), Error> {
        self.state.lock().sessions.remove(&session_id);
        Ok(())
    }

    async fn generate_session_id(&self) -> Result<SessionId, Error> {
        let mut state = self.state.lock();
        state.last_session_id += 1;
        Ok(state.last_session_id)
    }
}
