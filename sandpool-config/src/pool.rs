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

use serde::{Deserialize, Serialize};

use crate::retry::Retry;
use crate::serde_utils::{
    convert_numeric_with_shellexpand, convert_optional_numeric_with_shellexpand,
    convert_optional_string_with_shellexpand, convert_string_map_with_shellexpand,
    convert_string_with_shellexpand,
};

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct PoolSpec {
    /// How to reach the docker engine.
    #[serde(default)]
    pub docker: DockerSpec,

    /// Docker network every managed container joins. Also part of the
    /// state store namespace so pools on different networks never share
    /// bookkeeping.
    #[serde(deserialize_with = "convert_string_with_shellexpand")]
    pub network_name: String,

    /// Container templates keyed by subtype name.
    pub subtypes: HashMap<String, SubtypeSpec>,

    /// Optional landing container that receives the URL of every other
    /// container allocated for the session.
    #[serde(default)]
    pub homepage: Option<HomepageSpec>,

    /// Period of the reclamation sweep.
    ///
    /// Default: 10
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub background_interval_s: u64,

    /// Time to live of the lock that guards the reclamation sweep.
    ///
    /// Default: 120
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub background_lock_ttl_s: u64,

    /// Time to live of the per-subtype allocation lock.
    ///
    /// Default: 10
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub allocation_lock_ttl_s: u64,

    /// How hard to try acquiring the allocation lock before giving up with
    /// `ResourceExhausted`.
    ///
    /// Default: 100 retries, 0.1s delay, 0.5 jitter
    #[serde(default)]
    pub lock_retry: Option<Retry>,

    /// Interval between two health polls while a session starts.
    ///
    /// Default: 1000
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub health_poll_interval_ms: u64,

    /// Upper bound for the whole health wait of a session.
    ///
    /// Default: 300
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub health_timeout_s: u64,

    /// How many containers one shared allocation may create before giving
    /// up with `ResourceExhausted`.
    ///
    /// Default: 8
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub max_allocation_attempts: usize,

    /// Bound on pulling a missing image.
    ///
    /// Default: 120
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub image_pull_timeout_s: u64,

    /// Retry policy for engine calls that may be repeated safely. Only
    /// `Unavailable` and `DeadlineExceeded` are retried unless
    /// `retry_on_errors` says otherwise.
    ///
    /// Default: 1 retry, no delay
    #[serde(default)]
    pub engine_retry: Option<Retry>,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct DockerSpec {
    /// Engine address. `unix://` paths, `http://` and `https://` URLs are
    /// accepted. When unset the local defaults (`DOCKER_HOST` or the
    /// standard socket) are used.
    #[serde(default, deserialize_with = "convert_optional_string_with_shellexpand")]
    pub host: Option<String>,

    /// Request timeout for engine calls.
    ///
    /// Default: 120
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub timeout_s: u64,

    /// Client certificates. Required for `https://` hosts.
    #[serde(default)]
    pub tls: Option<DockerTlsSpec>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct DockerTlsSpec {
    #[serde(deserialize_with = "convert_string_with_shellexpand")]
    pub key_file: String,
    #[serde(deserialize_with = "convert_string_with_shellexpand")]
    pub cert_file: String,
    #[serde(deserialize_with = "convert_string_with_shellexpand")]
    pub ca_file: String,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct SubtypeSpec {
    /// Image reference, pulled on first use if missing.
    #[serde(deserialize_with = "convert_string_with_shellexpand")]
    pub image: String,

    /// Lifetime number of sessions a container may serve. 1 means every
    /// session gets a fresh exclusive container, 0 means unlimited.
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub reuse_limit: u64,

    /// Number of sessions a shared container may serve at once. 0 means
    /// unlimited.
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub concurrency_limit: u64,

    /// Port the container serves on inside the network. Used to build the
    /// URL handed back to the session.
    #[serde(default, deserialize_with = "convert_optional_numeric_with_shellexpand")]
    pub service_port: Option<u16>,

    /// Extra environment passed to every container of this subtype.
    #[serde(default, deserialize_with = "convert_string_map_with_shellexpand")]
    pub env: HashMap<String, String>,

    /// Overrides the image command.
    #[serde(default)]
    pub cmd: Option<Vec<String>>,
}

impl SubtypeSpec {
    /// Whether every session gets its own container that is destroyed
    /// afterwards.
    pub const fn is_exclusive(&self, immutable: bool) -> bool {
        self.reuse_limit == 1 || (self.reuse_limit != 0 && !immutable)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct HomepageSpec {
    /// Subtype used for the homepage container. Must be present in
    /// `subtypes`.
    #[serde(deserialize_with = "convert_string_with_shellexpand")]
    pub subtype: String,

    /// Maps an allocated subtype to the environment variable its URL is
    /// exported under. Subtypes missing here are exported as
    /// `<SUBTYPE>_URL`.
    #[serde(default)]
    pub url_env: HashMap<String, String>,
}
