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
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::serde_utils::convert_numeric_with_shellexpand;

/// Config-side mirror of `sandpool_error::Code`, naming which failures of a
/// Docker or Redis call are worth another attempt.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

/// Exponential back off for engine and store calls.
///
/// Attempt `n` (counting the first retry as 1) waits `delay * 2^n` seconds,
/// scaled by a random factor in `1 +/- jitter / 2`. With `delay: 0.1` and
/// `jitter: 0.5` the first retry waits between 150ms and 250ms.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct Retry {
    /// Zero means a single attempt.
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub max_retries: usize,

    /// Base delay in seconds.
    #[serde(default)]
    pub delay: f32,

    /// Spread applied around each delay, as a fraction of it.
    #[serde(default)]
    pub jitter: f32,

    /// Codes that trigger a retry. When unset, every code except the
    /// permanent ones such as `InvalidArgument` or `NotFound` is retried.
    #[serde(default)]
    pub retry_on_errors: Option<Vec<ErrorCode>>,
}

impl Retry {
    pub fn make_jitter_fn(&self) -> Arc<dyn Fn(Duration) -> Duration + Send + Sync> {
        let jitter = self.jitter;
        if jitter == 0.0 {
            return Arc::new(|delay: Duration| delay);
        }
        Arc::new(move |delay: Duration| {
            let spread = rand::rng().random::<f32>() - 0.5;
            delay.mul_f32(jitter.mul_add(spread, 1.0))
        })
    }
}
