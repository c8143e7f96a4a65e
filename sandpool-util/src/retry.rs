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
use core::time::Duration;
use std::sync::Arc;

use futures::future::Future;
use futures::stream::StreamExt;
use sandpool_config::retry::{ErrorCode, Retry};
use sandpool_error::{Code, Error, make_err};
use tracing::debug;

struct ExponentialBackoff {
    current: Duration,
}

impl ExponentialBackoff {
    const fn new(base: Duration) -> Self {
        Self { current: base }
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        self.current *= 2;
        Some(self.current)
    }
}

pub type SleepFn = Arc<dyn Fn(Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> + Sync + Send>;
pub type JitterFn = Arc<dyn Fn(Duration) -> Duration + Send + Sync>;

#[derive(PartialEq, Eq, Debug)]
pub enum RetryResult<T> {
    Ok(T),
    Retry(Error),
    Err(Error),
}

/// Class used to retry a job with a sleep function in between each retry.
#[derive(Clone)]
pub struct Retrier {
    sleep_fn: SleepFn,
    jitter_fn: JitterFn,
    config: Retry,
}

fn to_error_code(code: Code) -> Option<ErrorCode> {
    Some(match code {
        Code::Cancelled => ErrorCode::Cancelled,
        Code::Unknown => ErrorCode::Unknown,
        Code::InvalidArgument => ErrorCode::InvalidArgument,
        Code::DeadlineExceeded => ErrorCode::DeadlineExceeded,
        Code::NotFound => ErrorCode::NotFound,
        Code::AlreadyExists => ErrorCode::AlreadyExists,
        Code::PermissionDenied => ErrorCode::PermissionDenied,
        Code::ResourceExhausted => ErrorCode::ResourceExhausted,
        Code::FailedPrecondition => ErrorCode::FailedPrecondition,
        Code::Aborted => ErrorCode::Aborted,
        Code::OutOfRange => ErrorCode::OutOfRange,
        Code::Unimplemented => ErrorCode::Unimplemented,
        Code::Internal => ErrorCode::Internal,
        Code::Unavailable => ErrorCode::Unavailable,
        Code::DataLoss => ErrorCode::DataLoss,
        Code::Unauthenticated => ErrorCode::Unauthenticated,
        _ => return None,
    })
}

impl Retrier {
    pub fn new(sleep_fn: SleepFn, jitter_fn: JitterFn, config: Retry) -> Self {
        Self {
            sleep_fn,
            jitter_fn,
            config,
        }
    }

    /// Builds a retrier that sleeps on the tokio clock and applies the
    /// configured jitter.
    pub fn from_config(config: Retry) -> Self {
        let jitter_fn = config.make_jitter_fn();
        Self::new(
            Arc::new(|duration| Box::pin(tokio::time::sleep(duration))),
            jitter_fn,
            config,
        )
    }

    /// This should only return true if the error code should be interpreted as
    /// temporary.
    fn should_retry(&self, code: Code) -> bool {
        if code == Code::Ok {
            false
        } else if let Some(retry_codes) = &self.config.retry_on_errors {
            to_error_code(code).is_some_and(|code| retry_codes.contains(&code))
        } else {
            !matches!(
                code,
                Code::InvalidArgument
                    | Code::FailedPrecondition
                    | Code::OutOfRange
                    | Code::Unimplemented
                    | Code::NotFound
                    | Code::AlreadyExists
                    | Code::PermissionDenied
                    | Code::Unauthenticated
            )
        }
    }

    fn get_retry_config(&self) -> impl Iterator<Item = Duration> + '_ {
        ExponentialBackoff::new(Duration::from_secs_f32(self.config.delay.max(0.)))
            .map(|d| (self.jitter_fn)(d))
            // Remember this is number of retries, so will run max_retries + 1.
            .take(self.config.max_retries)
    }

    pub fn retry<'a, T, Fut>(
        &'a self,
        operation: Fut,
    ) -> Pin<Box<dyn Future<Output = Result<T, Error>> + 'a + Send>>
    where
        Fut: futures::stream::Stream<Item = RetryResult<T>> + Send + 'a,
        T: Send,
    {
        Box::pin(async move {
            let mut iter = self.get_retry_config();
            let mut operation = Box::pin(operation);
            let mut attempt = 0;
            loop {
                attempt += 1;
                match operation.next().await {
                    None => {
                        return Err(make_err!(
                            Code::Internal,
                            "Retry stream ended abruptly on attempt {attempt}",
                        ));
                    }
                    Some(RetryResult::Ok(value)) => return Ok(value),
                    Some(RetryResult::Err(e)) => {
                        return Err(e.append(format!("On attempt {attempt}")));
                    }
                    Some(RetryResult::Retry(e)) => {
                        if !self.should_retry(e.code) {
                            debug!(attempt, ?e, "Not retrying permanent error");
                            return Err(e);
                        }
                        let delay = iter
                            .next()
                            .ok_or_else(|| e.clone().append(format!("On attempt {attempt}")))?;
                        (self.sleep_fn)(delay).await;
                    }
                }
            }
        })
    }
}
