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

use std::io;

use fred::error::{Error as RedisError, ErrorKind as RedisErrorKind};
use pretty_assertions::assert_eq;
use sandpool_error::{Code, Error, ResultExt, error_if, make_err, make_input_err};

#[test]
fn redis_io_error_is_transient() {
    let error: Error = RedisError::new(RedisErrorKind::IO, "connection reset").into();
    assert_eq!(error.code, Code::Unavailable);
    assert!(error.messages[0].contains("connection reset"));
}

#[test]
fn redis_timeout_maps_to_deadline_exceeded() {
    let error: Error = RedisError::new(RedisErrorKind::Timeout, "timed out").into();
    assert_eq!(error.code, Code::DeadlineExceeded);
}

#[test]
fn redis_auth_maps_to_permission_denied() {
    let error: Error = RedisError::new(RedisErrorKind::Auth, "WRONGPASS").into();
    assert_eq!(error.code, Code::PermissionDenied);
}

#[test]
fn redis_url_error_is_invalid_argument() {
    let error: Error = RedisError::new(RedisErrorKind::Url, "bad scheme").into();
    assert_eq!(error.code, Code::InvalidArgument);
}

#[tokio::test]
async fn panicking_task_is_internal() {
    let join_error = tokio::spawn(async { panic!("sample exploded") })
        .await
        .unwrap_err();
    let error: Error = join_error.into();
    assert_eq!(error.code, Code::Internal);
    assert!(error.messages[0].contains("sample exploded"));
}

#[tokio::test]
async fn aborted_task_is_cancelled() {
    let handle = tokio::spawn(core::future::pending::<()>());
    handle.abort();
    let error: Error = handle.await.unwrap_err().into();
    assert_eq!(error.code, Code::Cancelled);
}

#[tokio::test]
async fn elapsed_timeout_is_deadline_exceeded() {
    let elapsed = tokio::time::timeout(
        core::time::Duration::from_millis(1),
        core::future::pending::<()>(),
    )
    .await
    .unwrap_err();
    let error: Error = elapsed.into();
    assert_eq!(error.code, Code::DeadlineExceeded);
}

#[test]
fn serde_json_error_is_invalid_argument() {
    let error: Error = serde_json::from_str::<u64>("not a number")
        .unwrap_err()
        .into();
    assert_eq!(error.code, Code::InvalidArgument);
}

#[test]
fn io_error_keeps_kind() {
    let error: Error = io::Error::new(io::ErrorKind::ConnectionReset, "peer gone").into();
    assert_eq!(error.code, Code::Unavailable);
    assert_eq!(error.messages, vec!["peer gone".to_string()]);
}

#[test]
fn err_tip_appends_context() {
    let result: Result<(), Error> =
        Err(make_err!(Code::NotFound, "no container")).err_tip(|| "In delete_container");
    let error = result.unwrap_err();
    assert_eq!(error.code, Code::NotFound);
    assert_eq!(error.messages, vec!["no container", "In delete_container"]);
}

#[test]
fn err_tip_with_code_overrides_code() {
    let option: Option<u32> = None;
    let error = option
        .err_tip_with_code(|_| (Code::NotFound, "No such session"))
        .unwrap_err();
    assert_eq!(error.code, Code::NotFound);
    assert_eq!(error.messages, vec!["No such session"]);
}

#[test]
fn result_merge_keeps_both_messages() {
    let first: Result<(), Error> = Err(make_err!(Code::Internal, "release failed"));
    let second: Result<(), Error> = Err(make_err!(Code::Unavailable, "delete failed"));
    let error = first.merge(second).unwrap_err();
    assert_eq!(error.code, Code::Internal);
    assert_eq!(error.messages, vec!["release failed", "---", "delete failed"]);
}

#[test]
fn result_merge_passes_through_on_success() {
    let first: Result<(), Error> = Ok(());
    let second: Result<u32, Error> = Ok(7);
    assert_eq!(first.merge(second), Ok(7));
}

#[test]
fn error_if_returns_input_error() {
    fn check(value: u32) -> Result<(), Error> {
        error_if!(value == 0, "value must be positive");
        Ok(())
    }
    assert_eq!(check(1), Ok(()));
    assert_eq!(
        check(0),
        Err(make_input_err!("value must be positive"))
    );
}

#[test]
fn display_omits_empty_messages() {
    let error: Error = Code::Cancelled.into();
    assert_eq!(error.to_string(), "Cancelled");
}
