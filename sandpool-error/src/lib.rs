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

//! Shared error type for every sandpool crate.
//!
//! Errors carry a [`Code`] that decides both retry behavior (Redis and
//! Docker calls) and the HTTP status the worker API answers with, plus a
//! stack of context messages added as the error travels up.

use core::fmt;

/// Builds an [`Error`] from a code and a format string.
#[macro_export]
macro_rules! make_err {
    ($code:expr, $($arg:tt)+) => {{
        $crate::Error::new(
            $code,
            format!("{}", format_args!($($arg)+)),
        )
    }};
}

#[macro_export]
macro_rules! make_input_err {
    ($($arg:tt)+) => {{
        $crate::make_err!($crate::Code::InvalidArgument, $($arg)+)
    }};
}

#[macro_export]
macro_rules! error_if {
    ($cond:expr, $($arg:tt)+) => {{
        if $cond {
            Err($crate::make_err!($crate::Code::InvalidArgument, $($arg)+))?;
        }
    }};
}

const MESSAGE_JOINER: &str = " : ";

/// Marks where a second, independent failure starts in a merged error.
const MERGE_SEPARATOR: &str = "---";

#[derive(Debug, Eq, PartialEq, Clone)]
pub struct Error {
    pub code: Code,
    /// Innermost context first.
    pub messages: Vec<String>,
}

impl Error {
    pub fn new(code: Code, msg: String) -> Self {
        let messages = if msg.is_empty() { Vec::new() } else { vec![msg] };
        Self { code, messages }
    }

    #[must_use]
    pub const fn set_code(mut self, code: Code) -> Self {
        self.code = code;
        self
    }

    #[inline]
    #[must_use]
    pub fn append<S: ToString>(mut self, msg: S) -> Self {
        self.messages.push(msg.to_string());
        self
    }

    #[must_use]
    pub fn merge<E: Into<Self>>(mut self, other: E) -> Self {
        let other: Self = other.into();
        self.messages.push(MERGE_SEPARATOR.to_owned());
        self.messages.extend(other.messages);
        self
    }

    /// Folds an optional follow-up failure into an optional first one.
    /// Used when releasing several containers where each may fail.
    #[must_use]
    pub fn merge_option<T: Into<Self>, U: Into<Self>>(
        first: Option<T>,
        then: Option<U>,
    ) -> Option<Self> {
        match (first, then) {
            (Some(first), Some(then)) => Some(first.into().merge(then)),
            (Some(first), None) => Some(first.into()),
            (None, then) => then.map(Into::into),
        }
    }

    /// The messages joined for an API `detail` field or a task error.
    pub fn message_string(&self) -> String {
        self.messages.join(MESSAGE_JOINER)
    }
}

impl core::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.code)?;
        if !self.messages.is_empty() {
            write!(f, ": {}", self.message_string())?;
        }
        Ok(())
    }
}

impl serde::de::Error for Error {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        make_input_err!("{msg}")
    }
}

impl serde::ser::Error for Error {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        make_input_err!("{msg}")
    }
}

impl From<core::num::TryFromIntError> for Error {
    fn from(err: core::num::TryFromIntError) -> Self {
        make_err!(Code::InvalidArgument, "{err}")
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            return make_err!(Code::Cancelled, "{err}");
        }
        make_err!(Code::Internal, "{err}")
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        make_err!(Code::DeadlineExceeded, "{err}")
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        make_err!(Code::InvalidArgument, "{err}")
    }
}

impl From<serde_json5::Error> for Error {
    fn from(err: serde_json5::Error) -> Self {
        make_err!(Code::InvalidArgument, "{err}")
    }
}

impl From<fred::error::Error> for Error {
    fn from(err: fred::error::Error) -> Self {
        use fred::error::ErrorKind;
        let code = match err.kind() {
            ErrorKind::IO | ErrorKind::Canceled | ErrorKind::Backpressure => Code::Unavailable,
            ErrorKind::Timeout => Code::DeadlineExceeded,
            ErrorKind::NotFound => Code::NotFound,
            ErrorKind::Config
            | ErrorKind::Url
            | ErrorKind::InvalidArgument
            | ErrorKind::InvalidCommand => Code::InvalidArgument,
            ErrorKind::Auth => Code::PermissionDenied,
            _ => Code::Internal,
        };
        make_err!(code, "Redis Error: {err}")
    }
}

impl From<hyper_util::client::legacy::Error> for Error {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        make_err!(Code::Unavailable, "{err}")
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::new(err.kind().into(), err.to_string())
    }
}

impl From<Code> for Error {
    fn from(code: Code) -> Self {
        Self::new(code, String::new())
    }
}

/// Attaches context to a failing `Result` or an empty `Option`.
pub trait ResultExt<T> {
    fn err_tip_with_code<F, S>(self, tip_fn: F) -> Result<T, Error>
    where
        Self: Sized,
        S: ToString,
        F: (FnOnce(&Error) -> (Code, S)) + Sized;

    #[inline]
    fn err_tip<F, S>(self, tip_fn: F) -> Result<T, Error>
    where
        Self: Sized,
        S: ToString,
        F: (FnOnce() -> S) + Sized,
    {
        self.err_tip_with_code(|e| (e.code, tip_fn()))
    }

    /// Keeps the first failure and appends the second one, if any.
    fn merge<U>(self, other: Result<U, Error>) -> Result<U, Error>
    where
        Self: Sized;
}

impl<T, E: Into<Error>> ResultExt<T> for Result<T, E> {
    #[inline]
    fn err_tip_with_code<F, S>(self, tip_fn: F) -> Result<T, Error>
    where
        Self: Sized,
        S: ToString,
        F: (FnOnce(&Error) -> (Code, S)) + Sized,
    {
        self.map_err(|err| {
            let err: Error = err.into();
            let (code, tip) = tip_fn(&err);
            err.set_code(code).append(tip)
        })
    }

    fn merge<U>(self, other: Result<U, Error>) -> Result<U, Error>
    where
        Self: Sized,
    {
        match (self, other) {
            (Err(first), Err(then)) => Err(first.into().merge(then)),
            (Err(first), Ok(_)) => Err(first.into()),
            (Ok(_), other) => other,
        }
    }
}

impl<T> ResultExt<T> for Option<T> {
    #[inline]
    fn err_tip_with_code<F, S>(self, tip_fn: F) -> Result<T, Error>
    where
        Self: Sized,
        S: ToString,
        F: (FnOnce(&Error) -> (Code, S)) + Sized,
    {
        self.ok_or_else(|| {
            let missing = Error::new(Code::Internal, String::new());
            let (code, message) = tip_fn(&missing);
            missing.set_code(code).append(message)
        })
    }

    fn merge<U>(self, other: Result<U, Error>) -> Result<U, Error>
    where
        Self: Sized,
    {
        match (self, other) {
            (Some(_), other) => other,
            (None, Err(then)) => Err(Error::from(Code::Internal).merge(then)),
            (None, Ok(_)) => Err(Code::Internal.into()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Code {
    Ok,
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
    // NOTE: Additional codes must be added to sandpool-config's ErrorCode too.
}

/// Socket failures against Redis, Docker or the controller are treated as
/// transient so retry policies pick them up.
impl From<std::io::ErrorKind> for Code {
    fn from(kind: std::io::ErrorKind) -> Self {
        use std::io::ErrorKind as Io;
        match kind {
            Io::NotFound => Self::NotFound,
            Io::AlreadyExists => Self::AlreadyExists,
            Io::PermissionDenied => Self::PermissionDenied,
            Io::TimedOut => Self::DeadlineExceeded,
            Io::InvalidInput | Io::InvalidData => Self::InvalidArgument,
            Io::Interrupted => Self::Aborted,
            Io::ConnectionRefused
            | Io::ConnectionReset
            | Io::ConnectionAborted
            | Io::NotConnected
            | Io::BrokenPipe => Self::Unavailable,
            Io::Other | Io::UnexpectedEof | Io::WriteZero => Self::Internal,
            _ => Self::Unknown,
        }
    }
}
