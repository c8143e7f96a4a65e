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
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use regex::bytes::Regex;
use sandpool_error::{Code, Error, ResultExt, make_err};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::engine::ShellStream;

/// A chunk ending in this pattern means the shell is waiting for input.
pub const SHELL_PROMPT_PATTERN: &str = r"[#$] $";

/// Command used for persistent shells.
pub const DEFAULT_SHELL: &[&str] = &["/bin/bash", "--login"];

/// Bound on waiting for the first prompt after the shell starts.
pub const INITIAL_PROMPT_TIMEOUT: Duration = Duration::from_secs(5);

/// A long lived shell that runs one command at a time.
#[async_trait]
pub trait InteractiveShell: Send {
    /// Sends `command` and returns what the shell printed up to and
    /// including the next prompt.
    async fn run(&mut self, command: &str, timeout: Duration) -> Result<Bytes, Error>;

    async fn close(&mut self);
}

/// Frames a tty shell by its prompt.
///
/// Framing is chunk based. The first chunk after a command is taken to be
/// the terminal echo and dropped, and reading stops at the first chunk that
/// ends in a prompt.
pub struct PromptShell {
    stream: ShellStream,
    prompt: Regex,
}

impl core::fmt::Debug for PromptShell {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PromptShell")
            .field("prompt", &self.prompt.as_str())
            .finish_non_exhaustive()
    }
}

impl PromptShell {
    /// Wraps `stream` and consumes the banner up to the first prompt.
    pub async fn open(stream: ShellStream, initial_timeout: Duration) -> Result<Self, Error> {
        let prompt = Regex::new(SHELL_PROMPT_PATTERN)
            .map_err(|e| make_err!(Code::Internal, "Bad prompt pattern: {e}"))?;
        let mut shell = Self { stream, prompt };
        tokio::time::timeout(initial_timeout, shell.read_until_prompt(false))
            .await
            .map_err(|_| {
                make_err!(
                    Code::DeadlineExceeded,
                    "No shell prompt within {initial_timeout:?}"
                )
            })??;
        Ok(shell)
    }

    async fn read_until_prompt(&mut self, skip_echo: bool) -> Result<Bytes, Error> {
        let mut data = BytesMut::new();
        let mut skipping = skip_echo;
        while let Some(chunk) = self.stream.output.next().await {
            let chunk = chunk.err_tip(|| "While reading shell output")?;
            if skipping {
                skipping = false;
            } else {
                data.extend_from_slice(&chunk);
            }
            if self.prompt.is_match(&chunk) {
                return Ok(data.freeze());
            }
        }
        debug!("Shell output ended before a prompt");
        Ok(data.freeze())
    }
}

#[async_trait]
impl InteractiveShell for PromptShell {
    async fn run(&mut self, command: &str, timeout: Duration) -> Result<Bytes, Error> {
        let exchange = async {
            self.stream
                .input
                .write_all(format!("{command}\n").as_bytes())
                .await
                .err_tip(|| "While writing to shell")?;
            self.stream.input.flush().await?;
            self.read_until_prompt(true).await
        };
        tokio::time::timeout(timeout, exchange).await.map_err(|_| {
            make_err!(
                Code::DeadlineExceeded,
                "Shell command timed out after {timeout:?}"
            )
        })?
    }

    async fn close(&mut self) {
        if let Err(err) = self.stream.input.shutdown().await {
            debug!(?err, "Failed to close shell input");
        }
    }
}
