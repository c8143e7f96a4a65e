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

use std::env;
use std::sync::OnceLock;

use sandpool_error::{Code, Error, make_err};
use tracing::metadata::LevelFilter;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::prelude::__tracing_subscriber_SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, registry};

// Note that `EnvFilter` doesn't implement `clone`, so a new one is built on
// every call.
fn stdout_filter() -> EnvFilter {
    let mut filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    // Transport crates are chatty at debug level and drown out pool events.
    for directive in ["hyper=off", "h2=off", "tower=off", "fred=warn", "bollard=warn"] {
        if let Ok(directive) = directive.parse::<Directive>() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}

// Create a tracing layer intended for stdout printing.
//
// The output of this layer is configurable via the `SANDPOOL_LOG` environment
// variable.
fn tracing_stdout_layer() -> Box<dyn Layer<Registry> + Send + Sync> {
    let log_fmt = env::var("SANDPOOL_LOG").unwrap_or_else(|_| "pretty".to_string());

    match log_fmt.as_str() {
        "compact" => fmt::layer()
            .compact()
            .with_timer(fmt::time::time())
            .with_filter(stdout_filter())
            .boxed(),
        "json" => fmt::layer()
            .json()
            .with_timer(fmt::time::time())
            .with_filter(stdout_filter())
            .boxed(),
        _ => fmt::layer()
            .pretty()
            .with_timer(fmt::time::time())
            .with_filter(stdout_filter())
            .boxed(),
    }
}

/// Initialize the global tracing subscriber.
///
/// # Errors
///
/// Returns `Err` if logging was already initialized.
pub fn init_tracing() -> Result<(), Error> {
    static INITIALIZED: OnceLock<()> = OnceLock::new();

    if INITIALIZED.get().is_some() {
        return Err(make_err!(Code::Internal, "Logging already initialized"));
    }

    registry()
        .with(tracing_stdout_layer())
        .try_init()
        .map_err(|e| make_err!(Code::Internal, "Failed to install subscriber: {e}"))?;

    INITIALIZED.get_or_init(|| ());
    Ok(())
}
