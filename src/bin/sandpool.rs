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
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use clap::Parser;
use hyper_util::rt::tokio::TokioIo;
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use mimalloc::MiMalloc;
use sandpool_config::server::SandpoolConfig;
use sandpool_config::state::StateSpec;
use sandpool_error::{Error, ResultExt, make_input_err};
use sandpool_pool::{DockerEngine, EnvironmentPool};
use sandpool_service::router;
use sandpool_state::keys::KeySpace;
use sandpool_state::{MemoryStateStore, RedisStateStore, StateStore};
use sandpool_util::task::TaskExecutor;
use sandpool_util::{background_spawn, init_tracing, spawn};
use sandpool_worker::{ControllerClient, HttpControllerClient, ShellTask, TaskWorker};
use tokio::net::TcpListener;
use tokio::select;
#[cfg(target_family = "unix")]
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Task worker serving sandboxed samples out of a pool of containers.
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Args {
    /// Config file to use.
    #[clap(value_parser)]
    config_file: String,
}

async fn build_state(cfg: &SandpoolConfig) -> Result<Arc<dyn StateStore>, Error> {
    let session_expiry = Duration::from_secs(cfg.state.session_expiry_s());
    let namespace = KeySpace::default_namespace(&cfg.task.name, &cfg.pool.network_name);
    Ok(match &cfg.state {
        StateSpec::Redis(spec) => Arc::new(
            RedisStateStore::new(spec, namespace, session_expiry)
                .await
                .err_tip(|| "While creating redis state store")?,
        ),
        StateSpec::Memory(_) => Arc::new(MemoryStateStore::new(session_expiry)),
    })
}

async fn serve(listener: TcpListener, app: Router) -> Result<(), Error> {
    let http = auto::Builder::new(TaskExecutor::default());
    loop {
        let (tcp_stream, remote_addr) = match listener.accept().await {
            Ok(connection) => connection,
            Err(err) => {
                error!(?err, "Failed to accept tcp connection");
                continue;
            }
        };
        let (http, svc) = (http.clone(), app.clone());
        background_spawn!(
            "http_connection",
            async move {
                if let Err(err) = http
                    .serve_connection(TokioIo::new(tcp_stream), TowerToHyperService::new(svc))
                    .await
                {
                    error!(?err, "Failed running service");
                }
            },
            ?remote_addr
        );
    }
}

#[cfg(target_family = "unix")]
async fn shutdown_signal() -> Result<&'static str, Error> {
    let mut terminate = signal(SignalKind::terminate()).err_tip(|| "Failed to listen to SIGTERM")?;
    select! {
        result = tokio::signal::ctrl_c() => {
            result.err_tip(|| "Failed to listen to SIGINT")?;
            Ok("SIGINT")
        }
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(target_family = "unix"))]
async fn shutdown_signal() -> Result<&'static str, Error> {
    tokio::signal::ctrl_c()
        .await
        .err_tip(|| "Failed to listen to SIGINT")?;
    Ok("SIGINT")
}

async fn inner_main(cfg: SandpoolConfig) -> Result<(), Error> {
    let state = build_state(&cfg).await?;
    let engine = Arc::new(DockerEngine::new(cfg.pool.docker.clone()));
    let pool = EnvironmentPool::new(cfg.task.name.clone(), cfg.pool, engine, state, None)
        .err_tip(|| "While creating environment pool")?;

    let controller = cfg.worker.controller_address.as_deref().map(|address| {
        let client: Arc<dyn ControllerClient> = Arc::new(HttpControllerClient::new(address));
        client
    });
    let self_address = cfg
        .worker
        .self_address
        .clone()
        .or_else(|| Some(cfg.worker.listen_address.clone()));
    let task = Arc::new(ShellTask::new(cfg.task, pool.clone()));
    let worker = TaskWorker::new(
        task,
        controller,
        self_address,
        Duration::from_secs(cfg.worker.heart_rate_s),
    );

    let background_pool = pool.clone();
    let _pool_task = spawn!("pool_background_task", async move {
        background_pool.background_task().await;
    });
    let heart_worker = worker.clone();
    let _heart_beat = spawn!("heart_beat", async move {
        heart_worker.heart_beat().await;
    });

    let socket_addr = cfg
        .worker
        .listen_address
        .parse::<SocketAddr>()
        .map_err(|e| make_input_err!("Invalid address '{}' - {e:?}", cfg.worker.listen_address))?;
    let listener = TcpListener::bind(&socket_addr).await?;
    info!(%socket_addr, worker_id = worker.worker_id(), "Ready, listening");

    select! {
        result = serve(listener, router(worker.clone())) => result,
        signal = shutdown_signal() => {
            let signal = signal?;
            warn!(signal, "Shutting down");
            worker.shutdown().await;
            info!("Successfully shut down sandpool");
            Ok(())
        }
    }
}

fn get_config() -> Result<SandpoolConfig, Box<dyn core::error::Error>> {
    let args = Args::parse();
    let json_contents = String::from_utf8(
        std::fs::read(&args.config_file)
            .err_tip(|| format!("Could not open config file {}", args.config_file))?,
    )?;
    Ok(serde_json5::from_str(&json_contents)?)
}

fn main() -> Result<(), Box<dyn core::error::Error>> {
    init_tracing()?;
    let cfg = get_config()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime
        .block_on(inner_main(cfg))
        .err_tip(|| "main() function failed")?;
    Ok(())
}
