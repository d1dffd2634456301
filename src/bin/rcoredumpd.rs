// SPDX-FileCopyrightText: The rcoredump contributors
//
// SPDX-License-Identifier: GPL-3.0-only

//! The indexer binary: serves the HTTP API, runs the analysis/cleanup
//! dispatcher, and owns the store and search index.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tikv_jemallocator::Jemalloc;

use rcoredump::analyzer::Analyzer;
use rcoredump::config::{Cli, Config};
use rcoredump::dispatcher::Dispatcher;
use rcoredump::http::{self, AppState};
use rcoredump::log;
use rcoredump::metrics::Metrics;
use rcoredump::{index, store};

// Keeps RSS down across a long-running indexer repeatedly allocating and
// freeing tantivy segments and upload buffers.
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = match Config::resolve(cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {e:#}");
            return Ok(ExitCode::FAILURE);
        }
    };

    log::init(config.log_sink_kind.clone().into_sink()).context("initializing logging")?;

    if config.store_type != "fs" {
        tracing::error!(store_type = %config.store_type, "unknown store type");
        return Ok(ExitCode::FAILURE);
    }

    if let Err(e) = run(config).await {
        tracing::error!("{e:#}");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

async fn run(config: Config) -> anyhow::Result<()> {
    let store = store::Store::open(&config.data_dir)
        .await
        .context("opening store")?;
    let index = index::open(&config.index_type, &config.data_dir).context("opening index")?;
    let metrics = Arc::new(Metrics::new(&config.size_buckets).context("registering metrics")?);

    let analyzer = Arc::new(Analyzer::new(
        store.clone(),
        index.clone(),
        config.data_dir.clone(),
        config.go_analyzer.clone(),
        config.c_analyzer.clone(),
        metrics.clone(),
    ));
    let dispatcher = Arc::new(Dispatcher::start(
        store.clone(),
        index.clone(),
        analyzer,
        config.retention,
        metrics.clone(),
    ));

    let about = rcoredump::buildcfg::about();
    let state = AppState {
        store,
        index,
        dispatcher: dispatcher.clone(),
        metrics,
        indexer_version: about.version,
    };
    let app = http::router(state, std::path::PathBuf::from("assets"));

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    tracing::info!(bind = %config.bind, "rcoredumpd listening");

    // The grace period bounds how long a slow in-flight request can hold the
    // listener open after a shutdown signal; past it we move on and let the
    // OS reclaim the connections rather than hang forever.
    let serve = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    match tokio::time::timeout(Duration::from_secs(60), serve).await {
        Ok(result) => result.context("serving HTTP")?,
        Err(_) => tracing::warn!("graceful shutdown grace period elapsed, forcing exit"),
    }

    // Shutdown order per the design: drain the dispatcher's queues before
    // the store/index handles are dropped, so a worker never outlives what
    // it reads from.
    tracing::info!("draining dispatcher queues");
    match Arc::try_unwrap(dispatcher) {
        Ok(dispatcher) => dispatcher.shutdown().await,
        Err(_) => tracing::warn!("dispatcher still referenced at shutdown, skipping drain"),
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => tracing::warn!("failed to register SIGTERM handler: {e}"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
