// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::net::SocketAddr;
use std::process;
use std::sync::Arc;

use anyhow::Context;
use axum::http::StatusCode;
use axum::routing;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use rds_operator::controller::cluster::{self, ClusterControllerArgs};
use rds_operator::metrics::Metrics;
use rds_ore::cli::{self, CliConfig};
use rds_ore::metrics::MetricsRegistry;
use rds_ore::tracing::TracingCliArgs;

/// Manages MySQL InnoDB clusters.
#[derive(clap::Parser)]
#[clap(name = "rds-operator", version = rds_resources::VERSION)]
struct Args {
    /// Only manage clusters in this namespace. All namespaces are managed
    /// when unset.
    #[clap(long, env = "NAMESPACE")]
    namespace: Option<String>,
    /// The address of the internal HTTP server.
    #[clap(
        long,
        env = "INTERNAL_HTTP_LISTEN_ADDR",
        value_name = "HOST:PORT",
        default_value = "0.0.0.0:8080"
    )]
    internal_http_listen_addr: SocketAddr,

    #[clap(flatten)]
    controller: ClusterControllerArgs,

    #[clap(flatten)]
    tracing: TracingCliArgs,
}

#[tokio::main]
async fn main() {
    let args = cli::parse_args(CliConfig {
        env_prefix: Some("RDS_OPERATOR_"),
        enable_version_flag: true,
    });
    if let Err(err) = run(args).await {
        eprintln!("rds-operator: fatal: {:#}", err);
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), anyhow::Error> {
    rds_ore::tracing::configure(args.tracing.to_config("rds-operator"))?;

    let client = kube::Client::try_default()
        .await
        .context("loading kubernetes client configuration")?;

    let metrics_registry = MetricsRegistry::new();
    let metrics = Arc::new(Metrics::register_into(&metrics_registry));

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    info!(
        "serving internal HTTP server on {}",
        args.internal_http_listen_addr
    );
    let listener = tokio::net::TcpListener::bind(args.internal_http_listen_addr)
        .await
        .with_context(|| format!("binding {}", args.internal_http_listen_addr))?;
    let router = axum::Router::new()
        .route("/api/livez", routing::get(|| async { "ok" }))
        .route("/api/readyz", routing::get(|| async { "ok" }))
        .route(
            "/metrics",
            routing::get(move || async move {
                metrics_registry
                    .render()
                    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
            }),
        );
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            let server = axum::serve(listener, router)
                .with_graceful_shutdown(cancel.cancelled_owned());
            if let Err(e) = server.await {
                warn!("internal HTTP server failed: {}", e);
            }
        }
    });

    cluster::run(client, args.namespace, args.controller, metrics, cancel).await
}

async fn shutdown_on_signal(cancel: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!("unable to listen for SIGTERM: {}", e);
                let _ = ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
    info!("shutting down");
    cancel.cancel();
}
