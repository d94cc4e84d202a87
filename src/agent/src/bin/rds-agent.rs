// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use rds_agent::health::{self, Health};
use rds_agent::instance::Instance;
use rds_agent::manager::{self, LocalClusterManager, RecoveryMethod};
use rds_agent::metrics::Metrics;
use rds_agent::registry::KubeRegistry;
use rds_mysqlsh::MySqlShell;
use rds_ore::cli::{self, CliConfig};
use rds_ore::metrics::MetricsRegistry;
use rds_ore::tracing::TracingCliArgs;

/// Drives a MySQL instance into its InnoDB cluster.
#[derive(clap::Parser)]
#[clap(name = "rds-agent", version = rds_resources::VERSION)]
struct Args {
    // === Identity options. ===
    /// The name of the cluster the instance belongs to.
    #[clap(long)]
    cluster_name: String,
    #[clap(long)]
    namespace: String,
    /// The name of the pod the agent runs in, `<cluster>-<ordinal>`.
    #[clap(long)]
    pod_name: String,

    // === MySQL options. ===
    #[clap(long, default_value = "3306")]
    mysql_port: u16,
    #[clap(long, env = "MYSQL_ROOT_PASSWORD", hide_env_values = true)]
    root_password: String,
    /// The MySQL Shell binary.
    #[clap(long, default_value = "mysqlsh")]
    mysqlsh: PathBuf,
    /// How long a single administration command may take.
    #[clap(long, value_parser = humantime::parse_duration, default_value = "60s")]
    shell_timeout: Duration,

    // === Membership options. ===
    /// Whether every member of the group accepts writes.
    #[clap(long)]
    multi_primary: bool,
    /// Whether group communication is encrypted.
    #[clap(long)]
    ssl_enabled: bool,
    #[clap(long, value_enum)]
    recovery_method: Option<RecoveryMethod>,
    /// Hosts allowed to connect for group communication.
    #[clap(long)]
    ip_allowlist: Option<String>,
    #[clap(long, value_parser = humantime::parse_duration, default_value = "10s")]
    sync_interval: Duration,
    /// The delay between sync attempts until the instance first joins.
    #[clap(long, value_parser = humantime::parse_duration, default_value = "10s")]
    startup_retry_delay: Duration,
    #[clap(long, default_value = "5")]
    max_bootstrap_attempts: usize,
    #[clap(long, default_value = "6")]
    max_engine_failures: usize,

    /// The address of the health check and metrics server.
    #[clap(long, value_name = "HOST:PORT", default_value = "0.0.0.0:10512")]
    healthcheck_addr: SocketAddr,

    #[clap(flatten)]
    tracing: TracingCliArgs,
}

#[tokio::main]
async fn main() {
    let args = cli::parse_args(CliConfig {
        env_prefix: Some("RDS_AGENT_"),
        enable_version_flag: true,
    });
    if let Err(err) = run(args).await {
        eprintln!("rds-agent: fatal: {:#}", err);
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), anyhow::Error> {
    rds_ore::tracing::configure(args.tracing.to_config("rds-agent"))?;

    let instance = Instance::from_pod_name(
        &args.cluster_name,
        &args.namespace,
        &args.pod_name,
        args.mysql_port,
    )?;
    let client = kube::Client::try_default()
        .await
        .context("loading kubernetes client configuration")?;

    let metrics_registry = MetricsRegistry::new();
    let metrics = Metrics::register_into(&metrics_registry);
    let health = Arc::new(Health::default());

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    info!("serving health checks on {}", args.healthcheck_addr);
    let listener = tokio::net::TcpListener::bind(args.healthcheck_addr)
        .await
        .with_context(|| format!("binding {}", args.healthcheck_addr))?;
    tokio::spawn({
        let router = health::router(Arc::clone(&health), metrics_registry);
        let cancel = cancel.clone();
        async move {
            let server = axum::serve(listener, router)
                .with_graceful_shutdown(cancel.cancelled_owned());
            if let Err(e) = server.await {
                warn!("health check server failed: {}", e);
            }
        }
    });

    let shell = MySqlShell::new(
        args.mysqlsh,
        "root".into(),
        args.root_password,
        args.shell_timeout,
    );
    let config = manager::Config {
        multi_primary: args.multi_primary,
        ssl_enabled: args.ssl_enabled,
        recovery_method: args.recovery_method,
        ip_allowlist: args.ip_allowlist,
        max_bootstrap_attempts: args.max_bootstrap_attempts,
        max_engine_failures: args.max_engine_failures,
    };
    let mut manager = LocalClusterManager::new(
        instance.clone(),
        config,
        Arc::new(shell),
        Arc::new(KubeRegistry::new(client, instance)),
        health,
        metrics,
    );

    // Nothing else happens until the instance has a place in the group.
    let Some(role) = manager
        .sync_until_joined(args.startup_retry_delay, &cancel)
        .await
    else {
        return Ok(());
    };
    info!(%role, "instance joined its group");

    manager.run(args.sync_interval, cancel).await;
    Ok(())
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
