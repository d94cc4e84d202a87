// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace};

use crate::status::ClusterStatus;
use crate::{Command, Options};

/// An error from an administration command.
#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    /// The target instance does not belong to an InnoDB cluster.
    #[error("{target} is not part of an InnoDB cluster")]
    NoCluster { target: String },
    /// The target holds cluster metadata but group replication is not
    /// running on it or any member it can reach.
    #[error("group replication is offline on {target}")]
    GroupOffline { target: String },
    #[error("{method} on {target} timed out after {timeout:?}")]
    Timeout {
        method: &'static str,
        target: String,
        timeout: Duration,
    },
    #[error("{method} on {target} failed: {message}")]
    Failed {
        method: &'static str,
        target: String,
        message: String,
    },
    #[error("unable to run mysqlsh: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("unable to decode cluster status: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Administration of the InnoDB cluster an instance belongs to.
///
/// `target` is always a `host:port` address. Calls are expected to run one
/// at a time per instance.
#[async_trait]
pub trait AdminShell: fmt::Debug + Send + Sync {
    /// Whether the MySQL server at `target` accepts connections.
    async fn is_engine_running(&self, target: &str) -> bool;

    /// Fetches the status report of `cluster` as seen by `target`.
    async fn cluster_status(&self, target: &str, cluster: &str)
        -> Result<ClusterStatus, ShellError>;

    /// Creates `cluster` with `target` as its first member.
    async fn create_cluster(
        &self,
        target: &str,
        cluster: &str,
        options: &Options,
    ) -> Result<(), ShellError>;

    /// Restarts group replication on `target` from existing cluster metadata,
    /// after every member went offline.
    async fn reboot_cluster_from_complete_outage(
        &self,
        target: &str,
        cluster: &str,
        options: &Options,
    ) -> Result<(), ShellError>;

    /// Adds `instance` to `cluster`, issued against the member at `target`.
    async fn add_instance(
        &self,
        target: &str,
        cluster: &str,
        instance: &str,
        options: &Options,
    ) -> Result<(), ShellError>;

    async fn rejoin_instance(
        &self,
        target: &str,
        cluster: &str,
        instance: &str,
        options: &Options,
    ) -> Result<(), ShellError>;

    async fn remove_instance(
        &self,
        target: &str,
        cluster: &str,
        instance: &str,
        options: &Options,
    ) -> Result<(), ShellError>;
}

/// Runs commands through the `mysqlsh` binary, one process per command.
///
/// The password is written to the process's standard input rather than
/// passed on the command line.
pub struct MySqlShell {
    binary: PathBuf,
    user: String,
    password: String,
    timeout: Duration,
}

impl fmt::Debug for MySqlShell {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MySqlShell")
            .field("binary", &self.binary)
            .field("user", &self.user)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl MySqlShell {
    pub fn new(binary: PathBuf, user: String, password: String, timeout: Duration) -> Self {
        MySqlShell {
            binary,
            user,
            password,
            timeout,
        }
    }

    /// Runs `command` against `target` and returns its standard output.
    ///
    /// The process is killed if it outlives the timeout. Nothing else
    /// interrupts it.
    async fn run(&self, target: &str, command: Command) -> Result<String, ShellError> {
        let method = command.method();
        let script = command.to_string();
        trace!(%target, %method, "running mysqlsh");
        let mut child = tokio::process::Command::new(&self.binary)
            .arg("--uri")
            .arg(format!("{}@{}", self.user, target))
            .arg("--passwords-from-stdin")
            .arg("--py")
            .arg("-e")
            .arg(&script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(self.password.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
        }
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(ShellError::Timeout {
                    method,
                    target: target.into(),
                    timeout: self.timeout,
                })
            }
        };
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            debug!(%target, %method, "mysqlsh succeeded");
            return Ok(stdout);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(classify(method, target, stderr.trim()))
    }
}

/// Maps the error text MySQL Shell prints to the error the agent acts on.
fn classify(method: &'static str, target: &str, message: &str) -> ShellError {
    let lower = message.to_lowercase();
    if lower.contains("standalone instance") || lower.contains("not part of an innodb cluster") {
        ShellError::NoCluster {
            target: target.into(),
        }
    } else if lower.contains("group replication is not active")
        || lower.contains("reboot_cluster_from_complete_outage")
        || lower.contains("all members of the group are offline")
    {
        ShellError::GroupOffline {
            target: target.into(),
        }
    } else {
        ShellError::Failed {
            method,
            target: target.into(),
            message: message.to_owned(),
        }
    }
}

#[async_trait]
impl AdminShell for MySqlShell {
    async fn is_engine_running(&self, target: &str) -> bool {
        match self.run(target, Command::Ping).await {
            Ok(_) => true,
            Err(e) => {
                debug!(%target, "engine is not accepting connections: {}", e);
                false
            }
        }
    }

    async fn cluster_status(
        &self,
        target: &str,
        cluster: &str,
    ) -> Result<ClusterStatus, ShellError> {
        let output = self
            .run(
                target,
                Command::Status {
                    cluster: cluster.into(),
                },
            )
            .await?;
        Ok(ClusterStatus::parse(&output)?)
    }

    async fn create_cluster(
        &self,
        target: &str,
        cluster: &str,
        options: &Options,
    ) -> Result<(), ShellError> {
        let command = Command::CreateCluster {
            cluster: cluster.into(),
            options: options.clone(),
        };
        self.run(target, command).await.map(|_| ())
    }

    async fn reboot_cluster_from_complete_outage(
        &self,
        target: &str,
        cluster: &str,
        options: &Options,
    ) -> Result<(), ShellError> {
        let command = Command::RebootClusterFromCompleteOutage {
            cluster: cluster.into(),
            options: options.clone(),
        };
        self.run(target, command).await.map(|_| ())
    }

    async fn add_instance(
        &self,
        target: &str,
        cluster: &str,
        instance: &str,
        options: &Options,
    ) -> Result<(), ShellError> {
        let command = Command::AddInstance {
            cluster: cluster.into(),
            instance: format!("{}@{}", self.user, instance),
            options: options.clone(),
        };
        self.run(target, command).await.map(|_| ())
    }

    async fn rejoin_instance(
        &self,
        target: &str,
        cluster: &str,
        instance: &str,
        options: &Options,
    ) -> Result<(), ShellError> {
        let command = Command::RejoinInstance {
            cluster: cluster.into(),
            instance: format!("{}@{}", self.user, instance),
            options: options.clone(),
        };
        self.run(target, command).await.map(|_| ())
    }

    async fn remove_instance(
        &self,
        target: &str,
        cluster: &str,
        instance: &str,
        options: &Options,
    ) -> Result<(), ShellError> {
        let command = Command::RemoveInstance {
            cluster: cluster.into(),
            instance: format!("{}@{}", self.user, instance),
            options: options.clone(),
        };
        self.run(target, command).await.map(|_| ())
    }
}
