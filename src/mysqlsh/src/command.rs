// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fmt;

use crate::Options;

/// A single MySQL Shell administration call, rendered as the Python
/// statement `mysqlsh` evaluates.
///
/// Every mutating call has the form `<method>(<positional-args>, <options>)`.
/// Positional arguments are single quoted like option strings and carry the
/// same restriction on embedded quotes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Runs a trivial query to check that the server accepts connections.
    Ping,
    /// Prints the cluster's status report as JSON.
    Status { cluster: String },
    CreateCluster { cluster: String, options: Options },
    RebootClusterFromCompleteOutage { cluster: String, options: Options },
    AddInstance {
        cluster: String,
        instance: String,
        options: Options,
    },
    RejoinInstance {
        cluster: String,
        instance: String,
        options: Options,
    },
    RemoveInstance {
        cluster: String,
        instance: String,
        options: Options,
    },
}

impl Command {
    /// The name of the `dba` or `Cluster` method invoked, for logs and
    /// errors.
    pub fn method(&self) -> &'static str {
        match self {
            Command::Ping => "run_sql",
            Command::Status { .. } => "status",
            Command::CreateCluster { .. } => "create_cluster",
            Command::RebootClusterFromCompleteOutage { .. } => {
                "reboot_cluster_from_complete_outage"
            }
            Command::AddInstance { .. } => "add_instance",
            Command::RejoinInstance { .. } => "rejoin_instance",
            Command::RemoveInstance { .. } => "remove_instance",
        }
    }

    /// Whether the command changes group membership.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Command::Ping | Command::Status { .. })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Command::Ping => f.write_str("session.run_sql('SELECT 1')"),
            Command::Status { cluster } => {
                write!(f, "print(dba.get_cluster('{}').status())", cluster)
            }
            Command::CreateCluster { cluster, options } => {
                write!(f, "dba.create_cluster('{}', {})", cluster, options)
            }
            Command::RebootClusterFromCompleteOutage { cluster, options } => write!(
                f,
                "dba.reboot_cluster_from_complete_outage('{}', {})",
                cluster, options
            ),
            Command::AddInstance {
                cluster,
                instance,
                options,
            }
            | Command::RejoinInstance {
                cluster,
                instance,
                options,
            }
            | Command::RemoveInstance {
                cluster,
                instance,
                options,
            } => write!(
                f,
                "dba.get_cluster('{}').{}('{}', {})",
                cluster,
                self.method(),
                instance,
                options
            ),
        }
    }
}
