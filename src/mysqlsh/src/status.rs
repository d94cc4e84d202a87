// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The InnoDB cluster status report printed by `Cluster.status()`.
//!
//! Only the parts of the report that membership decisions depend on are
//! modelled; everything else is ignored when decoding.

use std::collections::BTreeMap;

use rds_resources::member::Role;
use serde::Deserialize;

/// The top level of a status report.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    pub cluster_name: String,
    pub default_replica_set: ReplicaSet,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSet {
    #[serde(default)]
    pub name: String,
    /// The address of the read/write member in single-primary mode.
    pub primary: Option<String>,
    /// e.g. `OK`, `OK_NO_TOLERANCE`, `NO_QUORUM`.
    pub status: String,
    #[serde(default)]
    pub status_text: String,
    #[serde(default)]
    pub topology: BTreeMap<String, Instance>,
    pub topology_mode: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub address: String,
    pub mode: InstanceMode,
    pub status: InstanceState,
}

/// Whether an instance accepts writes.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum InstanceMode {
    ReadWrite,
    ReadOnly,
    /// Reported for members that are not online, as `n/a`.
    Unknown(String),
}

impl From<String> for InstanceMode {
    fn from(s: String) -> Self {
        match s.as_str() {
            "R/W" => InstanceMode::ReadWrite,
            "R/O" => InstanceMode::ReadOnly,
            _ => InstanceMode::Unknown(s),
        }
    }
}

/// The group replication state of an instance as seen by the member that
/// produced the report.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum InstanceState {
    Online,
    /// Catching up through distributed recovery. Will become online on its
    /// own.
    Recovering,
    /// Part of the metadata but not of the running group.
    Missing,
    Unreachable,
    Error,
    Offline,
    Other(String),
}

impl From<String> for InstanceState {
    fn from(s: String) -> Self {
        match s.as_str() {
            "ONLINE" => InstanceState::Online,
            "RECOVERING" => InstanceState::Recovering,
            "(MISSING)" | "MISSING" => InstanceState::Missing,
            "UNREACHABLE" => InstanceState::Unreachable,
            "ERROR" => InstanceState::Error,
            "OFFLINE" => InstanceState::Offline,
            _ => InstanceState::Other(s),
        }
    }
}

impl InstanceState {
    /// Whether an instance in this state has to be rejoined to the group.
    pub fn needs_rejoin(&self) -> bool {
        matches!(
            self,
            InstanceState::Missing | InstanceState::Error | InstanceState::Offline
        )
    }
}

impl Instance {
    /// The instance's role, if it is online.
    pub fn role(&self) -> Option<Role> {
        if self.status != InstanceState::Online {
            return None;
        }
        match self.mode {
            InstanceMode::ReadWrite => Some(Role::Primary),
            InstanceMode::ReadOnly => Some(Role::Secondary),
            InstanceMode::Unknown(_) => None,
        }
    }
}

impl ClusterStatus {
    /// Decodes the output of a `print(cluster.status())` invocation. Shell
    /// warnings printed around the report are skipped.
    pub fn parse(output: &str) -> Result<ClusterStatus, serde_json::Error> {
        let start = output.find('{').unwrap_or(0);
        let end = output.rfind('}').map_or(output.len(), |i| i + 1);
        serde_json::from_str(output.get(start..end).unwrap_or(output))
    }

    /// Looks up an instance by its `host:port` address.
    pub fn instance(&self, address: &str) -> Option<&Instance> {
        self.default_replica_set.topology.get(address)
    }

    pub fn instances(&self) -> impl Iterator<Item = &Instance> {
        self.default_replica_set.topology.values()
    }

    /// The address of an online read/write member, preferring the reported
    /// primary.
    pub fn primary(&self) -> Option<&str> {
        if let Some(primary) = &self.default_replica_set.primary {
            if self
                .instance(primary)
                .map_or(true, |i| i.status == InstanceState::Online)
            {
                return Some(primary);
            }
        }
        self.instances()
            .find(|i| i.role() == Some(Role::Primary))
            .map(|i| i.address.as_str())
    }

    /// Whether the group can still accept writes.
    pub fn has_quorum(&self) -> bool {
        self.default_replica_set.status.starts_with("OK")
    }

    pub fn online_count(&self) -> usize {
        self.instances()
            .filter(|i| i.status == InstanceState::Online)
            .count()
    }
}
