// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Who this agent is, derived from its pod's identity.

use std::fmt;

/// The MySQL instance an agent runs beside.
///
/// Pods of a cluster are named `<cluster>-<ordinal>` and are reachable at
/// `<pod>.<cluster>` through the cluster's headless service. The instance
/// with ordinal zero is the seed: it is the only one that may create the
/// group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub cluster_name: String,
    pub namespace: String,
    pub ordinal: u32,
    pub port: u16,
}

#[derive(Debug, thiserror::Error)]
#[error("pod name {pod_name:?} does not belong to cluster {cluster_name:?}")]
pub struct ForeignPod {
    pub pod_name: String,
    pub cluster_name: String,
}

impl Instance {
    pub fn from_pod_name(
        cluster_name: &str,
        namespace: &str,
        pod_name: &str,
        port: u16,
    ) -> Result<Instance, ForeignPod> {
        let ordinal = ordinal_of(cluster_name, pod_name).ok_or_else(|| ForeignPod {
            pod_name: pod_name.into(),
            cluster_name: cluster_name.into(),
        })?;
        Ok(Instance {
            cluster_name: cluster_name.into(),
            namespace: namespace.into(),
            ordinal,
            port,
        })
    }

    pub fn pod_name(&self) -> String {
        self.peer_pod_name(self.ordinal)
    }

    pub fn peer_pod_name(&self, ordinal: u32) -> String {
        format!("{}-{}", self.cluster_name, ordinal)
    }

    /// The `host:port` address of this instance, as the group reports it.
    pub fn address(&self) -> String {
        self.peer_address(self.ordinal)
    }

    pub fn peer_address(&self, ordinal: u32) -> String {
        format!(
            "{}.{}:{}",
            self.peer_pod_name(ordinal),
            self.cluster_name,
            self.port
        )
    }

    pub fn seed_address(&self) -> String {
        self.peer_address(0)
    }

    pub fn is_seed(&self) -> bool {
        self.ordinal == 0
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.pod_name())
    }
}

/// Extracts the ordinal from a pod named `<cluster>-<ordinal>`.
pub fn ordinal_of(cluster_name: &str, pod_name: &str) -> Option<u32> {
    let ordinal = pod_name.strip_prefix(cluster_name)?.strip_prefix('-')?;
    if ordinal.is_empty() || !ordinal.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    ordinal.parse().ok()
}
