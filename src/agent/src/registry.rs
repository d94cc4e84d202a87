// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Where agents publish their membership and learn about their peers.

use std::fmt::Debug;

use anyhow::Context;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use rds_resources::labels::{CLUSTER_LABEL, MEMBERSHIP_ANNOTATION};
use rds_resources::member::MemberStatus;
use serde_json::json;
use tracing::trace;

use crate::instance::{ordinal_of, Instance};

/// Another instance of the same cluster and what its agent last reported.
#[derive(Debug, Clone, PartialEq)]
pub struct Peer {
    pub ordinal: u32,
    pub status: Option<MemberStatus>,
}

impl Peer {
    pub fn is_synced(&self) -> bool {
        self.status.as_ref().is_some_and(MemberStatus::is_synced)
    }
}

#[async_trait]
pub trait MembershipRegistry: Debug + Send + Sync {
    /// Records `status` as this instance's membership.
    async fn publish(&self, status: &MemberStatus) -> Result<(), anyhow::Error>;

    /// Lists the other instances of the cluster, ordered by ordinal.
    async fn peers(&self) -> Result<Vec<Peer>, anyhow::Error>;
}

/// Publishes membership as an annotation on the agent's own pod.
#[derive(Debug, Clone)]
pub struct KubeRegistry {
    pods: Api<Pod>,
    instance: Instance,
}

impl KubeRegistry {
    pub fn new(client: Client, instance: Instance) -> Self {
        KubeRegistry {
            pods: Api::namespaced(client, &instance.namespace),
            instance,
        }
    }
}

/// Collects the peers of `instance` from the cluster's pods.
pub fn peers_from_pods<'a>(
    instance: &Instance,
    pods: impl IntoIterator<Item = &'a Pod>,
) -> Vec<Peer> {
    let mut peers: Vec<_> = pods
        .into_iter()
        .filter_map(|pod| {
            let ordinal = ordinal_of(&instance.cluster_name, &pod.name_any())?;
            (ordinal != instance.ordinal).then(|| Peer {
                ordinal,
                status: MemberStatus::from_annotations(pod.annotations()),
            })
        })
        .collect();
    peers.sort_by_key(|p| p.ordinal);
    peers
}

#[async_trait]
impl MembershipRegistry for KubeRegistry {
    async fn publish(&self, status: &MemberStatus) -> Result<(), anyhow::Error> {
        let pod_name = self.instance.pod_name();
        trace!(pod = %pod_name, "publishing membership");
        let patch = json!({
            "metadata": {
                "annotations": {
                    MEMBERSHIP_ANNOTATION: status.to_annotation_value(),
                },
            },
        });
        self.pods
            .patch(&pod_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .with_context(|| format!("annotating pod {}", pod_name))?;
        Ok(())
    }

    async fn peers(&self) -> Result<Vec<Peer>, anyhow::Error> {
        let selector = format!("{}={}", CLUSTER_LABEL, self.instance.cluster_name);
        let pods = self
            .pods
            .list(&ListParams::default().labels(&selector))
            .await
            .context("listing cluster pods")?;
        Ok(peers_from_pods(&self.instance, &pods.items))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{TimeZone, Utc};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use rds_resources::member::JoinStatus;

    use super::*;

    fn pod(name: &str, status: Option<&MemberStatus>) -> Pod {
        let annotations = status.map(|s| {
            BTreeMap::from([(MEMBERSHIP_ANNOTATION.to_owned(), s.to_annotation_value())])
        });
        Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                annotations,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_peers_from_pods() {
        let instance = Instance::from_pod_name("orders", "db", "orders-1", 3306).unwrap();
        let synced = MemberStatus::new(
            JoinStatus::JoinedPrimary,
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        );
        let pods = [
            pod("orders-2", None),
            pod("orders-1", None),
            pod("orders-0", Some(&synced)),
            pod("orders-archive-0", Some(&synced)),
        ];
        let peers = peers_from_pods(&instance, &pods);
        assert_eq!(
            peers,
            vec![
                Peer {
                    ordinal: 0,
                    status: Some(synced),
                },
                Peer {
                    ordinal: 2,
                    status: None,
                },
            ]
        );
        assert!(peers[0].is_synced());
        assert!(!peers[1].is_synced());
    }
}
