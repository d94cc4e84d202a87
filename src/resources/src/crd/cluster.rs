// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Affinity, LocalObjectReference, PersistentVolumeClaim};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::ManagedResource;
use crate::labels::{CLUSTER_LABEL, VERSION_LABEL};
use crate::{DEFAULT_BASE_SERVER_ID, DEFAULT_MEMBERS, VERSION};

pub mod v1alpha1 {
    use super::*;

    /// The attributes a user can specify when creating a cluster.
    #[derive(
        CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema,
    )]
    #[serde(rename_all = "camelCase")]
    #[kube(
        namespaced,
        group = "rds.cloud",
        version = "v1alpha1",
        kind = "Cluster",
        singular = "mysqlcluster",
        plural = "mysqlclusters",
        shortname = "mysqlc",
        status = "ClusterStatus",
        printcolumn = r#"{"name": "Members", "type": "integer", "description": "Number of MySQL instances.", "jsonPath": ".spec.members"}"#,
        printcolumn = r#"{"name": "Version", "type": "string", "description": "MySQL server version.", "jsonPath": ".spec.version"}"#,
        printcolumn = r#"{"name": "Ready", "type": "string", "description": "Whether every member has joined the group.", "jsonPath": ".status.conditions[?(@.type==\"Ready\")].status"}"#
    )]
    pub struct ClusterSpec {
        /// The MySQL server version, as a semantic version. Also selects the
        /// server image tag.
        pub version: String,
        /// The number of MySQL instances in the cluster, between 1 and 9.
        #[serde(default = "default_members")]
        pub members: i32,
        /// The base used to derive a unique `server_id` for each instance
        /// (`base + ordinal`). Zero selects the default of 1000.
        #[serde(default)]
        pub base_server_id: u32,
        /// If true, every instance accepts writes. Otherwise a single
        /// instance is read/write and the rest are read-only.
        #[serde(default)]
        pub multi_master: bool,
        /// A selector which must match a node's labels for the pods to be
        /// scheduled on that node.
        pub node_selector: Option<BTreeMap<String, String>>,
        /// The pods' scheduling constraints.
        pub affinity: Option<Affinity>,
        /// The template for each instance's data volume.
        pub volume_claim_template: Option<PersistentVolumeClaim>,
        /// A secret holding the root password under the `password` key. If
        /// unset, one is generated.
        pub root_password_secret: Option<LocalObjectReference>,
        /// A config map holding a custom `my.cnf`.
        pub config: Option<LocalObjectReference>,
        /// A secret holding `ca.crt`, `tls.crt` and `tls.key` for group
        /// replication SSL.
        pub ssl_secret: Option<LocalObjectReference>,
    }

    fn default_members() -> i32 {
        DEFAULT_MEMBERS
    }

    impl Cluster {
        pub fn namespace(&self) -> String {
            self.meta().namespace.clone().unwrap_or_default()
        }

        pub fn members(&self) -> i32 {
            self.spec.members
        }

        pub fn base_server_id(&self) -> u32 {
            match self.spec.base_server_id {
                0 => DEFAULT_BASE_SERVER_ID,
                base => base,
            }
        }

        pub fn server_id(&self, ordinal: u32) -> u64 {
            u64::from(self.base_server_id()) + u64::from(ordinal)
        }

        pub fn stateful_set_name(&self) -> String {
            self.name_any()
        }

        /// The headless service that gives every instance a stable DNS name.
        pub fn service_name(&self) -> String {
            self.name_any()
        }

        /// The service that routes to whichever instances are labelled
        /// primary.
        pub fn primary_service_name(&self) -> String {
            format!("{}-primary", self.name_any())
        }

        pub fn generates_root_password(&self) -> bool {
            self.spec.root_password_secret.is_none()
        }

        pub fn root_password_secret_name(&self) -> String {
            match &self.spec.root_password_secret {
                Some(reference) => reference.name.clone(),
                None => format!("{}-root-password", self.name_any()),
            }
        }

        pub fn pod_name(&self, ordinal: u32) -> String {
            format!("{}-{}", self.stateful_set_name(), ordinal)
        }

        /// The host other instances use to reach `ordinal`, and the host it
        /// reports to the group.
        pub fn instance_host(&self, ordinal: u32) -> String {
            format!("{}.{}", self.pod_name(ordinal), self.service_name())
        }

        pub fn image(&self, repository: &str) -> String {
            format!("{}:{}", repository, self.spec.version)
        }

        pub fn status(&self) -> ClusterStatus {
            self.status.clone().unwrap_or_default()
        }
    }

    impl ManagedResource for Cluster {
        fn default_labels(&self) -> BTreeMap<String, String> {
            BTreeMap::from_iter([
                (CLUSTER_LABEL.to_owned(), self.name_any()),
                (VERSION_LABEL.to_owned(), VERSION.to_owned()),
            ])
        }
    }

    /// The observed state of a cluster. Always written as a whole.
    #[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
    #[serde(rename_all = "camelCase")]
    pub struct ClusterStatus {
        #[serde(default)]
        pub conditions: Vec<ClusterCondition>,
    }

    impl ClusterStatus {
        pub fn condition(&self, type_: ClusterConditionType) -> Option<&ClusterCondition> {
            self.conditions.iter().find(|c| c.type_ == type_)
        }

        pub fn ready(&self) -> Option<&ClusterCondition> {
            self.condition(ClusterConditionType::Ready)
        }

        /// Returns a copy of this status with `condition` replacing any
        /// condition of the same type. The previous transition time is kept
        /// when the condition's status did not change.
        pub fn with_condition(&self, mut condition: ClusterCondition) -> ClusterStatus {
            let mut conditions = Vec::with_capacity(self.conditions.len() + 1);
            let mut replaced = false;
            for existing in &self.conditions {
                if existing.type_ != condition.type_ {
                    conditions.push(existing.clone());
                    continue;
                }
                if existing.status == condition.status {
                    condition.last_transition_time = existing.last_transition_time.clone();
                }
                if !replaced {
                    conditions.push(condition.clone());
                    replaced = true;
                }
            }
            if !replaced {
                conditions.push(condition);
            }
            ClusterStatus { conditions }
        }

        /// Reports whether writing `new` over `self` would change anything
        /// other than timestamps.
        pub fn needs_update(&self, new: &ClusterStatus) -> bool {
            self.conditions.len() != new.conditions.len()
                || self
                    .conditions
                    .iter()
                    .zip(&new.conditions)
                    .any(|(old, new)| !old.same_observation(new))
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
    pub enum ClusterConditionType {
        /// The cluster is able to service requests.
        Ready,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
    pub enum ConditionStatus {
        True,
        False,
        Unknown,
    }

    impl fmt::Display for ConditionStatus {
        fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
            let repr = match self {
                ConditionStatus::True => "True",
                ConditionStatus::False => "False",
                ConditionStatus::Unknown => "Unknown",
            };
            f.write_str(repr)
        }
    }

    /// The observed state of a cluster at a certain point.
    #[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
    #[serde(rename_all = "camelCase")]
    pub struct ClusterCondition {
        #[serde(rename = "type")]
        pub type_: ClusterConditionType,
        pub status: ConditionStatus,
        pub last_transition_time: Option<Time>,
        /// Machine readable, CamelCase reason for the last transition.
        #[serde(default)]
        pub reason: String,
        #[serde(default)]
        pub message: String,
    }

    impl ClusterCondition {
        pub fn ready(
            status: ConditionStatus,
            reason: impl Into<String>,
            message: impl Into<String>,
            now: DateTime<Utc>,
        ) -> Self {
            ClusterCondition {
                type_: ClusterConditionType::Ready,
                status,
                last_transition_time: Some(Time(now)),
                reason: reason.into(),
                message: message.into(),
            }
        }

        fn same_observation(&self, other: &ClusterCondition) -> bool {
            self.type_ == other.type_
                && self.status == other.status
                && self.reason == other.reason
                && self.message == other.message
        }
    }
}
