// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Role assignment from the membership the agents report.
//!
//! Roles are never guessed from pod ordinals: each agent publishes what the
//! database engine told it, and the role label follows that report.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use rds_resources::crd::cluster::v1alpha1::Cluster;
use rds_resources::labels::{ROLE_LABEL, ROLE_PRIMARY};
use rds_resources::member::{MemberStatus, Role};

/// How roles are labelled when every member accepts writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum MultiPrimaryRoles {
    /// Every synced read/write member is labelled primary.
    #[default]
    AllPrimary,
    /// Only the lowest-ordinal synced member is labelled primary.
    SeedPrimary,
}

/// A pod of the cluster's stateful set and what its agent last reported.
#[derive(Debug, Clone)]
pub struct Member {
    pub ordinal: u32,
    pub pod: Pod,
    pub status: Option<MemberStatus>,
}

impl Member {
    pub fn is_synced(&self) -> bool {
        self.status.as_ref().is_some_and(MemberStatus::is_synced)
    }

    fn reported_role(&self) -> Option<Role> {
        self.status.as_ref().and_then(MemberStatus::role)
    }

    pub fn role_label(&self) -> Option<&str> {
        self.pod.labels().get(ROLE_LABEL).map(String::as_str)
    }
}

/// Collects the members of `cluster` from its pods, ordered by ordinal.
/// Pods that do not belong to the stateful set are skipped.
pub fn observe(cluster: &Cluster, pods: Vec<Pod>) -> Vec<Member> {
    let prefix = format!("{}-", cluster.stateful_set_name());
    let mut members: Vec<_> = pods
        .into_iter()
        .filter_map(|pod| {
            let ordinal = pod.name_any().strip_prefix(&prefix)?.parse().ok()?;
            let status = MemberStatus::from_annotations(pod.annotations());
            Some(Member {
                ordinal,
                pod,
                status,
            })
        })
        .collect();
    members.sort_by_key(|m| m.ordinal);
    members
}

/// Decides the role of every synced member.
pub fn assign(
    members: &[Member],
    multi_master: bool,
    policy: MultiPrimaryRoles,
) -> BTreeMap<u32, Role> {
    let synced: Vec<&Member> = members.iter().filter(|m| m.is_synced()).collect();
    let mut roles = BTreeMap::new();
    if !multi_master {
        // Exactly one primary. If several members claim it, e.g. a stale
        // report from before a failover, the freshest report wins.
        let primary = synced
            .iter()
            .filter(|m| m.reported_role() == Some(Role::Primary))
            .max_by(|a, b| {
                let last_sync = |m: &Member| m.status.as_ref().map(|s| s.last_sync);
                last_sync(a)
                    .cmp(&last_sync(b))
                    .then_with(|| b.ordinal.cmp(&a.ordinal))
            })
            .map(|m| m.ordinal);
        for m in &synced {
            let role = if Some(m.ordinal) == primary {
                Role::Primary
            } else {
                Role::Secondary
            };
            roles.insert(m.ordinal, role);
        }
        return roles;
    }
    match policy {
        MultiPrimaryRoles::AllPrimary => {
            for m in &synced {
                if let Some(role) = m.reported_role() {
                    roles.insert(m.ordinal, role);
                }
            }
        }
        MultiPrimaryRoles::SeedPrimary => {
            for (i, m) in synced.iter().enumerate() {
                let role = if i == 0 { Role::Primary } else { Role::Secondary };
                roles.insert(m.ordinal, role);
            }
        }
    }
    roles
}

/// The role label each pod must carry but does not yet. Members without an
/// assigned role keep their label, except that a stale primary label is
/// downgraded so the primary service stops routing to them.
pub fn label_changes<'a>(
    members: &'a [Member],
    roles: &BTreeMap<u32, Role>,
) -> Vec<(&'a Pod, Role)> {
    members
        .iter()
        .filter_map(|m| {
            let wanted = match roles.get(&m.ordinal) {
                Some(role) => *role,
                None if m.role_label() == Some(ROLE_PRIMARY) => Role::Secondary,
                None => return None,
            };
            (m.role_label() != Some(wanted.label_value())).then_some((&m.pod, wanted))
        })
        .collect()
}
