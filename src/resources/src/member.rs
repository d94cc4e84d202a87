// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The membership record each agent publishes about its own instance.
//!
//! The agent is the only component that talks to the database engine, so it
//! is also the only one that knows whether its instance is a group member
//! and in which role. After every sync it writes a [`MemberStatus`] into the
//! [`MEMBERSHIP_ANNOTATION`] of its own pod; the operator reads it back to
//! derive role labels and the cluster's readiness.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::labels::{MEMBERSHIP_ANNOTATION, ROLE_PRIMARY, ROLE_SECONDARY};

/// The replication role of a group member.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Primary,
    Secondary,
}

impl Role {
    /// The value of the role label for this role.
    pub fn label_value(&self) -> &'static str {
        match self {
            Role::Primary => ROLE_PRIMARY,
            Role::Secondary => ROLE_SECONDARY,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.label_value())
    }
}

/// How far an instance got in joining its group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum JoinStatus {
    Unjoined,
    Bootstrapping,
    JoinedPrimary,
    JoinedSecondary,
    JoinFailed,
}

impl JoinStatus {
    pub fn joined(role: Role) -> JoinStatus {
        match role {
            Role::Primary => JoinStatus::JoinedPrimary,
            Role::Secondary => JoinStatus::JoinedSecondary,
        }
    }

    /// The role of a joined member, or `None` if the instance is not part of
    /// the group.
    pub fn role(&self) -> Option<Role> {
        match self {
            JoinStatus::JoinedPrimary => Some(Role::Primary),
            JoinStatus::JoinedSecondary => Some(Role::Secondary),
            JoinStatus::Unjoined | JoinStatus::Bootstrapping | JoinStatus::JoinFailed => None,
        }
    }

    pub fn is_synced(&self) -> bool {
        self.role().is_some()
    }
}

/// The record published in [`MEMBERSHIP_ANNOTATION`].
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberStatus {
    pub join_status: JoinStatus,
    pub last_sync: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl MemberStatus {
    pub fn new(join_status: JoinStatus, last_sync: DateTime<Utc>) -> Self {
        MemberStatus {
            join_status,
            last_sync,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn role(&self) -> Option<Role> {
        self.join_status.role()
    }

    pub fn is_synced(&self) -> bool {
        self.join_status.is_synced()
    }

    /// Extracts the record from an object's annotations. Missing or
    /// malformed records read as `None`; a pod whose agent has not reported
    /// yet is indistinguishable from one that reported garbage.
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Option<MemberStatus> {
        let raw = annotations.get(MEMBERSHIP_ANNOTATION)?;
        serde_json::from_str(raw).ok()
    }

    pub fn to_annotation_value(&self) -> String {
        serde_json::to_string(self).expect("member status serializes")
    }
}
