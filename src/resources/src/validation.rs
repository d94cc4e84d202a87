// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Admission checks applied to a cluster before it is reconciled.
//!
//! Every rule is evaluated independently so that a user sees the complete
//! list of problems with their cluster at once.

use std::fmt;

use kube::ResourceExt;
use semver::Version;

use crate::crd::cluster::v1alpha1::Cluster;

/// The oldest MySQL server version with the group replication features the
/// agent relies on.
pub const MINIMUM_MYSQL_VERSION: &str = "8.0.11";

/// Cluster names seed the group name and the names of replication channels,
/// which MySQL caps (see <https://bugs.mysql.com/bug.php?id=90601>).
pub const CLUSTER_NAME_MAX_LEN: usize = 28;

/// The most members group replication supports.
pub const MAX_INNODB_CLUSTER_MEMBERS: i32 = 9;

/// The largest base server id for which `base + ordinal` stays within MySQL's
/// server id space for every possible ordinal.
pub const MAX_BASE_SERVER_ID: u32 = u32::MAX - MAX_INNODB_CLUSTER_MEMBERS as u32;

/// Why a field was rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldErrorKind {
    /// The value is not acceptable.
    Invalid,
    /// The value could not be checked.
    Internal,
}

impl fmt::Display for FieldErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FieldErrorKind::Invalid => f.write_str("Invalid value"),
            FieldErrorKind::Internal => f.write_str("Internal error"),
        }
    }
}

/// A problem with one field of a cluster.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{path}: {kind}: {}", describe(.value, .detail))]
pub struct FieldError {
    /// The dotted path of the field, e.g. `spec.members`.
    pub path: String,
    pub kind: FieldErrorKind,
    /// The offending value, when there is one worth echoing back.
    pub value: Option<String>,
    pub detail: String,
}

fn describe(value: &Option<String>, detail: &str) -> String {
    match value {
        Some(value) => format!("{:?}: {}", value, detail),
        None => detail.to_owned(),
    }
}

impl FieldError {
    pub fn invalid(path: &str, value: impl ToString, detail: impl Into<String>) -> Self {
        FieldError {
            path: path.into(),
            kind: FieldErrorKind::Invalid,
            value: Some(value.to_string()),
            detail: detail.into(),
        }
    }

    pub fn internal(path: &str, detail: impl Into<String>) -> Self {
        FieldError {
            path: path.into(),
            kind: FieldErrorKind::Internal,
            value: None,
            detail: detail.into(),
        }
    }
}

/// Joins a list of field errors into a single human readable message.
pub fn summarize(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Checks clusters against the configured minimum server version and the
/// fixed limits of group replication.
#[derive(Clone, Debug)]
pub struct Validator {
    minimum_version: String,
}

impl Default for Validator {
    fn default() -> Self {
        Validator::new(MINIMUM_MYSQL_VERSION)
    }
}

impl Validator {
    pub fn new(minimum_version: impl Into<String>) -> Self {
        Validator {
            minimum_version: minimum_version.into(),
        }
    }

    /// Returns every problem with `cluster`, in field order. An empty list
    /// means the cluster is admissible.
    pub fn validate(&self, cluster: &Cluster) -> Vec<FieldError> {
        let mut errors = Vec::new();
        errors.extend(validate_name(&cluster.name_any()));
        errors.extend(self.validate_version(&cluster.spec.version));
        errors.extend(validate_members(cluster.spec.members));
        errors.extend(validate_base_server_id(cluster.spec.base_server_id));
        errors
    }

    fn validate_version(&self, version: &str) -> Vec<FieldError> {
        const PATH: &str = "spec.version";
        let mut errors = Vec::new();
        let minimum = Version::parse(&self.minimum_version).map_err(|e| {
            FieldError::internal(
                PATH,
                format!(
                    "unable to parse minimum MySQL version {:?}: {}",
                    self.minimum_version, e
                ),
            )
        });
        let given = Version::parse(version).map_err(|e| {
            FieldError::internal(
                PATH,
                format!("unable to parse MySQL version {:?}: {}", version, e),
            )
        });
        match (minimum, given) {
            (Ok(minimum), Ok(given)) => {
                if given < minimum {
                    errors.push(FieldError::invalid(
                        PATH,
                        version,
                        format!("minimum supported MySQL version is {}", minimum),
                    ));
                }
            }
            (minimum, given) => {
                errors.extend(minimum.err());
                errors.extend(given.err());
            }
        }
        errors
    }
}

fn validate_name(name: &str) -> Option<FieldError> {
    if name.len() > CLUSTER_NAME_MAX_LEN {
        return Some(FieldError::invalid(
            "metadata.name",
            name,
            format!("longer than maximum supported length {}", CLUSTER_NAME_MAX_LEN),
        ));
    }
    None
}

fn validate_members(members: i32) -> Option<FieldError> {
    if !(1..=MAX_INNODB_CLUSTER_MEMBERS).contains(&members) {
        return Some(FieldError::invalid(
            "spec.members",
            members,
            format!(
                "InnoDB clustering supports between 1-{} members",
                MAX_INNODB_CLUSTER_MEMBERS
            ),
        ));
    }
    None
}

fn validate_base_server_id(base_server_id: u32) -> Option<FieldError> {
    if base_server_id > MAX_BASE_SERVER_ID {
        return Some(FieldError::invalid(
            "spec.baseServerId",
            base_server_id,
            format!("must be at most {}", MAX_BASE_SERVER_ID),
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::crd::cluster::v1alpha1::ClusterSpec;

    fn cluster(name: &str, version: &str, members: i32) -> Cluster {
        Cluster::new(
            name,
            ClusterSpec {
                version: version.into(),
                members,
                ..Default::default()
            },
        )
    }

    fn paths(errors: &[FieldError]) -> Vec<&str> {
        errors.iter().map(|e| e.path.as_str()).collect()
    }

    #[test]
    fn test_valid_cluster() {
        let errors = Validator::default().validate(&cluster("orders", "8.0.20", 3));
        assert_eq!(errors, vec![]);
    }

    #[test]
    fn test_reports_every_error() {
        let mut c = cluster("a-cluster-name-well-over-the-limit", "5.7.30", 12);
        c.spec.base_server_id = u32::MAX;
        let errors = Validator::default().validate(&c);
        assert_eq!(
            paths(&errors),
            vec![
                "metadata.name",
                "spec.version",
                "spec.members",
                "spec.baseServerId"
            ]
        );
        assert!(errors.iter().all(|e| e.kind == FieldErrorKind::Invalid));
    }

    #[test]
    fn test_unparseable_versions_are_internal() {
        let errors = Validator::default().validate(&cluster("orders", "eight", 3));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, FieldErrorKind::Internal);
        assert_eq!(errors[0].path, "spec.version");

        let errors = Validator::new("latest").validate(&cluster("orders", "8.0.20", 3));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, FieldErrorKind::Internal);

        let errors = Validator::new("latest").validate(&cluster("orders", "eight", 3));
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_name_limit() {
        let name = "n".repeat(CLUSTER_NAME_MAX_LEN);
        assert_eq!(Validator::default().validate(&cluster(&name, "8.0.20", 1)), vec![]);
        let name = "n".repeat(CLUSTER_NAME_MAX_LEN + 1);
        let errors = Validator::default().validate(&cluster(&name, "8.0.20", 1));
        assert_eq!(paths(&errors), vec!["metadata.name"]);
    }

    #[test]
    fn test_base_server_id_limit() {
        let mut c = cluster("orders", "8.0.20", 3);
        c.spec.base_server_id = MAX_BASE_SERVER_ID;
        assert_eq!(Validator::default().validate(&c), vec![]);
        c.spec.base_server_id = MAX_BASE_SERVER_ID + 1;
        let errors = Validator::default().validate(&c);
        assert_eq!(paths(&errors), vec!["spec.baseServerId"]);
    }

    #[test]
    fn test_display() {
        let errors = Validator::default().validate(&cluster("orders", "8.0.20", 0));
        assert_eq!(
            summarize(&errors),
            "spec.members: Invalid value: \"0\": InnoDB clustering supports between 1-9 members"
        );
    }

    proptest! {
        #[test]
        fn members_outside_range_are_rejected(
            members in prop_oneof![i32::MIN..1, (MAX_INNODB_CLUSTER_MEMBERS + 1)..=i32::MAX]
        ) {
            let errors = Validator::default().validate(&cluster("orders", "8.0.20", members));
            prop_assert!(!errors.is_empty());
            prop_assert!(errors.iter().all(|e| e.path == "spec.members"));
        }

        #[test]
        fn members_inside_range_are_accepted(members in 1..=MAX_INNODB_CLUSTER_MEMBERS) {
            let errors = Validator::default().validate(&cluster("orders", "8.0.20", members));
            prop_assert!(errors.is_empty());
        }

        #[test]
        fn versions_below_minimum_are_rejected(
            version in prop_oneof![
                (0u64..8, 0u64..100, 0u64..100).prop_map(|(a, b, c)| format!("{}.{}.{}", a, b, c)),
                (0u64..11).prop_map(|c| format!("8.0.{}", c)),
            ]
        ) {
            let errors = Validator::default().validate(&cluster("orders", &version, 3));
            prop_assert_eq!(paths(&errors), vec!["spec.version"]);
            prop_assert_eq!(errors[0].kind, FieldErrorKind::Invalid);
        }

        #[test]
        fn versions_at_or_above_minimum_are_accepted(
            major in 8u64..12,
            minor in 0u64..40,
            patch in 11u64..200,
        ) {
            let version = format!("{}.{}.{}", major, minor, patch);
            let errors = Validator::default().validate(&cluster("orders", &version, 3));
            prop_assert!(errors.is_empty());
        }
    }
}
