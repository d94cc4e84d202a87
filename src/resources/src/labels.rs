// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Labels and annotations understood by the operator, the agent and the
//! platform's service selection.

/// Applied to every object belonging to a cluster. The value is the
/// cluster's name.
pub const CLUSTER_LABEL: &str = "rds.cloud/cluster";

/// Denotes the version of the operator that manages an object.
pub const VERSION_LABEL: &str = "rds.cloud/version";

/// Specifies the role of a pod within a cluster.
pub const ROLE_LABEL: &str = "rds.cloud/role";

/// Role label value of a member that accepts writes.
pub const ROLE_PRIMARY: &str = "primary";

/// Role label value of a read-only member.
pub const ROLE_SECONDARY: &str = "secondary";

/// Pod annotation carrying the agent's last published
/// [`MemberStatus`](crate::member::MemberStatus), as JSON.
pub const MEMBERSHIP_ANNOTATION: &str = "rds.cloud/membership";
