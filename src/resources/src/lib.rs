// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Custom resources and shared contracts for MySQL InnoDB clusters.
//!
//! This crate is the vocabulary shared by the operator and the per-instance
//! agent: the `Cluster` custom resource, the labels and annotations both
//! sides agree on, the membership record the agent publishes, and the
//! admission checks applied to a cluster before it is reconciled.

pub mod crd;
pub mod labels;
pub mod member;
pub mod validation;

/// The port on which the agent's health check service listens.
pub const DEFAULT_AGENT_HEALTHCHECK_PORT: u16 = 10512;

/// The port on which MySQL serves clients.
pub const DEFAULT_MYSQL_PORT: u16 = 3306;

/// The base server id used when a cluster does not specify one.
pub const DEFAULT_BASE_SERVER_ID: u32 = 1000;

/// The number of members a cluster has when it does not specify one.
pub const DEFAULT_MEMBERS: i32 = 1;

/// The version of this crate, stamped onto every managed object.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
