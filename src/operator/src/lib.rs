// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A Kubernetes operator for MySQL InnoDB clusters.
//!
//! The operator turns each `Cluster` object into a StatefulSet of MySQL
//! instances, the services in front of them and their root credentials. It
//! does not change group membership itself: an agent beside every instance
//! does that and reports back through its pod, from which the operator
//! derives role labels and the cluster's readiness.

pub mod controller;
pub mod k8s;
pub mod metrics;
pub mod store;
pub mod updater;
