// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use rds_ore::metric;
use rds_ore::metrics::{MetricsRegistry, UIntCounterVec, UIntGauge};

#[derive(Debug, Clone)]
pub struct Metrics {
    pub reconciles: UIntCounterVec,
    pub requeued: UIntGauge,
    pub managed_clusters: UIntGauge,
}

impl Metrics {
    pub fn register_into(registry: &MetricsRegistry) -> Self {
        Self {
            reconciles: registry.register(metric!(
                name: "rds_operator_reconciles_total",
                help: "Count of cluster reconciliations by result.",
                var_labels: ["result"],
            )),
            requeued: registry.register(metric!(
                name: "rds_operator_clusters_requeued",
                help: "Number of clusters currently backing off after a failed reconciliation.",
            )),
            managed_clusters: registry.register(metric!(
                name: "rds_operator_managed_clusters",
                help: "Number of clusters currently managed by the operator.",
            )),
        }
    }
}
