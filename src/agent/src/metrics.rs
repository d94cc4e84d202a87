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
    pub syncs: UIntCounterVec,
    pub synced: UIntGauge,
}

impl Metrics {
    pub fn register_into(registry: &MetricsRegistry) -> Self {
        Self {
            syncs: registry.register(metric!(
                name: "rds_agent_sync_total",
                help: "Count of membership sync cycles by outcome.",
                var_labels: ["outcome"],
            )),
            synced: registry.register(metric!(
                name: "rds_agent_membership_synced",
                help: "Whether the local instance is an online member of its group.",
            )),
        }
    }
}
