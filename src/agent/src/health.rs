// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Liveness and readiness endpoints.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing;
use axum::Router;
use rds_ore::metrics::MetricsRegistry;

/// The agent's two health signals.
///
/// Readiness admits traffic to the instance and holds only while it is an
/// online member of its group. Liveness fails only when the local server
/// is beyond the agent's help; an instance that has not joined yet is
/// alive.
#[derive(Debug)]
pub struct Health {
    ready: AtomicBool,
    live: AtomicBool,
}

impl Default for Health {
    fn default() -> Self {
        Health {
            ready: AtomicBool::new(false),
            live: AtomicBool::new(true),
        }
    }
}

impl Health {
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

fn check(ok: bool) -> (StatusCode, &'static str) {
    if ok {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
    }
}

async fn handle_liveness_check(State(health): State<Arc<Health>>) -> (StatusCode, &'static str) {
    check(health.is_live())
}

async fn handle_readiness_check(State(health): State<Arc<Health>>) -> (StatusCode, &'static str) {
    check(health.is_ready())
}

pub fn router(health: Arc<Health>, metrics_registry: MetricsRegistry) -> Router {
    Router::new()
        .route("/live", routing::get(handle_liveness_check))
        .route("/ready", routing::get(handle_readiness_check))
        .with_state(health)
        .route(
            "/metrics",
            routing::get(move || async move {
                metrics_registry
                    .render()
                    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
            }),
        )
}
