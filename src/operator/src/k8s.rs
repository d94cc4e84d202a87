// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Thin helpers over the Kubernetes API shared by the controllers.

use std::fmt::Debug;

use futures::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::reflector::{self, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::store::StoreError;

/// The field manager recorded on every object the operator applies.
pub const FIELD_MANAGER: &str = "rds-operator";

/// Returns an API handle scoped to `namespace`, or to every namespace if
/// none is given.
pub fn namespaced_or_all<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    match namespace {
        Some(namespace) => Api::namespaced(client, namespace),
        None => Api::all(client),
    }
}

/// Server-side applies `resource`, taking ownership of every field it sets.
pub async fn apply_resource<K>(api: &Api<K>, resource: &K) -> Result<K, kube::Error>
where
    K: Resource + Clone + Send + DeserializeOwned + Serialize + Debug + 'static,
    <K as Resource>::DynamicType: Default,
{
    api.patch(
        &resource.name_any(),
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(resource),
    )
    .await
}

/// Starts a background reflector over `api` and returns its store once the
/// initial listing has been received.
pub async fn make_reflector<K>(api: Api<K>, config: watcher::Config) -> Store<K>
where
    K: Resource + Clone + Send + Sync + DeserializeOwned + Debug + 'static,
    <K as Resource>::DynamicType: Default + Eq + std::hash::Hash + Clone + Send + Sync,
{
    let (store, writer) = reflector::store();
    let kind = K::kind(&Default::default()).into_owned();
    let stream = reflector::reflector(writer, watcher(api, config))
        .default_backoff()
        .touched_objects();
    let task_kind = kind.clone();
    tokio::spawn(async move {
        futures::pin_mut!(stream);
        while let Some(event) = stream.next().await {
            if let Err(e) = event {
                warn!(kind = %task_kind, "reflector watch failed: {}", e);
            }
        }
    });
    // The writer lives until the stream ends, so readiness can only fail if
    // the task died before the first listing.
    if store.wait_until_ready().await.is_err() {
        warn!(%kind, "reflector stopped before becoming ready");
    } else {
        debug!(%kind, "reflector ready");
    }
    store
}

/// Classifies an API error by what the caller can do about it.
pub fn store_error(e: kube::Error) -> StoreError {
    match e {
        kube::Error::Api(e) if e.code == 409 && e.reason == "AlreadyExists" => {
            StoreError::AlreadyExists(e.message)
        }
        kube::Error::Api(e) if e.code == 409 => StoreError::Conflict(e.message),
        kube::Error::Api(e) if e.code == 404 => StoreError::NotFound(e.message),
        e => StoreError::Kube(e),
    }
}
