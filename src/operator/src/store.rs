// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Access to the objects the operator reads and writes.
//!
//! Reads come from a local cache fed by watches. Writes go to the API server
//! and are checked against the object's resource version, so concurrent
//! writers are detected rather than overwritten. [`ObjectStore`] is the seam
//! between the reconciliation logic and the platform: [`KubeStore`] talks to
//! a real API server, [`memory::MemoryStore`] keeps everything in process.

use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Pod, Secret, Service};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, PostParams};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Client, Resource, ResourceExt};
use rds_resources::crd::cluster::v1alpha1::Cluster;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::k8s::{apply_resource, store_error};

#[cfg(any(test, feature = "test"))]
pub mod memory;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The write was based on an outdated resource version.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error(transparent)]
    Kube(kube::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Cached reads and version-checked writes of one kind of namespaced object.
#[async_trait]
pub trait ObjectStore<K>: Debug + Send + Sync
where
    K: Send + Sync + 'static,
{
    /// Returns the cached copy of an object. The copy may lag behind the
    /// API server.
    fn cached(&self, namespace: &str, name: &str) -> Option<K>;

    /// Returns the cached objects in `namespace` carrying all of `labels`.
    fn cached_list(&self, namespace: &str, labels: &BTreeMap<String, String>) -> Vec<K>;

    async fn create(&self, obj: &K) -> Result<K, StoreError>;

    /// Server-side applies `obj`, creating it if necessary. Fields set by
    /// other managers and not present in `obj` are left alone.
    async fn apply(&self, obj: &K) -> Result<K, StoreError>;

    /// Replaces everything but the status of `obj`. Fails with
    /// [`StoreError::Conflict`] if `obj`'s resource version is outdated.
    async fn replace(&self, obj: &K) -> Result<K, StoreError>;

    /// Replaces only the status of `obj`. Fails with [`StoreError::Conflict`]
    /// if `obj`'s resource version is outdated.
    async fn replace_status(&self, obj: &K) -> Result<K, StoreError>;
}

/// An [`ObjectStore`] backed by the API server and a reflector cache.
pub struct KubeStore<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + std::hash::Hash + Clone,
{
    client: Client,
    cache: Store<K>,
}

impl<K> KubeStore<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + std::hash::Hash + Clone,
{
    pub fn new(client: Client, cache: Store<K>) -> Self {
        KubeStore { client, cache }
    }
}

impl<K> Debug for KubeStore<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeStore")
            .field("kind", &K::kind(&()))
            .finish_non_exhaustive()
    }
}

impl<K> KubeStore<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope> + Clone + 'static,
{
    fn api(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn namespace_of<K: Resource>(obj: &K) -> Result<String, StoreError> {
    obj.meta()
        .namespace
        .clone()
        .ok_or_else(|| StoreError::Other(anyhow::anyhow!("object has no namespace")))
}

pub(crate) fn labels_match(candidate: &BTreeMap<String, String>, wanted: &BTreeMap<String, String>) -> bool {
    wanted.iter().all(|(k, v)| candidate.get(k) == Some(v))
}

#[async_trait]
impl<K> ObjectStore<K> for KubeStore<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static,
{
    fn cached(&self, namespace: &str, name: &str) -> Option<K> {
        self.cache
            .get(&ObjectRef::new(name).within(namespace))
            .map(|obj| K::clone(&obj))
    }

    fn cached_list(&self, namespace: &str, labels: &BTreeMap<String, String>) -> Vec<K> {
        self.cache
            .state()
            .into_iter()
            .filter(|obj| {
                obj.meta().namespace.as_deref() == Some(namespace)
                    && labels_match(obj.labels(), labels)
            })
            .map(|obj| K::clone(&obj))
            .collect()
    }

    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        self.api(&namespace_of(obj)?)
            .create(&PostParams::default(), obj)
            .await
            .map_err(store_error)
    }

    async fn apply(&self, obj: &K) -> Result<K, StoreError> {
        apply_resource(&self.api(&namespace_of(obj)?), obj)
            .await
            .map_err(store_error)
    }

    async fn replace(&self, obj: &K) -> Result<K, StoreError> {
        self.api(&namespace_of(obj)?)
            .replace(&obj.name_any(), &PostParams::default(), obj)
            .await
            .map_err(store_error)
    }

    async fn replace_status(&self, obj: &K) -> Result<K, StoreError> {
        let body = serde_json::to_vec(obj).map_err(anyhow::Error::from)?;
        self.api(&namespace_of(obj)?)
            .replace_status(&obj.name_any(), &PostParams::default(), body)
            .await
            .map_err(store_error)
    }
}

/// The stores of every kind of object the cluster controller touches.
#[derive(Debug, Clone)]
pub struct Stores {
    pub clusters: Arc<dyn ObjectStore<Cluster>>,
    pub stateful_sets: Arc<dyn ObjectStore<StatefulSet>>,
    pub services: Arc<dyn ObjectStore<Service>>,
    pub secrets: Arc<dyn ObjectStore<Secret>>,
    pub pods: Arc<dyn ObjectStore<Pod>>,
}
