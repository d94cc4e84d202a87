// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Optimistic-concurrency writes of cluster status and object labels.
//!
//! The operator shares its objects with users, the platform and the agents.
//! Writes are made against the version of the object the operator last saw;
//! when someone else wrote in between, the write is rejected, the object is
//! re-read from the local cache, the same change is applied to the fresh
//! copy, and the write is tried again.
//!
//! Status and labels go through separate paths. A status write replaces the
//! whole status. A label write only adds or overwrites the given labels.

use std::collections::BTreeMap;
use std::fmt::Debug;

use kube::{Resource, ResourceExt};
use rds_ore::retry::Retry;
use rds_resources::crd::cluster::v1alpha1::{Cluster, ClusterStatus};
use tracing::debug;

use crate::store::{ObjectStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("{kind} {namespace}/{name} was still conflicting after {attempts} writes")]
    ConflictsExhausted {
        kind: String,
        namespace: String,
        name: String,
        attempts: usize,
    },
    #[error("{kind} {namespace}/{name} is not in the local cache")]
    NotCached {
        kind: String,
        namespace: String,
        name: String,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy)]
enum Path {
    Status,
    Metadata,
}

#[derive(Debug, Clone)]
pub struct Updater {
    retry: Retry,
}

impl Default for Updater {
    fn default() -> Self {
        Updater::new(Retry::conflict())
    }
}

impl Updater {
    pub fn new(retry: Retry) -> Self {
        Updater { retry }
    }

    /// Replaces the status of `cluster` with `status`.
    ///
    /// `cluster` may be out of date once this returns; re-read it from the
    /// cache rather than relying on it.
    pub async fn update_cluster_status(
        &self,
        store: &dyn ObjectStore<Cluster>,
        cluster: &Cluster,
        status: ClusterStatus,
    ) -> Result<(), UpdateError> {
        self.update(store, cluster, Path::Status, |cluster| {
            cluster.status = Some(status.clone());
            true
        })
        .await
    }

    /// Merges `labels` into the labels of `obj`, leaving others untouched.
    /// Nothing is written if `obj` already carries them.
    pub async fn update_labels<K>(
        &self,
        store: &dyn ObjectStore<K>,
        obj: &K,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), UpdateError>
    where
        K: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static,
    {
        self.update(store, obj, Path::Metadata, |obj| {
            let current = obj.labels_mut();
            let mut changed = false;
            for (k, v) in labels {
                if current.get(k) != Some(v) {
                    current.insert(k.clone(), v.clone());
                    changed = true;
                }
            }
            changed
        })
        .await
    }

    /// Applies `mutate` to `obj` and writes it, retrying against the cached
    /// copy on conflict. `mutate` reports whether it changed anything.
    async fn update<K, F>(
        &self,
        store: &dyn ObjectStore<K>,
        obj: &K,
        path: Path,
        mutate: F,
    ) -> Result<(), UpdateError>
    where
        K: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static,
        F: Fn(&mut K) -> bool + Send + Sync,
    {
        let kind = K::kind(&()).into_owned();
        let namespace = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        let mut current = obj.clone();
        let mut attempts = 0;
        loop {
            let mut next = current.clone();
            if !mutate(&mut next) {
                return Ok(());
            }
            attempts += 1;
            let result = match path {
                Path::Status => store.replace_status(&next).await,
                Path::Metadata => store.replace(&next).await,
            };
            match result {
                Ok(_) => return Ok(()),
                Err(StoreError::Conflict(e)) => {
                    if !self.retry.allows(attempts) {
                        return Err(UpdateError::ConflictsExhausted {
                            kind,
                            namespace,
                            name,
                            attempts,
                        });
                    }
                    debug!(%kind, %namespace, %name, attempts, "write conflicted, retrying: {}", e);
                    self.retry.sleep(attempts - 1).await;
                    current = store.cached(&namespace, &name).ok_or_else(|| {
                        UpdateError::NotCached {
                            kind: kind.clone(),
                            namespace: namespace.clone(),
                            name: name.clone(),
                        }
                    })?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
