// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! An in-process [`ObjectStore`] with the API server's concurrency rules.
//!
//! Every successful write bumps the object's resource version, and writes
//! carrying an outdated version are rejected with a conflict. Objects whose
//! `spec` changes get a new `metadata.generation`. The cache is always up to
//! date. Write attempts are counted, and conflicts or failures can be
//! injected into upcoming writes.

use std::collections::{BTreeMap, VecDeque};
use std::fmt::Debug;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::store::{labels_match, ObjectStore, StoreError};

#[derive(Debug, Clone, Copy)]
enum Fault {
    Conflict,
    Unavailable,
}

#[derive(Debug, Clone, Copy)]
enum Write {
    Create,
    Apply,
    Replace,
    ReplaceStatus,
}

#[derive(Debug)]
struct State<K> {
    objects: BTreeMap<(String, String), K>,
    next_version: u64,
    writes: usize,
    faults: VecDeque<Fault>,
}

#[derive(Debug)]
pub struct MemoryStore<K> {
    state: Mutex<State<K>>,
}

impl<K> Default for MemoryStore<K> {
    fn default() -> Self {
        MemoryStore {
            state: Mutex::new(State {
                objects: BTreeMap::new(),
                next_version: 1,
                writes: 0,
                faults: VecDeque::new(),
            }),
        }
    }
}

fn key_of<K: Resource>(obj: &K) -> Result<(String, String), StoreError> {
    let meta = obj.meta();
    match (&meta.namespace, &meta.name) {
        (Some(namespace), Some(name)) => Ok((namespace.clone(), name.clone())),
        _ => Err(StoreError::Other(anyhow::anyhow!(
            "object must have a namespace and a name"
        ))),
    }
}

fn to_value<K: Serialize>(obj: &K) -> Result<Value, StoreError> {
    serde_json::to_value(obj).map_err(|e| StoreError::Other(e.into()))
}

fn from_value<K: DeserializeOwned>(value: Value) -> Result<K, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Other(e.into()))
}

/// Recursively merges `patch` into `base`. Objects merge key by key,
/// anything else is replaced.
fn merge(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (k, v) in patch {
                match base.get_mut(&k) {
                    Some(existing) => merge(existing, v),
                    None => {
                        base.insert(k, v);
                    }
                }
            }
        }
        (base, patch) => *base = patch,
    }
}

impl<K> MemoryStore<K>
where
    K: Resource + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().expect("lock poisoned")
    }

    /// Stores `obj` as the platform would, without counting a write.
    ///
    /// Panics if `obj` lacks a namespace or a name.
    pub fn insert(&self, obj: K) -> K {
        let mut state = self.lock();
        let key = key_of(&obj).expect("inserted objects are named");
        let obj = state.stamp(obj, None);
        state.objects.insert(key, obj.clone());
        obj
    }

    /// Changes an object out of band, as another writer would, without
    /// counting a write. Returns the updated object.
    pub fn modify<F>(&self, namespace: &str, name: &str, f: F) -> Option<K>
    where
        F: FnOnce(&mut K),
    {
        let mut state = self.lock();
        let key = (namespace.to_owned(), name.to_owned());
        let previous = state.objects.get(&key)?.clone();
        let mut obj = previous.clone();
        f(&mut obj);
        let obj = state.stamp(obj, Some(&previous));
        state.objects.insert(key, obj.clone());
        Some(obj)
    }

    pub fn remove(&self, namespace: &str, name: &str) -> Option<K> {
        self.lock()
            .objects
            .remove(&(namespace.to_owned(), name.to_owned()))
    }

    pub fn list(&self) -> Vec<K> {
        self.lock().objects.values().cloned().collect()
    }

    /// The number of write attempts made through [`ObjectStore`], including
    /// rejected ones.
    pub fn writes(&self) -> usize {
        self.lock().writes
    }

    /// Makes the next `n` writes fail with a conflict.
    pub fn inject_conflicts(&self, n: usize) {
        let mut state = self.lock();
        state.faults.extend(std::iter::repeat(Fault::Conflict).take(n));
    }

    /// Makes the next `n` writes fail as if the API server were down.
    pub fn inject_failures(&self, n: usize) {
        let mut state = self.lock();
        state.faults.extend(std::iter::repeat(Fault::Unavailable).take(n));
    }

    fn write(&self, obj: &K, write: Write) -> Result<K, StoreError> {
        let mut state = self.lock();
        state.writes += 1;
        match state.faults.pop_front() {
            Some(Fault::Conflict) => {
                return Err(StoreError::Conflict(format!(
                    "injected conflict on {}",
                    obj.name_any()
                )))
            }
            Some(Fault::Unavailable) => {
                return Err(StoreError::Other(anyhow::anyhow!(
                    "injected failure on {}",
                    obj.name_any()
                )))
            }
            None => {}
        }

        let key = key_of(obj)?;
        let current = state.objects.get(&key).cloned();
        let next = match (write, current) {
            (Write::Create, Some(_)) => return Err(StoreError::AlreadyExists(key.1)),
            (Write::Create | Write::Apply, None) => state.stamp(obj.clone(), None),
            (Write::Apply, Some(current)) => {
                let mut value = to_value(&current)?;
                let mut patch = to_value(obj)?;
                if let Value::Object(patch) = &mut patch {
                    patch.remove("status");
                    if let Some(Value::Object(meta)) = patch.get_mut("metadata") {
                        meta.remove("resourceVersion");
                    }
                }
                merge(&mut value, patch);
                state.stamp(from_value(value)?, Some(&current))
            }
            (Write::Replace | Write::ReplaceStatus, None) => {
                return Err(StoreError::NotFound(key.1))
            }
            (Write::Replace, Some(current)) => {
                check_version(&current, obj)?;
                let mut value = to_value(obj)?;
                if let Value::Object(value) = &mut value {
                    match to_value(&current)?.get("status") {
                        Some(status) => value.insert("status".into(), status.clone()),
                        None => value.remove("status"),
                    };
                }
                state.stamp(from_value(value)?, Some(&current))
            }
            (Write::ReplaceStatus, Some(current)) => {
                check_version(&current, obj)?;
                let mut value = to_value(&current)?;
                if let Value::Object(value) = &mut value {
                    match to_value(obj)?.get("status") {
                        Some(status) => value.insert("status".into(), status.clone()),
                        None => value.remove("status"),
                    };
                }
                state.stamp(from_value(value)?, Some(&current))
            }
        };
        state.objects.insert(key, next.clone());
        Ok(next)
    }
}

fn check_version<K: Resource>(current: &K, obj: &K) -> Result<(), StoreError> {
    match &obj.meta().resource_version {
        Some(version) if Some(version) != current.meta().resource_version.as_ref() => {
            Err(StoreError::Conflict(format!(
                "{} was modified: expected version {}, found {}",
                obj.name_any(),
                version,
                current.meta().resource_version.as_deref().unwrap_or("none"),
            )))
        }
        _ => Ok(()),
    }
}

impl<K> State<K>
where
    K: Resource + Serialize,
{
    /// Assigns the metadata the API server maintains to a new revision of an
    /// object.
    fn stamp(&mut self, mut obj: K, previous: Option<&K>) -> K {
        let version = self.next_version;
        self.next_version += 1;
        let spec_changed = previous.map_or(true, |previous| {
            let spec = |k: &K| serde_json::to_value(k).ok().and_then(|v| v.get("spec").cloned());
            spec(previous) != spec(&obj)
        });
        let meta = obj.meta_mut();
        meta.resource_version = Some(version.to_string());
        match previous {
            None => {
                meta.uid = Some(format!("{:08x}", version));
                meta.generation = Some(1);
            }
            Some(previous) => {
                let previous = previous.meta();
                meta.uid = previous.uid.clone();
                let generation = previous.generation.unwrap_or(1);
                meta.generation = Some(if spec_changed {
                    generation + 1
                } else {
                    generation
                });
            }
        }
        obj
    }
}

#[async_trait]
impl<K> ObjectStore<K> for MemoryStore<K>
where
    K: Resource + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn cached(&self, namespace: &str, name: &str) -> Option<K> {
        self.lock()
            .objects
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned()
    }

    fn cached_list(&self, namespace: &str, labels: &BTreeMap<String, String>) -> Vec<K> {
        self.lock()
            .objects
            .iter()
            .filter(|((ns, _), obj)| ns == namespace && labels_match(obj.labels(), labels))
            .map(|(_, obj)| obj.clone())
            .collect()
    }

    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        self.write(obj, Write::Create)
    }

    async fn apply(&self, obj: &K) -> Result<K, StoreError> {
        self.write(obj, Write::Apply)
    }

    async fn replace(&self, obj: &K) -> Result<K, StoreError> {
        self.write(obj, Write::Replace)
    }

    async fn replace_status(&self, obj: &K) -> Result<K, StoreError> {
        self.write(obj, Write::ReplaceStatus)
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{ConfigMap, Pod, PodSpec, PodStatus};
    use kube::api::ObjectMeta;

    use super::*;

    fn pod(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                namespace: Some("db".into()),
                name: Some(name.into()),
                labels: Some(BTreeMap::from([("app".into(), "mysql".into())])),
                ..Default::default()
            },
            spec: Some(PodSpec::default()),
            status: None,
        }
    }

    #[tokio::test]
    async fn test_versions_and_conflicts() {
        let store = MemoryStore::new();
        let created = store.create(&pod("a")).await.unwrap();
        assert_eq!(created.metadata.resource_version.as_deref(), Some("1"));
        assert!(matches!(
            store.create(&pod("a")).await,
            Err(StoreError::AlreadyExists(_))
        ));

        let mut update = created.clone();
        update.labels_mut().insert("role".into(), "primary".into());
        let updated = store.replace(&update).await.unwrap();
        assert_eq!(updated.metadata.resource_version.as_deref(), Some("2"));
        assert_eq!(updated.metadata.uid, created.metadata.uid);

        // `update` still carries version 1.
        assert!(matches!(
            store.replace(&update).await,
            Err(StoreError::Conflict(_))
        ));
        assert_eq!(store.writes(), 4);
    }

    #[tokio::test]
    async fn test_status_and_spec_are_separate() {
        let store = MemoryStore::new();
        let created = store.create(&pod("a")).await.unwrap();

        let mut with_status = created.clone();
        with_status.status = Some(PodStatus {
            phase: Some("Running".into()),
            ..Default::default()
        });
        with_status.labels_mut().insert("ignored".into(), "yes".into());
        let written = store.replace_status(&with_status).await.unwrap();
        assert_eq!(
            written.status.as_ref().unwrap().phase.as_deref(),
            Some("Running")
        );
        assert!(!written.labels().contains_key("ignored"));

        let mut relabel = store.cached("db", "a").unwrap();
        relabel.status = None;
        relabel.labels_mut().insert("kept".into(), "yes".into());
        let written = store.replace(&relabel).await.unwrap();
        assert!(written.status.is_some());
        assert!(written.labels().contains_key("kept"));
    }

    #[tokio::test]
    async fn test_apply_merges() {
        let store = MemoryStore::new();
        let mut cm = ConfigMap {
            metadata: ObjectMeta {
                namespace: Some("db".into()),
                name: Some("cfg".into()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([("a".into(), "1".into())])),
            ..Default::default()
        };
        store.apply(&cm).await.unwrap();
        store.modify("db", "cfg", |cm| {
            cm.labels_mut().insert("injected".into(), "by-platform".into());
        });
        cm.data = Some(BTreeMap::from([("b".into(), "2".into())]));
        let applied = store.apply(&cm).await.unwrap();
        let data = applied.data.unwrap();
        assert_eq!(data.len(), 2);
        assert!(applied.metadata.labels.unwrap().contains_key("injected"));
    }

    #[tokio::test]
    async fn test_generation_follows_spec() {
        let store = MemoryStore::new();
        let created = store.apply(&pod("a")).await.unwrap();
        assert_eq!(created.metadata.generation, Some(1));
        let same = store.apply(&pod("a")).await.unwrap();
        assert_eq!(same.metadata.generation, Some(1));
        let mut changed = pod("a");
        changed.spec.as_mut().unwrap().hostname = Some("a".into());
        let changed = store.apply(&changed).await.unwrap();
        assert_eq!(changed.metadata.generation, Some(2));
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let store = MemoryStore::new();
        store.inject_conflicts(1);
        store.inject_failures(1);
        assert!(matches!(
            store.create(&pod("a")).await,
            Err(StoreError::Conflict(_))
        ));
        assert!(matches!(
            store.create(&pod("a")).await,
            Err(StoreError::Other(_))
        ));
        assert!(store.create(&pod("a")).await.is_ok());
        assert_eq!(store.writes(), 3);
        let listed = store.cached_list(
            "db",
            &BTreeMap::from([("app".to_owned(), "mysql".to_owned())]),
        );
        assert_eq!(listed.len(), 1);
    }
}
