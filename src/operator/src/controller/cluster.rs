// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Pod, Secret, Service};
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use maplit::btreemap;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use rds_ore::cli::KeyValueArg;
use rds_ore::retry::Retry;
use rds_resources::crd::cluster::v1alpha1::{
    Cluster, ClusterCondition, ClusterStatus, ConditionStatus,
};
use rds_resources::labels::{CLUSTER_LABEL, ROLE_LABEL};
use rds_resources::validation::{self, Validator};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::controller::Error;
use crate::k8s::{make_reflector, namespaced_or_all};
use crate::metrics::Metrics;
use crate::store::{KubeStore, StoreError, Stores};
use crate::updater::Updater;

pub mod resources;
pub mod roles;

use roles::{Member, MultiPrimaryRoles};

/// Why a cluster is not ready, in the order the conditions are checked.
pub mod reasons {
    pub const INVALID_SPEC: &str = "InvalidSpec";
    pub const RESOURCES_PENDING: &str = "ResourcesPending";
    pub const REPLICA_COUNT_MISMATCH: &str = "ReplicaCountMismatch";
    pub const MEMBERSHIP_INCOMPLETE: &str = "MembershipIncomplete";
    pub const ALL_MEMBERS_ONLINE: &str = "AllMembersOnline";
}

const ROOT_PASSWORD_LENGTH: usize = 16;

#[derive(clap::Args, Debug, Clone)]
pub struct ClusterControllerArgs {
    /// The number of clusters reconciled concurrently.
    #[clap(long, default_value = "5")]
    pub concurrency: u16,
    /// How often a cluster is reconciled when nothing about it changes.
    #[clap(long, value_parser = humantime::parse_duration, default_value = "30s")]
    pub resync_period: Duration,
    #[clap(long, value_parser = humantime::parse_duration, default_value = "5s")]
    pub requeue_backoff_base: Duration,
    #[clap(long, value_parser = humantime::parse_duration, default_value = "5m")]
    pub requeue_backoff_max: Duration,
    /// The MySQL server image repository. The tag is the cluster's version.
    #[clap(long, default_value = "mysql/mysql-server")]
    pub mysql_image: String,
    /// The agent image repository. The tag is the operator's version.
    #[clap(long, default_value = "rds/mysql-agent")]
    pub agent_image: String,
    /// The service account the cluster's pods run as. The agent needs to
    /// read and annotate the cluster's pods.
    #[clap(long)]
    pub agent_service_account: Option<String>,
    /// Labels applied to every generated object, as KEY=VALUE.
    #[clap(long)]
    pub service_label: Vec<KeyValueArg<String, String>>,
    /// How roles are labelled in clusters where every member accepts writes.
    #[clap(long, value_enum, default_value = "all-primary")]
    pub multi_primary_roles: MultiPrimaryRoles,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub resync_period: Duration,
    pub requeue_backoff: Retry,
    pub mysql_image: String,
    pub agent_image: String,
    pub agent_service_account: Option<String>,
    pub service_labels: BTreeMap<String, String>,
    pub multi_primary_roles: MultiPrimaryRoles,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            resync_period: Duration::from_secs(30),
            requeue_backoff: Retry::default()
                .initial_backoff(Duration::from_secs(5))
                .clamp_backoff(Duration::from_secs(300)),
            mysql_image: "mysql/mysql-server".into(),
            agent_image: "rds/mysql-agent".into(),
            agent_service_account: None,
            service_labels: BTreeMap::new(),
            multi_primary_roles: MultiPrimaryRoles::default(),
        }
    }
}

impl From<&ClusterControllerArgs> for Config {
    fn from(args: &ClusterControllerArgs) -> Self {
        Config {
            resync_period: args.resync_period,
            requeue_backoff: Retry::default()
                .initial_backoff(args.requeue_backoff_base)
                .clamp_backoff(args.requeue_backoff_max),
            mysql_image: args.mysql_image.clone(),
            agent_image: args.agent_image.clone(),
            agent_service_account: args.agent_service_account.clone(),
            service_labels: args
                .service_label
                .iter()
                .map(|kv| (kv.key.clone(), kv.value.clone()))
                .collect(),
            multi_primary_roles: args.multi_primary_roles,
        }
    }
}

/// What a reconciliation concluded about a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// The cluster is gone; nothing is tracked for it anymore.
    Forgotten,
    /// The spec was rejected and will not be looked at again until it
    /// changes.
    Invalid,
    /// Generated objects match the spec and the status is up to date.
    Applied,
}

fn key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

pub struct Context {
    config: Config,
    stores: Stores,
    validator: Validator,
    updater: Updater,
    metrics: Arc<Metrics>,
    failures: Mutex<BTreeMap<String, usize>>,
    managed: Mutex<BTreeSet<String>>,
}

impl Context {
    pub fn new(config: Config, stores: Stores, metrics: Arc<Metrics>) -> Self {
        Self {
            config,
            stores,
            validator: Validator::default(),
            updater: Updater::default(),
            metrics,
            failures: Default::default(),
            managed: Default::default(),
        }
    }

    pub fn with_updater(mut self, updater: Updater) -> Self {
        self.updater = updater;
        self
    }

    fn set_managed(&self, key: &str, managed: bool) {
        let mut managed_set = self.managed.lock().expect("lock poisoned");
        if managed {
            managed_set.insert(key.to_owned());
        } else {
            managed_set.remove(key);
        }
        self.metrics
            .managed_clusters
            .set(u64::try_from(managed_set.len()).unwrap_or(u64::MAX));
    }

    /// Records a failed reconciliation and returns how many happened in a
    /// row.
    fn record_failure(&self, key: &str) -> usize {
        let mut failures = self.failures.lock().expect("lock poisoned");
        let count = failures.entry(key.to_owned()).or_default();
        *count += 1;
        let count = *count;
        self.metrics
            .requeued
            .set(u64::try_from(failures.len()).unwrap_or(u64::MAX));
        count
    }

    fn clear_failures(&self, key: &str) {
        let mut failures = self.failures.lock().expect("lock poisoned");
        if failures.remove(key).is_some() {
            self.metrics
                .requeued
                .set(u64::try_from(failures.len()).unwrap_or(u64::MAX));
        }
    }

    /// Releases everything held for a cluster that no longer exists.
    pub fn forget(&self, namespace: &str, name: &str) {
        let key = key(namespace, name);
        debug!(cluster = %key, "forgetting cluster");
        self.set_managed(&key, false);
        self.clear_failures(&key);
    }

    /// How long to wait before retrying a cluster that failed to reconcile.
    pub fn requeue_after_failure(&self, namespace: &str, name: &str) -> Duration {
        let failures = self.record_failure(&key(namespace, name));
        self.config.requeue_backoff.backoff(failures.saturating_sub(1))
    }

    /// Writes `status` unless the cluster already shows it.
    async fn update_status(&self, cluster: &Cluster, status: ClusterStatus) -> Result<(), Error> {
        if !cluster
            .status
            .as_ref()
            .map_or(true, |current| current.needs_update(&status))
        {
            trace!("status unchanged");
            return Ok(());
        }
        self.updater
            .update_cluster_status(&*self.stores.clusters, cluster, status)
            .await?;
        Ok(())
    }

    /// Creates the generated root password secret if it is missing. An
    /// existing secret is never touched.
    async fn ensure_root_password(&self, cluster: &Cluster) -> Result<(), Error> {
        if !cluster.generates_root_password() {
            return Ok(());
        }
        let name = cluster.root_password_secret_name();
        if self
            .stores
            .secrets
            .cached(&cluster.namespace(), &name)
            .is_some()
        {
            return Ok(());
        }
        let password: String = thread_rng()
            .sample_iter(&Alphanumeric)
            .take(ROOT_PASSWORD_LENGTH)
            .map(char::from)
            .collect();
        let secret = resources::create_root_password_secret_object(cluster, password);
        match self.stores.secrets.create(&secret).await {
            Ok(_) => {
                info!(secret = %name, "generated root password");
                Ok(())
            }
            Err(StoreError::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Reconciles the cluster `namespace/name` once.
    #[instrument(skip(self))]
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<Action, Error> {
        let result = self.apply(namespace, name).await;
        let (label, action) = match &result {
            Ok(Reconciled::Forgotten) => ("forgotten", Action::await_change()),
            Ok(Reconciled::Invalid) => ("invalid", Action::await_change()),
            Ok(Reconciled::Applied) => ("ok", Action::requeue(self.config.resync_period)),
            Err(_) => ("error", Action::await_change()),
        };
        self.metrics.reconciles.with_label_values(&[label]).inc();
        result.map(|_| action)
    }

    async fn apply(&self, namespace: &str, name: &str) -> Result<Reconciled, Error> {
        let key = key(namespace, name);
        let Some(cluster) = self.stores.clusters.cached(namespace, name) else {
            self.forget(namespace, name);
            return Ok(Reconciled::Forgotten);
        };
        self.set_managed(&key, true);

        let errors = self.validator.validate(&cluster);
        if !errors.is_empty() {
            let message = validation::summarize(&errors);
            warn!("invalid cluster spec: {}", message);
            let condition = ClusterCondition::ready(
                ConditionStatus::False,
                reasons::INVALID_SPEC,
                message,
                Utc::now(),
            );
            self.update_status(&cluster, cluster.status().with_condition(condition))
                .await?;
            self.clear_failures(&key);
            return Ok(Reconciled::Invalid);
        }

        self.ensure_root_password(&cluster).await?;

        trace!("applying generated objects");
        let stateful_set = resources::Resources::new(&self.config, &cluster)
            .apply(&self.stores)
            .await?;
        let headless_exists = self
            .stores
            .services
            .cached(namespace, &cluster.service_name())
            .is_some();
        let primary_exists = self
            .stores
            .services
            .cached(namespace, &cluster.primary_service_name())
            .is_some();

        let selector = btreemap! { CLUSTER_LABEL.to_owned() => cluster.name_any() };
        let members = roles::observe(&cluster, self.stores.pods.cached_list(namespace, &selector));
        let assigned = roles::assign(
            &members,
            cluster.spec.multi_master,
            self.config.multi_primary_roles,
        );
        for (pod, role) in roles::label_changes(&members, &assigned) {
            debug!(pod = %pod.name_any(), %role, "labelling member");
            let labels = btreemap! { ROLE_LABEL.to_owned() => role.label_value().to_owned() };
            self.updater
                .update_labels(&*self.stores.pods, pod, &labels)
                .await?;
        }

        let condition = ready_condition(
            &cluster,
            headless_exists && primary_exists,
            &stateful_set,
            &members,
        );
        debug!(
            status = %condition.status,
            reason = %condition.reason,
            "{}",
            condition.message
        );
        self.update_status(&cluster, cluster.status().with_condition(condition))
            .await?;
        self.clear_failures(&key);
        Ok(Reconciled::Applied)
    }
}

/// Computes the Ready condition from the first unmet requirement: generated
/// objects exist and are rolled out, the stateful set runs the expected
/// number of pods, and every expected member reports itself synced.
fn ready_condition(
    cluster: &Cluster,
    services_exist: bool,
    stateful_set: &StatefulSet,
    members: &[Member],
) -> ClusterCondition {
    let now = Utc::now();
    let expected = cluster.members();
    let not_ready = |reason: &str, message: String| {
        ClusterCondition::ready(ConditionStatus::False, reason, message, now)
    };

    let generation = stateful_set.metadata.generation;
    let rolled_out = stateful_set.status.as_ref().filter(|status| {
        generation.is_none() || status.observed_generation >= generation
    });
    let Some(sts_status) = rolled_out.filter(|_| services_exist) else {
        return not_ready(
            reasons::RESOURCES_PENDING,
            "waiting for the stateful set and services to be created and rolled out".into(),
        );
    };
    if sts_status.replicas != expected {
        return not_ready(
            reasons::REPLICA_COUNT_MISMATCH,
            format!("{} of {} replicas exist", sts_status.replicas, expected),
        );
    }
    let synced = members
        .iter()
        .filter(|m| i64::from(m.ordinal) < i64::from(expected) && m.is_synced())
        .count();
    let synced = i32::try_from(synced).unwrap_or(i32::MAX);
    if synced < expected {
        return not_ready(
            reasons::MEMBERSHIP_INCOMPLETE,
            format!("{} of {} members online", synced, expected),
        );
    }
    ClusterCondition::ready(
        ConditionStatus::True,
        reasons::ALL_MEMBERS_ONLINE,
        format!("{} of {} members online", synced, expected),
        now,
    )
}

async fn reconcile(cluster: Arc<Cluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    ctx.reconcile(&cluster.namespace(), &cluster.name_any())
        .await
}

fn error_policy(cluster: Arc<Cluster>, error: &Error, ctx: Arc<Context>) -> Action {
    let delay = ctx.requeue_after_failure(&cluster.namespace(), &cluster.name_any());
    warn!(
        cluster = %cluster.name_any(),
        "reconciliation failed, retrying in {:?}: {}",
        delay,
        error
    );
    Action::requeue(delay)
}

/// Watches clusters and everything generated from them, and reconciles each
/// cluster whenever any of it changes, until `cancel` fires.
pub async fn run(
    client: Client,
    namespace: Option<String>,
    args: ClusterControllerArgs,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) -> Result<(), anyhow::Error> {
    let namespace = namespace.as_deref();
    let owned = watcher::Config::default().labels(CLUSTER_LABEL);

    let controller = Controller::new(
        namespaced_or_all::<Cluster>(client.clone(), namespace),
        watcher::Config::default(),
    );
    let stateful_sets = make_reflector(
        namespaced_or_all::<StatefulSet>(client.clone(), namespace),
        owned.clone(),
    )
    .await;
    let services = make_reflector(
        namespaced_or_all::<Service>(client.clone(), namespace),
        owned.clone(),
    )
    .await;
    let secrets = make_reflector(
        namespaced_or_all::<Secret>(client.clone(), namespace),
        owned.clone(),
    )
    .await;
    let pods = make_reflector(
        namespaced_or_all::<Pod>(client.clone(), namespace),
        owned.clone(),
    )
    .await;
    let stores = Stores {
        clusters: Arc::new(KubeStore::new(client.clone(), controller.store())),
        stateful_sets: Arc::new(KubeStore::new(client.clone(), stateful_sets)),
        services: Arc::new(KubeStore::new(client.clone(), services)),
        secrets: Arc::new(KubeStore::new(client.clone(), secrets)),
        pods: Arc::new(KubeStore::new(client.clone(), pods)),
    };
    let ctx = Arc::new(Context::new(Config::from(&args), stores, metrics));

    info!(concurrency = args.concurrency, "starting cluster controller");
    controller
        .owns(
            namespaced_or_all::<StatefulSet>(client.clone(), namespace),
            owned.clone(),
        )
        .owns(
            namespaced_or_all::<Service>(client.clone(), namespace),
            owned.clone(),
        )
        .watches(
            namespaced_or_all::<Pod>(client.clone(), namespace),
            owned,
            |pod| {
                let cluster = pod.labels().get(CLUSTER_LABEL)?;
                Some(ObjectRef::new(cluster).within(&pod.namespace()?))
            },
        )
        .with_config(controller::Config::default().concurrency(args.concurrency))
        .graceful_shutdown_on(cancel.cancelled_owned())
        .run(reconcile, error_policy, Arc::clone(&ctx))
        .for_each(|result| {
            match result {
                Ok((cluster, _)) => trace!(cluster = %cluster.name, "reconciled"),
                Err(controller::Error::ObjectNotFound(cluster)) => {
                    ctx.forget(cluster.namespace.as_deref().unwrap_or_default(), &cluster.name);
                }
                Err(e) => debug!("controller event: {}", e),
            }
            futures::future::ready(())
        })
        .await;
    info!("cluster controller stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::apps::v1::{StatefulSetSpec, StatefulSetStatus};
    use k8s_openapi::api::core::v1::{Affinity, LocalObjectReference, PersistentVolumeClaim};
    use rds_ore::metrics::MetricsRegistry;
    use rds_resources::crd::cluster::v1alpha1::ClusterSpec;

    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::ObjectStore;

    struct Harness {
        clusters: Arc<MemoryStore<Cluster>>,
        stateful_sets: Arc<MemoryStore<StatefulSet>>,
        services: Arc<MemoryStore<Service>>,
        secrets: Arc<MemoryStore<Secret>>,
        pods: Arc<MemoryStore<Pod>>,
        ctx: Context,
        metrics: Arc<Metrics>,
    }

    impl Harness {
        fn new() -> Self {
            let clusters = Arc::new(MemoryStore::<Cluster>::new());
            let stateful_sets = Arc::new(MemoryStore::<StatefulSet>::new());
            let services = Arc::new(MemoryStore::<Service>::new());
            let secrets = Arc::new(MemoryStore::<Secret>::new());
            let pods = Arc::new(MemoryStore::<Pod>::new());
            let stores = Stores {
                clusters: Arc::clone(&clusters) as _,
                stateful_sets: Arc::clone(&stateful_sets) as _,
                services: Arc::clone(&services) as _,
                secrets: Arc::clone(&secrets) as _,
                pods: Arc::clone(&pods) as _,
            };
            let metrics = Arc::new(Metrics::register_into(&MetricsRegistry::new()));
            let ctx = Context::new(Config::default(), stores, Arc::clone(&metrics));
            Harness {
                clusters,
                stateful_sets,
                services,
                secrets,
                pods,
                ctx,
                metrics,
            }
        }

        fn writes(&self) -> usize {
            self.clusters.writes()
                + self.stateful_sets.writes()
                + self.services.writes()
                + self.secrets.writes()
                + self.pods.writes()
        }

        fn ready(&self) -> ClusterCondition {
            self.clusters
                .cached("db", "orders")
                .unwrap()
                .status()
                .ready()
                .cloned()
                .unwrap()
        }
    }

    fn cluster(members: i32) -> Cluster {
        let mut cluster = Cluster::new(
            "orders",
            ClusterSpec {
                version: "8.0.20".into(),
                members,
                ..Default::default()
            },
        );
        cluster.metadata.namespace = Some("db".into());
        cluster
    }

    #[tokio::test]
    async fn test_invalid_spec_creates_nothing() {
        let h = Harness::new();
        h.clusters.insert(cluster(12));

        let action = h.ctx.reconcile("db", "orders").await.unwrap();
        assert_eq!(action, Action::await_change());
        let ready = h.ready();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, reasons::INVALID_SPEC);
        assert!(ready.message.contains("spec.members"));
        assert!(h.stateful_sets.list().is_empty());
        assert!(h.services.list().is_empty());
        assert!(h.secrets.list().is_empty());

        // Nothing changes until the spec does.
        let writes = h.writes();
        h.ctx.reconcile("db", "orders").await.unwrap();
        assert_eq!(h.writes(), writes);
    }

    #[tokio::test]
    async fn test_creates_generated_objects() {
        let h = Harness::new();
        h.clusters.insert(cluster(3));

        let action = h.ctx.reconcile("db", "orders").await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(30)));

        let sts = h.stateful_sets.cached("db", "orders").unwrap();
        assert_eq!(sts.spec.as_ref().unwrap().replicas, Some(3));
        assert!(h.services.cached("db", "orders").is_some());
        assert!(h.services.cached("db", "orders-primary").is_some());
        let secret = h.secrets.cached("db", "orders-root-password").unwrap();
        let password = &secret.string_data.unwrap()[resources::ROOT_PASSWORD_KEY];
        assert_eq!(password.len(), ROOT_PASSWORD_LENGTH);
        assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));

        let ready = h.ready();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, reasons::RESOURCES_PENDING);

        // Created, but the platform has not observed the latest generation.
        h.stateful_sets.modify("db", "orders", |sts| {
            sts.status = Some(StatefulSetStatus {
                observed_generation: Some(0),
                replicas: 3,
                ..Default::default()
            });
        });
        h.ctx.reconcile("db", "orders").await.unwrap();
        let ready = h.ready();
        assert_eq!(ready.reason, reasons::RESOURCES_PENDING);
        assert!(ready.message.contains("rolled out"));
    }

    #[tokio::test]
    async fn test_existing_secret_is_kept() {
        let h = Harness::new();
        let c = h.clusters.insert(cluster(1));
        h.secrets.insert(resources::create_root_password_secret_object(
            &c,
            "hunter2".into(),
        ));
        h.ctx.reconcile("db", "orders").await.unwrap();
        let secret = h.secrets.cached("db", "orders-root-password").unwrap();
        assert_eq!(
            secret.string_data.unwrap()[resources::ROOT_PASSWORD_KEY],
            "hunter2"
        );
        assert_eq!(h.secrets.writes(), 0);
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let h = Harness::new();
        h.clusters.insert(cluster(3));
        h.ctx.reconcile("db", "orders").await.unwrap();

        // The platform rolls the stateful set out.
        h.stateful_sets.modify("db", "orders", |sts| {
            sts.status = Some(StatefulSetStatus {
                observed_generation: sts.metadata.generation,
                replicas: 3,
                ..Default::default()
            });
        });
        h.ctx.reconcile("db", "orders").await.unwrap();
        let ready = h.ready();
        assert_eq!(ready.reason, reasons::MEMBERSHIP_INCOMPLETE);
        assert_eq!(ready.message, "0 of 3 members online");

        let writes = h.writes();
        h.ctx.reconcile("db", "orders").await.unwrap();
        assert_eq!(h.writes(), writes);
        assert_eq!(h.ready(), ready);
    }

    #[tokio::test]
    async fn test_replica_count_mismatch() {
        let h = Harness::new();
        h.clusters.insert(cluster(3));
        h.ctx.reconcile("db", "orders").await.unwrap();
        h.stateful_sets.modify("db", "orders", |sts| {
            sts.status = Some(StatefulSetStatus {
                observed_generation: sts.metadata.generation,
                replicas: 2,
                ..Default::default()
            });
        });
        h.ctx.reconcile("db", "orders").await.unwrap();
        assert_eq!(h.ready().reason, reasons::REPLICA_COUNT_MISMATCH);
    }

    #[tokio::test]
    async fn test_user_fields_survive() {
        let h = Harness::new();
        h.clusters.insert(cluster(3));
        h.ctx.reconcile("db", "orders").await.unwrap();
        h.stateful_sets.modify("db", "orders", |sts| {
            sts.annotations_mut()
                .insert("owner".into(), "payments".into());
            let spec: &mut StatefulSetSpec = sts.spec.as_mut().unwrap();
            spec.revision_history_limit = Some(3);
        });
        let writes = h.stateful_sets.writes();
        h.ctx.reconcile("db", "orders").await.unwrap();
        assert_eq!(h.stateful_sets.writes(), writes);

        h.clusters.modify("db", "orders", |c| c.spec.members = 5);
        h.ctx.reconcile("db", "orders").await.unwrap();
        let sts = h.stateful_sets.cached("db", "orders").unwrap();
        assert_eq!(sts.spec.as_ref().unwrap().replicas, Some(5));
        assert_eq!(sts.spec.as_ref().unwrap().revision_history_limit, Some(3));
        assert_eq!(
            sts.annotations().get("owner").map(String::as_str),
            Some("payments")
        );
    }

    #[tokio::test]
    async fn test_spec_changes_reach_stateful_set() {
        let h = Harness::new();
        h.clusters.insert(cluster(3));
        h.ctx.reconcile("db", "orders").await.unwrap();
        let writes = h.stateful_sets.writes();

        h.clusters.modify("db", "orders", |c| {
            c.spec.node_selector = Some(BTreeMap::from([("disk".into(), "ssd".into())]));
            c.spec.affinity = Some(Affinity::default());
            c.spec.config = Some(LocalObjectReference {
                name: "my-cnf".into(),
            });
            c.spec.root_password_secret = Some(LocalObjectReference {
                name: "mine".into(),
            });
            c.spec.volume_claim_template = Some(PersistentVolumeClaim::default());
        });
        h.ctx.reconcile("db", "orders").await.unwrap();
        assert_eq!(h.stateful_sets.writes(), writes + 1);

        let sts = h.stateful_sets.cached("db", "orders").unwrap();
        let spec = sts.spec.as_ref().unwrap();
        assert_eq!(
            spec.volume_claim_templates.as_ref().unwrap()[0]
                .metadata
                .name
                .as_deref(),
            Some("data")
        );
        let pod = spec.template.spec.as_ref().unwrap();
        assert_eq!(
            pod.node_selector,
            Some(BTreeMap::from([("disk".into(), "ssd".into())]))
        );
        assert_eq!(pod.affinity, Some(Affinity::default()));
        let volumes = pod.volumes.as_ref().unwrap();
        assert_eq!(volumes[0].config_map.as_ref().unwrap().name, "my-cnf");
        let mysql = &pod.containers[0];
        let mounts = mysql.volume_mounts.as_ref().unwrap();
        assert!(mounts.iter().any(|m| m.mount_path == "/etc/my.cnf"));
        assert!(mounts.iter().any(|m| m.mount_path == "/var/lib/mysql"));
        let secret_ref = mysql.env.as_ref().unwrap()[0]
            .value_from
            .as_ref()
            .and_then(|from| from.secret_key_ref.as_ref())
            .map(|selector| selector.name.clone());
        assert_eq!(secret_ref.as_deref(), Some("mine"));

        // Settled again once applied.
        h.ctx.reconcile("db", "orders").await.unwrap();
        assert_eq!(h.stateful_sets.writes(), writes + 1);
    }

    #[tokio::test]
    async fn test_deleted_cluster_is_forgotten() {
        let h = Harness::new();
        h.clusters.insert(cluster(1));
        h.ctx.reconcile("db", "orders").await.unwrap();
        assert_eq!(h.metrics.managed_clusters.get(), 1);

        h.clusters.remove("db", "orders");
        let action = h.ctx.reconcile("db", "orders").await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(h.metrics.managed_clusters.get(), 0);
    }

    #[tokio::test]
    async fn test_transient_errors_back_off() {
        let h = Harness::new();
        h.clusters.insert(cluster(1));
        h.services.inject_failures(2);

        assert!(h.ctx.reconcile("db", "orders").await.is_err());
        assert_eq!(
            h.ctx.requeue_after_failure("db", "orders"),
            Duration::from_secs(5)
        );
        assert!(h.ctx.reconcile("db", "orders").await.is_err());
        assert_eq!(
            h.ctx.requeue_after_failure("db", "orders"),
            Duration::from_secs(10)
        );
        assert_eq!(h.metrics.requeued.get(), 1);

        h.ctx.reconcile("db", "orders").await.unwrap();
        assert_eq!(h.metrics.requeued.get(), 0);
        assert_eq!(
            h.metrics
                .reconciles
                .with_label_values(&["error"])
                .get(),
            2
        );
    }
}
