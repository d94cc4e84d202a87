// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Drives a cluster through its lifecycle with the operator, the platform
//! and every instance's agent simulated in process.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetStatus};
use k8s_openapi::api::core::v1::{Pod, Secret, Service};
use kube::api::ObjectMeta;
use kube::ResourceExt;
use rds_agent::health::Health;
use rds_agent::instance::Instance;
use rds_agent::manager::{self, LocalClusterManager, SyncError, SyncState};
use rds_agent::metrics::Metrics as AgentMetrics;
use rds_agent::registry::{peers_from_pods, MembershipRegistry, Peer};
use rds_mysqlsh::testing::FakeGroup;
use rds_mysqlsh::AdminShell;
use rds_operator::controller::cluster::{reasons, Config, Context};
use rds_operator::metrics::Metrics;
use rds_operator::store::memory::MemoryStore;
use rds_operator::store::{ObjectStore, Stores};
use rds_ore::metrics::MetricsRegistry;
use rds_resources::crd::cluster::v1alpha1::{
    Cluster, ClusterCondition, ClusterSpec, ConditionStatus,
};
use rds_resources::labels::{MEMBERSHIP_ANNOTATION, ROLE_LABEL};
use rds_resources::member::{JoinStatus, MemberStatus, Role};

const NAMESPACE: &str = "db";
const NAME: &str = "orders";

/// Publishes membership on pods held in a [`MemoryStore`], as the agent does
/// through the API server.
#[derive(Debug)]
struct PodRegistry {
    pods: Arc<MemoryStore<Pod>>,
    instance: Instance,
}

#[async_trait]
impl MembershipRegistry for PodRegistry {
    async fn publish(&self, status: &MemberStatus) -> Result<(), anyhow::Error> {
        let value = status.to_annotation_value();
        self.pods
            .modify(NAMESPACE, &self.instance.pod_name(), |pod| {
                pod.annotations_mut()
                    .insert(MEMBERSHIP_ANNOTATION.into(), value);
            })
            .ok_or_else(|| anyhow::anyhow!("pod {} not found", self.instance.pod_name()))?;
        Ok(())
    }

    async fn peers(&self) -> Result<Vec<Peer>, anyhow::Error> {
        Ok(peers_from_pods(&self.instance, &self.pods.list()))
    }
}

struct Env {
    clusters: Arc<MemoryStore<Cluster>>,
    stateful_sets: Arc<MemoryStore<StatefulSet>>,
    pods: Arc<MemoryStore<Pod>>,
    ctx: Context,
    group: Arc<FakeGroup>,
    agents: BTreeMap<u32, LocalClusterManager>,
}

impl Env {
    fn new(cluster: Cluster) -> Self {
        let clusters = Arc::new(MemoryStore::<Cluster>::new());
        let stateful_sets = Arc::new(MemoryStore::<StatefulSet>::new());
        let pods = Arc::new(MemoryStore::<Pod>::new());
        let stores = Stores {
            clusters: Arc::clone(&clusters) as _,
            stateful_sets: Arc::clone(&stateful_sets) as _,
            services: Arc::new(MemoryStore::<Service>::new()),
            secrets: Arc::new(MemoryStore::<Secret>::new()),
            pods: Arc::clone(&pods) as _,
        };
        clusters.insert(cluster);
        let metrics = Arc::new(Metrics::register_into(&MetricsRegistry::new()));
        Env {
            clusters,
            stateful_sets,
            pods,
            ctx: Context::new(Config::default(), stores, metrics),
            group: Arc::new(FakeGroup::new()),
            agents: BTreeMap::new(),
        }
    }

    async fn reconcile(&self) -> ClusterCondition {
        self.ctx.reconcile(NAMESPACE, NAME).await.unwrap();
        self.clusters
            .cached(NAMESPACE, NAME)
            .unwrap()
            .status()
            .ready()
            .cloned()
            .unwrap()
    }

    /// Does what the StatefulSet controller would: runs one pod per replica
    /// from the template, starts an agent in each, and reports the rollout.
    fn roll_out(&mut self) {
        let sts = self.stateful_sets.cached(NAMESPACE, NAME).unwrap();
        let spec = sts.spec.clone().unwrap();
        let replicas = spec.replicas.unwrap();
        let labels = spec.template.metadata.and_then(|m| m.labels);
        for ordinal in 0..u32::try_from(replicas).unwrap() {
            let name = format!("{NAME}-{ordinal}");
            if self.pods.cached(NAMESPACE, &name).is_some() {
                continue;
            }
            self.pods.insert(Pod {
                metadata: ObjectMeta {
                    namespace: Some(NAMESPACE.into()),
                    name: Some(name.clone()),
                    labels: labels.clone(),
                    ..Default::default()
                },
                ..Default::default()
            });
            let instance = Instance::from_pod_name(NAME, NAMESPACE, &name, 3306).unwrap();
            let registry = PodRegistry {
                pods: Arc::clone(&self.pods),
                instance: instance.clone(),
            };
            let agent = LocalClusterManager::new(
                instance,
                manager::Config::default(),
                Arc::clone(&self.group) as Arc<dyn AdminShell>,
                Arc::new(registry),
                Arc::new(Health::default()),
                AgentMetrics::register_into(&MetricsRegistry::new()),
            );
            self.agents.insert(ordinal, agent);
        }
        self.stateful_sets.modify(NAMESPACE, NAME, |sts| {
            sts.status = Some(StatefulSetStatus {
                observed_generation: sts.metadata.generation,
                replicas,
                ..Default::default()
            });
        });
    }

    async fn sync(&mut self, ordinal: u32) -> Result<Role, SyncError> {
        self.agents.get_mut(&ordinal).unwrap().sync().await
    }

    fn pod(&self, ordinal: u32) -> Pod {
        self.pods
            .cached(NAMESPACE, &format!("{NAME}-{ordinal}"))
            .unwrap()
    }

    fn role_label(&self, ordinal: u32) -> Option<String> {
        self.pod(ordinal).labels().get(ROLE_LABEL).cloned()
    }
}

fn cluster(members: i32) -> Cluster {
    let mut cluster = Cluster::new(
        NAME,
        ClusterSpec {
            version: "8.0.20".into(),
            members,
            multi_master: false,
            ..Default::default()
        },
    );
    cluster.metadata.namespace = Some(NAMESPACE.into());
    cluster
}

/// Brings up a three member cluster and returns it ready.
async fn three_members() -> Env {
    let mut env = Env::new(cluster(3));

    let ready = env.reconcile().await;
    assert_eq!(ready.status, ConditionStatus::False);
    assert_eq!(ready.reason, reasons::RESOURCES_PENDING);
    let sts = env.stateful_sets.cached(NAMESPACE, NAME).unwrap();
    assert_eq!(sts.spec.unwrap().replicas, Some(3));

    env.roll_out();
    let ready = env.reconcile().await;
    assert_eq!(ready.reason, reasons::MEMBERSHIP_INCOMPLETE);
    assert_eq!(ready.message, "0 of 3 members online");

    assert_eq!(env.sync(0).await.unwrap(), Role::Primary);
    assert_eq!(env.sync(1).await.unwrap(), Role::Secondary);
    assert_eq!(env.sync(2).await.unwrap(), Role::Secondary);

    let ready = env.reconcile().await;
    assert_eq!(ready.status, ConditionStatus::True);
    assert_eq!(ready.reason, reasons::ALL_MEMBERS_ONLINE);
    assert_eq!(ready.message, "3 of 3 members online");
    env
}

#[tokio::test]
async fn test_three_members_become_ready() {
    let env = three_members().await;

    assert_eq!(env.role_label(0).as_deref(), Some("primary"));
    assert_eq!(env.role_label(1).as_deref(), Some("secondary"));
    assert_eq!(env.role_label(2).as_deref(), Some("secondary"));
    for ordinal in 0..3 {
        let status = MemberStatus::from_annotations(env.pod(ordinal).annotations()).unwrap();
        assert!(status.is_synced());
    }
    assert!(env
        .agents
        .values()
        .all(|agent| agent.state().is_synced()));

    // Nothing left to do.
    let pods = env.pods.writes();
    let sts = env.stateful_sets.writes();
    let clusters = env.clusters.writes();
    let ready = env.reconcile().await;
    assert_eq!(ready.status, ConditionStatus::True);
    assert_eq!(env.pods.writes(), pods);
    assert_eq!(env.stateful_sets.writes(), sts);
    assert_eq!(env.clusters.writes(), clusters);
}

#[tokio::test]
async fn test_scale_up_keeps_existing_members() {
    let mut env = three_members().await;
    let before: Vec<Pod> = (0..3).map(|ordinal| env.pod(ordinal)).collect();

    env.clusters
        .modify(NAMESPACE, NAME, |cluster| cluster.spec.members = 5);
    let ready = env.reconcile().await;
    assert_eq!(ready.status, ConditionStatus::False);
    assert_eq!(ready.reason, reasons::RESOURCES_PENDING);
    let sts = env.stateful_sets.cached(NAMESPACE, NAME).unwrap();
    assert_eq!(sts.spec.unwrap().replicas, Some(5));

    env.roll_out();
    let ready = env.reconcile().await;
    assert_eq!(ready.reason, reasons::MEMBERSHIP_INCOMPLETE);
    assert_eq!(ready.message, "3 of 5 members online");

    // The first attempt to add the fourth member fails and is retried.
    env.group.fail_next("add_instance", 1);
    assert!(matches!(env.sync(3).await, Err(SyncError::Join(_))));
    assert_eq!(env.agents[&3].state(), SyncState::Joining);
    let status = MemberStatus::from_annotations(env.pod(3).annotations()).unwrap();
    assert_eq!(status.join_status, JoinStatus::JoinFailed);
    assert_eq!(env.sync(4).await.unwrap(), Role::Secondary);

    let ready = env.reconcile().await;
    assert_eq!(ready.reason, reasons::MEMBERSHIP_INCOMPLETE);
    assert_eq!(ready.message, "4 of 5 members online");
    assert_eq!(env.role_label(3), None);
    assert_eq!(env.role_label(4).as_deref(), Some("secondary"));

    assert_eq!(env.sync(3).await.unwrap(), Role::Secondary);
    let ready = env.reconcile().await;
    assert_eq!(ready.status, ConditionStatus::True);
    assert_eq!(ready.message, "5 of 5 members online");

    for (ordinal, before) in (0..).zip(&before) {
        let after = env.pod(ordinal);
        assert_eq!(after.uid(), before.uid());
        assert_eq!(after.labels(), before.labels());
    }
    assert_eq!(env.role_label(0).as_deref(), Some("primary"));
}

#[tokio::test]
async fn test_failover_moves_primary_label() {
    let mut env = three_members().await;

    env.group.crash("orders-0.orders:3306");
    assert!(env.sync(0).await.is_err());
    assert_eq!(env.sync(1).await.unwrap(), Role::Primary);
    assert_eq!(env.sync(2).await.unwrap(), Role::Secondary);

    let ready = env.reconcile().await;
    assert_eq!(ready.reason, reasons::MEMBERSHIP_INCOMPLETE);
    assert_eq!(ready.message, "2 of 3 members online");
    assert_eq!(env.role_label(0).as_deref(), Some("secondary"));
    assert_eq!(env.role_label(1).as_deref(), Some("primary"));

    env.group.restart("orders-0.orders:3306");
    assert_eq!(env.sync(0).await.unwrap(), Role::Secondary);
    let ready = env.reconcile().await;
    assert_eq!(ready.status, ConditionStatus::True);
    assert_eq!(env.role_label(0).as_deref(), Some("secondary"));
    assert_eq!(env.role_label(1).as_deref(), Some("primary"));
}
