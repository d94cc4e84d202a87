// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::BTreeMap;
use std::fmt::Debug;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, EnvVar, EnvVarSource, HTTPGetAction,
    ObjectFieldSelector, PodSpec, PodTemplateSpec, Probe, Secret, SecretKeySelector,
    SecretVolumeSource, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};
use maplit::btreemap;
use rds_resources::crd::cluster::v1alpha1::Cluster;
use rds_resources::crd::ManagedResource;
use rds_resources::labels::{CLUSTER_LABEL, ROLE_LABEL, ROLE_PRIMARY};
use rds_resources::{DEFAULT_AGENT_HEALTHCHECK_PORT, DEFAULT_MYSQL_PORT, VERSION};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, trace};

use crate::controller::cluster::Config;
use crate::store::{ObjectStore, StoreError, Stores};

/// The key of the root password in the root password secret.
pub const ROOT_PASSWORD_KEY: &str = "password";

const MYSQL_CONTAINER: &str = "mysql";
const AGENT_CONTAINER: &str = "agent";
const DATA_DIR: &str = "/var/lib/mysql";
const SSL_DIR: &str = "/etc/ssl/mysql";

/// The objects generated for a cluster, in the shape the operator wants them.
#[derive(Debug)]
pub struct Resources {
    pub headless_service: Service,
    pub primary_service: Service,
    pub stateful_set: StatefulSet,
}

impl Resources {
    pub fn new(config: &Config, cluster: &Cluster) -> Self {
        Self {
            headless_service: create_headless_service_object(config, cluster),
            primary_service: create_primary_service_object(config, cluster),
            stateful_set: create_stateful_set_object(config, cluster),
        }
    }

    /// Brings the generated objects in line with the desired shape and
    /// returns the stateful set as last written or observed.
    pub async fn apply(&self, stores: &Stores) -> Result<StatefulSet, StoreError> {
        trace!("applying headless service");
        ensure(&*stores.services, &self.headless_service, service_diverges).await?;
        trace!("applying primary service");
        ensure(&*stores.services, &self.primary_service, service_diverges).await?;
        trace!("applying stateful set");
        ensure(&*stores.stateful_sets, &self.stateful_set, stateful_set_diverges).await
    }
}

/// Applies `desired` unless the cached object already matches it in every
/// field the operator owns.
async fn ensure<K>(
    store: &dyn ObjectStore<K>,
    desired: &K,
    diverges: fn(&K, &K) -> bool,
) -> Result<K, StoreError>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static,
{
    let namespace = desired.namespace().unwrap_or_default();
    let name = desired.name_any();
    match store.cached(&namespace, &name) {
        Some(current) if !diverges(desired, &current) => Ok(current),
        current => {
            debug!(
                kind = %K::kind(&()),
                %name,
                exists = current.is_some(),
                "applying generated object"
            );
            store.apply(desired).await
        }
    }
}

fn managed_labels(config: &Config, cluster: &Cluster) -> BTreeMap<String, String> {
    let mut labels = cluster.default_labels();
    labels.extend(config.service_labels.clone());
    labels
}

fn cluster_selector(cluster: &Cluster) -> BTreeMap<String, String> {
    btreemap! {
        CLUSTER_LABEL.to_owned() => cluster.name_any(),
    }
}

fn managed_meta(config: &Config, cluster: &Cluster, name: String) -> ObjectMeta {
    let mut meta = cluster.managed_resource_meta(name);
    meta.labels = Some(managed_labels(config, cluster));
    meta
}

fn mysql_service_port() -> ServicePort {
    ServicePort {
        name: Some("mysql".into()),
        port: DEFAULT_MYSQL_PORT.into(),
        target_port: Some(IntOrString::Int(DEFAULT_MYSQL_PORT.into())),
        protocol: Some("TCP".into()),
        ..Default::default()
    }
}

/// Gives every instance the stable DNS name `<pod>.<cluster>`, including
/// instances that are not ready yet, so that joining members can be reached
/// by the group.
fn create_headless_service_object(config: &Config, cluster: &Cluster) -> Service {
    Service {
        metadata: managed_meta(config, cluster, cluster.service_name()),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".into()),
            publish_not_ready_addresses: Some(true),
            selector: Some(cluster_selector(cluster)),
            ports: Some(vec![mysql_service_port()]),
            ..Default::default()
        }),
        status: None,
    }
}

/// Routes to the members currently labelled primary.
fn create_primary_service_object(config: &Config, cluster: &Cluster) -> Service {
    let mut selector = cluster_selector(cluster);
    selector.insert(ROLE_LABEL.to_owned(), ROLE_PRIMARY.to_owned());
    Service {
        metadata: managed_meta(config, cluster, cluster.primary_service_name()),
        spec: Some(ServiceSpec {
            selector: Some(selector),
            ports: Some(vec![mysql_service_port()]),
            ..Default::default()
        }),
        status: None,
    }
}

pub fn create_root_password_secret_object(cluster: &Cluster, password: String) -> Secret {
    Secret {
        metadata: cluster.managed_resource_meta(cluster.root_password_secret_name()),
        string_data: Some(btreemap! {
            ROOT_PASSWORD_KEY.to_owned() => password,
        }),
        ..Default::default()
    }
}

fn root_password_env(cluster: &Cluster) -> EnvVar {
    EnvVar {
        name: "MYSQL_ROOT_PASSWORD".into(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: cluster.root_password_secret_name(),
                key: ROOT_PASSWORD_KEY.into(),
                optional: Some(false),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn field_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.into(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.into(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// The shell command that starts `mysqld` with group replication
/// prerequisites. The server id and report host depend on the pod's
/// ordinal, which is only known inside the pod.
fn mysql_command(cluster: &Cluster) -> Vec<String> {
    let mut flags = vec![
        format!("--server_id=$(({} + ordinal))", cluster.base_server_id()),
        format!("--datadir={}", DATA_DIR),
        "--user=mysql".to_owned(),
        "--gtid_mode=ON".to_owned(),
        "--log-bin".to_owned(),
        "--binlog_checksum=NONE".to_owned(),
        "--enforce_gtid_consistency=ON".to_owned(),
        "--log-slave-updates=ON".to_owned(),
        "--binlog-format=ROW".to_owned(),
        "--master-info-repository=TABLE".to_owned(),
        "--relay-log-info-repository=TABLE".to_owned(),
        "--transaction-write-set-extraction=XXHASH64".to_owned(),
        "--relay-log=${HOSTNAME}-relay-bin".to_owned(),
        format!("--report-host=${{HOSTNAME}}.{}", cluster.service_name()),
        "--log-error-verbosity=3".to_owned(),
    ];
    if cluster.spec.ssl_secret.is_some() {
        flags.extend([
            format!("--ssl-ca={}/ca.crt", SSL_DIR),
            format!("--ssl-cert={}/tls.crt", SSL_DIR),
            format!("--ssl-key={}/tls.key", SSL_DIR),
        ]);
    }
    let script = format!(
        "ordinal=${{HOSTNAME##*-}}\nexec /entrypoint.sh mysqld {}",
        flags.join(" ")
    );
    vec!["/bin/bash".into(), "-ec".into(), script]
}

fn agent_args(cluster: &Cluster) -> Vec<String> {
    let mut args = vec![
        format!("--cluster-name={}", cluster.name_any()),
        format!("--mysql-port={}", DEFAULT_MYSQL_PORT),
        format!("--healthcheck-addr=0.0.0.0:{}", DEFAULT_AGENT_HEALTHCHECK_PORT),
    ];
    if cluster.spec.multi_master {
        args.push("--multi-primary".into());
    }
    if cluster.spec.ssl_secret.is_some() {
        args.push("--ssl-enabled".into());
    }
    args
}

fn agent_probe(path: &str, initial_delay_seconds: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            port: IntOrString::Int(DEFAULT_AGENT_HEALTHCHECK_PORT.into()),
            path: Some(path.into()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay_seconds),
        period_seconds: Some(10),
        failure_threshold: Some(3),
        success_threshold: Some(1),
        timeout_seconds: Some(5),
        ..Default::default()
    }
}

fn create_stateful_set_object(config: &Config, cluster: &Cluster) -> StatefulSet {
    let labels = managed_labels(config, cluster);

    let mut volumes = Vec::new();
    let mut mysql_mounts = Vec::new();
    let mut agent_mounts = Vec::new();

    let volume_claim_templates = cluster.spec.volume_claim_template.clone().map(|mut pvc| {
        let name = pvc.metadata.name.get_or_insert_with(|| "data".into()).clone();
        mysql_mounts.push(VolumeMount {
            name,
            mount_path: DATA_DIR.into(),
            ..Default::default()
        });
        vec![pvc]
    });

    if let Some(config_map) = &cluster.spec.config {
        volumes.push(Volume {
            name: "mycnf".into(),
            config_map: Some(ConfigMapVolumeSource {
                name: config_map.name.clone(),
                ..Default::default()
            }),
            ..Default::default()
        });
        mysql_mounts.push(VolumeMount {
            name: "mycnf".into(),
            mount_path: "/etc/my.cnf".into(),
            sub_path: Some("my.cnf".into()),
            read_only: Some(true),
            ..Default::default()
        });
    }

    if let Some(ssl_secret) = &cluster.spec.ssl_secret {
        volumes.push(Volume {
            name: "ssl".into(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(ssl_secret.name.clone()),
                default_mode: Some(0o400),
                ..Default::default()
            }),
            ..Default::default()
        });
        let mount = VolumeMount {
            name: "ssl".into(),
            mount_path: SSL_DIR.into(),
            read_only: Some(true),
            ..Default::default()
        };
        mysql_mounts.push(mount.clone());
        agent_mounts.push(mount);
    }

    let mysql = Container {
        name: MYSQL_CONTAINER.into(),
        image: Some(cluster.image(&config.mysql_image)),
        command: Some(mysql_command(cluster)),
        ports: Some(vec![ContainerPort {
            container_port: DEFAULT_MYSQL_PORT.into(),
            name: Some("mysql".into()),
            protocol: Some("TCP".into()),
            ..Default::default()
        }]),
        env: Some(vec![
            root_password_env(cluster),
            EnvVar {
                name: "MYSQL_ROOT_HOST".into(),
                value: Some("%".into()),
                ..Default::default()
            },
            EnvVar {
                name: "MYSQL_LOG_CONSOLE".into(),
                value: Some("true".into()),
                ..Default::default()
            },
        ]),
        volume_mounts: Some(mysql_mounts),
        ..Default::default()
    };

    let agent = Container {
        name: AGENT_CONTAINER.into(),
        image: Some(format!("{}:{}", config.agent_image, VERSION)),
        args: Some(agent_args(cluster)),
        ports: Some(vec![ContainerPort {
            container_port: DEFAULT_AGENT_HEALTHCHECK_PORT.into(),
            name: Some("health".into()),
            protocol: Some("TCP".into()),
            ..Default::default()
        }]),
        env: Some(vec![
            field_env("RDS_AGENT_NAMESPACE", "metadata.namespace"),
            field_env("RDS_AGENT_POD_NAME", "metadata.name"),
            root_password_env(cluster),
        ]),
        readiness_probe: Some(agent_probe("/ready", 10)),
        liveness_probe: Some(agent_probe("/live", 30)),
        volume_mounts: Some(agent_mounts),
        ..Default::default()
    };

    StatefulSet {
        metadata: managed_meta(config, cluster, cluster.stateful_set_name()),
        spec: Some(StatefulSetSpec {
            replicas: Some(cluster.members()),
            service_name: cluster.service_name(),
            selector: LabelSelector {
                match_labels: Some(cluster_selector(cluster)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![mysql, agent],
                    volumes: Some(volumes),
                    node_selector: cluster.spec.node_selector.clone(),
                    affinity: cluster.spec.affinity.clone(),
                    service_account_name: config.agent_service_account.clone(),
                    ..Default::default()
                }),
            },
            volume_claim_templates,
            ..Default::default()
        }),
        status: None,
    }
}

fn labels_contained(desired: &ObjectMeta, current: &ObjectMeta) -> bool {
    let current = current.labels.as_ref();
    desired
        .labels
        .iter()
        .flatten()
        .all(|(k, v)| current.and_then(|labels| labels.get(k)) == Some(v))
}

/// Compares only what the operator sets on a service: its labels, selector,
/// ports and headlessness. Defaults filled in by the platform are ignored.
pub fn service_diverges(desired: &Service, current: &Service) -> bool {
    if !labels_contained(&desired.metadata, &current.metadata) {
        return true;
    }
    let (Some(desired), Some(current)) = (&desired.spec, &current.spec) else {
        return desired.spec.is_some();
    };
    let ports = |spec: &ServiceSpec| {
        spec.ports
            .iter()
            .flatten()
            .map(|p| (p.name.clone(), p.port, p.target_port.clone()))
            .collect::<Vec<_>>()
    };
    desired.selector != current.selector
        || ports(desired) != ports(current)
        || (desired.cluster_ip.is_some() && desired.cluster_ip != current.cluster_ip)
        || desired.publish_not_ready_addresses.unwrap_or(false)
            != current.publish_not_ready_addresses.unwrap_or(false)
}

/// Reports whether every field set in `desired` holds the same value in
/// `current`. Fields only present in `current` are defaults filled in by the
/// platform. Arrays match element for element, and empty arrays or objects
/// match absent fields, which the platform omits.
fn json_contains(desired: &Value, current: &Value) -> bool {
    match (desired, current) {
        (Value::Null, _) => true,
        (Value::Object(want), Value::Object(have)) => want
            .iter()
            .all(|(k, v)| json_contains(v, have.get(k).unwrap_or(&Value::Null))),
        (Value::Array(want), Value::Array(have)) => {
            want.len() == have.len() && want.iter().zip(have).all(|(w, h)| json_contains(w, h))
        }
        (Value::Object(want), Value::Null) => want.is_empty(),
        (Value::Array(want), Value::Null) => want.is_empty(),
        (want, have) => want == have,
    }
}

fn contains<T: Serialize>(desired: &T, current: &T) -> bool {
    match (serde_json::to_value(desired), serde_json::to_value(current)) {
        (Ok(desired), Ok(current)) => json_contains(&desired, &current),
        _ => false,
    }
}

/// Like [`contains`], but a list the operator no longer wants must also be
/// gone from `current`.
fn list_contains<T: Serialize>(desired: &Option<Vec<T>>, current: &Option<Vec<T>>) -> bool {
    contains(
        &desired.as_deref().unwrap_or_default(),
        &current.as_deref().unwrap_or_default(),
    )
}

fn non_empty<K, V>(map: &Option<BTreeMap<K, V>>) -> Option<&BTreeMap<K, V>> {
    map.as_ref().filter(|map| !map.is_empty())
}

/// Compares everything the operator sets on a stateful set: labels, replica
/// count, governing service, volume claim templates, and on the pod
/// template its labels, placement, volumes, service account and the whole
/// of its own containers. Defaults filled in by the platform are ignored.
pub fn stateful_set_diverges(desired: &StatefulSet, current: &StatefulSet) -> bool {
    if !labels_contained(&desired.metadata, &current.metadata) {
        return true;
    }
    let (Some(desired), Some(current)) = (&desired.spec, &current.spec) else {
        return desired.spec.is_some();
    };
    if desired.replicas != current.replicas
        || desired.service_name != current.service_name
        || !list_contains(
            &desired.volume_claim_templates,
            &current.volume_claim_templates,
        )
    {
        return true;
    }
    let empty = ObjectMeta::default();
    if !labels_contained(
        desired.template.metadata.as_ref().unwrap_or(&empty),
        current.template.metadata.as_ref().unwrap_or(&empty),
    ) {
        return true;
    }
    let (Some(want), Some(have)) = (&desired.template.spec, &current.template.spec) else {
        return desired.template.spec.is_some();
    };
    if non_empty(&want.node_selector) != non_empty(&have.node_selector)
        || want.affinity != have.affinity
        || want.service_account_name != have.service_account_name
        || !list_contains(&want.volumes, &have.volumes)
    {
        return true;
    }
    want.containers
        .iter()
        .any(|w| match have.containers.iter().find(|c| c.name == w.name) {
            Some(h) => !contains(w, h),
            None => true,
        })
}
