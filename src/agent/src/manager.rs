// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Drives the local MySQL instance into its InnoDB cluster.
//!
//! Each sync cycle looks at the group from the local server's point of view
//! and takes at most one corrective step: create the group, reboot it after
//! a complete outage, add the instance, or rejoin it. The server, not the
//! agent, is the source of truth, so a restarted agent resumes from
//! whatever state the group is in.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rds_mysqlsh::status::{ClusterStatus, InstanceState};
use rds_mysqlsh::{AdminShell, Options, ShellError};
use rds_resources::member::{JoinStatus, MemberStatus, Role};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::health::Health;
use crate::instance::Instance;
use crate::metrics::Metrics;
use crate::registry::{MembershipRegistry, Peer};

/// How a joining instance catches up with the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RecoveryMethod {
    Auto,
    Clone,
    Incremental,
}

impl RecoveryMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryMethod::Auto => "auto",
            RecoveryMethod::Clone => "clone",
            RecoveryMethod::Incremental => "incremental",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub multi_primary: bool,
    pub ssl_enabled: bool,
    pub recovery_method: Option<RecoveryMethod>,
    pub ip_allowlist: Option<String>,
    /// Failed attempts to create or reboot the group before the instance is
    /// reported dead.
    pub max_bootstrap_attempts: usize,
    /// Consecutive cycles the local server may be unreachable before the
    /// instance is reported dead.
    pub max_engine_failures: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            multi_primary: false,
            ssl_enabled: false,
            recovery_method: None,
            ip_allowlist: None,
            max_bootstrap_attempts: 5,
            max_engine_failures: 6,
        }
    }
}

/// Where the local instance stands with its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Unsynced,
    Bootstrapping,
    Joining,
    Synced(Role),
}

impl SyncState {
    pub fn is_synced(&self) -> bool {
        matches!(self, SyncState::Synced(_))
    }
}

/// Why a sync cycle ended without the instance being an online member.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("mysql server at {address} is not accepting connections")]
    EngineUnavailable { address: String },
    #[error("instance is {0:?}, waiting for it to come online")]
    NotOnline(InstanceState),
    #[error("no running group found, waiting for the seed instance to start it")]
    AwaitingGroup,
    #[error("unable to start the group: {0}")]
    Bootstrap(#[source] ShellError),
    #[error("unable to join the group: {0}")]
    Join(#[source] ShellError),
    #[error("unable to read cluster status: {0}")]
    Status(#[source] ShellError),
    #[error("unable to list peers: {0:#}")]
    Registry(anyhow::Error),
}

/// A successful cycle: the role the instance holds and what it took.
#[derive(Debug, Clone, Copy)]
struct Joined {
    role: Role,
    outcome: &'static str,
}

pub struct LocalClusterManager {
    instance: Instance,
    config: Config,
    shell: Arc<dyn AdminShell>,
    registry: Arc<dyn MembershipRegistry>,
    health: Arc<Health>,
    metrics: Metrics,
    state: SyncState,
    bootstrap_attempts: usize,
    engine_failures: usize,
    published: Option<(JoinStatus, Option<String>)>,
}

impl LocalClusterManager {
    pub fn new(
        instance: Instance,
        config: Config,
        shell: Arc<dyn AdminShell>,
        registry: Arc<dyn MembershipRegistry>,
        health: Arc<Health>,
        metrics: Metrics,
    ) -> Self {
        LocalClusterManager {
            instance,
            config,
            shell,
            registry,
            health,
            metrics,
            state: SyncState::Unsynced,
            bootstrap_attempts: 0,
            engine_failures: 0,
            published: None,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    /// Retries [`Self::sync`] every `delay` until the instance is an online
    /// member. Returns `None` if cancelled first.
    pub async fn sync_until_joined(
        &mut self,
        delay: Duration,
        cancel: &CancellationToken,
    ) -> Option<Role> {
        loop {
            match self.sync().await {
                Ok(role) => return Some(role),
                Err(e) => info!("instance not synced yet, retrying in {:?}: {}", delay, e),
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Syncs every `interval` until `cancel` fires. A cycle in progress is
    /// always finished.
    pub async fn run(mut self, interval: Duration, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            if let Err(e) = self.sync().await {
                warn!("sync failed: {}", e);
            }
        }
        info!("membership loop stopped");
    }

    /// Runs one sync cycle, updates the health signals and publishes the
    /// outcome to the registry.
    #[instrument(skip(self), fields(instance = %self.instance))]
    pub async fn sync(&mut self) -> Result<Role, SyncError> {
        let result = self.reconcile_membership().await;
        let (state, join_status, outcome) = match &result {
            Ok(joined) => (
                SyncState::Synced(joined.role),
                JoinStatus::joined(joined.role),
                joined.outcome,
            ),
            Err(SyncError::Bootstrap(_)) => (
                SyncState::Bootstrapping,
                JoinStatus::Bootstrapping,
                "bootstrap_failed",
            ),
            Err(SyncError::Join(_)) => (SyncState::Joining, JoinStatus::JoinFailed, "join_failed"),
            Err(SyncError::NotOnline(_) | SyncError::AwaitingGroup) => {
                (SyncState::Joining, JoinStatus::Unjoined, "waiting")
            }
            Err(
                SyncError::EngineUnavailable { .. }
                | SyncError::Status(_)
                | SyncError::Registry(_),
            ) => (SyncState::Unsynced, JoinStatus::Unjoined, "error"),
        };
        if state != self.state {
            info!(from = ?self.state, to = ?state, "membership state changed");
        }
        self.state = state;

        self.health.set_ready(state.is_synced());
        let live = self.engine_failures < self.config.max_engine_failures
            && self.bootstrap_attempts < self.config.max_bootstrap_attempts;
        if !live && self.health.is_live() {
            error!(
                engine_failures = self.engine_failures,
                bootstrap_attempts = self.bootstrap_attempts,
                "instance cannot recover on its own, reporting it dead"
            );
        }
        self.health.set_live(live);
        self.metrics.syncs.with_label_values(&[outcome]).inc();
        self.metrics.synced.set(u64::from(state.is_synced()));

        let message = result.as_ref().err().map(|e| e.to_string());
        self.publish(join_status, message).await;
        result.map(|joined| joined.role)
    }

    /// Publishes the membership record if it changed since the last
    /// successful publication.
    async fn publish(&mut self, join_status: JoinStatus, message: Option<String>) {
        let record = (join_status, message);
        if self.published.as_ref() == Some(&record) {
            return;
        }
        let mut status = MemberStatus::new(join_status, Utc::now());
        if let Some(message) = &record.1 {
            status = status.with_message(message.clone());
        }
        match self.registry.publish(&status).await {
            Ok(()) => self.published = Some(record),
            Err(e) => warn!("unable to publish membership: {:#}", e),
        }
    }

    async fn reconcile_membership(&mut self) -> Result<Joined, SyncError> {
        let address = self.instance.address();
        if !self.shell.is_engine_running(&address).await {
            self.engine_failures += 1;
            return Err(SyncError::EngineUnavailable { address });
        }
        self.engine_failures = 0;

        let cluster = self.instance.cluster_name.clone();
        match self.shell.cluster_status(&address, &cluster).await {
            Ok(status) => self.converge(&status, &address).await,
            Err(ShellError::NoCluster { .. }) => self.find_group(false).await,
            Err(ShellError::GroupOffline { .. }) => self.find_group(true).await,
            Err(e) => Err(SyncError::Status(e)),
        }
    }

    /// Looks for a running group through the peers that report themselves
    /// synced, then through the seed. If there is none, the seed starts one:
    /// by rebooting it when the local server still holds its metadata, or by
    /// creating it.
    async fn find_group(&mut self, has_metadata: bool) -> Result<Joined, SyncError> {
        let peers = self.registry.peers().await.map_err(SyncError::Registry)?;
        let mut candidates: Vec<String> = peers
            .iter()
            .filter(|p| p.is_synced())
            .map(|p| self.instance.peer_address(p.ordinal))
            .collect();
        let seed = self.instance.seed_address();
        if !self.instance.is_seed() && !candidates.contains(&seed) {
            candidates.push(seed);
        }

        let cluster = self.instance.cluster_name.clone();
        for candidate in candidates {
            match self.shell.cluster_status(&candidate, &cluster).await {
                Ok(status) if status.has_quorum() => {
                    debug!(via = %candidate, "found running group");
                    return self.converge(&status, &candidate).await;
                }
                Ok(status) => debug!(
                    via = %candidate,
                    "group has no quorum: {}",
                    status.default_replica_set.status
                ),
                Err(e) => debug!(via = %candidate, "no group: {}", e),
            }
        }

        if !self.instance.is_seed() || peers.iter().any(Peer::is_synced) {
            return Err(SyncError::AwaitingGroup);
        }
        self.bootstrap(has_metadata).await
    }

    /// Brings the local instance online in the group described by `status`,
    /// as reported by the member at `via`.
    async fn converge(&mut self, status: &ClusterStatus, via: &str) -> Result<Joined, SyncError> {
        let address = self.instance.address();
        let coordinator = status.primary().unwrap_or(via).to_owned();
        let Some(member) = status.instance(&address) else {
            return self.add(&coordinator).await;
        };
        if let Some(role) = member.role() {
            return Ok(Joined {
                role,
                outcome: "synced",
            });
        }
        if member.status.needs_rejoin() {
            return self.rejoin(&coordinator).await;
        }
        Err(SyncError::NotOnline(member.status.clone()))
    }

    fn joined_role(&self) -> Role {
        if self.config.multi_primary {
            Role::Primary
        } else {
            Role::Secondary
        }
    }

    async fn bootstrap(&mut self, reboot: bool) -> Result<Joined, SyncError> {
        let address = self.instance.address();
        let cluster = &self.instance.cluster_name;
        self.bootstrap_attempts += 1;
        let result = if reboot {
            info!("rebooting group from complete outage");
            self.shell
                .reboot_cluster_from_complete_outage(&address, cluster, &Options::new())
                .await
        } else {
            info!("creating group");
            self.shell
                .create_cluster(&address, cluster, &self.create_options())
                .await
        };
        result.map_err(SyncError::Bootstrap)?;
        self.bootstrap_attempts = 0;
        Ok(Joined {
            role: Role::Primary,
            outcome: if reboot { "rebooted" } else { "bootstrapped" },
        })
    }

    async fn add(&mut self, coordinator: &str) -> Result<Joined, SyncError> {
        let address = self.instance.address();
        info!(via = %coordinator, "adding instance to group");
        self.shell
            .add_instance(
                coordinator,
                &self.instance.cluster_name,
                &address,
                &self.join_options(),
            )
            .await
            .map_err(SyncError::Join)?;
        Ok(Joined {
            role: self.joined_role(),
            outcome: "joined",
        })
    }

    /// Rejoins a member the group lost track of. A member that cannot rejoin
    /// is removed and added back.
    async fn rejoin(&mut self, coordinator: &str) -> Result<Joined, SyncError> {
        let address = self.instance.address();
        let cluster = &self.instance.cluster_name;
        info!(via = %coordinator, "rejoining instance to group");
        let rejoined = self
            .shell
            .rejoin_instance(coordinator, cluster, &address, &self.rejoin_options())
            .await;
        if let Err(e) = rejoined {
            warn!("rejoin failed, re-adding instance: {}", e);
            let force = Options::new().with("force", true);
            self.shell
                .remove_instance(coordinator, cluster, &address, &force)
                .await
                .map_err(SyncError::Join)?;
            self.shell
                .add_instance(coordinator, cluster, &address, &self.join_options())
                .await
                .map_err(SyncError::Join)?;
            return Ok(Joined {
                role: self.joined_role(),
                outcome: "readded",
            });
        }
        Ok(Joined {
            role: self.joined_role(),
            outcome: "rejoined",
        })
    }

    fn ssl_mode(&self) -> &'static str {
        if self.config.ssl_enabled {
            "REQUIRED"
        } else {
            "DISABLED"
        }
    }

    fn create_options(&self) -> Options {
        let mut options = Options::new().with("memberSslMode", self.ssl_mode());
        if self.config.multi_primary {
            options.insert("multiPrimary", true);
            options.insert("force", true);
        }
        if let Some(allowlist) = &self.config.ip_allowlist {
            options.insert("ipAllowlist", allowlist.as_str());
        }
        options
    }

    fn join_options(&self) -> Options {
        let mut options = self.rejoin_options();
        if let Some(method) = self.config.recovery_method {
            options.insert("recoveryMethod", method.as_str());
        }
        options
    }

    fn rejoin_options(&self) -> Options {
        let mut options = Options::new().with("memberSslMode", self.ssl_mode());
        if let Some(allowlist) = &self.config.ip_allowlist {
            options.insert("ipAllowlist", allowlist.as_str());
        }
        options
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use rds_mysqlsh::testing::FakeGroup;
    use rds_mysqlsh::OptionValue;
    use rds_ore::metrics::MetricsRegistry;

    use super::*;

    /// Peers and publications held in memory. Every manager of a test
    /// cluster shares one.
    #[derive(Debug, Default)]
    struct Board {
        records: Mutex<Vec<Option<MemberStatus>>>,
    }

    #[derive(Debug)]
    struct BoardRegistry {
        board: Arc<Board>,
        ordinal: u32,
        fail: Mutex<bool>,
    }

    #[async_trait]
    impl MembershipRegistry for BoardRegistry {
        async fn publish(&self, status: &MemberStatus) -> Result<(), anyhow::Error> {
            if *self.fail.lock().unwrap() {
                anyhow::bail!("api server unavailable");
            }
            let mut records = self.board.records.lock().unwrap();
            let i = usize::try_from(self.ordinal).unwrap();
            if records.len() <= i {
                records.resize(i + 1, None);
            }
            records[i] = Some(status.clone());
            Ok(())
        }

        async fn peers(&self) -> Result<Vec<Peer>, anyhow::Error> {
            let records = self.board.records.lock().unwrap();
            Ok(records
                .iter()
                .enumerate()
                .map(|(i, status)| Peer {
                    ordinal: u32::try_from(i).unwrap(),
                    status: status.clone(),
                })
                .filter(|p| p.ordinal != self.ordinal)
                .collect())
        }
    }

    struct Node {
        manager: LocalClusterManager,
        health: Arc<Health>,
        registry: Arc<BoardRegistry>,
    }

    fn node(group: &Arc<FakeGroup>, board: &Arc<Board>, ordinal: u32, config: Config) -> Node {
        let instance =
            Instance::from_pod_name("c", "db", &format!("c-{ordinal}"), 3306).unwrap();
        let health = Arc::new(Health::default());
        let registry = Arc::new(BoardRegistry {
            board: Arc::clone(board),
            ordinal,
            fail: Mutex::new(false),
        });
        // Peers show up in the registry as soon as their pod exists.
        {
            let mut records = board.records.lock().unwrap();
            let i = usize::try_from(ordinal).unwrap();
            if records.len() <= i {
                records.resize(i + 1, None);
            }
        }
        let manager = LocalClusterManager::new(
            instance,
            config,
            Arc::clone(group) as Arc<dyn AdminShell>,
            Arc::clone(&registry) as Arc<dyn MembershipRegistry>,
            Arc::clone(&health),
            Metrics::register_into(&MetricsRegistry::new()),
        );
        Node {
            manager,
            health,
            registry,
        }
    }

    fn published(board: &Board, ordinal: usize) -> Option<MemberStatus> {
        board.records.lock().unwrap()[ordinal].clone()
    }

    fn address(ordinal: u32) -> String {
        format!("c-{ordinal}.c:3306")
    }

    #[tokio::test]
    async fn test_seed_bootstraps_and_others_join() {
        let group = Arc::new(FakeGroup::new());
        let board = Arc::new(Board::default());
        let mut nodes: Vec<_> = (0..3)
            .map(|i| node(&group, &board, i, Config::default()))
            .collect();

        // Before the seed has run, nobody else can join.
        assert!(matches!(
            nodes[1].manager.sync().await,
            Err(SyncError::AwaitingGroup)
        ));
        assert_eq!(nodes[1].manager.state(), SyncState::Joining);
        assert!(!nodes[1].health.is_ready());
        assert!(nodes[1].health.is_live());

        assert_eq!(nodes[0].manager.sync().await.unwrap(), Role::Primary);
        assert_eq!(nodes[0].manager.state(), SyncState::Synced(Role::Primary));
        assert!(nodes[0].health.is_ready());
        assert_eq!(
            published(&board, 0).unwrap().join_status,
            JoinStatus::JoinedPrimary
        );

        for node in &mut nodes[1..] {
            assert_eq!(node.manager.sync().await.unwrap(), Role::Secondary);
            assert!(node.health.is_ready());
        }
        assert_eq!(
            published(&board, 2).unwrap().join_status,
            JoinStatus::JoinedSecondary
        );

        // A second round changes nothing.
        let calls = group.calls();
        for node in &mut nodes {
            node.manager.sync().await.unwrap();
        }
        assert_eq!(group.calls(), calls);
        assert_eq!(
            calls,
            vec![
                format!("create_cluster {}", address(0)),
                format!("add_instance {} {}", address(0), address(1)),
                format!("add_instance {} {}", address(0), address(2)),
            ]
        );
    }

    #[tokio::test]
    async fn test_create_options() {
        let group = Arc::new(FakeGroup::new());
        let board = Arc::new(Board::default());
        let config = Config {
            multi_primary: true,
            ssl_enabled: true,
            ip_allowlist: Some("10.0.0.0/8".into()),
            recovery_method: Some(RecoveryMethod::Clone),
            ..Default::default()
        };
        let n = node(&group, &board, 0, config);
        let create = n.manager.create_options();
        assert_eq!(create.get("multiPrimary"), Some(&OptionValue::Bool(true)));
        assert_eq!(create.get("force"), Some(&OptionValue::Bool(true)));
        assert_eq!(
            create.get("memberSslMode"),
            Some(&OptionValue::Str("REQUIRED".into()))
        );
        assert_eq!(
            create.get("ipAllowlist"),
            Some(&OptionValue::Str("10.0.0.0/8".into()))
        );
        let join = n.manager.join_options();
        assert_eq!(
            join.get("recoveryMethod"),
            Some(&OptionValue::Str("clone".into()))
        );
        assert_eq!(join.get("multiPrimary"), None);

        let mut n = n;
        assert_eq!(n.manager.sync().await.unwrap(), Role::Primary);
        let mut other = node(&group, &board, 1, n.manager.config.clone());
        assert_eq!(other.manager.sync().await.unwrap(), Role::Primary);
    }

    #[tokio::test]
    async fn test_failed_join_is_retried() {
        let group = Arc::new(FakeGroup::new());
        let board = Arc::new(Board::default());
        let mut seed = node(&group, &board, 0, Config::default());
        let mut joiner = node(&group, &board, 1, Config::default());
        seed.manager.sync().await.unwrap();

        group.fail_next("add_instance", 1);
        assert!(matches!(
            joiner.manager.sync().await,
            Err(SyncError::Join(_))
        ));
        assert_eq!(joiner.manager.state(), SyncState::Joining);
        let record = published(&board, 1).unwrap();
        assert_eq!(record.join_status, JoinStatus::JoinFailed);
        assert!(record.message.unwrap().contains("injected failure"));

        assert_eq!(joiner.manager.sync().await.unwrap(), Role::Secondary);
        assert_eq!(
            published(&board, 1).unwrap().join_status,
            JoinStatus::JoinedSecondary
        );
    }

    #[tokio::test]
    async fn test_seed_joins_when_peers_are_synced() {
        let group = Arc::new(FakeGroup::new());
        let board = Arc::new(Board::default());
        let mut nodes: Vec<_> = (0..3)
            .map(|i| node(&group, &board, i, Config::default()))
            .collect();
        for node in &mut nodes {
            node.manager.sync().await.unwrap();
        }

        // The seed's server loses its data and comes back empty-handed.
        group.crash(&address(0));
        group
            .remove_instance(&address(1), "c", &address(0), &Options::new())
            .await
            .unwrap();
        group.restart(&address(0));
        let mut seed = node(&group, &board, 0, Config::default());
        assert_eq!(seed.manager.sync().await.unwrap(), Role::Secondary);
        let creates = group
            .calls()
            .iter()
            .filter(|c| c.starts_with("create_cluster"))
            .count();
        assert_eq!(creates, 1);
        assert_eq!(
            group.calls().last().unwrap(),
            &format!("add_instance {} {}", address(1), address(0))
        );
        assert!(seed.health.is_ready());
    }

    #[tokio::test]
    async fn test_lost_member_rejoins() {
        let group = Arc::new(FakeGroup::new());
        let board = Arc::new(Board::default());
        let mut nodes: Vec<_> = (0..3)
            .map(|i| node(&group, &board, i, Config::default()))
            .collect();
        for node in &mut nodes {
            node.manager.sync().await.unwrap();
        }

        group.crash(&address(2));
        assert!(matches!(
            nodes[2].manager.sync().await,
            Err(SyncError::EngineUnavailable { .. })
        ));
        assert_eq!(nodes[2].manager.state(), SyncState::Unsynced);
        assert!(!nodes[2].health.is_ready());
        assert!(nodes[2].health.is_live());

        group.restart(&address(2));
        assert_eq!(nodes[2].manager.sync().await.unwrap(), Role::Secondary);
        assert_eq!(
            group.calls().last().unwrap(),
            &format!("rejoin_instance {} {}", address(0), address(2))
        );
    }

    #[tokio::test]
    async fn test_failed_rejoin_readds() {
        let group = Arc::new(FakeGroup::new());
        let board = Arc::new(Board::default());
        let mut nodes: Vec<_> = (0..2)
            .map(|i| node(&group, &board, i, Config::default()))
            .collect();
        for node in &mut nodes {
            node.manager.sync().await.unwrap();
        }
        group.crash(&address(1));
        group.restart(&address(1));
        group.fail_next("rejoin_instance", 1);
        assert_eq!(nodes[1].manager.sync().await.unwrap(), Role::Secondary);
        let calls = group.calls();
        assert_eq!(
            calls[calls.len() - 3..],
            [
                format!("rejoin_instance {} {}", address(0), address(1)),
                format!("remove_instance {} {}", address(0), address(1)),
                format!("add_instance {} {}", address(0), address(1)),
            ]
        );
    }

    #[tokio::test]
    async fn test_seed_reboots_after_complete_outage() {
        let group = Arc::new(FakeGroup::new());
        let board = Arc::new(Board::default());
        let mut nodes: Vec<_> = (0..2)
            .map(|i| node(&group, &board, i, Config::default()))
            .collect();
        for node in &mut nodes {
            node.manager.sync().await.unwrap();
        }
        group.outage();
        // Every agent restarts with the pods, and their records are gone.
        board.records.lock().unwrap().iter_mut().for_each(|r| *r = None);
        let mut nodes: Vec<_> = (0..2)
            .map(|i| node(&group, &board, i, Config::default()))
            .collect();

        assert!(matches!(
            nodes[1].manager.sync().await,
            Err(SyncError::AwaitingGroup)
        ));
        assert_eq!(nodes[0].manager.sync().await.unwrap(), Role::Primary);
        assert_eq!(
            group.calls().last().unwrap(),
            &format!("reboot_cluster_from_complete_outage {}", address(0))
        );
        assert_eq!(nodes[1].manager.sync().await.unwrap(), Role::Secondary);
        assert_eq!(
            group.calls().last().unwrap(),
            &format!("rejoin_instance {} {}", address(0), address(1))
        );
    }

    #[tokio::test]
    async fn test_bootstrap_failures_are_bounded() {
        let group = Arc::new(FakeGroup::new());
        let board = Arc::new(Board::default());
        let config = Config {
            max_bootstrap_attempts: 2,
            ..Default::default()
        };
        let mut seed = node(&group, &board, 0, config);
        group.fail_next("create_cluster", 2);

        assert!(matches!(
            seed.manager.sync().await,
            Err(SyncError::Bootstrap(_))
        ));
        assert_eq!(seed.manager.state(), SyncState::Bootstrapping);
        assert!(seed.health.is_live());
        assert!(seed.manager.sync().await.is_err());
        assert!(!seed.health.is_live());

        // A late success revives it.
        assert_eq!(seed.manager.sync().await.unwrap(), Role::Primary);
        assert!(seed.health.is_live());
    }

    #[tokio::test]
    async fn test_engine_failures_are_bounded() {
        let group = Arc::new(FakeGroup::new());
        let board = Arc::new(Board::default());
        let config = Config {
            max_engine_failures: 3,
            ..Default::default()
        };
        let mut seed = node(&group, &board, 0, config);
        group.crash(&address(0));
        for _ in 0..2 {
            assert!(seed.manager.sync().await.is_err());
            assert!(seed.health.is_live());
        }
        assert!(seed.manager.sync().await.is_err());
        assert!(!seed.health.is_live());
    }

    #[tokio::test]
    async fn test_publishes_only_changes() {
        let group = Arc::new(FakeGroup::new());
        let board = Arc::new(Board::default());
        let mut seed = node(&group, &board, 0, Config::default());
        seed.manager.sync().await.unwrap();
        let first = published(&board, 0).unwrap();
        seed.manager.sync().await.unwrap();
        assert_eq!(published(&board, 0).unwrap(), first);

        // A failed publication is retried on the next cycle.
        group.crash(&address(0));
        *seed.registry.fail.lock().unwrap() = true;
        seed.manager.sync().await.unwrap_err();
        assert_eq!(published(&board, 0).unwrap(), first);
        *seed.registry.fail.lock().unwrap() = false;
        seed.manager.sync().await.unwrap_err();
        assert_eq!(
            published(&board, 0).unwrap().join_status,
            JoinStatus::Unjoined
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_until_joined() {
        let group = Arc::new(FakeGroup::new());
        let board = Arc::new(Board::default());
        let mut seed = node(&group, &board, 0, Config::default());
        let mut joiner = node(&group, &board, 1, Config::default());
        let cancel = CancellationToken::new();

        let joined = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                let role = joiner
                    .manager
                    .sync_until_joined(Duration::from_secs(10), &cancel)
                    .await;
                (role, joiner)
            }
        });
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(!joined.is_finished());
        seed.manager.sync().await.unwrap();
        let (role, joiner) = joined.await.unwrap();
        assert_eq!(role, Some(Role::Secondary));
        assert!(joiner.health.is_ready());

        cancel.cancel();
        let mut idle = node(&group, &board, 2, Config::default());
        group.crash(&address(2));
        assert_eq!(
            idle.manager
                .sync_until_joined(Duration::from_secs(10), &cancel)
                .await,
            None
        );
    }
}
