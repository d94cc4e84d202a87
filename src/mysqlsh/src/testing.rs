// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! An in-process stand-in for a group of MySQL servers, for exercising
//! membership logic without running any.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::status::{ClusterStatus, Instance, InstanceMode, InstanceState, ReplicaSet};
use crate::{AdminShell, OptionValue, Options, ShellError};

/// A simulated replication group that every instance of a cluster
/// administers through the same [`AdminShell`].
///
/// Servers are identified by their `host:port` address. A server that holds
/// cluster metadata answers status queries; the group is either running or
/// entirely offline.
#[derive(Debug, Default)]
pub struct FakeGroup {
    state: Mutex<GroupState>,
}

#[derive(Debug, Default)]
struct GroupState {
    name: Option<String>,
    running: bool,
    multi_primary: bool,
    members: BTreeMap<String, (InstanceMode, InstanceState)>,
    down: BTreeSet<String>,
    failures: BTreeMap<&'static str, usize>,
    calls: Vec<String>,
}

impl GroupState {
    fn fail(&mut self, method: &'static str, target: &str) -> Result<(), ShellError> {
        match self.failures.get_mut(method) {
            Some(n) if *n > 0 => {
                *n -= 1;
                Err(ShellError::Failed {
                    method,
                    target: target.into(),
                    message: "injected failure".into(),
                })
            }
            _ => Ok(()),
        }
    }

    fn reachable(&self, method: &'static str, target: &str) -> Result<(), ShellError> {
        if self.down.contains(target) {
            return Err(ShellError::Failed {
                method,
                target: target.into(),
                message: format!("Can't connect to MySQL server on '{}'", target),
            });
        }
        Ok(())
    }

    fn is_online(&self, address: &str) -> bool {
        matches!(self.members.get(address), Some((_, InstanceState::Online)))
    }

    fn member_mode(&self) -> InstanceMode {
        if self.multi_primary {
            InstanceMode::ReadWrite
        } else {
            InstanceMode::ReadOnly
        }
    }

    /// Checks that `target` can make changes to the running group.
    fn coordinator(&self, method: &'static str, target: &str) -> Result<(), ShellError> {
        self.reachable(method, target)?;
        if !self.members.contains_key(target) {
            return Err(ShellError::NoCluster {
                target: target.into(),
            });
        }
        if !self.running || !self.is_online(target) {
            return Err(ShellError::GroupOffline {
                target: target.into(),
            });
        }
        Ok(())
    }

    /// Hands the primary role to the lowest online member if no online
    /// member holds it.
    fn elect(&mut self) {
        if self.multi_primary
            || self
                .members
                .values()
                .any(|(mode, state)| *mode == InstanceMode::ReadWrite && *state == InstanceState::Online)
        {
            return;
        }
        if let Some((_, (mode, _))) = self
            .members
            .iter_mut()
            .find(|(_, (_, state))| *state == InstanceState::Online)
        {
            *mode = InstanceMode::ReadWrite;
        }
    }
}

impl FakeGroup {
    pub fn new() -> Self {
        FakeGroup::default()
    }

    fn lock(&self) -> MutexGuard<'_, GroupState> {
        self.state.lock().expect("lock poisoned")
    }

    /// Makes the next `n` invocations of `method` fail.
    pub fn fail_next(&self, method: &'static str, n: usize) {
        self.lock().failures.insert(method, n);
    }

    /// Stops the server at `address`. The group notices it went missing.
    pub fn crash(&self, address: &str) {
        let mut state = self.lock();
        state.down.insert(address.into());
        if let Some(member) = state.members.get_mut(address) {
            *member = (InstanceMode::Unknown("n/a".into()), InstanceState::Missing);
        }
        if !state.members.values().any(|(_, s)| *s == InstanceState::Online) {
            state.running = false;
        }
        state.elect();
    }

    /// Starts the server at `address` again. Group replication does not
    /// start with it.
    pub fn restart(&self, address: &str) {
        self.lock().down.remove(address);
    }

    /// Stops every server and the group with them.
    pub fn outage(&self) {
        let mut state = self.lock();
        state.running = false;
        for member in state.members.values_mut() {
            *member = (InstanceMode::Unknown("n/a".into()), InstanceState::Offline);
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn member(&self, address: &str) -> Option<(InstanceMode, InstanceState)> {
        self.lock().members.get(address).cloned()
    }

    /// Every mutating invocation so far, as `method target [instance]`.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }
}

#[async_trait]
impl AdminShell for FakeGroup {
    async fn is_engine_running(&self, target: &str) -> bool {
        !self.lock().down.contains(target)
    }

    async fn cluster_status(
        &self,
        target: &str,
        cluster: &str,
    ) -> Result<ClusterStatus, ShellError> {
        let state = self.lock();
        state.reachable("status", target)?;
        if !state.members.contains_key(target) || state.name.as_deref() != Some(cluster) {
            return Err(ShellError::NoCluster {
                target: target.into(),
            });
        }
        if !state.running || !state.is_online(target) {
            return Err(ShellError::GroupOffline {
                target: target.into(),
            });
        }
        let topology: BTreeMap<_, _> = state
            .members
            .iter()
            .map(|(address, (mode, status))| {
                let instance = Instance {
                    address: address.clone(),
                    mode: mode.clone(),
                    status: status.clone(),
                };
                (address.clone(), instance)
            })
            .collect();
        // Members the group expelled no longer count towards its majority.
        let online = topology
            .values()
            .filter(|i| i.status == InstanceState::Online)
            .count();
        let voting = topology
            .values()
            .filter(|i| !i.status.needs_rejoin())
            .count();
        let primary = if state.multi_primary {
            None
        } else {
            topology
                .values()
                .find(|i| i.mode == InstanceMode::ReadWrite)
                .map(|i| i.address.clone())
        };
        Ok(ClusterStatus {
            cluster_name: cluster.into(),
            default_replica_set: ReplicaSet {
                name: "default".into(),
                primary,
                status: if online * 2 > voting {
                    "OK".into()
                } else {
                    "NO_QUORUM".into()
                },
                status_text: String::new(),
                topology,
                topology_mode: Some(if state.multi_primary {
                    "Multi-Primary".into()
                } else {
                    "Single-Primary".into()
                }),
            },
        })
    }

    async fn create_cluster(
        &self,
        target: &str,
        cluster: &str,
        options: &Options,
    ) -> Result<(), ShellError> {
        let mut state = self.lock();
        state.calls.push(format!("create_cluster {}", target));
        state.reachable("create_cluster", target)?;
        state.fail("create_cluster", target)?;
        if state.name.is_some() {
            return Err(ShellError::Failed {
                method: "create_cluster",
                target: target.into(),
                message: "cluster already exists".into(),
            });
        }
        state.name = Some(cluster.into());
        state.running = true;
        state.multi_primary = options.get("multiPrimary") == Some(&OptionValue::Bool(true));
        state.members.insert(
            target.into(),
            (InstanceMode::ReadWrite, InstanceState::Online),
        );
        Ok(())
    }

    async fn reboot_cluster_from_complete_outage(
        &self,
        target: &str,
        _cluster: &str,
        _options: &Options,
    ) -> Result<(), ShellError> {
        let mut state = self.lock();
        state.calls.push(format!("reboot_cluster_from_complete_outage {}", target));
        state.reachable("reboot_cluster_from_complete_outage", target)?;
        state.fail("reboot_cluster_from_complete_outage", target)?;
        if !state.members.contains_key(target) {
            return Err(ShellError::NoCluster {
                target: target.into(),
            });
        }
        if state.running {
            return Err(ShellError::Failed {
                method: "reboot_cluster_from_complete_outage",
                target: target.into(),
                message: "the cluster is already online".into(),
            });
        }
        state.running = true;
        state.members.insert(
            target.into(),
            (InstanceMode::ReadWrite, InstanceState::Online),
        );
        Ok(())
    }

    async fn add_instance(
        &self,
        target: &str,
        _cluster: &str,
        instance: &str,
        _options: &Options,
    ) -> Result<(), ShellError> {
        let mut state = self.lock();
        state.calls.push(format!("add_instance {} {}", target, instance));
        state.coordinator("add_instance", target)?;
        state.reachable("add_instance", instance)?;
        state.fail("add_instance", target)?;
        if state.members.contains_key(instance) {
            return Err(ShellError::Failed {
                method: "add_instance",
                target: target.into(),
                message: format!("{} is already part of the cluster", instance),
            });
        }
        let mode = state.member_mode();
        state
            .members
            .insert(instance.into(), (mode, InstanceState::Online));
        Ok(())
    }

    async fn rejoin_instance(
        &self,
        target: &str,
        _cluster: &str,
        instance: &str,
        _options: &Options,
    ) -> Result<(), ShellError> {
        let mut state = self.lock();
        state.calls.push(format!("rejoin_instance {} {}", target, instance));
        state.coordinator("rejoin_instance", target)?;
        state.reachable("rejoin_instance", instance)?;
        state.fail("rejoin_instance", target)?;
        if !state.members.contains_key(instance) {
            return Err(ShellError::Failed {
                method: "rejoin_instance",
                target: target.into(),
                message: format!("{} does not belong to the cluster", instance),
            });
        }
        let mode = state.member_mode();
        state
            .members
            .insert(instance.into(), (mode, InstanceState::Online));
        Ok(())
    }

    async fn remove_instance(
        &self,
        target: &str,
        _cluster: &str,
        instance: &str,
        _options: &Options,
    ) -> Result<(), ShellError> {
        let mut state = self.lock();
        state.calls.push(format!("remove_instance {} {}", target, instance));
        state.coordinator("remove_instance", target)?;
        state.fail("remove_instance", target)?;
        state.members.remove(instance);
        Ok(())
    }
}
