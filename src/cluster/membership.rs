/*
 * Copyright 2026 The Tiller Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! The endpoint-discovery membership engine.
//!
//! One [`MembershipEngine`] consumes assignment updates for one cluster and
//! drives its [`PrioritySet`]: staging the update per priority, computing
//! the host delta by address, preserving surviving host objects, and
//! publishing the new healthy and per-locality views atomically.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::host::{HealthFlag, Host};
use super::metrics::ClusterStats;
use super::resource::{ResourceLimits, ResourceManager};
use super::{healthy_subset, HostSetUpdate, HostsPerLocality, Locality, PrioritySet};
use crate::xds::{self, ClusterLoadAssignment, ValidationError, MAX_PRIORITY};

/// Static configuration for one upstream cluster.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    pub name: String,
    /// Close connections to removed hosts immediately, even when active
    /// health checking would otherwise let them drain.
    #[serde(default)]
    pub drain_on_removal: bool,
    /// Whether an active health checker is attached to the cluster. New
    /// hosts then start unhealthy until their first check passes, and
    /// removal of actively-healthy hosts is deferred.
    #[serde(default)]
    pub active_health_checking: bool,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_buffer_limit")]
    pub per_connection_buffer_limit_bytes: usize,
    #[serde(default)]
    pub resource_limits: ResourceLimits,
    #[serde(default)]
    pub high_resource_limits: ResourceLimits,
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_buffer_limit() -> usize {
    1024 * 1024
}

impl ClusterConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            drain_on_removal: false,
            active_health_checking: false,
            connect_timeout_ms: default_connect_timeout_ms(),
            per_connection_buffer_limit_bytes: default_buffer_limit(),
            resource_limits: ResourceLimits::default(),
            high_resource_limits: ResourceLimits::default(),
        }
    }

    pub fn connect_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Priority tier used when claiming cluster resources.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourcePriority {
    Default,
    High,
}

/// One upstream cluster: configuration, stats, membership, and capacity.
pub struct Cluster {
    config: ClusterConfig,
    stats: ClusterStats,
    priority_set: Arc<PrioritySet>,
    resources_default: Arc<ResourceManager>,
    resources_high: Arc<ResourceManager>,
}

impl Cluster {
    pub fn new(config: ClusterConfig) -> Arc<Self> {
        let stats = ClusterStats::new(&config.name);
        let cluster = Arc::new(Self {
            stats: stats.clone(),
            resources_default: ResourceManager::new(config.resource_limits),
            resources_high: ResourceManager::new(config.high_resource_limits),
            priority_set: Arc::new(PrioritySet::new()),
            config,
        });

        // The callback is owned by the priority set, so it holds the set
        // weakly to avoid a reference cycle.
        let priority_set = Arc::downgrade(&cluster.priority_set);
        let gauges = stats;
        cluster.priority_set.add_member_update_cb(move |_, added, removed| {
            if !added.is_empty() || !removed.is_empty() {
                gauges.membership_change.inc();
            }
            let Some(priority_set) = priority_set.upgrade() else {
                return;
            };
            let (mut total, mut healthy) = (0, 0);
            priority_set.with_host_sets(|sets| {
                for set in sets {
                    total += set.hosts().len();
                    healthy += set.healthy_hosts().len();
                }
            });
            gauges.membership_total.set(total as i64);
            gauges.membership_healthy.set(healthy as i64);
        });

        cluster
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    #[inline]
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    #[inline]
    pub fn stats(&self) -> &ClusterStats {
        &self.stats
    }

    #[inline]
    pub fn priority_set(&self) -> &Arc<PrioritySet> {
        &self.priority_set
    }

    pub fn resource_manager(&self, priority: ResourcePriority) -> &Arc<ResourceManager> {
        match priority {
            ResourcePriority::Default => &self.resources_default,
            ResourcePriority::High => &self.resources_high,
        }
    }
}

/// The set of configured clusters and their discovery engines.
pub struct ClusterManager {
    local_cluster_name: Option<String>,
    local_locality: Option<Locality>,
    clusters: parking_lot::RwLock<HashMap<String, Arc<Cluster>>>,
}

impl ClusterManager {
    pub fn new(local_cluster_name: Option<String>, local_locality: Option<Locality>) -> Arc<Self> {
        Arc::new(Self {
            local_cluster_name,
            local_locality,
            clusters: parking_lot::RwLock::new(HashMap::new()),
        })
    }

    /// Registers a cluster and returns the engine that feeds it. Replacing
    /// an existing cluster of the same name is an error.
    pub fn add_cluster(&self, config: ClusterConfig) -> crate::Result<MembershipEngine> {
        let name = config.name.clone();
        let mut clusters = self.clusters.write();
        if clusters.contains_key(&name) {
            return Err(eyre::eyre!("duplicate cluster '{name}'"));
        }

        let cluster = Cluster::new(config);
        clusters.insert(name.clone(), cluster.clone());

        let is_local = self.local_cluster_name.as_deref() == Some(name.as_str());
        Ok(MembershipEngine::new(
            cluster,
            is_local,
            self.local_locality.clone(),
        ))
    }

    pub fn get(&self, name: &str) -> Option<Arc<Cluster>> {
        self.clusters.read().get(name).cloned()
    }
}

type LocalityWeightsMap = HashMap<Locality, u32>;

/// Per-priority staging state for one update: the hosts in input order and
/// the locality weight map accumulated from the assignment.
#[derive(Default)]
struct PriorityState {
    hosts: Option<Vec<Arc<Host>>>,
    locality_weights: LocalityWeightsMap,
}

/// Consumes assignment updates for one subscribed cluster.
pub struct MembershipEngine {
    cluster: Arc<Cluster>,
    is_local_cluster: bool,
    local_locality: Option<Locality>,
    /// Last applied locality weight map per priority; a weight change alone
    /// forces a rebuild even when no address changed.
    applied_locality_weights: Vec<LocalityWeightsMap>,
    on_initialized: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl MembershipEngine {
    pub fn new(cluster: Arc<Cluster>, is_local_cluster: bool, local_locality: Option<Locality>) -> Self {
        Self {
            cluster,
            is_local_cluster,
            local_locality,
            applied_locality_weights: Vec::new(),
            on_initialized: Mutex::new(None),
        }
    }

    /// Registers the callback run when the first update (or the first
    /// subscription failure) completes initialization.
    pub fn initialize(&self, callback: impl FnOnce() + Send + 'static) {
        *self.on_initialized.lock() = Some(Box::new(callback));
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// Applies one discovery update. Validation failures are fatal for the
    /// update and leave membership untouched.
    pub fn on_assignment(
        &mut self,
        resources: &[ClusterLoadAssignment],
    ) -> Result<(), ValidationError> {
        let stats = self.cluster.stats().clone();
        stats.update_attempt.inc();

        let Some(assignment) = xds::validate_update(resources, self.cluster.name())? else {
            tracing::debug!(cluster = self.cluster.name(), "missing assignment in update");
            stats.update_empty.inc();
            self.finish_initialization();
            return Ok(());
        };

        let priority_state = self.stage(assignment)?;

        let mut max_host_weight = 1;
        let mut rebuilt = false;

        for (priority, state) in priority_state.iter().enumerate() {
            let Some(hosts) = &state.hosts else { continue };
            if self.applied_locality_weights.len() <= priority {
                self.applied_locality_weights.resize_with(priority + 1, HashMap::new);
            }
            rebuilt |= self.update_priority(
                priority as u32,
                hosts.clone(),
                state.locality_weights.clone(),
                &mut max_host_weight,
            );
        }

        // Priorities the update stopped mentioning are emptied, not dropped.
        for priority in priority_state.len()..self.cluster.priority_set().len() {
            if self.applied_locality_weights.len() <= priority {
                self.applied_locality_weights.resize_with(priority + 1, HashMap::new);
            }
            rebuilt |= self.update_priority(
                priority as u32,
                Vec::new(),
                HashMap::new(),
                &mut max_host_weight,
            );
        }

        stats.max_host_weight.set(max_host_weight as i64);
        if rebuilt {
            stats.update_success.inc();
        } else {
            stats.update_no_rebuild.inc();
        }

        self.finish_initialization();
        Ok(())
    }

    /// A subscription failure never clears membership; it only unblocks
    /// initialization so the rest of the system can proceed.
    pub fn on_subscription_error(&self) {
        tracing::warn!(
            cluster = self.cluster.name(),
            "endpoint discovery subscription failed, keeping current membership"
        );
        self.finish_initialization();
    }

    fn finish_initialization(&self) {
        if let Some(callback) = self.on_initialized.lock().take() {
            callback();
        }
    }

    /// Builds the per-priority staging view without touching live state, so
    /// that any validation error leaves membership unchanged.
    fn stage(
        &self,
        assignment: &ClusterLoadAssignment,
    ) -> Result<Vec<PriorityState>, ValidationError> {
        let mut priority_state: Vec<PriorityState> = Vec::new();

        for group in &assignment.endpoints {
            if group.priority > MAX_PRIORITY {
                return Err(ValidationError::PriorityOutOfRange {
                    cluster: self.cluster.name().to_owned(),
                    priority: group.priority,
                });
            }
            if group.priority > 0 && self.is_local_cluster {
                return Err(ValidationError::LocalClusterPriority(
                    self.cluster.name().to_owned(),
                ));
            }

            let priority = group.priority as usize;
            if priority_state.len() <= priority {
                priority_state.resize_with(priority + 1, PriorityState::default);
            }
            let state = &mut priority_state[priority];
            let hosts = state.hosts.get_or_insert_with(Vec::new);

            if let (Some(locality), Some(weight)) = (&group.locality, group.load_balancing_weight) {
                // Repeated entries for the same priority merge; the last
                // weight for a locality wins.
                state.locality_weights.insert(locality.clone(), weight);
            }

            for lb_endpoint in &group.lb_endpoints {
                let host = Host::new(
                    lb_endpoint.endpoint.address,
                    "",
                    lb_endpoint.metadata.clone().unwrap_or_default(),
                    lb_endpoint.load_balancing_weight.unwrap_or(1),
                    group.locality.clone(),
                );
                if lb_endpoint.health_status.failed() {
                    host.health_flag_set(HealthFlag::FailedEdsHealth);
                }
                hosts.push(host);
            }
        }

        Ok(priority_state)
    }

    /// Reconciles one priority and publishes it when anything material
    /// changed. Returns whether a rebuild happened.
    fn update_priority(
        &mut self,
        priority: u32,
        new_hosts: Vec<Arc<Host>>,
        locality_weights: LocalityWeightsMap,
        max_host_weight: &mut u32,
    ) -> bool {
        let current_hosts = self.cluster.priority_set().hosts(priority);
        let config = self.cluster.config();

        let reconciled = reconcile(
            new_hosts,
            current_hosts,
            config.active_health_checking,
            config.drain_on_removal,
            max_host_weight,
        );

        let weights_changed =
            self.applied_locality_weights[priority as usize] != locality_weights;
        if !reconciled.changed && !weights_changed {
            return false;
        }
        self.applied_locality_weights[priority as usize] = locality_weights.clone();

        tracing::debug!(
            cluster = self.cluster.name(),
            priority,
            hosts = reconciled.hosts.len(),
            added = reconciled.added.len(),
            removed = reconciled.removed.len(),
            "membership changed"
        );

        let (partition, weight_vec) =
            partition_by_locality(&reconciled.hosts, &locality_weights, &self.local_locality);
        let update = HostSetUpdate {
            healthy_hosts: healthy_subset(&reconciled.hosts),
            healthy_hosts_per_locality: partition.filter(Host::healthy),
            hosts: reconciled.hosts,
            hosts_per_locality: partition,
            locality_weights: weight_vec,
        };

        self.cluster.priority_set().update_hosts(
            priority,
            update,
            &reconciled.added,
            &reconciled.removed,
        );
        true
    }
}

struct Reconciled {
    hosts: Vec<Arc<Host>>,
    added: Vec<Arc<Host>>,
    removed: Vec<Arc<Host>>,
    changed: bool,
}

/// Computes the delta between the staged host list and the current one.
///
/// Hosts matched by address keep their existing object (stats, health
/// state, observers) and have their mutable attributes refreshed in place.
/// Duplicate addresses within one update collapse to the first occurrence.
/// Output order follows `new_hosts`.
fn reconcile(
    new_hosts: Vec<Arc<Host>>,
    mut current_hosts: Vec<Arc<Host>>,
    active_health_checking: bool,
    drain_on_removal: bool,
    max_host_weight: &mut u32,
) -> Reconciled {
    let mut changed = false;
    let mut seen = std::collections::HashSet::new();
    let mut hosts = Vec::with_capacity(new_hosts.len());
    let mut added = Vec::new();

    for new_host in new_hosts {
        if !seen.insert(new_host.address()) {
            continue;
        }
        *max_host_weight = (*max_host_weight).max(new_host.weight());

        let existing = current_hosts
            .iter()
            .position(|current| current.address() == new_host.address());
        match existing {
            Some(index) => {
                let current = current_hosts.swap_remove(index);

                let eds_failed = new_host.health_flag_get(HealthFlag::FailedEdsHealth);
                if current.health_flag_get(HealthFlag::FailedEdsHealth) != eds_failed {
                    let previously_healthy = current.healthy();
                    if eds_failed {
                        current.health_flag_set(HealthFlag::FailedEdsHealth);
                        changed |= previously_healthy;
                    } else {
                        current.health_flag_clear(HealthFlag::FailedEdsHealth);
                        changed |= !previously_healthy && current.healthy();
                    }
                }

                if *current.metadata() != *new_host.metadata() {
                    current.set_metadata((*new_host.metadata()).clone());
                    changed = true;
                }
                if current.locality() != new_host.locality() {
                    current.set_locality(new_host.locality());
                    changed = true;
                }
                current.set_weight(new_host.weight());
                hosts.push(current);
            }
            None => {
                if active_health_checking {
                    new_host.health_flag_set(HealthFlag::FailedActiveHc);
                }
                hosts.push(new_host.clone());
                added.push(new_host);
            }
        }
    }

    // With active health checking and no drain-on-removal, hosts that are
    // still passing checks outlive the update that dropped them.
    if !current_hosts.is_empty() && active_health_checking && !drain_on_removal {
        let mut index = 0;
        while index < current_hosts.len() {
            if !current_hosts[index].health_flag_get(HealthFlag::FailedActiveHc) {
                let kept = current_hosts.swap_remove(index);
                *max_host_weight = (*max_host_weight).max(kept.weight());
                hosts.push(kept);
            } else {
                index += 1;
            }
        }
    }

    let removed = current_hosts;
    changed |= !added.is_empty() || !removed.is_empty();

    Reconciled {
        hosts,
        added,
        removed,
        changed,
    }
}

/// Groups hosts into locality buckets in first-appearance order, putting
/// the local locality (when present among the hosts) first, and returns the
/// index-aligned weight vector.
fn partition_by_locality(
    hosts: &[Arc<Host>],
    weights: &LocalityWeightsMap,
    local_locality: &Option<Locality>,
) -> (HostsPerLocality, Vec<u32>) {
    let mut order: Vec<Option<Locality>> = Vec::new();
    let mut grouped: HashMap<Option<Locality>, Vec<Arc<Host>>> = HashMap::new();

    for host in hosts {
        let locality = host.locality();
        if !grouped.contains_key(&locality) {
            order.push(locality.clone());
        }
        grouped.entry(locality).or_default().push(host.clone());
    }

    let has_local = local_locality.is_some()
        && order
            .iter()
            .any(|locality| locality.as_ref() == local_locality.as_ref());
    if has_local {
        let position = order
            .iter()
            .position(|locality| locality.as_ref() == local_locality.as_ref())
            .unwrap();
        let local = order.remove(position);
        order.insert(0, local);
    }

    let mut buckets = Vec::with_capacity(order.len());
    let mut weight_vec = Vec::with_capacity(order.len());
    let weighted = !weights.is_empty();
    for locality in order {
        buckets.push(grouped.remove(&locality).unwrap_or_default());
        if weighted {
            weight_vec.push(
                locality
                    .as_ref()
                    .and_then(|l| weights.get(l))
                    .copied()
                    .unwrap_or(0),
            );
        }
    }

    (HostsPerLocality::new(buckets, has_local), weight_vec)
}
