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

//! Upstream cluster membership: hosts, per-priority host sets, and the
//! discovery-driven engine that keeps them current.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

pub mod host;
mod load_balancer;
pub mod membership;
pub mod metrics;
mod resource;
mod scheduler;

pub use host::{HealthFlag, Host, MetadataMap, OutlierResult};
pub use load_balancer::LoadBalancer;
pub use membership::{Cluster, ClusterConfig, ClusterManager, MembershipEngine, ResourcePriority};
pub use resource::{ConnectionPermit, ResourceLimits, ResourceManager};
pub use scheduler::EdfScheduler;

/// Where an endpoint sits in the topology.
#[derive(Clone, Debug, Default, Hash, Eq, PartialEq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Locality {
    pub region: String,
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub sub_zone: String,
}

impl Locality {
    pub fn new(
        region: impl Into<String>,
        zone: impl Into<String>,
        sub_zone: impl Into<String>,
    ) -> Self {
        Self {
            region: region.into(),
            zone: zone.into(),
            sub_zone: sub_zone.into(),
        }
    }
}

impl std::fmt::Display for Locality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.region, self.zone, self.sub_zone)
    }
}

/// Hosts partitioned into locality buckets. Bucket order is first-appearance
/// order from the discovery update, except that the local locality (when
/// known) is always bucket zero.
#[derive(Clone, Debug, Default)]
pub struct HostsPerLocality {
    has_local_locality: bool,
    buckets: Vec<Vec<Arc<Host>>>,
}

impl HostsPerLocality {
    pub fn new(buckets: Vec<Vec<Arc<Host>>>, has_local_locality: bool) -> Self {
        Self {
            has_local_locality,
            buckets,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    #[inline]
    pub fn get(&self) -> &[Vec<Arc<Host>>] {
        &self.buckets
    }

    #[inline]
    pub fn has_local_locality(&self) -> bool {
        self.has_local_locality
    }

    /// Clones the bucket structure keeping only hosts the predicate accepts.
    /// Bucket positions are preserved so indices stay aligned with the
    /// unfiltered view and with the locality weight vector.
    pub fn filter(&self, predicate: impl Fn(&Host) -> bool) -> Self {
        Self {
            has_local_locality: self.has_local_locality,
            buckets: self
                .buckets
                .iter()
                .map(|bucket| {
                    bucket
                        .iter()
                        .filter(|host| predicate(host))
                        .cloned()
                        .collect()
                })
                .collect(),
        }
    }
}

/// Returns the subset of `hosts` with no health flag set.
pub fn healthy_subset(hosts: &[Arc<Host>]) -> Vec<Arc<Host>> {
    hosts.iter().filter(|h| h.healthy()).cloned().collect()
}

/// The replacement vectors applied to a [`HostSet`] in one atomic swap.
pub struct HostSetUpdate {
    pub hosts: Vec<Arc<Host>>,
    pub healthy_hosts: Vec<Arc<Host>>,
    pub hosts_per_locality: HostsPerLocality,
    pub healthy_hosts_per_locality: HostsPerLocality,
    pub locality_weights: Vec<u32>,
}

impl HostSetUpdate {
    /// Derives the healthy views from a full host list and its partition.
    pub fn derive(
        hosts: Vec<Arc<Host>>,
        hosts_per_locality: HostsPerLocality,
        locality_weights: Vec<u32>,
    ) -> Self {
        let healthy_hosts = healthy_subset(&hosts);
        let healthy_hosts_per_locality = hosts_per_locality.filter(Host::healthy);
        Self {
            hosts,
            healthy_hosts,
            hosts_per_locality,
            healthy_hosts_per_locality,
            locality_weights,
        }
    }
}

/// The hosts at one priority level.
#[derive(Debug)]
pub struct HostSet {
    priority: u32,
    hosts: Vec<Arc<Host>>,
    healthy_hosts: Vec<Arc<Host>>,
    hosts_per_locality: HostsPerLocality,
    healthy_hosts_per_locality: HostsPerLocality,
    locality_weights: Vec<u32>,
    locality_scheduler: Option<EdfScheduler<usize>>,
}

impl HostSet {
    fn new(priority: u32) -> Self {
        Self {
            priority,
            hosts: Vec::new(),
            healthy_hosts: Vec::new(),
            hosts_per_locality: HostsPerLocality::empty(),
            healthy_hosts_per_locality: HostsPerLocality::empty(),
            locality_weights: Vec::new(),
            locality_scheduler: None,
        }
    }

    #[inline]
    pub fn priority(&self) -> u32 {
        self.priority
    }

    #[inline]
    pub fn hosts(&self) -> &[Arc<Host>] {
        &self.hosts
    }

    #[inline]
    pub fn healthy_hosts(&self) -> &[Arc<Host>] {
        &self.healthy_hosts
    }

    #[inline]
    pub fn hosts_per_locality(&self) -> &HostsPerLocality {
        &self.hosts_per_locality
    }

    #[inline]
    pub fn healthy_hosts_per_locality(&self) -> &HostsPerLocality {
        &self.healthy_hosts_per_locality
    }

    #[inline]
    pub fn locality_weights(&self) -> &[u32] {
        &self.locality_weights
    }

    /// Atomically swaps in the new membership view and rebuilds the
    /// locality scheduler.
    ///
    /// No scheduler is built without locality weights (the cluster is not
    /// locality-weighted) or with zero healthy hosts: every locality would
    /// have zero effective weight and selection falls back to the flat
    /// host lists.
    fn update_hosts(&mut self, update: HostSetUpdate) {
        self.hosts = update.hosts;
        self.healthy_hosts = update.healthy_hosts;
        self.hosts_per_locality = update.hosts_per_locality;
        self.healthy_hosts_per_locality = update.healthy_hosts_per_locality;
        self.locality_weights = update.locality_weights;

        if !self.locality_weights.is_empty() && !self.healthy_hosts.is_empty() {
            let mut scheduler = EdfScheduler::new();
            for index in 0..self.hosts_per_locality.get().len() {
                let weight = self.effective_locality_weight(index);
                if weight > 0.0 {
                    scheduler.add(weight, index);
                }
            }
            self.locality_scheduler = (!scheduler.is_empty()).then_some(scheduler);
        } else {
            self.locality_scheduler = None;
        }
    }

    /// `locality_weight × healthy_in_locality / total_in_locality`.
    fn effective_locality_weight(&self, index: usize) -> f64 {
        let total = self.hosts_per_locality.get()[index].len();
        if total == 0 {
            return 0.0;
        }
        let healthy = self.healthy_hosts_per_locality.get()[index].len();
        let weight = *self.locality_weights.get(index).unwrap_or(&0);
        f64::from(weight) * healthy as f64 / total as f64
    }

    /// Picks the next locality bucket by weighted EDF rotation. `None` when
    /// the total effective weight is zero.
    pub fn choose_locality(&mut self) -> Option<usize> {
        let scheduler = self.locality_scheduler.as_mut()?;
        let (weight, index) = scheduler.pick()?;
        scheduler.add(weight, index);
        Some(index)
    }
}

type MemberUpdateCb = Box<dyn Fn(u32, &[Arc<Host>], &[Arc<Host>]) + Send + Sync>;

/// The ordered collection of host sets for one cluster, indexed by
/// priority.
///
/// The vector only ever grows: observers hold priority indices and an
/// update that stops mentioning a priority empties it rather than removing
/// it.
#[derive(Default)]
pub struct PrioritySet {
    host_sets: RwLock<Vec<HostSet>>,
    callbacks: RwLock<Vec<MemberUpdateCb>>,
}

impl PrioritySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of priority levels currently materialized.
    pub fn len(&self) -> usize {
        self.host_sets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.host_sets.read().is_empty()
    }

    /// Grows the vector so `priority` exists. Creation alone notifies no
    /// observers.
    pub fn ensure_priority(&self, priority: u32) {
        let mut sets = self.host_sets.write();
        while sets.len() <= priority as usize {
            let next = sets.len() as u32;
            sets.push(HostSet::new(next));
        }
    }

    /// Registers an observer for membership deltas. Observers are
    /// append-only and receive every delta in ascending priority order
    /// within one update.
    pub fn add_member_update_cb(
        &self,
        callback: impl Fn(u32, &[Arc<Host>], &[Arc<Host>]) + Send + Sync + 'static,
    ) {
        self.callbacks.write().push(Box::new(callback));
    }

    /// Swaps the membership view for `priority` and notifies observers.
    pub fn update_hosts(
        &self,
        priority: u32,
        update: HostSetUpdate,
        hosts_added: &[Arc<Host>],
        hosts_removed: &[Arc<Host>],
    ) {
        self.ensure_priority(priority);
        {
            let mut sets = self.host_sets.write();
            sets[priority as usize].update_hosts(update);
        }
        // Callbacks run outside the write lock so observers may read the
        // set they are being notified about.
        for callback in self.callbacks.read().iter() {
            callback(priority, hosts_added, hosts_removed);
        }
    }

    /// Read access to every materialized host set in priority order.
    pub fn with_host_sets<R>(&self, f: impl FnOnce(&[HostSet]) -> R) -> R {
        f(&self.host_sets.read())
    }

    /// A snapshot of the hosts at `priority`, empty if not materialized.
    pub fn hosts(&self, priority: u32) -> Vec<Arc<Host>> {
        self.host_sets
            .read()
            .get(priority as usize)
            .map(|set| set.hosts.clone())
            .unwrap_or_default()
    }

    /// Weighted locality pick for `priority`; `None` iff the priority has
    /// no scheduler (zero total effective weight).
    pub fn choose_locality(&self, priority: u32) -> Option<usize> {
        self.host_sets
            .write()
            .get_mut(priority as usize)?
            .choose_locality()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(addr: &str) -> Arc<Host> {
        Host::new(addr.parse().unwrap(), "", MetadataMap::new(), 1, None)
    }

    fn bucketed(buckets: Vec<Vec<Arc<Host>>>, weights: Vec<u32>) -> HostSetUpdate {
        let hosts = buckets.iter().flatten().cloned().collect();
        HostSetUpdate::derive(hosts, HostsPerLocality::new(buckets, false), weights)
    }

    #[test]
    fn priority_set_grows_monotonically() {
        let set = PrioritySet::new();
        assert_eq!(set.len(), 0);

        set.ensure_priority(2);
        assert_eq!(set.len(), 3);
        set.with_host_sets(|sets| {
            for (i, hs) in sets.iter().enumerate() {
                assert_eq!(hs.priority(), i as u32);
            }
        });

        set.ensure_priority(0);
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn healthy_views_stay_aligned() {
        let a = host("10.0.0.1:80");
        let b = host("10.0.0.2:80");
        let c = host("10.0.0.3:80");
        b.health_flag_set(HealthFlag::FailedEdsHealth);

        let update = bucketed(
            vec![vec![a.clone(), b.clone()], vec![c.clone()]],
            vec![1, 1],
        );
        assert_eq!(update.healthy_hosts.len(), 2);
        assert_eq!(update.healthy_hosts_per_locality.get().len(), 2);
        assert_eq!(update.healthy_hosts_per_locality.get()[0].len(), 1);
        assert_eq!(update.healthy_hosts_per_locality.get()[1].len(), 1);
        for healthy in &update.healthy_hosts {
            assert!(healthy.healthy());
        }
        assert!(!update.healthy_hosts.iter().any(|h| **h == *b));
    }

    #[test]
    fn member_update_callbacks_see_deltas() {
        let set = PrioritySet::new();
        let seen = Arc::new(RwLock::new(Vec::new()));
        let seen_cb = seen.clone();
        set.add_member_update_cb(move |priority, added, removed| {
            seen_cb
                .write()
                .push((priority, added.len(), removed.len()));
        });

        let a = host("10.0.0.1:80");
        set.update_hosts(
            1,
            bucketed(vec![vec![a.clone()]], vec![]),
            &[a.clone()],
            &[],
        );
        set.update_hosts(1, bucketed(vec![], vec![]), &[], &[a]);

        assert_eq!(*seen.read(), vec![(1, 1, 0), (1, 0, 1)]);
    }

    #[test]
    fn choose_locality_without_weights_is_none() {
        let set = PrioritySet::new();
        let a = host("10.0.0.1:80");
        set.update_hosts(0, bucketed(vec![vec![a.clone()]], vec![]), &[a], &[]);
        assert_eq!(set.choose_locality(0), None);
    }

    #[test]
    fn choose_locality_with_all_unhealthy_is_none() {
        let set = PrioritySet::new();
        let a = host("10.0.0.1:80");
        a.health_flag_set(HealthFlag::FailedEdsHealth);
        set.update_hosts(0, bucketed(vec![vec![a.clone()]], vec![1]), &[a], &[]);
        assert_eq!(set.choose_locality(0), None);
    }

    #[test]
    fn weighted_locality_distribution() {
        let set = PrioritySet::new();
        let a = host("10.0.0.1:80");
        let b = host("10.0.0.2:80");
        set.update_hosts(
            0,
            bucketed(vec![vec![a.clone()], vec![b.clone()]], vec![1, 2]),
            &[a, b],
            &[],
        );

        let mut counts = [0usize; 2];
        for _ in 0..600 {
            counts[set.choose_locality(0).unwrap()] += 1;
        }
        assert!((counts[0] as i64 - 200).abs() <= 2, "counts: {counts:?}");
        assert!((counts[1] as i64 - 400).abs() <= 2, "counts: {counts:?}");
    }

    #[test]
    fn degraded_locality_health_scales_weight() {
        // Locality 0 keeps 1 of 5 hosts healthy, locality 1 keeps 1 of 1:
        // effective weights 1x1/5 vs 2x1/1, a 1:10 ratio.
        let set = PrioritySet::new();
        let bucket0: Vec<_> = (1..=5)
            .map(|i| host(&format!("10.0.0.{i}:80")))
            .collect();
        for unhealthy in &bucket0[1..] {
            unhealthy.health_flag_set(HealthFlag::FailedEdsHealth);
        }
        let b = host("10.0.1.1:80");

        let all: Vec<_> = bucket0.iter().cloned().chain([b.clone()]).collect();
        set.update_hosts(
            0,
            bucketed(vec![bucket0, vec![b]], vec![1, 2]),
            &all,
            &[],
        );

        let mut counts = [0usize; 2];
        for _ in 0..600 {
            counts[set.choose_locality(0).unwrap()] += 1;
        }
        assert!((counts[0] as i64 - 55).abs() <= 5, "counts: {counts:?}");
        assert!((counts[1] as i64 - 545).abs() <= 5, "counts: {counts:?}");
    }
}
