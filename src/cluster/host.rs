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

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::RwLock;

use super::Locality;

/// Opaque key/value tree attached to an endpoint by discovery.
pub type MetadataMap = serde_json::Map<String, serde_json::Value>;

/// Host weights below this are clamped up.
pub const MIN_HOST_WEIGHT: u32 = 1;
/// Host weights above this are clamped down.
pub const MAX_HOST_WEIGHT: u32 = 128;

/// Reasons a host can be excluded from the healthy subset. A host is
/// healthy iff no flag is set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum HealthFlag {
    FailedActiveHc = 0x1,
    FailedOutlierCheck = 0x2,
    FailedEdsHealth = 0x4,
}

/// The outcome of an upstream connection attempt, reported by the proxy
/// filter for outlier tracking.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutlierResult {
    Success,
    Timeout,
    ConnectFailed,
}

/// Consecutive connect failures before a host is ejected from the healthy
/// subset via [`HealthFlag::FailedOutlierCheck`].
const CONSECUTIVE_FAILURE_EJECTION: u32 = 5;

#[derive(Debug, Default)]
pub struct HostStats {
    pub cx_total: AtomicU64,
    pub cx_active: AtomicU64,
    pub cx_connect_fail: AtomicU64,
}

/// A single upstream endpoint.
///
/// The address is the identity: two hosts are interchangeable iff their
/// addresses are equal, which is what the membership delta computation keys
/// on. Everything else is mutable in place so that a preserved host keeps
/// its object identity (and therefore its stats and health state) across
/// discovery updates.
#[derive(Debug)]
pub struct Host {
    address: SocketAddr,
    hostname: String,
    locality: RwLock<Option<Locality>>,
    metadata: ArcSwap<MetadataMap>,
    weight: AtomicU32,
    health_flags: AtomicU32,
    used: AtomicBool,
    consecutive_failures: AtomicU32,
    stats: HostStats,
}

impl Host {
    pub fn new(
        address: SocketAddr,
        hostname: impl Into<String>,
        metadata: MetadataMap,
        weight: u32,
        locality: Option<Locality>,
    ) -> Arc<Self> {
        Arc::new(Self {
            address,
            hostname: hostname.into(),
            locality: RwLock::new(locality),
            metadata: ArcSwap::from_pointee(metadata),
            weight: AtomicU32::new(weight.clamp(MIN_HOST_WEIGHT, MAX_HOST_WEIGHT)),
            health_flags: AtomicU32::new(0),
            used: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
            stats: HostStats::default(),
        })
    }

    #[inline]
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    #[inline]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Relaxed)
    }

    pub fn set_weight(&self, weight: u32) {
        self.weight.store(
            weight.clamp(MIN_HOST_WEIGHT, MAX_HOST_WEIGHT),
            Ordering::Relaxed,
        );
    }

    pub fn locality(&self) -> Option<Locality> {
        self.locality.read().clone()
    }

    pub fn set_locality(&self, locality: Option<Locality>) {
        *self.locality.write() = locality;
    }

    pub fn metadata(&self) -> Arc<MetadataMap> {
        self.metadata.load_full()
    }

    pub fn set_metadata(&self, metadata: MetadataMap) {
        self.metadata.store(Arc::new(metadata));
    }

    pub fn health_flag_get(&self, flag: HealthFlag) -> bool {
        self.health_flags.load(Ordering::Relaxed) & flag as u32 != 0
    }

    pub fn health_flag_set(&self, flag: HealthFlag) {
        self.health_flags.fetch_or(flag as u32, Ordering::Relaxed);
    }

    pub fn health_flag_clear(&self, flag: HealthFlag) {
        self.health_flags.fetch_and(!(flag as u32), Ordering::Relaxed);
    }

    pub fn healthy(&self) -> bool {
        self.health_flags.load(Ordering::Relaxed) == 0
    }

    pub fn used(&self) -> bool {
        self.used.load(Ordering::Relaxed)
    }

    pub fn set_used(&self, used: bool) {
        self.used.store(used, Ordering::Relaxed);
    }

    pub fn stats(&self) -> &HostStats {
        &self.stats
    }

    /// Records the outcome of a connection attempt. A run of failed
    /// attempts ejects the host from the healthy subset; any success
    /// clears the run and the ejection.
    pub fn report_outlier(&self, result: OutlierResult) {
        match result {
            OutlierResult::Success => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                self.health_flag_clear(HealthFlag::FailedOutlierCheck);
            }
            OutlierResult::Timeout | OutlierResult::ConnectFailed => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= CONSECUTIVE_FAILURE_EJECTION {
                    self.health_flag_set(HealthFlag::FailedOutlierCheck);
                }
            }
        }
    }
}

impl PartialEq for Host {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Host {}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(addr: &str) -> Arc<Host> {
        Host::new(addr.parse().unwrap(), "", MetadataMap::new(), 1, None)
    }

    #[test]
    fn weight_is_clamped() {
        let host = host("127.0.0.1:80");
        host.set_weight(0);
        assert_eq!(host.weight(), 1);
        host.set_weight(128);
        assert_eq!(host.weight(), 128);
        host.set_weight(500);
        assert_eq!(host.weight(), 128);

        let clamped = Host::new(
            "127.0.0.1:81".parse().unwrap(),
            "",
            MetadataMap::new(),
            0,
            None,
        );
        assert_eq!(clamped.weight(), 1);
    }

    #[test]
    fn healthy_iff_no_flags() {
        let host = host("127.0.0.1:80");
        assert!(host.healthy());

        host.health_flag_set(HealthFlag::FailedEdsHealth);
        assert!(!host.healthy());
        assert!(host.health_flag_get(HealthFlag::FailedEdsHealth));
        assert!(!host.health_flag_get(HealthFlag::FailedActiveHc));

        host.health_flag_set(HealthFlag::FailedActiveHc);
        host.health_flag_clear(HealthFlag::FailedEdsHealth);
        assert!(!host.healthy());

        host.health_flag_clear(HealthFlag::FailedActiveHc);
        assert!(host.healthy());
    }

    #[test]
    fn equality_is_address_equality() {
        let a = host("10.0.0.1:80");
        let b = host("10.0.0.1:80");
        let c = host("10.0.0.2:80");
        a.set_weight(5);

        assert_eq!(*a, *b);
        assert_ne!(*a, *c);
    }

    #[test]
    fn metadata_snapshot_replacement() {
        let host = host("10.0.0.1:80");
        assert!(host.metadata().is_empty());

        let mut metadata = MetadataMap::new();
        metadata.insert("stage".into(), "canary".into());
        host.set_metadata(metadata);
        assert_eq!(
            host.metadata().get("stage"),
            Some(&serde_json::Value::from("canary"))
        );
    }

    #[test]
    fn consecutive_failures_eject_and_recover() {
        let host = host("10.0.0.1:80");
        for _ in 0..4 {
            host.report_outlier(OutlierResult::ConnectFailed);
            assert!(host.healthy());
        }
        host.report_outlier(OutlierResult::Timeout);
        assert!(host.health_flag_get(HealthFlag::FailedOutlierCheck));

        host.report_outlier(OutlierResult::Success);
        assert!(host.healthy());
    }
}
