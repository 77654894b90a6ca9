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

use prometheus::core::Collector;
pub use prometheus::Result;
use prometheus::{Opts, Registry};

/// The label used to partition cluster-scoped metrics.
pub const CLUSTER_LABEL: &str = "cluster";

/// The label used to partition proxy-filter metrics by stat prefix.
pub const STAT_PREFIX_LABEL: &str = "stat_prefix";

/// Returns the registry all tiller metrics register against.
pub fn registry() -> &'static Registry {
    prometheus::default_registry()
}

pub fn opts(name: &str, subsystem: &str, description: &str) -> Opts {
    Opts::new(name, description)
        .namespace("tiller")
        .subsystem(subsystem)
}

/// Metric names only admit a restricted alphabet; the one substitution the
/// data plane performs is `':'` to `'_'`, so that listener prefixes like
/// `ingress:8080` stay legible.
pub fn sanitize(name: &str) -> String {
    name.replace(':', "_")
}

/// An accumulator safe to bump from any worker, drained by a periodic
/// aggregator. `latch` atomically exchanges the pending total for zero so
/// increments racing the reset are carried into the next window instead of
/// lost.
#[derive(Debug, Default)]
pub struct LatchedCounter(std::sync::atomic::AtomicU64);

impl LatchedCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, delta: u64) {
        self.0.fetch_add(delta, std::sync::atomic::Ordering::Relaxed);
    }

    /// Takes the pending increments, resetting them to zero.
    pub fn latch(&self) -> u64 {
        self.0.swap(0, std::sync::atomic::Ordering::Relaxed)
    }
}

pub trait CollectorExt: Collector + Clone + Sized + 'static {
    fn register_if_not_exists(self, registry: &Registry) -> Result<Self> {
        match registry.register(Box::new(self.clone())) {
            Ok(_) | Err(prometheus::Error::AlreadyReg) => Ok(self),
            Err(err) => Err(err),
        }
    }
}

impl<C: Collector + Clone + 'static> CollectorExt for C {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_colons_only() {
        assert_eq!(sanitize("ingress:8080"), "ingress_8080");
        assert_eq!(sanitize("plain"), "plain");
        assert_eq!(sanitize("a.b-c"), "a.b-c");
    }

    #[test]
    fn latched_counter_exchanges_on_latch() {
        let counter = LatchedCounter::new();
        counter.add(3);
        counter.add(4);
        assert_eq!(counter.latch(), 7);
        assert_eq!(counter.latch(), 0);

        counter.add(1);
        assert_eq!(counter.latch(), 1);
    }
}
