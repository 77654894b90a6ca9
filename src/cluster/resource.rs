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

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Circuit-breaker style ceilings for one cluster priority tier.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ResourceLimits {
    pub max_connections: u64,
    pub max_pending_requests: u64,
    pub max_requests: u64,
    pub max_retries: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_connections: 1024,
            max_pending_requests: 1024,
            max_requests: 1024,
            max_retries: 3,
        }
    }
}

/// One bounded resource: a live count against a ceiling.
#[derive(Debug)]
pub struct Resource {
    current: AtomicU64,
    max: u64,
}

impl Resource {
    fn new(max: u64) -> Self {
        Self {
            current: AtomicU64::new(0),
            max,
        }
    }

    pub fn can_create(&self) -> bool {
        self.current.load(Ordering::Relaxed) < self.max
    }

    pub fn count(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    fn inc(&self) {
        self.current.fetch_add(1, Ordering::Relaxed);
    }

    fn dec(&self) {
        let previous = self.current.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(previous > 0, "resource count underflow");
    }
}

/// Tracks upstream capacity for one (cluster, priority) pair.
#[derive(Debug)]
pub struct ResourceManager {
    connections: Resource,
    pending_requests: Resource,
    requests: Resource,
    retries: Resource,
}

impl ResourceManager {
    pub fn new(limits: ResourceLimits) -> Arc<Self> {
        Arc::new(Self {
            connections: Resource::new(limits.max_connections),
            pending_requests: Resource::new(limits.max_pending_requests),
            requests: Resource::new(limits.max_requests),
            retries: Resource::new(limits.max_retries),
        })
    }

    pub fn connections(&self) -> &Resource {
        &self.connections
    }

    pub fn pending_requests(&self) -> &Resource {
        &self.pending_requests
    }

    pub fn requests(&self) -> &Resource {
        &self.requests
    }

    pub fn retries(&self) -> &Resource {
        &self.retries
    }

    /// Claims a connection slot, or reports overflow.
    pub fn try_acquire_connection(self: &Arc<Self>) -> Option<ConnectionPermit> {
        if !self.connections.can_create() {
            return None;
        }
        self.connections.inc();
        Some(ConnectionPermit {
            manager: self.clone(),
        })
    }
}

/// A live upstream connection slot; releases on drop.
#[derive(Debug)]
pub struct ConnectionPermit {
    manager: Arc<ResourceManager>,
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        self.manager.connections.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_permits_enforce_ceiling() {
        let manager = ResourceManager::new(ResourceLimits {
            max_connections: 2,
            ..Default::default()
        });

        let first = manager.try_acquire_connection().unwrap();
        let _second = manager.try_acquire_connection().unwrap();
        assert!(manager.try_acquire_connection().is_none());
        assert_eq!(manager.connections().count(), 2);

        drop(first);
        assert_eq!(manager.connections().count(), 1);
        assert!(manager.try_acquire_connection().is_some());
    }

    #[test]
    fn default_limits_match_policy() {
        let limits = ResourceLimits::default();
        assert_eq!(limits.max_connections, 1024);
        assert_eq!(limits.max_pending_requests, 1024);
        assert_eq!(limits.max_requests, 1024);
        assert_eq!(limits.max_retries, 3);
    }
}
