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

use std::sync::Arc;

use rand::Rng;

use super::host::{Host, MetadataMap};
use super::PrioritySet;

/// Locality-aware host selection over a [`PrioritySet`].
///
/// Priorities are tried in order; within the first priority that has any
/// eligible host, the weighted locality scheduler narrows the choice to one
/// bucket and the host is picked uniformly from it. Without a scheduler
/// (no locality weights, or zero total effective weight) selection falls
/// back to the flat healthy list.
pub struct LoadBalancer {
    priority_set: Arc<PrioritySet>,
}

impl LoadBalancer {
    pub fn new(priority_set: Arc<PrioritySet>) -> Self {
        Self { priority_set }
    }

    pub fn pick_host(&self, metadata_match: Option<&MetadataMap>) -> Option<Arc<Host>> {
        for priority in 0..self.priority_set.len() as u32 {
            let locality = self.priority_set.choose_locality(priority);

            let mut candidates = self.priority_set.with_host_sets(|sets| {
                let set = &sets[priority as usize];
                locality
                    .and_then(|index| set.healthy_hosts_per_locality().get().get(index))
                    .cloned()
                    .unwrap_or_else(|| set.healthy_hosts().to_vec())
            });

            if let Some(criteria) = metadata_match {
                candidates.retain(|host| matches_metadata(host, criteria));
            }

            if !candidates.is_empty() {
                let index = rand::thread_rng().gen_range(0..candidates.len());
                let host = candidates.swap_remove(index);
                host.set_used(true);
                return Some(host);
            }
        }
        None
    }
}

fn matches_metadata(host: &Host, criteria: &MetadataMap) -> bool {
    let metadata = host.metadata();
    criteria
        .iter()
        .all(|(key, value)| metadata.get(key) == Some(value))
}
