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

use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntCounterVec, IntGauge, IntGaugeVec};

use crate::metrics::{opts, registry, sanitize, CollectorExt, CLUSTER_LABEL};

const SUBSYSTEM: &str = "cluster";

fn counter_vec(name: &str, description: &str) -> IntCounterVec {
    IntCounterVec::new(opts(name, SUBSYSTEM, description), &[CLUSTER_LABEL])
        .unwrap()
        .register_if_not_exists(registry())
        .unwrap()
}

fn gauge_vec(name: &str, description: &str) -> IntGaugeVec {
    IntGaugeVec::new(opts(name, SUBSYSTEM, description), &[CLUSTER_LABEL])
        .unwrap()
        .register_if_not_exists(registry())
        .unwrap()
}

static UPSTREAM_CX_TOTAL: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("upstream_cx_total", "Total upstream connections opened."));
static UPSTREAM_CX_CONNECT_FAIL: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "upstream_cx_connect_fail",
        "Upstream connection attempts that failed with a close.",
    )
});
static UPSTREAM_CX_CONNECT_TIMEOUT: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "upstream_cx_connect_timeout",
        "Upstream connection attempts that hit the connect timer.",
    )
});
static UPSTREAM_CX_CONNECT_ATTEMPTS_EXCEEDED: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "upstream_cx_connect_attempts_exceeded",
        "Sessions abandoned after exhausting the allowed connect attempts.",
    )
});
static UPSTREAM_CX_OVERFLOW: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "upstream_cx_overflow",
        "Upstream connections denied by the cluster resource manager.",
    )
});
static UPSTREAM_CX_NO_SUCCESSFUL_HOST: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "upstream_cx_no_successful_host",
        "Sessions for which no healthy host could be selected.",
    )
});
static MEMBERSHIP_CHANGE: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("membership_change", "Membership delta notifications."));
static MEMBERSHIP_TOTAL: Lazy<IntGaugeVec> =
    Lazy::new(|| gauge_vec("membership_total", "Hosts known across all priorities."));
static MEMBERSHIP_HEALTHY: Lazy<IntGaugeVec> = Lazy::new(|| {
    gauge_vec(
        "membership_healthy",
        "Hosts eligible for selection across all priorities.",
    )
});
static UPDATE_ATTEMPT: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("update_attempt", "Discovery updates received."));
static UPDATE_SUCCESS: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("update_success", "Discovery updates applied."));
static UPDATE_EMPTY: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "update_empty",
        "Discovery updates carrying no assignment for this cluster.",
    )
});
static UPDATE_NO_REBUILD: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "update_no_rebuild",
        "Discovery updates that changed nothing and skipped the rebuild.",
    )
});
static MAX_HOST_WEIGHT: Lazy<IntGaugeVec> = Lazy::new(|| {
    gauge_vec(
        "max_host_weight",
        "Largest host weight seen in the latest update.",
    )
});

/// Per-cluster stat handles, bound once to the cluster's label value.
#[derive(Clone)]
pub struct ClusterStats {
    pub upstream_cx_total: IntCounter,
    pub upstream_cx_connect_fail: IntCounter,
    pub upstream_cx_connect_timeout: IntCounter,
    pub upstream_cx_connect_attempts_exceeded: IntCounter,
    pub upstream_cx_overflow: IntCounter,
    pub upstream_cx_no_successful_host: IntCounter,
    pub membership_change: IntCounter,
    pub membership_total: IntGauge,
    pub membership_healthy: IntGauge,
    pub update_attempt: IntCounter,
    pub update_success: IntCounter,
    pub update_empty: IntCounter,
    pub update_no_rebuild: IntCounter,
    pub max_host_weight: IntGauge,
}

impl ClusterStats {
    pub fn new(cluster: &str) -> Self {
        let cluster = sanitize(cluster);
        let label = [cluster.as_str()];
        Self {
            upstream_cx_total: UPSTREAM_CX_TOTAL.with_label_values(&label),
            upstream_cx_connect_fail: UPSTREAM_CX_CONNECT_FAIL.with_label_values(&label),
            upstream_cx_connect_timeout: UPSTREAM_CX_CONNECT_TIMEOUT.with_label_values(&label),
            upstream_cx_connect_attempts_exceeded: UPSTREAM_CX_CONNECT_ATTEMPTS_EXCEEDED
                .with_label_values(&label),
            upstream_cx_overflow: UPSTREAM_CX_OVERFLOW.with_label_values(&label),
            upstream_cx_no_successful_host: UPSTREAM_CX_NO_SUCCESSFUL_HOST
                .with_label_values(&label),
            membership_change: MEMBERSHIP_CHANGE.with_label_values(&label),
            membership_total: MEMBERSHIP_TOTAL.with_label_values(&label),
            membership_healthy: MEMBERSHIP_HEALTHY.with_label_values(&label),
            update_attempt: UPDATE_ATTEMPT.with_label_values(&label),
            update_success: UPDATE_SUCCESS.with_label_values(&label),
            update_empty: UPDATE_EMPTY.with_label_values(&label),
            update_no_rebuild: UPDATE_NO_REBUILD.with_label_values(&label),
            max_host_weight: MAX_HOST_WEIGHT.with_label_values(&label),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_bind_per_cluster() {
        let a = ClusterStats::new("alpha");
        let b = ClusterStats::new("beta");

        let before = b.upstream_cx_total.get();
        a.upstream_cx_total.inc();
        assert_eq!(b.upstream_cx_total.get(), before);

        // Same cluster name binds the same underlying series.
        let a2 = ClusterStats::new("alpha");
        let count = a.upstream_cx_total.get();
        a2.upstream_cx_total.inc();
        assert_eq!(a.upstream_cx_total.get(), count + 1);
    }
}
