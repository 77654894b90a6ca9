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

use crate::metrics::{opts, registry, sanitize, CollectorExt, STAT_PREFIX_LABEL};

const SUBSYSTEM: &str = "tcp";

fn counter_vec(name: &str, description: &str) -> IntCounterVec {
    IntCounterVec::new(opts(name, SUBSYSTEM, description), &[STAT_PREFIX_LABEL])
        .unwrap()
        .register_if_not_exists(registry())
        .unwrap()
}

fn gauge_vec(name: &str, description: &str) -> IntGaugeVec {
    IntGaugeVec::new(opts(name, SUBSYSTEM, description), &[STAT_PREFIX_LABEL])
        .unwrap()
        .register_if_not_exists(registry())
        .unwrap()
}

static DOWNSTREAM_CX_TOTAL: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("downstream_cx_total", "Downstream connections accepted."));
static DOWNSTREAM_CX_NO_ROUTE: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "downstream_cx_no_route",
        "Downstream connections that matched no route.",
    )
});
static IDLE_TIMEOUT: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("idle_timeout", "Sessions closed by the idle timer."));
static UPSTREAM_FLUSH_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "upstream_flush_total",
        "Upstream connections held open past downstream close to drain writes.",
    )
});
static UPSTREAM_FLUSH_ACTIVE: Lazy<IntGaugeVec> = Lazy::new(|| {
    gauge_vec(
        "upstream_flush_active",
        "Upstream connections currently draining after downstream close.",
    )
});
static DOWNSTREAM_PAUSED_READING_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "downstream_flow_control_paused_reading_total",
        "Times downstream reads were paused by upstream backpressure.",
    )
});
static DOWNSTREAM_RESUMED_READING_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "downstream_flow_control_resumed_reading_total",
        "Times downstream reads were resumed after upstream drained.",
    )
});

/// Per-filter stat handles, bound to the configured stat prefix.
#[derive(Clone)]
pub struct ProxyStats {
    pub downstream_cx_total: IntCounter,
    pub downstream_cx_no_route: IntCounter,
    pub idle_timeout: IntCounter,
    pub upstream_flush_total: IntCounter,
    pub upstream_flush_active: IntGauge,
    pub downstream_paused_reading_total: IntCounter,
    pub downstream_resumed_reading_total: IntCounter,
}

impl ProxyStats {
    pub fn new(stat_prefix: &str) -> Self {
        let prefix = sanitize(stat_prefix);
        let label = [prefix.as_str()];
        Self {
            downstream_cx_total: DOWNSTREAM_CX_TOTAL.with_label_values(&label),
            downstream_cx_no_route: DOWNSTREAM_CX_NO_ROUTE.with_label_values(&label),
            idle_timeout: IDLE_TIMEOUT.with_label_values(&label),
            upstream_flush_total: UPSTREAM_FLUSH_TOTAL.with_label_values(&label),
            upstream_flush_active: UPSTREAM_FLUSH_ACTIVE.with_label_values(&label),
            downstream_paused_reading_total: DOWNSTREAM_PAUSED_READING_TOTAL
                .with_label_values(&label),
            downstream_resumed_reading_total: DOWNSTREAM_RESUMED_READING_TOTAL
                .with_label_values(&label),
        }
    }
}
