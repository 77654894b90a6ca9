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

//! Structural endpoint-discovery messages.
//!
//! The discovery transport itself lives outside this crate; subscriptions
//! hand fully decoded [`ClusterLoadAssignment`] values to the membership
//! engine, so the types here are plain data with serde support for file and
//! test fixtures.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::cluster::{Locality, MetadataMap};

/// The set of endpoints for one cluster, grouped by locality and priority.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ClusterLoadAssignment {
    pub cluster_name: String,
    #[serde(default)]
    pub endpoints: Vec<LocalityLbEndpoints>,
}

/// One locality group within an assignment.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LocalityLbEndpoints {
    #[serde(default)]
    pub locality: Option<Locality>,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub load_balancing_weight: Option<u32>,
    #[serde(default)]
    pub lb_endpoints: Vec<LbEndpoint>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LbEndpoint {
    pub endpoint: Endpoint,
    #[serde(default)]
    pub metadata: Option<MetadataMap>,
    #[serde(default)]
    pub load_balancing_weight: Option<u32>,
    #[serde(default)]
    pub health_status: HealthStatus,
}

impl LbEndpoint {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            endpoint: Endpoint { address },
            metadata: None,
            load_balancing_weight: None,
            health_status: HealthStatus::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Endpoint {
    pub address: SocketAddr,
}

/// Discovery-reported health of an endpoint.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
    Draining,
    Timeout,
    Degraded,
}

impl HealthStatus {
    /// Whether discovery considers this endpoint unfit to receive traffic.
    pub fn failed(self) -> bool {
        matches!(self, Self::Unhealthy | Self::Draining | Self::Timeout)
    }
}

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unexpected endpoint discovery resource length: {0}")]
    ResourceCount(usize),
    #[error("unexpected endpoint assignment cluster (expecting {expected}): {got}")]
    ClusterName { expected: String, got: String },
    #[error("unexpected non-zero priority for local cluster '{0}'")]
    LocalClusterPriority(String),
    #[error("invalid endpoint priority {priority} for cluster '{cluster}'")]
    PriorityOutOfRange { cluster: String, priority: u32 },
}

/// The highest priority tier an assignment may carry.
pub const MAX_PRIORITY: u32 = 127;

/// Checks that a non-empty update is a single assignment addressed to the
/// subscribed cluster. Empty updates are legal and handled by the engine.
pub fn validate_update<'a>(
    resources: &'a [ClusterLoadAssignment],
    subscribed: &str,
) -> Result<Option<&'a ClusterLoadAssignment>, ValidationError> {
    match resources {
        [] => Ok(None),
        [assignment] => {
            if assignment.cluster_name != subscribed {
                return Err(ValidationError::ClusterName {
                    expected: subscribed.to_owned(),
                    got: assignment.cluster_name.clone(),
                });
            }
            Ok(Some(assignment))
        }
        _ => Err(ValidationError::ResourceCount(resources.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment(name: &str) -> ClusterLoadAssignment {
        ClusterLoadAssignment {
            cluster_name: name.into(),
            endpoints: vec![],
        }
    }

    #[test]
    fn validate_accepts_single_matching_resource() {
        let resources = [assignment("backend")];
        let found = validate_update(&resources, "backend").unwrap();
        assert_eq!(found, Some(&resources[0]));
    }

    #[test]
    fn validate_passes_through_empty() {
        assert_eq!(validate_update(&[], "backend").unwrap(), None);
    }

    #[test]
    fn validate_rejects_mismatched_cluster() {
        let resources = [assignment("other")];
        assert_eq!(
            validate_update(&resources, "backend").unwrap_err(),
            ValidationError::ClusterName {
                expected: "backend".into(),
                got: "other".into()
            }
        );
    }

    #[test]
    fn validate_rejects_multiple_resources() {
        let resources = [assignment("backend"), assignment("backend")];
        assert_eq!(
            validate_update(&resources, "backend").unwrap_err(),
            ValidationError::ResourceCount(2)
        );
    }

    #[test]
    fn yaml_assignment_fixture() {
        let yaml = "
cluster_name: backend
endpoints:
  - locality:
      region: us-central1
      zone: us-central1-a
    priority: 0
    load_balancing_weight: 2
    lb_endpoints:
      - endpoint:
          address: 10.0.0.1:80
      - endpoint:
          address: 10.0.0.2:80
        health_status: UNHEALTHY
";
        let assignment: ClusterLoadAssignment = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(assignment.cluster_name, "backend");
        assert_eq!(assignment.endpoints.len(), 1);

        let group = &assignment.endpoints[0];
        assert_eq!(group.priority, 0);
        assert_eq!(group.load_balancing_weight, Some(2));
        assert_eq!(group.lb_endpoints.len(), 2);
        assert!(!group.lb_endpoints[0].health_status.failed());
        assert!(group.lb_endpoints[1].health_status.failed());
    }
}
