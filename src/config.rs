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

//! Tiller configuration.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::cluster::{ClusterConfig, Locality};
use crate::proxy::ProxyConfig;
use crate::xds::ClusterLoadAssignment;

/// The proxy's YAML configuration file.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub version: Version,

    #[serde(default)]
    pub proxy: Proxy,

    /// The cluster this process itself belongs to, if any. The local
    /// cluster is restricted to priority zero.
    #[serde(default)]
    pub local_cluster: Option<String>,

    /// This process's own locality; its bucket sorts first in locality
    /// partitions.
    #[serde(default)]
    pub local_locality: Option<Locality>,

    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,

    pub tcp_proxy: ProxyConfig,

    /// Endpoint assignments applied at startup, before any discovery
    /// stream takes over. They flow through the same membership engine as
    /// streamed updates.
    #[serde(default)]
    pub static_assignments: Vec<ClusterLoadAssignment>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum Version {
    #[serde(rename = "v1alpha1")]
    V1Alpha1,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Proxy {
    #[serde(default = "default_listen_address")]
    pub address: SocketAddr,
}

fn default_listen_address() -> SocketAddr {
    "[::]:7000".parse().unwrap()
}

impl Default for Proxy {
    fn default() -> Self {
        Self {
            address: default_listen_address(),
        }
    }
}

impl Config {
    /// Attempts to deserialize `input` as a YAML object representing
    /// `Self`, then cross-checks references between sections.
    pub fn from_reader<R: std::io::Read>(input: R) -> crate::Result<Self> {
        let config: Self = serde_yaml::from_reader(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        self.tcp_proxy.validate()?;

        let known = |name: &str| self.clusters.iter().any(|c| c.name == name);
        for route in self.tcp_proxy.route_entries() {
            if !known(&route.cluster) {
                return Err(eyre::eyre!(
                    "tcp_proxy routes to unknown cluster '{}'",
                    route.cluster
                ));
            }
        }
        for assignment in &self.static_assignments {
            if !known(&assignment.cluster_name) {
                return Err(eyre::eyre!(
                    "static assignment for unknown cluster '{}'",
                    assignment.cluster_name
                ));
            }
        }
        Ok(())
    }
}
