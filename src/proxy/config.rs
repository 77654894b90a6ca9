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
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cluster::MetadataMap;
use crate::net::{IpList, PortRangeList};

/// Configuration for one TCP proxy filter instance.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    pub stat_prefix: String,
    /// Shorthand for a single catch-all route.
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub routes: Vec<Route>,
    /// Total connect attempts per session, the first included.
    #[serde(default = "default_max_connect_attempts")]
    pub max_connect_attempts: u32,
    /// Session idle timeout in milliseconds; zero disables the timer.
    #[serde(default)]
    pub idle_timeout_ms: u64,
    /// Metadata criteria an upstream host must carry to be eligible.
    #[serde(default)]
    pub metadata_match: Option<MetadataMap>,
    /// Decode the downstream byte stream as Thrift with the given protocol
    /// variant; a protocol violation tears the session down.
    #[serde(default)]
    pub inspect_protocol: Option<crate::codec::thrift::ProtocolKind>,
    #[serde(default)]
    pub access_log: Option<AccessLogConfig>,
}

fn default_max_connect_attempts() -> u32 {
    1
}

/// One route entry. All present criteria must match; absent criteria do
/// not constrain. Entries are evaluated in declaration order and the first
/// match wins.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Route {
    pub cluster: String,
    #[serde(default)]
    pub destination_ip_list: IpList,
    #[serde(default)]
    pub destination_ports: Option<PortRangeList>,
    #[serde(default)]
    pub source_ip_list: IpList,
    #[serde(default)]
    pub source_ports: Option<PortRangeList>,
}

impl Route {
    fn matches(&self, source: SocketAddr, destination: SocketAddr) -> bool {
        if let Some(ports) = &self.source_ports {
            if !ports.contains(source.port()) {
                return false;
            }
        }
        if !self.source_ip_list.is_empty() && !self.source_ip_list.contains(source) {
            return false;
        }
        if let Some(ports) = &self.destination_ports {
            if !ports.contains(destination.port()) {
                return false;
            }
        }
        if !self.destination_ip_list.is_empty() && !self.destination_ip_list.contains(destination) {
            return false;
        }
        true
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AccessLogConfig {
    pub path: PathBuf,
    /// Custom format line; the default covers the standard specifiers.
    #[serde(default)]
    pub format: Option<String>,
}

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("stat_prefix must not be empty")]
    EmptyStatPrefix,
    #[error("max_connect_attempts must be at least 1")]
    ZeroConnectAttempts,
    #[error("either cluster or routes must be set")]
    NoRoutes,
}

impl ProxyConfig {
    pub fn new(stat_prefix: impl Into<String>, cluster: impl Into<String>) -> Self {
        Self {
            stat_prefix: stat_prefix.into(),
            cluster: Some(cluster.into()),
            routes: Vec::new(),
            max_connect_attempts: default_max_connect_attempts(),
            idle_timeout_ms: 0,
            metadata_match: None,
            inspect_protocol: None,
            access_log: None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stat_prefix.is_empty() {
            return Err(ConfigError::EmptyStatPrefix);
        }
        if self.max_connect_attempts == 0 {
            return Err(ConfigError::ZeroConnectAttempts);
        }
        if self.cluster.is_none() && self.routes.is_empty() {
            return Err(ConfigError::NoRoutes);
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }

    /// The full route table: declared routes first, then the bare
    /// `cluster` shorthand as a catch-all.
    pub fn route_entries(&self) -> Vec<Route> {
        let mut routes = self.routes.clone();
        if let Some(cluster) = &self.cluster {
            routes.push(Route {
                cluster: cluster.clone(),
                ..Route::default()
            });
        }
        routes
    }

    /// Resolves the cluster for a downstream connection, first match wins.
    pub fn route(&self, source: SocketAddr, destination: SocketAddr) -> Option<String> {
        if let Some(route) = self
            .routes
            .iter()
            .find(|route| route.matches(source, destination))
        {
            return Some(route.cluster.clone());
        }
        self.cluster.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn validation() {
        assert!(ProxyConfig::new("ingress", "backend").validate().is_ok());

        let mut config = ProxyConfig::new("", "backend");
        assert_eq!(config.validate(), Err(ConfigError::EmptyStatPrefix));

        config = ProxyConfig::new("ingress", "backend");
        config.max_connect_attempts = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroConnectAttempts));

        config = ProxyConfig::new("ingress", "backend");
        config.cluster = None;
        assert_eq!(config.validate(), Err(ConfigError::NoRoutes));
    }

    #[test]
    fn bare_cluster_is_catch_all() {
        let config = ProxyConfig::new("ingress", "backend");
        assert_eq!(
            config.route(addr("1.2.3.4:5000"), addr("10.0.0.1:80")),
            Some("backend".into())
        );
    }

    #[test]
    fn first_matching_route_wins() {
        let yaml = "
stat_prefix: ingress
routes:
  - cluster: by_destination
    destination_ip_list:
      - 10.0.0.0/24
  - cluster: by_port
    destination_ports: 80,8000-8080
  - cluster: fallback
";
        let config: ProxyConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();

        // Both the CIDR route and the port route would match; declaration
        // order breaks the tie.
        assert_eq!(
            config.route(addr("1.1.1.1:9999"), addr("10.0.0.7:80")),
            Some("by_destination".into())
        );
        assert_eq!(
            config.route(addr("1.1.1.1:9999"), addr("192.168.0.1:8080")),
            Some("by_port".into())
        );
        assert_eq!(
            config.route(addr("1.1.1.1:9999"), addr("192.168.0.1:9")),
            Some("fallback".into())
        );
    }

    #[test]
    fn source_criteria() {
        let yaml = "
stat_prefix: ingress
routes:
  - cluster: trusted
    source_ip_list:
      - 192.168.1.0/24
    source_ports: 1000-2000
";
        let config: ProxyConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(
            config.route(addr("192.168.1.50:1500"), addr("10.0.0.1:80")),
            Some("trusted".into())
        );
        // Wrong source port.
        assert_eq!(config.route(addr("192.168.1.50:99"), addr("10.0.0.1:80")), None);
        // Wrong source network.
        assert_eq!(
            config.route(addr("192.168.2.50:1500"), addr("10.0.0.1:80")),
            None
        );
    }

    #[test]
    fn idle_timeout_zero_disables() {
        let mut config = ProxyConfig::new("ingress", "backend");
        assert_eq!(config.idle_timeout(), None);
        config.idle_timeout_ms = 250;
        assert_eq!(config.idle_timeout(), Some(Duration::from_millis(250)));
    }
}
