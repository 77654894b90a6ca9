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

//! Address and port matching primitives used by proxy routing.

use std::fmt;
use std::net::SocketAddr;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

/// An ordered list of CIDR ranges. An empty list matches nothing; route
/// criteria treat an absent list as "no constraint" instead.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(transparent)]
pub struct IpList(pub Vec<IpNetwork>);

impl IpList {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, address: SocketAddr) -> bool {
        self.0.iter().any(|network| network.contains(address.ip()))
    }
}

/// An inclusive port range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        port >= self.min && port <= self.max
    }
}

/// A list of inclusive port ranges parsed from the compact `"a-b,c-d,e"`
/// form. Declaration order is preserved.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PortRangeList(pub Vec<PortRange>);

impl PortRangeList {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, port: u16) -> bool {
        self.0.iter().any(|range| range.contains(port))
    }
}

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid port range list '{input}': {reason}")]
pub struct PortRangeError {
    input: String,
    reason: String,
}

impl std::str::FromStr for PortRangeList {
    type Err = PortRangeError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let error = |reason: String| PortRangeError {
            input: input.to_owned(),
            reason,
        };

        let mut ranges = Vec::new();
        for item in input.split(',') {
            let item = item.trim();
            if item.is_empty() {
                return Err(error("empty range entry".into()));
            }

            let range = match item.split_once('-') {
                None => {
                    let port = item
                        .parse::<u16>()
                        .map_err(|err| error(format!("'{item}': {err}")))?;
                    PortRange {
                        min: port,
                        max: port,
                    }
                }
                Some((min, max)) => {
                    let min = min
                        .trim()
                        .parse::<u16>()
                        .map_err(|err| error(format!("'{item}': {err}")))?;
                    let max = max
                        .trim()
                        .parse::<u16>()
                        .map_err(|err| error(format!("'{item}': {err}")))?;
                    if min > max {
                        return Err(error(format!("min {min} is greater than max {max}")));
                    }
                    PortRange { min, max }
                }
            };
            ranges.push(range);
        }

        Ok(Self(ranges))
    }
}

impl fmt::Display for PortRangeList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, range) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            if range.min == range.max {
                write!(f, "{}", range.min)?;
            } else {
                write!(f, "{}-{}", range.min, range.max)?;
            }
        }
        Ok(())
    }
}

impl Serialize for PortRangeList {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PortRangeList {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct PortRangeListVisitor;

        impl serde::de::Visitor<'_> for PortRangeListVisitor {
            type Value = PortRangeList;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a port range list such as '80' or '1000-2000,8080'")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_str(PortRangeListVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single_and_ranges() {
        let list: PortRangeList = "10,1000-2000,8080".parse().unwrap();
        assert_eq!(
            list.0,
            vec![
                PortRange { min: 10, max: 10 },
                PortRange {
                    min: 1000,
                    max: 2000
                },
                PortRange {
                    min: 8080,
                    max: 8080
                },
            ]
        );

        assert!(list.contains(10));
        assert!(list.contains(1500));
        assert!(list.contains(2000));
        assert!(!list.contains(11));
        assert!(!list.contains(2001));
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!("".parse::<PortRangeList>().is_err());
        assert!("10,".parse::<PortRangeList>().is_err());
        assert!("2000-1000".parse::<PortRangeList>().is_err());
        assert!("foo".parse::<PortRangeList>().is_err());
        assert!("70000".parse::<PortRangeList>().is_err());
    }

    #[test]
    fn display_round_trips() {
        let list: PortRangeList = "10,1000-2000".parse().unwrap();
        assert_eq!(list.to_string(), "10,1000-2000");
        assert_eq!(list.to_string().parse::<PortRangeList>().unwrap(), list);
    }

    #[test]
    fn ip_list_contains() {
        let list = IpList(vec![
            "192.168.75.0/24".parse().unwrap(),
            "2001:db8::/32".parse().unwrap(),
        ]);

        assert!(list.contains("192.168.75.10:50".parse().unwrap()));
        assert!(list.contains("[2001:db8::1]:50".parse().unwrap()));
        assert!(!list.contains("192.168.76.10:50".parse().unwrap()));
        assert!(!IpList::default().contains("192.168.75.10:50".parse().unwrap()));
    }
}
