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

use std::io::Write;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::config::AccessLogConfig;

/// Why a session ended abnormally, as reported in `%RESPONSE_FLAGS%`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseFlag {
    /// UF: the upstream connection could not be established.
    UpstreamConnectionFailure = 0x1,
    /// UH: no healthy upstream host was available.
    NoHealthyUpstream = 0x2,
    /// UO: the cluster's connection circuit breaker tripped.
    UpstreamOverflow = 0x4,
    /// UT: the session idle timer fired.
    IdleTimeout = 0x8,
}

impl ResponseFlag {
    fn short(self) -> &'static str {
        match self {
            Self::UpstreamConnectionFailure => "UF",
            Self::NoHealthyUpstream => "UH",
            Self::UpstreamOverflow => "UO",
            Self::IdleTimeout => "UT",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResponseFlags(u8);

impl ResponseFlags {
    pub fn set(&mut self, flag: ResponseFlag) {
        self.0 |= flag as u8;
    }

    pub fn contains(&self, flag: ResponseFlag) -> bool {
        self.0 & flag as u8 != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for ResponseFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return f.write_str("-");
        }
        let mut first = true;
        for flag in [
            ResponseFlag::UpstreamConnectionFailure,
            ResponseFlag::NoHealthyUpstream,
            ResponseFlag::UpstreamOverflow,
            ResponseFlag::IdleTimeout,
        ] {
            if self.contains(flag) {
                if !first {
                    f.write_str(",")?;
                }
                f.write_str(flag.short())?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Everything a completed session reports to the access log.
#[derive(Clone, Debug)]
pub struct SessionInfo {
    pub start_time: chrono::DateTime<chrono::Utc>,
    pub(crate) started: Instant,
    pub duration: Option<Duration>,
    /// Bytes received from the downstream peer (sent upstream).
    pub bytes_received: u64,
    /// Bytes sent to the downstream peer (received from upstream).
    pub bytes_sent: u64,
    pub response_flags: ResponseFlags,
    pub upstream_host: Option<SocketAddr>,
    pub upstream_cluster: Option<String>,
    pub upstream_local_address: Option<SocketAddr>,
    pub downstream_remote_address: Option<SocketAddr>,
    pub downstream_local_address: Option<SocketAddr>,
}

impl Default for SessionInfo {
    fn default() -> Self {
        Self {
            start_time: chrono::Utc::now(),
            started: Instant::now(),
            duration: None,
            bytes_received: 0,
            bytes_sent: 0,
            response_flags: ResponseFlags::default(),
            upstream_host: None,
            upstream_cluster: None,
            upstream_local_address: None,
            downstream_remote_address: None,
            downstream_local_address: None,
        }
    }
}

impl SessionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Freezes the session duration; further calls keep the first value.
    pub fn complete(&mut self) {
        if self.duration.is_none() {
            self.duration = Some(self.started.elapsed());
        }
    }
}

/// The command operators an access-log format line may reference.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Literal(String),
    StartTime,
    ResponseFlags,
    BytesReceived,
    BytesSent,
    Duration,
    UpstreamHost,
    UpstreamCluster,
    UpstreamLocalAddress,
    DownstreamRemoteAddressWithoutPort,
    DownstreamLocalAddress,
}

pub const DEFAULT_FORMAT: &str = "[%START_TIME%] %RESPONSE_FLAGS% %BYTES_RECEIVED% \
     %BYTES_SENT% %DURATION% %UPSTREAM_HOST% %UPSTREAM_CLUSTER% \
     %UPSTREAM_LOCAL_ADDRESS% %DOWNSTREAM_REMOTE_ADDRESS_WITHOUT_PORT% \
     %DOWNSTREAM_LOCAL_ADDRESS%";

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("unknown access log command operator %{0}%")]
    UnknownOperator(String),
    #[error("unterminated command operator in access log format")]
    Unterminated,
}

#[derive(Clone, Debug)]
pub struct Formatter {
    segments: Vec<Segment>,
}

impl Formatter {
    pub fn parse(format: &str) -> Result<Self, FormatError> {
        let mut segments = Vec::new();
        let mut rest = format;
        while let Some(start) = rest.find('%') {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_owned()));
            }
            let after = &rest[start + 1..];
            let end = after.find('%').ok_or(FormatError::Unterminated)?;
            let operator = &after[..end];
            segments.push(match operator {
                "START_TIME" => Segment::StartTime,
                "RESPONSE_FLAGS" => Segment::ResponseFlags,
                "BYTES_RECEIVED" => Segment::BytesReceived,
                "BYTES_SENT" => Segment::BytesSent,
                "DURATION" => Segment::Duration,
                "UPSTREAM_HOST" => Segment::UpstreamHost,
                "UPSTREAM_CLUSTER" => Segment::UpstreamCluster,
                "UPSTREAM_LOCAL_ADDRESS" => Segment::UpstreamLocalAddress,
                "DOWNSTREAM_REMOTE_ADDRESS_WITHOUT_PORT" => {
                    Segment::DownstreamRemoteAddressWithoutPort
                }
                "DOWNSTREAM_LOCAL_ADDRESS" => Segment::DownstreamLocalAddress,
                unknown => return Err(FormatError::UnknownOperator(unknown.to_owned())),
            });
            rest = &after[end + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_owned()));
        }
        Ok(Self { segments })
    }

    pub fn format(&self, info: &SessionInfo) -> String {
        fn opt<T: std::fmt::Display>(value: &Option<T>) -> String {
            value
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "-".into())
        }

        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::StartTime => {
                    out.push_str(&info.start_time.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string());
                }
                Segment::ResponseFlags => out.push_str(&info.response_flags.to_string()),
                Segment::BytesReceived => out.push_str(&info.bytes_received.to_string()),
                Segment::BytesSent => out.push_str(&info.bytes_sent.to_string()),
                Segment::Duration => match info.duration {
                    Some(duration) => out.push_str(&duration.as_millis().to_string()),
                    None => out.push('-'),
                },
                Segment::UpstreamHost => out.push_str(&opt(&info.upstream_host)),
                Segment::UpstreamCluster => out.push_str(&opt(&info.upstream_cluster)),
                Segment::UpstreamLocalAddress => out.push_str(&opt(&info.upstream_local_address)),
                Segment::DownstreamRemoteAddressWithoutPort => out.push_str(
                    &info
                        .downstream_remote_address
                        .map(|addr| addr.ip().to_string())
                        .unwrap_or_else(|| "-".into()),
                ),
                Segment::DownstreamLocalAddress => {
                    out.push_str(&opt(&info.downstream_local_address))
                }
            }
        }
        out
    }
}

/// A line-oriented access log with a pluggable sink.
pub struct AccessLog {
    formatter: Formatter,
    sink: Mutex<Box<dyn Write + Send>>,
}

impl AccessLog {
    pub fn from_config(config: &AccessLogConfig) -> crate::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.path)?;
        Self::to_writer(config.format.as_deref().unwrap_or(DEFAULT_FORMAT), Box::new(file))
    }

    pub fn to_writer(format: &str, sink: Box<dyn Write + Send>) -> crate::Result<Self> {
        Ok(Self {
            formatter: Formatter::parse(format)?,
            sink: Mutex::new(sink),
        })
    }

    pub fn log(&self, info: &SessionInfo) {
        let line = self.formatter.format(info);
        let mut sink = self.sink.lock();
        if let Err(error) = writeln!(sink, "{line}") {
            tracing::warn!(%error, "failed to write access log entry");
        }
    }
}
