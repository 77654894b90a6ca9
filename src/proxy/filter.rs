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

//! The per-connection proxy state machine.
//!
//! The filter is a synchronous core: connection events go in, a list of
//! [`Action`]s comes out, and the driver (or a test) interprets them
//! against real sockets and timers. Every transition completes within the
//! call; anything that would re-enter the machine is surfaced as an action
//! and fed back as a follow-up event.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use super::access_log::{ResponseFlag, SessionInfo};
use super::config::ProxyConfig;
use super::metrics::ProxyStats;
use crate::buffer::ByteQueue;
use crate::cluster::{
    Cluster, ConnectionPermit, Host, LoadBalancer, OutlierResult, ResourcePriority,
};
use crate::codec::thrift;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    NotStarted,
    Connecting,
    Connected,
    HalfClosed,
    Closing,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    RemoteClose,
    LocalClose,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseType {
    /// Discard anything still buffered.
    NoFlush,
    /// Write out buffered data before closing.
    FlushWrite,
}

/// Effects for the connection driver to carry out, in order.
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    /// Dial the host; report `Connected` or a close event back, and feed
    /// `on_connect_timeout` if the timeout fires first.
    OpenUpstream {
        host: Arc<Host>,
        connect_timeout: Duration,
    },
    WriteUpstream {
        data: Bytes,
        end_stream: bool,
    },
    WriteDownstream {
        data: Bytes,
        end_stream: bool,
    },
    /// Close the upstream. With `FlushWrite` and writes still buffered the
    /// driver detaches the connection into the drain manager instead of
    /// closing inline.
    CloseUpstream(CloseType),
    CloseDownstream(CloseType),
    ReadDisableDownstream(bool),
    ReadDisableUpstream(bool),
    ArmIdleTimer(Duration),
    DisarmIdleTimer,
}

/// Tees the downstream byte stream through a streaming Thrift decoder to
/// reject connections that violate the configured protocol.
struct ProtocolInspector {
    decoder: thrift::Decoder,
    pending: ByteQueue,
}

impl ProtocolInspector {
    fn new(kind: thrift::ProtocolKind) -> Self {
        Self {
            decoder: thrift::Decoder::new(kind.new_protocol()),
            pending: ByteQueue::new(),
        }
    }

    fn observe(&mut self, data: &Bytes) -> thrift::Result<()> {
        self.pending.push(data.clone());
        loop {
            let mut sink = StructureSink;
            match self.decoder.decode(&mut self.pending, &mut sink)? {
                thrift::DecodeStatus::Complete => self.decoder.reset(),
                thrift::DecodeStatus::NeedMoreData => return Ok(()),
            }
        }
    }
}

/// Inspection only cares that the structure parses; events are dropped.
struct StructureSink;

impl thrift::DecoderCallbacks for StructureSink {
    fn message_start(&mut self, _header: &thrift::MessageHeader) {}
    fn struct_begin(&mut self, _name: &str) {}
    fn struct_field(&mut self, _name: &str, _field_type: thrift::FieldType, _field_id: i16) {}
    fn struct_end(&mut self) {}
    fn message_complete(&mut self) {}
}

pub struct Filter {
    config: Arc<ProxyConfig>,
    stats: ProxyStats,
    cluster: Arc<Cluster>,
    balancer: LoadBalancer,
    state: State,
    connect_attempts: u32,
    permit: Option<ConnectionPermit>,
    upstream_host: Option<Arc<Host>>,
    downstream_open: bool,
    inspector: Option<ProtocolInspector>,
    session: SessionInfo,
}

impl Filter {
    pub fn new(
        config: Arc<ProxyConfig>,
        stats: ProxyStats,
        cluster: Arc<Cluster>,
        downstream_remote: SocketAddr,
        downstream_local: SocketAddr,
    ) -> Self {
        let session = SessionInfo {
            upstream_cluster: Some(cluster.name().to_owned()),
            downstream_remote_address: Some(downstream_remote),
            downstream_local_address: Some(downstream_local),
            ..SessionInfo::new()
        };
        let balancer = LoadBalancer::new(cluster.priority_set().clone());
        let inspector = config.inspect_protocol.map(ProtocolInspector::new);
        Self {
            config,
            stats,
            cluster,
            balancer,
            state: State::NotStarted,
            connect_attempts: 0,
            permit: None,
            upstream_host: None,
            downstream_open: true,
            inspector,
            session,
        }
    }

    #[inline]
    pub fn state(&self) -> State {
        self.state
    }

    #[inline]
    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts
    }

    #[inline]
    pub fn session(&self) -> &SessionInfo {
        &self.session
    }

    pub fn upstream_host(&self) -> Option<&Arc<Host>> {
        self.upstream_host.as_ref()
    }

    /// Completes the session record for access logging.
    pub fn take_session(&mut self) -> SessionInfo {
        self.session.complete();
        self.session.clone()
    }

    /// Starts the session: downstream reads stay off until an upstream
    /// connection exists to write into.
    pub fn on_new_connection(&mut self) -> Vec<Action> {
        debug_assert_eq!(self.state, State::NotStarted);
        tracing::debug!(
            cluster = self.cluster.name(),
            downstream = ?self.session.downstream_remote_address,
            "new tcp proxy session"
        );

        let mut actions = vec![Action::ReadDisableDownstream(true)];
        self.establish_upstream(&mut actions);
        actions
    }

    pub fn on_downstream_data(&mut self, data: Bytes, end_stream: bool) -> Vec<Action> {
        if matches!(self.state, State::Closed | State::Closing) {
            return Vec::new();
        }
        tracing::trace!(bytes = data.len(), end_stream, "downstream data");

        if let Some(inspector) = &mut self.inspector {
            if let Err(error) = inspector.observe(&data) {
                tracing::warn!(%error, "protocol violation from downstream, closing");
                let mut actions = vec![
                    Action::CloseDownstream(CloseType::NoFlush),
                    Action::CloseUpstream(CloseType::NoFlush),
                ];
                self.downstream_open = false;
                self.finish(&mut actions, false);
                return actions;
            }
        }

        self.session.bytes_received += data.len() as u64;
        let mut actions = vec![Action::WriteUpstream { data, end_stream }];
        if end_stream && self.state == State::Connected {
            self.state = State::HalfClosed;
        }
        self.arm_idle_timer(&mut actions);
        actions
    }

    pub fn on_upstream_data(&mut self, data: Bytes, end_stream: bool) -> Vec<Action> {
        if matches!(self.state, State::Closed | State::Closing) {
            return Vec::new();
        }
        tracing::trace!(bytes = data.len(), end_stream, "upstream data");

        self.session.bytes_sent += data.len() as u64;
        let mut actions = vec![Action::WriteDownstream { data, end_stream }];
        self.arm_idle_timer(&mut actions);
        actions
    }

    pub fn on_downstream_event(&mut self, event: ConnectionEvent) -> Vec<Action> {
        if self.state == State::Closed || event == ConnectionEvent::Connected {
            return Vec::new();
        }
        self.downstream_open = false;

        let mut actions = Vec::new();
        match (self.state, event) {
            (State::Connecting, _) => {
                // Nothing to drain yet; abandon the dial.
                actions.push(Action::CloseUpstream(CloseType::NoFlush));
                self.finish(&mut actions, false);
            }
            (State::Connected | State::HalfClosed, ConnectionEvent::RemoteClose) => {
                // The driver moves the connection to the drain manager when
                // writes are still buffered; either way the session stays
                // in Closing until the handoff settles.
                actions.push(Action::CloseUpstream(CloseType::FlushWrite));
                self.finish(&mut actions, true);
            }
            (State::Closing, ConnectionEvent::RemoteClose) => {
                // Already tearing down; the peer vanishing just means the
                // remaining flush cannot be delivered.
                self.state = State::Closed;
            }
            (_, ConnectionEvent::LocalClose) => {
                if self.upstream_host.is_some() {
                    actions.push(Action::CloseUpstream(CloseType::NoFlush));
                }
                self.finish(&mut actions, false);
            }
            _ => self.finish(&mut actions, false),
        }
        actions
    }

    pub fn on_upstream_event(&mut self, event: ConnectionEvent) -> Vec<Action> {
        // In Closing the upstream has already been released (or handed to
        // the drain manager), so its events no longer concern the session.
        if matches!(self.state, State::Closed | State::Closing) {
            return Vec::new();
        }

        let mut actions = Vec::new();
        match event {
            ConnectionEvent::Connected => {
                debug_assert_eq!(self.state, State::Connecting);
                self.state = State::Connected;
                if let Some(host) = &self.upstream_host {
                    host.report_outlier(OutlierResult::Success);
                }
                actions.push(Action::ReadDisableDownstream(false));
                self.arm_idle_timer(&mut actions);
            }
            ConnectionEvent::RemoteClose | ConnectionEvent::LocalClose => {
                let was_connecting = self.state == State::Connecting;
                if let Some(host) = self.upstream_host.take() {
                    host.stats()
                        .cx_active
                        .fetch_sub(1, std::sync::atomic::Ordering::Relaxed);

                    if was_connecting && event == ConnectionEvent::RemoteClose {
                        self.session
                            .response_flags
                            .set(ResponseFlag::UpstreamConnectionFailure);
                        host.report_outlier(OutlierResult::ConnectFailed);
                        self.cluster.stats().upstream_cx_connect_fail.inc();
                        host.stats()
                            .cx_connect_fail
                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    }
                }
                self.permit = None;

                if was_connecting {
                    self.establish_upstream(&mut actions);
                } else {
                    let flushing = self.downstream_open;
                    if flushing {
                        actions.push(Action::CloseDownstream(CloseType::FlushWrite));
                    }
                    self.finish(&mut actions, flushing);
                }
            }
        }
        actions
    }

    /// The per-attempt connect timer fired. Closing the dial surfaces a
    /// `LocalClose` upstream event, which drives the retry.
    pub fn on_connect_timeout(&mut self) -> Vec<Action> {
        if self.state != State::Connecting {
            return Vec::new();
        }
        tracing::debug!(cluster = self.cluster.name(), "upstream connect timeout");

        self.cluster.stats().upstream_cx_connect_timeout.inc();
        self.cluster.stats().upstream_cx_connect_fail.inc();
        self.session
            .response_flags
            .set(ResponseFlag::UpstreamConnectionFailure);
        if let Some(host) = &self.upstream_host {
            host.report_outlier(OutlierResult::Timeout);
            host.stats()
                .cx_connect_fail
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }

        vec![Action::CloseUpstream(CloseType::NoFlush)]
    }

    pub fn on_idle_timeout(&mut self) -> Vec<Action> {
        if matches!(self.state, State::Closed | State::Closing) {
            return Vec::new();
        }
        tracing::debug!(cluster = self.cluster.name(), "session idle timeout");

        self.stats.idle_timeout.inc();
        self.session.response_flags.set(ResponseFlag::IdleTimeout);

        let mut actions = vec![
            Action::CloseDownstream(CloseType::NoFlush),
            Action::CloseUpstream(CloseType::NoFlush),
        ];
        self.downstream_open = false;
        self.finish(&mut actions, false);
        actions
    }

    /// Bytes drained to either peer also count as session activity.
    pub fn on_bytes_sent(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        self.arm_idle_timer(&mut actions);
        actions
    }

    /// The driver delivered (or handed off) everything a flushing close
    /// left behind; teardown is now complete.
    pub fn on_flush_complete(&mut self) {
        if self.state == State::Closing {
            self.state = State::Closed;
        }
    }

    /// Too much buffered toward downstream: stop reading from upstream.
    pub fn on_downstream_high_watermark(&mut self) -> Vec<Action> {
        vec![Action::ReadDisableUpstream(true)]
    }

    pub fn on_downstream_low_watermark(&mut self) -> Vec<Action> {
        vec![Action::ReadDisableUpstream(false)]
    }

    /// Too much buffered toward upstream: stop reading from downstream.
    pub fn on_upstream_high_watermark(&mut self) -> Vec<Action> {
        self.stats.downstream_paused_reading_total.inc();
        vec![Action::ReadDisableDownstream(true)]
    }

    pub fn on_upstream_low_watermark(&mut self) -> Vec<Action> {
        self.stats.downstream_resumed_reading_total.inc();
        vec![Action::ReadDisableDownstream(false)]
    }

    /// Opens (or re-opens) the upstream connection, enforcing the resource
    /// ceiling and the connect attempt limit.
    fn establish_upstream(&mut self, actions: &mut Vec<Action>) {
        let cluster_stats = self.cluster.stats().clone();

        let Some(permit) = self
            .cluster
            .resource_manager(ResourcePriority::Default)
            .try_acquire_connection()
        else {
            cluster_stats.upstream_cx_overflow.inc();
            self.session
                .response_flags
                .set(ResponseFlag::UpstreamOverflow);
            self.abort_session(actions);
            return;
        };

        if self.connect_attempts >= self.config.max_connect_attempts {
            cluster_stats.upstream_cx_connect_attempts_exceeded.inc();
            self.session
                .response_flags
                .set(ResponseFlag::UpstreamConnectionFailure);
            self.abort_session(actions);
            return;
        }

        let Some(host) = self.balancer.pick_host(self.config.metadata_match.as_ref()) else {
            cluster_stats.upstream_cx_no_successful_host.inc();
            self.session
                .response_flags
                .set(ResponseFlag::NoHealthyUpstream);
            self.abort_session(actions);
            return;
        };

        tracing::debug!(
            cluster = self.cluster.name(),
            host = %host.address(),
            attempt = self.connect_attempts + 1,
            "connecting upstream"
        );

        self.connect_attempts += 1;
        cluster_stats.upstream_cx_total.inc();
        host.stats()
            .cx_total
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        host.stats()
            .cx_active
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        self.session.upstream_host = Some(host.address());
        self.permit = Some(permit);
        let connect_timeout = self.cluster.config().connect_timeout();
        self.upstream_host = Some(host.clone());
        self.state = State::Connecting;
        actions.push(Action::OpenUpstream {
            host,
            connect_timeout,
        });
    }

    fn abort_session(&mut self, actions: &mut Vec<Action>) {
        self.permit = None;
        if self.downstream_open {
            actions.push(Action::CloseDownstream(CloseType::NoFlush));
            self.downstream_open = false;
        }
        self.finish(actions, false);
    }

    /// Releases everything the session holds. With `flushing` the close
    /// was initiated with writes still to deliver, so the session sits in
    /// `Closing` until the driver reports the flush (or drain handoff)
    /// finished via [`Filter::on_flush_complete`].
    fn finish(&mut self, actions: &mut Vec<Action>, flushing: bool) {
        if self.config.idle_timeout().is_some() {
            actions.push(Action::DisarmIdleTimer);
        }
        if let Some(host) = self.upstream_host.take() {
            host.stats()
                .cx_active
                .fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
        }
        self.permit = None;
        self.state = if flushing {
            State::Closing
        } else {
            State::Closed
        };
        self.session.complete();
    }

    fn arm_idle_timer(&mut self, actions: &mut Vec<Action>) {
        if !matches!(self.state, State::Connected | State::HalfClosed) {
            return;
        }
        if let Some(timeout) = self.config.idle_timeout() {
            actions.push(Action::ArmIdleTimer(timeout));
        }
    }
}
