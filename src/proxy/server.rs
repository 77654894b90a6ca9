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

//! The TCP listener and the per-connection driver that interprets filter
//! actions against real sockets.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::Sleep;

use super::access_log::AccessLog;
use super::config::ProxyConfig;
use super::drain::DrainManager;
use super::filter::{Action, CloseType, ConnectionEvent, Filter, State};
use super::metrics::ProxyStats;
use crate::cluster::ClusterManager;

pub struct Server {
    config: Arc<ProxyConfig>,
    stats: ProxyStats,
    cluster_manager: Arc<ClusterManager>,
    drain: Arc<DrainManager>,
    access_log: Option<Arc<AccessLog>>,
}

impl Server {
    pub fn new(config: ProxyConfig, cluster_manager: Arc<ClusterManager>) -> crate::Result<Self> {
        config.validate()?;
        let stats = ProxyStats::new(&config.stat_prefix);
        let access_log = config
            .access_log
            .as_ref()
            .map(AccessLog::from_config)
            .transpose()?
            .map(Arc::new);
        Ok(Self {
            stats: stats.clone(),
            drain: DrainManager::new(stats),
            config: Arc::new(config),
            cluster_manager,
            access_log,
        })
    }

    /// Accepts connections until `shutdown` fires.
    pub async fn run(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<()>,
    ) -> crate::Result<()> {
        let address = listener.local_addr()?;
        tracing::info!(
            %address,
            stat_prefix = %self.config.stat_prefix,
            "tcp proxy listening"
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (downstream, remote) = accepted?;
                    self.spawn_session(downstream, remote);
                }
                _ = shutdown.changed() => {
                    tracing::info!("tcp proxy shutting down");
                    return Ok(());
                }
            }
        }
    }

    fn spawn_session(&self, downstream: TcpStream, remote: std::net::SocketAddr) {
        self.stats.downstream_cx_total.inc();

        let local = match downstream.local_addr() {
            Ok(local) => local,
            Err(error) => {
                tracing::debug!(%error, "rejecting connection without a local address");
                return;
            }
        };

        let Some(cluster_name) = self.config.route(remote, local) else {
            tracing::debug!(%remote, %local, "no route for downstream connection");
            self.stats.downstream_cx_no_route.inc();
            return;
        };
        let Some(cluster) = self.cluster_manager.get(&cluster_name) else {
            tracing::debug!(%remote, cluster = %cluster_name, "route names unknown cluster");
            self.stats.downstream_cx_no_route.inc();
            return;
        };

        let filter = Filter::new(
            self.config.clone(),
            self.stats.clone(),
            cluster.clone(),
            remote,
            local,
        );
        let session = Session {
            filter,
            downstream,
            upstream: None,
            connecting: None,
            connect_deadline: None,
            idle_deadline: None,
            up_buf: BytesMut::new(),
            down_buf: BytesMut::new(),
            up_end: false,
            up_end_sent: false,
            down_end: false,
            down_end_sent: false,
            downstream_read_open: true,
            upstream_read_open: true,
            downstream_read_disabled: false,
            upstream_read_disabled: false,
            upstream_high: false,
            downstream_high: false,
            done: false,
            buffer_limit: cluster.config().per_connection_buffer_limit_bytes,
            idle_timeout: self.config.idle_timeout(),
            drain: self.drain.clone(),
        };

        let access_log = self.access_log.clone();
        tokio::spawn(async move {
            let info = session.run().await;
            if let Some(log) = access_log {
                log.log(&info);
            }
        });
    }
}

type ConnectFuture = Pin<Box<dyn Future<Output = std::io::Result<TcpStream>> + Send>>;

struct Session {
    filter: Filter,
    downstream: TcpStream,
    upstream: Option<TcpStream>,
    connecting: Option<ConnectFuture>,
    connect_deadline: Option<Pin<Box<Sleep>>>,
    idle_deadline: Option<Pin<Box<Sleep>>>,
    /// Bytes awaiting write to the upstream / downstream peer.
    up_buf: BytesMut,
    down_buf: BytesMut,
    /// A half-close to propagate once the matching buffer drains.
    up_end: bool,
    up_end_sent: bool,
    down_end: bool,
    down_end_sent: bool,
    downstream_read_open: bool,
    upstream_read_open: bool,
    downstream_read_disabled: bool,
    upstream_read_disabled: bool,
    upstream_high: bool,
    downstream_high: bool,
    done: bool,
    buffer_limit: usize,
    idle_timeout: Option<Duration>,
    drain: Arc<DrainManager>,
}

impl Session {
    async fn run(mut self) -> super::access_log::SessionInfo {
        let actions = self.filter.on_new_connection();
        self.apply(actions).await;

        let mut read_chunk = vec![0u8; 16 * 1024];
        while !self.done {
            match self.filter.state() {
                State::Closed if self.flushed() => break,
                State::Closing if self.flushed() => {
                    // Everything the close left behind has been delivered
                    // or handed to the drain manager.
                    self.filter.on_flush_complete();
                    break;
                }
                _ => {}
            }

            let want_down_read = self.downstream_read_open
                && !self.downstream_read_disabled
                && self.up_buf.len() < self.buffer_limit;
            let want_up_read = self.upstream.is_some()
                && self.upstream_read_open
                && !self.upstream_read_disabled
                && self.down_buf.len() < self.buffer_limit;
            let want_down_write = !self.down_buf.is_empty() || (self.down_end && !self.down_end_sent);
            let want_up_write = self.upstream.is_some()
                && (!self.up_buf.is_empty() || (self.up_end && !self.up_end_sent));
            let connecting = self.connecting.is_some();
            let connect_deadline_armed = self.connect_deadline.is_some();
            let idle_deadline_armed = self.idle_deadline.is_some();

            tokio::select! {
                connected = poll_connect(&mut self.connecting), if connecting => {
                    self.connecting = None;
                    self.connect_deadline = None;
                    match connected {
                        Ok(stream) => {
                            let _ = stream.set_nodelay(true);
                            self.upstream_read_open = true;
                            self.upstream = Some(stream);
                            let actions = self.filter.on_upstream_event(ConnectionEvent::Connected);
                            self.apply(actions).await;
                        }
                        Err(error) => {
                            tracing::debug!(%error, "upstream connect failed");
                            let actions = self.filter.on_upstream_event(ConnectionEvent::RemoteClose);
                            self.apply(actions).await;
                        }
                    }
                }
                _ = expired(&mut self.connect_deadline), if connect_deadline_armed => {
                    self.connect_deadline = None;
                    let actions = self.filter.on_connect_timeout();
                    self.apply(actions).await;
                }
                _ = expired(&mut self.idle_deadline), if idle_deadline_armed => {
                    self.idle_deadline = None;
                    let actions = self.filter.on_idle_timeout();
                    self.apply(actions).await;
                }
                ready = self.downstream.readable(), if want_down_read => {
                    if ready.is_ok() {
                        match self.downstream.try_read(&mut read_chunk) {
                            Ok(0) => {
                                self.downstream_read_open = false;
                                let actions = if self.down_end_sent {
                                    self.filter.on_downstream_event(ConnectionEvent::RemoteClose)
                                } else {
                                    self.filter.on_downstream_data(Bytes::new(), true)
                                };
                                self.apply(actions).await;
                            }
                            Ok(n) => {
                                let data = Bytes::copy_from_slice(&read_chunk[..n]);
                                let actions = self.filter.on_downstream_data(data, false);
                                self.apply(actions).await;
                            }
                            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                            Err(_) => {
                                self.downstream_read_open = false;
                                let actions =
                                    self.filter.on_downstream_event(ConnectionEvent::RemoteClose);
                                self.apply(actions).await;
                            }
                        }
                    }
                }
                ready = readable(self.upstream.as_ref()), if want_up_read => {
                    if ready.is_ok() {
                        let upstream = self.upstream.as_ref().expect("guarded by want_up_read");
                        match upstream.try_read(&mut read_chunk) {
                            Ok(0) => {
                                self.upstream_read_open = false;
                                let actions = if self.up_end_sent {
                                    self.filter.on_upstream_event(ConnectionEvent::RemoteClose)
                                } else {
                                    self.filter.on_upstream_data(Bytes::new(), true)
                                };
                                self.apply(actions).await;
                            }
                            Ok(n) => {
                                let data = Bytes::copy_from_slice(&read_chunk[..n]);
                                let actions = self.filter.on_upstream_data(data, false);
                                self.apply(actions).await;
                            }
                            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                            Err(_) => {
                                self.upstream_read_open = false;
                                let actions =
                                    self.filter.on_upstream_event(ConnectionEvent::RemoteClose);
                                self.apply(actions).await;
                            }
                        }
                    }
                }
                ready = self.downstream.writable(), if want_down_write => {
                    if ready.is_ok() {
                        self.pump_downstream().await;
                    }
                }
                ready = writable(self.upstream.as_ref()), if want_up_write => {
                    if ready.is_ok() {
                        self.pump_upstream().await;
                    }
                }
            }
        }

        self.finalize().await
    }

    /// Executes filter actions in order, feeding synthesized follow-up
    /// events back through the filter as they arise.
    async fn apply(&mut self, actions: Vec<Action>) {
        let mut queue: std::collections::VecDeque<Action> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                Action::OpenUpstream {
                    host,
                    connect_timeout,
                } => {
                    let address = host.address();
                    self.connecting = Some(Box::pin(TcpStream::connect(address)));
                    self.connect_deadline = Some(Box::pin(tokio::time::sleep(connect_timeout)));
                    self.up_end_sent = false;
                }
                Action::WriteUpstream { data, end_stream } => {
                    self.up_buf.extend_from_slice(&data);
                    if end_stream {
                        self.up_end = true;
                    }
                    if !self.upstream_high && self.up_buf.len() > self.buffer_limit {
                        self.upstream_high = true;
                        queue.extend(self.filter.on_upstream_high_watermark());
                    }
                }
                Action::WriteDownstream { data, end_stream } => {
                    self.down_buf.extend_from_slice(&data);
                    if end_stream {
                        self.down_end = true;
                    }
                    if !self.downstream_high && self.down_buf.len() > self.buffer_limit {
                        self.downstream_high = true;
                        queue.extend(self.filter.on_downstream_high_watermark());
                    }
                }
                Action::CloseUpstream(CloseType::NoFlush) => {
                    self.connecting = None;
                    self.connect_deadline = None;
                    self.upstream = None;
                    self.up_buf.clear();
                    // Abandoning a dial surfaces as a local close, which is
                    // what drives connect retries.
                    if self.filter.state() == State::Connecting {
                        queue.extend(self.filter.on_upstream_event(ConnectionEvent::LocalClose));
                    }
                }
                Action::CloseUpstream(CloseType::FlushWrite) => {
                    self.connecting = None;
                    self.connect_deadline = None;
                    if let Some(mut upstream) = self.upstream.take() {
                        let pending = self.up_buf.split().freeze();
                        if pending.is_empty() {
                            tokio::spawn(async move {
                                let _ = upstream.shutdown().await;
                            });
                        } else {
                            // Writes are still buffered; keep the upstream
                            // alive past the session to drain them.
                            self.drain.add(upstream, pending, self.idle_timeout);
                        }
                    }
                }
                Action::CloseDownstream(CloseType::NoFlush) => {
                    self.down_buf.clear();
                    self.done = true;
                }
                Action::CloseDownstream(CloseType::FlushWrite) => {
                    // Propagate a half close and let the flush loop finish
                    // the remaining bytes before the session ends.
                    self.down_end = true;
                }
                Action::ReadDisableDownstream(disable) => {
                    self.downstream_read_disabled = disable;
                }
                Action::ReadDisableUpstream(disable) => {
                    self.upstream_read_disabled = disable;
                }
                Action::ArmIdleTimer(timeout) => {
                    self.idle_deadline = Some(Box::pin(tokio::time::sleep(timeout)));
                }
                Action::DisarmIdleTimer => {
                    self.idle_deadline = None;
                }
            }
        }
    }

    async fn pump_downstream(&mut self) {
        if !self.down_buf.is_empty() {
            match self.downstream.try_write(&self.down_buf) {
                Ok(n) => {
                    let _ = self.down_buf.split_to(n);
                    let actions = self.filter.on_bytes_sent();
                    self.apply(actions).await;
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(_) => {
                    // The peer is gone; whatever is buffered can no longer
                    // be delivered.
                    self.down_buf.clear();
                    self.down_end_sent = true;
                    let actions = self.filter.on_downstream_event(ConnectionEvent::RemoteClose);
                    self.apply(actions).await;
                    return;
                }
            }
        }

        if self.downstream_high && self.down_buf.len() < self.buffer_limit / 2 {
            self.downstream_high = false;
            let actions = self.filter.on_downstream_low_watermark();
            self.apply(actions).await;
        }

        if self.down_buf.is_empty() && self.down_end && !self.down_end_sent {
            self.down_end_sent = true;
            let _ = self.downstream.shutdown().await;
            if !self.downstream_read_open {
                let actions = self.filter.on_downstream_event(ConnectionEvent::RemoteClose);
                self.apply(actions).await;
            }
        }
    }

    async fn pump_upstream(&mut self) {
        let Some(upstream) = self.upstream.as_ref() else {
            return;
        };

        if !self.up_buf.is_empty() {
            match upstream.try_write(&self.up_buf) {
                Ok(n) => {
                    let _ = self.up_buf.split_to(n);
                    let actions = self.filter.on_bytes_sent();
                    self.apply(actions).await;
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(_) => {
                    // The peer is gone; whatever is buffered can no longer
                    // be delivered.
                    self.up_buf.clear();
                    self.up_end_sent = true;
                    let actions = self.filter.on_upstream_event(ConnectionEvent::RemoteClose);
                    self.apply(actions).await;
                    return;
                }
            }
        }

        if self.upstream_high && self.up_buf.len() < self.buffer_limit / 2 {
            self.upstream_high = false;
            let actions = self.filter.on_upstream_low_watermark();
            self.apply(actions).await;
        }

        if self.up_buf.is_empty() && self.up_end && !self.up_end_sent {
            self.up_end_sent = true;
            if let Some(upstream) = self.upstream.as_mut() {
                let _ = upstream.shutdown().await;
            }
            if !self.upstream_read_open {
                let actions = self.filter.on_upstream_event(ConnectionEvent::RemoteClose);
                self.apply(actions).await;
            }
        }
    }

    /// Whether every buffered byte that should still be delivered has been.
    fn flushed(&self) -> bool {
        let down_flushed = self.down_buf.is_empty() && (!self.down_end || self.down_end_sent);
        let up_flushed =
            self.upstream.is_none() || (self.up_buf.is_empty() && (!self.up_end || self.up_end_sent));
        down_flushed && up_flushed
    }

    async fn finalize(mut self) -> super::access_log::SessionInfo {
        // Flush any bytes still owed to the downstream peer, within reason.
        let flush = async {
            while !self.down_buf.is_empty() {
                if self.downstream.writable().await.is_err() {
                    break;
                }
                match self.downstream.try_write(&self.down_buf) {
                    Ok(n) => {
                        let _ = self.down_buf.split_to(n);
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                    Err(_) => break,
                }
            }
        };
        let _ = tokio::time::timeout(Duration::from_secs(10), flush).await;
        self.filter.take_session()
    }
}

async fn poll_connect(connecting: &mut Option<ConnectFuture>) -> std::io::Result<TcpStream> {
    match connecting {
        Some(future) => future.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn expired(deadline: &mut Option<Pin<Box<Sleep>>>) {
    match deadline {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn readable(stream: Option<&TcpStream>) -> std::io::Result<()> {
    match stream {
        Some(stream) => stream.readable().await,
        None => std::future::pending().await,
    }
}

async fn writable(stream: Option<&TcpStream>) -> std::io::Result<()> {
    match stream {
        Some(stream) => stream.writable().await,
        None => std::future::pending().await,
    }
}
