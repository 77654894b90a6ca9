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

//! Deferred flush of upstream connections.
//!
//! When a downstream disconnects while writes to its upstream are still
//! buffered, the upstream connection is detached from the session and
//! handed here to finish writing. The connection finalizes when the peer
//! closes, when it sends data nobody is left to receive, or when the idle
//! timer gives up on it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::metrics::ProxyStats;
use crate::metrics::LatchedCounter;

pub struct DrainManager {
    stats: ProxyStats,
    active: AtomicUsize,
    flushed_bytes: LatchedCounter,
}

impl DrainManager {
    pub fn new(stats: ProxyStats) -> Arc<Self> {
        Arc::new(Self {
            stats,
            active: AtomicUsize::new(0),
            flushed_bytes: LatchedCounter::new(),
        })
    }

    /// The number of upstream connections currently draining.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Takes and resets the bytes drained since the last call, for
    /// periodic aggregation.
    pub fn take_flushed_bytes(&self) -> u64 {
        self.flushed_bytes.latch()
    }

    /// Takes ownership of `upstream` and drains `pending` to it in the
    /// background.
    pub fn add(self: &Arc<Self>, upstream: TcpStream, pending: Bytes, idle_timeout: Option<Duration>) {
        self.stats.upstream_flush_total.inc();
        self.stats.upstream_flush_active.inc();
        self.active.fetch_add(1, Ordering::Relaxed);

        let manager = self.clone();
        tokio::spawn(async move {
            let len = pending.len() as u64;
            let drained = match idle_timeout {
                Some(timeout) => {
                    match tokio::time::timeout(timeout, drain(upstream, pending)).await {
                        Ok(result) => result,
                        Err(_) => {
                            manager.stats.idle_timeout.inc();
                            tracing::debug!("upstream flush abandoned by idle timeout");
                            Err(std::io::ErrorKind::TimedOut.into())
                        }
                    }
                }
                None => drain(upstream, pending).await,
            };

            match drained {
                Ok(()) => manager.flushed_bytes.add(len),
                Err(error) if error.kind() == std::io::ErrorKind::TimedOut => {}
                Err(error) => {
                    tracing::debug!(%error, "upstream flush ended with error");
                }
            }
            manager.stats.upstream_flush_active.dec();
            manager.active.fetch_sub(1, Ordering::Relaxed);
        });
    }
}

async fn drain(mut upstream: TcpStream, pending: Bytes) -> std::io::Result<()> {
    upstream.write_all(&pending).await?;
    upstream.shutdown().await?;

    // Wait for the peer to close. Data arriving here has no downstream to
    // go to; mirror a closed-socket kernel and reset instead of buffering.
    let mut buf = [0u8; 1024];
    loop {
        let n = upstream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        tracing::debug!(bytes = n, "upstream sent data during flush, closing");
        return Ok(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn wait_for_idle(manager: &Arc<DrainManager>) {
        for _ in 0..200 {
            if manager.active() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("drain never finished");
    }

    #[tokio::test]
    async fn drains_pending_bytes_then_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let upstream = TcpStream::connect(addr).await.unwrap();
        let (mut accepted, _) = listener.accept().await.unwrap();

        let manager = DrainManager::new(ProxyStats::new("drain_test"));
        manager.add(upstream, Bytes::from_static(b"tail data"), None);
        assert_eq!(manager.active(), 1);

        let mut received = Vec::new();
        accepted.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"tail data");

        drop(accepted);
        wait_for_idle(&manager).await;

        // Drained bytes aggregate until latched.
        assert_eq!(manager.take_flushed_bytes(), 9);
        assert_eq!(manager.take_flushed_bytes(), 0);
    }

    #[tokio::test]
    async fn idle_expiry_abandons_flush() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let upstream = TcpStream::connect(addr).await.unwrap();
        // Accept but never read or close: the drain can only time out.
        let (_accepted, _) = listener.accept().await.unwrap();

        let stats = ProxyStats::new("drain_idle_test");
        let idle0 = stats.idle_timeout.get();
        let manager = DrainManager::new(stats.clone());
        manager.add(
            upstream,
            Bytes::new(),
            Some(Duration::from_millis(50)),
        );

        wait_for_idle(&manager).await;
        assert_eq!(stats.idle_timeout.get(), idle0 + 1);
        assert_eq!(stats.upstream_flush_active.get(), 0);
    }
}
