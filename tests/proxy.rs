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

//! End-to-end proxy scenarios over real sockets.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use tiller::cluster::{ClusterConfig, ClusterManager};
use tiller::proxy::{ProxyConfig, Server};
use tiller::xds::{ClusterLoadAssignment, LbEndpoint, LocalityLbEndpoints};

fn assignment(cluster: &str, addrs: &[SocketAddr]) -> ClusterLoadAssignment {
    ClusterLoadAssignment {
        cluster_name: cluster.into(),
        endpoints: vec![LocalityLbEndpoints {
            locality: None,
            priority: 0,
            load_balancing_weight: None,
            lb_endpoints: addrs.iter().map(|a| LbEndpoint::new(*a)).collect(),
        }],
    }
}

/// Starts a proxy for `config` routing to `upstreams`, returning its
/// listening address and the shutdown handle keeping it alive.
async fn start_proxy(
    config: ProxyConfig,
    cluster: &str,
    upstreams: &[SocketAddr],
) -> (SocketAddr, watch::Sender<()>) {
    let manager = ClusterManager::new(None, None);
    let mut engine = manager.add_cluster(ClusterConfig::new(cluster)).unwrap();
    engine
        .on_assignment(&[assignment(cluster, upstreams)])
        .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let server = Server::new(config, manager).unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    tokio::spawn(async move {
        let _ = server.run(listener, shutdown_rx).await;
    });

    (address, shutdown_tx)
}

/// An upstream that echoes everything it reads, one connection at a time.
async fn spawn_echo_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                let _ = socket.shutdown().await;
            });
        }
    });
    address
}

/// A port that actively refuses connections.
async fn refused_address() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    drop(listener);
    address
}

#[tokio::test]
async fn proxies_bytes_in_both_directions() {
    let upstream = spawn_echo_upstream().await;
    let (proxy, _shutdown) =
        start_proxy(ProxyConfig::new("e2e_echo", "e2e_echo"), "e2e_echo", &[upstream]).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(b"hello through the proxy").await.unwrap();

    let mut response = [0u8; 23];
    client.read_exact(&mut response).await.unwrap();
    assert_eq!(&response, b"hello through the proxy");
}

#[tokio::test]
async fn half_close_propagates_and_drains() {
    let upstream = spawn_echo_upstream().await;
    let (proxy, _shutdown) = start_proxy(
        ProxyConfig::new("e2e_half_close", "e2e_half_close"),
        "e2e_half_close",
        &[upstream],
    )
    .await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(b"final words").await.unwrap();
    // Half-close the client side; the echo must still come back, then EOF.
    client.shutdown().await.unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    assert_eq!(response, b"final words");
}

#[tokio::test]
async fn multiple_sequential_connections() {
    let upstream = spawn_echo_upstream().await;
    let (proxy, _shutdown) = start_proxy(
        ProxyConfig::new("e2e_sequential", "e2e_sequential"),
        "e2e_sequential",
        &[upstream],
    )
    .await;

    for round in 0u32..3 {
        let mut client = TcpStream::connect(proxy).await.unwrap();
        let message = format!("round {round}");
        client.write_all(message.as_bytes()).await.unwrap();
        client.shutdown().await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, message.as_bytes());
    }
}

#[tokio::test]
async fn refused_upstream_closes_downstream_after_attempts() {
    let dead = refused_address().await;
    let mut config = ProxyConfig::new("e2e_refused", "e2e_refused");
    config.max_connect_attempts = 3;
    let (proxy, _shutdown) = start_proxy(config, "e2e_refused", &[dead]).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    // Every attempt is refused, so the proxy gives up and closes us.
    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("proxy should close the connection")
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn no_healthy_host_closes_downstream() {
    let (proxy, _shutdown) = start_proxy(
        ProxyConfig::new("e2e_empty", "e2e_empty"),
        "e2e_empty",
        &[],
    )
    .await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("proxy should close the connection")
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn idle_timeout_tears_down_the_session() {
    let upstream = spawn_echo_upstream().await;
    let mut config = ProxyConfig::new("e2e_idle", "e2e_idle");
    config.idle_timeout_ms = 200;
    let (proxy, _shutdown) = start_proxy(config, "e2e_idle", &[upstream]).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();

    // Stay silent past the idle timeout; the proxy must close us.
    let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("idle timer should close the connection")
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn route_criteria_select_the_cluster() {
    let upstream = spawn_echo_upstream().await;

    // Route only source addresses from loopback; everything else has no
    // route and is dropped on accept.
    let yaml = "
stat_prefix: e2e_routing
routes:
  - cluster: e2e_routing
    source_ip_list:
      - 127.0.0.0/8
";
    let config: ProxyConfig = serde_yaml::from_str(yaml).unwrap();
    let (proxy, _shutdown) = start_proxy(config, "e2e_routing", &[upstream]).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(b"routed").await.unwrap();
    let mut response = [0u8; 6];
    client.read_exact(&mut response).await.unwrap();
    assert_eq!(&response, b"routed");
}

#[tokio::test]
async fn load_is_spread_across_healthy_hosts() {
    let first = spawn_echo_upstream().await;
    let second = spawn_echo_upstream().await;
    let (proxy, _shutdown) = start_proxy(
        ProxyConfig::new("e2e_spread", "e2e_spread"),
        "e2e_spread",
        &[first, second],
    )
    .await;

    // With random selection over two healthy hosts, thirty sessions all
    // completing proves both endpoints serve (each is picked with
    // probability 1 - 0.5^30 at least once, and a broken pick would hang).
    for _ in 0..30 {
        let mut client = TcpStream::connect(proxy).await.unwrap();
        client.write_all(b"spread").await.unwrap();
        client.shutdown().await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"spread");
    }
}
