//! End-to-end forwarding scenarios over loopback sockets

use portquota_config::{Config, ConfigStore, Rule};
use portquota_forward::{
    Forwarder, ForwarderSettings, ListenerState, RunningForwarder, StopReason,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn init_logging() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init()
        .ok();
}

/// Upstream that echoes everything back on every connection
async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
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
            });
        }
    });

    addr
}

fn rule(forward: SocketAddr, quota: i64, expire_at: i64, simultaneous: u32) -> Rule {
    Rule {
        name: "test".to_string(),
        listen_port: 0,
        forward: forward.to_string(),
        quota,
        expire_at,
        simultaneous,
    }
}

struct Harness {
    _dir: TempDir,
    store: ConfigStore,
    forwarder: RunningForwarder,
}

impl Harness {
    async fn start(rules: Vec<Rule>, idle_timeout: Option<Duration>) -> Self {
        init_logging();

        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path().join("rules.json"));
        let config = Config {
            save_interval_seconds: 3600,
            idle_timeout_seconds: 0,
            rules,
        };
        store.save(&config).unwrap();
        let config = store.load().unwrap();

        let mut settings = ForwarderSettings::from_config(&config)
            .with_bind_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
        settings.idle_timeout = idle_timeout;

        let forwarder = Forwarder::new(config, store.clone())
            .with_settings(settings)
            .start()
            .await
            .unwrap();

        Self {
            _dir: dir,
            store,
            forwarder,
        }
    }

    fn addr(&self, index: usize) -> SocketAddr {
        self.forwarder.listeners()[index]
            .local_addr()
            .expect("listener not bound")
    }

    fn quota(&self, index: usize) -> i64 {
        self.forwarder.registry().quota_and_expiry(index).unwrap().0
    }

    async fn wait_idle(&self, index: usize) {
        let counter = self.forwarder.counter().clone();
        tokio::time::timeout(Duration::from_secs(5), async move {
            while counter.live_units(index) != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("connections did not finish");
    }
}

/// Send `payload` and read the echo back
async fn round_trip(client: &mut TcpStream, payload: &[u8]) {
    client.write_all(payload).await.unwrap();
    let mut echoed = vec![0u8; payload.len()];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(echoed, payload);
}

/// True once the peer has closed the socket
async fn is_closed_by_peer(client: &mut TcpStream) -> bool {
    let mut buf = [0u8; 16];
    matches!(
        tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf)).await,
        Ok(Ok(0)) | Ok(Err(_))
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn test_quota_charged_and_second_connection_rejected() {
    let upstream = spawn_echo_server().await;
    let harness = Harness::start(vec![rule(upstream, 1000, 0, 1)], None).await;

    let mut first = TcpStream::connect(harness.addr(0)).await.unwrap();
    round_trip(&mut first, &[0xAB; 400]).await;

    // Cap of one: the second concurrent connection is closed without relaying
    let mut second = TcpStream::connect(harness.addr(0)).await.unwrap();
    assert!(is_closed_by_peer(&mut second).await);

    drop(first);
    harness.wait_idle(0).await;

    assert_eq!(harness.quota(0), 200);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_quota_sums_across_connections() {
    let upstream = spawn_echo_server().await;
    let harness = Harness::start(vec![rule(upstream, 100_000, 0, 0)], None).await;

    let mut clients = Vec::new();
    for size in [10usize, 200, 3000, 40_000] {
        let mut client = TcpStream::connect(harness.addr(0)).await.unwrap();
        round_trip(&mut client, &vec![1u8; size]).await;
        clients.push(client);
    }
    drop(clients);
    harness.wait_idle(0).await;

    let relayed = 2 * (10 + 200 + 3000 + 40_000) as i64;
    assert_eq!(harness.quota(0), 100_000 - relayed);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_exhausted_quota_stops_listener_and_saves() {
    let upstream = spawn_echo_server().await;
    let mut harness = Harness::start(vec![rule(upstream, 100, 0, 0)], None).await;
    let addr = harness.addr(0);

    let mut client = TcpStream::connect(addr).await.unwrap();
    round_trip(&mut client, &[7u8; 150]).await;
    drop(client);
    harness.wait_idle(0).await;
    assert_eq!(harness.quota(0), -200);

    // The next accept observes exhaustion and refuses the connection
    let mut late = TcpStream::connect(addr).await.unwrap();
    assert!(is_closed_by_peer(&mut late).await);

    let listener = harness.forwarder.listener_mut(0).unwrap();
    let reason = tokio::time::timeout(Duration::from_secs(5), listener.wait_stopped())
        .await
        .unwrap();
    assert_eq!(reason, Some(StopReason::QuotaExhausted));
    assert_eq!(listener.state(), ListenerState::Stopped);

    let saved = harness.store.load().unwrap();
    assert_eq!(saved.rules[0].quota, -200);

    // Nothing listens on the port any more
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_exhausted_rule_never_binds() {
    let upstream = spawn_echo_server().await;
    let other = rule(upstream, 500, 0, 0);
    let exhausted = Rule {
        name: "spent".to_string(),
        quota: -1,
        ..rule(upstream, 0, 0, 3)
    };

    let harness = Harness::start(vec![exhausted.clone(), other], None).await;

    assert_eq!(harness.forwarder.listeners()[0].local_addr(), None);
    assert_eq!(
        harness.forwarder.listeners()[0].state(),
        ListenerState::Stopped
    );
    assert!(harness.forwarder.listeners()[1].local_addr().is_some());

    assert!(harness.forwarder.save().await);
    let saved = harness.store.load().unwrap();
    assert_eq!(saved.rules[0], exhausted);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_expired_rule_never_binds() {
    let upstream = spawn_echo_server().await;
    let expired_at = chrono::Utc::now().timestamp() - 1;
    let harness = Harness::start(vec![rule(upstream, 1000, expired_at, 0)], None).await;

    assert_eq!(harness.forwarder.listeners()[0].local_addr(), None);
    assert_eq!(harness.quota(0), 1000);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rule_expiring_while_running() {
    let upstream = spawn_echo_server().await;
    let expire_at = chrono::Utc::now().timestamp() + 2;
    let mut harness = Harness::start(vec![rule(upstream, 1000, expire_at, 0)], None).await;
    let addr = harness.addr(0);

    let mut client = TcpStream::connect(addr).await.unwrap();
    round_trip(&mut client, b"hello").await;
    drop(client);

    // Cross the expiry date, then knock once more
    tokio::time::sleep(Duration::from_millis(3100)).await;
    let mut late = TcpStream::connect(addr).await.unwrap();
    assert!(is_closed_by_peer(&mut late).await);

    let reason = harness.forwarder.listener_mut(0).unwrap().wait_stopped().await;
    assert_eq!(reason, Some(StopReason::Expired));
    assert_eq!(harness.quota(0), 990);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_idle_connection_is_closed() {
    let upstream = spawn_echo_server().await;
    let harness = Harness::start(
        vec![rule(upstream, 1000, 0, 1)],
        Some(Duration::from_millis(500)),
    )
    .await;

    let mut client = TcpStream::connect(harness.addr(0)).await.unwrap();
    round_trip(&mut client, &[3u8; 10]).await;

    // Go quiet: the forwarder must hang up on us
    assert!(is_closed_by_peer(&mut client).await);
    harness.wait_idle(0).await;

    // Both directions finished and the 20 bytes were charged once
    assert_eq!(harness.quota(0), 980);

    // The slot was released, so a new connection is admitted
    let mut again = TcpStream::connect(harness.addr(0)).await.unwrap();
    round_trip(&mut again, b"ok").await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_active_connection_outlives_idle_timeout() {
    let upstream = spawn_echo_server().await;
    let harness = Harness::start(
        vec![rule(upstream, 1_000_000, 0, 0)],
        Some(Duration::from_millis(400)),
    )
    .await;

    let mut client = TcpStream::connect(harness.addr(0)).await.unwrap();
    for _ in 0..8 {
        round_trip(&mut client, b"ping").await;
        tokio::time::sleep(Duration::from_millis(150)).await;
    }
    drop(client);
    harness.wait_idle(0).await;

    assert_eq!(harness.quota(0), 1_000_000 - 64);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unreachable_upstream_leaves_state_untouched() {
    let closed = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let harness = Harness::start(vec![rule(closed, 1000, 0, 1)], None).await;

    for _ in 0..3 {
        let mut client = TcpStream::connect(harness.addr(0)).await.unwrap();
        assert!(is_closed_by_peer(&mut client).await);
    }
    harness.wait_idle(0).await;

    assert_eq!(harness.quota(0), 1000);
    assert_eq!(
        harness.forwarder.listeners()[0].state(),
        ListenerState::Accepting
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_persisted_state_reloads_identically() {
    let upstream = spawn_echo_server().await;
    let expire_at = chrono::Utc::now().timestamp() + 86_400;
    let harness = Harness::start(
        vec![
            rule(upstream, 5000, expire_at, 2),
            rule(upstream, 7000, 0, 0),
        ],
        None,
    )
    .await;

    let mut client = TcpStream::connect(harness.addr(1)).await.unwrap();
    round_trip(&mut client, &[9u8; 250]).await;
    drop(client);
    harness.wait_idle(1).await;

    let before = harness.forwarder.registry().snapshot();
    let store = harness.store.clone();
    harness.forwarder.shutdown(true).await;

    let reloaded = store.load().unwrap();
    assert_eq!(reloaded.rules, before);
    assert_eq!(reloaded.rules[0].quota, 5000);
    assert_eq!(reloaded.rules[0].expire_at, expire_at);
    assert_eq!(reloaded.rules[0].simultaneous, 2);
    assert_eq!(reloaded.rules[1].quota, 6500);
    assert_eq!(reloaded.save_interval_seconds, 3600);
}
