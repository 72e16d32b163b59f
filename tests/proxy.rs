//! End-to-end tests: a real `Proxy` between a client socket and a fake
//! upstream resolver on loopback.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use tokio::net::UdpSocket;

use detour_cache::dns::{
    CLASS_IN, CachedRecord, DnsQuery, DnsQuestion, DnsRecord, DnsResponse, TYPE_A, encode_domain,
    parse_answer,
};
use detour_cache::{CacheEntry, CacheKey, CacheSnapshot, Error, Proxy, ProxyConfig, persistence};

fn build_dns_query(query_id: u16, domain: &str) -> Vec<u8> {
    let mut query = Vec::new();
    query.extend_from_slice(&query_id.to_be_bytes());
    query.extend_from_slice(&[0x01, 0x00]); // Flags: standard query
    query.extend_from_slice(&[0x00, 0x01]); // Questions: 1
    query.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    encode_domain(&mut query, domain);
    query.extend_from_slice(&TYPE_A.to_be_bytes());
    query.extend_from_slice(&CLASS_IN.to_be_bytes());
    query
}

/// Fake upstream answering every A query with one record, ttl 300.
/// With `silent` it counts queries but never answers.
async fn spawn_upstream(silent: bool) -> (SocketAddr, Arc<AtomicUsize>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);

    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        while let Ok((len, src)) = socket.recv_from(&mut buf).await {
            counter.fetch_add(1, Ordering::SeqCst);
            if silent {
                continue;
            }
            let query = DnsQuery::parse(&buf[..len]).unwrap();
            let response = DnsResponse {
                id: query.id,
                flags: 0x8180,
                questions: vec![DnsQuestion {
                    domain: query.domain.clone(),
                    qtype: query.qtype,
                    qclass: query.qclass,
                }],
                answers: vec![DnsRecord {
                    name: query.domain.clone(),
                    rtype: TYPE_A,
                    class: CLASS_IN,
                    ttl: 300,
                    rdata: vec![93, 184, 216, 34],
                }],
            };
            socket.send_to(&response.to_bytes(), src).await.unwrap();
        }
    });

    (addr, calls)
}

fn config(upstream: SocketAddr, cache_path: &Path) -> ProxyConfig {
    ProxyConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        upstream_addr: upstream,
        cache_path: cache_path.to_path_buf(),
        sweep_interval: Duration::from_millis(20),
        recv_timeout: Duration::from_millis(50),
        upstream_timeout: Duration::from_millis(300),
        stats_interval: Duration::from_secs(60),
        shutdown_grace: Duration::from_secs(2),
    }
}

async fn ask(client: &UdpSocket, proxy: SocketAddr, query: &[u8]) -> Option<Vec<u8>> {
    client.send_to(query, proxy).await.unwrap();
    let mut buf = [0u8; 4096];
    match tokio::time::timeout(Duration::from_secs(1), client.recv_from(&mut buf)).await {
        Ok(Ok((len, _))) => Some(buf[..len].to_vec()),
        _ => None,
    }
}

#[tokio::test]
async fn test_miss_then_hit_then_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let cache_path = dir.path().join("dns_cache.json");
    let (upstream, calls) = spawn_upstream(false).await;

    let proxy = Proxy::start(config(upstream, &cache_path)).await.unwrap();
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let key = CacheKey::new("example.com", TYPE_A);

    // Miss: forwarded upstream and cached.
    let first = ask(&client, proxy.local_addr(), &build_dns_query(0x0101, "example.com"))
        .await
        .expect("forwarded answer");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(&first[..2], &0x0101u16.to_be_bytes());
    let entry = proxy.cache().get(&key).expect("answer cached");
    assert_eq!(entry.ttl(), 300);

    // Hit: answered from the cache without an upstream call, echoing the
    // question exactly as asked.
    let repeat = build_dns_query(0x0202, "EXAMPLE.com");
    let second = ask(&client, proxy.local_addr(), &repeat)
        .await
        .expect("cached answer");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(&second[..2], &0x0202u16.to_be_bytes());
    assert_eq!(&second[12..repeat.len()], &repeat[12..]);
    assert_eq!(parse_answer(&second).unwrap().records, entry.records());
    assert_eq!(proxy.stats().cached.load(Ordering::Relaxed), 1);

    proxy.shutdown().await;

    let saved = persistence::load(&cache_path).await.unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved.entries[0].0, key);

    // A restarted proxy answers from the restored cache.
    let proxy = Proxy::start(config(upstream, &cache_path)).await.unwrap();
    assert!(proxy.cache().get(&key).is_some());
    let third = ask(&client, proxy.local_addr(), &build_dns_query(0x0303, "example.com"))
        .await
        .expect("restored answer");
    assert_eq!(&third[..2], &0x0303u16.to_be_bytes());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    proxy.shutdown().await;
}

#[tokio::test]
async fn test_expired_snapshot_entry_is_swept_at_startup() {
    let dir = tempfile::tempdir().unwrap();
    let cache_path = dir.path().join("dns_cache.json");
    let (upstream, _) = spawn_upstream(false).await;

    let record = CachedRecord {
        name: "example.com".to_string(),
        rtype: TYPE_A,
        class: CLASS_IN,
        rdata: vec![10, 0, 0, 1],
    };
    let now = SystemTime::now();
    let fresh = CacheKey::new("fresh.example", TYPE_A);
    let expired = CacheKey::new("expired.example", TYPE_A);
    let snapshot = CacheSnapshot {
        entries: vec![
            (fresh.clone(), CacheEntry::new(vec![record.clone()], 300, now).unwrap()),
            (
                expired.clone(),
                CacheEntry::new(vec![record], 60, now - Duration::from_secs(3600)).unwrap(),
            ),
        ],
    };
    persistence::save(&cache_path, snapshot).await.unwrap();

    let proxy = Proxy::start(config(upstream, &cache_path)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(proxy.cache().get(&fresh).is_some());
    assert!(proxy.cache().get(&expired).is_none());
    assert_eq!(proxy.cache().len(), 1);
    proxy.shutdown().await;
}

#[tokio::test]
async fn test_silent_upstream_sends_nothing_and_caches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let (upstream, calls) = spawn_upstream(true).await;

    let proxy = Proxy::start(config(upstream, &dir.path().join("c.json")))
        .await
        .unwrap();
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let reply = ask(&client, proxy.local_addr(), &build_dns_query(1, "silent.example")).await;

    assert!(reply.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(proxy.cache().is_empty());
    assert_eq!(proxy.stats().failed.load(Ordering::Relaxed), 1);
    proxy.shutdown().await;
}

#[tokio::test]
async fn test_malformed_datagram_is_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let (upstream, calls) = spawn_upstream(false).await;

    let proxy = Proxy::start(config(upstream, &dir.path().join("c.json")))
        .await
        .unwrap();
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let reply = ask(&client, proxy.local_addr(), b"definitely not dns").await;
    assert!(reply.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // The listener keeps serving afterwards.
    let reply = ask(&client, proxy.local_addr(), &build_dns_query(2, "example.com")).await;
    assert!(reply.is_some());
    assert_eq!(proxy.stats().dropped.load(Ordering::Relaxed), 1);
    proxy.shutdown().await;
}

#[tokio::test]
async fn test_bind_failure_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let taken = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut config = config("127.0.0.1:53".parse().unwrap(), &dir.path().join("c.json"));
    config.bind_addr = taken.local_addr().unwrap();

    let result = Proxy::start(config).await;

    assert!(matches!(result, Err(Error::Bind { .. })));
}

#[tokio::test]
async fn test_only_first_stop_is_honored() {
    let dir = tempfile::tempdir().unwrap();
    let cache_path = dir.path().join("c.json");
    let (upstream, _) = spawn_upstream(false).await;

    let proxy = Proxy::start(config(upstream, &cache_path)).await.unwrap();

    assert!(!proxy.is_stopped());
    assert!(proxy.stop());
    assert!(!proxy.stop());
    assert!(proxy.is_stopped());

    tokio::time::timeout(Duration::from_secs(3), proxy.shutdown())
        .await
        .expect("shutdown finished within the grace period");
    assert!(cache_path.exists());
}

#[tokio::test]
async fn test_corrupt_snapshot_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    let cache_path = dir.path().join("c.json");
    tokio::fs::write(&cache_path, b"\x80\x03}q\x00.").await.unwrap();
    let (upstream, _) = spawn_upstream(false).await;

    let proxy = Proxy::start(config(upstream, &cache_path)).await.unwrap();

    assert!(proxy.cache().is_empty());
    proxy.shutdown().await;

    // Shutdown overwrote the corrupt file with a valid snapshot.
    assert!(persistence::load(&cache_path).await.unwrap().is_empty());
}
