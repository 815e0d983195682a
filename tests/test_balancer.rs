//! Tests for host selection and the host registry

mod common;

use common::{MockConnector, WORKER, get, sticky_get};
use sentinel_lb::config::{BackendConfig, Config};
use sentinel_lb::error::{HostConfigError, NoHostsAvailable};
use sentinel_lb::proxy::balancer::LoadBalancingProxyClient;
use sentinel_lb::proxy::client::ProxyClient;
use sentinel_lb::proxy::host::{HostOptions, HostState, WorkerId};
use sentinel_lb::proxy::pool::PoolConfig;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const S1: &str = "http://backend-1:8080";
const S2: &str = "http://backend-2:8080";

fn two_host_balancer() -> LoadBalancingProxyClient {
    let balancer = LoadBalancingProxyClient::new(MockConnector::new());
    balancer.add_host(S1, "s1", HostOptions::default()).unwrap();
    balancer.add_host(S2, "s2", HostOptions::default()).unwrap();
    balancer
}

fn selected_key(balancer: &LoadBalancingProxyClient, request: &sentinel_lb::http::request::Request) -> String {
    balancer
        .select_host(WORKER, request, &[])
        .unwrap()
        .host()
        .key()
        .to_string()
}

#[test]
fn test_round_robin_spreads_evenly() {
    let balancer = two_host_balancer();
    let mut counts: HashMap<String, usize> = HashMap::new();

    for _ in 0..10 {
        *counts.entry(selected_key(&balancer, &get("/"))).or_default() += 1;
    }

    assert_eq!(counts.get(S1), Some(&5));
    assert_eq!(counts.get(S2), Some(&5));
}

#[test]
fn test_sticky_requests_stay_on_their_host() {
    let balancer = two_host_balancer();

    for _ in 0..10 {
        let selection = balancer.select_host(WORKER, &sticky_get("/", "s1"), &[]).unwrap();
        assert_eq!(selection.host().key(), S1);
        assert!(selection.is_affinity());
    }
    for _ in 0..10 {
        assert_eq!(selected_key(&balancer, &sticky_get("/", "s2")), S2);
    }
}

#[test]
fn test_sticky_route_from_path_parameter() {
    let balancer = two_host_balancer();
    assert_eq!(selected_key(&balancer, &get("/cart;jsessionid=abc.s2")), S2);
}

#[test]
fn test_unknown_route_falls_back_to_balancing() {
    let balancer = two_host_balancer();
    let selection = balancer
        .select_host(WORKER, &sticky_get("/", "s9"), &[])
        .unwrap();
    assert!(!selection.is_affinity());
}

#[tokio::test]
async fn test_affinity_wins_over_least_connections() {
    let balancer = two_host_balancer();
    let host = balancer.host_for_route("s1").unwrap();
    let _busy = host.acquire(WORKER, Duration::from_secs(1)).await.unwrap();

    assert_eq!(selected_key(&balancer, &sticky_get("/", "s1")), S1);
}

#[tokio::test]
async fn test_least_in_flight_breaks_ties() {
    let balancer = two_host_balancer();
    let host = balancer.host_for_route("s1").unwrap();
    let _busy = host.acquire(WORKER, Duration::from_secs(1)).await.unwrap();

    for _ in 0..4 {
        assert_eq!(selected_key(&balancer, &get("/")), S2);
    }

    // Another worker's load does not count
    let other = balancer.select_host(WorkerId(1), &get("/"), &[]).unwrap();
    let again = balancer.select_host(WorkerId(1), &get("/"), &[]).unwrap();
    assert_ne!(other.host().key(), again.host().key());
}

#[test]
fn test_excluded_hosts_are_skipped() {
    let balancer = two_host_balancer();

    let excluded = vec![S1.to_string()];
    for _ in 0..4 {
        let selection = balancer
            .select_host(WORKER, &sticky_get("/", "s1"), &excluded)
            .unwrap();
        assert_eq!(selection.host().key(), S2);
        assert!(!selection.is_affinity());
    }

    let everything = vec![S1.to_string(), S2.to_string()];
    assert_eq!(
        balancer.select_host(WORKER, &get("/"), &everything).unwrap_err(),
        NoHostsAvailable
    );
}

#[tokio::test(start_paused = true)]
async fn test_cooldown_excludes_then_readmits() {
    let balancer = two_host_balancer();
    let failing = balancer.host_for_route("s1").unwrap();
    for _ in 0..3 {
        failing.mark_failed();
    }
    assert_eq!(failing.state(), HostState::CoolingDown);

    // Sticky traffic falls back while its host cools down
    for _ in 0..5 {
        assert_eq!(selected_key(&balancer, &sticky_get("/", "s1")), S2);
        assert_eq!(selected_key(&balancer, &get("/")), S2);
    }

    tokio::time::advance(Duration::from_secs(61)).await;
    assert_eq!(selected_key(&balancer, &sticky_get("/", "s1")), S1);
}

#[tokio::test]
async fn test_host_without_capacity_is_skipped() {
    let balancer = LoadBalancingProxyClient::new(MockConnector::new()).with_max_queued(0);
    let options = HostOptions {
        pool: PoolConfig {
            max_connections: 1,
            ..PoolConfig::default()
        },
        ..HostOptions::default()
    };
    let first = balancer.add_host(S1, "s1", options.clone()).unwrap();
    balancer.add_host(S2, "s2", options).unwrap();

    let _busy = first.acquire(WORKER, Duration::from_secs(1)).await.unwrap();
    assert!(!first.has_capacity(WORKER));
    assert_eq!(selected_key(&balancer, &sticky_get("/", "s1")), S2);
}

#[test]
fn test_duplicate_route_rejected() {
    let balancer = two_host_balancer();
    let result = balancer.add_host("http://backend-3:8080", "s1", HostOptions::default());

    assert!(matches!(result, Err(HostConfigError::DuplicateRoute(route)) if route == "s1"));
    assert_eq!(balancer.hosts().len(), 2);
}

#[test]
fn test_duplicate_uri_rejected() {
    let balancer = LoadBalancingProxyClient::new(MockConnector::new());
    balancer.add_host("http://backend-1", "", HostOptions::default()).unwrap();

    let result = balancer.add_host("http://backend-1:80/", "", HostOptions::default());
    assert!(matches!(result, Err(HostConfigError::DuplicateHost(_))));
}

#[test]
fn test_empty_routes_may_repeat() {
    let balancer = LoadBalancingProxyClient::new(MockConnector::new());
    balancer.add_host(S1, "", HostOptions::default()).unwrap();
    balancer.add_host(S2, "", HostOptions::default()).unwrap();

    assert_eq!(balancer.hosts().len(), 2);
    assert!(balancer.host_for_route("").is_none());
}

#[tokio::test]
async fn test_remove_host() {
    let balancer = two_host_balancer();
    let removed = balancer.remove_host("http://backend-1:8080/").unwrap();

    assert_eq!(removed.state(), HostState::Removed);
    assert_eq!(balancer.hosts().len(), 1);
    for _ in 0..4 {
        assert_eq!(selected_key(&balancer, &sticky_get("/", "s1")), S2);
    }

    assert!(matches!(
        balancer.remove_host(S1),
        Err(HostConfigError::UnknownHost(_))
    ));

    // The route is free again
    balancer.add_host("http://backend-3:8080", "s1", HostOptions::default()).unwrap();
}

#[test]
fn test_no_hosts() {
    let balancer = LoadBalancingProxyClient::new(MockConnector::new());
    assert!(!balancer.has_hosts());
    assert!(balancer.select_host(WORKER, &get("/"), &[]).is_err());
}

#[test]
fn test_from_config() {
    let mut config = Config::default();
    let mut first = BackendConfig::new(S1);
    first.route = "s1".to_string();
    first.name = Some("app-1".to_string());
    let mut second = BackendConfig::new(S2);
    second.route = "s2".to_string();
    config.backends = vec![first, second];

    let balancer = LoadBalancingProxyClient::from_config(&config, MockConnector::new()).unwrap();
    let hosts = balancer.hosts();
    assert_eq!(hosts.len(), 2);
    assert_eq!(hosts[0].display_name(), "app-1");
    assert_eq!(balancer.host_for_route("s2").unwrap().key(), S2);

    config.backends.push(BackendConfig::new("http://backend-1:8080"));
    assert!(LoadBalancingProxyClient::from_config(&config, MockConnector::new()).is_err());
}

#[tokio::test]
async fn test_shutdown_closes_every_pool() {
    let balancer = Arc::new(two_host_balancer());
    for host in balancer.hosts().iter() {
        host.acquire(WORKER, Duration::from_secs(1)).await.unwrap().release();
    }

    balancer.shutdown();
    for host in balancer.hosts().iter() {
        let stats = host.pool_stats(WORKER);
        assert!(stats.shutdown);
        assert_eq!(stats.open, 0);
    }
}
