use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;

use fleetmon::config::{ApiConfig, Config, PollingConfig};
use fleetmon::monitor::Monitor;

/// A fake cache whose interface and response counters grow on every poll.
struct FakeCache {
    loadavg: &'static str,
    bytes_out: AtomicU64,
}

async fn astats(State(cache): State<Arc<FakeCache>>) -> Json<Value> {
    let bytes_out = cache.bytes_out.fetch_add(5_000_000, Ordering::Relaxed);
    Json(json!({
        "ats": {
            "proxy.process.http.current_client_connections": 12,
            "plugin.remap_stats.edge.video.example.net.status_2xx": bytes_out / 50_000
        },
        "system": {
            "proc.loadavg": cache.loadavg,
            "proc.net.dev": format!("eth0: 1000 10 0 0 0 0 0 0 {bytes_out} 20 0 0 0 0 0 0"),
            "inf.name": "eth0",
            "inf.speed": 10000
        }
    }))
}

async fn serve(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    addr
}

async fn fake_cache(loadavg: &'static str) -> SocketAddr {
    let cache = Arc::new(FakeCache {
        loadavg,
        bytes_out: AtomicU64::new(1_000_000),
    });
    serve(
        Router::new()
            .route("/_astats", get(astats))
            .with_state(cache),
    )
    .await
}

/// A peer monitor that believes every cache is up.
async fn fake_peer() -> SocketAddr {
    serve(Router::new().route(
        "/publish/CrStates",
        get(|| async {
            Json(json!({
                "caches": {
                    "edge-1": { "isAvailable": true },
                    "edge-2": { "isAvailable": true }
                },
                "deliveryServices": {}
            }))
        }),
    ))
    .await
}

fn write_topology(name: &str, edge1: SocketAddr, edge2: SocketAddr, peer: SocketAddr) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("fleetmon-{name}-{}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    let path = dir.join("topology.yaml");

    let topology = format!(
        r#"
servers:
  edge-1:
    url: http://{edge1}/_astats
    status: REPORTED
    profile: EDGE
    cachegroup: east
    type: EDGE
    delivery_services: [video]
  edge-2:
    url: http://{edge2}/_astats
    status: REPORTED
    profile: EDGE
    cachegroup: west
    type: EDGE
    delivery_services: [video]
  mid-1:
    url: http://127.0.0.1:9/_astats
    status: OFFLINE
    profile: EDGE
    cachegroup: central
    type: MID
profiles:
  EDGE:
    history_count: 4
    thresholds:
      loadavg: {{ comparator: "<", value: 25 }}
peers:
  tm-2:
    url: http://{peer}/publish/CrStates
"#
    );
    std::fs::write(&path, topology).expect("write topology");
    path
}

fn config(topology_path: PathBuf, peer_optimistic: bool) -> Config {
    Config {
        topology_path,
        topology_poll_interval: Duration::from_millis(200),
        peer_optimistic,
        polling: PollingConfig {
            health_interval: Duration::from_millis(100),
            stat_interval: Duration::from_millis(150),
            peer_interval: Duration::from_millis(100),
            timeout: Duration::from_secs(1),
            health_flush_interval: Duration::from_millis(20),
            stat_flush_interval: Duration::from_millis(20),
            peer_flush_interval: Duration::from_millis(20),
            ..Default::default()
        },
        api: ApiConfig {
            addr: "127.0.0.1:0".to_string(),
        },
        ..Default::default()
    }
}

async fn get_json(api: SocketAddr, path: &str) -> (u16, Value) {
    let response = reqwest::get(format!("http://{api}{path}"))
        .await
        .expect("request sent");
    let status = response.status().as_u16();
    let text = response.text().await.expect("body");
    (status, serde_json::from_str(&text).unwrap_or(Value::String(text)))
}

/// Poll `path` until `done` accepts the body, or give up after five seconds.
async fn eventually(api: SocketAddr, path: &str, done: impl Fn(u16, &Value) -> bool) -> Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let (status, body) = get_json(api, path).await;
        if done(status, &body) {
            return body;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "{path} never settled, last answer {status}: {body}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_monitor_end_to_end() {
    let edge1 = fake_cache("0.30 0.12 0.21 1/863 1234").await;
    let edge2 = fake_cache("30.00 28.00 27.00 9/863 1234").await;
    let peer = fake_peer().await;
    let topology_path = write_topology("optimistic", edge1, edge2, peer);

    let mut monitor = Monitor::new(config(topology_path, true)).expect("monitor builds");
    let api = monitor.start().await.expect("monitor starts");

    // Ungated endpoints answer at once.
    let (status, _) = get_json(api, "/healthz").await;
    assert_eq!(status, 200);

    // Queries open once both polled caches have a good result or bandwidth.
    eventually(api, "/api/cache-count", |status, _| status == 200).await;
    assert_eq!(get_json(api, "/api/cache-count").await, (200, json!(3)));

    // edge-2 breaks its load threshold locally.
    let local = eventually(api, "/publish/CrStates?raw", |_, body| {
        body["caches"]["edge-2"]["isAvailable"] == json!(false)
            && body["caches"]["edge-1"]["isAvailable"] == json!(true)
    })
    .await;
    assert_eq!(local["caches"]["mid-1"]["isAvailable"], json!(false));

    // The peer vote brings it back in the combined view.
    let combined = eventually(api, "/publish/CrStates", |_, body| {
        body["caches"]["edge-2"]["isAvailable"] == json!(true)
    })
    .await;
    assert_eq!(combined["caches"]["mid-1"]["isAvailable"], json!(false));
    assert_eq!(
        combined["deliveryServices"]["video"]["isAvailable"],
        json!(true)
    );
    assert_eq!(monitor.metrics().caches_available.get(), 2.0);

    let (_, statuses) = get_json(api, "/api/cache-statuses").await;
    assert_eq!(statuses["mid-1"]["reason"], json!("OFFLINE - unavailable"));
    assert_eq!(statuses["mid-1"]["poller"], json!("config"));
    assert!(statuses["edge-2"]["reason"]
        .as_str()
        .is_some_and(|r| r.contains("loadavg")));

    // Stats history holds at most the profile's history count.
    let stats = eventually(
        api,
        "/publish/CacheStats?hosts=edge-1&stats=loadavg&hc=0",
        |_, body| {
            body["caches"]["edge-1"]["loadavg"]
                .as_array()
                .is_some_and(|values| values.len() == 4)
        },
    )
    .await;
    assert_eq!(stats["caches"]["edge-1"]["loadavg"][0]["value"], json!(0.3));
    assert!(stats["caches"].get("edge-2").is_none());

    // Response counters keep growing, so the service shows traffic.
    let ds = eventually(
        api,
        "/publish/DsStats?deliveryservices=video&stats=tps_2xx,tps_total",
        |_, body| {
            body["deliveryService"]["video"]["tps_total"][0]["value"]
                .as_f64()
                .is_some_and(|tps| tps > 0.0)
        },
    )
    .await;
    let video = &ds["deliveryService"]["video"];
    assert_eq!(video["tps_2xx"][0]["value"], video["tps_total"][0]["value"]);
    assert!(video.get("caches_configured").is_none());

    let (status, peers) = get_json(api, "/publish/PeerStates").await;
    assert_eq!(status, 200);
    assert_eq!(peers["peers"]["tm-2"]["available"], json!(true));

    let (status, _) = get_json(api, "/publish/EventLog?hc=1").await;
    assert_eq!(status, 400);
    assert!(monitor.counters().errors.get() >= 1);
    assert!(monitor.counters().fetches.get() > 0);

    monitor.stop().await.expect("monitor stops");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pessimistic_monitor_ignores_peers() {
    let edge1 = fake_cache("0.30 0.12 0.21 1/863 1234").await;
    let edge2 = fake_cache("30.00 28.00 27.00 9/863 1234").await;
    let peer = fake_peer().await;
    let topology_path = write_topology("pessimistic", edge1, edge2, peer);

    let mut monitor = Monitor::new(config(topology_path, false)).expect("monitor builds");
    let api = monitor.start().await.expect("monitor starts");

    eventually(api, "/publish/PeerStates", |status, body| {
        status == 200 && body["peers"]["tm-2"]["available"] == json!(true)
    })
    .await;

    eventually(api, "/api/cache-available-count", |_, body| *body == json!(1)).await;

    let (_, combined) = get_json(api, "/publish/CrStates").await;
    assert_eq!(combined["caches"]["edge-1"]["isAvailable"], json!(true));
    assert_eq!(combined["caches"]["edge-2"]["isAvailable"], json!(false));
    assert_eq!(get_json(api, "/api/cache-down-count").await, (200, json!(2)));

    monitor.stop().await.expect("monitor stops");
}
