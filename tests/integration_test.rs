//! End-to-end scenarios run against a live broker over its real socket,
//! exercising the same path a separate client process would use.

use std::time::Duration;

use serde_json::{json, Value};
use testbroker::config::Config;
use testbroker::lifecycle::Lifecycle;

async fn start_broker(config: Config) -> Lifecycle {
    let mut lifecycle = Lifecycle::new(config);
    lifecycle.start().await.expect("broker should start");
    lifecycle
}

async fn call(path: &std::path::Path, request: Value) -> Value {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixStream;

    let stream = UnixStream::connect(path).await.expect("connect should succeed");
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let mut line = serde_json::to_vec(&request).unwrap();
    line.push(b'\n');
    writer.write_all(&line).await.unwrap();

    let mut response_line = String::new();
    reader.read_line(&mut response_line).await.unwrap();
    serde_json::from_str(response_line.trim_end()).unwrap()
}

#[tokio::test]
async fn basic_round_trip() {
    let mut lifecycle = start_broker(Config::default()).await;
    let path = lifecycle.endpoint_path().unwrap().clone();

    let resp = call(&path, json!({"action": "set", "key": "foo", "value": "bar", "ttl": 60_000})).await;
    assert_eq!(resp["ok"], true);

    let resp = call(&path, json!({"action": "get", "key": "foo"})).await;
    assert_eq!(resp["value"], "bar");

    let resp = call(&path, json!({"action": "del", "key": "foo"})).await;
    assert_eq!(resp["ok"], true);

    let resp = call(&path, json!({"action": "get", "key": "foo"})).await;
    assert_eq!(resp["error"], "not_found");

    lifecycle.stop();
}

#[tokio::test]
async fn ttl_expiry() {
    let mut lifecycle = start_broker(Config::default()).await;
    let path = lifecycle.endpoint_path().unwrap().clone();

    let resp = call(&path, json!({"action": "set", "key": "t", "value": "v", "ttl": 100})).await;
    assert_eq!(resp["ok"], true);

    tokio::time::sleep(Duration::from_millis(150)).await;

    let resp = call(&path, json!({"action": "get", "key": "t"})).await;
    assert_eq!(resp["error"], "expired");

    let resp = call(&path, json!({"action": "list"})).await;
    assert!(resp["items"].get("t").is_none(), "expired key must not appear in list()");

    lifecycle.stop();
}

#[tokio::test]
async fn dense_lease_allocation() {
    let mut lifecycle = start_broker(Config::default()).await;
    let path = lifecycle.endpoint_path().unwrap().clone();

    let mut assigned = Vec::new();
    for worker in ["w1", "w2", "w3", "w4", "w5"] {
        let resp = call(&path, json!({"action": "lease", "key": "p", "workerId": worker, "ttl": 60_000})).await;
        assigned.push(resp["value"].as_u64().unwrap());
    }
    assert_eq!(assigned, vec![0, 1, 2, 3, 4]);

    let resp = call(&path, json!({"action": "release", "workerId": "w2"})).await;
    assert_eq!(resp["released"], true);

    let resp = call(&path, json!({"action": "lease", "key": "p", "workerId": "w6", "ttl": 60_000})).await;
    assert_eq!(resp["value"], 1);

    let resp = call(&path, json!({"action": "lease", "key": "p", "workerId": "w7", "ttl": 60_000})).await;
    assert_eq!(resp["value"], 5);

    lifecycle.stop();
}

#[tokio::test]
async fn renew_vs_cross_pool() {
    let mut lifecycle = start_broker(Config::default()).await;
    let path = lifecycle.endpoint_path().unwrap().clone();

    let resp = call(&path, json!({"action": "lease", "key": "p", "workerId": "w", "ttl": 60_000})).await;
    assert_eq!(resp["value"], 0);

    let resp = call(&path, json!({"action": "lease", "key": "p", "workerId": "w", "ttl": 60_000})).await;
    assert_eq!(resp["value"], 0);

    let resp = call(&path, json!({"action": "lease", "key": "q", "workerId": "w", "ttl": 60_000})).await;
    assert_eq!(resp["error"], "worker_already_has_lease");

    lifecycle.stop();
}

#[tokio::test]
async fn hmac_authentication() {
    let mut config = Config::default();
    config.secret = Some("shared-secret".to_string());
    let mut lifecycle = start_broker(config).await;
    let path = lifecycle.endpoint_path().unwrap().clone();

    let body = br#"{"action":"ping"}"#;
    let hmac = testbroker::auth::sign(b"shared-secret", body);
    let signed: Value = serde_json::from_str(&format!(r#"{{"action":"ping","hmac":"{hmac}"}}"#)).unwrap();
    let resp = call(&path, signed).await;
    assert_eq!(resp["ok"], true);

    let resp = call(&path, json!({"action": "ping", "hmac": "0000000000000000000000000000000000000000000000000000000000000000"})).await;
    assert_eq!(resp["error"], "auth_failed");

    let resp = call(&path, json!({"action": "ping", "hmac": "zz"})).await;
    assert_eq!(resp["error"], "auth_failed");

    lifecycle.stop();
}

#[tokio::test]
async fn graceful_drain_rejects_new_connections() {
    let mut lifecycle = start_broker(Config::default()).await;
    let path = lifecycle.endpoint_path().unwrap().clone();

    lifecycle.core().in_flight.fetch_add(3, std::sync::atomic::Ordering::Relaxed);

    let drain_task = tokio::spawn({
        let core = std::sync::Arc::clone(lifecycle.core());
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            core.in_flight.fetch_sub(3, std::sync::atomic::Ordering::Relaxed);
        }
    });

    let drained = lifecycle.drain(Duration::from_secs(5)).await;
    assert!(drained);
    drain_task.await.unwrap();

    let resp = call(&path, json!({"action": "ping"})).await;
    assert_eq!(resp["error"], "draining");

    lifecycle.stop();
}
