//! Integration Tests for Argus
//!
//! End-to-end runs of the agent against loopback servers.

use std::sync::Arc;
use std::time::Duration;

use argus::config::EndpointConfig;
use argus::{AgentBuilder, AppConfig, ForwardMode, MetricSpec};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

// =============================================================================
// Test Helpers
// =============================================================================

/// Monitoring server stub: one JSON request line per connection.
///
/// Replies with the scripted responses in order, then with plain success.
async fn start_server(replies: Vec<&'static str>) -> (String, Arc<Mutex<Vec<Value>>>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind random port");
    let address = listener.local_addr().expect("Failed to get local addr").to_string();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let replies = Arc::new(Mutex::new(replies.into_iter()));

    let received = Arc::clone(&requests);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let (reader, mut writer) = stream.into_split();
            let mut line = String::new();
            if BufReader::new(reader).read_line(&mut line).await.unwrap_or(0) == 0 {
                continue;
            }
            received.lock().push(serde_json::from_str(&line).unwrap());

            let reply = replies.lock().next().unwrap_or("{\"response\":\"success\"}");
            let _ = writer.write_all(format!("{reply}\n").as_bytes()).await;
        }
    });

    (address, requests)
}

/// Connector endpoint stub collecting NDJSON lines.
async fn start_endpoint() -> (String, Arc<Mutex<Vec<Value>>>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind random port");
    let address = listener.local_addr().expect("Failed to get local addr").to_string();
    let items = Arc::new(Mutex::new(Vec::new()));

    let received = Arc::clone(&items);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let received = Arc::clone(&received);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stream).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    received.lock().push(serde_json::from_str(&line).unwrap());
                }
            });
        }
    });

    (address, items)
}

fn data_items(requests: &[Value]) -> Vec<Value> {
    requests
        .iter()
        .flat_map(|r| r["data"].as_array().cloned().unwrap_or_default())
        .collect()
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    for _ in 0..300 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn base_config(metrics: Vec<MetricSpec>) -> AppConfig {
    let mut config = AppConfig {
        metrics,
        ..AppConfig::default()
    };
    config.agent.hostname = "it-host".to_string();
    config.agent.buffer_send = Duration::from_millis(100);
    config
}

// =============================================================================
// Server Mode
// =============================================================================

#[tokio::test]
async fn test_server_mode_delivers_checks_and_log_lines() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("app.log");
    std::fs::write(&log, "started\nerror: disk full\nready\n").unwrap();

    let (address, requests) = start_server(vec![]).await;
    let mut config = base_config(vec![
        MetricSpec::new("agent.ping", Duration::from_secs(60)),
        MetricSpec::new(format!("log[{},error]", log.display()), Duration::from_secs(1)),
    ]);
    config.server.addresses = vec![address];

    let handles = AgentBuilder::new(config).build().unwrap();
    wait_until(|| data_items(&requests.lock()).len() >= 2).await;
    handles.shutdown().await;

    let requests = requests.lock();
    assert_eq!(requests[0]["request"], "agent data");
    assert_eq!(requests[0]["host"], "it-host");

    let items = data_items(&requests);
    let ping = items.iter().find(|i| i["key"] == "agent.ping").unwrap();
    assert_eq!(ping["value"], "1");

    let lines: Vec<_> = items.iter().filter(|i| i["key"].as_str().unwrap().starts_with("log[")).collect();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["value"], "error: disk full");
    assert_eq!(lines[0]["last_log_size"], 25);
}

#[tokio::test]
async fn test_server_mode_resends_unaccepted_tail_in_order() {
    let (address, requests) = start_server(vec!["{\"response\":\"success\",\"accepted\":1}"]).await;
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("app.log");
    std::fs::write(&log, "one\ntwo\nthree\n").unwrap();

    let mut config = base_config(vec![MetricSpec::new(
        format!("log[{}]", log.display()),
        Duration::from_secs(60),
    )]);
    config.server.addresses = vec![address];

    let handles = AgentBuilder::new(config).build().unwrap();
    wait_until(|| requests.lock().len() >= 2).await;
    handles.shutdown().await;

    let requests = requests.lock();
    let first: Vec<_> = requests[0]["data"].as_array().unwrap().iter().map(|i| i["value"].clone()).collect();
    let second: Vec<_> = requests[1]["data"].as_array().unwrap().iter().map(|i| i["value"].clone()).collect();
    assert_eq!(first, vec!["one", "two", "three"]);
    assert_eq!(second, vec!["two", "three"]);
}

#[tokio::test]
async fn test_server_unreachable_keeps_items_buffered() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);

    let mut config = base_config(vec![MetricSpec::new("agent.ping", Duration::from_secs(60))]);
    config.server.addresses = vec![address];
    config.agent.shutdown_timeout = Duration::from_millis(500);

    let handles = AgentBuilder::new(config).build().unwrap();
    let buffer = Arc::clone(&handles.buffer);
    tokio::time::sleep(Duration::from_millis(300)).await;
    handles.shutdown().await;

    assert_eq!(buffer.len(), 1);
    assert_eq!(buffer.dropped(), 0);
}

// =============================================================================
// Connector Mode
// =============================================================================

#[tokio::test]
async fn test_connector_mode_routes_by_key_filter() {
    let (logs_address, logs) = start_endpoint().await;
    let (agent_address, agent_items) = start_endpoint().await;

    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("app.log");
    std::fs::write(&log, "a\nb\n").unwrap();

    let mut config = base_config(vec![
        MetricSpec::new("agent.ping", Duration::from_secs(60)),
        MetricSpec::new("agent.hostname", Duration::from_secs(60)),
        MetricSpec::new(format!("log[{}]", log.display()), Duration::from_secs(60)),
    ]);
    config.agent.forward = ForwardMode::Connectors;
    config.connectors.workers = 2;
    config.connectors.endpoints = vec![
        EndpointConfig::new("logs", logs_address).with_key_filter("^log\\["),
        EndpointConfig::new("agent", agent_address).with_key_filter("^agent\\."),
    ];

    let handles = AgentBuilder::new(config).build().unwrap();
    wait_until(|| logs.lock().len() >= 2 && agent_items.lock().len() >= 2).await;
    handles.shutdown().await;

    let log_values: Vec<_> = logs.lock().iter().map(|i| i["value"].clone()).collect();
    assert_eq!(log_values, vec!["a", "b"]);

    let agent_keys: Vec<_> = agent_items.lock().iter().map(|i| i["key"].clone()).collect();
    assert_eq!(agent_keys.len(), 2);
    assert!(agent_keys.contains(&Value::from("agent.ping")));
    assert!(agent_keys.contains(&Value::from("agent.hostname")));
    assert_eq!(agent_items.lock()[0]["host"], "it-host");
}

#[tokio::test]
async fn test_connector_mode_worker_count_follows_reload() {
    let (address, items) = start_endpoint().await;
    let mut config = base_config(vec![MetricSpec::new("agent.ping", Duration::from_secs(1))]);
    config.agent.forward = ForwardMode::Connectors;
    config.connectors.workers = 0;
    config.connectors.endpoints = vec![EndpointConfig::new("main", address)];

    let handles = AgentBuilder::new(config).build().unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(items.lock().is_empty());

    handles.set_worker_count(1);
    wait_until(|| !items.lock().is_empty()).await;
    handles.shutdown().await;

    assert_eq!(items.lock()[0]["key"], "agent.ping");
}

#[tokio::test]
async fn test_connector_mode_shutdown_flushes_buffer() {
    let (address, items) = start_endpoint().await;
    let mut config = base_config(vec![MetricSpec::new("agent.ping", Duration::from_secs(60))]);
    config.agent.buffer_send = Duration::from_secs(60);
    config.agent.forward = ForwardMode::Connectors;
    config.connectors.workers = 2;
    config.connectors.endpoints = vec![EndpointConfig::new("main", address)];

    let handles = AgentBuilder::new(config).build().unwrap();
    let buffer = Arc::clone(&handles.buffer);
    wait_until(|| !buffer.is_empty()).await;
    assert!(items.lock().is_empty());

    handles.shutdown().await;
    wait_until(|| !items.lock().is_empty()).await;

    assert!(buffer.is_empty());
    assert_eq!(items.lock().len(), 1);
    assert_eq!(items.lock()[0]["key"], "agent.ping");
}

// =============================================================================
// Configuration
// =============================================================================

#[tokio::test]
async fn test_yaml_config_with_metric_path() {
    let (address, requests) = start_server(vec![]).await;
    let dir = tempfile::tempdir().unwrap();
    let metrics_dir = dir.path().join("metrics.d");
    std::fs::create_dir(&metrics_dir).unwrap();
    std::fs::write(
        metrics_dir.join("extra.yaml"),
        "metrics:\n  - key: agent.version\n    refresh: 30s\n",
    )
    .unwrap();

    let config_path = dir.path().join("agent.yaml");
    std::fs::write(
        &config_path,
        format!(
            r#"
agent:
  hostname: yaml-host
  buffer_send: 100ms
server:
  addresses: ["{address}"]
metrics:
  - key: agent.ping
    refresh: 10s
metric_path: "{}"
"#,
            metrics_dir.display()
        ),
    )
    .unwrap();

    let config = AppConfig::load_with_metric_path(&config_path).unwrap();
    assert_eq!(config.metrics.len(), 2);

    let handles = AgentBuilder::new(config).build().unwrap();
    wait_until(|| data_items(&requests.lock()).len() >= 2).await;
    handles.shutdown().await;

    let items = data_items(&requests.lock());
    assert!(items.iter().all(|i| i["host"] == "yaml-host"));
    assert!(items.iter().any(|i| i["value"] == env!("CARGO_PKG_VERSION")));
}
