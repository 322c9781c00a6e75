use bytes::Bytes;
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

mod common;
use crate::common::*;

use ::common::error::CoreError;
use coord::core::client::{HttpConnector, NodeConnector, ObjectStore};
use coord::core::lock::LocalLockService;
use coord::core::meta::{KvDb, MetaStore};
use coord::core::node::StorageNode;
use coord::core::queue::DurableTaskQueue;
use coord::core::registry::NodeRegistry;
use coord::core::replication::ReplicationEngine;
use coord::core::routes::router;
use coord::core::state::CoordinatorState;

fn http_store(volume: &TestVolume, id: &str) -> Arc<dyn ObjectStore> {
    let connector = HttpConnector::new(reqwest::Client::new(), Duration::from_secs(2));
    connector.connect(&StorageNode::new(id, volume.url(), NODE_CAPACITY))
}

/// Coordinator state over real volume servers.
fn http_state(
    volumes: &[(String, &TestVolume)],
    dir: &TempDir,
) -> anyhow::Result<CoordinatorState> {
    let db: Arc<dyn MetaStore> = Arc::new(KvDb::open(&dir.path().join("index"))?);
    let registry = NodeRegistry::with_store(db.clone());
    for (id, volume) in volumes {
        registry.register(StorageNode::new(id.clone(), volume.url(), NODE_CAPACITY))?;
        registry.mark_online(id)?;
    }
    let cfg = test_config();
    let connector = HttpConnector::new(reqwest::Client::new(), cfg.rpc_timeout);
    Ok(CoordinatorState::new(
        cfg,
        db.clone(),
        registry,
        Arc::new(connector),
        Arc::new(LocalLockService::new()),
        Arc::new(DurableTaskQueue::new(db)),
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_http_object_store_round_trip() -> anyhow::Result<()> {
    let volume = TestVolume::new("v1").await?;
    let store = http_store(&volume, "v1");

    let payload = generate_random_bytes(4096);
    store.put("obj-1", Bytes::from(payload.clone())).await?;
    assert!(store.exists("obj-1").await?);
    assert_eq!(store.get("obj-1").await?.as_ref(), payload.as_slice());

    let health = store.health().await?;
    assert_eq!(health.node_id, "v1");
    assert_eq!(health.used_bytes, Some(4096));
    assert_eq!(health.file_count, Some(1));
    assert_eq!(health.capacity_bytes, Some(NODE_CAPACITY));

    store.delete("obj-1").await?;
    assert!(!store.exists("obj-1").await?);
    assert!(matches!(
        store.get("obj-1").await,
        Err(CoreError::ObjectNotFound)
    ));
    // deleting twice is fine
    store.delete("obj-1").await?;
    assert_eq!(store.health().await?.used_bytes, Some(0));

    volume.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_volume_fault_endpoints() -> anyhow::Result<()> {
    let volume = TestVolume::new("v1").await?;
    let store = http_store(&volume, "v1");
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/admin/fail/put?once=true", volume.url()))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::OK);

    let err = store
        .put("obj", Bytes::from_static(b"hello"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoreError::UpstreamStatus(StatusCode::INTERNAL_SERVER_ERROR)
    ));
    assert!(err.is_transient());
    store.put("obj", Bytes::from_static(b"hello")).await?;

    let resp = client
        .post(format!("{}/admin/fail/etag_mismatch?once=true", volume.url()))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(matches!(
        store.put("obj", Bytes::from_static(b"hello")).await,
        Err(CoreError::ChecksumMismatch)
    ));

    client
        .post(format!("{}/admin/kill", volume.url()))
        .send()
        .await?;
    let err = store.health().await.unwrap_err();
    assert!(err.is_transient());

    client
        .post(format!("{}/admin/reset", volume.url()))
        .send()
        .await?;
    assert_eq!(store.get("obj").await?.as_ref(), b"hello");

    volume.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fault_endpoints_hidden_by_default() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    ::common::file_utils::init_dirs(dir.path()).await?;
    let state = volume::state::VolumeState::new(dir.path().to_path_buf(), "v1");
    let server = TestServer::spawn(volume::routes::router(state)).await?;

    let resp = reqwest::Client::new()
        .post(format!("{}/admin/kill", server.url))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    server.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_upload_and_download_over_http() -> anyhow::Result<()> {
    let v1 = TestVolume::new("n1").await?;
    let v2 = TestVolume::new("n2").await?;
    let dir = TempDir::new()?;
    let state = http_state(&[("n1".into(), &v1), ("n2".into(), &v2)], &dir)?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let replication = tokio::spawn(ReplicationEngine::new(state.clone()).run(shutdown_rx));
    let coord = TestServer::spawn(router(state.clone())).await?;
    let client = reqwest::Client::new();

    let payload = unique_bytes("http", 2000);
    let resp = client
        .post(format!("{}/files", coord.url))
        .header("content-type", "application/pdf")
        .header("x-file-name", "report.pdf")
        .header("x-download-limit", "2")
        .body(payload.clone())
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let body: serde_json::Value = resp.json().await?;
    assert_eq!(body["duplicate"], false);
    let id = body["record"]["id"].as_str().unwrap_or_default().to_string();
    assert!(!id.is_empty());

    wait_until(5000, || async {
        let info: serde_json::Value = client
            .get(format!("{}/files/{}/info", coord.url, id))
            .send()
            .await?
            .json()
            .await?;
        Ok(info["replica_nodes"].as_array().map(|a| a.len()) == Some(1))
    })
    .await?;

    // same bytes again collapse onto the same record
    let resp = client
        .post(format!("{}/files", coord.url))
        .body(payload.clone())
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::OK);
    let dup: serde_json::Value = resp.json().await?;
    assert_eq!(dup["record"]["id"], id.as_str());

    for _ in 0..2 {
        let resp = client
            .get(format!("{}/files/{}", coord.url, id))
            .send()
            .await?;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()["x-checksum"].to_str()?,
            blake3_hex(&payload)
        );
        assert!(resp.headers().contains_key("x-served-by"));
        assert!(
            resp.headers()["content-disposition"]
                .to_str()?
                .contains("report.pdf")
        );
        assert_eq!(resp.bytes().await?.as_ref(), payload.as_slice());
    }

    let resp = client
        .get(format!("{}/files/{}", coord.url, id))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let resp = client
        .get(format!("{}/files/{}", coord.url, "missing"))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = client
        .post(format!("{}/files", coord.url))
        .header("x-download-limit", "many")
        .body("x")
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let nodes: serde_json::Value = client
        .get(format!("{}/admin/nodes", coord.url))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(nodes["online_nodes"], 2);

    let _ = shutdown_tx.send(true);
    replication.await??;
    coord.shutdown().await?;
    v1.shutdown().await?;
    v2.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_volume_registers_through_admin_route() -> anyhow::Result<()> {
    let v1 = TestVolume::new("n1").await?;
    let dir = TempDir::new()?;
    let state = http_state(&[("n1".into(), &v1)], &dir)?;
    let coord = TestServer::spawn(router(state.clone())).await?;

    let resp = reqwest::Client::new()
        .post(format!("{}/admin/nodes", coord.url))
        .json(&::common::schemas::RegisterNodeRequest {
            id: "n2".into(),
            endpoint: "http://127.0.0.1:9".into(),
            capacity_bytes: 42,
        })
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::CREATED);

    let node = state.registry.get("n2")?;
    assert_eq!(node.capacity_bytes, 42);
    assert!(!state.registry.is_online("n2"));
    assert!(state.store.list_nodes()?.iter().any(|n| n.id == "n2"));

    coord.shutdown().await?;
    v1.shutdown().await
}
