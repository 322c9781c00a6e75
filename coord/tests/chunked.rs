use bytes::Bytes;
use reqwest::StatusCode;

mod common;
use crate::common::*;

use ::common::error::CoreError;
use ::common::schemas::{CompleteUploadRequest, InitUploadRequest};
use coord::core::chunked::{SessionStatus, UploadSession};
use coord::core::expiry::ExpirySweeper;
use coord::core::meta::MetaStore;
use coord::core::routes::router;

fn open_session(cluster: &TestCluster, size: usize, chunk: u64) -> anyhow::Result<UploadSession> {
    Ok(cluster.state.chunked_uploads().init(InitUploadRequest {
        original_name: Some("video.bin".into()),
        mime_type: Some("application/octet-stream".into()),
        size: size as u64,
        chunk_size: Some(chunk),
    })?)
}

fn send_part(
    cluster: &TestCluster,
    session: &UploadSession,
    payload: &[u8],
    number: u32,
) -> Result<UploadSession, CoreError> {
    let start = (number as u64 - 1) * session.chunk_size;
    let end = (start + session.chunk_size).min(payload.len() as u64);
    let part = &payload[start as usize..end as usize];
    cluster.state.chunked_uploads().upload_part(
        &session.id,
        number,
        Bytes::copy_from_slice(part),
        Some(&blake3_hex(part)),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_parts_assemble_into_one_file() -> anyhow::Result<()> {
    let mut cluster = TestCluster::new(2)?;
    cluster.start_workers();
    let payload = unique_bytes("chunked", 2500);
    let session = open_session(&cluster, payload.len(), 1000)?;
    assert_eq!(session.parts_expected, 3);

    // out of order is fine
    for number in [3, 1, 2] {
        send_part(&cluster, &session, &payload, number)?;
    }
    let progress = cluster.state.chunked_uploads().status(&session.id)?;
    assert_eq!(progress.received(), 3);
    assert_eq!(progress.received_bytes(), payload.len() as u64);

    let outcome = cluster
        .state
        .chunked_uploads()
        .complete(
            &session.id,
            CompleteUploadRequest {
                checksum: Some(blake3_hex(&payload)),
                download_limit: Some(2),
                ttl_seconds: None,
            },
        )
        .await?;
    assert!(!outcome.duplicate);
    let record = outcome.record;
    assert_eq!(record.size_bytes, payload.len() as u64);
    assert_eq!(record.checksum, blake3_hex(&payload));
    assert_eq!(record.original_name, "video.bin");
    assert_eq!(record.download_limit, 2);

    let download = cluster.placement().resolve_download(&record.id).await?;
    assert_eq!(download.content.as_ref(), payload.as_slice());

    // the session and its parts are gone
    assert!(cluster.state.store.get_upload_session(&session.id)?.is_none());
    assert!(cluster.state.store.get_upload_part(&session.id, 1)?.is_none());

    cluster.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_corrupt_part_is_rejected() -> anyhow::Result<()> {
    let cluster = TestCluster::new(2)?;
    let payload = unique_bytes("torn", 1500);
    let session = open_session(&cluster, payload.len(), 1000)?;

    let err = cluster
        .state
        .chunked_uploads()
        .upload_part(
            &session.id,
            1,
            Bytes::copy_from_slice(&payload[..1000]),
            Some(&blake3_hex(b"something else")),
        )
        .unwrap_err();
    assert!(matches!(err, CoreError::ChecksumMismatch));
    assert_eq!(cluster.state.chunked_uploads().status(&session.id)?.received(), 0);
    assert!(cluster.state.store.get_upload_part(&session.id, 1)?.is_none());

    // without a claimed checksum the part is taken as sent
    let session_after = cluster.state.chunked_uploads().upload_part(
        &session.id,
        1,
        Bytes::copy_from_slice(&payload[..1000]),
        None,
    )?;
    assert_eq!(session_after.parts[&1].checksum, blake3_hex(&payload[..1000]));

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_part_numbers_and_sizes_are_checked() -> anyhow::Result<()> {
    let cluster = TestCluster::new(2)?;
    let uploads = cluster.state.chunked_uploads();
    let session = open_session(&cluster, 2500, 1000)?;

    for (number, len) in [(0u32, 1000usize), (4, 500), (1, 999), (3, 1000), (2, 0)] {
        let res = uploads.upload_part(&session.id, number, Bytes::from(vec![7u8; len]), None);
        assert!(
            matches!(res, Err(CoreError::InvalidInput(_))),
            "part {number} of {len} bytes accepted"
        );
    }
    uploads.upload_part(&session.id, 3, Bytes::from(vec![7u8; 500]), None)?;

    let bad_init = [
        InitUploadRequest {
            size: 0,
            ..InitUploadRequest::default()
        },
        InitUploadRequest {
            size: cluster.state.cfg.max_upload_bytes + 1,
            ..InitUploadRequest::default()
        },
        InitUploadRequest {
            size: 10,
            chunk_size: Some(0),
            ..InitUploadRequest::default()
        },
        InitUploadRequest {
            size: cluster.state.cfg.max_upload_bytes,
            chunk_size: Some(1),
            ..InitUploadRequest::default()
        },
    ];
    for req in bad_init {
        assert!(matches!(uploads.init(req), Err(CoreError::InvalidInput(_))));
    }

    assert!(matches!(
        uploads.upload_part("no-such-upload", 1, Bytes::from_static(b"x"), None),
        Err(CoreError::NotFound)
    ));

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_complete_needs_every_part() -> anyhow::Result<()> {
    let cluster = TestCluster::new(2)?;
    let payload = unique_bytes("gaps", 2500);
    let session = open_session(&cluster, payload.len(), 1000)?;
    send_part(&cluster, &session, &payload, 1)?;
    send_part(&cluster, &session, &payload, 3)?;

    let err = cluster
        .state
        .chunked_uploads()
        .complete(&session.id, CompleteUploadRequest::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Conflict(ref msg) if msg.contains("[2]")));
    assert_eq!(
        cluster.state.chunked_uploads().status(&session.id)?.status,
        SessionStatus::Open
    );
    assert!(cluster.state.store.list_file_records()?.is_empty());

    send_part(&cluster, &session, &payload, 2)?;
    let outcome = cluster
        .state
        .chunked_uploads()
        .complete(&session.id, CompleteUploadRequest::default())
        .await?;
    assert_eq!(outcome.record.checksum, blake3_hex(&payload));

    // a finished session cannot be completed twice
    assert!(matches!(
        cluster
            .state
            .chunked_uploads()
            .complete(&session.id, CompleteUploadRequest::default())
            .await,
        Err(CoreError::NotFound)
    ));

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_final_checksum_mismatch_reopens_session() -> anyhow::Result<()> {
    let cluster = TestCluster::new(2)?;
    let payload = unique_bytes("whole", 1800);
    let session = open_session(&cluster, payload.len(), 1000)?;
    send_part(&cluster, &session, &payload, 1)?;
    send_part(&cluster, &session, &payload, 2)?;

    let err = cluster
        .state
        .chunked_uploads()
        .complete(
            &session.id,
            CompleteUploadRequest {
                checksum: Some(blake3_hex(b"not the file")),
                ..CompleteUploadRequest::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ChecksumMismatch));
    assert!(cluster.state.store.list_file_records()?.is_empty());
    for store in &cluster.stores {
        assert_eq!(store.object_count(), 0);
    }

    // the session stays usable and accepts parts again
    let session = send_part(&cluster, &session, &payload, 2)?;
    assert_eq!(session.status, SessionStatus::Open);
    let outcome = cluster
        .state
        .chunked_uploads()
        .complete(
            &session.id,
            CompleteUploadRequest {
                checksum: Some(blake3_hex(&payload)),
                ..CompleteUploadRequest::default()
            },
        )
        .await?;
    assert_eq!(outcome.record.size_bytes, 1800);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_chunked_copy_of_stored_content_is_deduplicated() -> anyhow::Result<()> {
    let cluster = TestCluster::new(2)?;
    let payload = unique_bytes("twice", 1200);
    let first = cluster.upload(&payload, 3).await?;

    let session = open_session(&cluster, payload.len(), 1000)?;
    send_part(&cluster, &session, &payload, 1)?;
    send_part(&cluster, &session, &payload, 2)?;
    let outcome = cluster
        .state
        .chunked_uploads()
        .complete(&session.id, CompleteUploadRequest::default())
        .await?;

    assert!(outcome.duplicate);
    assert_eq!(outcome.record.id, first.id);
    assert!(cluster.state.store.get_upload_session(&session.id)?.is_none());

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stale_sessions_are_swept() -> anyhow::Result<()> {
    let cluster = TestCluster::new(2)?;
    let payload = unique_bytes("stale", 1500);
    let stale = open_session(&cluster, payload.len(), 1000)?;
    let live = open_session(&cluster, payload.len(), 1000)?;
    send_part(&cluster, &stale, &payload, 1)?;

    cluster.state.store.update_upload_session(&stale.id, &mut |s| {
        s.expires_at_ms = s.created_at_ms - 1;
        Ok(())
    })?;
    assert!(matches!(
        send_part(&cluster, &stale, &payload, 2),
        Err(CoreError::Expired)
    ));

    let report = ExpirySweeper::new(cluster.state.clone()).sweep_once().await?;
    assert_eq!(report.stale_uploads, 1);
    assert!(cluster.state.store.get_upload_session(&stale.id)?.is_none());
    assert!(cluster.state.store.get_upload_part(&stale.id, 1)?.is_none());
    assert!(cluster.state.chunked_uploads().status(&live.id).is_ok());

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_chunked_upload_over_http() -> anyhow::Result<()> {
    let cluster = TestCluster::new(2)?;
    let coord = TestServer::spawn(router(cluster.state.clone())).await?;
    let client = reqwest::Client::new();
    let payload = unique_bytes("wire", 2100);

    let resp = client
        .post(format!("{}/uploads", coord.url))
        .json(&InitUploadRequest {
            original_name: Some("notes.txt".into()),
            mime_type: Some("text/plain".into()),
            size: payload.len() as u64,
            chunk_size: Some(1024),
        })
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let session: UploadSession = resp.json().await?;
    assert_eq!(session.parts_expected, 3);

    for (i, part) in payload.chunks(1024).enumerate() {
        let resp = client
            .put(format!("{}/uploads/{}/parts/{}", coord.url, session.id, i + 1))
            .header("x-checksum", blake3_hex(part))
            .body(part.to_vec())
            .send()
            .await?;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    let resp = client
        .put(format!("{}/uploads/{}/parts/1", coord.url, session.id))
        .header("x-checksum", "0000")
        .body(payload[..1024].to_vec())
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let status: UploadSession = client
        .get(format!("{}/uploads/{}", coord.url, session.id))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(status.received(), 3);

    let resp = client
        .post(format!("{}/uploads/{}/complete", coord.url, session.id))
        .json(&CompleteUploadRequest {
            checksum: Some(blake3_hex(&payload)),
            ..CompleteUploadRequest::default()
        })
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let body: serde_json::Value = resp.json().await?;
    let id = body["record"]["id"].as_str().unwrap_or_default().to_string();

    let resp = client.get(format!("{}/files/{}", coord.url, id)).send().await?;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.bytes().await?.as_ref(), payload.as_slice());

    // an abandoned session can be dropped explicitly
    let other = open_session(&cluster, 10, 5)?;
    let resp = client
        .delete(format!("{}/uploads/{}", coord.url, other.id))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    let resp = client
        .get(format!("{}/uploads/{}", coord.url, other.id))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    coord.shutdown().await
}
