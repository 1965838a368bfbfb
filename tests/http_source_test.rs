// HttpSource against a local fake content-delivery server.

mod common;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use bundle_engine::config::{EngineConfig, PlatformTarget};
use bundle_engine::source::http_source::HttpSource;
use bundle_engine::source::traits::{BundleRequest, BundleSource, FetchResponse, SourceError};
use bundle_engine::{BundleError, BundleManager, BundleOrigin};

use common::{config, hash_for, manifest_json, payload_for, TARGET};

#[derive(Default)]
struct Cdn {
    files: Mutex<HashMap<String, Vec<u8>>>,
    failing: Mutex<HashSet<String>>,
    requests: AtomicUsize,
    not_modified: AtomicUsize,
}

impl Cdn {
    fn with_bundles(bundles: &[(&str, &[&str])]) -> Arc<Self> {
        let cdn = Arc::new(Cdn::default());
        {
            let mut files = cdn.files.lock();
            files.insert(
                format!("{}.manifest.json", TARGET),
                manifest_json(bundles).into_bytes(),
            );
            for (name, _) in bundles {
                files.insert(name.to_string(), payload_for(name).to_vec());
            }
        }
        cdn
    }
}

#[derive(Deserialize)]
struct EntryQuery {
    path: String,
}

async fn serve_entry(
    State(cdn): State<Arc<Cdn>>,
    Path((environment, bucket, version)): Path<(String, String, u32)>,
    Query(query): Query<EntryQuery>,
    headers: HeaderMap,
) -> Response {
    cdn.requests.fetch_add(1, Ordering::SeqCst);
    if environment != "production" || bucket != "bucket-1" || version != 1 {
        return StatusCode::NOT_FOUND.into_response();
    }
    if cdn.failing.lock().contains(&query.path) {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    let Some(body) = cdn.files.lock().get(&query.path).cloned() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let etag = format!("\"{}\"", hash_for(&query.path));
    let matches = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == etag)
        .unwrap_or(false);
    if matches {
        cdn.not_modified.fetch_add(1, Ordering::SeqCst);
        return (StatusCode::NOT_MODIFIED, [(header::ETAG, etag)]).into_response();
    }

    (StatusCode::OK, [(header::ETAG, etag)], body).into_response()
}

async fn start_server(cdn: Arc<Cdn>) -> SocketAddr {
    let app = Router::new()
        .route(
            "/environments/{environment}/buckets/{bucket}/release_by_badge/{version}/entry_by_path/content/",
            get(serve_entry),
        )
        .with_state(cdn);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn http_config(addr: SocketAddr) -> EngineConfig {
    EngineConfig {
        cdn_url: format!("http://{}", addr),
        ..config(2)
    }
}

fn target() -> PlatformTarget {
    PlatformTarget {
        name: TARGET.to_string(),
        bucket: "bucket-1".to_string(),
    }
}

#[tokio::test]
async fn test_http_source_fetches_manifest_and_bundle() {
    let cdn = Cdn::with_bundles(&[("A", &[])]);
    let addr = start_server(cdn.clone()).await;
    let source = HttpSource::new(http_config(addr)).unwrap();

    let manifest = source.fetch_manifest(&target()).await.unwrap();
    assert_eq!(manifest, manifest_json(&[("A", &[])]).into_bytes());

    let progress = Mutex::new(Vec::new());
    let target = target();
    let request = BundleRequest {
        target: &target,
        name: "A",
        hash: hash_for("A"),
        if_none_match: None,
    };
    let response = source
        .fetch_bundle(&request, &|received, total| {
            progress.lock().push((received, total))
        })
        .await
        .unwrap();

    match response {
        FetchResponse::Content(body) => assert_eq!(body, payload_for("A")),
        FetchResponse::NotModified => panic!("unexpected not-modified"),
    }
    let total = payload_for("A").len() as u64;
    assert_eq!(progress.lock().last().copied(), Some((total, Some(total))));
}

#[tokio::test]
async fn test_http_source_conditional_and_errors() {
    let cdn = Cdn::with_bundles(&[("A", &[])]);
    cdn.failing.lock().insert("broken".to_string());
    let addr = start_server(cdn.clone()).await;
    let source = HttpSource::new(http_config(addr)).unwrap();
    let target = target();

    let conditional = BundleRequest {
        target: &target,
        name: "A",
        hash: hash_for("A"),
        if_none_match: Some(hash_for("A")),
    };
    assert!(matches!(
        source.fetch_bundle(&conditional, &|_, _| {}).await,
        Ok(FetchResponse::NotModified)
    ));

    let broken = BundleRequest {
        name: "broken",
        if_none_match: None,
        ..conditional
    };
    let err = source.fetch_bundle(&broken, &|_, _| {}).await.unwrap_err();
    assert_eq!(err, SourceError::Status(500));
    assert!(err.is_retryable());

    let missing = BundleRequest {
        name: "missing",
        ..broken
    };
    let err = source.fetch_bundle(&missing, &|_, _| {}).await.unwrap_err();
    assert_eq!(err.status_code(), 404);
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_manager_over_http() {
    let cdn = Cdn::with_bundles(&[("A", &[]), ("B", &["A"])]);
    let addr = start_server(cdn.clone()).await;
    let manager = BundleManager::from_config(http_config(addr)).unwrap();

    let b = manager.ensure_ready("B").await.unwrap();
    assert_eq!(b.payload, payload_for("B"));
    assert_eq!(manager.try_get_loaded("A").unwrap().payload, payload_for("A"));
    // Manifest plus two bundles.
    assert_eq!(cdn.requests.load(Ordering::SeqCst), 3);
    assert_eq!(manager.stats().downloaded_bytes, (payload_for("A").len() + payload_for("B").len()) as u64);
}

#[tokio::test]
async fn test_conditional_transfer_reuses_local_copy() {
    let cdn = Cdn::with_bundles(&[("A", &[])]);
    let addr = start_server(cdn.clone()).await;
    let copies = tempfile::tempdir().unwrap();

    let mut cfg = http_config(addr);
    cfg.keep_local_fallback_copy = true;
    cfg.local_copy_dir = Some(copies.path().to_path_buf());
    let manager = BundleManager::from_config(cfg).unwrap();

    let first = manager.ensure_ready("A").await.unwrap();
    assert_eq!(first.origin, BundleOrigin::Network);
    let kept = copies.path().join(hash_for("A").to_string()).join("A");
    assert_eq!(std::fs::read(&kept).unwrap(), payload_for("A").to_vec());

    manager.clear_cache();
    let second = manager.ensure_ready("A").await.unwrap();
    assert_eq!(second.origin, BundleOrigin::NotModified);
    assert_eq!(second.payload, payload_for("A"));
    assert_eq!(cdn.not_modified.load(Ordering::SeqCst), 1);
    assert_eq!(manager.stats().not_modified, 1);
    assert_eq!(manager.record("A").unwrap().last_status_code, 304);
}

#[tokio::test]
async fn test_server_error_falls_back_to_packaged_copy() {
    let cdn = Cdn::with_bundles(&[("A", &[])]);
    cdn.failing.lock().insert("A".to_string());
    let addr = start_server(cdn.clone()).await;
    let packaged = tempfile::tempdir().unwrap();
    std::fs::write(packaged.path().join("A"), b"shipped").unwrap();

    let mut cfg = http_config(addr);
    cfg.fallback_dir = Some(packaged.path().to_path_buf());
    let manager = BundleManager::from_config(cfg).unwrap();

    let a = manager.ensure_ready("A").await.unwrap();
    assert_eq!(a.origin, BundleOrigin::LocalFallback);
    assert_eq!(a.payload.as_ref(), b"shipped");
    assert_eq!(manager.record("A").unwrap().last_status_code, 500);
}

#[tokio::test]
async fn test_unreachable_server_reports_status_zero() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    // Catalog from the authoring tree so only the bundle transfer hits the network.
    let authoring = tempfile::tempdir().unwrap();
    std::fs::write(
        authoring.path().join(target().manifest_file_name()),
        manifest_json(&[("A", &[])]),
    )
    .unwrap();

    let mut cfg = http_config(addr);
    cfg.use_local_authoring_source_if_available = true;
    cfg.authoring_dir = Some(authoring.path().to_path_buf());
    let manager = BundleManager::from_config(cfg).unwrap();

    assert_eq!(
        manager.ensure_ready("A").await.unwrap_err(),
        BundleError::RetrievalFailed {
            name: "A".into(),
            status: 0
        }
    );
}

#[tokio::test]
async fn test_missing_manifest_over_http() {
    let cdn = Arc::new(Cdn::default());
    let addr = start_server(cdn).await;
    let manager = BundleManager::from_config(http_config(addr)).unwrap();

    assert!(matches!(
        manager.init().await,
        Err(BundleError::ManifestUnavailable(_))
    ));
}

/// Serve exactly one connection with a canned raw HTTP response.
async fn start_raw_server(response: Vec<u8>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut request = vec![0u8; 4096];
        let _ = stream.read(&mut request).await;
        let _ = stream.write_all(&response).await;
        let _ = stream.shutdown().await;
    });
    addr
}

fn plain_request(target: &PlatformTarget) -> BundleRequest<'_> {
    BundleRequest {
        target,
        name: "A",
        hash: hash_for("A"),
        if_none_match: None,
    }
}

#[tokio::test]
async fn test_declared_length_over_limit_is_rejected() {
    let addr = start_raw_server(
        b"HTTP/1.1 200 OK\r\nContent-Length: 900000000000000\r\n\r\nabc".to_vec(),
    )
    .await;
    let source = HttpSource::new(http_config(addr)).unwrap();
    let target = target();

    let err = source
        .fetch_bundle(&plain_request(&target), &|_, _| {})
        .await
        .unwrap_err();
    assert_eq!(
        err,
        SourceError::TooLarge {
            size: 900_000_000_000_000,
            limit: bundle_engine::config::MAX_BUNDLE_BYTES,
        }
    );
    assert_eq!(err.status_code(), 0);
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_streamed_body_over_limit_is_rejected() {
    let mut response = b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n".to_vec();
    response.extend_from_slice(&[7u8; 64]);
    let addr = start_raw_server(response).await;

    let mut cfg = http_config(addr);
    cfg.max_bundle_bytes = 16;
    let source = HttpSource::new(cfg).unwrap();
    let target = target();

    let err = source
        .fetch_bundle(&plain_request(&target), &|_, _| {})
        .await
        .unwrap_err();
    assert!(
        matches!(err, SourceError::TooLarge { size, limit: 16 } if size > 16),
        "{:?}",
        err
    );
}

#[tokio::test]
async fn test_oversized_bundle_falls_back_to_packaged_copy() {
    let addr = start_raw_server(
        b"HTTP/1.1 200 OK\r\nContent-Length: 900000000000000\r\n\r\nabc".to_vec(),
    )
    .await;
    let dirs = tempfile::tempdir().unwrap();
    let authoring = dirs.path().join("authoring");
    let packaged = dirs.path().join("packaged");
    std::fs::create_dir_all(&authoring).unwrap();
    std::fs::create_dir_all(&packaged).unwrap();
    std::fs::write(
        authoring.join(target().manifest_file_name()),
        manifest_json(&[("A", &[])]),
    )
    .unwrap();
    std::fs::write(packaged.join("A"), b"shipped").unwrap();

    let mut cfg = http_config(addr);
    cfg.use_local_authoring_source_if_available = true;
    cfg.authoring_dir = Some(authoring);
    cfg.fallback_dir = Some(packaged);
    let manager = BundleManager::from_config(cfg).unwrap();

    let a = manager.ensure_ready("A").await.unwrap();
    assert_eq!(a.origin, BundleOrigin::LocalFallback);
    assert_eq!(a.payload.as_ref(), b"shipped");
}

#[tokio::test]
async fn test_reserved_characters_in_bundle_name() {
    let tricky = "props&x=1#v2?q";
    let cdn = Cdn::with_bundles(&[(tricky, &[]), ("props", &[])]);
    let addr = start_server(cdn.clone()).await;
    let source = HttpSource::new(http_config(addr)).unwrap();
    let target = target();

    let request = BundleRequest {
        name: tricky,
        hash: hash_for(tricky),
        ..plain_request(&target)
    };
    match source.fetch_bundle(&request, &|_, _| {}).await.unwrap() {
        FetchResponse::Content(body) => assert_eq!(body, payload_for(tricky)),
        FetchResponse::NotModified => panic!("unexpected not-modified"),
    }
}
