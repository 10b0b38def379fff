//! HttpContentStore against a local warp server

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use feeddoc::feed::{ContentHash, ContentStore, ContentStoreSource, HttpContentStore};
use feeddoc::FeedError;
use sha2::{Digest, Sha256};
use warp::http::{Response, StatusCode};
use warp::Filter;

type Blobs = Arc<Mutex<HashMap<String, Vec<u8>>>>;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Serve the raw bytes API. With `honest == false` every upload answers
/// with the same bogus reference.
fn spawn_store(honest: bool) -> (SocketAddr, Blobs) {
    let blobs: Blobs = Arc::new(Mutex::new(HashMap::new()));

    let upload = warp::path("bytes")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::bytes())
        .map({
            let blobs = blobs.clone();
            move |body: bytes::Bytes| {
                let hash = if honest {
                    hex::encode(Sha256::digest(&body))
                } else {
                    hex::encode([0u8; 32])
                };
                blobs.lock().unwrap().insert(hash.clone(), body.to_vec());
                warp::reply::json(&serde_json::json!({ "reference": hash }))
            }
        });

    let download = warp::path!("bytes" / String).and(warp::get()).map({
        let blobs = blobs.clone();
        move |hash: String| match blobs.lock().unwrap().get(&hash) {
            Some(data) => Response::builder().status(StatusCode::OK).body(data.clone()),
            None => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Vec::new()),
        }
    });

    let broken = warp::path!("broken" / "bytes" / ..).map(|| {
        warp::reply::with_status("storage offline", StatusCode::SERVICE_UNAVAILABLE)
    });

    let (addr, server) =
        warp::serve(upload.or(download).or(broken)).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    (addr, blobs)
}

#[tokio::test]
async fn test_upload_then_download() {
    init_logging();
    let (addr, blobs) = spawn_store(true);
    let store = HttpContentStore::new(&format!("http://{}/", addr)).unwrap();

    let hash = store.upload(b"over the wire").await.unwrap();
    assert_eq!(hash, ContentHash::of(b"over the wire"));
    assert_eq!(store.upload(b"over the wire").await.unwrap(), hash);
    assert_eq!(blobs.lock().unwrap().len(), 1);

    assert_eq!(store.download(&hash).await.unwrap(), b"over the wire");
}

#[tokio::test]
async fn test_missing_blob_is_not_found() {
    let (addr, _) = spawn_store(true);
    let store = ContentStoreSource::Http {
        url: format!("http://{}", addr),
    }
    .resolve()
    .unwrap();

    let err = store.download(&ContentHash::of(b"absent")).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_server_errors_keep_status() {
    let (addr, _) = spawn_store(true);
    let store = HttpContentStore::new(&format!("http://{}/broken", addr)).unwrap();

    let err = store.download(&ContentHash::of(b"x")).await.unwrap_err();
    match &err {
        FeedError::Transport { status, message } => {
            assert_eq!(*status, Some(503));
            assert_eq!(message, "storage offline");
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_mismatched_reference_is_rejected() {
    let (addr, _) = spawn_store(false);
    let store = HttpContentStore::new(&format!("http://{}", addr)).unwrap();

    let err = store.upload(b"data").await.unwrap_err();
    assert!(matches!(err, FeedError::Transport { status: None, .. }));
}
