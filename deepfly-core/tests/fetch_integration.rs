//! Integration tests for the artifact fetcher against a local HTTP server.

use axum::{Router, http::StatusCode, routing::get};
use deepfly_core::error::FetchError;
use deepfly_core::fetch::{ArtifactFetcher, FetchOutcome, NoProgress, ProgressReporter};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const PAYLOAD_LEN: usize = 300 * 1024;

fn payload() -> Vec<u8> {
    (0..PAYLOAD_LEN).map(|i| (i % 251) as u8).collect()
}

/// Serve `/weights.h5` and a 404 route; returns the address and a hit counter.
async fn spawn_server() -> (SocketAddr, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let app = Router::new()
        .route(
            "/weights.h5",
            get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    payload()
                }
            }),
        )
        .route("/missing.h5", get(|| async { StatusCode::NOT_FOUND }));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, hits)
}

#[derive(Default)]
struct Recording(Vec<(u64, Option<u64>)>);

impl ProgressReporter for Recording {
    fn on_progress(&mut self, downloaded: u64, total: Option<u64>) {
        self.0.push((downloaded, total));
    }
}

fn fetcher() -> ArtifactFetcher {
    ArtifactFetcher::new(Duration::from_secs(2)).unwrap()
}

#[tokio::test]
async fn test_download_writes_file_and_reports_progress() {
    let (addr, hits) = spawn_server().await;
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("nested").join("Meso4_DF.h5");

    let mut progress = Recording::default();
    let outcome = fetcher()
        .fetch(&format!("http://{addr}/weights.h5"), &dest, &mut progress)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        FetchOutcome::Downloaded {
            bytes: PAYLOAD_LEN as u64
        }
    );
    assert_eq!(std::fs::read(&dest).unwrap(), payload());
    assert!(!dir.path().join("nested").join("Meso4_DF.h5.part").exists());
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let (last, total) = *progress.0.last().unwrap();
    assert_eq!(last, PAYLOAD_LEN as u64);
    assert_eq!(total, Some(PAYLOAD_LEN as u64));
    assert!(progress.0.windows(2).all(|w| w[0].0 <= w[1].0));
}

#[tokio::test]
async fn test_second_fetch_makes_no_request() {
    let (addr, hits) = spawn_server().await;
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("Meso4_DF.h5");
    let url = format!("http://{addr}/weights.h5");

    let first = fetcher().fetch(&url, &dest, &mut NoProgress).await.unwrap();
    let second = fetcher().fetch(&url, &dest, &mut NoProgress).await.unwrap();

    assert!(matches!(first, FetchOutcome::Downloaded { .. }));
    assert_eq!(second, FetchOutcome::AlreadyPresent);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_http_error_leaves_no_file() {
    let (addr, _) = spawn_server().await;
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("Meso4_DF.h5");

    let err = fetcher()
        .fetch(&format!("http://{addr}/missing.h5"), &dest, &mut NoProgress)
        .await
        .unwrap_err();

    match err {
        FetchError::HttpStatus { status, .. } => assert_eq!(status, 404),
        other => panic!("Expected HttpStatus, got {other:?}"),
    }
    assert!(!dest.exists());
    assert!(!dir.path().join("Meso4_DF.h5.part").exists());
}

#[tokio::test]
async fn test_unreachable_url_fails_without_output() {
    // Grab a free port, then close it so nothing is listening.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("Meso4_DF.h5");

    let err = fetcher()
        .fetch(&format!("http://{addr}/weights.h5"), &dest, &mut NoProgress)
        .await
        .unwrap_err();

    assert!(err.is_network());
    assert!(!dest.exists());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}
