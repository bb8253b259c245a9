//! Integration tests for the `/` and `/predict` HTTP endpoints.

use axum::body::Body;
use deepfly_core::ChannelOrder;
use deepfly_ml::inference::{AppState, ModelHandle, ModelState, SharedState, router};
use deepfly_ml::nn::{Architecture, INPUT_CHANNELS, INPUT_SIZE, Network, save_safetensors};
use image::{ImageFormat, RgbImage};
use ndarray::Array4;
use std::io::Cursor;
use std::sync::Arc;
use tower::ServiceExt;

const BOUNDARY: &str = "deepfly-test-boundary";
const UPLOAD_LIMIT: usize = 20 * 1024 * 1024;

fn loaded(network: Network) -> SharedState {
    let handle = ModelHandle::new(network, "memory");
    Arc::new(AppState::new(ModelState::Loaded(handle), ChannelOrder::Bgr))
}

fn unavailable() -> SharedState {
    Arc::new(AppState::new(
        ModelState::Unavailable {
            reason: "weights file 'Meso4_DF.safetensors' not found".into(),
        },
        ChannelOrder::Bgr,
    ))
}

fn black_png(size: u32) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    RgbImage::new(size, size)
        .write_to(&mut buf, ImageFormat::Png)
        .unwrap();
    buf.into_inner()
}

/// `(field name, filename, bytes)` parts encoded as multipart/form-data.
fn multipart_body(parts: &[(&str, Option<&str>, &[u8])]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, filename, data) in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        let disposition = match filename {
            Some(f) => format!("Content-Disposition: form-data; name=\"{name}\"; filename=\"{f}\"\r\n"),
            None => format!("Content-Disposition: form-data; name=\"{name}\"\r\n"),
        };
        body.extend_from_slice(disposition.as_bytes());
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

async fn post_predict(
    state: SharedState,
    parts: &[(&str, Option<&str>, &[u8])],
) -> (axum::http::StatusCode, serde_json::Value) {
    post_predict_limited(state, parts, UPLOAD_LIMIT).await
}

async fn post_predict_limited(
    state: SharedState,
    parts: &[(&str, Option<&str>, &[u8])],
    limit: usize,
) -> (axum::http::StatusCode, serde_json::Value) {
    let req = axum::http::Request::builder()
        .method("POST")
        .uri("/predict")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(multipart_body(parts)))
        .unwrap();
    let resp = ServiceExt::<axum::http::Request<Body>>::oneshot(router(state, limit), req)
        .await
        .unwrap();
    let status = resp.status();
    let body = axum::body::to_bytes(resp.into_body(), 100_000)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

// --- /predict success ---

#[tokio::test]
async fn test_black_image_with_zero_weights_scores_fifty() {
    let png = black_png(512);
    let (status, json) = post_predict(
        loaded(Network::new(Architecture::Meso4)),
        &[("file", Some("black.png"), png.as_slice())],
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(json["score"], 50);
    assert_eq!(json["metrics"], serde_json::json!({}));
}

#[tokio::test]
async fn test_score_matches_direct_forward_pass() {
    let network = Network::random(Architecture::Meso4, 21);
    let zeros = Array4::zeros((1, INPUT_SIZE, INPUT_SIZE, INPUT_CHANNELS));
    let p = network.forward(&zeros).unwrap()[0].fake_probability();
    let expected = (p * 100.0).floor() as u64;

    let png = black_png(512);
    let (status, json) =
        post_predict(loaded(network), &[("file", Some("face.png"), png.as_slice())]).await;
    assert_eq!(status, 200);
    assert_eq!(json["score"].as_u64().unwrap(), expected);
}

#[tokio::test]
async fn test_pair_model_scores_fake_column() {
    let png = black_png(64);
    let (status, json) = post_predict(
        loaded(Network::new(Architecture::Meso4Pair)),
        &[("file", Some("face.png"), png.as_slice())],
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(json["score"], 50);
}

#[tokio::test]
async fn test_other_fields_are_ignored() {
    let png = black_png(32);
    let (status, _) = post_predict(
        loaded(Network::new(Architecture::Meso4)),
        &[("note", None, &b"hello"[..]), ("file", Some("a.png"), png.as_slice())],
    )
    .await;
    assert_eq!(status, 200);
}

#[tokio::test]
async fn test_weights_loaded_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("Meso4_DF.safetensors");
    save_safetensors(&Network::new(Architecture::Meso4), &path).unwrap();

    let state = Arc::new(AppState::new(
        ModelState::load(&path, None),
        ChannelOrder::Bgr,
    ));
    let png = black_png(256);
    let (status, json) = post_predict(state, &[("file", Some("x.png"), png.as_slice())]).await;
    assert_eq!(status, 200);
    assert_eq!(json["score"], 50);
}

// --- /predict client errors ---

#[tokio::test]
async fn test_missing_file_part() {
    let (status, json) = post_predict(
        loaded(Network::new(Architecture::Meso4)),
        &[("image", Some("x.png"), &b"bytes"[..])],
    )
    .await;
    assert_eq!(status, 400);
    assert_eq!(json["error"], "No file part");
}

#[tokio::test]
async fn test_empty_filename() {
    let png = black_png(8);
    let (status, json) = post_predict(
        loaded(Network::new(Architecture::Meso4)),
        &[("file", Some(""), png.as_slice())],
    )
    .await;
    assert_eq!(status, 400);
    assert_eq!(json["error"], "No selected file");
}

#[tokio::test]
async fn test_duplicate_file_parts() {
    let png = black_png(8);
    let (status, _) = post_predict(
        loaded(Network::new(Architecture::Meso4)),
        &[("file", Some("a.png"), png.as_slice()), ("file", Some("b.png"), png.as_slice())],
    )
    .await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn test_oversized_upload_is_payload_too_large() {
    let oversized = vec![0u8; 2048];
    let (status, json) = post_predict_limited(
        loaded(Network::new(Architecture::Meso4)),
        &[("file", Some("big.png"), oversized.as_slice())],
        1024,
    )
    .await;
    assert_eq!(status, 413);
    assert!(json["error"].as_str().unwrap().starts_with("Invalid upload"));
}

// --- /predict server errors ---

#[tokio::test]
async fn test_undecodable_upload_is_server_error() {
    let (status, json) = post_predict(
        loaded(Network::new(Architecture::Meso4)),
        &[("file", Some("notes.txt"), &b"plain text, not pixels"[..])],
    )
    .await;
    assert_eq!(status, 500);
    assert!(json["error"].as_str().unwrap().contains("decode"));
}

#[tokio::test]
async fn test_unloaded_model_fails_every_request() {
    let state = unavailable();
    let png = black_png(16);
    for _ in 0..3 {
        let (status, json) =
            post_predict(state.clone(), &[("file", Some("a.png"), png.as_slice())]).await;
        assert_eq!(status, 500);
        assert!(
            json["error"]
                .as_str()
                .unwrap()
                .starts_with("AI model is not loaded")
        );
    }
}

#[tokio::test]
async fn test_unloaded_model_still_healthy() {
    let req = axum::http::Request::builder()
        .uri("/")
        .body(Body::empty())
        .unwrap();
    let resp = ServiceExt::<axum::http::Request<Body>>::oneshot(router(unavailable(), UPLOAD_LIMIT), req)
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body = axum::body::to_bytes(resp.into_body(), 10_000)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["model_loaded"], false);
    assert_eq!(json["message"], "DeepFly MesoNet server is running");
}
