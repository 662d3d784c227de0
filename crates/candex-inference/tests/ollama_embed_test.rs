//! HTTP-level tests for the Ollama embedding backend against a mock server.

#![cfg(feature = "ollama")]

use std::time::Duration;

use candex_core::{EmbeddingBackend, Error};
use candex_inference::{OllamaBackend, OllamaConfig};
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn backend_for(server: &MockServer, dimension: usize) -> OllamaBackend {
    OllamaBackend::new(
        OllamaConfig::default()
            .with_base_url(server.uri())
            .with_model("test-embed", dimension)
            .with_timeout(Duration::from_secs(5)),
    )
    .expect("Failed to create backend")
}

#[tokio::test]
async fn test_embed_posts_model_and_inputs() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .and(body_json(serde_json::json!({
            "model": "test-embed",
            "input": ["first", "second"]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "model": "test-embed",
            "embeddings": [[0.5, 0.25, 0.125], [0.75, 0.5, 0.25]]
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let backend = backend_for(&mock_server, 3);
    let vectors = backend
        .embed_texts(&["first".to_string(), "second".to_string()])
        .await
        .expect("embedding succeeds");

    assert_eq!(vectors.len(), 2);
    assert_eq!(vectors[1].as_slice(), &[0.75, 0.5, 0.25]);
}

#[tokio::test]
async fn test_server_error_maps_to_embedding_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(500).set_body_string("model not loaded"))
        .mount(&mock_server)
        .await;

    let backend = backend_for(&mock_server, 3);
    let err = backend
        .embed_texts(&["text".to_string()])
        .await
        .unwrap_err();

    match err {
        Error::Embedding(msg) => assert!(msg.contains("model not loaded"), "{msg}"),
        other => panic!("expected embedding error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_dimension_mismatch_is_rejected() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "embeddings": [[0.1, 0.2]]
        })))
        .mount(&mock_server)
        .await;

    let backend = backend_for(&mock_server, 3);
    let err = backend
        .embed_texts(&["text".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Embedding(ref m) if m.contains("Dimension mismatch")));
}

#[tokio::test]
async fn test_count_mismatch_is_rejected() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "embeddings": [[0.1, 0.2, 0.3]]
        })))
        .mount(&mock_server)
        .await;

    let backend = backend_for(&mock_server, 3);
    let err = backend
        .embed_texts(&["a".to_string(), "b".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Embedding(_)));
}
