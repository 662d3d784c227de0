//! Mock embedding backend for deterministic testing.
//!
//! Vectors are derived from the input text, so the same text always yields
//! the same unit vector. Failures can be injected for every call or for
//! inputs containing a marker substring.
//!
//! ```rust,ignore
//! use candex_inference::MockEmbeddingBackend;
//!
//! let backend = MockEmbeddingBackend::new()
//!     .with_dimension(8)
//!     .with_failure_on("POISON");
//! ```

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::time::Duration;

use candex_core::{EmbeddingBackend, Error, Result, Vector};

/// Configuration for mock backend behavior.
#[derive(Debug, Clone)]
pub struct MockConfig {
    /// Embedding dimension.
    pub dimension: usize,
    /// Model name reported to callers.
    pub model: String,
    /// Simulated latency per call.
    pub latency_ms: u64,
    /// Fail every call.
    pub fail_all: bool,
    /// Fail any call where an input contains this marker.
    pub fail_on: Option<String>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            dimension: 16,
            model: "mock-embed".to_string(),
            latency_ms: 0,
            fail_all: false,
            fail_on: None,
        }
    }
}

/// Record of a call made to the mock.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub inputs: Vec<String>,
    pub timestamp: std::time::Instant,
}

/// Deterministic in-process embedding backend.
#[derive(Clone)]
pub struct MockEmbeddingBackend {
    config: Arc<MockConfig>,
    call_log: Arc<Mutex<Vec<MockCall>>>,
}

impl MockEmbeddingBackend {
    /// Create a new mock backend with default configuration.
    pub fn new() -> Self {
        Self {
            config: Arc::new(MockConfig::default()),
            call_log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Set the embedding dimension.
    pub fn with_dimension(mut self, dimension: usize) -> Self {
        Arc::make_mut(&mut self.config).dimension = dimension.max(1);
        self
    }

    /// Set the reported model name.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.config).model = model.into();
        self
    }

    /// Set simulated latency for all calls.
    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        Arc::make_mut(&mut self.config).latency_ms = latency_ms;
        self
    }

    /// Fail every call.
    pub fn with_failure(mut self) -> Self {
        Arc::make_mut(&mut self.config).fail_all = true;
        self
    }

    /// Fail calls where any input contains `marker`.
    pub fn with_failure_on(mut self, marker: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.config).fail_on = Some(marker.into());
        self
    }

    /// Get all logged calls for assertion.
    pub fn get_calls(&self) -> Vec<MockCall> {
        self.call_log.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Number of embed calls made so far.
    pub fn call_count(&self) -> usize {
        self.call_log.lock().map(|c| c.len()).unwrap_or_default()
    }

    /// Total number of texts embedded so far.
    pub fn embedded_text_count(&self) -> usize {
        self.call_log
            .lock()
            .map(|c| c.iter().map(|call| call.inputs.len()).sum())
            .unwrap_or_default()
    }

    fn log_call(&self, inputs: &[String]) {
        if let Ok(mut log) = self.call_log.lock() {
            log.push(MockCall {
                inputs: inputs.to_vec(),
                timestamp: std::time::Instant::now(),
            });
        }
    }

    fn should_fail(&self, inputs: &[String]) -> bool {
        if self.config.fail_all {
            return true;
        }
        match &self.config.fail_on {
            Some(marker) => inputs.iter().any(|t| t.contains(marker.as_str())),
            None => false,
        }
    }

    /// Deterministic unit vector for `text`.
    pub fn vector_for(text: &str, dimension: usize) -> Vec<f32> {
        let dimension = dimension.max(1);
        let mut vec = vec![0.0f32; dimension];
        for (i, c) in text.chars().enumerate() {
            let idx = (c as usize + i) % dimension;
            vec[idx] += 0.1;
        }
        // Empty text still yields a unit vector.
        if vec.iter().all(|v| *v == 0.0) {
            vec[0] = 1.0;
        }
        let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
        for v in vec.iter_mut() {
            *v /= norm;
        }
        vec
    }
}

impl Default for MockEmbeddingBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingBackend for MockEmbeddingBackend {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vector>> {
        self.log_call(texts);
        if self.config.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.latency_ms)).await;
        }
        if self.should_fail(texts) {
            return Err(Error::Embedding("Simulated embedding failure".to_string()));
        }
        Ok(texts
            .iter()
            .map(|t| Vector::from(Self::vector_for(t, self.config.dimension)))
            .collect())
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deterministic_vectors() {
        let backend = MockEmbeddingBackend::new().with_dimension(8);
        let texts = vec!["Rust engineer".to_string(), "Rust engineer".to_string()];
        let vectors = backend.embed_texts(&texts).await.unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0].as_slice(), vectors[1].as_slice());
        assert_eq!(vectors[0].as_slice().len(), 8);
    }

    #[test]
    fn test_vectors_are_unit_length() {
        for text in ["", "a", "Senior platform engineer"] {
            let v = MockEmbeddingBackend::vector_for(text, 16);
            let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-5, "norm for {text:?} was {norm}");
        }
    }

    #[tokio::test]
    async fn test_failure_on_marker() {
        let backend = MockEmbeddingBackend::new().with_failure_on("POISON");
        assert!(backend.embed_texts(&["fine".to_string()]).await.is_ok());
        let err = backend
            .embed_texts(&["has POISON inside".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Embedding(_)));
        assert_eq!(backend.call_count(), 2);
    }

    #[tokio::test]
    async fn test_clones_share_call_log() {
        let backend = MockEmbeddingBackend::new();
        let clone = backend.clone();
        clone
            .embed_texts(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(backend.call_count(), 1);
        assert_eq!(backend.embedded_text_count(), 2);
    }
}
