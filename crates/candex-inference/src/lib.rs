//! # candex-inference
//!
//! Embedding backends for the candex identity pipeline.
//!
//! Backends implement [`candex_core::EmbeddingBackend`]. The Ollama backend
//! talks to a local or remote Ollama server; the mock backend produces
//! deterministic unit vectors for tests and dry runs.

#[cfg(feature = "ollama")]
pub mod ollama;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

// Re-export core types
pub use candex_core::{EmbeddingBackend, Error, Result, Vector};

#[cfg(feature = "ollama")]
pub use ollama::{OllamaBackend, OllamaConfig};

#[cfg(any(test, feature = "mock"))]
pub use mock::{MockCall, MockEmbeddingBackend};
