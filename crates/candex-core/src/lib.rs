//! # candex-core
//!
//! Core types, traits, and abstractions for the candex candidate identity
//! pipeline.
//!
//! This crate provides the domain models, the field normalizer, the shared
//! error type, and the repository/backend traits that the other candex
//! crates implement and depend on.

pub mod config;
pub mod defaults;
pub mod envelope;
pub mod error;
pub mod hashing;
pub mod models;
pub mod normalize;
pub mod rate_limit;
pub mod traits;
pub mod uuid_utils;

// Re-export commonly used types at crate root
pub use config::PipelineConfig;
pub use envelope::ApiEnvelope;
pub use error::{Error, Result};
pub use hashing::{hash_content, hash_json};
pub use models::*;
pub use normalize::NormalizerConfig;
pub use rate_limit::{Clock, ManualClock, RateLimiter, SystemClock};
pub use traits::*;
pub use uuid_utils::new_v7;
