//! # coursegen-resilience
//!
//! Resilience layer for course-generation pipelines.
//!
//! ## Overview
//!
//! Authoring a training course means hundreds of calls to large-language-model,
//! image-generation and text-to-speech services. Those services are slow,
//! rate-limited, occasionally down and billed per request. This crate is the
//! protective shell every such call passes through.
//!
//! ## Core Philosophy
//!
//! - **Transport-Agnostic**: the caller supplies the remote call as an async closure
//! - **Per-Service Isolation**: breaker and limiter state are scoped to a [`ServiceId`]
//! - **Fail Fast, Degrade Gracefully**: rejections are immediate, cache failures are misses
//! - **Explicit Context**: one [`ResilientClient`] value, no ambient globals
//!
//! ## Key Features
//!
//! - **Caching**: content-addressed, TTL-bound memoization via [`cache`] (persistent or in-memory)
//! - **Circuit Breaking**: closed / open / half-open with a single probe via [`resilience`]
//! - **Rate Limiting**: fixed or sliding windows, immediate or deadline-bounded waits
//! - **Retry**: exponential backoff with jitter and retryability classification
//! - **Telemetry**: counters, histograms, health probes and export sinks via [`telemetry`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use coursegen_resilience::{CallOptions, OperationError, ResilientClient, ServiceId};
//!
//! #[tokio::main]
//! async fn main() -> coursegen_resilience::Result<()> {
//!     let client = ResilientClient::builder().build()?;
//!     let llm = client.service(ServiceId::llm());
//!
//!     let key = client
//!         .keys()
//!         .completion("gpt-4o", None, "Outline a course on vector search", None);
//!     let outline: String = llm
//!         .call(Some(&key), &CallOptions::default(), || async {
//!             // Call the provider here.
//!             Ok::<_, OperationError>("1. Embeddings\n2. Indexes".to_string())
//!         })
//!         .await?;
//!     println!("{outline}");
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`client`] | Resilient client facade, builder and per-service handles |
//! | [`cache`] | Response caching with multiple backends |
//! | [`resilience`] | Circuit breaker, rate limiter and retry policy |
//! | [`registry`] | One set of guards per service |
//! | [`telemetry`] | Metrics, health probes and export sinks |
//! | [`config`] | YAML and environment configuration |

pub mod cache;
pub mod client;
pub mod config;
pub mod error_code;
pub mod registry;
pub mod resilience;
pub mod service;
pub mod telemetry;

// Re-export main types for convenience
pub use client::{CallOptions, CallStats, ServiceHandle, SignalsSnapshot};
pub use client::{ResilientClient, ResilientClientBuilder};
pub use config::{ResilienceConfig, ServicePolicy};
pub use error_code::StandardErrorCode;
pub use service::ServiceId;

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext, ErrorKind, OperationError};
