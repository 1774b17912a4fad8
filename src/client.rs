//! Resilient client facade.
//!
//! One process-wide [`ResilientClient`] wraps every outbound call a course
//! generation stage makes. Keep the public surface small: build it once, then
//! hand out [`ServiceHandle`]s to the LLM, image and TTS call sites.
//! Implementation details are split into submodules under `src/client/`.

pub mod builder;
pub mod core;
pub mod handle;
pub mod signals;
pub mod types;

pub use builder::ResilientClientBuilder;
pub use core::ResilientClient;
pub use handle::ServiceHandle;
pub use signals::SignalsSnapshot;
pub use types::{CallOptions, CallStats};
