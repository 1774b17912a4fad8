//! Service identities.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

/// Logical name of a protected upstream (e.g. `"llm"`, `"image"`, `"tts"`).
///
/// Scopes breaker, limiter and metric state. Cloning is cheap.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ServiceId(Arc<str>);

impl ServiceId {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    /// Large-language-model completions.
    pub fn llm() -> Self {
        Self::new("llm")
    }

    /// Image generation.
    pub fn image() -> Self {
        Self::new("image")
    }

    /// Text-to-speech narration.
    pub fn tts() -> Self {
        Self::new("tts")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServiceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ServiceId {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

impl From<ServiceId> for String {
    fn from(s: ServiceId) -> Self {
        s.0.to_string()
    }
}

impl AsRef<str> for ServiceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for ServiceId {
    fn borrow(&self) -> &str {
        &self.0
    }
}
