//! Cache key generation.

use crate::service::ServiceId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Content address of a memoized remote-call result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub hash: String,
    /// Service the key belongs to; used only to tag metrics, never hashed twice.
    pub service: Option<ServiceId>,
    pub model: Option<String>,
}

impl CacheKey {
    pub fn new(hash: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            service: None,
            model: None,
        }
    }
    pub fn with_service(mut self, service: ServiceId) -> Self {
        self.service = Some(service);
        self
    }
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
    pub fn as_str(&self) -> &str {
        &self.hash
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.hash)
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}
impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

pub(crate) fn sha256_hex(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Derives [`CacheKey`]s from the inputs that determine a remote call's output.
///
/// Inputs are named fields collected into a sorted map, so field order never
/// matters and field names are part of the hash. A salt lets a deployment
/// invalidate every key at once (e.g. after a prompt-template change).
#[derive(Debug, Clone, Default)]
pub struct CacheKeyGenerator {
    salt: Option<String>,
}

impl CacheKeyGenerator {
    pub fn new() -> Self {
        Self { salt: None }
    }

    pub fn with_salt(mut self, salt: impl Into<String>) -> Self {
        self.salt = Some(salt.into());
        self
    }

    /// Starts a fingerprint for one logical request against `service`.
    pub fn fingerprint(&self, service: ServiceId) -> Fingerprint<'_> {
        Fingerprint {
            generator: self,
            service,
            model: None,
            fields: BTreeMap::new(),
        }
    }

    /// Key for a text completion: prompt, system prompt, model and sampling temperature.
    pub fn completion(
        &self,
        model: &str,
        system_prompt: Option<&str>,
        prompt: &str,
        temperature: Option<f64>,
    ) -> CacheKey {
        let mut fp = self
            .fingerprint(ServiceId::llm())
            .model(model)
            .field("prompt", prompt);
        if let Some(system) = system_prompt {
            fp = fp.field("system_prompt", system);
        }
        if let Some(t) = temperature {
            // Exact bit pattern: nearby temperatures must not share a key.
            fp = fp.field("temperature", t.to_bits());
        }
        fp.finish()
    }

    /// Key for an image generation: prompt, model and output dimensions.
    pub fn image(&self, model: &str, prompt: &str, width: u32, height: u32) -> CacheKey {
        self.fingerprint(ServiceId::image())
            .model(model)
            .field("prompt", prompt)
            .field("width", width)
            .field("height", height)
            .finish()
    }

    /// Key for an arbitrary JSON request body. Object keys are canonicalised.
    pub fn from_json(&self, service: ServiceId, request: &Value) -> CacheKey {
        let mut fp = self.fingerprint(service).field("request", request.clone());
        if let Some(m) = request.get("model").and_then(Value::as_str) {
            fp.model = Some(m.to_string());
        }
        fp.finish()
    }

    fn hash(&self, service: &ServiceId, fields: &BTreeMap<String, Value>) -> String {
        let mut parts: BTreeMap<&str, Value> = BTreeMap::new();
        parts.insert("service", Value::String(service.to_string()));
        parts.insert(
            "fields",
            Value::Object(fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        );
        if let Some(ref s) = self.salt {
            parts.insert("salt", Value::String(s.clone()));
        }
        let canonical = serde_json::to_string(&parts).unwrap_or_default();
        sha256_hex(canonical.as_bytes())
    }
}

/// Builder collecting the semantically relevant inputs of one request.
pub struct Fingerprint<'a> {
    generator: &'a CacheKeyGenerator,
    service: ServiceId,
    model: Option<String>,
    fields: BTreeMap<String, Value>,
}

impl Fingerprint<'_> {
    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Records the model both as a hashed field and on the resulting key.
    pub fn model(mut self, model: impl Into<String>) -> Self {
        let model = model.into();
        self.fields.insert("model".into(), Value::String(model.clone()));
        self.model = Some(model);
        self
    }

    pub fn finish(self) -> CacheKey {
        let hash = self.generator.hash(&self.service, &self.fields);
        let mut key = CacheKey::new(hash).with_service(self.service);
        key.model = self.model;
        key
    }
}
