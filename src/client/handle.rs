use crate::cache::CacheKey;
use crate::client::core::ResilientClient;
use crate::client::signals::SignalsSnapshot;
use crate::client::types::{CallOptions, CallStats};
use crate::error::OperationError;
use crate::service::ServiceId;
use crate::Result;
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;

/// A [`ResilientClient`] bound to one service.
///
/// LLM, image and TTS call sites each hold one of these and share the same
/// `call` contract.
#[derive(Clone)]
pub struct ServiceHandle {
    client: ResilientClient,
    service: ServiceId,
}

impl ServiceHandle {
    pub(crate) fn new(client: ResilientClient, service: ServiceId) -> Self {
        Self { client, service }
    }

    pub fn id(&self) -> &ServiceId {
        &self.service
    }

    pub fn client(&self) -> &ResilientClient {
        &self.client
    }

    pub async fn call<T, F, Fut>(
        &self,
        cache_key: Option<&CacheKey>,
        options: &CallOptions,
        operation: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, OperationError>>,
    {
        self.client
            .call(&self.service, cache_key, options, operation)
            .await
    }

    pub async fn call_with_stats<T, F, Fut>(
        &self,
        cache_key: Option<&CacheKey>,
        options: &CallOptions,
        operation: F,
    ) -> Result<(T, CallStats)>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, OperationError>>,
    {
        self.client
            .call_with_stats(&self.service, cache_key, options, operation)
            .await
    }

    pub fn signals(&self) -> SignalsSnapshot {
        self.client.signals(&self.service)
    }
}
