//! Backend transport: the opaque `execute(document, variables)` capability
//! the core dispatches sub-queries through. Failures pass through to the
//! requesting field unchanged; no retries happen here.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::BackendConfig;
use crate::error::ResolveError;
use crate::schema::JsonMap;

#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Executes one GraphQL document against the backend and returns the
    /// parsed response envelope (`{data, errors}`).
    async fn execute(&self, query: &str, variables: &JsonMap) -> Result<Value, ResolveError>;
}

/// Hands out one [`Endpoint`] per backend descriptor at composition time.
pub trait EndpointProvider: Send + Sync {
    fn endpoint(&self, backend: &BackendConfig) -> Arc<dyn Endpoint>;
}

pub struct HttpEndpoint {
    client: reqwest::Client,
    backend: String,
    url: String,
}

#[async_trait]
impl Endpoint for HttpEndpoint {
    async fn execute(&self, query: &str, variables: &JsonMap) -> Result<Value, ResolveError> {
        tracing::debug!(backend = %self.backend, url = %self.url, "dispatching backend query");

        let body = json!({
            "query": query,
            "variables": variables,
        });

        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| ResolveError::Endpoint {
                backend: self.backend.clone(),
                message: format!("request failed: {}", e),
            })?;

        response
            .json::<Value>()
            .await
            .map_err(|e| ResolveError::Endpoint {
                backend: self.backend.clone(),
                message: format!("invalid response body: {}", e),
            })
    }
}

/// Default provider: one shared reqwest client, one `HttpEndpoint` per
/// backend base address.
#[derive(Default)]
pub struct HttpEndpointProvider {
    client: reqwest::Client,
}

impl HttpEndpointProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EndpointProvider for HttpEndpointProvider {
    fn endpoint(&self, backend: &BackendConfig) -> Arc<dyn Endpoint> {
        Arc::new(HttpEndpoint {
            client: self.client.clone(),
            backend: backend.name.clone(),
            url: backend.url.clone(),
        })
    }
}
