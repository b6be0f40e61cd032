pub mod abstract_types;
pub mod batch;
pub mod endpoint;
pub mod error;
pub mod executor;
pub mod fragments;
pub mod gateway;
pub mod links;
pub mod merge;
pub mod namespace;
pub mod schema;
pub mod transform;

pub use endpoint::{Endpoint, EndpointProvider, HttpEndpointProvider};
pub use error::{ComposeError, ResolveError};
pub use gateway::{Gateway, GatewayConfig};
pub use namespace::NamespaceRouter;
pub use schema::CompositeSchema;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One upstream GraphQL service merged into the composite schema.
///
/// Immutable once composition starts; `links` is keyed by
/// `"TypeName.fieldName"` in the backend's own (unprefixed) schema.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    pub url: String,
    pub schema: String,
    #[serde(default)]
    pub links: BTreeMap<String, LinkConfig>,
}

/// A cross-backend relation exposed as an ordinary field.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkConfig {
    /// Backend that serves the linked data.
    pub target_backend: String,
    /// Field on the target backend's query root that resolves a key.
    pub target_field: String,
    /// Dot-separated argument path on the target field, e.g. `filter.id`.
    pub argument: String,
    /// Send all pending keys in one call instead of one call per key.
    #[serde(default)]
    pub batch_mode: bool,
    /// Field on the target result items used to remap a batched response
    /// back to request order.
    #[serde(default)]
    pub key_field: Option<String>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct GraphQLRequest {
    pub query: String,
    pub variables: Option<Value>,
    #[serde(rename = "operationName")]
    pub operation_name: Option<String>,
}
