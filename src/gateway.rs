//! Composition and request entry: loads the gateway configuration, builds
//! the composite schema once at startup and serves client requests against
//! it. A configuration that fails to compose never goes into service.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::abstract_types::AbstractTypeTransformer;
use crate::batch::RequestScope;
use crate::endpoint::{Endpoint, EndpointProvider};
use crate::error::ComposeError;
use crate::executor::execute_request;
use crate::fragments::{
    build_mutation, build_query, collect_fragments, collect_variables,
    filter_variable_definitions, filter_variable_values,
};
use crate::links::{BackendSource, LinkTransformer, rewrite_selection_for_backend, unprefix_type};
use crate::merge::{MergeEntry, merge_directives, merge_schemas};
use crate::namespace::NamespaceRouter;
use crate::schema::{CompositeSchema, FieldResolver, ResolverContext, VariableDefs};
use crate::transform::{SchemaBuilder, transform_backend_schema};
use crate::{BackendConfig, GraphQLRequest};

#[derive(Debug, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub backends: Vec<BackendConfig>,
}

impl GatewayConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ComposeError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ComposeError::Config(format!("{}: {}", path.as_ref().display(), e)))?;
        serde_yaml::from_str(&raw).map_err(|e| ComposeError::Config(e.to_string()))
    }
}

/// The composed gateway, shared across all requests.
pub struct Gateway {
    schema: Arc<CompositeSchema>,
    router: Arc<NamespaceRouter>,
}

impl Gateway {
    pub fn compose(
        config: GatewayConfig,
        provider: &dyn EndpointProvider,
    ) -> Result<Gateway, ComposeError> {
        let mut seen = HashSet::new();
        for backend in &config.backends {
            if !seen.insert(backend.name.as_str()) {
                return Err(ComposeError::DuplicateBackend(backend.name.clone()));
            }
        }
        let router = Arc::new(NamespaceRouter::new(
            config.backends.iter().map(|b| b.name.as_str()),
        )?);

        let mut backends = Vec::with_capacity(config.backends.len());
        for backend in &config.backends {
            let doc = graphql_parser::parse_schema::<String>(&backend.schema)
                .map_err(|e| ComposeError::SchemaParse {
                    backend: backend.name.clone(),
                    message: e.to_string(),
                })?
                .into_static();
            let endpoint = provider.endpoint(backend);
            backends.push((backend.clone(), doc, endpoint));
        }

        let links = LinkTransformer::new(
            Arc::clone(&router),
            backends
                .iter()
                .map(|(config, doc, endpoint)| BackendSource {
                    config: config.clone(),
                    doc: doc.clone(),
                    endpoint: Arc::clone(endpoint),
                })
                .collect(),
        );

        let mut builder = SchemaBuilder::new();
        let mut entries = Vec::with_capacity(backends.len());
        let mut directive_sets = Vec::with_capacity(backends.len());
        for (backend, doc, endpoint) in &backends {
            let artifacts = transform_backend_schema(
                &backend.name,
                doc,
                &router,
                &[&links, &AbstractTypeTransformer],
                &mut builder,
            )?;
            tracing::debug!(backend = %backend.name, "backend schema transformed");

            let forward = |root: &Option<String>, mutation: bool| {
                root.as_ref().map(|root| {
                    forwarding_resolver(
                        Arc::clone(&router),
                        Arc::clone(endpoint),
                        backend.name.clone(),
                        root.clone(),
                        mutation,
                    )
                })
            };
            entries.push(MergeEntry {
                query_resolver: forward(&artifacts.roots.query, false),
                mutation_resolver: forward(&artifacts.roots.mutation, true),
                // Merged for introspection; execution rejects subscription
                // operations before any resolver runs.
                subscription_resolver: None,
                namespace: backend.name.clone(),
                roots: artifacts.roots,
            });
            directive_sets.push(artifacts.directives);
        }

        let merged = merge_schemas(&entries, &mut builder)?;
        let mut schema = builder.finish();
        schema.query_type = merged.query_type;
        schema.mutation_type = merged.mutation_type;
        schema.subscription_type = merged.subscription_type;
        schema.directives = merge_directives(directive_sets);
        for (backend, _, _) in &backends {
            for link_id in backend.links.keys() {
                if let Some((source_type, field)) = link_id.split_once('.') {
                    if let Some(merged_type) = router.merged_name(&backend.name, source_type) {
                        schema.link_fields.insert(format!("{}.{}", merged_type, field));
                    }
                }
            }
        }

        tracing::info!(backends = backends.len(), "composite schema built");
        Ok(Gateway {
            schema: Arc::new(schema),
            router,
        })
    }

    pub fn schema(&self) -> &Arc<CompositeSchema> {
        &self.schema
    }

    /// Executes one client request. The request scope, and with it every
    /// batch loader, lives exactly as long as this call.
    pub async fn process_request(&self, request: GraphQLRequest) -> Value {
        tracing::debug!(operation = ?request.operation_name, "executing request");
        let scope = Arc::new(RequestScope::new());
        execute_request(
            Arc::clone(&self.schema),
            Arc::clone(&self.router),
            request,
            scope,
        )
        .await
    }
}

/// Resolver for `Query.<namespace>` (and the mutation counterpart): rewrites
/// the sub-selection into the backend's own namespace, forwards it as a
/// self-contained document and returns the backend's `data` object for the
/// engine to project.
fn forwarding_resolver(
    router: Arc<NamespaceRouter>,
    endpoint: Arc<dyn Endpoint>,
    namespace: String,
    merged_root: String,
    mutation: bool,
) -> FieldResolver {
    Arc::new(move |ctx: ResolverContext| {
        let router = Arc::clone(&router);
        let endpoint = Arc::clone(&endpoint);
        let merged_root = merged_root.clone();
        let namespace = namespace.clone();
        Box::pin(async move {
            let rewritten = rewrite_selection_for_backend(
                &ctx.schema,
                &router,
                &merged_root,
                &ctx.field.selection_set,
                &ctx.fragments,
            );
            let fragment_defs = collect_fragments(&rewritten.set, &rewritten.fragments);
            let used = collect_variables(&rewritten.set, &rewritten.fragments);
            let defs: VariableDefs =
                filter_variable_definitions(&ctx.variable_definitions, &used)
                    .into_iter()
                    .map(|mut def| {
                        def.var_type = unprefix_type(&router, &def.var_type);
                        def
                    })
                    .collect();
            let values = filter_variable_values(&ctx.variables, &used);

            let pending = if mutation {
                build_mutation(rewritten.set, defs, fragment_defs, values)
            } else {
                build_query(rewritten.set, defs, fragment_defs, values)
            };
            tracing::debug!(backend = %namespace, "forwarding operation");

            let response = endpoint.execute(&pending.text(), &pending.variables).await?;
            sink_backend_errors(&ctx, &response);
            Ok(response.get("data").cloned().unwrap_or(Value::Null))
        })
    })
}

/// Copies backend-supplied partial errors into the response error sink,
/// re-rooting their paths under the namespace field.
fn sink_backend_errors(ctx: &ResolverContext, response: &Value) {
    let Some(errors) = response.get("errors").and_then(Value::as_array) else {
        return;
    };
    let mut sink = ctx.errors.lock().expect("error sink poisoned");
    for error in errors {
        let mut entry = error.clone();
        if entry.is_object() {
            let mut path = ctx.path.clone();
            if let Some(rest) = error.get("path").and_then(Value::as_array) {
                path.extend(rest.iter().cloned());
            }
            entry["path"] = Value::Array(path);
        }
        sink.push(entry);
    }
}
