//! Root merging: one gateway-level `Query`/`Mutation`/`Subscription` object
//! whose fields are the participating namespaces, each typed as that
//! backend's renamed root. A gateway root is only emitted when at least one
//! backend contributes the corresponding operation type.

use graphql_parser::query::Type as AstType;
use graphql_parser::schema::DirectiveDefinition;

use crate::error::ComposeError;
use crate::schema::{FieldConfig, FieldResolver, ObjectTypeConfig, TypeConfig};
use crate::transform::{BackendRoots, SchemaBuilder};

/// One backend's contribution to the gateway roots.
pub struct MergeEntry {
    pub namespace: String,
    pub roots: BackendRoots,
    pub query_resolver: Option<FieldResolver>,
    pub mutation_resolver: Option<FieldResolver>,
    pub subscription_resolver: Option<FieldResolver>,
}

/// Names of the gateway root types that ended up in the schema.
#[derive(Debug, Default)]
pub struct MergedRoots {
    pub query_type: Option<String>,
    pub mutation_type: Option<String>,
    pub subscription_type: Option<String>,
}

/// Adds the gateway root object types to `builder`. Field order follows
/// the order of `entries`, i.e. configuration order.
pub fn merge_schemas(
    entries: &[MergeEntry],
    builder: &mut SchemaBuilder,
) -> Result<MergedRoots, ComposeError> {
    Ok(MergedRoots {
        query_type: add_root(
            "Query",
            entries,
            |e| (e.roots.query.clone(), e.query_resolver.clone()),
            builder,
        )?,
        mutation_type: add_root(
            "Mutation",
            entries,
            |e| (e.roots.mutation.clone(), e.mutation_resolver.clone()),
            builder,
        )?,
        subscription_type: add_root(
            "Subscription",
            entries,
            |e| (e.roots.subscription.clone(), e.subscription_resolver.clone()),
            builder,
        )?,
    })
}

fn add_root(
    name: &str,
    entries: &[MergeEntry],
    pick: impl Fn(&MergeEntry) -> (Option<String>, Option<FieldResolver>),
    builder: &mut SchemaBuilder,
) -> Result<Option<String>, ComposeError> {
    let mut fields = Vec::new();
    for entry in entries {
        let (root, resolver) = pick(entry);
        if let Some(root) = root {
            fields.push(FieldConfig {
                name: entry.namespace.clone(),
                arguments: Vec::new(),
                field_type: AstType::NamedType(root),
                resolver,
            });
        }
    }
    if fields.is_empty() {
        return Ok(None);
    }
    builder.add_type(TypeConfig::Object(ObjectTypeConfig {
        name: name.to_string(),
        implements: Vec::new(),
        fields,
    }))?;
    Ok(Some(name.to_string()))
}

/// Unions the directive definitions contributed by all backends. The first
/// definition of each name wins; later same-named definitions are dropped.
pub fn merge_directives(
    contributions: Vec<Vec<DirectiveDefinition<'static, String>>>,
) -> Vec<DirectiveDefinition<'static, String>> {
    let mut merged: Vec<DirectiveDefinition<'static, String>> = Vec::new();
    for directive in contributions.into_iter().flatten() {
        if !merged.iter().any(|d| d.name == directive.name) {
            merged.push(directive);
        }
    }
    merged
}
