//! The link resolution engine: a transformer that replaces the resolver of
//! every configured link field with one that reads the already-fetched key
//! off the parent value, coalesces resolution through the request-scoped
//! batcher and dispatches a self-contained sub-query to the owning backend.
//!
//! One loader exists per link field per request, and its dispatch document
//! is built from the selection context of the first resolver invocation
//! that reaches the loader. Aliased siblings of the same link field share
//! that one selection; a sibling asking for different sub-fields gets the
//! first sibling's shape.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::join_all;
use graphql_parser::query::{
    Field as AstField, Selection, SelectionSet, Type as AstType, TypeCondition,
};
use graphql_parser::schema::{
    Definition as SchemaDef, Document as SchemaDocument, InputObjectType, ObjectType,
    TypeDefinition,
};
use serde_json::Value;

use crate::batch::{BatchDispatcher, LinkLoader};
use crate::endpoint::Endpoint;
use crate::error::{ComposeError, ResolveError};
use crate::fragments::{
    self, PendingQuery, SelSet, add_field_selection, add_variable_definition, build_query,
    collect_fragments, collect_variables, empty_selection_set, filter_variable_definitions,
    filter_variable_values, fold_argument_path,
};
use crate::namespace::NamespaceRouter;
use crate::schema::{
    CompositeSchema, FieldConfig, FieldResolver, FragmentMap, JsonMap, ResolverContext,
    TypeConfig, TypeRef, VariableDefs, named_type,
};
use crate::transform::{FieldTransformationContext, SchemaTransformer, original_roots};
use crate::{BackendConfig, LinkConfig};

/// Everything one backend contributes to link planning.
pub struct BackendSource {
    pub config: BackendConfig,
    pub doc: SchemaDocument<'static, String>,
    pub endpoint: Arc<dyn Endpoint>,
}

/// Installs link resolvers while the composition pipeline walks each
/// backend schema. Misconfigured links abort composition; nothing here is
/// retried or deferred to request time.
pub struct LinkTransformer {
    router: Arc<NamespaceRouter>,
    backends: HashMap<String, BackendSource>,
}

impl LinkTransformer {
    pub fn new(router: Arc<NamespaceRouter>, sources: Vec<BackendSource>) -> Self {
        LinkTransformer {
            router,
            backends: sources
                .into_iter()
                .map(|s| (s.config.name.clone(), s))
                .collect(),
        }
    }

    fn plan_link(
        &self,
        backend: &str,
        source_type: &str,
        field_name: &str,
        link: &LinkConfig,
        link_id: &str,
    ) -> Result<LinkPlan, ComposeError> {
        let target = self.backends.get(&link.target_backend).ok_or_else(|| {
            ComposeError::UnknownBackend {
                backend: backend.to_string(),
                link: link_id.to_string(),
                target: link.target_backend.clone(),
            }
        })?;

        let unknown_field = || ComposeError::UnknownTargetField {
            link: link_id.to_string(),
            target: link.target_backend.clone(),
            field: link.target_field.clone(),
        };
        let root_name = original_roots(&target.doc).0.ok_or_else(unknown_field)?;
        let root = find_object(&target.doc, &root_name).ok_or_else(unknown_field)?;
        let target_field = root
            .fields
            .iter()
            .find(|f| f.name == link.target_field)
            .ok_or_else(unknown_field)?;

        let result_name = named_type(&target_field.field_type);
        let result_object =
            find_object(&target.doc, result_name).ok_or_else(|| ComposeError::TargetNotObject {
                link: link_id.to_string(),
                target: link.target_backend.clone(),
                field: link.target_field.clone(),
            })?;
        let result_type = self
            .router
            .merged_name(&link.target_backend, &result_object.name)
            .ok_or_else(|| ComposeError::UnknownBackend {
                backend: backend.to_string(),
                link: link_id.to_string(),
                target: link.target_backend.clone(),
            })?;

        let segments: Vec<String> = link
            .argument
            .split('.')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        let Some((arg_head, arg_rest)) = segments.split_first() else {
            return Err(ComposeError::EmptyArgumentPath {
                link: link_id.to_string(),
            });
        };
        let key_var_type =
            walk_argument_path(&target.doc, target_field, arg_head, arg_rest, link, link_id)?;

        let merged_source = self
            .router
            .merged_name(backend, source_type)
            .unwrap_or_else(|| source_type.to_string());

        Ok(LinkPlan {
            link_key: format!("{}.{}", merged_source, field_name),
            link: link.clone(),
            router: Arc::clone(&self.router),
            endpoint: Arc::clone(&target.endpoint),
            target_field: link.target_field.clone(),
            result_type,
            key_var_type,
            arg_head: arg_head.clone(),
            arg_rest: arg_rest.to_vec(),
        })
    }
}

impl SchemaTransformer for LinkTransformer {
    fn transform_field(
        &self,
        field: &mut FieldConfig,
        ctx: &FieldTransformationContext<'_>,
    ) -> Result<(), ComposeError> {
        let Some(source) = self.backends.get(ctx.backend) else {
            return Ok(());
        };
        let link_id = format!("{}.{}", ctx.source_type, field.name);
        let Some(link) = source.config.links.get(&link_id) else {
            return Ok(());
        };

        let plan = self.plan_link(ctx.backend, ctx.source_type, &field.name, link, &link_id)?;

        // Callers of the merged field always get the bare target object (or
        // a list, or null): the link's own fan-out is independent of the
        // original field's cardinality, so wrappers are not carried over.
        field.field_type = AstType::NamedType(plan.result_type.clone());
        field.resolver = Some(link_resolver(Arc::new(plan)));
        Ok(())
    }
}

/// Derives the GraphQL type of the key variable: the declared type at the
/// end of the dotted argument path, walked through input object types of
/// the target backend.
fn walk_argument_path(
    doc: &SchemaDocument<'static, String>,
    target_field: &graphql_parser::schema::Field<'static, String>,
    head: &str,
    rest: &[String],
    link: &LinkConfig,
    link_id: &str,
) -> Result<TypeRef, ComposeError> {
    let unresolvable = |segment: &str| ComposeError::UnresolvableArgumentPath {
        link: link_id.to_string(),
        target: link.target_backend.clone(),
        segment: segment.to_string(),
    };

    let head_arg = target_field
        .arguments
        .iter()
        .find(|a| a.name == head)
        .ok_or_else(|| unresolvable(head))?;
    let mut current = &head_arg.value_type;
    for segment in rest {
        let input = find_input_object(doc, named_type(current)).ok_or_else(|| unresolvable(segment))?;
        let field = input
            .fields
            .iter()
            .find(|f| f.name == *segment)
            .ok_or_else(|| unresolvable(segment))?;
        current = &field.value_type;
    }
    Ok(current.clone())
}

fn find_object<'d>(
    doc: &'d SchemaDocument<'static, String>,
    name: &str,
) -> Option<&'d ObjectType<'static, String>> {
    doc.definitions.iter().find_map(|def| match def {
        SchemaDef::TypeDefinition(TypeDefinition::Object(o)) if o.name == name => Some(o),
        _ => None,
    })
}

fn find_input_object<'d>(
    doc: &'d SchemaDocument<'static, String>,
    name: &str,
) -> Option<&'d InputObjectType<'static, String>> {
    doc.definitions.iter().find_map(|def| match def {
        SchemaDef::TypeDefinition(TypeDefinition::InputObject(i)) if i.name == name => Some(i),
        _ => None,
    })
}

/// Immutable per-link dispatch recipe, shared by every resolution of that
/// link across all requests.
pub(crate) struct LinkPlan {
    /// Merged `"TypeName.fieldName"`; loader identity within one request.
    link_key: String,
    link: LinkConfig,
    router: Arc<NamespaceRouter>,
    endpoint: Arc<dyn Endpoint>,
    target_field: String,
    result_type: String,
    key_var_type: TypeRef,
    arg_head: String,
    arg_rest: Vec<String>,
}

fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn link_resolver(plan: Arc<LinkPlan>) -> FieldResolver {
    Arc::new(move |ctx: ResolverContext| {
        let plan = Arc::clone(&plan);
        Box::pin(async move {
            let key = ctx
                .source
                .get(ctx.response_key())
                .cloned()
                .unwrap_or(Value::Null);
            // A link with no key has nothing to resolve; propagate the
            // value untouched without any backend call.
            if is_falsy(&key) {
                return Ok(key);
            }

            let loader = ctx.scope.loader_for(&plan.link_key, || {
                LinkLoader::new(Arc::new(LinkDispatch {
                    context: DispatchContext::capture(&plan, &ctx),
                    plan: Arc::clone(&plan),
                }))
            });

            match key {
                // An array of keys fans out 1→N through the same loader.
                Value::Array(keys) => {
                    let loads = keys.into_iter().map(|k| {
                        let loader = Arc::clone(&loader);
                        async move { loader.load(k).await }
                    });
                    let items: Result<Vec<Value>, ResolveError> =
                        join_all(loads).await.into_iter().collect();
                    Ok(Value::Array(items?))
                }
                key => loader.load(key).await,
            }
        })
    })
}

/// The caller-side selection context captured from the first resolver
/// invocation of a link within one request, already rewritten into the
/// target backend's namespace.
struct DispatchContext {
    selection_set: SelSet,
    fragments: FragmentMap,
    variable_definitions: VariableDefs,
    variables: Arc<JsonMap>,
    errors: Arc<Mutex<Vec<Value>>>,
    path: Vec<Value>,
}

impl DispatchContext {
    fn capture(plan: &LinkPlan, ctx: &ResolverContext) -> DispatchContext {
        let rewritten = rewrite_selection_for_backend(
            &ctx.schema,
            &plan.router,
            &plan.result_type,
            &ctx.field.selection_set,
            &ctx.fragments,
        );
        let variable_definitions = ctx
            .variable_definitions
            .iter()
            .map(|def| {
                let mut def = def.clone();
                def.var_type = unprefix_type(&plan.router, &def.var_type);
                def
            })
            .collect();
        DispatchContext {
            selection_set: rewritten.set,
            fragments: rewritten.fragments,
            variable_definitions,
            variables: Arc::clone(&ctx.variables),
            errors: Arc::clone(&ctx.errors),
            path: ctx.path.clone(),
        }
    }
}

struct LinkDispatch {
    plan: Arc<LinkPlan>,
    context: DispatchContext,
}

impl LinkDispatch {
    /// Builds one self-contained dispatch document binding `key_value` to
    /// the link's argument path through a fresh variable.
    fn build_dispatch(&self, key_value: Value, with_key_field: bool) -> (PendingQuery, Option<String>) {
        let plan = &self.plan;

        let (key_alias, selection) = match (&plan.link.key_field, with_key_field) {
            (Some(key_field), true) => {
                let (alias, set) = add_field_selection(&self.context.selection_set, key_field);
                (Some(alias), set)
            }
            _ => (None, self.context.selection_set.clone()),
        };

        let fragment_defs = collect_fragments(&selection, &self.context.fragments);
        let used = collect_variables(&selection, &self.context.fragments);
        let defs = filter_variable_definitions(&self.context.variable_definitions, &used);
        let mut values = filter_variable_values(&self.context.variables, &used);

        let base = if plan.link.batch_mode { "keys" } else { "key" };
        let (var_name, defs) = add_variable_definition(&defs, base, plan.key_var_type.clone());
        let (arg_name, arg_value) = fold_argument_path(&plan.arg_head, &plan.arg_rest, &var_name);
        values.insert(var_name, key_value);

        let target = AstField {
            position: fragments::pos(),
            alias: None,
            name: plan.target_field.clone(),
            arguments: vec![(arg_name, arg_value)],
            directives: Vec::new(),
            selection_set: selection,
        };
        let mut operation = empty_selection_set();
        operation.items.push(Selection::Field(target));

        (build_query(operation, defs, fragment_defs, values), key_alias)
    }

    async fn execute(&self, pending: &PendingQuery) -> Result<Value, ResolveError> {
        let response = self
            .plan
            .endpoint
            .execute(&pending.text(), &pending.variables)
            .await?;

        let data = response
            .get("data")
            .and_then(|d| d.get(&self.plan.target_field))
            .cloned()
            .unwrap_or(Value::Null);
        if data.is_null() {
            if let Some(message) = first_error_message(&response) {
                return Err(ResolveError::Endpoint {
                    backend: self.plan.link.target_backend.clone(),
                    message,
                });
            }
        } else {
            self.sink_partial_errors(&response);
        }
        Ok(data)
    }

    /// Backend errors that arrive alongside non-null data are partial; the
    /// dispatch still succeeds, so they are copied into the response error
    /// sink, re-rooted at the link field's path.
    fn sink_partial_errors(&self, response: &Value) {
        let Some(errors) = response.get("errors").and_then(Value::as_array) else {
            return;
        };
        let mut sink = self.context.errors.lock().expect("error sink poisoned");
        for error in errors {
            let mut entry = error.clone();
            if entry.is_object() {
                entry["path"] = Value::Array(self.context.path.clone());
            }
            sink.push(entry);
        }
    }

    async fn dispatch_batched(&self, keys: Vec<Value>) -> Result<Vec<Value>, ResolveError> {
        let (pending, key_alias) = self.build_dispatch(Value::Array(keys.clone()), true);
        let data = self.execute(&pending).await?;

        let items = match data {
            Value::Array(items) => items,
            Value::Null => return Ok(vec![Value::Null; keys.len()]),
            _ => {
                return Err(ResolveError::Endpoint {
                    backend: self.plan.link.target_backend.clone(),
                    message: format!(
                        "field `{}` did not return a list for a batched link",
                        self.plan.target_field
                    ),
                });
            }
        };

        match key_alias {
            // The backend's ordering is not trusted: remap every requested
            // key through the returned key field; missing keys become null.
            Some(alias) => {
                let mut by_key: HashMap<String, Value> = HashMap::with_capacity(items.len());
                for item in items {
                    let key = item.get(&alias).cloned().unwrap_or(Value::Null);
                    by_key.insert(key.to_string(), item);
                }
                Ok(keys
                    .iter()
                    .map(|key| by_key.get(&key.to_string()).cloned().unwrap_or(Value::Null))
                    .collect())
            }
            // No key field configured: the backend is assumed to preserve
            // request order. This is unverified (see DESIGN.md).
            None => Ok(items),
        }
    }

    async fn dispatch_serial(&self, keys: Vec<Value>) -> Result<Vec<Value>, ResolveError> {
        let calls = keys.into_iter().map(|key| async move {
            let (pending, _) = self.build_dispatch(key, false);
            self.execute(&pending).await
        });
        join_all(calls).await.into_iter().collect()
    }
}

#[async_trait]
impl BatchDispatcher for LinkDispatch {
    async fn resolve_batch(&self, keys: Vec<Value>) -> Result<Vec<Value>, ResolveError> {
        if self.plan.link.batch_mode {
            self.dispatch_batched(keys).await
        } else {
            self.dispatch_serial(keys).await
        }
    }
}

fn first_error_message(response: &Value) -> Option<String> {
    response
        .get("errors")?
        .as_array()?
        .first()?
        .get("message")?
        .as_str()
        .map(str::to_string)
}

/// Strips the owning backend's prefix from every named type in a type
/// reference, leaving wrappers intact.
pub(crate) fn unprefix_type(router: &NamespaceRouter, ty: &TypeRef) -> TypeRef {
    match ty {
        AstType::NamedType(name) => AstType::NamedType(
            router
                .route(name)
                .map(|(_, original)| original.to_string())
                .unwrap_or_else(|| name.clone()),
        ),
        AstType::ListType(inner) => AstType::ListType(Box::new(unprefix_type(router, inner))),
        AstType::NonNullType(inner) => AstType::NonNullType(Box::new(unprefix_type(router, inner))),
    }
}

/// The outcome of rewriting a composite-schema selection into one
/// backend's own namespace.
pub(crate) struct RewrittenSelection {
    pub set: SelSet,
    /// Referenced fragment definitions, rewritten alongside.
    pub fragments: FragmentMap,
}

/// Rewrites a selection set written against the composite schema into a
/// form the owning backend understands: type conditions lose their prefix,
/// link fields lose their sub-selection (their backend shape is the bare
/// key), and abstract selection sets gain a `__typename` selection so the
/// concrete type can be resolved afterwards.
pub(crate) fn rewrite_selection_for_backend(
    schema: &CompositeSchema,
    router: &NamespaceRouter,
    merged_type: &str,
    set: &SelSet,
    fragments: &FragmentMap,
) -> RewrittenSelection {
    let mut rewriter = Rewriter {
        schema,
        router,
        fragments,
        rewritten: FragmentMap::new(),
    };
    let set = rewriter.rewrite_set(merged_type, set);
    RewrittenSelection {
        set,
        fragments: rewriter.rewritten,
    }
}

struct Rewriter<'a> {
    schema: &'a CompositeSchema,
    router: &'a NamespaceRouter,
    fragments: &'a FragmentMap,
    rewritten: FragmentMap,
}

impl Rewriter<'_> {
    fn rewrite_set(&mut self, merged_type: &str, set: &SelSet) -> SelSet {
        let mut items = Vec::with_capacity(set.items.len());
        for sel in &set.items {
            match sel {
                Selection::Field(f) => {
                    let mut field = f.clone();
                    if self.schema.is_link_field(merged_type, &f.name) {
                        field.selection_set = empty_selection_set();
                    } else if !f.selection_set.items.is_empty() {
                        if let Some(config) = self.schema.field(merged_type, &f.name) {
                            let child = named_type(&config.field_type).to_string();
                            field.selection_set = self.rewrite_set(&child, &f.selection_set);
                        }
                    }
                    items.push(Selection::Field(field));
                }
                Selection::InlineFragment(frag) => {
                    let mut frag = frag.clone();
                    let inner_type = match &frag.type_condition {
                        Some(TypeCondition::On(cond)) => cond.clone(),
                        None => merged_type.to_string(),
                    };
                    frag.selection_set = self.rewrite_set(&inner_type, &frag.selection_set);
                    if let Some(TypeCondition::On(cond)) = &mut frag.type_condition {
                        if let Some((_, original)) = self.router.route(cond) {
                            *cond = original.to_string();
                        }
                    }
                    items.push(Selection::InlineFragment(frag));
                }
                Selection::FragmentSpread(spread) => {
                    self.rewrite_fragment(&spread.fragment_name);
                    items.push(sel.clone());
                }
            }
        }

        let is_abstract = matches!(
            self.schema.find_type(merged_type),
            Some(TypeConfig::Interface(_) | TypeConfig::Union(_))
        );
        if is_abstract && !items.iter().any(is_typename_selection) {
            items.push(Selection::Field(AstField {
                position: fragments::pos(),
                alias: None,
                name: "__typename".to_string(),
                arguments: Vec::new(),
                directives: Vec::new(),
                selection_set: empty_selection_set(),
            }));
        }

        SelectionSet {
            span: set.span,
            items,
        }
    }

    fn rewrite_fragment(&mut self, name: &str) {
        if self.rewritten.contains_key(name) {
            return;
        }
        let Some(def) = self.fragments.get(name) else {
            return;
        };
        // Reserve the slot first so fragment cycles terminate.
        self.rewritten.insert(name.to_string(), def.clone());

        let TypeCondition::On(merged_cond) = def.type_condition.clone();
        let mut rewritten = def.clone();
        rewritten.selection_set = self.rewrite_set(&merged_cond, &def.selection_set);
        if let Some((_, original)) = self.router.route(&merged_cond) {
            rewritten.type_condition = TypeCondition::On(original.to_string());
        }
        self.rewritten.insert(name.to_string(), rewritten);
    }
}

fn is_typename_selection(sel: &Selection<'static, String>) -> bool {
    matches!(sel, Selection::Field(f) if f.name == "__typename" && f.alias.is_none())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::{SchemaBuilder, transform_backend_schema};
    use graphql_parser::parse_schema;
    use graphql_parser::query::{Definition, OperationDefinition, parse_query};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Mutex;

    const USERS_SDL: &str = "
        type Query {
            user(id: ID!): User
            users(filter: UserFilter): [User]
            userName(id: ID!): String
        }
        input UserFilter { ids: [ID!] }
        type User { id: ID! name: String }
    ";

    const POSTS_SDL: &str = "
        type Query { post(id: ID!): Post }
        type Post { id: ID! title: String author: ID }
    ";

    struct Scripted {
        responses: Mutex<Vec<Value>>,
        calls: Mutex<Vec<(String, JsonMap)>>,
    }

    impl Scripted {
        fn new(responses: Vec<Value>) -> Arc<Self> {
            Arc::new(Scripted {
                responses: Mutex::new(responses),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Endpoint for Scripted {
        async fn execute(&self, query: &str, variables: &JsonMap) -> Result<Value, ResolveError> {
            self.calls
                .lock()
                .unwrap()
                .push((query.to_string(), variables.clone()));
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(json!({ "data": null }))
            } else {
                Ok(responses.remove(0))
            }
        }
    }

    fn doc(sdl: &str) -> SchemaDocument<'static, String> {
        parse_schema::<String>(sdl).unwrap().into_static()
    }

    fn backend(name: &str, sdl: &str, links: &[(&str, LinkConfig)]) -> BackendConfig {
        BackendConfig {
            name: name.to_string(),
            url: format!("http://{}.test/graphql", name),
            schema: sdl.to_string(),
            links: links
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }

    fn author_link(batch_mode: bool, key_field: Option<&str>) -> LinkConfig {
        LinkConfig {
            target_backend: "users".to_string(),
            target_field: if batch_mode { "users" } else { "user" }.to_string(),
            argument: if batch_mode { "filter.ids" } else { "id" }.to_string(),
            batch_mode,
            key_field: key_field.map(str::to_string),
        }
    }

    fn transformer(posts_links: &[(&str, LinkConfig)]) -> (LinkTransformer, Arc<Scripted>) {
        let endpoint = Scripted::new(Vec::new());
        let router = Arc::new(NamespaceRouter::new(["users", "posts"]).unwrap());
        let sources = vec![
            BackendSource {
                config: backend("users", USERS_SDL, &[]),
                doc: doc(USERS_SDL),
                endpoint: endpoint.clone(),
            },
            BackendSource {
                config: backend("posts", POSTS_SDL, posts_links),
                doc: doc(POSTS_SDL),
                endpoint: endpoint.clone(),
            },
        ];
        (LinkTransformer::new(router, sources), endpoint)
    }

    fn compose_posts(posts_links: &[(&str, LinkConfig)]) -> Result<CompositeSchema, ComposeError> {
        let (transformer, _) = transformer(posts_links);
        let router = NamespaceRouter::new(["users", "posts"]).unwrap();
        let mut builder = SchemaBuilder::new();
        transform_backend_schema("users", &doc(USERS_SDL), &router, &[&transformer], &mut builder)?;
        transform_backend_schema("posts", &doc(POSTS_SDL), &router, &[&transformer], &mut builder)?;
        Ok(builder.finish())
    }

    #[test]
    fn link_field_type_is_rewritten_to_the_bare_target_type() {
        let schema =
            compose_posts(&[("Post.author", author_link(false, None))]).unwrap();
        let field = schema.field("Posts_Post", "author").unwrap();
        assert_eq!(field.field_type.to_string(), "Users_User");
        assert!(field.resolver.is_some());
    }

    #[test]
    fn non_link_fields_keep_their_default_resolution() {
        let schema =
            compose_posts(&[("Post.author", author_link(false, None))]).unwrap();
        let field = schema.field("Posts_Post", "title").unwrap();
        assert!(field.resolver.is_none());
    }

    #[test]
    fn unknown_target_backend_is_fatal() {
        let mut link = author_link(false, None);
        link.target_backend = "ghosts".to_string();
        let result = compose_posts(&[("Post.author", link)]);
        assert!(matches!(result, Err(ComposeError::UnknownBackend { .. })));
    }

    #[test]
    fn unknown_target_field_is_fatal() {
        let mut link = author_link(false, None);
        link.target_field = "nobody".to_string();
        let result = compose_posts(&[("Post.author", link)]);
        assert!(matches!(result, Err(ComposeError::UnknownTargetField { .. })));
    }

    #[test]
    fn scalar_target_field_is_fatal() {
        let mut link = author_link(false, None);
        link.target_field = "userName".to_string();
        let result = compose_posts(&[("Post.author", link)]);
        assert!(matches!(result, Err(ComposeError::TargetNotObject { .. })));
    }

    #[test]
    fn empty_argument_path_is_fatal() {
        let mut link = author_link(false, None);
        link.argument = String::new();
        let result = compose_posts(&[("Post.author", link)]);
        assert!(matches!(result, Err(ComposeError::EmptyArgumentPath { .. })));
    }

    #[test]
    fn unresolvable_argument_path_is_fatal() {
        let mut link = author_link(true, None);
        link.argument = "filter.nope".to_string();
        let result = compose_posts(&[("Post.author", link)]);
        assert!(matches!(
            result,
            Err(ComposeError::UnresolvableArgumentPath { .. })
        ));
    }

    #[test]
    fn key_variable_type_is_walked_through_input_objects() {
        let (transformer, _) = transformer(&[]);
        let link = author_link(true, Some("id"));
        let plan = transformer
            .plan_link("posts", "Post", "author", &link, "Post.author")
            .unwrap();
        assert_eq!(plan.key_var_type.to_string(), "[ID!]");

        let single = author_link(false, None);
        let plan = transformer
            .plan_link("posts", "Post", "author", &single, "Post.author")
            .unwrap();
        assert_eq!(plan.key_var_type.to_string(), "ID!");
    }

    fn selection(query: &str) -> SelSet {
        let parsed = parse_query::<String>(query).unwrap().into_static();
        match parsed.definitions.into_iter().next().unwrap() {
            Definition::Operation(OperationDefinition::SelectionSet(set)) => set,
            Definition::Operation(OperationDefinition::Query(q)) => q.selection_set,
            other => panic!("unexpected definition {:?}", other),
        }
    }

    fn dispatch(
        link: LinkConfig,
        endpoint: Arc<Scripted>,
        selection_set: SelSet,
    ) -> LinkDispatch {
        let (transformer, _) = transformer(&[]);
        let mut plan = transformer
            .plan_link("posts", "Post", "author", &link, "Post.author")
            .unwrap();
        plan.endpoint = endpoint;
        LinkDispatch {
            plan: Arc::new(plan),
            context: DispatchContext {
                selection_set,
                fragments: FragmentMap::new(),
                variable_definitions: Vec::new(),
                variables: Arc::new(JsonMap::new()),
                errors: Arc::new(Mutex::new(Vec::new())),
                path: vec![json!("posts"), json!("post"), json!("author")],
            },
        }
    }

    #[tokio::test]
    async fn batched_dispatch_remaps_permuted_and_partial_results() {
        let endpoint = Scripted::new(vec![json!({
            "data": { "users": [
                { "name": "carol", "_id": "3" },
                { "name": "alice", "_id": "1" }
            ] }
        })]);
        let dispatch = dispatch(
            author_link(true, Some("id")),
            endpoint.clone(),
            selection("{ name }"),
        );

        let results = dispatch
            .resolve_batch(vec![json!("1"), json!("2"), json!("3")])
            .await
            .unwrap();

        assert_eq!(endpoint.call_count(), 1);
        assert_eq!(results[0]["name"], json!("alice"));
        assert_eq!(results[1], Value::Null);
        assert_eq!(results[2]["name"], json!("carol"));
    }

    #[tokio::test]
    async fn batched_dispatch_sends_all_keys_in_one_variable() {
        let endpoint = Scripted::new(vec![json!({ "data": { "users": [] } })]);
        let dispatch = dispatch(
            author_link(true, Some("id")),
            endpoint.clone(),
            selection("{ name }"),
        );

        dispatch
            .resolve_batch(vec![json!("1"), json!("1"), json!("2")])
            .await
            .unwrap();

        let calls = endpoint.calls.lock().unwrap();
        let (query, variables) = &calls[0];
        assert!(query.contains("users"), "got: {}", query);
        assert_eq!(variables["keys"], json!(["1", "1", "2"]));
    }

    #[tokio::test]
    async fn unbatched_dispatch_issues_one_call_per_key_in_order() {
        let endpoint = Scripted::new(vec![
            json!({ "data": { "user": { "name": "alice" } } }),
            json!({ "data": { "user": { "name": "bob" } } }),
            json!({ "data": { "user": { "name": "carol" } } }),
        ]);
        let dispatch = dispatch(
            author_link(false, None),
            endpoint.clone(),
            selection("{ name }"),
        );

        let results = dispatch
            .resolve_batch(vec![json!("1"), json!("2"), json!("3")])
            .await
            .unwrap();

        assert_eq!(endpoint.call_count(), 3);
        let names: Vec<&Value> = results.iter().map(|r| &r["name"]).collect();
        assert_eq!(names, vec![&json!("alice"), &json!("bob"), &json!("carol")]);
    }

    #[tokio::test]
    async fn backend_errors_are_propagated_unchanged() {
        let endpoint = Scripted::new(vec![json!({
            "data": null,
            "errors": [{ "message": "user service unavailable" }]
        })]);
        let dispatch = dispatch(
            author_link(false, None),
            endpoint.clone(),
            selection("{ name }"),
        );

        let result = dispatch.resolve_batch(vec![json!("1")]).await;
        match result {
            Err(ResolveError::Endpoint { message, .. }) => {
                assert_eq!(message, "user service unavailable");
            }
            other => panic!("expected endpoint error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn partial_errors_alongside_data_reach_the_error_sink() {
        let endpoint = Scripted::new(vec![json!({
            "data": { "users": [{ "name": "alice", "_id": "1" }] },
            "errors": [{ "message": "user 2 is gone" }]
        })]);
        let dispatch = dispatch(
            author_link(true, Some("id")),
            endpoint.clone(),
            selection("{ name }"),
        );

        let results = dispatch
            .resolve_batch(vec![json!("1"), json!("2")])
            .await
            .unwrap();

        assert_eq!(results[0]["name"], json!("alice"));
        assert_eq!(results[1], Value::Null);
        let sink = dispatch.context.errors.lock().unwrap();
        assert_eq!(sink.len(), 1);
        assert_eq!(sink[0]["message"], json!("user 2 is gone"));
        assert_eq!(sink[0]["path"], json!(["posts", "post", "author"]));
    }

    #[test]
    fn rewrite_strips_link_subselections_and_unprefixes_conditions() {
        let mut schema =
            compose_posts(&[("Post.author", author_link(false, None))]).unwrap();
        schema.link_fields.insert("Posts_Post.author".to_string());
        let router = NamespaceRouter::new(["users", "posts"]).unwrap();

        let set = selection("{ title author { name } ... on Posts_Post { id } }");
        let rewritten = rewrite_selection_for_backend(
            &schema,
            &router,
            "Posts_Post",
            &set,
            &FragmentMap::new(),
        );

        let text = fragments::build_query(rewritten.set, Vec::new(), Vec::new(), JsonMap::new())
            .text();
        let squashed: String = text.chars().filter(|c| !c.is_whitespace()).collect();
        assert!(
            !squashed.contains("author{"),
            "link sub-selection not stripped: {}",
            text
        );
        assert!(
            squashed.contains("...onPost{"),
            "condition not unprefixed: {}",
            text
        );
    }
}
