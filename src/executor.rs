//! Request execution against the composite schema.
//!
//! The engine walks the client document over the JSON values the root
//! forwarding resolvers return: fields with an installed resolver (roots
//! and links) go through it, everything else is a property read off the
//! parent value. Field failures null the field and append an entry to the
//! response's `errors` array; sibling fields are unaffected.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, join_all};
use graphql_parser::query::{
    Definition, Directive, Field as AstField, OperationDefinition, Selection, Type as AstType,
    TypeCondition, Value as AstValue, parse_query,
};
use serde_json::{Value, json};

use crate::GraphQLRequest;
use crate::batch::RequestScope;
use crate::error::ResolveError;
use crate::fragments::SelSet;
use crate::namespace::NamespaceRouter;
use crate::schema::{
    CompositeSchema, FragmentMap, JsonMap, ResolverContext, TypeConfig, TypeRef, VariableDefs,
    named_type,
};

/// Executes one client request and returns the full response envelope.
pub async fn execute_request(
    schema: Arc<CompositeSchema>,
    router: Arc<NamespaceRouter>,
    request: GraphQLRequest,
    scope: Arc<RequestScope>,
) -> Value {
    let document = match parse_query::<String>(&request.query) {
        Ok(doc) => doc.into_static(),
        Err(err) => return request_error(format!("failed to parse query: {}", err)),
    };

    let mut fragments = FragmentMap::new();
    let mut operations = Vec::new();
    for def in document.definitions {
        match def {
            Definition::Fragment(f) => {
                fragments.insert(f.name.clone(), f);
            }
            Definition::Operation(op) => operations.push(op),
        }
    }

    let operation = match select_operation(operations, request.operation_name.as_deref()) {
        Ok(op) => op,
        Err(message) => return request_error(message),
    };

    let (serial, variable_definitions, selection_set, root) = match operation {
        OperationDefinition::SelectionSet(set) => {
            (false, Vec::new(), set, schema.query_type.clone())
        }
        OperationDefinition::Query(q) => {
            (false, q.variable_definitions, q.selection_set, schema.query_type.clone())
        }
        OperationDefinition::Mutation(m) => (
            true,
            m.variable_definitions,
            m.selection_set,
            schema.mutation_type.clone(),
        ),
        OperationDefinition::Subscription(_) => {
            return request_error(ResolveError::SubscriptionUnsupported.to_string());
        }
    };
    let Some(root) = root else {
        return request_error(if serial {
            "schema does not support mutations".to_string()
        } else {
            "schema does not support queries".to_string()
        });
    };

    let mut variables = match request.variables {
        Some(Value::Object(map)) => map,
        _ => JsonMap::new(),
    };
    for def in &variable_definitions {
        if !variables.contains_key(&def.name) {
            if let Some(default) = &def.default_value {
                variables.insert(def.name.clone(), ast_value_to_json(default, &JsonMap::new()));
            }
        }
    }

    let exec = Exec {
        schema,
        router,
        fragments: Arc::new(fragments),
        variable_definitions: Arc::new(variable_definitions),
        variables: Arc::new(variables),
        scope,
        errors: Arc::new(Mutex::new(Vec::new())),
    };
    let data = exec
        .execute_selection_set(&root, &Value::Null, &selection_set, &[], serial)
        .await;

    let errors = exec.errors.lock().expect("error sink poisoned").clone();
    if errors.is_empty() {
        json!({ "data": data })
    } else {
        json!({ "data": data, "errors": errors })
    }
}

fn request_error(message: String) -> Value {
    json!({ "errors": [{ "message": message }] })
}

fn operation_name<'a>(op: &'a OperationDefinition<'static, String>) -> Option<&'a str> {
    match op {
        OperationDefinition::SelectionSet(_) => None,
        OperationDefinition::Query(q) => q.name.as_deref(),
        OperationDefinition::Mutation(m) => m.name.as_deref(),
        OperationDefinition::Subscription(s) => s.name.as_deref(),
    }
}

fn select_operation(
    operations: Vec<OperationDefinition<'static, String>>,
    wanted: Option<&str>,
) -> Result<OperationDefinition<'static, String>, String> {
    match wanted {
        Some(wanted) => operations
            .into_iter()
            .find(|op| operation_name(op) == Some(wanted))
            .ok_or_else(|| format!("unknown operation `{}`", wanted)),
        None => {
            let mut operations = operations.into_iter();
            match (operations.next(), operations.next()) {
                (Some(op), None) => Ok(op),
                (None, _) => Err("document contains no operations".to_string()),
                _ => Err(
                    "operation name required when the document defines multiple operations"
                        .to_string(),
                ),
            }
        }
    }
}

fn ast_value_to_json(value: &AstValue<'static, String>, variables: &JsonMap) -> Value {
    match value {
        AstValue::Variable(name) => variables.get(name).cloned().unwrap_or(Value::Null),
        AstValue::Int(n) => json!(n.as_i64()),
        AstValue::Float(f) => json!(f),
        AstValue::String(s) => json!(s),
        AstValue::Boolean(b) => json!(b),
        AstValue::Null => Value::Null,
        AstValue::Enum(name) => json!(name),
        AstValue::List(items) => Value::Array(
            items.iter().map(|i| ast_value_to_json(i, variables)).collect(),
        ),
        AstValue::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), ast_value_to_json(v, variables)))
                .collect(),
        ),
    }
}

struct Exec {
    schema: Arc<CompositeSchema>,
    router: Arc<NamespaceRouter>,
    fragments: Arc<FragmentMap>,
    variable_definitions: Arc<VariableDefs>,
    variables: Arc<JsonMap>,
    scope: Arc<RequestScope>,
    errors: Arc<Mutex<Vec<Value>>>,
}

impl Exec {
    fn record_error(&self, message: String, path: &[Value]) {
        self.errors
            .lock()
            .expect("error sink poisoned")
            .push(json!({ "message": message, "path": path }));
    }

    /// `@skip`/`@include` evaluation; all other directives pass through to
    /// the backends inside forwarded documents.
    fn included(&self, directives: &[Directive<'static, String>]) -> bool {
        for directive in directives {
            let flag = directive
                .arguments
                .iter()
                .find(|(name, _)| name == "if")
                .map(|(_, value)| self.bool_value(value))
                .unwrap_or(false);
            match directive.name.as_str() {
                "skip" if flag => return false,
                "include" if !flag => return false,
                _ => {}
            }
        }
        true
    }

    fn bool_value(&self, value: &AstValue<'static, String>) -> bool {
        match value {
            AstValue::Boolean(b) => *b,
            AstValue::Variable(name) => self
                .variables
                .get(name)
                .and_then(Value::as_bool)
                .unwrap_or(false),
            _ => false,
        }
    }

    /// CollectFields: flattens fragments whose condition matches the
    /// concrete type and groups fields by response key, preserving the
    /// order of first appearance.
    fn collect_fields(
        &self,
        concrete: &str,
        set: &SelSet,
        visited: &mut HashSet<String>,
        groups: &mut Vec<(String, Vec<AstField<'static, String>>)>,
    ) {
        for sel in &set.items {
            match sel {
                Selection::Field(field) => {
                    if !self.included(&field.directives) {
                        continue;
                    }
                    let key = field.alias.as_deref().unwrap_or(&field.name);
                    match groups.iter_mut().find(|(k, _)| k == key) {
                        Some((_, fields)) => fields.push(field.clone()),
                        None => groups.push((key.to_string(), vec![field.clone()])),
                    }
                }
                Selection::InlineFragment(frag) => {
                    if !self.included(&frag.directives) {
                        continue;
                    }
                    let matches = match &frag.type_condition {
                        Some(TypeCondition::On(cond)) => self.schema.type_matches(concrete, cond),
                        None => true,
                    };
                    if matches {
                        self.collect_fields(concrete, &frag.selection_set, visited, groups);
                    }
                }
                Selection::FragmentSpread(spread) => {
                    if !self.included(&spread.directives) {
                        continue;
                    }
                    if !visited.insert(spread.fragment_name.clone()) {
                        continue;
                    }
                    if let Some(def) = self.fragments.get(&spread.fragment_name) {
                        let TypeCondition::On(cond) = &def.type_condition;
                        if self.schema.type_matches(concrete, cond) {
                            self.collect_fields(concrete, &def.selection_set, visited, groups);
                        }
                    }
                }
            }
        }
    }

    fn execute_selection_set<'a>(
        &'a self,
        type_name: &'a str,
        source: &'a Value,
        set: &'a SelSet,
        path: &'a [Value],
        serial: bool,
    ) -> BoxFuture<'a, Value> {
        Box::pin(async move {
            let mut groups = Vec::new();
            let mut visited = HashSet::new();
            self.collect_fields(type_name, set, &mut visited, &mut groups);

            let mut object = JsonMap::new();
            if serial {
                for (key, fields) in groups {
                    let mut field_path = path.to_vec();
                    field_path.push(Value::String(key.clone()));
                    let value = self.execute_field(type_name, source, fields, field_path).await;
                    object.insert(key, value);
                }
            } else {
                let resolved = join_all(groups.into_iter().map(|(key, fields)| {
                    let mut field_path = path.to_vec();
                    field_path.push(Value::String(key.clone()));
                    async move {
                        let value =
                            self.execute_field(type_name, source, fields, field_path).await;
                        (key, value)
                    }
                }))
                .await;
                for (key, value) in resolved {
                    object.insert(key, value);
                }
            }
            Value::Object(object)
        })
    }

    async fn execute_field(
        &self,
        type_name: &str,
        source: &Value,
        mut fields: Vec<AstField<'static, String>>,
        path: Vec<Value>,
    ) -> Value {
        let mut field = fields.remove(0);
        for extra in fields {
            field.selection_set.items.extend(extra.selection_set.items);
        }

        if field.name == "__typename" {
            return json!(type_name);
        }

        let Some(config) = self.schema.field(type_name, &field.name) else {
            self.record_error(
                ResolveError::UnknownField {
                    type_name: type_name.to_string(),
                    field: field.name.clone(),
                }
                .to_string(),
                &path,
            );
            return Value::Null;
        };

        let value = match &config.resolver {
            Some(resolver) => {
                let ctx = ResolverContext {
                    source: source.clone(),
                    field: field.clone(),
                    fragments: Arc::clone(&self.fragments),
                    variable_definitions: Arc::clone(&self.variable_definitions),
                    variables: Arc::clone(&self.variables),
                    schema: Arc::clone(&self.schema),
                    scope: Arc::clone(&self.scope),
                    errors: Arc::clone(&self.errors),
                    path: path.clone(),
                };
                match resolver(ctx).await {
                    Ok(value) => value,
                    Err(err) => {
                        self.record_error(err.to_string(), &path);
                        return Value::Null;
                    }
                }
            }
            None => {
                let key = field.alias.as_deref().unwrap_or(&field.name);
                source.get(key).cloned().unwrap_or(Value::Null)
            }
        };

        self.complete_value(&config.field_type, &field.selection_set, value, path)
            .await
    }

    fn complete_value<'a>(
        &'a self,
        ty: &'a TypeRef,
        selection: &'a SelSet,
        value: Value,
        path: Vec<Value>,
    ) -> BoxFuture<'a, Value> {
        Box::pin(async move {
            match ty {
                // Null legality is the backends' concern; nothing bubbles
                // here.
                AstType::NonNullType(inner) => {
                    self.complete_value(inner, selection, value, path).await
                }
                _ if value.is_null() => Value::Null,
                AstType::ListType(inner) => match value {
                    Value::Array(items) => self.complete_items(inner, selection, items, path).await,
                    other => self.complete_named(ty, selection, other, path).await,
                },
                AstType::NamedType(_) => match value {
                    // Link fields declared as a bare object type still fan
                    // out to a list when the stored key is an array.
                    Value::Array(items) => self.complete_items(ty, selection, items, path).await,
                    other => self.complete_named(ty, selection, other, path).await,
                },
            }
        })
    }

    async fn complete_items(
        &self,
        inner: &TypeRef,
        selection: &SelSet,
        items: Vec<Value>,
        path: Vec<Value>,
    ) -> Value {
        let completed = join_all(items.into_iter().enumerate().map(|(index, item)| {
            let mut item_path = path.clone();
            item_path.push(json!(index));
            self.complete_value(inner, selection, item, item_path)
        }))
        .await;
        Value::Array(completed)
    }

    async fn complete_named(
        &self,
        ty: &TypeRef,
        selection: &SelSet,
        value: Value,
        path: Vec<Value>,
    ) -> Value {
        let name = named_type(ty);
        match self.schema.find_type(name) {
            Some(TypeConfig::Object(obj)) => {
                self.execute_selection_set(&obj.name, &value, selection, &path, false)
                    .await
            }
            Some(TypeConfig::Interface(_) | TypeConfig::Union(_)) => {
                let value = self.prefixed_discriminator(name, value);
                match self.resolve_concrete(name, &value) {
                    Ok(concrete) => {
                        self.execute_selection_set(&concrete, &value, selection, &path, false)
                            .await
                    }
                    Err(err) => {
                        self.record_error(err.to_string(), &path);
                        Value::Null
                    }
                }
            }
            // Scalars, enums and unknown names pass through untouched.
            _ => value,
        }
    }

    /// Backends report `__typename` in their own namespace; rewrite it to
    /// the merged name before the resolution strategy sees the value.
    fn prefixed_discriminator(&self, abstract_name: &str, value: Value) -> Value {
        let Some(type_name) = value.get("__typename").and_then(Value::as_str) else {
            return value;
        };
        if self.router.route(type_name).is_some() {
            return value;
        }
        let Some((backend, _)) = self.router.route(abstract_name) else {
            return value;
        };
        let Some(merged) = self.router.merged_name(backend, type_name) else {
            return value;
        };
        let mut value = value;
        value["__typename"] = json!(merged);
        value
    }

    fn resolve_concrete(&self, abstract_name: &str, value: &Value) -> Result<String, ResolveError> {
        let strategy = match self.schema.find_type(abstract_name) {
            Some(TypeConfig::Interface(t)) => t.resolve_type.clone(),
            Some(TypeConfig::Union(t)) => t.resolve_type.clone(),
            _ => None,
        };
        match strategy {
            Some(resolve) => resolve(value, &self.schema),
            None => Err(ResolveError::MissingDiscriminator {
                type_name: abstract_name.to_string(),
            }),
        }
    }
}
