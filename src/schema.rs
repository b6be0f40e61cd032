use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use graphql_parser::query as q;
use graphql_parser::schema::DirectiveDefinition;
use serde_json::Value;

use crate::batch::RequestScope;
use crate::error::ResolveError;

/// A GraphQL type reference (named type plus list/non-null wrappers).
pub type TypeRef = q::Type<'static, String>;

pub type FragmentMap = HashMap<String, q::FragmentDefinition<'static, String>>;
pub type VariableDefs = Vec<q::VariableDefinition<'static, String>>;
pub type JsonMap = serde_json::Map<String, Value>;

/// The bare named type under any list/non-null wrappers.
pub fn named_type(ty: &TypeRef) -> &str {
    match ty {
        q::Type::NamedType(name) => name,
        q::Type::ListType(inner) | q::Type::NonNullType(inner) => named_type(inner),
    }
}

pub fn is_builtin_scalar(name: &str) -> bool {
    matches!(name, "String" | "Int" | "Float" | "Boolean" | "ID")
}

/// Everything a field resolver gets to see for one invocation.
///
/// Owns clones of the request-scoped pieces so resolver futures can be
/// `'static`; the schema and scope handles are shared.
#[derive(Clone)]
pub struct ResolverContext {
    /// The parent object's resolved value.
    pub source: Value,
    /// The field as written in the client document, including alias,
    /// arguments and sub-selection.
    pub field: q::Field<'static, String>,
    pub fragments: Arc<FragmentMap>,
    pub variable_definitions: Arc<VariableDefs>,
    pub variables: Arc<JsonMap>,
    pub schema: Arc<CompositeSchema>,
    pub scope: Arc<RequestScope>,
    /// Sink for backend-supplied partial errors; entries land in the
    /// response's `errors` array unchanged.
    pub errors: Arc<Mutex<Vec<Value>>>,
    /// Response path of the field being resolved, for error attribution.
    pub path: Vec<Value>,
}

impl ResolverContext {
    /// The key under which this field appears in the parent's data.
    pub fn response_key(&self) -> &str {
        self.field.alias.as_deref().unwrap_or(&self.field.name)
    }
}

pub type ResolveFuture = BoxFuture<'static, Result<Value, ResolveError>>;

/// An installed field resolver. Fields without one fall back to a plain
/// property read off the parent value.
pub type FieldResolver = Arc<dyn Fn(ResolverContext) -> ResolveFuture + Send + Sync>;

/// Strategy picking the concrete object type of an abstract value.
/// Returns the concrete type's merged name.
pub type TypeResolver =
    Arc<dyn Fn(&Value, &CompositeSchema) -> Result<String, ResolveError> + Send + Sync>;

pub struct FieldConfig {
    pub name: String,
    pub arguments: Vec<(String, TypeRef)>,
    pub field_type: TypeRef,
    pub resolver: Option<FieldResolver>,
}

impl fmt::Debug for FieldConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldConfig")
            .field("name", &self.name)
            .field("field_type", &self.field_type.to_string())
            .field("resolver", &self.resolver.is_some())
            .finish()
    }
}

#[derive(Debug)]
pub struct ObjectTypeConfig {
    pub name: String,
    pub implements: Vec<String>,
    pub fields: Vec<FieldConfig>,
}

pub struct InterfaceTypeConfig {
    pub name: String,
    pub fields: Vec<FieldConfig>,
    pub resolve_type: Option<TypeResolver>,
}

pub struct UnionTypeConfig {
    pub name: String,
    pub types: Vec<String>,
    pub resolve_type: Option<TypeResolver>,
}

#[derive(Debug)]
pub struct EnumTypeConfig {
    pub name: String,
    pub values: Vec<String>,
}

#[derive(Debug)]
pub struct ScalarTypeConfig {
    pub name: String,
}

#[derive(Debug)]
pub struct InputObjectTypeConfig {
    pub name: String,
    pub fields: Vec<(String, TypeRef)>,
}

pub enum TypeConfig {
    Scalar(ScalarTypeConfig),
    Object(ObjectTypeConfig),
    Interface(InterfaceTypeConfig),
    Union(UnionTypeConfig),
    Enum(EnumTypeConfig),
    InputObject(InputObjectTypeConfig),
}

impl TypeConfig {
    pub fn name(&self) -> &str {
        match self {
            TypeConfig::Scalar(t) => &t.name,
            TypeConfig::Object(t) => &t.name,
            TypeConfig::Interface(t) => &t.name,
            TypeConfig::Union(t) => &t.name,
            TypeConfig::Enum(t) => &t.name,
            TypeConfig::InputObject(t) => &t.name,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectTypeConfig> {
        match self {
            TypeConfig::Object(t) => Some(t),
            _ => None,
        }
    }

    pub fn fields(&self) -> Option<&[FieldConfig]> {
        match self {
            TypeConfig::Object(t) => Some(&t.fields),
            TypeConfig::Interface(t) => Some(&t.fields),
            _ => None,
        }
    }
}

impl fmt::Debug for TypeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeConfig::Scalar(t) => t.fmt(f),
            TypeConfig::Object(t) => t.fmt(f),
            TypeConfig::Interface(t) => f
                .debug_struct("InterfaceTypeConfig")
                .field("name", &t.name)
                .field("fields", &t.fields)
                .finish(),
            TypeConfig::Union(t) => f
                .debug_struct("UnionTypeConfig")
                .field("name", &t.name)
                .field("types", &t.types)
                .finish(),
            TypeConfig::Enum(t) => t.fmt(f),
            TypeConfig::InputObject(t) => t.fmt(f),
        }
    }
}

/// The merged schema: a frozen registry of renamed types with resolvers
/// installed. Built once at composition time, then shared read-only across
/// all requests.
pub struct CompositeSchema {
    types: HashMap<String, TypeConfig>,
    pub query_type: Option<String>,
    pub mutation_type: Option<String>,
    pub subscription_type: Option<String>,
    pub directives: Vec<DirectiveDefinition<'static, String>>,
    /// Merged `"TypeName.fieldName"` keys whose resolvers are links; the
    /// forwarding rewrite consults this to strip their sub-selections.
    pub link_fields: HashSet<String>,
}

impl CompositeSchema {
    pub(crate) fn new(types: HashMap<String, TypeConfig>) -> Self {
        CompositeSchema {
            types,
            query_type: None,
            mutation_type: None,
            subscription_type: None,
            directives: Vec::new(),
            link_fields: HashSet::new(),
        }
    }

    pub fn find_type(&self, name: &str) -> Option<&TypeConfig> {
        self.types.get(name)
    }

    pub fn field(&self, type_name: &str, field_name: &str) -> Option<&FieldConfig> {
        self.find_type(type_name)?
            .fields()?
            .iter()
            .find(|f| f.name == field_name)
    }

    pub fn is_link_field(&self, type_name: &str, field_name: &str) -> bool {
        self.link_fields
            .contains(&format!("{}.{}", type_name, field_name))
    }

    /// Whether a value of concrete object type `concrete` satisfies the
    /// type condition `condition` (itself, an implemented interface, or a
    /// union containing it).
    pub fn type_matches(&self, concrete: &str, condition: &str) -> bool {
        if concrete == condition {
            return true;
        }
        match self.find_type(condition) {
            Some(TypeConfig::Union(u)) => u.types.iter().any(|t| t == concrete),
            Some(TypeConfig::Interface(_)) => self
                .find_type(concrete)
                .and_then(TypeConfig::as_object)
                .is_some_and(|o| o.implements.iter().any(|i| i == condition)),
            _ => false,
        }
    }
}

impl fmt::Debug for CompositeSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.types.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("CompositeSchema")
            .field("types", &names)
            .field("query_type", &self.query_type)
            .field("mutation_type", &self.mutation_type)
            .field("subscription_type", &self.subscription_type)
            .finish()
    }
}
