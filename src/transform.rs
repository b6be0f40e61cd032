//! Single-pass schema transformation: every type and field of a backend
//! schema is renamed into the composite namespace and offered to each
//! registered transformer exactly once. Transformers receive explicit
//! config values and edit them in place; later transformers see the edits
//! of earlier ones on the same value.

use std::collections::HashMap;

use graphql_parser::query::Type as AstType;
use graphql_parser::schema::{
    Definition, DirectiveDefinition, Document, TypeDefinition,
};

use crate::error::ComposeError;
use crate::namespace::NamespaceRouter;
use crate::schema::{
    CompositeSchema, EnumTypeConfig, FieldConfig, InputObjectTypeConfig, InterfaceTypeConfig,
    ObjectTypeConfig, ScalarTypeConfig, TypeConfig, UnionTypeConfig, is_builtin_scalar,
};
use crate::schema::TypeRef;

/// The composite schema under construction. Transformers can look up any
/// type already added through [`FieldTransformationContext::find_type`].
#[derive(Default)]
pub struct SchemaBuilder {
    types: HashMap<String, TypeConfig>,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_type(&mut self, config: TypeConfig) -> Result<(), ComposeError> {
        let name = config.name().to_string();
        if self.types.contains_key(&name) {
            return Err(ComposeError::DuplicateTypeName(name));
        }
        self.types.insert(name, config);
        Ok(())
    }

    pub fn find_type(&self, name: &str) -> Option<&TypeConfig> {
        self.types.get(name)
    }

    pub fn find_type_mut(&mut self, name: &str) -> Option<&mut TypeConfig> {
        self.types.get_mut(name)
    }

    pub fn finish(self) -> CompositeSchema {
        CompositeSchema::new(self.types)
    }
}

/// Per-visit context handed to transformer hooks. Transient; lives only for
/// the duration of one type/field visit.
pub struct FieldTransformationContext<'a> {
    /// Namespace of the backend whose schema is being transformed.
    pub backend: &'a str,
    /// The pre-transformation (original) name of the enclosing type.
    pub source_type: &'a str,
    router: &'a NamespaceRouter,
    builder: &'a SchemaBuilder,
}

impl<'a> FieldTransformationContext<'a> {
    /// Translates an original-schema type reference into its composite
    /// counterpart, unwrapping and rewrapping list/non-null wrappers.
    pub fn map_type(&self, ty: &TypeRef) -> TypeRef {
        map_type(self.router, self.backend, ty)
    }

    /// Looks up a type already present in the target schema by name.
    pub fn find_type(&self, name: &str) -> Option<&TypeConfig> {
        self.builder.find_type(name)
    }
}

fn map_type(router: &NamespaceRouter, backend: &str, ty: &TypeRef) -> TypeRef {
    match ty {
        AstType::NamedType(name) => AstType::NamedType(map_named(router, backend, name)),
        AstType::ListType(inner) => AstType::ListType(Box::new(map_type(router, backend, inner))),
        AstType::NonNullType(inner) => {
            AstType::NonNullType(Box::new(map_type(router, backend, inner)))
        }
    }
}

fn map_named(router: &NamespaceRouter, backend: &str, name: &str) -> String {
    if is_builtin_scalar(name) {
        return name.to_string();
    }
    router
        .merged_name(backend, name)
        .unwrap_or_else(|| name.to_string())
}

/// A transformer plugged into the pipeline. Every hook is offered each
/// matching type or field exactly once per composition; returning an error
/// aborts composition entirely.
pub trait SchemaTransformer {
    fn transform_object_type(
        &self,
        _ty: &mut ObjectTypeConfig,
        _ctx: &FieldTransformationContext<'_>,
    ) -> Result<(), ComposeError> {
        Ok(())
    }

    fn transform_interface_type(
        &self,
        _ty: &mut InterfaceTypeConfig,
        _ctx: &FieldTransformationContext<'_>,
    ) -> Result<(), ComposeError> {
        Ok(())
    }

    fn transform_union_type(
        &self,
        _ty: &mut UnionTypeConfig,
        _ctx: &FieldTransformationContext<'_>,
    ) -> Result<(), ComposeError> {
        Ok(())
    }

    fn transform_field(
        &self,
        _field: &mut FieldConfig,
        _ctx: &FieldTransformationContext<'_>,
    ) -> Result<(), ComposeError> {
        Ok(())
    }
}

/// Merged names of a backend's root operation types.
#[derive(Debug, Default, Clone)]
pub struct BackendRoots {
    pub query: Option<String>,
    pub mutation: Option<String>,
    pub subscription: Option<String>,
}

/// What one backend contributes besides its types.
pub struct BackendArtifacts {
    pub roots: BackendRoots,
    pub directives: Vec<DirectiveDefinition<'static, String>>,
}

fn is_builtin_directive(name: &str) -> bool {
    matches!(name, "skip" | "include" | "deprecated" | "specifiedBy")
}

/// Root operation type names of a backend schema, before renaming.
pub(crate) fn original_roots(doc: &Document<'static, String>) -> (Option<String>, Option<String>, Option<String>) {
    for def in &doc.definitions {
        if let Definition::SchemaDefinition(schema) = def {
            return (
                schema.query.clone(),
                schema.mutation.clone(),
                schema.subscription.clone(),
            );
        }
    }
    let has = |name: &str| {
        doc.definitions.iter().any(|def| {
            matches!(def, Definition::TypeDefinition(TypeDefinition::Object(o)) if o.name == name)
        })
    };
    (
        has("Query").then(|| "Query".to_string()),
        has("Mutation").then(|| "Mutation".to_string()),
        has("Subscription").then(|| "Subscription".to_string()),
    )
}

/// Walks every definition of one backend schema exactly once, renames it
/// into the composite namespace and offers it to each transformer in order,
/// adding the resulting configs to `builder`.
pub fn transform_backend_schema(
    backend: &str,
    doc: &Document<'static, String>,
    router: &NamespaceRouter,
    transformers: &[&dyn SchemaTransformer],
    builder: &mut SchemaBuilder,
) -> Result<BackendArtifacts, ComposeError> {
    let (query_root, mutation_root, subscription_root) = original_roots(doc);
    let mut directives = Vec::new();

    for def in &doc.definitions {
        match def {
            Definition::TypeDefinition(typedef) => match typedef {
                TypeDefinition::Object(obj) => {
                    let mut config = ObjectTypeConfig {
                        name: map_named(router, backend, &obj.name),
                        implements: obj
                            .implements_interfaces
                            .iter()
                            .map(|i| map_named(router, backend, i))
                            .collect(),
                        fields: Vec::new(),
                    };
                    let ctx = FieldTransformationContext {
                        backend,
                        source_type: &obj.name,
                        router,
                        builder,
                    };
                    for field in &obj.fields {
                        let mut fc = field_config(field, &ctx);
                        for transformer in transformers {
                            transformer.transform_field(&mut fc, &ctx)?;
                        }
                        config.fields.push(fc);
                    }
                    for transformer in transformers {
                        transformer.transform_object_type(&mut config, &ctx)?;
                    }
                    builder.add_type(TypeConfig::Object(config))?;
                }
                TypeDefinition::Interface(iface) => {
                    let mut config = InterfaceTypeConfig {
                        name: map_named(router, backend, &iface.name),
                        fields: Vec::new(),
                        resolve_type: None,
                    };
                    let ctx = FieldTransformationContext {
                        backend,
                        source_type: &iface.name,
                        router,
                        builder,
                    };
                    for field in &iface.fields {
                        let mut fc = field_config(field, &ctx);
                        for transformer in transformers {
                            transformer.transform_field(&mut fc, &ctx)?;
                        }
                        config.fields.push(fc);
                    }
                    for transformer in transformers {
                        transformer.transform_interface_type(&mut config, &ctx)?;
                    }
                    builder.add_type(TypeConfig::Interface(config))?;
                }
                TypeDefinition::Union(union_type) => {
                    let mut config = UnionTypeConfig {
                        name: map_named(router, backend, &union_type.name),
                        types: union_type
                            .types
                            .iter()
                            .map(|t| map_named(router, backend, t))
                            .collect(),
                        resolve_type: None,
                    };
                    let ctx = FieldTransformationContext {
                        backend,
                        source_type: &union_type.name,
                        router,
                        builder,
                    };
                    for transformer in transformers {
                        transformer.transform_union_type(&mut config, &ctx)?;
                    }
                    builder.add_type(TypeConfig::Union(config))?;
                }
                TypeDefinition::Scalar(scalar) => {
                    if !is_builtin_scalar(&scalar.name) {
                        builder.add_type(TypeConfig::Scalar(ScalarTypeConfig {
                            name: map_named(router, backend, &scalar.name),
                        }))?;
                    }
                }
                TypeDefinition::Enum(enum_type) => {
                    builder.add_type(TypeConfig::Enum(EnumTypeConfig {
                        name: map_named(router, backend, &enum_type.name),
                        values: enum_type.values.iter().map(|v| v.name.clone()).collect(),
                    }))?;
                }
                TypeDefinition::InputObject(input) => {
                    builder.add_type(TypeConfig::InputObject(InputObjectTypeConfig {
                        name: map_named(router, backend, &input.name),
                        fields: input
                            .fields
                            .iter()
                            .map(|f| {
                                (
                                    f.name.clone(),
                                    map_type(router, backend, &f.value_type),
                                )
                            })
                            .collect(),
                    }))?;
                }
            },
            Definition::DirectiveDefinition(directive) => {
                if !is_builtin_directive(&directive.name) {
                    directives.push(directive.clone());
                }
            }
            Definition::SchemaDefinition(_) | Definition::TypeExtension(_) => {}
        }
    }

    Ok(BackendArtifacts {
        roots: BackendRoots {
            query: query_root.map(|n| map_named(router, backend, &n)),
            mutation: mutation_root.map(|n| map_named(router, backend, &n)),
            subscription: subscription_root.map(|n| map_named(router, backend, &n)),
        },
        directives,
    })
}

fn field_config(
    field: &graphql_parser::schema::Field<'static, String>,
    ctx: &FieldTransformationContext<'_>,
) -> FieldConfig {
    FieldConfig {
        name: field.name.clone(),
        arguments: field
            .arguments
            .iter()
            .map(|arg| (arg.name.clone(), ctx.map_type(&arg.value_type)))
            .collect(),
        field_type: ctx.map_type(&field.field_type),
        resolver: None,
    }
}
