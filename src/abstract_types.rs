//! Concrete-type resolution for interfaces and unions.
//!
//! Backends report the concrete type of an abstract value through the
//! `__typename` discriminator, which the forwarding rewrite injects into
//! every abstract selection set. This transformer installs a resolution
//! strategy on every interface and union config; by the time the strategy
//! runs, the execution engine has already rewritten the discriminator to
//! the merged (prefixed) name, so a plain registry lookup suffices.

use std::sync::Arc;

use serde_json::Value;

use crate::error::{ComposeError, ResolveError};
use crate::schema::{CompositeSchema, InterfaceTypeConfig, TypeConfig, TypeResolver, UnionTypeConfig};
use crate::transform::{FieldTransformationContext, SchemaTransformer};

/// Installs a `__typename`-based [`TypeResolver`] on every interface and
/// union of every backend schema.
pub struct AbstractTypeTransformer;

fn discriminator_resolver(abstract_type: String) -> TypeResolver {
    Arc::new(move |value: &Value, schema: &CompositeSchema| {
        let type_name = value
            .get("__typename")
            .and_then(Value::as_str)
            .ok_or_else(|| ResolveError::MissingDiscriminator {
                type_name: abstract_type.clone(),
            })?;
        match schema.find_type(type_name) {
            Some(TypeConfig::Object(obj)) => Ok(obj.name.clone()),
            Some(_) => Err(ResolveError::NotAnObjectType(type_name.to_string())),
            None => Err(ResolveError::UnknownConcreteType(type_name.to_string())),
        }
    })
}

impl SchemaTransformer for AbstractTypeTransformer {
    fn transform_interface_type(
        &self,
        ty: &mut InterfaceTypeConfig,
        _ctx: &FieldTransformationContext<'_>,
    ) -> Result<(), ComposeError> {
        ty.resolve_type = Some(discriminator_resolver(ty.name.clone()));
        Ok(())
    }

    fn transform_union_type(
        &self,
        ty: &mut UnionTypeConfig,
        _ctx: &FieldTransformationContext<'_>,
    ) -> Result<(), ComposeError> {
        ty.resolve_type = Some(discriminator_resolver(ty.name.clone()));
        Ok(())
    }
}
