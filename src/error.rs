use thiserror::Error;

/// Fatal configuration errors raised while the composite schema is being
/// built. Composition aborts on the first one; a schema that failed to
/// compose is never put into service.
#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("failed to parse schema of backend `{backend}`: {message}")]
    SchemaParse { backend: String, message: String },

    #[error("failed to parse gateway configuration: {0}")]
    Config(String),

    #[error("duplicate backend name `{0}`")]
    DuplicateBackend(String),

    #[error("namespace prefix `{first}` is ambiguous with prefix `{second}`")]
    AmbiguousPrefix { first: String, second: String },

    #[error("duplicate merged type name `{0}`")]
    DuplicateTypeName(String),

    #[error("link `{link}` on backend `{backend}` refers to unknown backend `{target}`")]
    UnknownBackend {
        backend: String,
        link: String,
        target: String,
    },

    #[error("link `{link}`: backend `{target}` has no query root field `{field}`")]
    UnknownTargetField {
        link: String,
        target: String,
        field: String,
    },

    #[error("link `{link}`: target field `{field}` of backend `{target}` does not yield an object type")]
    TargetNotObject {
        link: String,
        target: String,
        field: String,
    },

    #[error("link `{link}` has an empty argument path")]
    EmptyArgumentPath { link: String },

    #[error("link `{link}`: argument path segment `{segment}` does not exist on backend `{target}`")]
    UnresolvableArgumentPath {
        link: String,
        target: String,
        segment: String,
    },
}

/// Errors raised while resolving one field of one request. They surface as
/// an entry in the response's `errors` array, attached to the offending
/// field's path; sibling fields are unaffected.
#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    #[error("backend `{backend}` call failed: {message}")]
    Endpoint { backend: String, message: String },

    #[error("value of abstract type `{type_name}` carries no `__typename` discriminator")]
    MissingDiscriminator { type_name: String },

    #[error("`__typename` names unknown type `{0}`")]
    UnknownConcreteType(String),

    #[error("`__typename` names `{0}`, which is not an object type")]
    NotAnObjectType(String),

    #[error("unknown field `{field}` on type `{type_name}`")]
    UnknownField { type_name: String, field: String },

    #[error("subscriptions are not executable over this transport")]
    SubscriptionUnsupported,

    #[error("batch dispatch was dropped before completing")]
    BatchDropped,
}
