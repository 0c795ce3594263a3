//! Source schemas and the gateway's own internal schema.

use crate::error::SchemaError;
use apollo_compiler::Schema;

/// The location that identifies the gateway's in-process introspection
/// service in the field index. Never a real URL.
pub const INTROSPECTION_LOCATION: &str = "switchboard://introspection";

/// The location that identifies fields registered on the gateway itself.
pub const GATEWAY_FIELD_LOCATION: &str = "switchboard://fields";

/// The version field the gateway contributes to the merged `Query` type.
pub const API_VERSION_FIELD: &str = "_apiVersion";

/// The schema the gateway itself contributes to the merge. Gateway-registered
/// query fields are appended to this before merging.
pub(crate) const INTERNAL_SDL: &str = r#"
type Query {
    "The version of the gateway fronting this schema."
    _apiVersion: String
}
"#;

/// A schema served by a remote (or synthetic) GraphQL endpoint.
#[derive(Debug, Clone)]
pub struct RemoteSchema {
    /// Where queries against this schema are sent.
    pub url: String,
    pub schema: Schema,
}

impl RemoteSchema {
    pub fn new(url: impl Into<String>, schema: Schema) -> Self {
        RemoteSchema {
            url: url.into(),
            schema,
        }
    }

    /// Parse an SDL string into a remote schema.
    pub fn parse(url: impl Into<String>, sdl: &str) -> Result<Self, SchemaError> {
        Ok(RemoteSchema {
            url: url.into(),
            schema: load_schema(sdl)?,
        })
    }
}

/// Parse an SDL string.
pub fn load_schema(sdl: &str) -> Result<Schema, SchemaError> {
    Schema::parse(sdl, "schema.graphql").map_err(|err| SchemaError::Parse(err.to_string()))
}

pub(crate) fn internal_schema() -> Schema {
    load_schema(INTERNAL_SDL).expect("the internal schema is valid SDL")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_schema_rejects_bad_sdl() {
        assert!(load_schema("type Query {").is_err());
    }

    #[test]
    fn internal_schema_has_version_field() {
        let schema = internal_schema();
        let query = match schema.types.get("Query") {
            Some(apollo_compiler::schema::ExtendedType::Object(object)) => object,
            _ => panic!("internal schema must define Query"),
        };
        assert!(query.fields.contains_key(API_VERSION_FIELD));
    }
}
